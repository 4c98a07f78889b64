// Library exports for the binary and integration tests
//
// The binary in main.rs only parses arguments, builds the collaborators for
// the requested stage and maps outcomes to exit codes.

pub mod approval;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod expiry;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod pipeline;
pub mod project;
pub mod publisher;
pub mod renewal;
pub mod secrets;
pub mod signing;

// Re-export commonly used types
pub use approval::{ApprovalGate, ApprovalStore, FileApprovalStore, MemoryApprovalStore};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::RenewalConfig;
pub use expiry::{EvaluationError, EvaluationOutcome, ExpiryEvaluator, TieBreak};
pub use models::{ApprovalDecision, ApprovalRequest, RenewalDecision, RenewalResult};
pub use pipeline::Pipeline;

/// Accept either a JSON array (`["a","b"]`) or a comma separated list
pub fn parse_id_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(ids) = serde_json::from_str::<Vec<String>>(trimmed) {
            return ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
        }
    }

    trimmed
        .split(',')
        .map(|id| id.trim().trim_matches('"').to_string())
        .filter(|id| !id.is_empty())
        .collect()
}
