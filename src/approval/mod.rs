//! Approval gate between "renewal needed" and the destructive renewal run.
//!
//! A request is created when an evaluation says renewal is needed, and the
//! human decision arrives later in a separate invocation. `validate` is a pure
//! check against the live request; `consume` only accepts the token that a
//! successful `validate` returns.

mod store;

pub use store::{ApprovalStore, FileApprovalStore, MemoryApprovalStore};
pub(crate) use store::write_atomic;

use crate::clock::Clock;
use crate::metrics;
use crate::models::{ApprovalDecision, ApprovalRequest, ApprovalStatus, RenewalDecision};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Renewal decision carries no application identifiers")]
    EmptyApplicationIds,
    #[error("Approval request {0} no longer exists")]
    RequestVanished(String),
    #[error("Approval store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Reasons an approval decision is refused. The first failing check wins.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No approval id was provided")]
    MissingApprovalId,
    #[error("No approval request is stored")]
    NoStoredRequest,
    #[error("Approval id mismatch: provided {provided}, expected {expected}")]
    ApprovalIdMismatch { provided: String, expected: String },
    #[error("Environment mismatch: provided {provided}, expected {expected}")]
    EnvironmentMismatch { provided: String, expected: String },
    #[error("Approval request expired at {expired_at}")]
    RequestExpired { expired_at: DateTime<Utc> },
    #[error("Approval request has already been processed")]
    AlreadyProcessed,
    #[error("Approval store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// Proof that a request passed validation. Only [`ApprovalGate::validate`] creates one.
#[derive(Debug)]
pub struct ValidatedApproval {
    request: ApprovalRequest,
}

impl ValidatedApproval {
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }
}

pub struct ApprovalGate {
    store: Arc<dyn ApprovalStore>,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn ApprovalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a pending request for `decision` and make it the live one
    pub async fn create(
        &self,
        decision: &RenewalDecision,
        environment: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = self.prepare(decision, environment)?;
        self.commit(&request).await?;
        Ok(request)
    }

    /// Build a pending request without storing it. The live request is untouched
    /// until [`ApprovalGate::commit`].
    pub fn prepare(
        &self,
        decision: &RenewalDecision,
        environment: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let application_id = decision
            .primary_application_id()
            .ok_or(ApprovalError::EmptyApplicationIds)?;

        let now = self.clock.now();
        Ok(ApprovalRequest::pending(
            generate_approval_id(now),
            environment,
            application_id,
            now,
        ))
    }

    /// Store a prepared request and make it the live one
    pub async fn commit(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        if let Some(previous) = self.store.live().await? {
            if !previous.is_processed() {
                warn!(
                    "Replacing pending approval request {} with {}",
                    previous.approval_id, request.approval_id
                );
            }
        }

        self.store.save_live(request).await?;
        metrics::APPROVALS_REQUESTED.inc();

        info!(
            approval_id = %request.approval_id,
            environment = %request.environment,
            application_id = %request.application_id,
            "Created approval request"
        );

        Ok(())
    }

    /// Check a decision against the live request without modifying it
    pub async fn validate(
        &self,
        provided_approval_id: &str,
        environment: &str,
    ) -> Result<ValidatedApproval, ValidationError> {
        let result = self.check(provided_approval_id, environment).await;
        if let Err(e) = &result {
            metrics::APPROVALS_REFUSED.inc();
            warn!("Approval validation failed: {}", e);
        }
        result
    }

    async fn check(
        &self,
        provided_approval_id: &str,
        environment: &str,
    ) -> Result<ValidatedApproval, ValidationError> {
        if provided_approval_id.trim().is_empty() {
            return Err(ValidationError::MissingApprovalId);
        }

        let stored = self
            .store
            .live()
            .await
            .map_err(ValidationError::Store)?
            .ok_or(ValidationError::NoStoredRequest)?;

        if stored.approval_id != provided_approval_id {
            return Err(ValidationError::ApprovalIdMismatch {
                provided: provided_approval_id.to_string(),
                expected: stored.approval_id,
            });
        }

        if stored.environment != environment {
            return Err(ValidationError::EnvironmentMismatch {
                provided: environment.to_string(),
                expected: stored.environment,
            });
        }

        if stored.is_expired(self.clock.now()) {
            return Err(ValidationError::RequestExpired {
                expired_at: stored.expires_at(),
            });
        }

        if stored.is_processed() {
            return Err(ValidationError::AlreadyProcessed);
        }

        Ok(ValidatedApproval { request: stored })
    }

    /// Mark a validated request as processed with the human decision
    pub async fn consume(
        &self,
        validated: &ValidatedApproval,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let approval_id = &validated.request.approval_id;
        let mut request = self
            .store
            .load(approval_id)
            .await?
            .ok_or_else(|| ApprovalError::RequestVanished(approval_id.clone()))?;

        request.status = ApprovalStatus::Processed;
        request.decision = Some(decision);
        request.processed_at = Some(self.clock.now());
        request.processed_by = Some(actor.to_string());

        self.store.update(&request).await?;

        match decision {
            ApprovalDecision::Approve => metrics::APPROVALS_APPROVED.inc(),
            ApprovalDecision::Reject => metrics::APPROVALS_REJECTED.inc(),
        }

        info!(
            approval_id = %request.approval_id,
            decision = %decision,
            actor,
            "Approval request processed"
        );

        Ok(request)
    }
}

/// Time-ordered, unique per invocation. Not a secret: anyone who can read the
/// notification channel can use it.
fn generate_approval_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}
