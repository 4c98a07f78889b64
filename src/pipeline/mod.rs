//! Stage commands invoked by the CI workflow.
//!
//! Each stage is a separate process. State that must survive between stages
//! lives in the configured state directory: the approval store, the latest
//! decision and the latest renewal result.

mod output;

pub use output::StageOutput;

use crate::approval::{ApprovalGate, ApprovalStore, write_atomic};
use crate::clock::Clock;
use crate::config::{RenewalConfig, TieBreakPolicy};
use crate::credentials::{self, ApiCredentials};
use crate::directory::CertificateDirectory;
use crate::expiry::{EvaluationOutcome, ExpiryEvaluator, TieBreak, by_certificate_id};
use crate::models::{ApprovalDecision, ApprovalRequest, ApprovalStatus, RenewalDecision, RenewalResult};
use crate::notifications::{
    NotificationEvent, NotificationManager, NotificationPayload, Severity,
};
use crate::project;
use crate::publisher::{self, PublisherSettings, ResultPublisher, UploadSummary};
use crate::renewal::RenewalOrchestrator;
use crate::secrets::SecretStore;
use crate::signing::SigningTool;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const DECISION_FILE: &str = "decision.json";

pub struct Pipeline {
    config: RenewalConfig,
    clock: Arc<dyn Clock>,
    approvals: Arc<dyn ApprovalStore>,
    notifications: Arc<NotificationManager>,
    directory: Option<Arc<dyn CertificateDirectory>>,
    signing: Option<Arc<dyn SigningTool>>,
    secrets: Option<Arc<dyn SecretStore>>,
    output_path: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(
        config: RenewalConfig,
        clock: Arc<dyn Clock>,
        approvals: Arc<dyn ApprovalStore>,
        notifications: Arc<NotificationManager>,
    ) -> Self {
        Self {
            config,
            clock,
            approvals,
            notifications,
            directory: None,
            signing: None,
            secrets: None,
            output_path: None,
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn CertificateDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_signing(mut self, signing: Arc<dyn SigningTool>) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// File receiving `key=value` signals, usually `$GITHUB_OUTPUT`
    pub fn with_output(mut self, path: Option<PathBuf>) -> Self {
        self.output_path = path;
        self
    }

    pub fn config(&self) -> &RenewalConfig {
        &self.config
    }

    fn output(&self) -> StageOutput {
        StageOutput::new(self.output_path.clone())
    }

    fn environment(&self) -> &str {
        &self.config.environment
    }

    fn gate(&self) -> ApprovalGate {
        ApprovalGate::new(self.approvals.clone(), self.clock.clone())
    }

    fn decision_path(&self) -> PathBuf {
        self.config.state_dir.join(DECISION_FILE)
    }

    fn save_decision(&self, decision: &RenewalDecision) -> Result<()> {
        fs::create_dir_all(&self.config.state_dir).with_context(|| {
            format!("Failed to create {}", self.config.state_dir.display())
        })?;
        let json = serde_json::to_vec_pretty(decision).context("Failed to serialize decision")?;
        write_atomic(&self.decision_path(), &json)
    }

    /// Decision written by the last `check`, if any
    pub fn load_decision(&self) -> Result<Option<RenewalDecision>> {
        let path = self.decision_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let decision = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(decision))
    }

    fn publisher(&self) -> Result<ResultPublisher> {
        let secrets = self
            .secrets
            .clone()
            .ok_or_else(|| anyhow!("No secret store configured"))?;
        Ok(ResultPublisher::new(
            PublisherSettings {
                state_dir: self.config.state_dir.clone(),
                secret_base_name: self.config.secrets.base_name.clone(),
                p12_password: self.config.signing.p12_password.clone(),
                updated_by: self.config.secrets.updated_by.clone(),
                environment: self.config.environment.clone(),
                run_url: self.config.run.run_url(),
            },
            secrets,
            self.notifications.clone(),
            self.clock.clone(),
        ))
    }

    fn payload(&self, event: NotificationEvent, severity: Severity, message: &str) -> NotificationPayload {
        let mut payload = NotificationPayload::new(event, severity, self.environment(), message)
            .with_run_url(self.config.run.run_url());
        payload.timestamp = self.clock.now();
        payload
    }

    /// Discover bundle ids from the Xcode project
    pub fn scan(&self) -> Result<Vec<String>> {
        let ids = project::scan(&self.config.project.root, self.config.bundle_id_suffix())?;

        println!("Bundle IDs ({}):", self.environment());
        for id in &ids {
            println!("  - {}", id);
        }

        let mut output = self.output();
        output
            .set("bundle_id", &ids[0])
            .set("bundle_ids", serde_json::to_string(&ids)?);
        output.flush()?;

        Ok(ids)
    }

    /// Fetch the App Store Connect API key and leave it where later stages look
    pub async fn credentials(&self) -> Result<ApiCredentials> {
        let secrets = self
            .secrets
            .clone()
            .ok_or_else(|| anyhow!("No secret store configured"))?;
        let name = self.config.api_credentials_secret();
        let credentials = credentials::fetch(secrets.as_ref(), &name).await?;

        let key_path = self.config.api_key_path();
        credentials.write_key(&key_path)?;

        println!("API credentials from {}:", name);
        println!("  Key ID: {}", credentials.key_id);
        println!("  Issuer ID: {}", credentials.issuer_id);
        println!("  Private key: ****** written to {}", key_path.display());

        let mut output = self.output();
        output
            .set("key_id", &credentials.key_id)
            .set("issuer_id", &credentials.issuer_id)
            .set("key_path", key_path.display());
        output.flush()?;

        Ok(credentials)
    }

    /// Evaluate expiry and snapshot the decision for later stages
    pub async fn check(&self, application_ids: &[String], force_update: bool) -> Result<EvaluationOutcome> {
        if application_ids.is_empty() {
            return Err(anyhow!("At least one bundle id is required"));
        }
        let directory = self
            .directory
            .clone()
            .ok_or_else(|| anyhow!("No certificate directory configured"))?;

        let tie_break = match self.config.tie_break {
            TieBreakPolicy::FirstSeen => TieBreak::FirstSeen,
            TieBreakPolicy::CertificateId => TieBreak::Custom(by_certificate_id),
        };
        let evaluator = ExpiryEvaluator::new(directory, self.clock.clone()).with_tie_break(tie_break);

        let outcome = evaluator
            .evaluate(application_ids, self.config.days_threshold, force_update)
            .await;
        let decision = outcome.decision();
        self.save_decision(decision)?;

        match (&outcome, decision.days_remaining) {
            (EvaluationOutcome::NeedsAttention { cause, .. }, _) => {
                println!("Could not verify certificate status ({}), renewal needed", cause)
            },
            (_, Some(days)) => println!(
                "Certificate {} expires {} ({} days remaining), renewal {}",
                decision.certificate_id.as_deref().unwrap_or("-"),
                decision.expiry_date().unwrap_or_default(),
                days,
                if decision.needs_update { "needed" } else { "not needed" }
            ),
            (_, None) => println!("Forced renewal requested"),
        }

        let mut output = self.output();
        output.set("needs_update", decision.needs_update);
        if let Some(expiry) = decision.expiry_date() {
            output.set("expiry_date", expiry);
        }
        if let Some(days) = decision.days_remaining {
            output.set("days_remaining", days);
        }
        if let Some(certificate_id) = &decision.certificate_id {
            output.set("certificate_id", certificate_id);
        }
        if let Some(bundle_id) = &decision.matched_application_id {
            output.set("bundle_id", bundle_id);
        }
        output.flush()?;

        Ok(outcome)
    }

    /// Announce a new approval request and make it the live one once a human has heard about it
    pub async fn request_approval(&self, application_ids: &[String]) -> Result<ApprovalRequest> {
        let decision = match self.load_decision()? {
            Some(decision) if application_ids.is_empty() || decision.application_ids == application_ids => decision,
            Some(_) | None if !application_ids.is_empty() => {
                RenewalDecision::without_evidence(application_ids.to_vec())
            },
            _ => return Err(anyhow!("No decision from a previous check and no bundle ids given")),
        };

        // Delivered first, so an undelivered request never replaces the live one
        let gate = self.gate();
        let request = gate.prepare(&decision, self.environment())?;

        let message = match decision.days_remaining {
            Some(days) => format!(
                "The distribution certificate expires in {} days. Renew it?",
                days
            ),
            None if decision.forced => "A forced certificate renewal was requested. Renew it?".to_string(),
            None => "The certificate status could not be verified. Renew it?".to_string(),
        };

        let payload = self
            .payload(NotificationEvent::ApprovalRequested, Severity::Info, &message)
            .with_application_ids(vec![request.application_id.clone()])
            .with_expiry(decision.expiry_date(), decision.days_remaining)
            .with_approval(&request.approval_id, self.config.approval_workflow_url());

        self.notifications
            .deliver(&payload)
            .await
            .context("Approval request could not be delivered")?;
        gate.commit(&request).await?;

        println!("Approval requested: {}", request.approval_id);
        println!("Environment: {}", request.environment);
        println!("Bundle ID: {}", request.application_id);
        println!("Expires: {}", request.expires_at().to_rfc3339());

        let mut output = self.output();
        output
            .set("approval_id", &request.approval_id)
            .set("environment", &request.environment)
            .set("bundle_id", &request.application_id);
        output.flush()?;

        Ok(request)
    }

    /// Apply a human decision to the live approval request
    pub async fn approve(&self, approval_id: &str, action: ApprovalDecision, actor: &str) -> Result<ApprovalRequest> {
        let gate = self.gate();
        let validated = match gate.validate(approval_id, self.environment()).await {
            Ok(validated) => validated,
            Err(e) => {
                let mut output = self.output();
                output.set("approved", false).set("action", action);
                output.flush()?;
                return Err(e.into());
            },
        };

        let request = gate.consume(&validated, action, actor).await?;

        let (event, severity, message) = match action {
            ApprovalDecision::Approve => (
                NotificationEvent::RenewalApproved,
                Severity::Success,
                "Certificate renewal was approved and will start now.",
            ),
            ApprovalDecision::Reject => (
                NotificationEvent::RenewalRejected,
                Severity::Warning,
                "Certificate renewal was rejected. No changes will be made.",
            ),
        };
        let payload = self
            .payload(event, severity, message)
            .with_application_ids(vec![request.application_id.clone()])
            .with_approval(&request.approval_id, None)
            .with_actor(actor);
        self.notifications.notify(&payload).await;

        println!("Approval {} {} by {}", request.approval_id, action, actor);

        let mut output = self.output();
        output
            .set("approved", action == ApprovalDecision::Approve)
            .set("action", action);
        output.flush()?;

        Ok(request)
    }

    /// Renew the certificate. Requires an approved live request for this environment.
    pub async fn renew(&self, application_ids: &[String], retry_attempt: u32) -> Result<RenewalResult> {
        let signing = self
            .signing
            .clone()
            .ok_or_else(|| anyhow!("No signing tool configured"))?;

        let approval = self
            .approvals
            .live()
            .await?
            .ok_or_else(|| anyhow!("No approval request exists, refusing to renew"))?;
        let approved = approval.environment == self.environment()
            && approval.status == ApprovalStatus::Processed
            && approval.decision == Some(ApprovalDecision::Approve);
        if !approved {
            return Err(anyhow!(
                "Approval {} does not approve renewal for {}",
                approval.approval_id,
                self.environment()
            ));
        }

        let decision = self.load_decision()?;
        let ids = if application_ids.is_empty() {
            decision
                .as_ref()
                .map(|d| d.application_ids.clone())
                .filter(|ids| !ids.is_empty())
                .ok_or_else(|| anyhow!("No bundle ids given and no decision to take them from"))?
        } else {
            application_ids.to_vec()
        };
        let prior = decision.as_ref().and_then(|d| d.certificate_id.as_deref());

        let orchestrator = RenewalOrchestrator::new(signing, self.clock.clone());
        let mut output = self.output();

        let result = match orchestrator.run(prior, &ids, retry_attempt).await {
            Ok(result) => result,
            Err(e) => {
                output.set("success", false);
                output.flush()?;
                let payload = self
                    .payload(
                        NotificationEvent::RenewalFailed,
                        Severity::Failure,
                        "Certificate renewal failed.",
                    )
                    .with_application_ids(ids)
                    .with_error(format!("{:#}", e));
                self.notifications.notify(&payload).await;
                return Err(e.into());
            },
        };

        let missing = result.missing_profiles();
        if !missing.is_empty() {
            warn!("Profiles not refreshed for: {}", missing.join(", "));
        }

        publisher::save_result(&self.config.state_dir, &result)?;

        println!("Certificate: {}", result.certificate_path.display());
        println!("P12: {}", result.p12_path.display());
        println!(
            "Profiles refreshed: {}/{}",
            result.provisioning_profiles.len(),
            result.application_ids.len()
        );

        output
            .set("success", result.success)
            .set("certificate_path", result.certificate_path.display())
            .set("p12_path", result.p12_path.display());
        output.flush()?;

        Ok(result)
    }

    /// Upload the last renewal result and announce it
    pub async fn publish(&self) -> Result<UploadSummary> {
        let publisher = self.publisher()?;
        let result = publisher.load()?;
        let summary = publisher.upload(&result, self.environment()).await?;

        let mut fields = BTreeMap::new();
        fields.insert("Secret".to_string(), summary.certificate_secret.clone());
        fields.insert(
            "Bundle IDs".to_string(),
            result.application_ids.join(", "),
        );
        fields.insert(
            "Profiles".to_string(),
            format!("{}/{}", summary.profiles, result.application_ids.len()),
        );
        publisher
            .announce(
                Severity::Success,
                "The distribution certificate was renewed and uploaded.",
                fields,
            )
            .await;

        println!("Uploaded {}", summary.certificate_secret);
        if let Some(metadata) = &summary.metadata_secret {
            println!("Updated {}", metadata);
        }

        info!(secret = %summary.certificate_secret, "Published renewal result");
        Ok(summary)
    }

    /// Free-form status message, never fails the stage
    pub async fn notify(&self, status: Severity, message: &str, fields: BTreeMap<String, String>) {
        let mut payload = self.payload(NotificationEvent::StatusUpdate, status, message);
        payload.fields = fields;
        self.notifications.notify(&payload).await;
    }
}
