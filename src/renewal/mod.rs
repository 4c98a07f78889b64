//! Revoke, issue and refresh profiles for an approved renewal.

use crate::clock::Clock;
use crate::metrics;
use crate::models::RenewalResult;
use crate::signing::SigningTool;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RenewalError {
    /// No new certificate exists; nothing downstream may run
    #[error("Failed to issue a new distribution certificate: {0:#}")]
    IssuanceFailed(#[source] anyhow::Error),
}

pub struct RenewalOrchestrator {
    signing: Arc<dyn SigningTool>,
    clock: Arc<dyn Clock>,
}

impl RenewalOrchestrator {
    pub fn new(signing: Arc<dyn SigningTool>, clock: Arc<dyn Clock>) -> Self {
        Self { signing, clock }
    }

    /// Run one renewal attempt. `retry_attempt` is only reported; retries are the caller's.
    pub async fn run(
        &self,
        prior_certificate_id: Option<&str>,
        application_ids: &[String],
        retry_attempt: u32,
    ) -> Result<RenewalResult, RenewalError> {
        if retry_attempt > 0 {
            info!("Renewal retry attempt {}", retry_attempt);
        }

        let timer = metrics::RENEWAL_DURATION.start_timer();

        if let Some(certificate_id) = prior_certificate_id {
            if let Err(e) = self.signing.revoke(certificate_id).await {
                warn!(
                    "Failed to revoke certificate {}, continuing: {:#}",
                    certificate_id, e
                );
            }
        }

        let issued = match self.signing.issue().await {
            Ok(issued) => issued,
            Err(e) => {
                error!("Certificate issuance failed: {:#}", e);
                metrics::RENEWALS_FAILED.inc();
                timer.observe_duration();
                return Err(RenewalError::IssuanceFailed(e));
            },
        };

        info!(
            certificate = %issued.certificate_path.display(),
            p12 = %issued.p12_path.display(),
            "Issued new distribution certificate"
        );

        let mut provisioning_profiles = BTreeMap::new();
        for application_id in application_ids {
            match self.signing.refresh_profile(application_id).await {
                Ok(Some(path)) => {
                    info!("Refreshed profile for {}: {}", application_id, path.display());
                    provisioning_profiles.insert(application_id.clone(), path);
                },
                Ok(None) => {
                    warn!("No provisioning profile produced for {}", application_id);
                    metrics::PROFILE_REFRESH_FAILURES.inc();
                },
                Err(e) => {
                    warn!(
                        "Failed to refresh provisioning profile for {}: {:#}",
                        application_id, e
                    );
                    metrics::PROFILE_REFRESH_FAILURES.inc();
                },
            }
        }

        metrics::RENEWALS_SUCCEEDED.inc();
        timer.observe_duration();

        Ok(RenewalResult {
            success: true,
            certificate_path: issued.certificate_path,
            p12_path: issued.p12_path,
            application_ids: application_ids.to_vec(),
            provisioning_profiles,
            issued_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::IssuedCertificate;
    use anyhow::{Result, anyhow};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTool {
        fail_revoke: bool,
        fail_issue: bool,
        fail_profiles: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SigningTool for ScriptedTool {
        async fn revoke(&self, certificate_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("revoke:{}", certificate_id));
            if self.fail_revoke {
                return Err(anyhow!("already revoked"));
            }
            Ok(())
        }

        async fn issue(&self) -> Result<IssuedCertificate> {
            self.calls.lock().unwrap().push("issue".to_string());
            if self.fail_issue {
                return Err(anyhow!("certificate limit reached"));
            }
            Ok(IssuedCertificate {
                certificate_path: PathBuf::from("/tmp/c/dist.cer"),
                p12_path: PathBuf::from("/tmp/c/dist.p12"),
            })
        }

        async fn refresh_profile(&self, application_id: &str) -> Result<Option<PathBuf>> {
            self.calls.lock().unwrap().push(format!("profile:{}", application_id));
            if self.fail_profiles.iter().any(|id| id == application_id) {
                return Err(anyhow!("profile error"));
            }
            Ok(Some(PathBuf::from(format!("/tmp/p/{}.mobileprovision", application_id))))
        }
    }

    fn ids() -> Vec<String> {
        vec!["a.b".to_string(), "a.b.widget".to_string()]
    }

    #[tokio::test]
    async fn test_revoke_failure_is_tolerated() {
        let tool = Arc::new(ScriptedTool {
            fail_revoke: true,
            ..Default::default()
        });
        let orchestrator = RenewalOrchestrator::new(tool.clone(), Arc::new(SystemClock));

        let result = orchestrator.run(Some("OLD"), &ids(), 0).await.unwrap();

        assert!(result.success);
        assert_eq!(result.provisioning_profiles.len(), 2);
        assert_eq!(
            *tool.calls.lock().unwrap(),
            vec!["revoke:OLD", "issue", "profile:a.b", "profile:a.b.widget"]
        );
    }

    #[tokio::test]
    async fn test_issuance_failure_stops_everything_after() {
        let tool = Arc::new(ScriptedTool {
            fail_issue: true,
            ..Default::default()
        });
        let orchestrator = RenewalOrchestrator::new(tool.clone(), Arc::new(SystemClock));

        let result = orchestrator.run(None, &ids(), 1).await;

        assert!(matches!(result, Err(RenewalError::IssuanceFailed(_))));
        assert_eq!(*tool.calls.lock().unwrap(), vec!["issue"]);
    }

    #[tokio::test]
    async fn test_profile_failures_are_omitted() {
        let tool = Arc::new(ScriptedTool {
            fail_profiles: vec!["a.b".to_string()],
            ..Default::default()
        });
        let orchestrator = RenewalOrchestrator::new(tool, Arc::new(SystemClock));

        let result = orchestrator.run(None, &ids(), 0).await.unwrap();

        assert!(result.success);
        assert_eq!(result.application_ids, ids());
        assert!(!result.provisioning_profiles.contains_key("a.b"));
        assert!(result.provisioning_profiles.contains_key("a.b.widget"));
    }
}
