//! Certificate expiry evaluation.
//!
//! The evaluator never fails outright: anything that prevents it from finding
//! a usable certificate is reported as [`EvaluationOutcome::NeedsAttention`],
//! which still carries a decision with `needs_update = true`.

use crate::clock::Clock;
use crate::directory::CertificateDirectory;
use crate::metrics;
use crate::models::{CertificateKind, CertificateMatch, CertificateRecord, RenewalDecision};
use chrono::{DateTime, FixedOffset, TimeDelta};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why an evaluation fell back to "renewal needed"
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("No certificates found")]
    NoCertificatesFound,
    #[error("No distribution certificates found")]
    NoDistributionCertificates,
    #[error("No distribution certificate is linked to any of {application_ids:?}")]
    NoMatchingCertificate { application_ids: Vec<String> },
    #[error("Certificate directory error: {0:#}")]
    Directory(#[source] anyhow::Error),
}

/// Result of an evaluation cycle
#[derive(Debug)]
pub enum EvaluationOutcome {
    /// Decision backed by expiry evidence, or an explicit forced renewal
    Evaluated(RenewalDecision),
    /// Fail-open: no usable evidence, so renewal is requested for human attention
    NeedsAttention {
        decision: RenewalDecision,
        cause: EvaluationError,
    },
}

impl EvaluationOutcome {
    pub fn decision(&self) -> &RenewalDecision {
        match self {
            EvaluationOutcome::Evaluated(decision) => decision,
            EvaluationOutcome::NeedsAttention { decision, .. } => decision,
        }
    }

    pub fn into_decision(self) -> RenewalDecision {
        match self {
            EvaluationOutcome::Evaluated(decision) => decision,
            EvaluationOutcome::NeedsAttention { decision, .. } => decision,
        }
    }

    pub fn needs_update(&self) -> bool {
        self.decision().needs_update
    }

    pub fn cause(&self) -> Option<&EvaluationError> {
        match self {
            EvaluationOutcome::Evaluated(_) => None,
            EvaluationOutcome::NeedsAttention { cause, .. } => Some(cause),
        }
    }
}

/// Ordering applied between matches that expire at the same instant.
///
/// The directory returns certificates in no documented order, so which match
/// wins a tie is a policy choice rather than something to rely on.
#[derive(Clone, Copy, Default)]
pub enum TieBreak {
    /// Keep whichever match was seen first
    #[default]
    FirstSeen,
    /// `Greater` means the challenger replaces the current choice
    Custom(fn(&CertificateMatch, &CertificateMatch) -> Ordering),
}

impl TieBreak {
    fn prefers(&self, challenger: &CertificateMatch, current: &CertificateMatch) -> bool {
        match self {
            TieBreak::FirstSeen => false,
            TieBreak::Custom(compare) => compare(challenger, current) == Ordering::Greater,
        }
    }
}

impl std::fmt::Debug for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TieBreak::FirstSeen => f.write_str("FirstSeen"),
            TieBreak::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Tie-break comparator preferring the lexicographically greatest certificate id
pub fn by_certificate_id(challenger: &CertificateMatch, current: &CertificateMatch) -> Ordering {
    challenger.certificate.id.cmp(&current.certificate.id)
}

/// Whole days between `now` and `expires_at`, rounded toward negative infinity.
///
/// `now` is taken in the certificate's own offset before subtracting.
pub fn days_remaining(expires_at: DateTime<FixedOffset>, now: DateTime<chrono::Utc>) -> i64 {
    let now = now.with_timezone(expires_at.offset());
    let remaining = expires_at - now;
    let days = remaining.num_days();
    if remaining < TimeDelta::days(days) {
        days - 1
    } else {
        days
    }
}

/// Pick the latest-expiring match, resolving equal expiries with `tie_break`
pub fn select_latest(matches: &[CertificateMatch], tie_break: TieBreak) -> Option<&CertificateMatch> {
    let mut selected: Option<&CertificateMatch> = None;

    for candidate in matches {
        selected = match selected {
            None => Some(candidate),
            Some(current) => match candidate
                .certificate
                .expires_at
                .cmp(&current.certificate.expires_at)
            {
                Ordering::Greater => Some(candidate),
                Ordering::Equal if tie_break.prefers(candidate, current) => Some(candidate),
                _ => Some(current),
            },
        };
    }

    selected
}

pub struct ExpiryEvaluator {
    directory: Arc<dyn CertificateDirectory>,
    clock: Arc<dyn Clock>,
    tie_break: TieBreak,
}

impl ExpiryEvaluator {
    pub fn new(directory: Arc<dyn CertificateDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory,
            clock,
            tie_break: TieBreak::default(),
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Decide whether the certificate serving `application_ids` needs renewal
    pub async fn evaluate(
        &self,
        application_ids: &[String],
        days_threshold: i64,
        force_update: bool,
    ) -> EvaluationOutcome {
        metrics::EVALUATIONS_TOTAL.inc();

        if force_update {
            info!("Forced renewal requested, skipping certificate lookup");
            return EvaluationOutcome::Evaluated(RenewalDecision::forced(application_ids.to_vec()));
        }

        info!(
            "Checking distribution certificates for {}",
            application_ids.join(", ")
        );

        match self.find_latest_match(application_ids).await {
            Ok(latest) => EvaluationOutcome::Evaluated(self.decide(
                application_ids,
                latest,
                days_threshold,
            )),
            Err(cause) => {
                match &cause {
                    EvaluationError::Directory(e) => {
                        error!("Certificate check failed, treating as renewal needed: {:#}", e)
                    },
                    other => warn!("{}, treating as renewal needed", other),
                }
                metrics::EVALUATIONS_FAIL_OPEN.inc();
                EvaluationOutcome::NeedsAttention {
                    decision: RenewalDecision::without_evidence(application_ids.to_vec()),
                    cause,
                }
            },
        }
    }

    async fn find_latest_match(
        &self,
        application_ids: &[String],
    ) -> Result<CertificateMatch, EvaluationError> {
        let certificates = self
            .directory
            .list_certificates()
            .await
            .map_err(EvaluationError::Directory)?;

        if certificates.is_empty() {
            return Err(EvaluationError::NoCertificatesFound);
        }

        let distribution: Vec<CertificateRecord> = certificates
            .into_iter()
            .filter(|c| c.kind == CertificateKind::Distribution)
            .collect();

        if distribution.is_empty() {
            return Err(EvaluationError::NoDistributionCertificates);
        }

        let mut matches = Vec::new();
        for certificate in distribution {
            debug!("Checking profiles linked to certificate {}", certificate.id);

            let profiles = self
                .directory
                .list_profiles(&certificate.id)
                .await
                .map_err(EvaluationError::Directory)?;

            let matched = profiles
                .into_iter()
                .filter_map(|p| p.application_id)
                .find(|id| application_ids.contains(id));

            if let Some(application_id) = matched {
                debug!("Certificate {} matches {}", certificate.id, application_id);
                matches.push(CertificateMatch {
                    certificate,
                    application_id,
                });
            }
        }

        select_latest(&matches, self.tie_break)
            .cloned()
            .ok_or_else(|| EvaluationError::NoMatchingCertificate {
                application_ids: application_ids.to_vec(),
            })
    }

    fn decide(
        &self,
        application_ids: &[String],
        latest: CertificateMatch,
        days_threshold: i64,
    ) -> RenewalDecision {
        let expires_at = latest.certificate.expires_at;
        let days = days_remaining(expires_at, self.clock.now());
        let needs_update = days <= days_threshold;

        info!(
            certificate_id = %latest.certificate.id,
            certificate_name = %latest.certificate.name,
            application_id = %latest.application_id,
            expires_at = %expires_at,
            days_remaining = days,
            needs_update,
            "Evaluated certificate expiry"
        );

        RenewalDecision {
            needs_update,
            forced: false,
            certificate_id: Some(latest.certificate.id),
            application_ids: application_ids.to_vec(),
            matched_application_id: Some(latest.application_id),
            expires_at: Some(expires_at),
            days_remaining: Some(days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn certificate(id: &str, expires_at: DateTime<FixedOffset>) -> CertificateMatch {
        CertificateMatch {
            certificate: CertificateRecord {
                id: id.to_string(),
                name: id.to_string(),
                kind: CertificateKind::Distribution,
                expires_at,
            },
            application_id: "com.example.app".to_string(),
        }
    }

    #[test]
    fn test_days_remaining_floors_partial_days() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let expires = (now + Duration::days(25) + Duration::hours(23)).fixed_offset();
        assert_eq!(days_remaining(expires, now), 25);

        let expired = (now - Duration::hours(1)).fixed_offset();
        assert_eq!(days_remaining(expired, now), -1);

        let just_expired = (now - Duration::milliseconds(500)).fixed_offset();
        assert_eq!(days_remaining(just_expired, now), -1);

        let almost = (now + Duration::days(3) - Duration::milliseconds(1)).fixed_offset();
        assert_eq!(days_remaining(almost, now), 2);

        assert_eq!(days_remaining(now.fixed_offset(), now), 0);
        assert_eq!(days_remaining((now - Duration::days(2)).fixed_offset(), now), -2);
    }

    #[test]
    fn test_days_remaining_ignores_offset_representation() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let expires = (now + Duration::days(10)).with_timezone(&tokyo);
        assert_eq!(days_remaining(expires, now), 10);
    }

    #[test]
    fn test_select_latest_prefers_later_expiry() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let matches = vec![
            certificate("A", (base + Duration::days(5)).fixed_offset()),
            certificate("B", (base + Duration::days(50)).fixed_offset()),
            certificate("C", (base + Duration::days(20)).fixed_offset()),
        ];

        let selected = select_latest(&matches, TieBreak::FirstSeen).unwrap();
        assert_eq!(selected.certificate.id, "B");
    }

    #[test]
    fn test_tie_break_first_seen_and_custom() {
        let expiry = Utc
            .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
            .unwrap()
            .fixed_offset();
        let matches = vec![certificate("A", expiry), certificate("Z", expiry)];

        let first = select_latest(&matches, TieBreak::FirstSeen).unwrap();
        assert_eq!(first.certificate.id, "A");

        let by_id = select_latest(&matches, TieBreak::Custom(by_certificate_id)).unwrap();
        assert_eq!(by_id.certificate.id, "Z");
    }

    #[test]
    fn test_select_latest_empty() {
        assert!(select_latest(&[], TieBreak::FirstSeen).is_none());
    }
}
