// Common test utilities for integration tests
//
// In-memory stand-ins for the certificate directory, the signing tool and
// notification channels, plus fixtures shared by the test files.

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use renewgate::clock::FixedClock;
use renewgate::config::RenewalConfig;
use renewgate::directory::CertificateDirectory;
use renewgate::models::{CertificateKind, CertificateRecord, IssuedCertificate, ProfileRecord};
use renewgate::notifications::{NotificationPayload, Notifier};
use renewgate::signing::SigningTool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const APP_ID: &str = "com.example.app";
pub const WIDGET_ID: &str = "com.example.app.widget";

/// Fixed "now" used across tests
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()
}

pub fn fixed_clock() -> FixedClock {
    FixedClock::new(base_time())
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn certificate(id: &str, kind: CertificateKind, expires_in: Duration) -> CertificateRecord {
    CertificateRecord {
        id: id.to_string(),
        name: format!("iOS Distribution: {}", id),
        kind,
        expires_at: (base_time() + expires_in).fixed_offset(),
    }
}

pub fn distribution(id: &str, expires_in_days: i64) -> CertificateRecord {
    certificate(id, CertificateKind::Distribution, Duration::days(expires_in_days))
}

pub fn profile(id: &str, application_id: &str) -> ProfileRecord {
    ProfileRecord {
        id: id.to_string(),
        name: format!("{} App Store", application_id),
        application_id: Some(application_id.to_string()),
    }
}

/// Directory serving a fixed catalogue
#[derive(Default)]
pub struct FakeDirectory {
    pub certificates: Vec<CertificateRecord>,
    pub profiles: HashMap<String, Vec<ProfileRecord>>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(mut self, certificate: CertificateRecord, profiles: Vec<ProfileRecord>) -> Self {
        self.profiles.insert(certificate.id.clone(), profiles);
        self.certificates.push(certificate);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CertificateDirectory for FakeDirectory {
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("401 Unauthorized"));
        }
        Ok(self.certificates.clone())
    }

    async fn list_profiles(&self, certificate_id: &str) -> Result<Vec<ProfileRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.profiles.get(certificate_id).cloned().unwrap_or_default())
    }
}

/// Signing tool writing real artifact files into a directory
pub struct FakeSigningTool {
    pub root: PathBuf,
    pub fail_issue: bool,
    pub fail_profiles: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSigningTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            fail_issue: false,
            fail_profiles: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SigningTool for FakeSigningTool {
    async fn revoke(&self, certificate_id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("revoke:{}", certificate_id));
        Ok(())
    }

    async fn issue(&self) -> Result<IssuedCertificate> {
        self.calls.lock().unwrap().push("issue".to_string());
        if self.fail_issue {
            return Err(anyhow!("Maximum number of certificates generated"));
        }

        std::fs::create_dir_all(&self.root)?;
        let certificate_path = self.root.join("distribution.cer");
        let p12_path = self.root.join("distribution.p12");
        std::fs::write(&certificate_path, b"CERTIFICATE")?;
        std::fs::write(&p12_path, b"PKCS12")?;

        Ok(IssuedCertificate {
            certificate_path,
            p12_path,
        })
    }

    async fn refresh_profile(&self, application_id: &str) -> Result<Option<PathBuf>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("profile:{}", application_id));
        if self.fail_profiles.iter().any(|id| id == application_id) {
            return Err(anyhow!("No App ID found for {}", application_id));
        }

        let path = self.root.join(format!("{}.mobileprovision", application_id));
        std::fs::write(&path, application_id.as_bytes())?;
        Ok(Some(path))
    }
}

/// Notifier keeping every payload it was asked to send
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<NotificationPayload>>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn payloads(&self) -> Vec<NotificationPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        if self.fail {
            return Err(anyhow!("Slack API returned error 500"));
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Configuration rooted in a temporary directory
pub fn test_config(root: &Path, environment: &str) -> RenewalConfig {
    let mut config = RenewalConfig::default();
    config.environment = environment.to_string();
    config.state_dir = root.join("state");
    config.secrets.directory = root.join("secrets");
    config.secrets.base_name = "apple-certificate-update".to_string();
    config.project.root = root.join("project");
    config.run.repository = Some("acme/ios-app".to_string());
    config.run.run_id = Some("1234".to_string());
    config
}

/// Read `key=value` lines written to a GITHUB_OUTPUT style file
pub fn read_outputs(path: &Path) -> HashMap<String, String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
