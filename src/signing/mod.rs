use crate::config::SigningSettings;
use crate::models::IssuedCertificate;
use anyhow::{Context, Result, anyhow};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Vendor-side operations that change signing state
#[async_trait::async_trait]
pub trait SigningTool: Send + Sync {
    async fn revoke(&self, certificate_id: &str) -> Result<()>;

    /// Create a new distribution certificate and export it with its private key
    async fn issue(&self) -> Result<IssuedCertificate>;

    /// Regenerate the distribution profile for one application.
    /// `Ok(None)` means the tool ran but produced no profile file.
    async fn refresh_profile(&self, application_id: &str) -> Result<Option<PathBuf>>;
}

/// Drives the `fastlane` CLI (`cert`, `sigh` and the `revoke_certificate` action)
pub struct FastlaneSigningTool {
    settings: SigningSettings,
}

impl FastlaneSigningTool {
    pub fn new(settings: SigningSettings) -> Self {
        Self { settings }
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(username) = &self.settings.username {
            args.push("--username".into());
            args.push(username.into());
        }
        if let Some(team_id) = &self.settings.team_id {
            args.push("--team_id".into());
            args.push(team_id.into());
        }
        args
    }

    fn cert_args(&self, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "cert".into(),
            "--output_path".into(),
            output_dir.into(),
            "--skip_install".into(),
            "--platform".into(),
            "ios".into(),
            "--development".into(),
            "false".into(),
            "--force".into(),
        ];
        args.extend(self.common_args());
        args
    }

    fn sigh_args(&self, application_id: &str, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "sigh".into(),
            "--app_identifier".into(),
            application_id.into(),
            "--output_path".into(),
            output_dir.into(),
            "--skip_install".into(),
            "--platform".into(),
            "ios".into(),
            "--force".into(),
            "--adhoc".into(),
            "false".into(),
            "--development".into(),
            "false".into(),
        ];
        args.extend(self.common_args());
        args
    }

    fn revoke_args(&self, certificate_id: &str) -> Vec<OsString> {
        vec![
            "run".into(),
            "revoke_certificate".into(),
            format!("certificate_id:{}", certificate_id).into(),
        ]
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        let mut command = Command::new(&self.settings.fastlane_path);
        command
            .args(&args)
            .env("FASTLANE_DISABLE_COLORS", "1")
            .env("FASTLANE_SKIP_UPDATE_CHECK", "1")
            .kill_on_drop(true);

        if let Some(key_id) = &self.settings.api_key_id {
            command.env("APP_STORE_CONNECT_API_KEY_KEY_ID", key_id);
        }
        if let Some(issuer_id) = &self.settings.api_issuer_id {
            command.env("APP_STORE_CONNECT_API_KEY_ISSUER_ID", issuer_id);
        }
        if let Some(key_path) = &self.settings.api_key_path {
            command.env("APP_STORE_CONNECT_API_KEY_KEY_FILEPATH", key_path);
        }
        if let Some(password) = &self.settings.p12_password {
            command.env("CERT_P12_PASSWORD", password);
        }

        debug!("Running {} {:?}", self.settings.fastlane_path.display(), args);

        let output = command.output().await.with_context(|| {
            format!(
                "Failed to start {}",
                self.settings.fastlane_path.display()
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(anyhow!(
                "fastlane {} exited with {}: {}",
                args.first()
                    .map(|a| a.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                output.status,
                last_lines(if stderr.trim().is_empty() { &stdout } else { &stderr }, 20)
            ));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl SigningTool for FastlaneSigningTool {
    async fn revoke(&self, certificate_id: &str) -> Result<()> {
        info!("Revoking certificate {}", certificate_id);
        self.run(self.revoke_args(certificate_id)).await
    }

    async fn issue(&self) -> Result<IssuedCertificate> {
        let output_dir = &self.settings.certificates_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        info!("Issuing new distribution certificate into {}", output_dir.display());
        self.run(self.cert_args(output_dir)).await?;

        let certificate_path = find_newest(output_dir, "cer")?
            .ok_or_else(|| anyhow!("No .cer file in {}", output_dir.display()))?;
        let p12_path = find_newest(output_dir, "p12")?
            .ok_or_else(|| anyhow!("No .p12 file in {}", output_dir.display()))?;

        Ok(IssuedCertificate {
            certificate_path,
            p12_path,
        })
    }

    async fn refresh_profile(&self, application_id: &str) -> Result<Option<PathBuf>> {
        // One directory per application so a profile is never attributed to the wrong id
        let output_dir = self.settings.profiles_dir.join(application_id.replace('/', "_"));
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        info!("Refreshing provisioning profile for {}", application_id);
        self.run(self.sigh_args(application_id, &output_dir)).await?;

        let profile = find_newest(&output_dir, "mobileprovision")?;
        if profile.is_none() {
            warn!(
                "fastlane sigh produced no profile for {} in {}",
                application_id,
                output_dir.display()
            );
        }
        Ok(profile)
    }
}

/// Most recently modified file in `dir` with the given extension
pub fn find_newest(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let replace = match &newest {
            None => true,
            Some((time, current)) => modified > *time || (modified == *time && path > *current),
        };
        if replace {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}
