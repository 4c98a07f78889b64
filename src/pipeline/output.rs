use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// Machine-readable `key=value` signals for the CI runner.
///
/// Written to the file named by `GITHUB_OUTPUT` when set; otherwise only kept
/// in memory so callers and tests can inspect them.
#[derive(Debug, Default)]
pub struct StageOutput {
    path: Option<PathBuf>,
    entries: Vec<(String, String)>,
}

impl StageOutput {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            entries: Vec::new(),
        }
    }

    /// Output file named by `GITHUB_OUTPUT`, if the runner set one
    pub fn path_from_env() -> Option<PathBuf> {
        std::env::var_os("GITHUB_OUTPUT")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Append all signals to the output file, if one is configured
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut rendered = String::new();
        for (key, value) in &self.entries {
            rendered.push_str(&render_entry(key, value));
        }

        file.write_all(rendered.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Wrote {} output(s) to {}", self.entries.len(), path.display());
        Ok(())
    }
}

/// Multi-line values use the runner's heredoc form
fn render_entry(key: &str, value: &str) -> String {
    if !value.contains('\n') {
        return format!("{}={}\n", key, value);
    }

    let mut delimiter = String::from("RENEWGATE_EOF");
    while value.lines().any(|line| line == delimiter) {
        delimiter.push('_');
    }
    format!("{}<<{}\n{}\n{}\n", key, delimiter, value, delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overwrites_and_keeps_order() {
        let mut output = StageOutput::new(None);
        output.set("needs_update", false).set("days_remaining", 40);
        output.set("needs_update", true);

        assert_eq!(output.get("needs_update"), Some("true"));
        assert_eq!(output.entries()[0].0, "needs_update");
        assert!(output.flush().is_ok());
    }

    #[test]
    fn test_flush_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_output");
        std::fs::write(&path, "existing=1\n").unwrap();

        let mut output = StageOutput::new(Some(path.clone()));
        output.set("approval_id", "20250501080000-ab12cd34");
        output.set("bundle_ids", r#"["a.b","a.b.widget"]"#);
        output.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "existing=1\napproval_id=20250501080000-ab12cd34\nbundle_ids=[\"a.b\",\"a.b.widget\"]\n"
        );
    }

    #[test]
    fn test_multiline_values_use_heredoc() {
        assert_eq!(
            render_entry("message", "line one\nline two"),
            "message<<RENEWGATE_EOF\nline one\nline two\nRENEWGATE_EOF\n"
        );
        assert!(render_entry("m", "a\nRENEWGATE_EOF").contains("<<RENEWGATE_EOF_\n"));
    }
}
