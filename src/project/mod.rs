//! Bundle identifier discovery from an Xcode project.

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SETTING: &str = "PRODUCT_BUNDLE_IDENTIFIER";

/// Directories never worth descending into while looking for a project
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "Pods", "build", "DerivedData"];

/// First `*.xcodeproj` below `root`, breadth first so the shallowest wins
pub fn find_xcodeproj(root: &Path) -> Result<PathBuf> {
    let mut queue = vec![root.to_path_buf()];

    while !queue.is_empty() {
        let mut next = Vec::new();
        let mut found = Vec::new();

        for dir in queue {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                },
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) == Some("xcodeproj") {
                    found.push(path);
                } else if !is_skipped(&path) {
                    next.push(path);
                }
            }
        }

        if !found.is_empty() {
            found.sort();
            if found.len() > 1 {
                warn!(
                    "Found {} Xcode projects, using {}",
                    found.len(),
                    found[0].display()
                );
            }
            return Ok(found.swap_remove(0));
        }

        next.sort();
        queue = next;
    }

    Err(anyhow!("No .xcodeproj found below {}", root.display()))
}

fn is_skipped(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| SKIPPED_DIRS.contains(&n) || n.ends_with(".xcworkspace"))
        .unwrap_or(false)
}

/// Literal `PRODUCT_BUNDLE_IDENTIFIER` values in first-seen order, without duplicates
pub fn parse_bundle_ids(pbxproj: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();

    for line in pbxproj.lines() {
        let Some(rest) = line.trim().strip_prefix(SETTING) else {
            continue;
        };
        let Some(value) = rest.trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value
            .trim()
            .trim_end_matches(';')
            .trim()
            .trim_matches('"')
            .trim();

        if value.is_empty() || value.contains("$(") || value.contains("${") {
            continue;
        }
        if !ids.iter().any(|id| id == value) {
            ids.push(value.to_string());
        }
    }

    ids
}

/// Append `suffix` to every id that does not already end with it
pub fn apply_suffix(ids: Vec<String>, suffix: Option<&str>) -> Vec<String> {
    match suffix.filter(|s| !s.is_empty()) {
        None => ids,
        Some(suffix) => ids
            .into_iter()
            .map(|id| {
                if id.ends_with(suffix) {
                    id
                } else {
                    format!("{}{}", id, suffix)
                }
            })
            .collect(),
    }
}

/// Find the project below `root` and return its bundle ids for an environment
pub fn scan(root: &Path, suffix: Option<&str>) -> Result<Vec<String>> {
    let project = find_xcodeproj(root)?;
    let pbxproj = project.join("project.pbxproj");
    let content = fs::read_to_string(&pbxproj)
        .with_context(|| format!("Failed to read {}", pbxproj.display()))?;

    let ids = parse_bundle_ids(&content);
    if ids.is_empty() {
        return Err(anyhow!("No bundle identifiers in {}", pbxproj.display()));
    }

    debug!("Found bundle ids {:?} in {}", ids, pbxproj.display());
    Ok(apply_suffix(ids, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PBXPROJ: &str = r#"
		buildSettings = {
			INFOPLIST_FILE = App/Info.plist;
			PRODUCT_BUNDLE_IDENTIFIER = com.example.app;
			PRODUCT_NAME = "$(TARGET_NAME)";
		};
		buildSettings = {
			PRODUCT_BUNDLE_IDENTIFIER = "com.example.app.widget";
		};
		buildSettings = {
			PRODUCT_BUNDLE_IDENTIFIER = "$(PRODUCT_BUNDLE_IDENTIFIER_BASE).tests";
			PRODUCT_BUNDLE_IDENTIFIER = com.example.app;
		};
"#;

    #[test]
    fn test_parse_bundle_ids() {
        assert_eq!(
            parse_bundle_ids(PBXPROJ),
            vec!["com.example.app", "com.example.app.widget"]
        );
        assert!(parse_bundle_ids("PRODUCT_NAME = App;").is_empty());
    }

    #[test]
    fn test_apply_suffix() {
        let ids = vec!["com.example.app".to_string(), "com.example.app.uat".to_string()];
        assert_eq!(
            apply_suffix(ids.clone(), Some(".uat")),
            vec!["com.example.app.uat", "com.example.app.uat"]
        );
        assert_eq!(apply_suffix(ids.clone(), Some("")), ids);
        assert_eq!(apply_suffix(ids.clone(), None), ids);
    }

    #[test]
    fn test_scan_finds_shallowest_project() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("ios").join("App.xcodeproj");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("project.pbxproj"), PBXPROJ).unwrap();

        let nested = dir.path().join("ios").join("Pods").join("Pods.xcodeproj");
        fs::create_dir_all(&nested).unwrap();

        let ids = scan(dir.path(), Some(".uat")).unwrap();
        assert_eq!(ids, vec!["com.example.app.uat", "com.example.app.widget.uat"]);
    }

    #[test]
    fn test_scan_without_project() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(dir.path(), None).is_err());
    }
}
