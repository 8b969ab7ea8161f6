//! Declared-output verification.

use std::collections::BTreeMap;

use pipewright_types::workflow::StepDefinition;
use sha2::{Digest, Sha256};

use super::StepFailure;
use crate::workspace::WorkspacePaths;

/// Hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check that every declared output exists and is non-empty.
///
/// Returns the fingerprint of each output, or `OutputMissing` listing every
/// path that failed the check.
pub async fn verify_outputs(
    step: &StepDefinition,
    workspace: &WorkspacePaths,
) -> Result<BTreeMap<String, String>, StepFailure> {
    let mut produced = BTreeMap::new();
    let mut missing = Vec::new();

    for relative in &step.declared_outputs {
        let path = workspace.resolve(relative);
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                produced.insert(relative.clone(), fingerprint(&bytes));
            }
            Ok(_) => {
                tracing::warn!(step_id = %step.id, output = %relative, "declared output is empty");
                missing.push(relative.clone());
            }
            Err(_) => missing.push(relative.clone()),
        }
    }

    if missing.is_empty() {
        Ok(produced)
    } else {
        Err(StepFailure::OutputMissing { paths: missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_sha256() {
        assert_eq!(
            fingerprint(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(fingerprint(b"hello"), fingerprint(b"hello!"));
    }

    #[tokio::test]
    async fn test_verify_reports_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        std::fs::write(dir.path().join("project/ok.md"), "content").unwrap();
        std::fs::write(dir.path().join("project/empty.md"), "").unwrap();

        let mut step = StepDefinition::new("s");
        step.declared_outputs = vec![
            "project/ok.md".to_string(),
            "project/empty.md".to_string(),
            "project/absent.md".to_string(),
        ];

        let err = verify_outputs(&step, &ws).await.unwrap_err();
        assert_eq!(
            err,
            StepFailure::OutputMissing {
                paths: vec!["project/empty.md".to_string(), "project/absent.md".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_verify_fingerprints_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        std::fs::write(dir.path().join("out.txt"), "hello").unwrap();

        let mut step = StepDefinition::new("s");
        step.declared_outputs = vec!["out.txt".to_string()];

        let produced = verify_outputs(&step, &ws).await.unwrap();
        assert_eq!(produced.get("out.txt"), Some(&fingerprint(b"hello")));
    }
}
