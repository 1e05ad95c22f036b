//! Seed dataset loader for first-boot bootstrapping.
//!
//! Parses a static text file of `key → value` lines (the value is an opaque
//! string, typically JSON) into an initial key-value mapping. Only consulted
//! when a replica has no persisted state after WAL replay.

use std::path::Path;

use crate::utils::KvError;

use tokio::fs;

/// Separator between key and value in a seed line.
const SEED_SEPARATOR: &str = " → ";

/// Loads the seed file into a list of key-value pairs. A missing file is not
/// an error (the replica simply starts empty); malformed lines are skipped
/// with a warning.
pub async fn load_seed(
    path: &Path,
) -> Result<Vec<(String, String)>, KvError> {
    if !fs::try_exists(path).await? {
        pf_info!("no seed file at '{}', starting empty", path.display());
        return Ok(vec![]);
    }

    let content = fs::read_to_string(path).await?;
    let mut pairs = vec![];
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(SEED_SEPARATOR) {
            Some((key, value)) if !key.trim().is_empty() => {
                pairs.push((key.trim().into(), value.trim().into()));
            }
            _ => {
                pf_warn!("skipping invalid seed line: {}", line);
            }
        }
    }

    pf_info!("loaded {} seed pairs from '{}'", pairs.len(), path.display());
    Ok(pairs)
}

#[cfg(test)]
mod loader_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_file_is_empty() -> Result<(), KvError> {
        let path = std::env::temp_dir().join("quorumkv-test-seed-nonexist");
        assert_eq!(load_seed(&path).await?, vec![]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn parse_seed_lines() -> Result<(), KvError> {
        let path = std::env::temp_dir().join("quorumkv-test-seed-0.txt");
        fs::write(
            &path,
            "session:user001 → {\"userId\": \"u001\"}\n\
             \n\
             not-a-valid-line\n\
             session:user002 → {\"userId\": \"u002\"}\n",
        )
        .await?;
        assert_eq!(
            load_seed(&path).await?,
            vec![
                (
                    "session:user001".to_string(),
                    "{\"userId\": \"u001\"}".to_string()
                ),
                (
                    "session:user002".to_string(),
                    "{\"userId\": \"u002\"}".to_string()
                ),
            ]
        );
        Ok(())
    }
}
