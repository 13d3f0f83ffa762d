use super::{BrokerSnapshot, StateStore};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Snapshot kept in a single pretty-printed JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn name(&self) -> &str {
        "json"
    }

    fn load(&self) -> Result<Option<BrokerSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &BrokerSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot).context("Failed to serialize state")?;

        let parent = self
            .path
            .parent()
            .context("State path must have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("state.json");
        let temp_path = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let write_result = (|| -> Result<()> {
            let mut file = fs::File::create(&temp_path).with_context(|| {
                format!("Failed to create temporary state file: {}", temp_path.display())
            })?;
            file.write_all(&body)
                .context("Failed to write temporary state file")?;
            file.sync_all()
                .context("Failed to fsync temporary state file")?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e).with_context(|| {
                format!("Failed to replace state file: {}", self.path.display())
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::correlation::RecentTopicEntry;
    use crate::broker::ledger::{InquiryRecord, InquiryStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample() -> BrokerSnapshot {
        let now = Utc::now();
        let mut snapshot = BrokerSnapshot {
            counter: 2,
            ..BrokerSnapshot::default()
        };
        snapshot.inquiries.insert(
            2,
            InquiryRecord {
                sequence: 2,
                topic: "LAPTOP".into(),
                body: "need 5 laptops".into(),
                issued_at: now,
                status: InquiryStatus::Active,
                responses: vec!["15550001111@c.us".into()],
            },
        );
        snapshot.recent_topics.insert(
            "LAPTOP".into(),
            RecentTopicEntry {
                topic: "LAPTOP".into(),
                text: "need 5 laptops".into(),
                issued_at: now,
                sequence: 2,
            },
        );
        snapshot
    }

    #[test]
    fn missing_file_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_preserves_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("nested").join("state.json"));
        let snapshot = sample();

        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));

        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("nested"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "temporary files should be renamed away");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileStore::new(path).load().is_err());
    }

    #[test]
    fn older_files_without_optional_sections_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, r#"{"counter": 12}"#).unwrap();
        let snapshot = JsonFileStore::new(path).load().unwrap().unwrap();
        assert_eq!(snapshot.counter, 12);
        assert!(snapshot.inquiries.is_empty());
    }
}
