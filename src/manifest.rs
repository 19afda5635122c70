use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MedStoreError;

/// File name of the export manifest inside a dataset root.
pub const MANIFEST_FILE: &str = "series.json";

/// One exported series as recorded in `series.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRecord {
    pub dataset: String,
    pub series_id: String,
    pub import_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub created_by: String,
    /// Exported file paths relative to the dataset root.
    #[serde(default)]
    pub items: Vec<String>,
}

/// The file-backed export manifest.
///
/// An ordered record list, unique by (dataset, seriesId), read once at the
/// start of a run and rewritten wholesale after each batch. Concurrent runs
/// against the same path are not supported; the writer assumes it is alone.
#[derive(Debug)]
pub struct ExportManifest {
    path: PathBuf,
    records: Vec<SeriesRecord>,
    index: HashMap<(String, String), usize>,
}

impl ExportManifest {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        ExportManifest {
            path: path.into(),
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Load an existing manifest. A missing file yields an empty manifest;
    /// a corrupt one degrades to empty with a warning instead of failing
    /// the export.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records: Vec<SeriesRecord> = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(records) => records,
                Err(err) => {
                    warn!(
                        "manifest {} is unreadable ({err}), treating as empty",
                        path.display()
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        let mut manifest = ExportManifest::empty(path);
        for record in records {
            manifest.upsert(record);
        }
        manifest
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SeriesRecord] {
        &self.records
    }

    pub fn get(&self, dataset: &str, series_id: &str) -> Option<&SeriesRecord> {
        self.index
            .get(&(dataset.to_string(), series_id.to_string()))
            .map(|&at| &self.records[at])
    }

    /// Insert or replace the record for its (dataset, seriesId) key,
    /// preserving the position of a replaced record.
    pub fn upsert(&mut self, record: SeriesRecord) {
        let key = (record.dataset.clone(), record.series_id.clone());
        match self.index.get(&key) {
            Some(&at) => self.records[at] = record,
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Rewrite the manifest file in full (write-then-rename, so a failed
    /// write never leaves a truncated manifest behind).
    pub fn save(&self) -> Result<(), MedStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.records)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, raw)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

pub fn manifest_path(dataset_root: &Path) -> PathBuf {
    dataset_root.join(MANIFEST_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(series: &str, items: Vec<&str>) -> SeriesRecord {
        SeriesRecord {
            dataset: "demo".into(),
            series_id: series.into(),
            import_id: "import-1".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            created_by: "API:user".into(),
            items: items.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn round_trips_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let mut manifest = ExportManifest::empty(&path);
        manifest.upsert(record("s1", vec!["s1/s1-f1.dcm"]));
        manifest.upsert(record("s2", vec!["s2/s2-f1.dcm", "s2/s2-f2.dcm"]));
        manifest.save().unwrap();

        let reloaded = ExportManifest::load(&path);
        assert_eq!(reloaded.records(), manifest.records());

        reloaded.save().unwrap();
        let twice = ExportManifest::load(&path);
        assert_eq!(twice.records(), manifest.records());
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut manifest = ExportManifest::empty("unused.json");
        manifest.upsert(record("s1", vec!["a"]));
        manifest.upsert(record("s2", vec!["b"]));
        manifest.upsert(record("s1", vec!["c"]));
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.records()[0].items, vec!["c"]);
        assert_eq!(manifest.get("demo", "s1").unwrap().items, vec!["c"]);
        assert!(manifest.get("other", "s1").is_none());
    }

    #[test]
    fn corrupt_manifest_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(&path, "{ not json ]").unwrap();
        let manifest = ExportManifest::load(&path);
        assert!(manifest.is_empty());
    }

    #[test]
    fn missing_manifest_is_empty() {
        let manifest = ExportManifest::load("does/not/exist/series.json");
        assert!(manifest.is_empty());
    }
}
