use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::model::{Pair, PairKey, PositionState};

/// What the live loop needs to resume after a restart. Position records are
/// keyed by the unordered pair (`"KO/PEP"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub bar_index: u64,
    pub active_pairs: Vec<Pair>,
    pub positions: BTreeMap<String, PositionState>,
}

impl StateSnapshot {
    pub fn new(saved_at: DateTime<Utc>, bar_index: u64) -> Self {
        Self {
            saved_at,
            bar_index,
            active_pairs: Vec::new(),
            positions: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, pair: Pair, state: PositionState) {
        self.positions.insert(pair.key().to_string(), state);
        self.active_pairs.push(pair);
    }

    pub fn position(&self, key: &PairKey) -> Option<&PositionState> {
        self.positions.get(&key.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing has been persisted yet.
    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            log::info!("[STATE] no snapshot at {}", self.path.display());
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state {}", self.path.display()))?;
        let snapshot: StateSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse state {}", self.path.display()))?;
        log::info!(
            "[STATE] loaded {} pairs saved at {} from {}",
            snapshot.active_pairs.len(),
            snapshot.saved_at,
            self.path.display()
        );
        Ok(Some(snapshot))
    }

    /// Write to a sibling temp file, fsync, then rename over the old snapshot.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let payload =
            serde_json::to_string_pretty(snapshot).context("failed to encode state snapshot")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(payload.as_bytes())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to finalize state {}", self.path.display()))?;
        log::debug!(
            "[STATE] saved {} pairs to {}",
            snapshot.active_pairs.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PositionStatus;
    use chrono::TimeZone;

    fn pair(a: &str, b: &str) -> Pair {
        Pair {
            ticker_a: a.to_string(),
            ticker_b: b.to_string(),
            hedge_ratio: 1.5,
            p_value: 0.01,
            adf_p_value: 0.02,
            half_life: 12.0,
            sector: "Staples".to_string(),
            discovered_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let mut snapshot = StateSnapshot::new(at, 42);
        snapshot.insert(
            pair("KO", "PEP"),
            PositionState::opened(PositionStatus::ShortSpread, 40, at, Some(2.3)),
        );
        snapshot.insert(pair("CVX", "XOM"), PositionState::cooling(10));
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        let state = loaded.position(&PairKey::new("PEP", "KO")).unwrap();
        assert_eq!(state.status, PositionStatus::ShortSpread);
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let mut first = StateSnapshot::new(at, 1);
        first.insert(pair("KO", "PEP"), PositionState::flat());
        store.save(&first).unwrap();
        store.save(&StateSnapshot::new(at, 2)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.bar_index, 2);
        assert!(loaded.active_pairs.is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(StateStore::new(&path).load().is_err());
    }

    #[test]
    fn records_without_attention_flag_still_parse() {
        let raw = r#"{
            "saved_at": "2024-03-01T15:00:00Z",
            "active_pairs": [],
            "positions": {
                "KO/PEP": {
                    "status": "LONG_SPREAD",
                    "entry_bar_index": 3,
                    "entry_time": "2024-03-01T14:00:00Z",
                    "entry_z_score": -2.1,
                    "bars_held": 4,
                    "cooldown_remaining": 0
                }
            }
        }"#;
        let snapshot: StateSnapshot = serde_json::from_str(raw).unwrap();
        let state = snapshot.position(&PairKey::new("KO", "PEP")).unwrap();
        assert_eq!(state.status, PositionStatus::LongSpread);
        assert!(!state.needs_attention);
        assert_eq!(snapshot.bar_index, 0);
    }
}
