use crate::replay::CoverageObservation;
use bincode::config::Configuration;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can arise during coverage store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The seed path does not live under the trial root it was recorded
    /// against, so no relative key can be derived.
    #[error("Seed path `{0}` is not relative to the trial root")]
    BadKey(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Store decoding error: {0}")]
    Decode(#[from] DecodeError),
}

fn bincode_config() -> Configuration<bincode::config::LittleEndian, bincode::config::Fixint> {
    bincode::config::standard().with_fixed_int_encoding()
}

/// One stored coverage record: the sparse edge vector plus execution time
/// and seed size attributes.
#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct StoredObservation {
    /// Sparse `(edge_id, hit_count)` pairs, sorted by edge id.
    pub edges: Vec<(u32, u32)>,
    /// Execution time of the replay, in milliseconds.
    pub time_ms: f64,
    /// Seed size in bytes.
    pub size: u64,
}

impl From<&CoverageObservation> for StoredObservation {
    fn from(obs: &CoverageObservation) -> Self {
        Self {
            edges: obs.edges.iter().map(|(&e, &c)| (e, c)).collect(),
            time_ms: obs.exec_time_ms,
            size: obs.byte_size,
        }
    }
}

/// Durable keyed store for one trial's coverage observations.
///
/// Keys are seed paths relative to the trial root, so stores produced on
/// different hosts for the same corpus layout are comparable. The container
/// is serialized with bincode to a single file.
#[derive(Encode, Decode, Debug, Default)]
pub struct TrialStore {
    entries: BTreeMap<String, StoredObservation>,
}

impl TrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation under the seed's path relative to `trial_root`.
    pub fn record(
        &mut self,
        trial_root: &Path,
        seed: &Path,
        observation: &CoverageObservation,
    ) -> Result<(), StoreError> {
        let key = seed
            .strip_prefix(trial_root)
            .map_err(|_| StoreError::BadKey(seed.to_string_lossy().into_owned()))?
            .to_string_lossy()
            .into_owned();
        self.entries.insert(key, observation.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&StoredObservation> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StoredObservation)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the store to a single file. Written once by the coordinating
    /// process after all replay workers complete.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = bincode::encode_to_vec(self, bincode_config())?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path)?;
        let (store, _) = bincode::decode_from_slice(&bytes, bincode_config())?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayStatus;
    use std::collections::BTreeMap as EdgeMap;
    use std::path::PathBuf;

    fn observation(edges: &[(u32, u32)], time_ms: f64, size: u64) -> CoverageObservation {
        CoverageObservation {
            edges: EdgeMap::from_iter(edges.iter().copied()),
            exec_time_ms: time_ms,
            byte_size: size,
            status: ReplayStatus::Ok,
        }
    }

    #[test]
    fn record_keys_by_relative_path() {
        let mut store = TrialStore::new();
        let root = PathBuf::from("/trials/t1");
        let seed = root.join("queue/id:000000");

        store
            .record(&root, &seed, &observation(&[(3, 1)], 1.5, 10))
            .expect("Record should succeed");

        let stored = store.get("queue/id:000000").expect("Key should exist");
        assert_eq!(stored.edges, vec![(3, 1)]);
        assert_eq!(stored.time_ms, 1.5);
        assert_eq!(stored.size, 10);
    }

    #[test]
    fn record_rejects_seed_outside_trial_root() {
        let mut store = TrialStore::new();
        let result = store.record(
            Path::new("/trials/t1"),
            Path::new("/elsewhere/id:000000"),
            &observation(&[], 0.0, 0),
        );
        match result {
            Err(StoreError::BadKey(_)) => {}
            other => panic!("Expected BadKey, got {other:?}"),
        }
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("trial.cov");
        let root = PathBuf::from("/t");

        let mut store = TrialStore::new();
        store
            .record(
                &root,
                &root.join("queue/id:000000"),
                &observation(&[(1, 2), (9, 1)], 12.25, 40),
            )
            .unwrap();
        store
            .record(
                &root,
                &root.join("queue/id:000001"),
                &observation(&[(5, 7)], 3.0, 8),
            )
            .unwrap();

        store.save(&path).expect("Save should succeed");
        let loaded = TrialStore::load(&path).expect("Load should succeed");

        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get("queue/id:000000").unwrap().edges,
            vec![(1, 2), (9, 1)]
        );
        assert_eq!(loaded.get("queue/id:000001").unwrap().time_ms, 3.0);
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            vec!["queue/id:000000", "queue/id:000001"]
        );
    }

    #[test]
    fn load_of_garbage_fails_with_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.cov");
        std::fs::write(&path, b"\xff\xfe\x00definitely not bincode").unwrap();
        match TrialStore::load(&path) {
            Err(StoreError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {other:?}"),
        }
    }
}
