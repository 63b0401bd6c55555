//! Persistent participant registry.
//!
//! The only state that survives a node restart: the binding from
//! `(owner, name)` to the assigned participant id. Schedule content is
//! ephemeral.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ParticipantDescription, ParticipantId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read participant registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse participant registry {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write participant registry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait ParticipantStore: Send {
    /// The id bound to this description's identity key, assigning and
    /// persisting a fresh one when the key is new.
    fn add_or_retrieve(
        &mut self,
        description: &ParticipantDescription,
    ) -> Result<ParticipantId, StoreError>;

    /// Erase the binding for an id. Unknown ids are ignored.
    fn remove(&mut self, id: ParticipantId) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    bindings: Vec<Binding>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Binding {
    owner: String,
    name: String,
    id: u64,
}

/// Registry persisted as a JSON document, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    state: StoreState,
    index: BTreeMap<(String, String), ParticipantId>,
}

impl JsonFileStore {
    /// Load the registry, creating an empty one when the file is absent.
    /// A present-but-unreadable file is an error; the node must not start
    /// with a registry it cannot trust.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            StoreState::default()
        };
        let index = state
            .bindings
            .iter()
            .map(|binding| {
                (
                    (binding.owner.clone(), binding.name.clone()),
                    ParticipantId::new(binding.id),
                )
            })
            .collect();
        Ok(Self { path, state, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let contents =
            serde_json::to_vec_pretty(&self.state).expect("participant registry serializes");
        fs::write(&self.path, contents).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl ParticipantStore for JsonFileStore {
    fn add_or_retrieve(
        &mut self,
        description: &ParticipantDescription,
    ) -> Result<ParticipantId, StoreError> {
        let key = description.key();
        if let Some(&id) = self.index.get(&key) {
            return Ok(id);
        }
        let id = ParticipantId::new(self.state.next_id);
        self.state.next_id = self.state.next_id.wrapping_add(1);
        self.state.bindings.push(Binding {
            owner: key.0.clone(),
            name: key.1.clone(),
            id: id.get(),
        });
        self.persist()?;
        self.index.insert(key, id);
        Ok(id)
    }

    fn remove(&mut self, id: ParticipantId) -> Result<(), StoreError> {
        let before = self.state.bindings.len();
        self.state.bindings.retain(|binding| binding.id != id.get());
        if self.state.bindings.len() == before {
            return Ok(());
        }
        self.index.retain(|_, bound| *bound != id);
        self.persist()
    }
}

/// Volatile store for tests and throwaway deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: u64,
    index: BTreeMap<(String, String), ParticipantId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParticipantStore for MemoryStore {
    fn add_or_retrieve(
        &mut self,
        description: &ParticipantDescription,
    ) -> Result<ParticipantId, StoreError> {
        let key = description.key();
        if let Some(&id) = self.index.get(&key) {
            return Ok(id);
        }
        let id = ParticipantId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.index.insert(key, id);
        Ok(id)
    }

    fn remove(&mut self, id: ParticipantId) -> Result<(), StoreError> {
        self.index.retain(|_, bound| *bound != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Profile, Responsiveness};

    fn description(owner: &str, name: &str) -> ParticipantDescription {
        ParticipantDescription::new(name, owner, Responsiveness::Responsive, Profile::default())
    }

    #[test]
    fn assigns_and_remembers_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut store = JsonFileStore::open(&path).unwrap();

        let a = store.add_or_retrieve(&description("fleet", "cart_1")).unwrap();
        let b = store.add_or_retrieve(&description("fleet", "cart_2")).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            store.add_or_retrieve(&description("fleet", "cart_1")).unwrap(),
            a
        );
    }

    #[test]
    fn bindings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let first = {
            let mut store = JsonFileStore::open(&path).unwrap();
            store.add_or_retrieve(&description("fleet", "cart_1")).unwrap()
        };

        let mut reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened
                .add_or_retrieve(&description("fleet", "cart_1"))
                .unwrap(),
            first
        );
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn removal_frees_the_key_but_not_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut store = JsonFileStore::open(&path).unwrap();

        let first = store.add_or_retrieve(&description("fleet", "cart_1")).unwrap();
        store.remove(first).unwrap();
        let second = store.add_or_retrieve(&description("fleet", "cart_1")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn corrupt_registry_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
    }
}
