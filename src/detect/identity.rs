//! Enrolled identity capability.
//!
//! The core never mutates identity records; it only asks whether a name is
//! authorized and reads the known embeddings. `InMemoryIdentityStore` is the
//! bundled implementation, loadable from a JSON roster file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::backend::Embedding;
use crate::Name;

/// Known faces used for matching. `names[i]` owns `embeddings[i]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KnownFaces {
    pub names: Vec<Name>,
    pub embeddings: Vec<Embedding>,
}

impl KnownFaces {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Enrolled identity summary, as reported by `listUsers`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub name: Name,
    pub is_authorized: bool,
}

pub trait IdentityStore: Send + Sync {
    fn is_authorized(&self, name: &str) -> bool;

    fn all_names(&self) -> Vec<Name>;

    /// Known embeddings in a stable order. Indices returned by
    /// `Matcher::best_match` refer to `KnownFaces::embeddings`.
    fn known_faces(&self) -> Arc<KnownFaces>;
}

#[derive(Clone, Debug, Deserialize)]
struct RosterFile {
    identities: Vec<RosterEntry>,
}

#[derive(Clone, Debug, Deserialize)]
struct RosterEntry {
    name: Name,
    #[serde(default)]
    authorized: bool,
    embedding: Embedding,
}

#[derive(Default)]
struct Roster {
    authorized: BTreeMap<Name, bool>,
    faces: Arc<KnownFaces>,
}

/// Thread-safe in-memory identity store.
///
/// Readers get an `Arc` snapshot of the face list, so a recognition job never
/// holds the lock while matching.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    roster: RwLock<Roster>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"identities": [{"name", "authorized", "embedding"}]}`.
    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read identities file {}", path.display()))?;
        let file: RosterFile = serde_json::from_str(&raw)
            .with_context(|| format!("parse identities file {}", path.display()))?;
        let store = Self::new();
        for entry in file.identities {
            if entry.name.trim().is_empty() {
                return Err(anyhow!("identities file contains an empty name"));
            }
            store.enroll(entry.name, entry.embedding, entry.authorized);
        }
        log::info!(
            "IdentityStore: loaded {} identities from {}",
            store.all_names().len(),
            path.display()
        );
        Ok(store)
    }

    /// Add a face for `name`. A name may have several faces; the authorization
    /// flag is per name and the latest enrollment sets it.
    pub fn enroll(&self, name: impl Into<Name>, embedding: Embedding, authorized: bool) {
        let name = name.into();
        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        let mut faces = roster.faces.as_ref().clone();
        faces.names.push(name.clone());
        faces.embeddings.push(embedding);
        roster.faces = Arc::new(faces);
        roster.authorized.insert(name, authorized);
    }

    /// Returns false when the name is not enrolled.
    pub fn set_authorized(&self, name: &str, authorized: bool) -> bool {
        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        match roster.authorized.get_mut(name) {
            Some(flag) => {
                *flag = authorized;
                true
            }
            None => false,
        }
    }

    /// Remove every face of `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        if roster.authorized.remove(name).is_none() {
            return false;
        }
        let mut faces = KnownFaces::default();
        for (face_name, embedding) in roster.faces.names.iter().zip(&roster.faces.embeddings) {
            if face_name != name {
                faces.names.push(face_name.clone());
                faces.embeddings.push(embedding.clone());
            }
        }
        roster.faces = Arc::new(faces);
        true
    }

    pub fn users(&self) -> Vec<UserSummary> {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        roster
            .authorized
            .iter()
            .map(|(name, authorized)| UserSummary {
                name: name.clone(),
                is_authorized: *authorized,
            })
            .collect()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn is_authorized(&self, name: &str) -> bool {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        roster.authorized.get(name).copied().unwrap_or(false)
    }

    fn all_names(&self) -> Vec<Name> {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        roster.authorized.keys().cloned().collect()
    }

    fn known_faces(&self) -> Arc<KnownFaces> {
        let roster = self.roster.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&roster.faces)
    }
}
