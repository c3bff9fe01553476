//! Persisted projects store.
//!
//! The whole store is one JSON document, read and written in full on every
//! access. [`ContentStore::load`] runs the versioned migration from
//! [`crate::migrate`] before deserializing, and writes the upgraded
//! document back once when anything had to be backfilled.
//!
//! There is no cross-request locking here. Callers that merge into shared
//! state (the quiz pool, mastery) use [`ContentStore::update`], which
//! reloads immediately before applying the change. Last writer wins for
//! anything not reloaded that way.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::migrate;
use crate::models::ProjectsFile;

#[derive(Debug, Clone)]
pub struct ContentStore {
    path: PathBuf,
}

impl ContentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, migrate and deserialize the store.
    ///
    /// A missing file is an empty store. A file that is not valid JSON is
    /// logged and also read as empty; it is not overwritten until the next
    /// save.
    pub fn load(&self) -> Result<ProjectsFile> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "store file missing; starting empty");
                return Ok(ProjectsFile {
                    version: migrate::CURRENT_VERSION,
                    ..Default::default()
                });
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store {}", self.path.display()))
            }
        };

        let mut doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store is not valid JSON; treating as empty");
                return Ok(ProjectsFile {
                    version: migrate::CURRENT_VERSION,
                    ..Default::default()
                });
            }
        };

        match migrate::upgrade(&mut doc) {
            Some(true) => {
                info!(path = %self.path.display(), version = migrate::CURRENT_VERSION, "store migrated");
                self.write_value(&doc)?;
            }
            Some(false) => {}
            None => {
                warn!(path = %self.path.display(), "store is not a projects document; treating as empty");
                return Ok(ProjectsFile {
                    version: migrate::CURRENT_VERSION,
                    ..Default::default()
                });
            }
        }

        serde_json::from_value(doc)
            .with_context(|| format!("store {} has an unexpected shape", self.path.display()))
    }

    /// Write the whole store, replacing the previous file atomically.
    pub fn save(&self, store: &ProjectsFile) -> Result<()> {
        let doc = serde_json::to_value(store).context("failed to serialize store")?;
        self.write_value(&doc)
    }

    /// Reload, apply `f`, save. Returns whatever `f` returns.
    pub fn update<T>(&self, f: impl FnOnce(&mut ProjectsFile) -> T) -> Result<T> {
        let mut store = self.load()?;
        let out = f(&mut store);
        self.save(&store)?;
        Ok(out)
    }

    fn write_value(&self, doc: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let body = serde_json::to_string_pretty(doc).context("failed to encode store")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace store {}", self.path.display()))?;
        debug!(path = %self.path.display(), "store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Project, QuizQuestion, StoredPool};
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ContentStore {
        ContentStore::new(dir.path().join("projects.json"))
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let loaded = store.load().unwrap();
        assert!(loaded.projects.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_legacy_document_is_backfilled_and_persisted_once() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            json!({ "projects": { "bio": {
                "loaded_files": ["data/bio/cells.pdf"],
                "cache": { "topics": null, "quizzes": { "cells": "1. What is a cell?" }, "flashcards": {} }
            } } })
            .to_string(),
        )
        .unwrap();

        let loaded = store.load().unwrap();
        let bio = loaded.project("bio").unwrap();
        assert!(bio.cache.notes.is_empty());
        assert!(bio.cache.quizzes["cells"].questions().is_empty());

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["version"], json!(migrate::CURRENT_VERSION));
        assert_eq!(on_disk["projects"]["bio"]["cache"]["notes"], json!({}));
        // legacy value kept as-is on disk
        assert_eq!(
            on_disk["projects"]["bio"]["cache"]["quizzes"]["cells"],
            json!("1. What is a cell?")
        );

        let modified = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.load().unwrap();
        let again = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        assert_eq!(modified, again, "second load must not write");
    }

    #[test]
    fn test_corrupt_store_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().unwrap().projects.is_empty());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn test_wrongly_shaped_store_reads_empty_without_rewrite() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for body in [r#"["bio", "chem"]"#, r#"{"version": 3, "projects": "bio"}"#] {
            std::fs::write(store.path(), body).unwrap();
            assert!(store.load().unwrap().projects.is_empty());
            assert_eq!(std::fs::read_to_string(store.path()).unwrap(), body);
        }
    }

    #[test]
    fn test_mastery_record_missing_fields_does_not_block_other_projects() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            json!({ "version": 3, "projects": {
                "bio": {
                    "loaded_files": [],
                    "results": [],
                    "mastery": { "cells": { "attempted": 4, "correct": 3, "accuracy": 75,
                                            "total_time": 120.0, "avg_speed": 2.0 } }
                },
                "chem": { "loaded_files": ["data/chem/acids.txt"] }
            } })
            .to_string(),
        )
        .unwrap();

        let loaded = store.load().unwrap();
        let cells = &loaded.project("bio").unwrap().mastery["cells"];
        assert_eq!(cells.attempted, 4);
        assert_eq!(cells.best_speed, 0.0);
        assert_eq!(
            loaded.project("chem").unwrap().loaded_files,
            vec![std::path::PathBuf::from("data/chem/acids.txt")]
        );
    }

    #[test]
    fn test_update_reloads_before_writing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .update(|s| {
                s.projects.insert("chem".into(), Project::default());
            })
            .unwrap();

        // a writer holding a stale copy
        let stale = store.load().unwrap();

        store
            .update(|s| {
                let pool = vec![QuizQuestion {
                    question: "pH of water?".into(),
                    options: vec!["7".into(), "1".into(), "14".into(), "0".into()],
                    answer: "7".into(),
                }];
                s.project_mut("chem")
                    .unwrap()
                    .cache
                    .quizzes
                    .insert("acids".into(), StoredPool::Questions(pool));
            })
            .unwrap();

        assert!(stale.project("chem").unwrap().cache.quizzes.is_empty());
        let fresh = store.load().unwrap();
        assert_eq!(fresh.project("chem").unwrap().cache.quizzes["acids"].questions().len(), 1);
    }
}
