//! Versioned, additive migrations for the persisted projects document.
//!
//! Migrations operate on the raw JSON before it is deserialized, so fields
//! added in later versions can be backfilled on documents written by older
//! builds. Each step only inserts keys that are missing; existing values are
//! never rewritten or removed, and running a step twice is a no-op.

use serde_json::{json, Map, Value};

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 4;

type Step = fn(&mut Map<String, Value>) -> bool;

/// Ordered additive steps, applied to every project object.
const STEPS: &[(u32, &str, Step)] = &[
    (1, "project cache with topics/quizzes/flashcards/notes", add_cache),
    (2, "cache summary and images", add_summary_and_images),
    (3, "quiz results and mastery", add_results_and_mastery),
    (4, "mastery record counters", fill_mastery_counters),
];

/// Counters every stored mastery record must carry.
const MASTERY_COUNTERS: &[&str] = &[
    "attempted",
    "correct",
    "accuracy",
    "total_time",
    "avg_speed",
    "best_speed",
];

/// Bring `doc` up to [`CURRENT_VERSION`]. Returns whether anything changed,
/// or `None` when the document is not a projects store at all (a non-object
/// root or a non-object `projects`); such a document is left untouched.
pub fn upgrade(doc: &mut Value) -> Option<bool> {
    let root = doc.as_object_mut()?;
    if root.get("projects").is_some_and(|p| !p.is_object()) {
        return None;
    }

    let mut changed = insert_missing(root, "projects", json!({}));

    if let Some(projects) = root.get_mut("projects").and_then(Value::as_object_mut) {
        for (_, step_name, step) in STEPS {
            for (name, project) in projects.iter_mut() {
                let Some(project) = project.as_object_mut() else {
                    continue;
                };
                if step(project) {
                    tracing::debug!(project = %name, step = step_name, "migrated project");
                    changed = true;
                }
            }
        }
    }

    let version = root.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version < u64::from(CURRENT_VERSION) {
        root.insert("version".to_string(), json!(CURRENT_VERSION));
        changed = true;
    }

    Some(changed)
}

fn insert_missing(obj: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    if obj.contains_key(key) {
        return false;
    }
    obj.insert(key.to_string(), value);
    true
}

fn add_cache(project: &mut Map<String, Value>) -> bool {
    let mut changed = insert_missing(
        project,
        "cache",
        json!({ "topics": null, "quizzes": {}, "flashcards": {}, "notes": {} }),
    );
    if let Some(cache) = project.get_mut("cache").and_then(Value::as_object_mut) {
        changed |= insert_missing(cache, "topics", Value::Null);
        changed |= insert_missing(cache, "quizzes", json!({}));
        changed |= insert_missing(cache, "flashcards", json!({}));
        changed |= insert_missing(cache, "notes", json!({}));
    }
    changed |= insert_missing(project, "loaded_files", json!([]));
    changed
}

fn add_summary_and_images(project: &mut Map<String, Value>) -> bool {
    let Some(cache) = project.get_mut("cache").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = insert_missing(cache, "summary", Value::Null);
    changed |= insert_missing(cache, "images", json!({}));
    changed
}

fn add_results_and_mastery(project: &mut Map<String, Value>) -> bool {
    let mut changed = insert_missing(project, "results", json!([]));
    changed |= insert_missing(project, "mastery", json!({}));
    changed
}

fn fill_mastery_counters(project: &mut Map<String, Value>) -> bool {
    let Some(mastery) = project.get_mut("mastery").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = false;
    for record in mastery.values_mut().filter_map(Value::as_object_mut) {
        for counter in MASTERY_COUNTERS {
            changed |= insert_missing(record, counter, json!(0));
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_without_cache_gets_full_schema() {
        let mut doc = json!({ "projects": { "bio": { "loaded_files": ["data/bio/a.pdf"] } } });
        assert_eq!(upgrade(&mut doc), Some(true));

        let bio = &doc["projects"]["bio"];
        assert_eq!(bio["loaded_files"], json!(["data/bio/a.pdf"]));
        assert_eq!(bio["cache"]["topics"], Value::Null);
        assert_eq!(bio["cache"]["notes"], json!({}));
        assert_eq!(bio["cache"]["summary"], Value::Null);
        assert_eq!(bio["cache"]["images"], json!({}));
        assert_eq!(bio["results"], json!([]));
        assert_eq!(bio["mastery"], json!({}));
        assert_eq!(doc["version"], json!(CURRENT_VERSION));
    }

    #[test]
    fn test_cache_missing_notes_is_backfilled_without_touching_values() {
        let mut doc = json!({ "projects": { "chem": {
            "loaded_files": [],
            "cache": { "topics": "[\"Acids\"]", "quizzes": { "acids": "old text" }, "flashcards": {} }
        } } });
        assert_eq!(upgrade(&mut doc), Some(true));
        let cache = &doc["projects"]["chem"]["cache"];
        assert_eq!(cache["topics"], json!("[\"Acids\"]"));
        assert_eq!(cache["quizzes"]["acids"], json!("old text"));
        assert_eq!(cache["notes"], json!({}));
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let mut doc = json!({ "projects": { "p": {} } });
        assert_eq!(upgrade(&mut doc), Some(true));
        let snapshot = doc.clone();
        assert_eq!(upgrade(&mut doc), Some(false));
        assert_eq!(doc, snapshot);
    }

    #[test]
    fn test_unversioned_but_complete_document_only_stamps_version() {
        let mut doc = json!({ "projects": {} });
        assert_eq!(upgrade(&mut doc), Some(true));
        assert_eq!(doc, json!({ "version": CURRENT_VERSION, "projects": {} }));
    }

    #[test]
    fn test_unrecognized_shapes_are_left_alone() {
        let mut doc = json!([1, 2, 3]);
        assert_eq!(upgrade(&mut doc), None);
        assert_eq!(doc, json!([1, 2, 3]));

        let mut doc = json!({ "projects": ["bio"] });
        assert_eq!(upgrade(&mut doc), None);
        assert_eq!(doc, json!({ "projects": ["bio"] }));
    }

    #[test]
    fn test_mastery_records_missing_counters_are_zero_filled() {
        let mut doc = json!({ "version": 3, "projects": { "bio": {
            "loaded_files": [],
            "cache": { "topics": null, "quizzes": {}, "flashcards": {}, "notes": {},
                       "summary": null, "images": {} },
            "results": [],
            "mastery": { "cells": { "attempted": 4, "correct": 3, "accuracy": 75,
                                    "total_time": 120.0, "avg_speed": 2.0 } }
        } } });
        assert_eq!(upgrade(&mut doc), Some(true));

        let cells = &doc["projects"]["bio"]["mastery"]["cells"];
        assert_eq!(cells["best_speed"], json!(0));
        assert_eq!(cells["attempted"], json!(4));
        assert_eq!(cells["avg_speed"], json!(2.0));
        assert_eq!(doc["version"], json!(CURRENT_VERSION));
    }
}
