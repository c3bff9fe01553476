//! Core data models used throughout letslearn.
//!
//! Chunks live only in the in-memory vector index. Everything else here is
//! part of the persisted projects document and round-trips through
//! `serde_json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A bounded span of a document's text, stored as one retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// `doc_<n>`, sequential within the active collection.
    pub id: String,
    pub text: String,
    /// File name the chunk was cut from.
    pub source: String,
}

/// Root of the persisted store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectsFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
}

impl ProjectsFile {
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    pub fn project_mut(&mut self, name: &str) -> Option<&mut Project> {
        self.projects.get_mut(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub loaded_files: Vec<PathBuf>,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub results: Vec<QuizResult>,
    #[serde(default)]
    pub mastery: BTreeMap<String, MasteryRecord>,
}

/// Previously generated artifacts for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    #[serde(default)]
    pub topics: Option<String>,
    #[serde(default)]
    pub quizzes: BTreeMap<String, StoredPool>,
    #[serde(default)]
    pub flashcards: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageRecord>,
}

/// A quiz pool as persisted. Stores written before pooling existed kept the
/// raw generated text under the topic key instead of a question list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredPool {
    Questions(Vec<QuizQuestion>),
    Legacy(String),
}

impl StoredPool {
    /// The pooled questions; a legacy text entry reads as an empty pool.
    pub fn questions(&self) -> &[QuizQuestion] {
        match self {
            StoredPool::Questions(q) => q,
            StoredPool::Legacy(_) => &[],
        }
    }

    pub fn into_questions(self) -> Vec<QuizQuestion> {
        match self {
            StoredPool::Questions(q) => q,
            StoredPool::Legacy(_) => Vec::new(),
        }
    }
}

/// A multiple-choice question. `answer` matches exactly one of `options`
/// by text; option order carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
}

impl QuizQuestion {
    pub fn is_well_formed(&self) -> bool {
        self.options.len() == 4 && self.options.iter().filter(|o| **o == self.answer).count() == 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicTally {
    pub total: u32,
    pub correct: u32,
}

/// A submitted quiz attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuizResult {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub score: u32,
    pub total: u32,
    /// Score as a percentage, as reported by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub breakdown: BTreeMap<String, TopicTally>,
    /// Seconds spent on the whole attempt.
    #[serde(default)]
    pub time_spent: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Rolling per-topic statistics. `accuracy` and `avg_speed` are always
/// recomputed from the cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub attempted: u32,
    pub correct: u32,
    /// Percent, `0..=100`.
    pub accuracy: u32,
    /// Seconds.
    pub total_time: f64,
    /// Questions per minute, one decimal.
    pub avg_speed: f64,
    pub best_speed: f64,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

/// A generated image saved to disk for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub query: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Normalized topic used to key cached artifacts and quiz pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(String);

impl TopicKey {
    /// The aggregate sentinel covering every topic.
    pub const ALL: &'static str = "all";

    pub fn new(topic: &str) -> Self {
        let key = topic.trim().to_lowercase();
        if key.is_empty() {
            TopicKey(Self::ALL.to_string())
        } else {
            TopicKey(key)
        }
    }

    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
