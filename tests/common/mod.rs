//! Shared fixtures for the integration tests: a deterministic embedder,
//! scripted generation backends and a service rooted in a temp directory.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

use letslearn::config::{parse_config, Config};
use letslearn::embedding::{normalize, Embedder};
use letslearn::generation::{CompletionBackend, CompletionRequest};
use letslearn::models::QuizQuestion;
use letslearn::quiz::QuizReply;
use letslearn::study::StudyService;

pub const CELL_NOTES: &str = "\
Cells are the basic unit of life. Every living organism is made of one or more cells, \
and every cell comes from an existing cell.

Mitochondria are the powerhouse of the cell. They convert glucose and oxygen into ATP \
through cellular respiration, releasing carbon dioxide and water.

The nucleus stores the cell's DNA and controls gene expression. Ribosomes read messenger \
RNA and assemble proteins from amino acids.

Photosynthesis happens in the chloroplasts of plant cells. Light energy drives the \
conversion of carbon dioxide and water into glucose and oxygen.";

// ─── Embedder ───

/// Bag-of-words hashing embedder. Texts sharing words land close together.
pub struct HashEmbedder;

const HASH_DIMS: usize = 4096;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        HASH_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; HASH_DIMS];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let mut hasher = DefaultHasher::new();
                    word.to_lowercase().hash(&mut hasher);
                    v[(hasher.finish() % HASH_DIMS as u64) as usize] += 1.0;
                }
                normalize(&mut v);
                v
            })
            .collect())
    }
}

// ─── Backends ───

/// Replays queued replies in order, streaming each in small fragments.
/// Once the queue is empty every call answers with `DEFAULT_REPLY`.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

pub const DEFAULT_REPLY: &str = "Generated text.";

impl ScriptedBackend {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| DEFAULT_REPLY.to_string());

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let chars: Vec<char> = reply.chars().collect();
            for piece in chars.chunks(7) {
                if tx.send(Ok(piece.iter().collect())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Sends one fragment, then waits until the consumer goes away.
pub struct HangingBackend {
    pub started: Arc<Notify>,
    released: Arc<AtomicBool>,
}

impl HangingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Arc::new(Notify::new()),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether the consumer has hung up on the generation.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for HangingBackend {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn start(&self, _request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(1);
        let started = Arc::clone(&self.started);
        let released = Arc::clone(&self.released);
        tokio::spawn(async move {
            let _ = tx.send(Ok("Partial ".to_string())).await;
            started.notify_one();
            tx.closed().await;
            released.store(true, Ordering::SeqCst);
        });
        Ok(rx)
    }
}

// ─── Service ───

pub fn test_config(dir: &Path) -> Config {
    parse_config(&format!(
        r#"
[storage]
projects_file = '{}'
data_dir = '{}'

[chunking]
size = 200
overlap = 40

[embedding]
provider = "disabled"

[generation]
provider = "disabled"
"#,
        dir.join("projects.json").display(),
        dir.join("data").display()
    ))
    .unwrap()
}

pub fn service_with(dir: &TempDir, backend: Arc<dyn CompletionBackend>) -> Arc<StudyService> {
    let service =
        StudyService::with_components(test_config(dir.path()), Arc::new(HashEmbedder), backend)
            .unwrap();
    service.startup().unwrap();
    Arc::new(service)
}

/// Create `name` with one registered text document about cells. The
/// document ends up embedded in the active collection.
pub async fn seed_project(service: &StudyService, dir: &TempDir, name: &str) -> PathBuf {
    service.create_project(name).unwrap();
    let path = dir.path().join(format!("{}-cells.txt", name));
    std::fs::write(&path, CELL_NOTES).unwrap();
    let report = service.register_document(name, &path).await.unwrap();
    assert!(report.chunks > 1);
    path
}

// ─── Quiz helpers ───

/// A model-style reply wrapping `n` well-formed questions in prose and a
/// code fence.
pub fn quiz_reply(prefix: &str, n: usize) -> String {
    let items: Vec<serde_json::Value> = (0..n)
        .map(|i| {
            serde_json::json!({
                "question": format!("{} question {}?", prefix, i),
                "options": [
                    format!("{} right {}", prefix, i),
                    "Wrong A",
                    "Wrong B",
                    "Wrong C"
                ],
                "answer": format!("{} right {}", prefix, i),
            })
        })
        .collect();
    format!(
        "Here is your quiz:\n```json\n{}\n```\nGood luck!",
        serde_json::to_string_pretty(&items).unwrap()
    )
}

pub fn questions(reply: QuizReply) -> Vec<QuizQuestion> {
    match reply {
        QuizReply::Questions(questions) => questions,
        QuizReply::Text(_) => panic!("expected pooled questions, got a text quiz"),
    }
}

pub fn pool_size(service: &StudyService, project: &str, topic: &str) -> usize {
    service
        .cached_keys(project)
        .unwrap()
        .quizzes
        .get(topic)
        .copied()
        .unwrap_or(0)
}

// ─── Polling ───

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
