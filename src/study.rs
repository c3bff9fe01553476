//! The study service: one explicitly constructed object that owns the
//! embedding model, the active vector collection, the generation gate and
//! the persisted store, and exposes every operation the transports need.
//!
//! Build it once at process start ([`StudyService::from_config`]), call
//! [`startup`](StudyService::startup), share it behind an `Arc`, and call
//! [`shutdown`](StudyService::shutdown) on the way out.
//!
//! Only one project's documents are retrievable at a time. Loading a
//! project clears the collection first.

use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::cache::ContentStore;
use crate::chunk::Chunker;
use crate::config::Config;
use crate::context::{ContextAssembler, ContextRequest};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Result, StudyError};
use crate::generation::{create_backend, CompletionBackend, CompletionRequest, GenerationGate, TextStream};
use crate::index::VectorIndex;
use crate::mastery::{self, MasteryView};
use crate::models::{Cache, ImageRecord, Project, QuizResult, TopicKey};
use crate::parser::parse_document;
use crate::prompts::{self, QuizFormat};
use crate::quiz::{QuizPoolManager, QuizReply};

const COLLECTION: &str = "letslearn";

/// Per-file outcome of loading or uploading documents.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub project: String,
    pub total_files: usize,
    /// Files that contributed at least one chunk.
    pub embedded_files: usize,
    pub chunks: usize,
    pub files: Vec<FileReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub name: String,
    pub loaded_files: Vec<PathBuf>,
    pub results: usize,
    pub active: bool,
}

/// Which cache keys hold generated content for a project.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheOverview {
    pub topics: bool,
    pub summary: bool,
    pub notes: Vec<String>,
    pub flashcards: Vec<String>,
    /// Pool size per topic key.
    pub quizzes: BTreeMap<String, usize>,
    pub images: Vec<String>,
}

/// A cached text artifact.
#[derive(Debug, Clone)]
enum Slot {
    Topics,
    Summary,
    Notes(TopicKey),
    Flashcards(TopicKey),
}

impl Slot {
    fn get<'a>(&self, cache: &'a Cache) -> Option<&'a String> {
        match self {
            Slot::Topics => cache.topics.as_ref(),
            Slot::Summary => cache.summary.as_ref(),
            Slot::Notes(key) => cache.notes.get(key.as_str()),
            Slot::Flashcards(key) => cache.flashcards.get(key.as_str()),
        }
    }

    fn put(&self, cache: &mut Cache, text: String) {
        match self {
            Slot::Topics => cache.topics = Some(text),
            Slot::Summary => cache.summary = Some(text),
            Slot::Notes(key) => {
                cache.notes.insert(key.as_str().to_string(), text);
            }
            Slot::Flashcards(key) => {
                cache.flashcards.insert(key.as_str().to_string(), text);
            }
        }
    }

    fn label(&self) -> String {
        match self {
            Slot::Topics => "topics".to_string(),
            Slot::Summary => "summary".to_string(),
            Slot::Notes(key) => format!("notes:{}", key),
            Slot::Flashcards(key) => format!("flashcards:{}", key),
        }
    }
}

pub struct StudyService {
    config: Config,
    store: ContentStore,
    index: Arc<VectorIndex>,
    context: ContextAssembler,
    gate: GenerationGate,
    quizzes: QuizPoolManager,
    chunker: Chunker,
    active: RwLock<Option<String>>,
}

impl StudyService {
    /// Build the service with the providers named in `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let backend = create_backend(&config.generation)?;
        Ok(Self::with_components(config, embedder, backend)?)
    }

    /// Build the service around caller-supplied collaborators.
    pub fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunking.size, config.chunking.overlap)?;
        let store = ContentStore::new(&config.storage.projects_file);
        let index = Arc::new(VectorIndex::new(COLLECTION, embedder));
        let context = ContextAssembler::new(Arc::clone(&index));
        let gate = GenerationGate::new(backend);
        let quizzes = QuizPoolManager::new(
            store.clone(),
            context.clone(),
            gate.clone(),
            config.retrieval.clone(),
        );
        Ok(Self {
            config,
            store,
            index,
            context,
            gate,
            quizzes,
            chunker,
            active: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &GenerationGate {
        &self.gate
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn active_project(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active(&self, project: Option<String>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = project;
    }

    /// Reset the collection and bring the store up to date.
    pub fn startup(&self) -> Result<()> {
        self.index.clear();
        self.set_active(None);

        std::fs::create_dir_all(&self.config.storage.data_dir).map_err(anyhow::Error::from)?;
        let store = self.store.load()?;
        if !self.store.path().exists() {
            self.store.save(&store)?;
        }

        if store.projects.is_empty() {
            info!("no projects yet; create one and upload documents to begin");
        } else {
            let names: Vec<&str> = store.projects.keys().map(String::as_str).collect();
            info!(count = names.len(), projects = %names.join(", "), "projects found; load one to make it searchable");
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.index.clear();
        self.set_active(None);
        info!("study service shut down");
    }

    // ============ Projects and documents ============

    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let store = self.store.load()?;
        let active = self.active_project();
        Ok(store
            .projects
            .iter()
            .map(|(name, p)| ProjectSummary {
                name: name.clone(),
                loaded_files: p.loaded_files.clone(),
                results: p.results.len(),
                active: active.as_deref() == Some(name.as_str()),
            })
            .collect())
    }

    pub fn project(&self, name: &str) -> Result<Project> {
        self.store
            .load()?
            .projects
            .remove(name)
            .ok_or_else(|| StudyError::ProjectNotFound(name.to_string()))
    }

    /// Create an empty project and its data folder. Returns the trimmed name.
    pub fn create_project(&self, name: &str) -> Result<String> {
        let name = validate_project_name(name)?;
        let created = self.store.update(|s| {
            if s.projects.contains_key(&name) {
                false
            } else {
                s.projects.insert(name.clone(), Project::default());
                true
            }
        })?;
        if !created {
            return Err(StudyError::ProjectExists(name));
        }

        let dir = self.project_dir(&name);
        std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        info!(project = %name, dir = %dir.display(), "project created");
        Ok(name)
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.config.storage.data_dir.join(project)
    }

    /// Save `bytes` into the project's folder, register it and embed it
    /// into the active collection.
    ///
    /// A file with no extractable text stays registered but is reported as
    /// [`StudyError::Unparseable`].
    pub async fn upload_document(
        &self,
        project: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<FileReport> {
        self.project(project)?;
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| StudyError::InvalidInput(format!("invalid file name: {:?}", filename)))?
            .to_string();

        let dir = self.project_dir(project);
        std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        let path = dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(anyhow::Error::from)?;
        info!(project, path = %path.display(), bytes = bytes.len(), "document uploaded");

        self.register_path(project, &path)?;
        self.ingest_new(&path).await
    }

    /// Register an existing file with the project and embed it.
    pub async fn register_document(&self, project: &str, path: &Path) -> Result<FileReport> {
        self.project(project)?;
        if !path.is_file() {
            return Err(StudyError::InvalidInput(format!(
                "no such file: {}",
                path.display()
            )));
        }
        self.register_path(project, path)?;
        self.ingest_new(path).await
    }

    fn register_path(&self, project: &str, path: &Path) -> Result<()> {
        let found = self.store.update(|s| match s.project_mut(project) {
            Some(p) => {
                if !p.loaded_files.iter().any(|f| f == path) {
                    p.loaded_files.push(path.to_path_buf());
                }
                true
            }
            None => false,
        })?;
        if found {
            Ok(())
        } else {
            Err(StudyError::ProjectNotFound(project.to_string()))
        }
    }

    async fn ingest_new(&self, path: &Path) -> Result<FileReport> {
        let chunks = self.ingest(path).await?;
        if chunks == 0 {
            return Err(StudyError::Unparseable(path.display().to_string()));
        }
        Ok(FileReport {
            path: path.to_path_buf(),
            chunks,
            error: None,
        })
    }

    /// Parse, chunk and embed one file. Returns the number of chunks added.
    async fn ingest(&self, path: &Path) -> Result<usize> {
        let owned = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || parse_document(&owned))
            .await
            .map_err(anyhow::Error::from)?;
        if text.is_empty() {
            return Ok(0);
        }
        let chunks = self.chunker.split(&text);
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(self.index.add(chunks, &source).await?)
    }

    /// Make `project` the searchable one: clear the collection, then embed
    /// every registered file. Missing or unreadable files count as zero
    /// chunks and never stop the batch.
    pub async fn load_project(&self, project: &str) -> Result<LoadReport> {
        let data = self.project(project)?;

        self.index.clear();
        self.set_active(Some(project.to_string()));

        let mut files = Vec::with_capacity(data.loaded_files.len());
        for path in &data.loaded_files {
            let report = if !path.exists() {
                warn!(project, path = %path.display(), "registered file is missing");
                FileReport {
                    path: path.clone(),
                    chunks: 0,
                    error: Some("file not found".to_string()),
                }
            } else {
                match self.ingest(path).await {
                    Ok(chunks) => FileReport {
                        path: path.clone(),
                        chunks,
                        error: (chunks == 0).then(|| "no extractable text".to_string()),
                    },
                    Err(e) => {
                        warn!(project, path = %path.display(), error = %e, "failed to embed file");
                        FileReport {
                            path: path.clone(),
                            chunks: 0,
                            error: Some(e.to_string()),
                        }
                    }
                }
            };
            files.push(report);
        }

        let report = LoadReport {
            project: project.to_string(),
            total_files: files.len(),
            embedded_files: files.iter().filter(|f| f.chunks > 0).count(),
            chunks: files.iter().map(|f| f.chunks).sum(),
            files,
        };
        info!(
            project,
            files = report.total_files,
            embedded = report.embedded_files,
            chunks = report.chunks,
            "project loaded into active collection"
        );
        Ok(report)
    }

    // ============ Generation ============

    /// Answer a question from the active collection.
    pub async fn ask(&self, query: &str) -> Result<TextStream> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StudyError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }
        let r = &self.config.retrieval;
        let context = self
            .context
            .assemble(&ContextRequest {
                query,
                limit: r.limit,
                max_chars: r.answer_max_chars,
                k: r.k,
            })
            .await?;
        if context.trim().is_empty() {
            info!("no knowledge loaded; returning fallback answer");
            return Ok(TextStream::ready(prompts::EMPTY_ANSWER));
        }

        debug!(chars = context.chars().count(), "answering from context");
        let permit = self.gate.try_acquire()?;
        let fragments = permit.start(prompts::answer(&context, query)).await?;
        Ok(fragments.forward(|_| {}))
    }

    /// Answer a question about a passage the user highlighted.
    pub async fn ask_about_selection(&self, selected_text: &str, question: &str) -> Result<TextStream> {
        if selected_text.trim().is_empty() || question.trim().is_empty() {
            return Err(StudyError::InvalidInput(
                "selected text and question must not be empty".to_string(),
            ));
        }
        let permit = self.gate.try_acquire()?;
        let fragments = permit
            .start(prompts::contextual(selected_text.trim(), question.trim()))
            .await?;
        Ok(fragments.forward(|_| {}))
    }

    pub async fn topics(&self, project: &str) -> Result<TextStream> {
        let r = &self.config.retrieval;
        self.cached_generation(
            project,
            Slot::Topics,
            ContextRequest {
                query: "",
                limit: r.limit,
                max_chars: r.max_chars,
                k: r.k,
            },
            Some(prompts::EMPTY_TOPICS),
            prompts::topics,
        )
        .await
    }

    pub async fn summary(&self, project: &str) -> Result<TextStream> {
        let r = &self.config.retrieval;
        self.cached_generation(
            project,
            Slot::Summary,
            ContextRequest {
                query: "",
                limit: r.summary_limit,
                max_chars: r.summary_max_chars,
                k: r.k,
            },
            Some(prompts::EMPTY_SUMMARY),
            prompts::summary,
        )
        .await
    }

    pub async fn notes(&self, project: &str, topic: &str) -> Result<TextStream> {
        let key = TopicKey::new(topic);
        let label = key.to_string();
        let r = &self.config.retrieval;
        self.cached_generation(
            project,
            Slot::Notes(key.clone()),
            ContextRequest {
                query: topic_query(topic, &key),
                limit: r.limit,
                max_chars: r.max_chars,
                k: r.k,
            },
            Some(prompts::EMPTY_NOTES),
            |context| prompts::notes(context, &label),
        )
        .await
    }

    pub async fn flashcards(&self, project: &str, topic: &str, count: usize) -> Result<TextStream> {
        if count == 0 {
            return Err(StudyError::InvalidInput(
                "flashcard count must be at least 1".to_string(),
            ));
        }
        let key = TopicKey::new(topic);
        let notes = self
            .project(project)?
            .cache
            .notes
            .get(key.as_str())
            .cloned();
        let label = key.to_string();
        let r = &self.config.retrieval;
        self.cached_generation(
            project,
            Slot::Flashcards(key.clone()),
            ContextRequest {
                query: topic_query(topic, &key),
                limit: r.limit,
                max_chars: r.max_chars,
                k: r.k,
            },
            None,
            |context| prompts::flashcards(&prompts::with_notes(context, notes.as_deref()), &label, count),
        )
        .await
    }

    pub async fn quiz(
        &self,
        project: &str,
        topic: &str,
        count: usize,
        format: QuizFormat,
    ) -> Result<QuizReply> {
        self.quizzes.get_quiz(project, topic, count, format).await
    }

    /// Serve `slot` from the cache, or generate it and cache the full
    /// reply once the stream completes.
    ///
    /// With no document context, `fallback` is returned (uncached) when
    /// given; otherwise the model is asked anyway.
    async fn cached_generation(
        &self,
        project: &str,
        slot: Slot,
        request: ContextRequest<'_>,
        fallback: Option<&'static str>,
        build: impl FnOnce(&str) -> CompletionRequest,
    ) -> Result<TextStream> {
        let data = self.project(project)?;
        if let Some(hit) = slot.get(&data.cache) {
            info!(project, slot = %slot.label(), "cache hit");
            return Ok(TextStream::ready(hit.clone()));
        }

        let context = self.context.assemble(&request).await?;
        if context.trim().is_empty() {
            if let Some(fallback) = fallback {
                info!(project, slot = %slot.label(), "no knowledge loaded; returning fallback");
                return Ok(TextStream::ready(fallback));
            }
            warn!(project, slot = %slot.label(), "no document context; model falls back to its own knowledge");
        }

        let permit = self.gate.try_acquire()?;
        let fragments = permit.start(build(&context)).await?;

        let store = self.store.clone();
        let project = project.to_string();
        Ok(fragments.forward(move |text| {
            if text.trim().is_empty() {
                warn!(project = %project, slot = %slot.label(), "empty generation; not cached");
                return;
            }
            let saved = store.update(|s| match s.project_mut(&project) {
                Some(p) => {
                    slot.put(&mut p.cache, text);
                    true
                }
                None => false,
            });
            match saved {
                Ok(true) => info!(project = %project, slot = %slot.label(), "cached generated content"),
                Ok(false) => warn!(project = %project, "project vanished; generated content not cached"),
                Err(e) => warn!(project = %project, error = %e, "failed to cache generated content"),
            }
        }))
    }

    // ============ Results and mastery ============

    /// Record a quiz attempt and return the updated mastery view.
    pub fn submit_result(
        &self,
        project: &str,
        mut result: QuizResult,
    ) -> Result<BTreeMap<String, MasteryView>> {
        if result.total == 0 {
            return Err(StudyError::InvalidInput(
                "result total must be at least 1".to_string(),
            ));
        }
        result.timestamp.get_or_insert_with(Utc::now);

        let updated = self.store.update(|s| {
            let p = s.project_mut(project)?;
            mastery::record_result(&mut p.mastery, &result);
            p.results.push(result);
            Some(mastery::view(&p.mastery))
        })?;
        let view = updated.ok_or_else(|| StudyError::ProjectNotFound(project.to_string()))?;
        info!(project, topics = view.len(), "quiz result recorded");
        Ok(view)
    }

    pub fn mastery(&self, project: &str) -> Result<BTreeMap<String, MasteryView>> {
        Ok(mastery::view(&self.project(project)?.mastery))
    }

    pub fn results(&self, project: &str) -> Result<Vec<QuizResult>> {
        Ok(self.project(project)?.results)
    }

    // ============ Images and cache inspection ============

    pub fn images(&self, project: &str) -> Result<BTreeMap<String, ImageRecord>> {
        Ok(self.project(project)?.cache.images)
    }

    /// Decode a base64 PNG, write it under the project's `images/` folder
    /// and record it under the query's key.
    pub fn save_image(&self, project: &str, query: &str, base64_png: &str) -> Result<ImageRecord> {
        self.project(project)?;
        if query.trim().is_empty() {
            return Err(StudyError::InvalidInput("query must not be empty".to_string()));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64_png.trim())
            .map_err(|e| StudyError::InvalidInput(format!("image is not valid base64: {}", e)))?;

        let dir = self.project_dir(project).join("images");
        std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        let now = Utc::now();
        let path = dir.join(image_file_name(query, &now.format("%Y%m%d_%H%M%S").to_string()));
        std::fs::write(&path, &bytes).map_err(anyhow::Error::from)?;

        let record = ImageRecord {
            query: query.trim().to_string(),
            path,
            created_at: now,
        };
        let key = TopicKey::new(query);
        let stored = record.clone();
        let found = self.store.update(|s| match s.project_mut(project) {
            Some(p) => {
                p.cache.images.insert(key.as_str().to_string(), stored);
                true
            }
            None => false,
        })?;
        if !found {
            return Err(StudyError::ProjectNotFound(project.to_string()));
        }
        info!(project, path = %record.path.display(), "image saved");
        Ok(record)
    }

    pub fn cached_keys(&self, project: &str) -> Result<CacheOverview> {
        let cache = self.project(project)?.cache;
        Ok(CacheOverview {
            topics: cache.topics.is_some(),
            summary: cache.summary.is_some(),
            notes: cache.notes.into_keys().collect(),
            flashcards: cache.flashcards.into_keys().collect(),
            quizzes: cache
                .quizzes
                .iter()
                .map(|(k, p)| (k.clone(), p.questions().len()))
                .collect(),
            images: cache.images.into_keys().collect(),
        })
    }
}

/// Retrieval query for a topic; the aggregate topic reads in storage order.
fn topic_query<'a>(topic: &'a str, key: &TopicKey) -> &'a str {
    if key.is_all() {
        ""
    } else {
        topic.trim()
    }
}

fn validate_project_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StudyError::InvalidInput(
            "project name must not be empty".to_string(),
        ));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StudyError::InvalidInput(format!(
            "project name {:?} cannot contain path separators",
            name
        )));
    }
    Ok(name.to_string())
}

/// `<timestamp>_<first 30 chars of the query, non-alphanumerics as _>.png`
fn image_file_name(query: &str, timestamp: &str) -> String {
    let safe: String = query
        .chars()
        .take(30)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}.png", timestamp, safe.trim_matches('_'))
}
