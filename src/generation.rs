//! Text-generation capability and the exclusive-access gate around it.
//!
//! The local model can serve exactly one inference at a time. All access
//! goes through [`GenerationGate`]: `try_acquire` either hands out the one
//! [`GenerationPermit`] or fails immediately with
//! [`StudyError::ResourceBusy`]. Requests are never queued.
//!
//! Backends are channel-based producers. [`CompletionBackend::start`]
//! spawns a task that pushes fragments into a bounded channel and stops at
//! its next send once the receiving side is gone. The permit travels with
//! the receiver as [`Fragments`], so the lock is held exactly as long as
//! somebody is consuming the generation and is released on every exit path,
//! including the caller dropping the stream half-way.
//!
//! # Backends
//!
//! | Provider       | Endpoint              | Wire format                           |
//! |----------------|-----------------------|---------------------------------------|
//! | `llama-server` | `POST /completion`    | SSE `data:` lines with `content/stop` |
//! | `ollama`       | `POST /api/generate`  | NDJSON with `response/done`           |
//! | `disabled`     | none                  | every request fails                   |

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::error::StudyError;

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    /// Falls back to the backend's configured temperature.
    pub temperature: Option<f32>,
}

/// A streaming completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Begin generating. Fragments arrive in production order; the producer
    /// stops once the receiver is dropped.
    async fn start(&self, request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Create the backend selected by `[generation] provider`.
pub fn create_backend(config: &GenerationConfig) -> Result<Arc<dyn CompletionBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledBackend)),
        "llama-server" => Ok(Arc::new(LlamaServerBackend::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Disabled Backend ============

pub struct DisabledBackend;

#[async_trait]
impl CompletionBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn start(&self, _request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
        bail!("Text generation is disabled. Set [generation] provider in config.")
    }
}

// ============ llama.cpp server ============

pub struct LlamaServerBackend {
    client: reqwest::Client,
    url: String,
    temperature: f32,
}

#[derive(Serialize)]
struct LlamaRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    stop: &'a [String],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct LlamaChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

impl LlamaServerBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionBackend for LlamaServerBackend {
    fn name(&self) -> &str {
        "llama-server"
    }

    async fn start(&self, request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
        let body = LlamaRequest {
            prompt: &request.prompt,
            n_predict: request.max_tokens,
            stop: &request.stop,
            temperature: request.temperature.unwrap_or(self.temperature),
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/completion", self.url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("llama-server error ({}): {}", status, text);
        }

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump(response, tx, parse_llama_line));
        Ok(rx)
    }
}

// ============ Ollama ============

pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    num_predict: u32,
    stop: &'a [String],
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn start(&self, request: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: true,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                stop: &request.stop,
                temperature: request.temperature.unwrap_or(self.temperature),
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Ollama generate error ({}): {}", status, text);
        }

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump(response, tx, parse_ollama_line));
        Ok(rx)
    }
}

// ============ Wire parsing ============

/// One decoded line of a streaming response.
#[derive(Debug, PartialEq)]
struct Event {
    text: String,
    done: bool,
}

fn parse_llama_line(line: &str) -> Result<Option<Event>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let chunk: LlamaChunk = serde_json::from_str(data)?;
    Ok(Some(Event {
        text: chunk.content,
        done: chunk.stop,
    }))
}

fn parse_ollama_line(line: &str) -> Result<Option<Event>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        bail!("Ollama generate error: {}", error);
    }
    Ok(Some(Event {
        text: chunk.response,
        done: chunk.done,
    }))
}

/// Splits a byte stream into lines without assuming chunk boundaries line
/// up with newlines.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            );
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        Some(rest)
    }
}

/// Read `response` line by line and forward decoded fragments into `tx`.
async fn pump(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<String>>,
    parse: fn(&str) -> Result<Option<Event>>,
) {
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();

    loop {
        let (pending, finished) = match body.next().await {
            Some(Ok(bytes)) => (lines.push(&bytes), false),
            Some(Err(e)) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
            None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in pending {
            match parse(&line) {
                Ok(Some(event)) => {
                    if !event.text.is_empty() && tx.send(Ok(event.text)).await.is_err() {
                        debug!("generation receiver dropped; stopping producer");
                        return;
                    }
                    if event.done {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if finished || tx.is_closed() {
            return;
        }
    }
}

// ============ Exclusive access ============

/// The single lock in front of the generation backend.
#[derive(Clone)]
pub struct GenerationGate {
    lock: Arc<Mutex<()>>,
    backend: Arc<dyn CompletionBackend>,
}

impl GenerationGate {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            backend,
        }
    }

    /// Take the lock or fail immediately with [`StudyError::ResourceBusy`].
    pub fn try_acquire(&self) -> Result<GenerationPermit, StudyError> {
        match Arc::clone(&self.lock).try_lock_owned() {
            Ok(guard) => Ok(GenerationPermit {
                guard,
                backend: Arc::clone(&self.backend),
            }),
            Err(_) => {
                warn!("generation requested while another is running");
                Err(StudyError::ResourceBusy)
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

/// Exclusive right to run one generation.
pub struct GenerationPermit {
    guard: OwnedMutexGuard<()>,
    backend: Arc<dyn CompletionBackend>,
}

impl GenerationPermit {
    /// Start the generation. If the backend fails to start, the permit is
    /// dropped and the lock released.
    pub async fn start(self, request: CompletionRequest) -> Result<Fragments, StudyError> {
        info!(
            backend = self.backend.name(),
            max_tokens = request.max_tokens,
            "starting generation"
        );
        let rx = self.backend.start(request).await?;
        Ok(Fragments {
            rx,
            guard: self.guard,
        })
    }
}

/// A running generation. Holds the lock until dropped.
pub struct Fragments {
    rx: mpsc::Receiver<Result<String>>,
    guard: OwnedMutexGuard<()>,
}

impl Fragments {
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Accumulate the whole generation.
    pub async fn collect(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        debug!(chars = text.len(), "generation finished");
        Ok(text)
    }

    /// Forward fragments to the returned stream one at a time.
    ///
    /// Before forwarding each fragment the consumer checks the caller is
    /// still attached. Once the backend finishes, the lock is released and
    /// `on_complete` receives the accumulated text; the returned stream ends
    /// only after `on_complete` has run. A detached caller or a backend
    /// error abandons the generation and `on_complete` is never called.
    pub fn forward<F>(self, on_complete: F) -> TextStream
    where
        F: FnOnce(String) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let Fragments {
            rx: mut source,
            guard,
        } = self;

        tokio::spawn(async move {
            let mut full = String::new();
            loop {
                let fragment = tokio::select! {
                    fragment = source.recv() => fragment,
                    _ = tx.closed() => {
                        info!("caller disconnected; abandoning generation");
                        return;
                    }
                };
                match fragment {
                    Some(Ok(text)) => {
                        if tx.is_closed() {
                            info!("caller disconnected; abandoning generation");
                            return;
                        }
                        full.push_str(&text);
                        if tx.send(Ok(text)).await.is_err() {
                            info!("caller disconnected; abandoning generation");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "generation failed");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => break,
                }
            }
            drop(source);
            drop(guard);
            on_complete(full);
        });

        TextStream {
            inner: StreamInner::Live(rx),
        }
    }
}

/// A reply as seen by callers: a live generation or a ready-made text
/// (cache hit or fallback).
pub struct TextStream {
    inner: StreamInner,
}

enum StreamInner {
    Ready(Option<String>),
    Live(mpsc::Receiver<Result<String>>),
}

impl TextStream {
    pub fn ready(text: impl Into<String>) -> Self {
        Self {
            inner: StreamInner::Ready(Some(text.into())),
        }
    }

    /// Whether the reply was served without generating.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, StreamInner::Ready(_))
    }

    pub async fn next(&mut self) -> Option<Result<String>> {
        match &mut self.inner {
            StreamInner::Ready(text) => text.take().map(Ok),
            StreamInner::Live(rx) => rx.recv().await,
        }
    }

    pub async fn collect(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send + 'static {
        futures::stream::unfold(self, |mut s| async move {
            let item = s.next().await?;
            Some((item, s))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptBackend {
        fragments: Vec<&'static str>,
    }

    #[async_trait]
    impl CompletionBackend for ScriptBackend {
        fn name(&self) -> &str {
            "script"
        }
        async fn start(&self, _req: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
            let (tx, rx) = mpsc::channel(1);
            let fragments = self.fragments.clone();
            tokio::spawn(async move {
                for f in fragments {
                    if tx.send(Ok(f.to_string())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Emits fragments until nobody listens, then records that it stopped.
    struct EndlessBackend {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CompletionBackend for EndlessBackend {
        fn name(&self) -> &str {
            "endless"
        }
        async fn start(&self, _req: CompletionRequest) -> Result<mpsc::Receiver<Result<String>>> {
            let (tx, rx) = mpsc::channel(1);
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                while tx.send(Ok("tick ".to_string())).await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                stopped.store(true, Ordering::SeqCst);
            });
            Ok(rx)
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "p".into(),
            max_tokens: 10,
            stop: vec![],
            temperature: None,
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let gate = GenerationGate::new(Arc::new(ScriptBackend { fragments: vec![] }));
        let permit = gate.try_acquire().unwrap();
        assert!(gate.is_busy());
        assert!(matches!(gate.try_acquire(), Err(StudyError::ResourceBusy)));
        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_collect_accumulates_and_releases() {
        let gate = GenerationGate::new(Arc::new(ScriptBackend {
            fragments: vec!["Hel", "lo", "!"],
        }));
        let fragments = gate.try_acquire().unwrap().start(request()).await.unwrap();
        assert!(gate.is_busy());
        assert_eq!(fragments.collect().await.unwrap(), "Hello!");
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_forward_preserves_order_and_completes() {
        let gate = GenerationGate::new(Arc::new(ScriptBackend {
            fragments: vec!["a", "b", "c"],
        }));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let fragments = gate.try_acquire().unwrap().start(request()).await.unwrap();
        let mut stream = fragments.forward(move |full| {
            let _ = done_tx.send(full);
        });

        let mut seen = Vec::new();
        while let Some(f) = stream.next().await {
            seen.push(f.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(done_rx.await.unwrap(), "abc");
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_dropped_stream_abandons_generation() {
        let stopped = Arc::new(AtomicBool::new(false));
        let gate = GenerationGate::new(Arc::new(EndlessBackend {
            stopped: stopped.clone(),
        }));
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();

        let fragments = gate.try_acquire().unwrap().start(request()).await.unwrap();
        let mut stream = fragments.forward(move |_| flag.store(true, Ordering::SeqCst));
        assert_eq!(stream.next().await.unwrap().unwrap(), "tick ");
        drop(stream);

        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) && !gate.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!gate.is_busy());
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disabled_backend_releases_lock() {
        let gate = GenerationGate::new(Arc::new(DisabledBackend));
        let err = gate.try_acquire().unwrap().start(request()).await;
        assert!(matches!(err, Err(StudyError::Other(_))));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_ready_stream() {
        let stream = TextStream::ready("cached");
        assert!(stream.is_ready());
        assert_eq!(stream.collect().await.unwrap(), "cached");

        let items: Vec<String> = TextStream::ready("x")
            .into_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["x"]);
    }

    #[test]
    fn test_line_buffer_handles_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"con").is_empty());
        let lines = buf.push(b"tent\": \"hi\"}\r\ndata: {}\n");
        assert_eq!(lines, vec!["data: {\"content\": \"hi\"}", "data: {}"]);
        assert!(buf.push(b"tail").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("tail"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_parse_llama_lines() {
        assert_eq!(
            parse_llama_line("data: {\"content\": \"Hi\", \"stop\": false}").unwrap(),
            Some(Event {
                text: "Hi".into(),
                done: false
            })
        );
        assert_eq!(
            parse_llama_line("data: {\"content\": \"\", \"stop\": true}").unwrap(),
            Some(Event {
                text: String::new(),
                done: true
            })
        );
        assert_eq!(parse_llama_line(": keep-alive").unwrap(), None);
        assert!(parse_llama_line("data: {broken").is_err());
    }

    #[test]
    fn test_parse_ollama_lines() {
        assert_eq!(
            parse_ollama_line("{\"response\": \"ok\", \"done\": false}").unwrap(),
            Some(Event {
                text: "ok".into(),
                done: false
            })
        );
        assert_eq!(parse_ollama_line("   ").unwrap(), None);
        assert!(parse_ollama_line("{\"error\": \"model not found\"}").is_err());
    }
}
