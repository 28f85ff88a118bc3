//! External model calls: embeddings and per-cluster resolution decisions.
//!
//! The engines depend only on the [`Embedder`] and [`ResolutionDecider`]
//! traits. [`BridgeClient`] implements both by spawning the model bridge
//! subprocess and exchanging JSON lines over its stdin/stdout;
//! [`CachedEmbedder`] puts the storage embedding cache in front of any
//! embedder.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use docgraph_shared::{
    BridgeConfig, DocGraphError, EntityCluster, EntityDecision, Result, SimilarEntity,
};
use docgraph_storage::Storage;

use crate::tracker::{CallKind, CallRecord, CallTracker};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Turns texts into vectors, one per input, in input order.
///
/// Calls are synchronous and block the calling task until the model
/// answers. [`BridgeClient`] serializes requests over one pipe, so stages
/// joined on the same task overlap only on storage I/O, never on model calls.
pub trait Embedder: Send + Sync {
    /// Model name, part of the embedding cache key.
    fn model(&self) -> &str;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Proposes a decision for every mention of a cluster.
///
/// Blocking, like [`Embedder::embed`].
pub trait ResolutionDecider: Send + Sync {
    fn decide(
        &self,
        cluster: &EntityCluster,
        similar_existing: &[SimilarEntity],
    ) -> Result<Vec<EntityDecision>>;
}

// ---------------------------------------------------------------------------
// Embedding cache
// ---------------------------------------------------------------------------

/// Cache key for one text under one model.
pub fn embedding_hash(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// An embedder backed by the storage embedding cache.
///
/// Cache misses go to the inner embedder in a single call. Must not be used
/// while a graph transaction is open, since cache writes take the write lock.
pub struct CachedEmbedder<'a> {
    storage: &'a Storage,
    inner: &'a dyn Embedder,
}

impl<'a> CachedEmbedder<'a> {
    pub fn new(storage: &'a Storage, inner: &'a dyn Embedder) -> Self {
        Self { storage, inner }
    }

    /// Embed `texts`, reusing cached vectors. `stage` labels log lines.
    pub async fn embed(&self, texts: &[String], stage: &str) -> Result<Vec<Vec<f32>>> {
        let model = self.inner.model();
        let hashes: Vec<String> = texts.iter().map(|t| embedding_hash(model, t)).collect();

        let mut found: HashMap<String, Vec<f32>> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        let mut miss_hashes: Vec<String> = Vec::new();
        for (text, hash) in texts.iter().zip(&hashes) {
            if found.contains_key(hash) || miss_hashes.contains(hash) {
                continue;
            }
            match self.storage.get_embedding(hash).await? {
                Some(vector) => {
                    found.insert(hash.clone(), vector);
                }
                None => {
                    misses.push(text.clone());
                    miss_hashes.push(hash.clone());
                }
            }
        }

        let cache_hits = found.len();
        if !misses.is_empty() {
            let vectors = self.inner.embed(&misses)?;
            if vectors.len() != misses.len() {
                return Err(DocGraphError::Bridge(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    misses.len()
                )));
            }
            for (hash, vector) in miss_hashes.into_iter().zip(vectors) {
                self.storage.set_embedding(&hash, model, &vector).await?;
                found.insert(hash, vector);
            }
        }

        debug!(stage, texts = texts.len(), cache_hits, misses = misses.len(), "embedded texts");

        hashes
            .iter()
            .map(|hash| {
                found
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| DocGraphError::Bridge("missing embedding after fetch".into()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// A cluster member as sent to the decision model.
#[derive(Debug, Clone, serde::Serialize)]
struct ClusterEntity<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    entity_type: &'a str,
    description: &'a str,
    aliases: &'a [String],
    document_id: &'a str,
}

/// Request message sent to the bridge.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "embed")]
    Embed {
        id: String,
        model: &'a str,
        texts: &'a [String],
    },
    #[serde(rename = "resolve")]
    Resolve {
        id: String,
        model: &'a str,
        cluster_id: i64,
        entities: Vec<ClusterEntity<'a>>,
        similar_existing: &'a [SimilarEntity],
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: BridgeResult },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

/// Payload of a successful bridge call.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BridgeResult {
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub decisions: Vec<EntityDecision>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the spawned bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(cmd = %config.command, script = %config.script, "spawning model bridge");

        let mut command = Command::new(&config.command);
        command
            .arg("run")
            .arg(&config.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if !config.working_dir.is_empty() {
            command.current_dir(&config.working_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            DocGraphError::Bridge(format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DocGraphError::Bridge("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DocGraphError::Bridge("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready()?;
        Ok(handle)
    }

    fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| DocGraphError::Bridge(format!("bridge read error: {e}")))?;
        if line.is_empty() {
            return Err(DocGraphError::Bridge("bridge closed stdout unexpectedly".into()));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.chars().take(200).collect();
            DocGraphError::Bridge(format!("invalid bridge message: {e} (got: {preview})"))
        })
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message()? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(DocGraphError::Bridge(format!(
                "expected ready message, got: {other:?}"
            ))),
        }
    }

    fn next_id(&mut self) -> String {
        self.request_counter += 1;
        format!("req-{}", self.request_counter)
    }

    fn send(&mut self, request: &RequestMessage<'_>) -> Result<BridgeResult> {
        let json = serde_json::to_string(request)
            .map_err(|e| DocGraphError::Bridge(format!("failed to serialize request: {e}")))?;

        writeln!(self.stdin, "{json}")
            .map_err(|e| DocGraphError::Bridge(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .map_err(|e| DocGraphError::Bridge(format!("failed to flush bridge stdin: {e}")))?;

        match self.read_message()? {
            ResponseMessage::Result { id, result } => {
                debug!(%id, model = %result.model, latency_ms = result.latency_ms, "bridge result");
                Ok(result)
            }
            ResponseMessage::Error { error, .. } => Err(DocGraphError::Bridge(error)),
            ResponseMessage::Ready => Err(DocGraphError::Bridge(
                "unexpected ready message during request".into(),
            )),
        }
    }

    fn shutdown(mut self) {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }
        match self.child.wait() {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Embedding and decision calls over the bridge subprocess.
///
/// Requests are serialized over one pipe; every call is recorded in the
/// process-wide [`CallTracker`].
pub struct BridgeClient {
    handle: Mutex<Option<BridgeHandle>>,
    embedding_model: String,
    decision_model: String,
    tracker: &'static CallTracker,
}

impl BridgeClient {
    pub fn spawn(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            handle: Mutex::new(Some(BridgeHandle::spawn(config)?)),
            embedding_model: config.embedding_model.clone(),
            decision_model: config.decision_model.clone(),
            tracker: CallTracker::global(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<BridgeHandle>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn call<'r>(
        &self,
        kind: CallKind,
        stage: &str,
        items: usize,
        request: impl FnOnce(String) -> RequestMessage<'r>,
    ) -> Result<BridgeResult> {
        let mut guard = self.lock();
        let handle = guard
            .as_mut()
            .ok_or_else(|| DocGraphError::Bridge("bridge already shut down".into()))?;
        let id = handle.next_id();
        let started = std::time::Instant::now();
        let outcome = handle.send(&request(id));
        drop(guard);

        let model = match kind {
            CallKind::Embedding => &self.embedding_model,
            CallKind::Completion => &self.decision_model,
        };
        let mut record = CallRecord::new(kind, model.as_str(), stage)
            .items(items)
            .took(started.elapsed());
        match &outcome {
            Ok(result) => {
                if result.latency_ms > 0 {
                    record = record.took(Duration::from_millis(result.latency_ms));
                }
                record = record.tokens(result.tokens_in, result.tokens_out);
            }
            Err(e) => error!(kind = kind.as_str(), error = %e, "bridge call failed"),
        }
        self.tracker.record(record);
        outcome
    }

    /// Send shutdown and wait for the subprocess to exit.
    pub fn shutdown(&self) {
        if let Some(handle) = self.lock().take() {
            handle.shutdown();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Embedder for BridgeClient {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.embedding_model.as_str();
        let result = self.call(CallKind::Embedding, "embed", texts.len(), |id| {
            RequestMessage::Embed { id, model, texts }
        })?;
        Ok(result.embeddings)
    }
}

impl ResolutionDecider for BridgeClient {
    fn decide(
        &self,
        cluster: &EntityCluster,
        similar_existing: &[SimilarEntity],
    ) -> Result<Vec<EntityDecision>> {
        let model = self.decision_model.as_str();
        let entities: Vec<ClusterEntity<'_>> = cluster
            .members
            .iter()
            .map(|m| ClusterEntity {
                name: &m.name,
                entity_type: &m.entity_type,
                description: &m.description,
                aliases: &m.aliases,
                document_id: &m.document_id,
            })
            .collect();
        let result = self.call(CallKind::Completion, "resolve", cluster.size(), |id| {
            RequestMessage::Resolve {
                id,
                model,
                cluster_id: cluster.cluster_id,
                entities,
                similar_existing,
            }
        })?;
        Ok(result.decisions)
    }
}
