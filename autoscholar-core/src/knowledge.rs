//! Durable knowledge store.
//!
//! Holds knowledge entries with a running topic index, the session metrics
//! log and the evaluation log. Each log lives in its own JSON document under
//! the store root and is rewritten atomically on every mutation; a failed
//! write leaves both the file and the in-memory state untouched.

use crate::error::{Error, Result};
use crate::persist::{ensure_dir, load_or_default, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

const KNOWLEDGE_FILE: &str = "knowledge.json";
const METRICS_FILE: &str = "metrics.json";
const EVALUATION_FILE: &str = "evaluation.json";

/// Score reported by `similarity_search` when no ranking backend is available.
pub const UNRANKED_SCORE: f32 = 1.0;

/// A persisted finding keyed by topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    /// Time-ordered unique id.
    pub id: Uuid,
    /// Topic the entry belongs to.
    pub topic: String,
    /// Free-text content.
    pub content: String,
    /// Tags attached at creation.
    pub tags: BTreeSet<String>,
    /// Where the content came from.
    pub source: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether a verifier has confirmed the entry.
    pub verified: bool,
}

impl KnowledgeEntry {
    fn matches(&self, needle: &str) -> bool {
        self.topic.to_lowercase().contains(needle)
            || self.content.to_lowercase().contains(needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// Counters collected over one orchestrated session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    /// Name of the session.
    pub session_name: String,
    /// Tasks whose produce step succeeded.
    pub tasks_completed: u32,
    /// Tasks whose produce step failed.
    pub tasks_failed: u32,
    /// Entries the verifier passed.
    pub verifications_passed: u32,
    /// Wall-clock time spent in the task loop.
    pub research_time_seconds: f64,
    /// Gaps identified when the session started.
    pub knowledge_gaps: Vec<String>,
}

impl SessionMetrics {
    /// Empty metrics for a new session.
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            ..Self::default()
        }
    }
}

/// A session's metrics as appended to the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// When the record was appended.
    pub recorded_at: DateTime<Utc>,
    /// The session's metrics.
    #[serde(flatten)]
    pub metrics: SessionMetrics,
}

/// A scored pipeline result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    /// Entry that was scored.
    pub entry_id: Uuid,
    /// Topic of the scored entry.
    pub topic: String,
    /// Score in [0, 1].
    pub score: f64,
    /// When the score was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStats {
    /// Number of knowledge entries.
    pub count: usize,
    /// Number of recorded sessions.
    pub session_count: usize,
    /// Mean evaluation score, 0 when nothing has been scored.
    pub avg_score: f64,
    /// Reference topics not yet covered.
    pub gaps: Vec<String>,
}

/// Ranks entries by similarity to a query.
///
/// Returning `None` means the backend is unavailable; the store then falls
/// back to keyword search.
pub trait SimilarityBackend: Send + Sync {
    /// Return up to `k` `(index into entries, score)` pairs, best first.
    fn rank(&self, query: &str, entries: &[KnowledgeEntry], k: usize) -> Option<Vec<(usize, f32)>>;
}

/// Jaccard overlap between lowercase word sets of the query and each entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenOverlap;

fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SimilarityBackend for TokenOverlap {
    fn rank(&self, query: &str, entries: &[KnowledgeEntry], k: usize) -> Option<Vec<(usize, f32)>> {
        let query_words = word_set(query);
        if query_words.is_empty() {
            return Some(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let mut words = word_set(&entry.topic);
                words.extend(word_set(&entry.content));
                words.extend(entry.tags.iter().flat_map(|t| word_set(t)));
                let shared = query_words.intersection(&words).count();
                if shared == 0 {
                    return None;
                }
                let union = query_words.union(&words).count();
                Some((idx, shared as f32 / union as f32))
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Some(scored)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnowledgeDoc {
    entries: Vec<KnowledgeEntry>,
    /// Lowercased topic → entry ids, in insertion order.
    topics: BTreeMap<String, Vec<Uuid>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricTotals {
    sessions: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    verifications_passed: u64,
    research_time_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetricsDoc {
    sessions: Vec<SessionRecord>,
    totals: MetricTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EvaluationDoc {
    events: Vec<EvaluationEvent>,
}

#[derive(Debug)]
struct StoreState {
    knowledge: KnowledgeDoc,
    metrics: MetricsDoc,
    evaluation: EvaluationDoc,
}

/// The knowledge store.
pub struct KnowledgeStore {
    root: PathBuf,
    reference_topics: Vec<String>,
    similarity: Option<Arc<dyn SimilarityBackend>>,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("root", &self.root)
            .field("has_similarity", &self.similarity.is_some())
            .finish()
    }
}

impl KnowledgeStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the directory cannot be created or a log
    /// cannot be read, and `Error::Serialization` if a log is corrupt.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root)?;

        let state = StoreState {
            knowledge: load_or_default(&root.join(KNOWLEDGE_FILE))?,
            metrics: load_or_default(&root.join(METRICS_FILE))?,
            evaluation: load_or_default(&root.join(EVALUATION_FILE))?,
        };
        debug!(
            root = %root.display(),
            entries = state.knowledge.entries.len(),
            sessions = state.metrics.sessions.len(),
            "opened knowledge store"
        );

        Ok(Self {
            root,
            reference_topics: crate::config::DEFAULT_REFERENCE_TOPICS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            similarity: None,
            state: Mutex::new(state),
        })
    }

    /// Replace the reference topic list used by `get_stats`.
    pub fn with_reference_topics(mut self, topics: Vec<String>) -> Self {
        self.reference_topics = topics;
        self
    }

    /// Attach a similarity backend.
    pub fn with_similarity(mut self, backend: Arc<dyn SimilarityBackend>) -> Self {
        self.similarity = Some(backend);
        self
    }

    /// Close the store. Every mutation is already durable, so this only
    /// releases the handle.
    pub fn close(self) {
        debug!(root = %self.root.display(), "closed knowledge store");
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and persist a new entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the entry could not be written; nothing
    /// is recorded in that case.
    pub fn add_entry(
        &self,
        topic: impl Into<String>,
        content: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        source: impl Into<String>,
    ) -> Result<KnowledgeEntry> {
        let entry = KnowledgeEntry {
            id: Uuid::now_v7(),
            topic: topic.into(),
            content: content.into(),
            tags: tags.into_iter().collect(),
            source: source.into(),
            created_at: Utc::now(),
            verified: false,
        };

        let mut state = self.lock();
        let mut next = state.knowledge.clone();
        next.topics
            .entry(entry.topic.to_lowercase())
            .or_default()
            .push(entry.id);
        next.entries.push(entry.clone());
        write_atomic(&self.root.join(KNOWLEDGE_FILE), &next)?;
        state.knowledge = next;

        info!(id = %entry.id, topic = %entry.topic, "added knowledge entry");
        Ok(entry)
    }

    /// Mark an entry as verified.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id, `Error::Storage` if the
    /// change could not be written.
    pub fn mark_verified(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let mut next = state.knowledge.clone();
        let entry = next
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::not_found("knowledge entry", id.to_string()))?;
        if entry.verified {
            return Ok(());
        }
        entry.verified = true;
        write_atomic(&self.root.join(KNOWLEDGE_FILE), &next)?;
        state.knowledge = next;
        Ok(())
    }

    /// Look up an entry by id.
    pub fn get(&self, id: Uuid) -> Option<KnowledgeEntry> {
        self.lock()
            .knowledge
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> Vec<KnowledgeEntry> {
        self.lock().knowledge.entries.clone()
    }

    /// Entries whose topic is exactly `topic` (case-insensitive).
    pub fn entries_for_topic(&self, topic: &str) -> Vec<KnowledgeEntry> {
        let state = self.lock();
        let Some(ids) = state.knowledge.topics.get(&topic.to_lowercase()) else {
            return Vec::new();
        };
        state
            .knowledge
            .entries
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over topic, content and tags.
    pub fn search(&self, query: &str) -> Vec<KnowledgeEntry> {
        let needle = query.to_lowercase();
        self.lock()
            .knowledge
            .entries
            .iter()
            .filter(|e| e.matches(&needle))
            .cloned()
            .collect()
    }

    /// Similarity-ranked search, degrading to keyword search with
    /// `UNRANKED_SCORE` when no backend is available.
    pub fn similarity_search(&self, query: &str, k: usize) -> Vec<(KnowledgeEntry, f32)> {
        if let Some(backend) = &self.similarity {
            let entries = self.entries();
            if let Some(ranked) = backend.rank(query, &entries, k) {
                return ranked
                    .into_iter()
                    .filter_map(|(idx, score)| entries.get(idx).cloned().map(|e| (e, score)))
                    .take(k)
                    .collect();
            }
            debug!("similarity backend unavailable, falling back to keyword search");
        }

        self.search(query)
            .into_iter()
            .take(k)
            .map(|e| (e, UNRANKED_SCORE))
            .collect()
    }

    /// Candidate topics not covered by any stored topic.
    pub fn identify_gaps<S: AsRef<str>>(&self, candidates: &[S]) -> Vec<String> {
        let state = self.lock();
        candidates
            .iter()
            .map(AsRef::as_ref)
            .filter(|candidate| {
                let needle = candidate.to_lowercase();
                !state.knowledge.topics.keys().any(|topic| topic.contains(&needle))
            })
            .map(String::from)
            .collect()
    }

    /// The `n` most frequent tags, ties broken alphabetically.
    pub fn top_tags(&self, n: usize) -> Vec<(String, usize)> {
        let state = self.lock();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tag in state.knowledge.entries.iter().flat_map(|e| e.tags.iter()) {
            *counts.entry(tag.as_str()).or_default() += 1;
        }

        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(tag, count)| (tag.to_string(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Append a session's metrics to the session log.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the log could not be written.
    pub fn record_session(&self, metrics: &SessionMetrics) -> Result<()> {
        let mut state = self.lock();
        let mut next = state.metrics.clone();
        next.totals.sessions += 1;
        next.totals.tasks_completed += u64::from(metrics.tasks_completed);
        next.totals.tasks_failed += u64::from(metrics.tasks_failed);
        next.totals.verifications_passed += u64::from(metrics.verifications_passed);
        next.totals.research_time_seconds += metrics.research_time_seconds;
        next.sessions.push(SessionRecord {
            recorded_at: Utc::now(),
            metrics: metrics.clone(),
        });
        write_atomic(&self.root.join(METRICS_FILE), &next)?;
        state.metrics = next;

        info!(session = %metrics.session_name, "recorded session metrics");
        Ok(())
    }

    /// Append a score to the evaluation log.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the log could not be written.
    pub fn record_evaluation(&self, entry: &KnowledgeEntry, score: f64) -> Result<()> {
        let mut state = self.lock();
        let mut next = state.evaluation.clone();
        next.events.push(EvaluationEvent {
            entry_id: entry.id,
            topic: entry.topic.clone(),
            score,
            timestamp: Utc::now(),
        });
        write_atomic(&self.root.join(EVALUATION_FILE), &next)?;
        state.evaluation = next;
        Ok(())
    }

    /// The session log, oldest first.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().metrics.sessions.clone()
    }

    /// Aggregate statistics.
    pub fn get_stats(&self) -> KnowledgeStats {
        let gaps = self.identify_gaps(&self.reference_topics);
        let state = self.lock();
        let events = &state.evaluation.events;
        let avg_score = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.score).sum::<f64>() / events.len() as f64
        };

        KnowledgeStats {
            count: state.knowledge.entries.len(),
            session_count: state.metrics.sessions.len(),
            avg_score,
            gaps,
        }
    }
}
