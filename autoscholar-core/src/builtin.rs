//! Built-in collaborators that need no external service.

use crate::collaborator::{
    ProductionOutput, Reflector, ResearchTask, Scorer, Synthesizer, Verification, Verifier,
};
use crate::error::{Error, Result};
use crate::knowledge::{KnowledgeEntry, KnowledgeStore, SessionMetrics};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Summaries at least this long earn the length bonus.
const SUBSTANTIAL_SUMMARY_CHARS: usize = 200;

/// Scores a result by the producer's own quality hint.
///
/// Without a hint the score is estimated from the number of sources and the
/// length of the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityHintScorer;

impl QualityHintScorer {
    fn estimate(result: &ProductionOutput) -> f64 {
        let sourced = (result.sources.len().min(3) as f64) * 0.1;
        let substantial = if result.summary.chars().count() >= SUBSTANTIAL_SUMMARY_CHARS {
            0.3
        } else {
            0.0
        };
        0.4 + sourced + substantial
    }
}

#[async_trait]
impl Scorer for QualityHintScorer {
    async fn score(&self, _task: &ResearchTask, result: &ProductionOutput) -> f64 {
        result
            .quality_hint
            .unwrap_or_else(|| Self::estimate(result))
    }
}

/// Passes an entry when it is stored with non-empty content and a source.
#[derive(Debug, Clone)]
pub struct StoredEntryVerifier {
    store: Arc<KnowledgeStore>,
}

impl StoredEntryVerifier {
    /// Create a verifier reading from `store`.
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Verifier for StoredEntryVerifier {
    async fn verify(&self, entry_id: Uuid) -> Result<Verification> {
        let entry = self
            .store
            .get(entry_id)
            .ok_or_else(|| Error::verification(format!("entry {entry_id} is not stored")))?;

        let verification = if entry.content.trim().is_empty() {
            Verification {
                passed: false,
                details: "entry has no content".to_string(),
            }
        } else if entry.source.trim().is_empty() {
            Verification {
                passed: false,
                details: "entry has no source".to_string(),
            }
        } else {
            Verification {
                passed: true,
                details: format!("sourced from {}", entry.source),
            }
        };
        Ok(verification)
    }
}

/// Digests the first line of each entry sharing a tag.
///
/// Returns nothing for fewer than two entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSynthesizer;

#[async_trait]
impl Synthesizer for DigestSynthesizer {
    async fn synthesize(&self, topic: &str, entries: &[KnowledgeEntry]) -> Result<Option<String>> {
        if entries.len() < 2 {
            return Ok(None);
        }
        let mut digest = format!("Synthesis of '{topic}' across {} entries:", entries.len());
        for entry in entries {
            let headline = entry.content.lines().next().unwrap_or_default().trim();
            digest.push_str(&format!("\n- [{}] {}", entry.topic, headline));
        }
        Ok(Some(digest))
    }
}

/// Derives improvement suggestions from session counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsReflector;

#[async_trait]
impl Reflector for MetricsReflector {
    async fn reflect(&self, metrics: &SessionMetrics) -> Result<Vec<String>> {
        let mut suggestions = Vec::new();
        if metrics.tasks_failed > 0 {
            suggestions.push(format!(
                "{} of {} tasks failed; check the producer",
                metrics.tasks_failed,
                metrics.tasks_completed + metrics.tasks_failed
            ));
        }
        if metrics.verifications_passed < metrics.tasks_completed {
            suggestions.push(format!(
                "{} stored entries failed verification; require sources",
                metrics.tasks_completed - metrics.verifications_passed
            ));
        }
        if !metrics.knowledge_gaps.is_empty() {
            suggestions.push(format!(
                "open knowledge gaps: {}",
                metrics.knowledge_gaps.join(", ")
            ));
        }
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::TaskOrigin;

    fn output(hint: Option<f64>, sources: usize, summary_len: usize) -> ProductionOutput {
        ProductionOutput {
            summary: "x".repeat(summary_len),
            sources: (0..sources).map(|i| format!("source {i}")).collect(),
            tags: vec![],
            quality_hint: hint,
        }
    }

    #[tokio::test]
    async fn test_scorer_prefers_hint() {
        let task = ResearchTask::new("rl", TaskOrigin::Gap);
        assert_eq!(QualityHintScorer.score(&task, &output(Some(0.25), 3, 500)).await, 0.25);

        let bare = QualityHintScorer.score(&task, &output(None, 0, 10)).await;
        let rich = QualityHintScorer.score(&task, &output(None, 5, 500)).await;
        assert!((bare - 0.4).abs() < 1e-9);
        assert!((rich - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_verifier_checks_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnowledgeStore::open(dir.path()).unwrap());
        let sourced = store
            .add_entry("rl", "policy gradients", Vec::new(), "arxiv")
            .unwrap();
        let unsourced = store.add_entry("rl", "q-learning", Vec::new(), "").unwrap();

        let verifier = StoredEntryVerifier::new(store);
        assert!(verifier.verify(sourced.id).await.unwrap().passed);
        assert!(!verifier.verify(unsourced.id).await.unwrap().passed);
        assert!(matches!(
            verifier.verify(Uuid::now_v7()).await,
            Err(Error::Verification { .. })
        ));
    }

    #[tokio::test]
    async fn test_digest_needs_two_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path()).unwrap();
        let a = store
            .add_entry("rl", "first line\nmore", vec!["ml".to_string()], "a")
            .unwrap();
        let b = store
            .add_entry("rag", "retrieval", vec!["ml".to_string()], "b")
            .unwrap();

        assert_eq!(DigestSynthesizer.synthesize("ml", &[a.clone()]).await.unwrap(), None);
        let digest = DigestSynthesizer
            .synthesize("ml", &[a, b])
            .await
            .unwrap()
            .unwrap();
        assert!(digest.contains("across 2 entries"));
        assert!(digest.contains("- [rl] first line"));
        assert!(!digest.contains("more"));
    }

    #[tokio::test]
    async fn test_reflector_suggestions() {
        let mut metrics = SessionMetrics::new("s");
        assert!(MetricsReflector.reflect(&metrics).await.unwrap().is_empty());

        metrics.tasks_completed = 2;
        metrics.tasks_failed = 1;
        metrics.verifications_passed = 1;
        metrics.knowledge_gaps = vec!["tool use".to_string()];
        let suggestions = MetricsReflector.reflect(&metrics).await.unwrap();
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions[0].starts_with("1 of 3 tasks failed"));
    }
}
