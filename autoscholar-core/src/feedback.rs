//! Human review queue.
//!
//! Items enter `pending` and move exactly once to `approved` or `rejected`.
//! All three partitions live in one JSON document, so a review's "insert into
//! destination" and "remove from pending" are committed by a single atomic
//! file replacement.

use crate::error::{Error, Result};
use crate::persist::{ensure_dir, load_or_default, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

const FEEDBACK_FILE: &str = "feedback.json";

/// Rating assumed for approved items reviewed without one.
pub const DEFAULT_RATING: u8 = 3;

/// Number of corrections reported by `learn_from_approved`.
const MAX_REPORTED_CORRECTIONS: usize = 5;

/// Review state of a feedback item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    /// Awaiting review.
    Pending,
    /// Accepted by a reviewer.
    Approved,
    /// Refused by a reviewer.
    Rejected,
}

impl std::fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackStatus::Pending => write!(f, "pending"),
            FeedbackStatus::Approved => write!(f, "approved"),
            FeedbackStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// An item awaiting or having received human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    /// Unique id.
    pub id: Uuid,
    /// What kind of output this is (e.g. "research").
    #[serde(rename = "type")]
    pub kind: String,
    /// The content under review.
    pub content: String,
    /// Producer confidence in [0, 1].
    pub confidence: f64,
    /// Current review state.
    pub status: FeedbackStatus,
    /// When the item was queued.
    pub created_at: DateTime<Utc>,
    /// When the item was reviewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Who reviewed the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    /// Reviewer comments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Reviewer corrections to the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrections: Option<String>,
    /// Rating from 1 to 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
}

/// Input for queueing a new item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    /// What kind of output this is.
    pub kind: String,
    /// The content under review.
    pub content: String,
    /// Producer confidence in [0, 1].
    pub confidence: f64,
}

impl NewFeedback {
    /// Create a new feedback submission.
    pub fn new(kind: impl Into<String>, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            confidence,
        }
    }
}

/// A reviewer's verdict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Review {
    /// Whether the item is approved.
    pub approved: bool,
    /// Who reviewed the item.
    pub reviewer: Option<String>,
    /// Free-form comments.
    pub comments: Option<String>,
    /// Corrected content.
    pub corrections: Option<String>,
    /// Rating from 1 to 5.
    pub rating: Option<u8>,
}

impl Review {
    /// An approving review.
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    /// A rejecting review.
    pub fn reject() -> Self {
        Self::default()
    }

    /// Set the reviewer.
    pub fn reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }

    /// Set the comments.
    pub fn comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Set the corrections.
    pub fn corrections(mut self, corrections: impl Into<String>) -> Self {
        self.corrections = Some(corrections.into());
        self
    }

    /// Set the rating.
    pub fn rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Aggregates learned from reviewed items.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    /// Number of approved items.
    pub approved_count: usize,
    /// Number of rejected items.
    pub rejected_count: usize,
    /// `approved / (approved + rejected)`, 0 when nothing has been reviewed.
    pub approval_rate: f64,
    /// Mean rating of approved items, 0 when none exist.
    pub avg_rating: f64,
    /// Most recent corrections attached to approved items, newest first.
    pub common_corrections: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FeedbackDoc {
    pending: Vec<FeedbackItem>,
    approved: Vec<FeedbackItem>,
    rejected: Vec<FeedbackItem>,
}

/// The feedback queue.
#[derive(Debug)]
pub struct FeedbackQueue {
    path: PathBuf,
    state: Mutex<FeedbackDoc>,
}

impl FeedbackQueue {
    /// Open (or create) a queue rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` or `Error::Serialization` if the queue file
    /// cannot be loaded.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        ensure_dir(root)?;
        let path = root.join(FEEDBACK_FILE);
        let doc: FeedbackDoc = load_or_default(&path)?;
        debug!(pending = doc.pending.len(), "opened feedback queue");
        Ok(Self {
            path,
            state: Mutex::new(doc),
        })
    }

    /// Close the queue.
    pub fn close(self) {
        debug!(path = %self.path.display(), "closed feedback queue");
    }

    fn lock(&self) -> MutexGuard<'_, FeedbackDoc> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a new pending item. Identical content queued twice yields two
    /// distinct items.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the queue could not be written.
    pub fn queue_for_review(&self, item: NewFeedback) -> Result<FeedbackItem> {
        let queued = FeedbackItem {
            id: Uuid::now_v7(),
            kind: item.kind,
            content: item.content,
            confidence: item.confidence,
            status: FeedbackStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
            reviewer: None,
            comments: None,
            corrections: None,
            rating: None,
        };

        let mut state = self.lock();
        let mut next = state.clone();
        next.pending.push(queued.clone());
        write_atomic(&self.path, &next)?;
        *state = next;

        info!(id = %queued.id, confidence = queued.confidence, "queued item for review");
        Ok(queued)
    }

    /// Queue every item whose confidence is below `threshold`.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; items queued before it stay queued.
    pub fn auto_queue(
        &self,
        items: impl IntoIterator<Item = NewFeedback>,
        threshold: f64,
    ) -> Result<Vec<FeedbackItem>> {
        items
            .into_iter()
            .filter(|item| item.confidence < threshold)
            .map(|item| self.queue_for_review(item))
            .collect()
    }

    /// Move a pending item to `approved` or `rejected`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `id` is not pending (unknown or already
    /// reviewed), `Error::InvalidState` for a rating outside 1-5, and
    /// `Error::Storage` if the transition could not be written; in every
    /// error case nothing changes.
    pub fn submit_review(&self, id: Uuid, review: Review) -> Result<FeedbackItem> {
        if let Some(rating) = review.rating {
            if !(1..=5).contains(&rating) {
                return Err(Error::invalid_state(format!(
                    "rating must be between 1 and 5, got {rating}"
                )));
            }
        }

        let mut state = self.lock();
        let mut next = state.clone();
        let idx = next
            .pending
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| Error::not_found("pending feedback item", id.to_string()))?;

        let mut item = next.pending.remove(idx);
        item.status = if review.approved {
            FeedbackStatus::Approved
        } else {
            FeedbackStatus::Rejected
        };
        item.reviewed_at = Some(Utc::now());
        item.reviewer = review.reviewer;
        item.comments = review.comments;
        item.corrections = review.corrections;
        item.rating = review.rating;

        if review.approved {
            next.approved.push(item.clone());
        } else {
            next.rejected.push(item.clone());
        }
        write_atomic(&self.path, &next)?;
        *state = next;

        info!(id = %item.id, status = %item.status, "recorded review");
        Ok(item)
    }

    /// Look up an item in any partition.
    pub fn get(&self, id: Uuid) -> Option<FeedbackItem> {
        let state = self.lock();
        state
            .pending
            .iter()
            .chain(&state.approved)
            .chain(&state.rejected)
            .find(|item| item.id == id)
            .cloned()
    }

    /// Pending items, oldest first.
    pub fn pending(&self) -> Vec<FeedbackItem> {
        self.lock().pending.clone()
    }

    /// Approved items, in review order.
    pub fn approved(&self) -> Vec<FeedbackItem> {
        self.lock().approved.clone()
    }

    /// Rejected items, in review order.
    pub fn rejected(&self) -> Vec<FeedbackItem> {
        self.lock().rejected.clone()
    }

    /// Aggregate approval rate, ratings and corrections.
    pub fn learn_from_approved(&self) -> Insights {
        let state = self.lock();
        let approved_count = state.approved.len();
        let rejected_count = state.rejected.len();
        let reviewed = approved_count + rejected_count;

        let approval_rate = if reviewed == 0 {
            0.0
        } else {
            approved_count as f64 / reviewed as f64
        };

        let avg_rating = if approved_count == 0 {
            0.0
        } else {
            state
                .approved
                .iter()
                .map(|item| f64::from(item.rating.unwrap_or(DEFAULT_RATING)))
                .sum::<f64>()
                / approved_count as f64
        };

        let common_corrections = state
            .approved
            .iter()
            .rev()
            .filter_map(|item| item.corrections.clone())
            .take(MAX_REPORTED_CORRECTIONS)
            .collect();

        Insights {
            approved_count,
            rejected_count,
            approval_rate,
            avg_rating,
            common_corrections,
        }
    }
}
