use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Latest recall outcome of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecallState {
    Mastered,
    NeedsReview,
}

impl RecallState {
    pub fn from_outcome(passed: bool) -> Self {
        if passed {
            RecallState::Mastered
        } else {
            RecallState::NeedsReview
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecallState::Mastered => "mastered",
            RecallState::NeedsReview => "needs_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mastered" => Some(RecallState::Mastered),
            "needs_review" => Some(RecallState::NeedsReview),
            _ => None,
        }
    }
}

/// A unit of knowledge under spaced repetition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewTopic {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub interval_days: u32,
    pub ease_factor: f64,
    pub reviews_completed: u32,
    pub next_review_date: DateTime<Utc>,
    pub recall_state: RecallState,
    pub created_at: DateTime<Utc>,
}

impl ReviewTopic {
    /// A topic entering spaced review for the first time. It is due immediately.
    pub fn new(id: String, title: String, content: Option<String>, initial_ease: f64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            content,
            interval_days: 0,
            ease_factor: initial_ease,
            reviews_completed: 0,
            next_review_date: now,
            recall_state: RecallState::NeedsReview,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_date <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

/// One question/answer/outcome record inside a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub topic_id: String,
    pub topic_title: String,
    pub question: String,
    pub context_reference: String,
    pub student_answer: Option<String>,
    pub passed: Option<bool>,
    pub feedback: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl TranscriptEntry {
    pub fn asked(topic: &ReviewTopic, question: String, context_reference: String, at: DateTime<Utc>) -> Self {
        Self {
            topic_id: topic.id.clone(),
            topic_title: topic.title.clone(),
            question,
            context_reference,
            student_answer: None,
            passed: None,
            feedback: None,
            timestamp: at,
            answered_at: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.student_answer.is_some()
    }
}

/// One sitting over a fixed, ordered batch of topics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSession {
    pub id: String,
    pub topic_ids: Vec<String>,
    pub current_index: usize,
    pub status: SessionStatus,
    pub transcript: Vec<TranscriptEntry>,
    pub pass_count: u32,
    pub fail_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewSession {
    pub fn new(id: String, topic_ids: Vec<String>, first_entry: TranscriptEntry, now: DateTime<Utc>) -> Self {
        Self {
            id,
            topic_ids,
            current_index: 0,
            status: SessionStatus::InProgress,
            transcript: vec![first_entry],
            pass_count: 0,
            fail_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Topic currently being tested, `None` once every topic has been answered.
    pub fn current_topic_id(&self) -> Option<&str> {
        self.topic_ids.get(self.current_index).map(String::as_str)
    }

    /// The unanswered entry for the current topic, if its question was delivered.
    pub fn pending_entry(&self) -> Option<&TranscriptEntry> {
        if self.is_completed() || self.transcript.len() != self.current_index + 1 {
            return None;
        }
        let entry = self.transcript.last()?;
        let current = self.current_topic_id()?;
        (entry.topic_id == current && !entry.is_answered()).then_some(entry)
    }
}

/// Everything `commit_answer` writes for one evaluated answer.
#[derive(Debug, Clone)]
pub struct AnswerCommit {
    pub session_id: String,
    /// `current_index` the submission was validated against.
    pub expected_index: usize,
    pub student_answer: String,
    pub passed: bool,
    pub feedback: String,
    pub answered_at: DateTime<Utc>,
    /// Topic with its new schedule already applied.
    pub topic: ReviewTopic,
    /// `reviews_completed` of the topic as it was read before evaluation.
    pub prior_reviews_completed: u32,
}

impl AnswerCommit {
    pub fn next_index(&self) -> usize {
        self.expected_index + 1
    }
}
