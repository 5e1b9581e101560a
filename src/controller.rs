//! Review session orchestration.
//!
//! A session walks a fixed batch of topics: ask a question for the current
//! topic, grade the student's answer, reschedule the topic and move on. The
//! AI collaborators are called without holding any store lock; every state
//! change is a single conditional write against the index that was validated.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorBody, Result, VaultError};
use crate::models::{AnswerCommit, ReviewSession, ReviewTopic, TranscriptEntry};
use crate::srs::{self, SrsConfig};
use crate::store::ReviewStore;
use crate::tutor::{AnswerEvaluator, Evaluation, QuestionSource};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_batch_size: usize,
    /// Applied to every question source and evaluator call.
    pub ai_timeout: Duration,
    pub srs: SrsConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            ai_timeout: Duration::from_secs(8),
            srs: SrsConfig::default(),
        }
    }
}

/// A question as the student sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub topic_id: String,
    pub topic_title: String,
    pub question: String,
    pub context_reference: String,
}

impl From<&TranscriptEntry> for QuestionView {
    fn from(entry: &TranscriptEntry) -> Self {
        Self {
            topic_id: entry.topic_id.clone(),
            topic_title: entry.topic_title.clone(),
            question: entry.question.clone(),
            context_reference: entry.context_reference.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedSession {
    pub session: ReviewSession,
    pub first_question: QuestionView,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub passed: bool,
    pub feedback: String,
    pub next_question: Option<QuestionView>,
    /// Set when the answer was recorded but the follow-up question could not be produced.
    pub next_question_error: Option<ErrorBody>,
    pub session_complete: bool,
    pub pass_count: u32,
    pub fail_count: u32,
    pub session: ReviewSession,
}

#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: ReviewSession,
    pub current_question: Option<QuestionView>,
}

pub struct ReviewController {
    store: Arc<dyn ReviewStore>,
    questions: Arc<dyn QuestionSource>,
    evaluator: Arc<dyn AnswerEvaluator>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
}

impl ReviewController {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        questions: Arc<dyn QuestionSource>,
        evaluator: Arc<dyn AnswerEvaluator>,
        settings: ControllerSettings,
    ) -> Self {
        Self::with_clock(store, questions, evaluator, Arc::new(SystemClock), settings)
    }

    pub fn with_clock(
        store: Arc<dyn ReviewStore>,
        questions: Arc<dyn QuestionSource>,
        evaluator: Arc<dyn AnswerEvaluator>,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Self {
        Self { store, questions, evaluator, clock, settings }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    // --- Topics ---

    pub async fn create_topic(&self, title: &str, content: Option<String>) -> Result<ReviewTopic> {
        let title = title.trim();
        if title.is_empty() {
            return Err(VaultError::EmptyTitle);
        }
        let content = content.filter(|c| !c.trim().is_empty());
        let ease = self.settings.srs.clamp_ease(self.settings.srs.initial_ease);
        let topic = ReviewTopic::new(Uuid::new_v4().to_string(), title.to_string(), content, ease, self.clock.now());
        self.store.insert_topic(&topic).await?;
        debug!("Topic {} enrolled for review", topic.id);
        Ok(topic)
    }

    pub async fn get_topic(&self, id: &str) -> Result<ReviewTopic> {
        self.load_topic(id).await
    }

    /// Suggests a batch of due topics, shuffled for interleaved practice.
    pub async fn due_topics(&self, limit: usize) -> Result<Vec<ReviewTopic>> {
        let limit = limit.max(1).min(self.settings.max_batch_size);
        let mut topics = self.store.due_topics(self.clock.now(), limit).await?;
        topics.shuffle(&mut rand::thread_rng());
        Ok(topics)
    }

    // --- Sessions ---

    pub async fn start_session(&self, topic_ids: Vec<String>) -> Result<StartedSession> {
        let max = self.settings.max_batch_size;
        if topic_ids.is_empty() || topic_ids.len() > max {
            return Err(VaultError::InvalidBatchSize { got: topic_ids.len(), max });
        }
        let mut seen = HashSet::new();
        for id in &topic_ids {
            if !seen.insert(id.as_str()) {
                return Err(VaultError::DuplicateTopic(id.clone()));
            }
        }

        // Every topic must exist before anything is asked.
        let mut topics = Vec::with_capacity(topic_ids.len());
        for id in &topic_ids {
            topics.push(self.load_topic(id).await?);
        }

        let first = self.ask(&topics[0], &[]).await?;
        let now = self.clock.now();
        let session = ReviewSession::new(Uuid::new_v4().to_string(), topic_ids, first, now);
        self.store.insert_session(&session).await?;

        info!("Review session {} started with {} topic(s)", session.id, session.topic_ids.len());
        let first_question = QuestionView::from(&session.transcript[0]);
        Ok(StartedSession { session, first_question })
    }

    pub async fn submit_answer(&self, session_id: &str, topic_id: &str, answer: &str) -> Result<SubmitOutcome> {
        let session = self.load_session(session_id).await?;
        if session.is_completed() {
            return Err(VaultError::SessionCompleted(session.id));
        }
        let expected_topic = session
            .current_topic_id()
            .ok_or_else(|| VaultError::SessionCompleted(session.id.clone()))?;
        if expected_topic != topic_id {
            return Err(VaultError::TopicMismatch {
                expected: expected_topic.to_string(),
                got: topic_id.to_string(),
            });
        }
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(VaultError::EmptyAnswer);
        }
        let entry = session
            .pending_entry()
            .ok_or_else(|| VaultError::NoPendingQuestion(session.id.clone()))?;

        let topic = self.load_topic(topic_id).await?;

        let Evaluation { passed, feedback } = self
            .with_timeout(
                "answer evaluator",
                self.evaluator.evaluate(&entry.question, answer, &topic, &session.transcript),
                VaultError::Evaluator,
            )
            .await?;

        let now = self.clock.now();
        let rescheduled = srs::apply_review(&self.settings.srs, &topic, passed, now);
        debug!(
            "Session {} topic {}: {} -> interval {}d, ease {:.2}",
            session.id,
            topic.id,
            if passed { "pass" } else { "fail" },
            rescheduled.interval_days,
            rescheduled.ease_factor
        );

        let commit = AnswerCommit {
            session_id: session.id.clone(),
            expected_index: session.current_index,
            student_answer: answer.to_string(),
            passed,
            feedback: feedback.clone(),
            answered_at: now,
            topic: rescheduled,
            prior_reviews_completed: topic.reviews_completed,
        };
        let mut session = self.store.commit_answer(&commit).await?;

        let mut next_question = None;
        let mut next_question_error = None;
        if session.is_completed() {
            info!(
                "Review session {} completed: {} passed, {} failed",
                session.id, session.pass_count, session.fail_count
            );
        } else {
            // The answer is already recorded; a failure here only leaves the
            // session waiting for a question.
            match self.ask_current(&session).await {
                Ok(entry) => {
                    next_question = Some(QuestionView::from(&entry));
                    session.transcript.push(entry);
                }
                Err(e) => {
                    warn!("Session {} advanced without a next question: {}", session.id, e);
                    next_question_error = Some(ErrorBody::from(&e));
                }
            }
        }

        Ok(SubmitOutcome {
            passed,
            feedback,
            next_question,
            next_question_error,
            session_complete: session.is_completed(),
            pass_count: session.pass_count,
            fail_count: session.fail_count,
            session,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionView> {
        let session = self.load_session(session_id).await?;
        let current_question = session.pending_entry().map(QuestionView::from);
        Ok(SessionView { session, current_question })
    }

    /// Returns the pending question for the current topic, asking for one if
    /// the session is waiting without it.
    pub async fn request_question(&self, session_id: &str) -> Result<QuestionView> {
        let session = self.load_session(session_id).await?;
        if session.is_completed() {
            return Err(VaultError::SessionCompleted(session.id));
        }
        if let Some(entry) = session.pending_entry() {
            return Ok(QuestionView::from(entry));
        }
        let entry = self.ask_current(&session).await?;
        Ok(QuestionView::from(&entry))
    }

    // --- Internals ---

    async fn load_session(&self, id: &str) -> Result<ReviewSession> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(id.to_string()))
    }

    async fn load_topic(&self, id: &str) -> Result<ReviewTopic> {
        self.store
            .get_topic(id)
            .await?
            .ok_or_else(|| VaultError::TopicNotFound(id.to_string()))
    }

    /// Asks for and stores the question of the topic at `current_index`.
    async fn ask_current(&self, session: &ReviewSession) -> Result<TranscriptEntry> {
        let topic_id = session
            .current_topic_id()
            .ok_or_else(|| VaultError::SessionCompleted(session.id.clone()))?;
        let topic = self.load_topic(topic_id).await?;
        let entry = self.ask(&topic, &session.transcript).await?;
        self.store.append_entry(&session.id, session.current_index, &entry).await?;
        Ok(entry)
    }

    async fn ask(&self, topic: &ReviewTopic, history: &[TranscriptEntry]) -> Result<TranscriptEntry> {
        let generated = self
            .with_timeout(
                "question source",
                self.questions.generate_question(topic, history),
                VaultError::QuestionSource,
            )
            .await?;
        Ok(TranscriptEntry::asked(topic, generated.question, generated.context_reference, self.clock.now()))
    }

    async fn with_timeout<T, F>(&self, what: &'static str, call: F, wrap: fn(String) -> VaultError) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let after = self.settings.ai_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed: {:#}", what, e);
                Err(wrap(format!("{:#}", e)))
            }
            Err(_) => {
                warn!("{} timed out after {:?}", what, after);
                Err(VaultError::Timeout { what, after })
            }
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
