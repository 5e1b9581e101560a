use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Result, VaultError};
use crate::models::{AnswerCommit, RecallState, ReviewSession, ReviewTopic, SessionStatus, TranscriptEntry};

/// Persistence for topics and review sessions.
///
/// Writes that advance a session are conditioned on the `current_index` the
/// caller validated against. A write that finds the session moved on fails with
/// [`VaultError::Conflict`] and leaves everything untouched.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn insert_topic(&self, topic: &ReviewTopic) -> Result<()>;

    async fn get_topic(&self, id: &str) -> Result<Option<ReviewTopic>>;

    /// Topics due at `now`: NeedsReview first, then most overdue first.
    async fn due_topics(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReviewTopic>>;

    async fn insert_session(&self, session: &ReviewSession) -> Result<()>;

    async fn get_session(&self, id: &str) -> Result<Option<ReviewSession>>;

    /// Records an evaluated answer: fills in the pending transcript entry,
    /// reschedules the topic, bumps the tallies and advances the index. All or nothing.
    ///
    /// The topic write is conditioned on `prior_reviews_completed`; a topic that
    /// another session rescheduled in the meantime fails with [`VaultError::TopicConflict`].
    async fn commit_answer(&self, commit: &AnswerCommit) -> Result<ReviewSession>;

    /// Appends the question for the topic at `expected_index`.
    async fn append_entry(&self, session_id: &str, expected_index: usize, entry: &TranscriptEntry) -> Result<()>;
}

/// Orders due topics the way both stores hand them out.
pub(crate) fn due_order(a: &ReviewTopic, b: &ReviewTopic) -> std::cmp::Ordering {
    let rank = |t: &ReviewTopic| match t.recall_state {
        RecallState::NeedsReview => 0,
        RecallState::Mastered => 1,
    };
    rank(a)
        .cmp(&rank(b))
        .then(a.next_review_date.cmp(&b.next_review_date))
        .then(a.id.cmp(&b.id))
}

#[derive(Default)]
struct MemoryState {
    topics: HashMap<String, ReviewTopic>,
    sessions: HashMap<String, ReviewSession>,
}

/// Process-local store. Every operation holds the lock only for its own
/// read-validate-write, so the conditional writes behave like the SQLite ones.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn insert_topic(&self, topic: &ReviewTopic) -> Result<()> {
        let mut state = self.state.lock().await;
        state.topics.insert(topic.id.clone(), topic.clone());
        Ok(())
    }

    async fn get_topic(&self, id: &str) -> Result<Option<ReviewTopic>> {
        Ok(self.state.lock().await.topics.get(id).cloned())
    }

    async fn due_topics(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReviewTopic>> {
        let state = self.state.lock().await;
        let mut due: Vec<ReviewTopic> = state.topics.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by(due_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn insert_session(&self, session: &ReviewSession) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ReviewSession>> {
        Ok(self.state.lock().await.sessions.get(id).cloned())
    }

    async fn commit_answer(&self, commit: &AnswerCommit) -> Result<ReviewSession> {
        let mut state = self.state.lock().await;

        let stored_reviews = state
            .topics
            .get(&commit.topic.id)
            .map(|t| t.reviews_completed)
            .ok_or_else(|| VaultError::TopicNotFound(commit.topic.id.clone()))?;

        let session = state
            .sessions
            .get(&commit.session_id)
            .ok_or_else(|| VaultError::SessionNotFound(commit.session_id.clone()))?;

        let entry_ok = session
            .transcript
            .get(commit.expected_index)
            .map(|e| !e.is_answered() && e.topic_id == commit.topic.id)
            .unwrap_or(false);
        if session.current_index != commit.expected_index || session.is_completed() || !entry_ok {
            return Err(VaultError::Conflict(commit.session_id.clone()));
        }
        if stored_reviews != commit.prior_reviews_completed {
            return Err(VaultError::TopicConflict(commit.topic.id.clone()));
        }

        // Validation done; from here on nothing can fail.
        let mut updated = session.clone();
        let entry = &mut updated.transcript[commit.expected_index];
        entry.student_answer = Some(commit.student_answer.clone());
        entry.passed = Some(commit.passed);
        entry.feedback = Some(commit.feedback.clone());
        entry.answered_at = Some(commit.answered_at);
        if commit.passed {
            updated.pass_count += 1;
        } else {
            updated.fail_count += 1;
        }
        updated.current_index = commit.next_index();
        if updated.current_index >= updated.topic_ids.len() {
            updated.status = SessionStatus::Completed;
        }
        updated.updated_at = commit.answered_at;

        state.topics.insert(commit.topic.id.clone(), commit.topic.clone());
        state.sessions.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn append_entry(&self, session_id: &str, expected_index: usize, entry: &TranscriptEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| VaultError::SessionNotFound(session_id.to_string()))?;

        if session.is_completed()
            || session.current_index != expected_index
            || session.transcript.len() != expected_index
        {
            return Err(VaultError::Conflict(session_id.to_string()));
        }

        session.transcript.push(entry.clone());
        session.updated_at = entry.timestamp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn topic(id: &str, now: DateTime<Utc>) -> ReviewTopic {
        ReviewTopic::new(id.to_string(), format!("Topic {}", id), None, 2.5, now)
    }

    fn commit_for(session: &ReviewSession, topic: &ReviewTopic, now: DateTime<Utc>) -> AnswerCommit {
        AnswerCommit {
            session_id: session.id.clone(),
            expected_index: session.current_index,
            student_answer: "answer".into(),
            passed: true,
            feedback: "ok".into(),
            answered_at: now,
            topic: topic.clone(),
            prior_reviews_completed: topic.reviews_completed,
        }
    }

    #[tokio::test]
    async fn test_stale_commit_is_rejected() {
        let now = Utc::now();
        let store = MemoryStore::new();
        let a = topic("a", now);
        store.insert_topic(&a).await.unwrap();
        let entry = TranscriptEntry::asked(&a, "Q".into(), "ctx".into(), now);
        let session = ReviewSession::new("s1".into(), vec!["a".into(), "b".into()], entry, now);
        store.insert_session(&session).await.unwrap();

        let commit = commit_for(&session, &a, now);
        let updated = store.commit_answer(&commit).await.unwrap();
        assert_eq!(updated.current_index, 1);

        // Same commit again, validated against the old index.
        let err = store.commit_answer(&commit).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
        let after = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(after.pass_count, 1);
        assert_eq!(after.current_index, 1);
    }

    #[tokio::test]
    async fn test_commit_for_another_topic_is_rejected() {
        let now = Utc::now();
        let store = MemoryStore::new();
        let a = topic("a", now);
        let b = topic("b", now);
        store.insert_topic(&a).await.unwrap();
        store.insert_topic(&b).await.unwrap();
        let entry = TranscriptEntry::asked(&a, "Q".into(), "ctx".into(), now);
        let session = ReviewSession::new("s1".into(), vec!["a".into(), "b".into()], entry, now);
        store.insert_session(&session).await.unwrap();

        // The pending entry belongs to "a"; a commit carrying "b" must not land.
        let err = store.commit_answer(&commit_for(&session, &b, now)).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));

        assert_eq!(store.get_session("s1").await.unwrap().unwrap(), session);
        assert_eq!(store.get_topic("b").await.unwrap().unwrap(), b);
    }

    #[tokio::test]
    async fn test_topic_rescheduled_elsewhere_is_rejected() {
        let now = Utc::now();
        let store = MemoryStore::new();
        let a = topic("a", now);
        store.insert_topic(&a).await.unwrap();
        let entry = TranscriptEntry::asked(&a, "Q".into(), "ctx".into(), now);
        let first = ReviewSession::new("s1".into(), vec!["a".into()], entry.clone(), now);
        let second = ReviewSession::new("s2".into(), vec!["a".into()], entry, now);
        store.insert_session(&first).await.unwrap();
        store.insert_session(&second).await.unwrap();

        // Both sessions read the topic before either committed.
        let mut reviewed = a.clone();
        reviewed.reviews_completed = 1;
        let mut winner = commit_for(&first, &reviewed, now);
        winner.prior_reviews_completed = 0;
        let mut loser = commit_for(&second, &reviewed, now);
        loser.prior_reviews_completed = 0;

        store.commit_answer(&winner).await.unwrap();
        let err = store.commit_answer(&loser).await.unwrap_err();
        assert!(matches!(err, VaultError::TopicConflict(_)));

        assert_eq!(store.get_topic("a").await.unwrap().unwrap().reviews_completed, 1);
        let untouched = store.get_session("s2").await.unwrap().unwrap();
        assert_eq!(untouched, second);
    }

    #[tokio::test]
    async fn test_append_requires_expected_index() {
        let now = Utc::now();
        let store = MemoryStore::new();
        let a = topic("a", now);
        let entry = TranscriptEntry::asked(&a, "Q".into(), "ctx".into(), now);
        let session = ReviewSession::new("s1".into(), vec!["a".into(), "b".into()], entry.clone(), now);
        store.insert_session(&session).await.unwrap();

        // Index 0 already has its entry.
        let err = store.append_entry("s1", 0, &entry).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
        let err = store.append_entry("s1", 1, &entry).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_due_topics_order() {
        let now = Utc::now();
        let store = MemoryStore::new();

        let mut mastered = topic("m", now - Duration::days(5));
        mastered.recall_state = RecallState::Mastered;
        let weak = topic("w", now - Duration::days(1));
        let mut future = topic("f", now);
        future.next_review_date = now + Duration::days(3);

        for t in [&mastered, &weak, &future] {
            store.insert_topic(t).await.unwrap();
        }

        let due = store.due_topics(now, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["w", "m"]);
    }
}
