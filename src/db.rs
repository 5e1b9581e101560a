use sqlx::{sqlite::{SqlitePoolOptions, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous, SqliteConnection}, Pool, Sqlite, ConnectOptions, Row};
use chrono::{Utc, DateTime};
use std::str::FromStr;
use async_trait::async_trait;

use crate::error::{Result, VaultError};
use crate::models::{AnswerCommit, RecallState, ReviewSession, ReviewTopic, SessionStatus, TranscriptEntry};
use crate::store::ReviewStore;

fn decode_error(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn to_u32(v: i64) -> u32 {
    v.clamp(0, u32::MAX as i64) as u32
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for ReviewTopic {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let recall: String = row.try_get("recall_state")?;
        let recall_state = RecallState::parse(&recall)
            .ok_or_else(|| decode_error(format!("unknown recall state '{}'", recall)))?;

        Ok(ReviewTopic {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            interval_days: to_u32(row.try_get("interval_days")?),
            ease_factor: row.try_get("ease_factor")?,
            reviews_completed: to_u32(row.try_get("reviews_completed")?),
            next_review_date: row.try_get("next_review_date")?,
            recall_state,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for TranscriptEntry {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(TranscriptEntry {
            topic_id: row.try_get("topic_id")?,
            topic_title: row.try_get("topic_title")?,
            question: row.try_get("question")?,
            context_reference: row.try_get("context_reference")?,
            student_answer: row.try_get("student_answer")?,
            passed: row.try_get("passed")?,
            feedback: row.try_get("feedback")?,
            timestamp: row.try_get("asked_at")?,
            answered_at: row.try_get("answered_at")?,
        })
    }
}

/// SQLite-backed review store.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);
        if !in_memory {
            options = options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;

        Ok(db)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS review_topics (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT,
                interval_days INTEGER NOT NULL DEFAULT 0,
                ease_factor REAL NOT NULL DEFAULT 2.5,
                reviews_completed INTEGER NOT NULL DEFAULT 0,
                next_review_date DATETIME NOT NULL,
                recall_state TEXT NOT NULL DEFAULT 'needs_review',
                created_at DATETIME NOT NULL
            );
            "#
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS review_sessions (
                id TEXT PRIMARY KEY,
                topic_ids TEXT NOT NULL,
                topic_count INTEGER NOT NULL,
                current_index INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'in_progress',
                pass_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            "#
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcript_entries (
                session_id TEXT NOT NULL REFERENCES review_sessions(id),
                position INTEGER NOT NULL,
                topic_id TEXT NOT NULL,
                topic_title TEXT NOT NULL,
                question TEXT NOT NULL,
                context_reference TEXT NOT NULL,
                student_answer TEXT,
                passed BOOLEAN,
                feedback TEXT,
                asked_at DATETIME NOT NULL,
                answered_at DATETIME,
                PRIMARY KEY (session_id, position)
            );
            "#
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_review_topics_due ON review_topics (next_review_date)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn session_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM review_sessions WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

async fn insert_entry(conn: &mut SqliteConnection, session_id: &str, position: usize, entry: &TranscriptEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transcript_entries
            (session_id, position, topic_id, topic_title, question, context_reference,
             student_answer, passed, feedback, asked_at, answered_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#
    )
    .bind(session_id)
    .bind(position as i64)
    .bind(&entry.topic_id)
    .bind(&entry.topic_title)
    .bind(&entry.question)
    .bind(&entry.context_reference)
    .bind(&entry.student_answer)
    .bind(entry.passed)
    .bind(&entry.feedback)
    .bind(entry.timestamp)
    .bind(entry.answered_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_session(conn: &mut SqliteConnection, id: &str) -> Result<Option<ReviewSession>> {
    let row = sqlx::query("SELECT * FROM review_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let topic_ids_json: String = row.try_get("topic_ids")?;
    let topic_ids: Vec<String> = serde_json::from_str(&topic_ids_json)?;
    let status_str: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status_str)
        .ok_or_else(|| VaultError::Corrupt(format!("unknown session status '{}'", status_str)))?;
    let current_index: i64 = row.try_get("current_index")?;

    let transcript = sqlx::query_as::<_, TranscriptEntry>(
        "SELECT * FROM transcript_entries WHERE session_id = ? ORDER BY position ASC"
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(ReviewSession {
        id: row.try_get("id")?,
        topic_ids,
        current_index: current_index.max(0) as usize,
        status,
        transcript,
        pass_count: to_u32(row.try_get("pass_count")?),
        fail_count: to_u32(row.try_get("fail_count")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

#[async_trait]
impl ReviewStore for Db {
    async fn insert_topic(&self, topic: &ReviewTopic) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO review_topics
                (id, title, content, interval_days, ease_factor, reviews_completed,
                 next_review_date, recall_state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(&topic.id)
        .bind(&topic.title)
        .bind(&topic.content)
        .bind(topic.interval_days as i64)
        .bind(topic.ease_factor)
        .bind(topic.reviews_completed as i64)
        .bind(topic.next_review_date)
        .bind(topic.recall_state.as_str())
        .bind(topic.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_topic(&self, id: &str) -> Result<Option<ReviewTopic>> {
        let topic = sqlx::query_as::<_, ReviewTopic>("SELECT * FROM review_topics WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(topic)
    }

    async fn due_topics(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReviewTopic>> {
        // Order priority:
        // 1. NeedsReview before Mastered
        // 2. Most overdue first
        let topics = sqlx::query_as::<_, ReviewTopic>(
            r#"
            SELECT * FROM review_topics
            WHERE julianday(next_review_date) <= julianday(?)
            ORDER BY
                CASE recall_state WHEN 'needs_review' THEN 0 ELSE 1 END ASC,
                julianday(next_review_date) ASC,
                id ASC
            LIMIT ?
            "#
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(topics)
    }

    async fn insert_session(&self, session: &ReviewSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO review_sessions
                (id, topic_ids, topic_count, current_index, status, pass_count, fail_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(&session.id)
        .bind(serde_json::to_string(&session.topic_ids)?)
        .bind(session.topic_ids.len() as i64)
        .bind(session.current_index as i64)
        .bind(session.status.as_str())
        .bind(session.pass_count as i64)
        .bind(session.fail_count as i64)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        for (position, entry) in session.transcript.iter().enumerate() {
            insert_entry(&mut *tx, &session.id, position, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ReviewSession>> {
        let mut conn = self.pool.acquire().await?;
        fetch_session(&mut *conn, id).await
    }

    async fn commit_answer(&self, commit: &AnswerCommit) -> Result<ReviewSession> {
        let mut tx = self.pool.begin().await?;
        let expected = commit.expected_index as i64;

        // Conditioned on the index the submission was validated against.
        let advanced = sqlx::query(
            r#"
            UPDATE review_sessions SET
                current_index = current_index + 1,
                status = CASE WHEN current_index + 1 >= topic_count THEN 'completed' ELSE 'in_progress' END,
                pass_count = pass_count + ?,
                fail_count = fail_count + ?,
                updated_at = ?
            WHERE id = ? AND current_index = ? AND status = 'in_progress'
            "#
        )
        .bind(commit.passed as i64)
        .bind(!commit.passed as i64)
        .bind(commit.answered_at)
        .bind(&commit.session_id)
        .bind(expected)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            // Dropping the transaction rolls it back.
            drop(tx);
            return if self.session_exists(&commit.session_id).await? {
                Err(VaultError::Conflict(commit.session_id.clone()))
            } else {
                Err(VaultError::SessionNotFound(commit.session_id.clone()))
            };
        }

        let answered = sqlx::query(
            r#"
            UPDATE transcript_entries SET
                student_answer = ?, passed = ?, feedback = ?, answered_at = ?
            WHERE session_id = ? AND position = ? AND topic_id = ? AND student_answer IS NULL
            "#
        )
        .bind(&commit.student_answer)
        .bind(commit.passed)
        .bind(&commit.feedback)
        .bind(commit.answered_at)
        .bind(&commit.session_id)
        .bind(expected)
        .bind(&commit.topic.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if answered != 1 {
            return Err(VaultError::Conflict(commit.session_id.clone()));
        }

        let topic = &commit.topic;
        let rescheduled = sqlx::query(
            r#"
            UPDATE review_topics SET
                interval_days = ?, ease_factor = ?, reviews_completed = ?,
                next_review_date = ?, recall_state = ?
            WHERE id = ? AND reviews_completed = ?
            "#
        )
        .bind(topic.interval_days as i64)
        .bind(topic.ease_factor)
        .bind(topic.reviews_completed as i64)
        .bind(topic.next_review_date)
        .bind(topic.recall_state.as_str())
        .bind(&topic.id)
        .bind(commit.prior_reviews_completed as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rescheduled != 1 {
            // Another session rescheduled the topic after we read it.
            let exists: i64 = sqlx::query_scalar("SELECT count(*) FROM review_topics WHERE id = ?")
                .bind(&topic.id)
                .fetch_one(&mut *tx)
                .await?;
            return Err(if exists > 0 {
                VaultError::TopicConflict(topic.id.clone())
            } else {
                VaultError::TopicNotFound(topic.id.clone())
            });
        }

        let session = fetch_session(&mut *tx, &commit.session_id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(commit.session_id.clone()))?;

        tx.commit().await?;

        Ok(session)
    }

    async fn append_entry(&self, session_id: &str, expected_index: usize, entry: &TranscriptEntry) -> Result<()> {
        let expected = expected_index as i64;
        let inserted = sqlx::query(
            r#"
            INSERT INTO transcript_entries
                (session_id, position, topic_id, topic_title, question, context_reference, asked_at)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM review_sessions
                WHERE id = ? AND current_index = ? AND status = 'in_progress'
            )
            AND (SELECT count(*) FROM transcript_entries WHERE session_id = ?) = ?
            "#
        )
        .bind(session_id)
        .bind(expected)
        .bind(&entry.topic_id)
        .bind(&entry.topic_title)
        .bind(&entry.question)
        .bind(&entry.context_reference)
        .bind(entry.timestamp)
        .bind(session_id)
        .bind(expected)
        .bind(session_id)
        .bind(expected)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return if self.session_exists(session_id).await? {
                Err(VaultError::Conflict(session_id.to_string()))
            } else {
                Err(VaultError::SessionNotFound(session_id.to_string()))
            };
        }

        sqlx::query("UPDATE review_sessions SET updated_at = ? WHERE id = ?")
            .bind(entry.timestamp)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 30, 0).unwrap()
    }

    fn topic(id: &str) -> ReviewTopic {
        ReviewTopic::new(id.to_string(), format!("Topic {}", id), Some("notes".into()), 2.5, now())
    }

    async fn seeded() -> (Db, ReviewSession) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let a = topic("a");
        db.insert_topic(&a).await.unwrap();
        db.insert_topic(&topic("b")).await.unwrap();

        let entry = TranscriptEntry::asked(&a, "What is a?".into(), "intro".into(), now());
        let session = ReviewSession::new("s1".into(), vec!["a".into(), "b".into()], entry, now());
        db.insert_session(&session).await.unwrap();
        (db, session)
    }

    #[tokio::test]
    async fn test_topic_round_trip() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let mut t = topic("t1");
        t.recall_state = RecallState::Mastered;
        t.interval_days = 6;
        db.insert_topic(&t).await.unwrap();

        let loaded = db.get_topic("t1").await.unwrap().unwrap();
        assert_eq!(loaded, t);
        assert!(db.get_topic("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (db, session) = seeded().await;
        let loaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn test_commit_answer_advances_and_reschedules() {
        let (db, session) = seeded().await;
        let mut a = db.get_topic("a").await.unwrap().unwrap();
        a.interval_days = 1;
        a.reviews_completed = 1;
        a.recall_state = RecallState::Mastered;

        let commit = AnswerCommit {
            session_id: session.id.clone(),
            expected_index: 0,
            student_answer: "a is a letter".into(),
            passed: true,
            feedback: "Nice".into(),
            answered_at: now(),
            topic: a.clone(),
            prior_reviews_completed: 0,
        };
        let updated = db.commit_answer(&commit).await.unwrap();
        assert_eq!(updated.current_index, 1);
        assert_eq!(updated.status, SessionStatus::InProgress);
        assert_eq!(updated.pass_count, 1);
        assert_eq!(updated.transcript[0].passed, Some(true));
        assert_eq!(db.get_topic("a").await.unwrap().unwrap(), a);

        // Replaying the same commit must not advance twice.
        let err = db.commit_answer(&commit).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
        let reloaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.current_index, 1);
        assert_eq!(reloaded.pass_count, 1);
    }

    #[tokio::test]
    async fn test_commit_rolls_back_on_mismatched_topic() {
        let (db, session) = seeded().await;
        let mut ghost = topic("a");
        ghost.id = "ghost".into();

        let commit = AnswerCommit {
            session_id: session.id.clone(),
            expected_index: 0,
            student_answer: "x".into(),
            passed: false,
            feedback: "no".into(),
            answered_at: now(),
            topic: ghost,
            prior_reviews_completed: 0,
        };
        // The entry belongs to topic "a", so the mismatched topic id is a conflict.
        assert!(db.commit_answer(&commit).await.is_err());

        let reloaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(reloaded, session);
    }

    #[tokio::test]
    async fn test_commit_rolls_back_when_topic_was_rescheduled() {
        let (db, session) = seeded().await;
        let a = db.get_topic("a").await.unwrap().unwrap();

        // Another session reviews "a" between our read and our commit.
        let entry = TranscriptEntry::asked(&a, "Again?".into(), "other".into(), now());
        let other = ReviewSession::new("s2".into(), vec!["a".into()], entry, now());
        db.insert_session(&other).await.unwrap();
        let mut reviewed = a.clone();
        reviewed.reviews_completed = 1;
        reviewed.interval_days = 1;
        let winner = AnswerCommit {
            session_id: other.id.clone(),
            expected_index: 0,
            student_answer: "a".into(),
            passed: true,
            feedback: "ok".into(),
            answered_at: now(),
            topic: reviewed.clone(),
            prior_reviews_completed: 0,
        };
        db.commit_answer(&winner).await.unwrap();

        let stale = AnswerCommit {
            session_id: session.id.clone(),
            expected_index: 0,
            student_answer: "x".into(),
            passed: false,
            feedback: "no".into(),
            answered_at: now(),
            topic: reviewed.clone(),
            prior_reviews_completed: 0,
        };
        let err = db.commit_answer(&stale).await.unwrap_err();
        assert!(matches!(err, VaultError::TopicConflict(_)));

        // Session and transcript updates were rolled back with it.
        assert_eq!(db.get_session("s1").await.unwrap().unwrap(), session);
        assert_eq!(db.get_topic("a").await.unwrap().unwrap(), reviewed);
    }

    #[tokio::test]
    async fn test_append_entry_is_conditional() {
        let (db, session) = seeded().await;
        let b = db.get_topic("b").await.unwrap().unwrap();
        let next = TranscriptEntry::asked(&b, "What is b?".into(), "next".into(), now());

        // Index has not advanced yet.
        let err = db.append_entry(&session.id, 1, &next).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));

        let err = db.append_entry("nope", 1, &next).await.unwrap_err();
        assert!(matches!(err, VaultError::SessionNotFound(_)));

        let a = db.get_topic("a").await.unwrap().unwrap();
        let commit = AnswerCommit {
            session_id: session.id.clone(),
            expected_index: 0,
            student_answer: "x".into(),
            passed: false,
            feedback: "no".into(),
            answered_at: now(),
            topic: a,
            prior_reviews_completed: 0,
        };
        db.commit_answer(&commit).await.unwrap();
        db.append_entry(&session.id, 1, &next).await.unwrap();

        let reloaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.transcript.len(), 2);
        assert_eq!(reloaded.pending_entry().map(|e| e.question.as_str()), Some("What is b?"));

        // A second append at the same position is refused.
        assert!(db.append_entry(&session.id, 1, &next).await.is_err());
    }

    #[tokio::test]
    async fn test_due_topics() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        let mut later = topic("later");
        later.next_review_date = now() + Duration::days(2);
        let mut old = topic("old");
        old.next_review_date = now() - Duration::days(4);
        old.recall_state = RecallState::Mastered;
        let fresh = topic("fresh");
        for t in [&later, &old, &fresh] {
            db.insert_topic(t).await.unwrap();
        }

        let due = db.due_topics(now(), 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "old"]);

        let capped = db.due_topics(now(), 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }
}
