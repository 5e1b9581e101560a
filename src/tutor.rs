//! Capability interfaces for the AI tutor.
//!
//! The review controller only knows that something can produce a question for
//! a topic and that something can grade an answer. Both may fail; failures are
//! reported as `anyhow` errors and classified by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ReviewTopic, TranscriptEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub question: String,
    /// Why this question was asked, shown to the student alongside it.
    pub context_reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub passed: bool,
    pub feedback: String,
}

#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// `history` is the session transcript so far, oldest first.
    async fn generate_question(
        &self,
        topic: &ReviewTopic,
        history: &[TranscriptEntry],
    ) -> anyhow::Result<GeneratedQuestion>;
}

#[async_trait]
pub trait AnswerEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        question: &str,
        student_answer: &str,
        topic: &ReviewTopic,
        history: &[TranscriptEntry],
    ) -> anyhow::Result<Evaluation>;
}
