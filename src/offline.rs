//! Local tutor used when no LLM is configured.
//!
//! Questions are built from the topic title, and answers are graded by how many
//! of the topic's key words they mention. Crude, but it keeps the review loop
//! usable without network access.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ReviewTopic, TranscriptEntry};
use crate::tutor::{AnswerEvaluator, Evaluation, GeneratedQuestion, QuestionSource};

const MIN_KEYWORD_LEN: usize = 4;
const PASS_RATIO: f64 = 0.3;

#[derive(Debug, Default, Clone)]
pub struct OfflineTutor;

impl OfflineTutor {
    pub fn new() -> Self {
        Self
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl QuestionSource for OfflineTutor {
    async fn generate_question(&self, topic: &ReviewTopic, history: &[TranscriptEntry]) -> Result<GeneratedQuestion> {
        let asked_before = history.iter().filter(|e| e.topic_id == topic.id).count();
        let question = if asked_before == 0 {
            format!("In your own words, explain {}.", topic.title)
        } else {
            format!("Give an example that shows you understand {}.", topic.title)
        };
        Ok(GeneratedQuestion {
            question,
            context_reference: format!("Review of \"{}\"", topic.title),
        })
    }
}

#[async_trait]
impl AnswerEvaluator for OfflineTutor {
    async fn evaluate(
        &self,
        _question: &str,
        student_answer: &str,
        topic: &ReviewTopic,
        _history: &[TranscriptEntry],
    ) -> Result<Evaluation> {
        let reference = match &topic.content {
            Some(content) => format!("{} {}", topic.title, content),
            None => topic.title.clone(),
        };
        let expected = keywords(&reference);
        let given = keywords(student_answer);

        if expected.is_empty() {
            let passed = !given.is_empty();
            return Ok(Evaluation {
                passed,
                feedback: if passed {
                    "Thanks! Keep practising this one.".to_string()
                } else {
                    "Try writing a fuller answer next time.".to_string()
                },
            });
        }

        let hits = expected.intersection(&given).count();
        let ratio = hits as f64 / expected.len().min(10) as f64;
        let passed = ratio >= PASS_RATIO;

        let mut feedback = if passed {
            format!("Good recall! You mentioned {} key idea(s) about {}.", hits, topic.title)
        } else {
            format!("Not quite. Review your notes on {} and try again next time.", topic.title)
        };
        if !passed {
            let mut missing: Vec<&String> = expected.difference(&given).collect();
            missing.sort();
            if let Some(word) = missing.first() {
                feedback.push_str(&format!(" Hint: think about \"{}\".", word));
            }
        }

        Ok(Evaluation { passed, feedback })
    }
}
