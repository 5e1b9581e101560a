use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::models::{ReviewTopic, TranscriptEntry};
use crate::tutor::{AnswerEvaluator, Evaluation, GeneratedQuestion, QuestionSource};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Transcript entries beyond this many are left out of prompts.
const HISTORY_WINDOW: usize = 6;

#[derive(Clone)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("could not build HTTP client")?;
        Ok(Self { api_key, model, client })
    }

    /// Sends one prompt and parses the model's JSON reply into `T`.
    async fn generate_json<T: DeserializeOwned>(&self, prompt: String) -> Result<T> {
        let body = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "responseMimeType": "application/json"
            }
        });

        let url = format!("{}/{}:generateContent", GEMINI_BASE_URL, self.model);

        let resp = self.client.post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error ({}): {}", status, error_text));
        }

        let gemini_resp: GeminiResponse = resp.json().await?;
        let text = first_text(gemini_resp).ok_or_else(|| anyhow!("Gemini returned no candidates"))?;
        parse_model_json(&text)
    }
}

fn first_text(resp: GeminiResponse) -> Option<String> {
    resp.candidates?
        .into_iter()
        .next()?
        .content
        .parts
        .into_iter()
        .next()
        .map(|p| p.text)
}

/// Models sometimes wrap JSON in a markdown fence even when asked not to.
fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim()).with_context(|| format!("unexpected model output: {}", trimmed))
}

fn render_history(history: &[TranscriptEntry]) -> String {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    let mut out = String::new();
    for entry in &history[start..] {
        out.push_str(&format!("- [{}] Q: {}\n", entry.topic_title, entry.question));
        if let Some(answer) = &entry.student_answer {
            out.push_str(&format!("  A: {}\n", answer));
        }
        if let Some(passed) = entry.passed {
            out.push_str(&format!("  Result: {}\n", if passed { "pass" } else { "fail" }));
        }
    }
    if out.is_empty() {
        out.push_str("(none)\n");
    }
    out
}

fn render_topic(topic: &ReviewTopic) -> String {
    match &topic.content {
        Some(content) => format!("Topic: {}\nStudent notes:\n{}", topic.title, content),
        None => format!("Topic: {}", topic.title),
    }
}

#[async_trait]
impl QuestionSource for GeminiClient {
    async fn generate_question(&self, topic: &ReviewTopic, history: &[TranscriptEntry]) -> Result<GeneratedQuestion> {
        let prompt = format!(
            "You are a patient K-12 tutor running a spaced-repetition review. \
             Ask ONE short recall question about the topic below that the student can answer in a sentence or two. \
             Avoid repeating earlier questions.\n\n{}\n\nEarlier in this session:\n{}\n\
             Reply with JSON: {{\"question\": string, \"contextReference\": string}} where contextReference \
             briefly says why this question checks the topic.",
            render_topic(topic),
            render_history(history)
        );
        let generated: GeneratedQuestion = self.generate_json(prompt).await?;
        if generated.question.trim().is_empty() {
            return Err(anyhow!("Gemini returned an empty question"));
        }
        Ok(generated)
    }
}

#[async_trait]
impl AnswerEvaluator for GeminiClient {
    async fn evaluate(
        &self,
        question: &str,
        student_answer: &str,
        topic: &ReviewTopic,
        history: &[TranscriptEntry],
    ) -> Result<Evaluation> {
        let prompt = format!(
            "You are a patient K-12 tutor grading a spaced-repetition review answer.\n\n{}\n\n\
             Earlier in this session:\n{}\nQuestion: {}\nStudent answer: {}\n\n\
             Decide whether the answer shows the student recalls the idea (minor wording or spelling \
             slips are fine). Reply with JSON: {{\"passed\": boolean, \"feedback\": string}} with one or \
             two encouraging sentences of feedback.",
            render_topic(topic),
            render_history(history),
            question,
            student_answer
        );
        self.generate_json(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_fenced_json() {
        let plain: Evaluation = parse_model_json(r#"{"passed": true, "feedback": "Nice"}"#).unwrap();
        assert!(plain.passed);

        let fenced: GeneratedQuestion =
            parse_model_json("```json\n{\"question\": \"What is 1/2 + 1/4?\", \"contextReference\": \"adding fractions\"}\n```")
                .unwrap();
        assert_eq!(fenced.context_reference, "adding fractions");

        assert!(parse_model_json::<Evaluation>("not json").is_err());
    }

    #[test]
    fn test_first_text() {
        let resp: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "hello"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(first_text(resp).as_deref(), Some("hello"));

        let empty: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert!(first_text(empty).is_none());
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(render_history(&[]), "(none)\n");
    }
}
