//! Tier 2 — LLM few-shot reasoning.
//!
//! Builds the classification prompt (instructions, safety rules, few-shot
//! examples, the email), parses the JSON verdict out of whatever the model
//! wrapped it in, and applies the tier-2 gates: UNKNOWN always escalates,
//! and low confidence escalates with the verdict as a suggestion.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use super::LlmClient;
use crate::config::EngineConfig;
use crate::error::LlmError;
use crate::store::{Store, TrainingExampleRow};
use crate::types::{EmailAction, EmailCategory, EmailRecord, TierOutcome, Verdict};

/// Result of one tier-2 attempt.
pub struct LlmEvaluation {
    pub outcome: TierOutcome,
    /// Model name for the decision record.
    pub model: String,
    /// True when the decline came from backend failure rather than the
    /// model declining to commit. The router prioritizes these for review.
    pub backend_failed: bool,
}

#[derive(Deserialize)]
struct RawVerdict {
    category: String,
    action: String,
    confidence: f32,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    fraud_score: Option<u8>,
}

pub struct LlmReasoner {
    store: Arc<Store>,
    client: Arc<dyn LlmClient>,
    confidence_threshold: f32,
    max_retries: u32,
    retry_backoff: Duration,
    prompt_example_count: usize,
    few_shot_cap: u32,
}

impl LlmReasoner {
    pub fn new(store: Arc<Store>, client: Arc<dyn LlmClient>, config: &EngineConfig) -> Self {
        Self {
            store,
            client,
            confidence_threshold: config.llm_confidence_threshold,
            max_retries: config.llm_max_retries,
            retry_backoff: config.llm_retry_backoff,
            prompt_example_count: config.few_shot_prompt_size,
            few_shot_cap: config.few_shot_cap_per_category,
        }
    }

    /// Attempt a tier-2 verdict. All failure modes decline.
    pub async fn evaluate(&self, email: &EmailRecord) -> LlmEvaluation {
        let model = self.client.model_name().to_string();

        let examples = match self.prompt_examples().await {
            Ok(ex) => ex,
            Err(e) => {
                // Classify without examples rather than fail the email.
                warn!(error = %e, "Failed to load few-shot examples, using bare prompt");
                Vec::new()
            }
        };
        let prompt = build_prompt(email, &examples);

        let raw = match self.generate_with_retry(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(email_id = %email.message_id, model = %model, error = %e,
                      "LLM backend failed, escalating");
                return LlmEvaluation {
                    outcome: TierOutcome::Decline {
                        reason: format!("llm backend failed: {e}"),
                        suggestion: None,
                    },
                    model,
                    backend_failed: true,
                };
            }
        };

        let verdict = match parse_verdict(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(email_id = %email.message_id, model = %model, error = %e,
                      "Unparseable LLM verdict, escalating");
                return LlmEvaluation {
                    outcome: TierOutcome::Decline {
                        reason: format!("unparseable llm verdict: {e}"),
                        suggestion: None,
                    },
                    model,
                    backend_failed: true,
                };
            }
        };

        // Confident verdicts validate the examples that shaped the prompt;
        // declines count gently against them. Best effort only.
        let confident = verdict.category != EmailCategory::Unknown
            && verdict.confidence >= self.confidence_threshold;
        let delta = if confident { 0.05 } else { -0.02 };
        for example in &examples {
            if let Err(e) = self.store.adjust_example_effectiveness(example.id, delta).await {
                debug!(example_id = example.id, error = %e, "Effectiveness update failed");
            }
        }

        if verdict.category == EmailCategory::Unknown {
            return LlmEvaluation {
                outcome: TierOutcome::Decline {
                    reason: "model could not categorize".into(),
                    suggestion: Some(verdict),
                },
                model,
                backend_failed: false,
            };
        }

        if verdict.confidence < self.confidence_threshold {
            return LlmEvaluation {
                outcome: TierOutcome::Decline {
                    reason: format!(
                        "confidence {:.2} below threshold {:.2}",
                        verdict.confidence, self.confidence_threshold
                    ),
                    suggestion: Some(verdict),
                },
                model,
                backend_failed: false,
            };
        }

        LlmEvaluation {
            outcome: TierOutcome::Verdict(verdict),
            model,
            backend_failed: false,
        }
    }

    /// The most effective examples across categories, trimmed to the
    /// prompt budget.
    async fn prompt_examples(&self) -> crate::error::Result<Vec<TrainingExampleRow>> {
        let per_category = futures::future::try_join_all(
            EmailCategory::ALL
                .iter()
                .map(|category| self.store.few_shot_examples(*category, self.few_shot_cap)),
        )
        .await?;
        let mut all: Vec<TrainingExampleRow> = per_category.into_iter().flatten().collect();
        all.sort_by(|a, b| {
            b.effectiveness_score
                .partial_cmp(&a.effectiveness_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(self.prompt_example_count);
        Ok(all)
    }

    async fn generate_with_retry(&self, prompt: &str) -> Result<String, LlmError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let base = self.retry_backoff * attempt;
                let jitter = {
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(rng.gen_range(0..=self.retry_backoff.as_millis() as u64))
                };
                tokio::time::sleep(base + jitter).await;
            }
            match self.client.generate(prompt).await {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    debug!(attempt, error = %e, "LLM generate attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }
}

fn build_prompt(email: &EmailRecord, examples: &[TrainingExampleRow]) -> String {
    let categories = EmailCategory::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        "You are classifying one email from a personal mailbox.\n\
         Categories: {categories}\n\
         Actions: KEEP, DELETE, ARCHIVE\n\
         Rules:\n\
         - If you are not sure what this email is, use category UNKNOWN.\n\
         - When uncertain between actions, choose KEEP.\n\
         - Never choose DELETE for WORK, FINANCIAL, PERSONAL, HEALTH, or LEGAL email.\n\
         - fraud_score is 0-100, your estimate that this email is a scam.\n\n"
    );

    if !examples.is_empty() {
        prompt.push_str("Examples of past classifications:\n");
        for example in examples {
            prompt.push_str(&format!(
                "---\n{}\n=> category {}, action {}\n",
                example.text,
                example.category.as_str(),
                example.action.as_str()
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Email to classify:\n---\n{}\n---\n\n\
         Respond with exactly one JSON object:\n\
         {{\"category\": \"...\", \"action\": \"...\", \"confidence\": 0.0, \
         \"reasoning\": \"...\", \"fraud_score\": 0}}",
        email.classification_text()
    ));
    prompt
}

/// Pull the first JSON object out of model output that may be wrapped in
/// markdown fences or prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let text = if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        after.split("```").next().unwrap_or(after)
    } else if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        after.split("```").next().unwrap_or(after)
    } else {
        text
    };

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_verdict(raw: &str) -> Result<Verdict, LlmError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| LlmError::Parse("no JSON object in response".into()))?;
    let parsed: RawVerdict = serde_json::from_str(json)?;

    let category = EmailCategory::parse(parsed.category.trim())
        .ok_or_else(|| LlmError::Parse(format!("unknown category '{}'", parsed.category)))?;
    let action = EmailAction::parse(parsed.action.trim())
        .ok_or_else(|| LlmError::Parse(format!("unknown action '{}'", parsed.action)))?;
    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(LlmError::Parse(format!(
            "confidence {} out of range",
            parsed.confidence
        )));
    }

    Ok(Verdict {
        category,
        action,
        confidence: parsed.confidence,
        reasoning: parsed.reasoning,
        fraud_score: parsed.fraud_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn model_name(&self) -> &str {
            "test-llm"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(LlmError::RequestFailed("script exhausted".into()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn email() -> EmailRecord {
        EmailRecord {
            message_id: "m1".into(),
            thread_id: None,
            subject: "Huge sale ends tonight".into(),
            sender_email: "deals@shop.com".into(),
            sender_name: None,
            recipients: vec![],
            date_sent: Some(Utc::now()),
            snippet: "Everything must go".into(),
            labels: vec![],
            has_attachments: false,
            attachment_count: 0,
            size_bytes: None,
        }
    }

    async fn reasoner_with(responses: Vec<Result<String, LlmError>>) -> (LlmReasoner, Arc<ScriptedLlm>) {
        let store = Arc::new(Store::new_memory().await.unwrap());
        let client = Arc::new(ScriptedLlm::new(responses));
        let mut config = EngineConfig::default();
        config.llm_retry_backoff = Duration::from_millis(1);
        (
            LlmReasoner::new(store, client.clone(), &config),
            client,
        )
    }

    const GOOD: &str = r#"{"category": "PROMOTIONAL", "action": "DELETE",
        "confidence": 0.93, "reasoning": "bulk promotion", "fraud_score": 4}"#;

    #[tokio::test]
    async fn confident_verdict_passes() {
        let (reasoner, _) = reasoner_with(vec![Ok(GOOD.into())]).await;
        let eval = reasoner.evaluate(&email()).await;
        assert_eq!(eval.model, "test-llm");
        assert!(!eval.backend_failed);
        match eval.outcome {
            TierOutcome::Verdict(v) => {
                assert_eq!(v.category, EmailCategory::Promotional);
                assert_eq!(v.action, EmailAction::Delete);
                assert_eq!(v.fraud_score, Some(4));
            }
            TierOutcome::Decline { .. } => panic!("0.93 clears the gate"),
        }
    }

    #[tokio::test]
    async fn markdown_fenced_json_is_accepted() {
        let fenced = format!("Sure, here is the classification:\n```json\n{GOOD}\n```\n");
        let (reasoner, _) = reasoner_with(vec![Ok(fenced)]).await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(matches!(eval.outcome, TierOutcome::Verdict(_)));
    }

    #[tokio::test]
    async fn unknown_category_always_escalates() {
        let raw = r#"{"category": "UNKNOWN", "action": "KEEP", "confidence": 0.99}"#;
        let (reasoner, _) = reasoner_with(vec![Ok(raw.into())]).await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(!eval.backend_failed);
        match eval.outcome {
            TierOutcome::Decline { suggestion, .. } => {
                // High confidence does not rescue an UNKNOWN verdict
                assert_eq!(suggestion.unwrap().category, EmailCategory::Unknown);
            }
            TierOutcome::Verdict(_) => panic!("UNKNOWN must escalate"),
        }
    }

    #[tokio::test]
    async fn low_confidence_declines_with_suggestion() {
        let raw = r#"{"category": "NEWSLETTER", "action": "ARCHIVE", "confidence": 0.5}"#;
        let (reasoner, _) = reasoner_with(vec![Ok(raw.into())]).await;
        let eval = reasoner.evaluate(&email()).await;
        match eval.outcome {
            TierOutcome::Decline { suggestion, .. } => {
                assert_eq!(suggestion.unwrap().category, EmailCategory::Newsletter);
            }
            TierOutcome::Verdict(_) => panic!("0.5 must not clear the gate"),
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (reasoner, client) = reasoner_with(vec![
            Err(LlmError::Status(503)),
            Ok(GOOD.into()),
        ])
        .await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(matches!(eval.outcome, TierOutcome::Verdict(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_decline_as_backend_failure() {
        let (reasoner, client) = reasoner_with(vec![
            Err(LlmError::Status(503)),
            Err(LlmError::Status(503)),
            Err(LlmError::Status(503)),
        ])
        .await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(eval.backend_failed);
        assert!(matches!(
            eval.outcome,
            TierOutcome::Decline { suggestion: None, .. }
        ));
        // Default config: initial try + two retries
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn garbage_response_declines_as_backend_failure() {
        let (reasoner, _) = reasoner_with(vec![Ok("I cannot help with that.".into())]).await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(eval.backend_failed);
    }

    #[tokio::test]
    async fn invalid_category_string_declines() {
        let raw = r#"{"category": "JUNK_MAIL", "action": "DELETE", "confidence": 0.9}"#;
        let (reasoner, _) = reasoner_with(vec![Ok(raw.into())]).await;
        let eval = reasoner.evaluate(&email()).await;
        assert!(eval.backend_failed);
        assert!(matches!(eval.outcome, TierOutcome::Decline { .. }));
    }

    #[test]
    fn extract_json_handles_nested_braces_and_strings() {
        let text = r#"noise {"a": "b with } brace", "c": {"d": 1}} trailing"#;
        let json = extract_json_object(text).unwrap();
        assert_eq!(json, r#"{"a": "b with } brace", "c": {"d": 1}}"#);
    }

    #[test]
    fn prompt_includes_examples_and_contract() {
        let example = TrainingExampleRow {
            id: 1,
            email_id: "m0".into(),
            text: "Subject: Team standup".into(),
            category: EmailCategory::Work,
            action: EmailAction::Keep,
            provenance: crate::store::Provenance::Human,
            example_type: "positive".into(),
            effectiveness_score: 0.9,
            used: false,
        };
        let prompt = build_prompt(&email(), &[example]);
        assert!(prompt.contains("Subject: Team standup"));
        assert!(prompt.contains("=> category WORK, action KEEP"));
        assert!(prompt.contains("UNKNOWN"));
        assert!(prompt.contains("fraud_score"));
    }
}
