//! Tier 1 — the personalized classifier.
//!
//! The classifier itself lives behind [`ClassifierBackend`]; this module
//! owns the version gate around it. Exactly one model version per type is
//! active at a time, and the in-memory handle swaps atomically when a new
//! version is promoted.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{AdapterError, Result};
use crate::store::{ModelVersionRow, Store, TrainingExampleRow};
use crate::types::{EmailAction, EmailCategory, EmailRecord, TierOutcome, Verdict};

/// Model type key for the personalized classifier in `model_versions`.
pub const PERSONALIZED_MODEL_TYPE: &str = "personalized";

/// What a training run produced.
#[derive(Debug, Clone)]
pub struct TrainedArtifact {
    /// Unique version name, e.g. `personalized-v3`.
    pub name: String,
    pub validation_accuracy: f64,
}

/// A raw backend prediction, before the confidence gate.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub category: EmailCategory,
    pub action: EmailAction,
    pub confidence: f32,
}

/// The trained-model backend: a local inference process, a sidecar
/// service, whatever actually runs the model.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Train a new version from the full labeled corpus.
    async fn train(
        &self,
        examples: &[TrainingExampleRow],
    ) -> std::result::Result<TrainedArtifact, AdapterError>;

    /// Classify one email's text with a named model version.
    async fn predict(
        &self,
        model_name: &str,
        text: &str,
    ) -> std::result::Result<Prediction, AdapterError>;
}

/// [`ClassifierBackend`] over an HTTP sidecar that owns the actual model
/// weights and training loop.
pub struct HttpClassifierBackend {
    http: reqwest::Client,
    base_url: String,
}

#[derive(serde::Serialize)]
struct SidecarExample<'a> {
    text: &'a str,
    category: &'a str,
    action: &'a str,
}

#[derive(serde::Deserialize)]
struct SidecarTrainResponse {
    name: String,
    validation_accuracy: f64,
}

#[derive(serde::Deserialize)]
struct SidecarPrediction {
    category: String,
    action: String,
    confidence: f32,
}

impl HttpClassifierBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> AdapterError {
        AdapterError::Unavailable {
            name: "classifier-sidecar".into(),
            reason: e.to_string(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> AdapterError {
        AdapterError::InvalidResponse {
            name: "classifier-sidecar".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ClassifierBackend for HttpClassifierBackend {
    async fn train(
        &self,
        examples: &[TrainingExampleRow],
    ) -> std::result::Result<TrainedArtifact, AdapterError> {
        let payload: Vec<SidecarExample> = examples
            .iter()
            .map(|e| SidecarExample {
                text: &e.text,
                category: e.category.as_str(),
                action: e.action.as_str(),
            })
            .collect();

        let response = self
            .http
            .post(self.url("train"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.invalid(format!("train returned {}", response.status())));
        }
        let body: SidecarTrainResponse = response
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;
        Ok(TrainedArtifact {
            name: body.name,
            validation_accuracy: body.validation_accuracy,
        })
    }

    async fn predict(
        &self,
        model_name: &str,
        text: &str,
    ) -> std::result::Result<Prediction, AdapterError> {
        let response = self
            .http
            .post(self.url("predict"))
            .json(&serde_json::json!({ "model": model_name, "text": text }))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.invalid(format!("predict returned {}", response.status())));
        }
        let body: SidecarPrediction = response
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;

        let category = EmailCategory::parse(&body.category)
            .ok_or_else(|| self.invalid(format!("unknown category '{}'", body.category)))?;
        let action = EmailAction::parse(&body.action)
            .ok_or_else(|| self.invalid(format!("unknown action '{}'", body.action)))?;
        Ok(Prediction {
            category,
            action,
            confidence: body.confidence,
        })
    }
}

/// Tier-1 adapter: active-version tracking plus the confidence gate.
pub struct PersonalizedClassifier {
    store: Arc<Store>,
    backend: Arc<dyn ClassifierBackend>,
    active: RwLock<Option<Arc<ModelVersionRow>>>,
    confidence_threshold: f32,
}

impl PersonalizedClassifier {
    /// Build the adapter, picking up whatever version is active in the
    /// store. No active version is a valid state (cold start): the tier
    /// declines everything until a first model is promoted.
    pub async fn load(
        store: Arc<Store>,
        backend: Arc<dyn ClassifierBackend>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let classifier = Self {
            store,
            backend,
            active: RwLock::new(None),
            confidence_threshold: config.classifier_confidence_threshold,
        };
        classifier.refresh().await?;
        Ok(classifier)
    }

    /// Re-read the active version from the store and swap it in.
    /// Called after a promotion commits.
    pub async fn refresh(&self) -> Result<()> {
        let current = self.store.active_model(PERSONALIZED_MODEL_TYPE).await?;
        match &current {
            Some(m) => info!(model = %m.name, accuracy = m.validation_accuracy,
                             "Active classifier version"),
            None => debug!("No active classifier version"),
        }
        *self.active.write().await = current.map(Arc::new);
        Ok(())
    }

    /// The active version's name, used as the decision `model` field.
    pub async fn active_model_name(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|m| m.name.clone())
    }

    pub fn backend(&self) -> Arc<dyn ClassifierBackend> {
        self.backend.clone()
    }

    /// Attempt a tier-1 verdict.
    ///
    /// Every failure mode is a decline, not an error: no active model,
    /// backend unavailable, or confidence under the gate. The raw
    /// prediction rides along as the escalation suggestion.
    pub async fn evaluate(&self, email: &EmailRecord) -> (TierOutcome, Option<String>) {
        let Some(model) = self.active.read().await.clone() else {
            return (
                TierOutcome::Decline {
                    reason: "no active classifier version".into(),
                    suggestion: None,
                },
                None,
            );
        };

        let text = email.classification_text();
        let prediction = match self.backend.predict(&model.name, &text).await {
            Ok(p) => p,
            Err(e) => {
                warn!(model = %model.name, email_id = %email.message_id, error = %e,
                      "Classifier backend failed, escalating");
                return (
                    TierOutcome::Decline {
                        reason: format!("classifier backend failed: {e}"),
                        suggestion: None,
                    },
                    Some(model.name.clone()),
                );
            }
        };

        let verdict = Verdict {
            category: prediction.category,
            action: prediction.action,
            confidence: prediction.confidence,
            reasoning: None,
            fraud_score: None,
        };

        if prediction.confidence < self.confidence_threshold {
            return (
                TierOutcome::Decline {
                    reason: format!(
                        "confidence {:.2} below threshold {:.2}",
                        prediction.confidence, self.confidence_threshold
                    ),
                    suggestion: Some(verdict),
                },
                Some(model.name.clone()),
            );
        }

        (TierOutcome::Verdict(verdict), Some(model.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FixedBackend {
        prediction: Option<Prediction>,
    }

    #[async_trait]
    impl ClassifierBackend for FixedBackend {
        async fn train(
            &self,
            _examples: &[TrainingExampleRow],
        ) -> std::result::Result<TrainedArtifact, AdapterError> {
            Ok(TrainedArtifact {
                name: "personalized-test".into(),
                validation_accuracy: 0.9,
            })
        }

        async fn predict(
            &self,
            _model_name: &str,
            _text: &str,
        ) -> std::result::Result<Prediction, AdapterError> {
            self.prediction.clone().ok_or(AdapterError::Unavailable {
                name: "classifier".into(),
                reason: "connection refused".into(),
            })
        }
    }

    fn email() -> EmailRecord {
        EmailRecord {
            message_id: "m1".into(),
            thread_id: None,
            subject: "Invoice".into(),
            sender_email: "billing@vendor.com".into(),
            sender_name: None,
            recipients: vec![],
            date_sent: Some(Utc::now()),
            snippet: "Your invoice is attached".into(),
            labels: vec![],
            has_attachments: true,
            attachment_count: 1,
            size_bytes: None,
        }
    }

    async fn classifier_with(prediction: Option<Prediction>, promote: bool) -> PersonalizedClassifier {
        let store = Arc::new(Store::new_memory().await.unwrap());
        if promote {
            let id = store
                .insert_model_version("personalized-v1", PERSONALIZED_MODEL_TYPE, None, 100, 0.85)
                .await
                .unwrap();
            store.promote_model(id).await.unwrap();
        }
        PersonalizedClassifier::load(
            store,
            Arc::new(FixedBackend { prediction }),
            &EngineConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn declines_when_no_active_model() {
        let classifier = classifier_with(
            Some(Prediction {
                category: EmailCategory::Financial,
                action: EmailAction::Keep,
                confidence: 0.99,
            }),
            false,
        )
        .await;

        let (outcome, model) = classifier.evaluate(&email()).await;
        assert!(model.is_none());
        assert!(matches!(outcome, TierOutcome::Decline { .. }));
    }

    #[tokio::test]
    async fn confident_prediction_passes_gate() {
        let classifier = classifier_with(
            Some(Prediction {
                category: EmailCategory::Financial,
                action: EmailAction::Keep,
                confidence: 0.92,
            }),
            true,
        )
        .await;

        let (outcome, model) = classifier.evaluate(&email()).await;
        assert_eq!(model.as_deref(), Some("personalized-v1"));
        match outcome {
            TierOutcome::Verdict(v) => {
                assert_eq!(v.category, EmailCategory::Financial);
                assert!((v.confidence - 0.92).abs() < 1e-6);
            }
            TierOutcome::Decline { .. } => panic!("0.92 clears the 0.85 gate"),
        }
    }

    #[tokio::test]
    async fn low_confidence_declines_with_suggestion() {
        let classifier = classifier_with(
            Some(Prediction {
                category: EmailCategory::Newsletter,
                action: EmailAction::Archive,
                confidence: 0.60,
            }),
            true,
        )
        .await;

        let (outcome, _) = classifier.evaluate(&email()).await;
        match outcome {
            TierOutcome::Decline { suggestion, .. } => {
                let s = suggestion.expect("best guess must be carried forward");
                assert_eq!(s.category, EmailCategory::Newsletter);
                assert!((s.confidence - 0.60).abs() < 1e-6);
            }
            TierOutcome::Verdict(_) => panic!("0.60 must not clear the gate"),
        }
    }

    #[tokio::test]
    async fn backend_failure_is_a_decline_not_an_error() {
        let classifier = classifier_with(None, true).await;

        let (outcome, _) = classifier.evaluate(&email()).await;
        assert!(matches!(
            outcome,
            TierOutcome::Decline {
                suggestion: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn refresh_picks_up_promotion() {
        let classifier = classifier_with(
            Some(Prediction {
                category: EmailCategory::Work,
                action: EmailAction::Keep,
                confidence: 0.95,
            }),
            true,
        )
        .await;
        assert_eq!(
            classifier.active_model_name().await.as_deref(),
            Some("personalized-v1")
        );

        let v2 = classifier
            .store
            .insert_model_version("personalized-v2", PERSONALIZED_MODEL_TYPE, None, 200, 0.9)
            .await
            .unwrap();
        classifier.store.promote_model(v2).await.unwrap();

        // Not visible until refresh
        assert_eq!(
            classifier.active_model_name().await.as_deref(),
            Some("personalized-v1")
        );
        classifier.refresh().await.unwrap();
        assert_eq!(
            classifier.active_model_name().await.as_deref(),
            Some("personalized-v2")
        );
    }
}
