//! The tier router — cost-graduated escalation.
//!
//! One email walks the tiers in order (rules, classifier, LLM), stopping
//! at the first verdict. Every decline carries its suggestion forward;
//! when all automated tiers decline, the email lands in the human review
//! queue with the full suggestion trail.
//!
//! Batches run emails in parallel under a concurrency bound, but tiers
//! within one email are always sequential. Cancellation takes effect
//! between emails, never mid-pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::classifier::PersonalizedClassifier;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::learning::LearningCoordinator;
use crate::llm::reasoner::LlmReasoner;
use crate::rules::RulesEngine;
use crate::store::Store;
use crate::types::{Decision, EmailRecord, Tier, TierOutcome, TierSuggestion, Verdict};

/// Review-queue provenance labels.
pub const PROVENANCE_LOW_CONFIDENCE: &str = "low_confidence";
pub const PROVENANCE_LLM_FAILED: &str = "llm_failed";

/// Where one email ended up.
#[derive(Debug)]
pub enum RoutedOutcome {
    /// A tier committed and the decision was persisted.
    Decided(Decision),
    /// All automated tiers declined; queued for human review.
    Enqueued { item_id: i64, priority: u8 },
    /// A decision already exists under this epoch; nothing was run.
    AlreadyDecided(Decision),
    /// A pending review item already exists; nothing was run.
    AlreadyQueued,
}

pub struct TierRouter {
    store: Arc<Store>,
    rules: Arc<RulesEngine>,
    classifier: Arc<PersonalizedClassifier>,
    reasoner: Arc<LlmReasoner>,
    /// When present, every finalized decision is fed to the learning loop.
    learning: Option<Arc<LearningCoordinator>>,
    analysis_version: String,
    classifier_timeout: Duration,
    llm_timeout: Duration,
    review_default_priority: u8,
    review_llm_failed_priority: u8,
}

impl TierRouter {
    pub fn new(
        store: Arc<Store>,
        rules: Arc<RulesEngine>,
        classifier: Arc<PersonalizedClassifier>,
        reasoner: Arc<LlmReasoner>,
        learning: Option<Arc<LearningCoordinator>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            rules,
            classifier,
            reasoner,
            learning,
            analysis_version: config.analysis_version.clone(),
            classifier_timeout: config.classifier_timeout,
            llm_timeout: config.llm_timeout,
            review_default_priority: config.review_default_priority,
            review_llm_failed_priority: config.review_llm_failed_priority,
        }
    }

    /// Run one email through the pipeline.
    ///
    /// Only persistence failures return an error. Tier failures of every
    /// kind escalate instead — the pipeline's contract is that an email
    /// always ends up either decided or queued.
    pub async fn process(&self, email: &EmailRecord) -> Result<RoutedOutcome> {
        if let Some(existing) = self
            .store
            .latest_decision(&email.message_id, &self.analysis_version)
            .await?
        {
            debug!(email_id = %email.message_id, "Already decided under this epoch");
            return Ok(RoutedOutcome::AlreadyDecided(existing));
        }
        if self.store.has_pending_review(&email.message_id).await? {
            debug!(email_id = %email.message_id, "Already awaiting review");
            return Ok(RoutedOutcome::AlreadyQueued);
        }

        let mut suggestions: Vec<TierSuggestion> = Vec::new();

        // Tier 0 — rules. Free and deterministic; a hit skips every adapter.
        let (outcome, rule_id) = self.rules.evaluate(email).await;
        match outcome {
            TierOutcome::Verdict(verdict) => {
                let model = format!("rule-{}", rule_id.unwrap_or(0));
                return self
                    .finalize(email, Tier::Rules, model, verdict, &suggestions)
                    .await;
            }
            TierOutcome::Decline { reason, suggestion } => {
                suggestions.push(TierSuggestion {
                    tier: Tier::Rules,
                    verdict: suggestion,
                    decline_reason: Some(reason),
                });
            }
        }

        // Tier 1 — personalized classifier, under its own timeout.
        let (outcome, model) = match tokio::time::timeout(
            self.classifier_timeout,
            self.classifier.evaluate(email),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(email_id = %email.message_id, timeout = ?self.classifier_timeout,
                      "Classifier timed out, escalating");
                (
                    TierOutcome::Decline {
                        reason: format!("classifier timed out after {:?}", self.classifier_timeout),
                        suggestion: None,
                    },
                    None,
                )
            }
        };
        match outcome {
            TierOutcome::Verdict(verdict) => {
                let model = model.unwrap_or_else(|| "personalized-unknown".into());
                return self
                    .finalize(email, Tier::Classifier, model, verdict, &suggestions)
                    .await;
            }
            TierOutcome::Decline { reason, suggestion } => {
                suggestions.push(TierSuggestion {
                    tier: Tier::Classifier,
                    verdict: suggestion,
                    decline_reason: Some(reason),
                });
            }
        }

        // Tier 2 — LLM few-shot, under its own timeout.
        let (outcome, llm_model, backend_failed) =
            match tokio::time::timeout(self.llm_timeout, self.reasoner.evaluate(email)).await {
                Ok(eval) => (eval.outcome, eval.model, eval.backend_failed),
                Err(_) => {
                    warn!(email_id = %email.message_id, timeout = ?self.llm_timeout,
                          "LLM timed out, escalating");
                    (
                        TierOutcome::Decline {
                            reason: format!("llm timed out after {:?}", self.llm_timeout),
                            suggestion: None,
                        },
                        String::new(),
                        true,
                    )
                }
            };
        match outcome {
            TierOutcome::Verdict(verdict) => {
                return self
                    .finalize(email, Tier::Llm, llm_model, verdict, &suggestions)
                    .await;
            }
            TierOutcome::Decline { reason, suggestion } => {
                suggestions.push(TierSuggestion {
                    tier: Tier::Llm,
                    verdict: suggestion,
                    decline_reason: Some(reason),
                });
            }
        }

        // Tier 3 — hand off to a human with everything the tiers guessed.
        let (provenance, priority) = if backend_failed {
            (PROVENANCE_LLM_FAILED, self.review_llm_failed_priority)
        } else {
            (PROVENANCE_LOW_CONFIDENCE, self.review_default_priority)
        };
        let item_id = self
            .store
            .enqueue_review(&email.message_id, &suggestions, provenance, priority)
            .await?;
        info!(email_id = %email.message_id, item_id, provenance, priority,
              "Escalated to human review");
        Ok(RoutedOutcome::Enqueued { item_id, priority })
    }

    async fn finalize(
        &self,
        email: &EmailRecord,
        tier: Tier,
        model: String,
        verdict: Verdict,
        suggestions: &[TierSuggestion],
    ) -> Result<RoutedOutcome> {
        let decision = Decision {
            email_id: email.message_id.clone(),
            analysis_version: self.analysis_version.clone(),
            model,
            category: verdict.category,
            action: verdict.action,
            confidence: verdict.confidence,
            fraud_score: verdict.fraud_score,
            reasoning: verdict.reasoning,
            tier,
            decided_at: Utc::now(),
        };
        self.store.insert_decision(&decision, suggestions).await?;
        info!(
            email_id = %decision.email_id,
            tier = decision.tier.as_i64(),
            category = decision.category.as_str(),
            action = decision.action.as_str(),
            confidence = decision.confidence,
            "Decision recorded"
        );

        // Learning rides along with classification but must never fail it.
        // A triggered training run detaches onto its own task.
        if let Some(learning) = &self.learning {
            if let Err(e) = Arc::clone(learning).observe(email, &decision).await {
                warn!(email_id = %decision.email_id, error = %e, "Learning observation failed");
            }
        }
        Ok(RoutedOutcome::Decided(decision))
    }
}

/// Outcome tallies for one batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub decided: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Emails never started because the batch was cancelled.
    pub cancelled: usize,
}

/// Runs emails through the router in parallel, bounded and cancellable.
pub struct BatchProcessor {
    router: Arc<TierRouter>,
    store: Arc<Store>,
    semaphore: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
}

impl BatchProcessor {
    pub fn new(router: Arc<TierRouter>, store: Arc<Store>, config: &EngineConfig) -> Self {
        Self {
            router,
            store,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_emails)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Takes effect between emails: in-flight
    /// emails finish, not-yet-started ones are dropped.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation before a new run.
    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Process a set of emails by id. Unknown ids count as failed.
    pub async fn run(&self, email_ids: &[String]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut tasks: JoinSet<std::result::Result<RoutedOutcome, Error>> = JoinSet::new();

        for email_id in email_ids {
            if self.cancel.load(Ordering::SeqCst) {
                summary.cancelled += 1;
                continue;
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| crate::error::DatabaseError::Query(e.to_string()))?;

            let router = self.router.clone();
            let store = self.store.clone();
            let email_id = email_id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let email = store.get_email(&email_id).await?.ok_or_else(|| {
                    Error::Database(crate::error::DatabaseError::NotFound {
                        entity: "email".into(),
                        id: email_id.clone(),
                    })
                })?;
                router.process(&email).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(RoutedOutcome::Decided(_))) => summary.decided += 1,
                Ok(Ok(RoutedOutcome::Enqueued { .. })) => summary.enqueued += 1,
                Ok(Ok(RoutedOutcome::AlreadyDecided(_) | RoutedOutcome::AlreadyQueued)) => {
                    summary.skipped += 1
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Email failed in batch");
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Batch task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            decided = summary.decided,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Batch complete"
        );
        Ok(summary)
    }

    /// Run everything not yet decided under the current epoch.
    pub async fn run_pending(&self, limit: usize) -> Result<BatchSummary> {
        let pending = self
            .store
            .unanalyzed_emails(&self.router.analysis_version, limit)
            .await?;
        self.run(&pending).await
    }
}
