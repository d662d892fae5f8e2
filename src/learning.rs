//! The learning feedback loop.
//!
//! Three flows feed it: high-confidence decisions become training
//! examples, consistent decision runs induce new tier-0 rules, and the
//! unused-example count gates retraining. Rule induction is deliberately
//! conservative: exact-sender KEEP whitelisting for protected categories,
//! domain DELETE only for bulk-mail domains, and never a subject rule.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{PERSONALIZED_MODEL_TYPE, PersonalizedClassifier};
use crate::config::EngineConfig;
use crate::error::{LearningError, Result};
use crate::rules::RulesEngine;
use crate::store::{Provenance, RuleType, Store};
use crate::types::{Decision, EmailAction, EmailCategory, EmailRecord, Tier};

/// Domains that host personal mailboxes; a DELETE run from one of these
/// never becomes a domain rule.
const PERSONAL_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
];

/// What a retraining pass did.
#[derive(Debug)]
pub enum TrainingOutcome {
    /// A new version was trained and promoted.
    Promoted { version: String, accuracy: f64 },
    /// Trained, but it did not beat the active version by the required
    /// margin. The version is recorded inactive for lineage.
    Rejected {
        version: String,
        accuracy: f64,
        active_accuracy: f64,
    },
    /// Nothing to train on.
    Skipped,
}

pub struct LearningCoordinator {
    store: Arc<Store>,
    rules: Arc<RulesEngine>,
    classifier: Arc<PersonalizedClassifier>,
    config: EngineConfig,
    /// Armed while the unused-example count is below the threshold; the
    /// retraining trigger fires once per upward crossing, not on every
    /// decision above it.
    retrain_armed: AtomicBool,
}

impl LearningCoordinator {
    pub fn new(
        store: Arc<Store>,
        rules: Arc<RulesEngine>,
        classifier: Arc<PersonalizedClassifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            rules,
            classifier,
            config,
            retrain_armed: AtomicBool::new(true),
        }
    }

    /// Digest one finalized decision.
    ///
    /// When this observation trips the retraining trigger, the training
    /// run is spawned on its own task and its handle is returned; the
    /// caller's pipeline never waits on a training pass. Induction and
    /// curation failures are logged, never fatal: learning must not
    /// break classification.
    pub async fn observe(
        self: Arc<Self>,
        email: &EmailRecord,
        decision: &Decision,
    ) -> Result<Option<JoinHandle<Result<TrainingOutcome>>>> {
        self.curate_example(email, decision).await;
        if let Err(e) = self.try_induce_rule(email, decision).await {
            warn!(email_id = %email.message_id, error = %e, "Rule induction failed");
        }

        let unused = self.store.count_unused_examples().await?;
        let threshold = self.config.retraining_threshold as i64;
        if unused < threshold {
            self.retrain_armed.store(true, Ordering::SeqCst);
            return Ok(None);
        }
        if !self.retrain_armed.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        info!(unused, threshold, "Retraining threshold crossed");
        Ok(Some(tokio::spawn(async move {
            let outcome = self.retrain().await;
            if let Err(e) = &outcome {
                // A failed run leaves the examples unconsumed, so re-arm
                // the trigger and let the next over-threshold observation
                // retry.
                self.retrain_armed.store(true, Ordering::SeqCst);
                warn!(error = %e, "Retraining failed");
            }
            outcome
        })))
    }

    /// Auto-curate: a confident classifier or LLM decision becomes an
    /// example. Human examples are minted by the review queue itself, and
    /// rule decisions are excluded so rules cannot train the model on
    /// their own output.
    async fn curate_example(&self, email: &EmailRecord, decision: &Decision) {
        if decision.tier == Tier::Human
            || decision.tier == Tier::Rules
            || decision.category == EmailCategory::Unknown
            || decision.confidence < self.config.auto_example_min_confidence
        {
            return;
        }
        if let Err(e) = self
            .store
            .insert_training_example(
                &email.message_id,
                &email.classification_text(),
                decision.category,
                decision.action,
                Provenance::HighConfidenceAuto,
                "positive",
            )
            .await
        {
            warn!(email_id = %email.message_id, error = %e, "Example curation failed");
        }
    }

    /// Induce a tier-0 rule when enough independent decisions agree.
    ///
    /// Only two shapes are safe enough to automate:
    /// - exact-sender KEEP for a protected category (whitelisting a
    ///   person can only ever over-keep)
    /// - domain DELETE for bulk-mail categories from non-personal domains
    async fn try_induce_rule(&self, email: &EmailRecord, decision: &Decision) -> Result<()> {
        // A rule decided this email; it cannot vote for more rules.
        if decision.tier == Tier::Rules {
            return Ok(());
        }
        if decision.confidence < self.config.rule_induction_min_confidence {
            return Ok(());
        }

        let min_agreements = self.config.rule_induction_min_agreements as i64;
        let min_confidence = self.config.rule_induction_min_confidence;

        if decision.action == EmailAction::Keep && decision.category.is_protected() {
            let sender = email.sender_email.to_lowercase();
            let agreeing = self
                .store
                .count_agreeing_sender_decisions(&sender, EmailAction::Keep, min_confidence)
                .await?;
            if agreeing >= min_agreements {
                let id = self
                    .rules
                    .add_rule(
                        RuleType::Email,
                        &sender,
                        EmailAction::Keep,
                        Some(decision.category),
                        decision.confidence,
                        decision.tier,
                    )
                    .await?;
                info!(rule_id = id, sender = %sender, agreeing, "Induced sender KEEP rule");
            }
            return Ok(());
        }

        if decision.action == EmailAction::Delete && is_bulk_category(decision.category) {
            let Some(domain) = email.sender_domain() else {
                return Ok(());
            };
            let domain = domain.to_lowercase();
            if PERSONAL_MAIL_DOMAINS.contains(&domain.as_str()) {
                debug!(domain = %domain, "Personal mail domain, no DELETE rule");
                return Ok(());
            }
            let agreeing = self
                .store
                .count_agreeing_domain_decisions(&domain, EmailAction::Delete, min_confidence)
                .await?;
            if agreeing >= min_agreements {
                let id = self
                    .rules
                    .add_rule(
                        RuleType::Domain,
                        &domain,
                        EmailAction::Delete,
                        Some(decision.category),
                        decision.confidence,
                        decision.tier,
                    )
                    .await?;
                info!(rule_id = id, domain = %domain, agreeing, "Induced domain DELETE rule");
            }
        }

        Ok(())
    }

    /// Train a new classifier version from the unused examples and promote
    /// it only if it beats the active version by the configured margin.
    pub async fn retrain(&self) -> Result<TrainingOutcome> {
        let examples = self.store.list_unused_examples().await?;
        if examples.is_empty() {
            debug!("No unused examples, skipping retraining");
            return Ok(TrainingOutcome::Skipped);
        }

        let session_id = Uuid::new_v4();
        self.store
            .insert_training_session(session_id, examples.len() as i64)
            .await?;

        let artifact = match self.classifier.backend().train(&examples).await {
            Ok(a) => a,
            Err(e) => {
                self.store
                    .complete_training_session(session_id, "failed", None)
                    .await?;
                return Err(LearningError::TrainingFailed(e.to_string()).into());
            }
        };

        let active = self.store.active_model(PERSONALIZED_MODEL_TYPE).await?;
        let parent_id = active.as_ref().map(|m| m.id);
        let version_id = self
            .store
            .insert_model_version(
                &artifact.name,
                PERSONALIZED_MODEL_TYPE,
                parent_id,
                examples.len() as i64,
                artifact.validation_accuracy,
            )
            .await?;

        let ids: Vec<i64> = examples.iter().map(|e| e.id).collect();
        self.store.mark_examples_used(&ids).await?;

        if let Some(active) = &active {
            let required = active.validation_accuracy + self.config.promotion_margin;
            if artifact.validation_accuracy <= required {
                self.store
                    .complete_training_session(session_id, "regressed", Some(&artifact.name))
                    .await?;
                warn!(
                    candidate = %artifact.name,
                    candidate_accuracy = artifact.validation_accuracy,
                    active = %active.name,
                    active_accuracy = active.validation_accuracy,
                    "New version rejected, keeping active model"
                );
                return Ok(TrainingOutcome::Rejected {
                    version: artifact.name,
                    accuracy: artifact.validation_accuracy,
                    active_accuracy: active.validation_accuracy,
                });
            }
        }

        self.store.promote_model(version_id).await?;
        self.classifier.refresh().await?;
        self.store
            .complete_training_session(session_id, "completed", Some(&artifact.name))
            .await?;
        info!(version = %artifact.name, accuracy = artifact.validation_accuracy,
              "New classifier version promoted");
        Ok(TrainingOutcome::Promoted {
            version: artifact.name,
            accuracy: artifact.validation_accuracy,
        })
    }
}

fn is_bulk_category(category: EmailCategory) -> bool {
    matches!(
        category,
        EmailCategory::Promotional
            | EmailCategory::Newsletter
            | EmailCategory::Spam
            | EmailCategory::Shopping
    )
}
