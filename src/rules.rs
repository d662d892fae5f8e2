//! Tier 0 — learned exact-match rules.
//!
//! Rules live in the store; matching runs against an immutable in-memory
//! snapshot swapped atomically on reload. Readers never observe a
//! half-updated rule set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::store::{RuleRow, RuleType, Store};
use crate::types::{EmailAction, EmailCategory, EmailRecord, Tier, TierOutcome, Verdict};

/// Immutable snapshot of the active rules, indexed by match key.
///
/// The store returns rules ordered by confidence then match count, so the
/// first rule seen for a key is the tie-break winner.
#[derive(Default)]
struct RuleSet {
    by_email: HashMap<String, RuleRow>,
    by_domain: HashMap<String, RuleRow>,
    by_subject: HashMap<String, RuleRow>,
}

impl RuleSet {
    fn build(rules: Vec<RuleRow>) -> Self {
        let mut set = Self::default();
        for rule in rules {
            let index = match rule.rule_type {
                RuleType::Email => &mut set.by_email,
                RuleType::Domain => &mut set.by_domain,
                RuleType::ExactSubject => &mut set.by_subject,
            };
            index.entry(rule.pattern.clone()).or_insert(rule);
        }
        set
    }

    fn len(&self) -> usize {
        self.by_email.len() + self.by_domain.len() + self.by_subject.len()
    }

    /// Precedence: exact sender address, then sender domain, then exact
    /// subject. More specific evidence wins.
    fn find(&self, email: &EmailRecord) -> Option<&RuleRow> {
        let sender = email.sender_email.to_lowercase();
        if let Some(rule) = self.by_email.get(&sender) {
            return Some(rule);
        }
        if let Some(domain) = email.sender_domain() {
            if let Some(rule) = self.by_domain.get(&domain.to_lowercase()) {
                return Some(rule);
            }
        }
        self.by_subject.get(&email.subject.trim().to_lowercase())
    }
}

/// The tier-0 rules engine.
pub struct RulesEngine {
    store: Arc<Store>,
    snapshot: RwLock<Arc<RuleSet>>,
    accuracy_floor: f64,
    min_feedback_samples: u32,
}

impl RulesEngine {
    /// Load the active rule set and build the first snapshot.
    pub async fn load(store: Arc<Store>, config: &EngineConfig) -> Result<Self> {
        let engine = Self {
            store,
            snapshot: RwLock::new(Arc::new(RuleSet::default())),
            accuracy_floor: config.rule_accuracy_floor,
            min_feedback_samples: config.rule_min_feedback_samples,
        };
        engine.reload().await?;
        Ok(engine)
    }

    /// Rebuild the snapshot from the store and swap it in atomically.
    pub async fn reload(&self) -> Result<()> {
        let rules = self.store.list_active_rules().await?;
        let set = Arc::new(RuleSet::build(rules));
        debug!(rules = set.len(), "Rule snapshot reloaded");
        *self.snapshot.write().await = set;
        Ok(())
    }

    /// Attempt a tier-0 verdict for an email.
    ///
    /// A miss is a decline with no suggestion. A hit is deterministic and
    /// final at confidence 1.0; the matched rule id becomes the decision
    /// model so the verdict stays attributable.
    pub async fn evaluate(&self, email: &EmailRecord) -> (TierOutcome, Option<i64>) {
        let snapshot = self.snapshot.read().await.clone();
        let Some(rule) = snapshot.find(email) else {
            return (
                TierOutcome::Decline {
                    reason: "no rule matched".into(),
                    suggestion: None,
                },
                None,
            );
        };

        // Counter increments are fire-and-forget; a lost bump must not
        // block or fail classification.
        if let Err(e) = self.store.record_rule_match(rule.id).await {
            warn!(rule_id = rule.id, error = %e, "Failed to record rule match");
        }

        let verdict = Verdict {
            category: rule.category.unwrap_or(EmailCategory::Unknown),
            action: rule.action,
            confidence: 1.0,
            reasoning: Some(format!(
                "matched {} rule '{}'",
                rule.rule_type.as_str(),
                rule.pattern
            )),
            fraud_score: None,
        };
        (TierOutcome::Verdict(verdict), Some(rule.id))
    }

    /// Register a new rule (or reinforce an existing one) and publish it.
    pub async fn add_rule(
        &self,
        rule_type: RuleType,
        pattern: &str,
        action: EmailAction,
        category: Option<EmailCategory>,
        confidence: f32,
        created_by_tier: Tier,
    ) -> Result<i64> {
        let id = self
            .store
            .insert_or_reinforce_rule(rule_type, pattern, action, category, confidence, created_by_tier)
            .await?;
        self.reload().await?;
        Ok(id)
    }

    /// Feed correctness feedback into a rule's rolling accuracy.
    ///
    /// Deactivation uses the counters returned by the same write, never a
    /// stale snapshot, and only once the sample size is meaningful.
    pub async fn apply_feedback(&self, rule_id: i64, was_correct: bool) -> Result<()> {
        let rule = self.store.apply_rule_feedback(rule_id, was_correct).await?;

        if rule.times_checked >= self.min_feedback_samples as i64 {
            if let Some(accuracy) = rule.accuracy() {
                if accuracy < self.accuracy_floor {
                    warn!(
                        rule_id,
                        accuracy,
                        checked = rule.times_checked,
                        "Rule accuracy below floor, deactivating"
                    );
                    self.store.deactivate_rule(rule_id).await?;
                    self.reload().await?;
                }
            }
        }
        Ok(())
    }
}
