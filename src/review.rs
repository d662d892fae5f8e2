//! Tier 3 — the human review queue.
//!
//! Items arrive from the router with the suggestion trail of every tier
//! the email visited. A human verdict is terminal and final at
//! confidence 1.0; resolving an item atomically writes the decision,
//! mints a training example, and closes the item.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{DatabaseError, Result};
use crate::learning::LearningCoordinator;
use crate::store::{ReviewItemRow, Store};
use crate::types::{Decision, EmailAction, EmailCategory, Tier};

/// Model name recorded on human decisions.
pub const HUMAN_MODEL: &str = "human";

/// A human's answer for one review item.
#[derive(Debug, Clone)]
pub struct HumanVerdict {
    pub category: EmailCategory,
    pub action: EmailAction,
    /// Optional note; becomes the decision's reasoning.
    pub note: Option<String>,
}

pub struct ReviewQueue {
    store: Arc<Store>,
    /// When present, resolved verdicts feed rule induction.
    learning: Option<Arc<LearningCoordinator>>,
    analysis_version: String,
}

impl ReviewQueue {
    pub fn new(
        store: Arc<Store>,
        learning: Option<Arc<LearningCoordinator>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            learning,
            analysis_version: config.analysis_version.clone(),
        }
    }

    /// The next item to review: most urgent priority band first, oldest
    /// first within a band.
    pub async fn next(&self) -> Result<Option<ReviewItemRow>> {
        Ok(self.store.next_review().await?)
    }

    pub async fn pending_count(&self) -> Result<i64> {
        Ok(self.store.pending_review_count().await?)
    }

    /// Resolve an item with a human verdict.
    ///
    /// Three effects in one transaction: a tier-3 decision at confidence
    /// 1.0, a human-provenance training example, and the item flipping to
    /// reviewed. A failure leaves all three undone and the item pending.
    pub async fn resolve(&self, item_id: i64, verdict: HumanVerdict) -> Result<Decision> {
        let item = self
            .store
            .get_review_item(item_id)
            .await?
            .ok_or(DatabaseError::NotFound {
                entity: "review item".into(),
                id: item_id.to_string(),
            })?;

        let email =
            self.store
                .get_email(&item.email_id)
                .await?
                .ok_or(DatabaseError::NotFound {
                    entity: "email".into(),
                    id: item.email_id.clone(),
                })?;

        let decision = Decision {
            email_id: item.email_id.clone(),
            analysis_version: self.analysis_version.clone(),
            model: HUMAN_MODEL.into(),
            category: verdict.category,
            action: verdict.action,
            confidence: 1.0,
            fraud_score: None,
            reasoning: verdict.note,
            tier: Tier::Human,
            decided_at: Utc::now(),
        };

        self.store
            .resolve_review(
                item_id,
                &decision,
                &item.suggestions,
                &email.classification_text(),
            )
            .await?;

        info!(
            item_id,
            email_id = %decision.email_id,
            category = decision.category.as_str(),
            action = decision.action.as_str(),
            "Review resolved"
        );

        if let Some(learning) = &self.learning {
            if let Err(e) = Arc::clone(learning).observe(&email, &decision).await {
                warn!(item_id, error = %e, "Learning observation failed");
            }
        }
        Ok(decision)
    }

    /// Skip an item. Terminal: the email gets no decision and no example,
    /// and the item never resurfaces.
    pub async fn skip(&self, item_id: i64) -> Result<()> {
        self.store.skip_review(item_id).await?;
        info!(item_id, "Review item skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReviewStatus;
    use crate::types::EmailRecord;

    fn email(id: &str) -> EmailRecord {
        EmailRecord {
            message_id: id.into(),
            thread_id: None,
            subject: "Quarterly statement".into(),
            sender_email: "bank@example.com".into(),
            sender_name: None,
            recipients: vec![],
            date_sent: Some(Utc::now()),
            snippet: "Your statement is ready".into(),
            labels: vec![],
            has_attachments: false,
            attachment_count: 0,
            size_bytes: None,
        }
    }

    async fn queue() -> (ReviewQueue, Arc<Store>) {
        let store = Arc::new(Store::new_memory().await.unwrap());
        let queue = ReviewQueue::new(store.clone(), None, &EngineConfig::default());
        (queue, store)
    }

    #[tokio::test]
    async fn urgent_items_come_first_fifo_within_band() {
        let (queue, store) = queue().await;
        store.enqueue_review("m1", &[], "low_confidence", 5).await.unwrap();
        store.enqueue_review("m2", &[], "llm_failed", 3).await.unwrap();
        store.enqueue_review("m3", &[], "llm_failed", 3).await.unwrap();

        let first = queue.next().await.unwrap().unwrap();
        assert_eq!(first.email_id, "m2");

        queue.skip(first.id).await.unwrap();
        let second = queue.next().await.unwrap().unwrap();
        assert_eq!(second.email_id, "m3");

        queue.skip(second.id).await.unwrap();
        let third = queue.next().await.unwrap().unwrap();
        assert_eq!(third.email_id, "m1");
    }

    #[tokio::test]
    async fn resolve_writes_final_decision_and_example() {
        let (queue, store) = queue().await;
        store.upsert_email(&email("m1")).await.unwrap();
        let item_id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();

        let decision = queue
            .resolve(
                item_id,
                HumanVerdict {
                    category: EmailCategory::Financial,
                    action: EmailAction::Keep,
                    note: Some("bank statement".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(decision.tier, Tier::Human);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.model, HUMAN_MODEL);

        let stored = store.latest_decision("m1", "v2.0").await.unwrap().unwrap();
        assert_eq!(stored.category, EmailCategory::Financial);
        assert_eq!(store.count_unused_examples().await.unwrap(), 1);

        let item = store.get_review_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ReviewStatus::Reviewed);
    }

    #[tokio::test]
    async fn resolve_unknown_item_fails() {
        let (queue, _) = queue().await;
        let result = queue
            .resolve(
                999,
                HumanVerdict {
                    category: EmailCategory::Spam,
                    action: EmailAction::Delete,
                    note: None,
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn skipped_item_leaves_no_trace() {
        let (queue, store) = queue().await;
        store.upsert_email(&email("m1")).await.unwrap();
        let item_id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();

        queue.skip(item_id).await.unwrap();
        assert!(store.latest_decision("m1", "v2.0").await.unwrap().is_none());
        assert_eq!(store.count_unused_examples().await.unwrap(), 0);
        assert!(queue.next().await.unwrap().is_none());
    }
}
