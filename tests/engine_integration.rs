//! End-to-end pipeline tests: real store and rules, mock classifier and
//! LLM backends, full learning and review wiring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use mailsift::classifier::{ClassifierBackend, PersonalizedClassifier, Prediction, TrainedArtifact};
use mailsift::cleanup::{CandidateFilter, CleanupOrchestrator, MailStore};
use mailsift::config::EngineConfig;
use mailsift::error::{AdapterError, LlmError};
use mailsift::learning::LearningCoordinator;
use mailsift::llm::LlmClient;
use mailsift::llm::reasoner::LlmReasoner;
use mailsift::review::{HumanVerdict, ReviewQueue};
use mailsift::router::{RoutedOutcome, TierRouter};
use mailsift::rules::RulesEngine;
use mailsift::store::Store;
use mailsift::types::{EmailAction, EmailCategory, EmailRecord, Tier};

/// Classifier backend with no trained model behind it: trains on demand,
/// predicts with fixed low confidence so tier 1 always escalates.
struct TimidClassifier;

#[async_trait]
impl ClassifierBackend for TimidClassifier {
    async fn train(
        &self,
        examples: &[mailsift::store::TrainingExampleRow],
    ) -> Result<TrainedArtifact, AdapterError> {
        Ok(TrainedArtifact {
            name: format!("personalized-{}", examples.len()),
            validation_accuracy: 0.8,
        })
    }

    async fn predict(&self, _model: &str, _text: &str) -> Result<Prediction, AdapterError> {
        Ok(Prediction {
            category: EmailCategory::Unknown,
            action: EmailAction::Keep,
            confidence: 0.3,
        })
    }
}

/// LLM that answers promotional DELETE for shopping domains and declines
/// everything else, counting calls.
struct PatternLlm {
    calls: AtomicU32,
}

#[async_trait]
impl LlmClient for PatternLlm {
    fn model_name(&self) -> &str {
        "pattern-llm"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("@deals.example") {
            Ok(r#"{"category": "PROMOTIONAL", "action": "DELETE",
                   "confidence": 0.97, "reasoning": "bulk promotion", "fraud_score": 2}"#
                .into())
        } else {
            Ok(r#"{"category": "UNKNOWN", "action": "KEEP", "confidence": 0.4}"#.into())
        }
    }
}

struct Engine {
    store: Arc<Store>,
    router: Arc<TierRouter>,
    review: ReviewQueue,
    llm_calls: Arc<PatternLlm>,
    config: EngineConfig,
}

async fn engine() -> Engine {
    let store = Arc::new(Store::new_memory().await.unwrap());
    let mut config = EngineConfig::default();
    config.llm_retry_backoff = Duration::from_millis(1);

    let rules = Arc::new(RulesEngine::load(store.clone(), &config).await.unwrap());
    let classifier = Arc::new(
        PersonalizedClassifier::load(store.clone(), Arc::new(TimidClassifier), &config)
            .await
            .unwrap(),
    );
    let llm = Arc::new(PatternLlm {
        calls: AtomicU32::new(0),
    });
    let reasoner = Arc::new(LlmReasoner::new(store.clone(), llm.clone(), &config));
    let learning = Arc::new(LearningCoordinator::new(
        store.clone(),
        rules.clone(),
        classifier.clone(),
        config.clone(),
    ));
    let router = Arc::new(TierRouter::new(
        store.clone(),
        rules,
        classifier,
        reasoner,
        Some(learning.clone()),
        &config,
    ));
    let review = ReviewQueue::new(store.clone(), Some(learning), &config);

    Engine {
        store,
        router,
        review,
        llm_calls: llm,
        config,
    }
}

fn email(id: &str, sender: &str, subject: &str) -> EmailRecord {
    EmailRecord {
        message_id: id.into(),
        thread_id: None,
        subject: subject.into(),
        sender_email: sender.into(),
        sender_name: None,
        recipients: vec!["me@example.com".into()],
        date_sent: Some(Utc::now() - ChronoDuration::days(400)),
        snippet: "preview text".into(),
        labels: vec![],
        has_attachments: false,
        attachment_count: 0,
        size_bytes: Some(2048),
    }
}

#[tokio::test]
async fn llm_decisions_grow_into_tier0_rules() {
    let engine = engine().await;

    // Three promotional emails: each needs the LLM
    for i in 0..3 {
        let e = email(
            &format!("promo-{i}"),
            &format!("offers{i}@deals.example"),
            "Flash sale",
        );
        engine.store.upsert_email(&e).await.unwrap();
        let outcome = engine.router.process(&e).await.unwrap();
        match outcome {
            RoutedOutcome::Decided(d) => assert_eq!(d.tier, Tier::Llm),
            other => panic!("expected llm decision, got {other:?}"),
        }
    }
    let llm_calls_before = engine.llm_calls.calls.load(Ordering::SeqCst);
    assert!(llm_calls_before >= 3);

    // Consistent run induced a domain DELETE rule
    let rules = engine.store.list_active_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].pattern, "deals.example");

    // The fourth email short-circuits at tier 0
    let e = email("promo-3", "offers3@deals.example", "Another sale");
    engine.store.upsert_email(&e).await.unwrap();
    match engine.router.process(&e).await.unwrap() {
        RoutedOutcome::Decided(d) => {
            assert_eq!(d.tier, Tier::Rules);
            assert_eq!(d.confidence, 1.0);
        }
        other => panic!("expected rule decision, got {other:?}"),
    }
    assert_eq!(
        engine.llm_calls.calls.load(Ordering::SeqCst),
        llm_calls_before
    );

    // High-confidence llm decisions were curated as examples
    assert_eq!(engine.store.count_unused_examples().await.unwrap(), 3);
}

#[tokio::test]
async fn unresolvable_email_flows_through_human_review() {
    let engine = engine().await;

    let e = email("odd-1", "someone@obscure.example", "Re: that thing");
    engine.store.upsert_email(&e).await.unwrap();

    // Classifier cold, LLM answers UNKNOWN: lands in review
    let item_id = match engine.router.process(&e).await.unwrap() {
        RoutedOutcome::Enqueued { item_id, .. } => item_id,
        other => panic!("expected review enqueue, got {other:?}"),
    };

    let item = engine.review.next().await.unwrap().unwrap();
    assert_eq!(item.id, item_id);
    // Rules, classifier, and LLM all left suggestion entries
    assert_eq!(item.suggestions.len(), 3);

    let decision = engine
        .review
        .resolve(
            item_id,
            HumanVerdict {
                category: EmailCategory::Personal,
                action: EmailAction::Keep,
                note: Some("old friend".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(decision.tier, Tier::Human);
    assert_eq!(decision.confidence, 1.0);

    // The email is now settled under this epoch
    match engine.router.process(&e).await.unwrap() {
        RoutedOutcome::AlreadyDecided(d) => assert_eq!(d.model, "human"),
        other => panic!("expected already-decided, got {other:?}"),
    }

    // The human verdict minted a training example
    assert_eq!(engine.store.count_unused_examples().await.unwrap(), 1);
}

#[tokio::test]
async fn repeated_human_keeps_whitelist_the_sender() {
    let engine = engine().await;

    for i in 0..3 {
        let e = email(
            &format!("h-{i}"),
            "doctor@clinic.example",
            &format!("Appointment {i}"),
        );
        engine.store.upsert_email(&e).await.unwrap();
        let item_id = match engine.router.process(&e).await.unwrap() {
            RoutedOutcome::Enqueued { item_id, .. } => item_id,
            other => panic!("expected enqueue, got {other:?}"),
        };
        engine
            .review
            .resolve(
                item_id,
                HumanVerdict {
                    category: EmailCategory::Health,
                    action: EmailAction::Keep,
                    note: None,
                },
            )
            .await
            .unwrap();
    }

    // Three unanimous human KEEPs for a protected category: sender rule
    let rules = engine.store.list_active_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].pattern, "doctor@clinic.example");
    assert_eq!(rules[0].action, EmailAction::Keep);

    // The next email from the doctor never reaches review
    let e = email("h-9", "doctor@clinic.example", "Results");
    engine.store.upsert_email(&e).await.unwrap();
    match engine.router.process(&e).await.unwrap() {
        RoutedOutcome::Decided(d) => assert_eq!(d.tier, Tier::Rules),
        other => panic!("expected rule decision, got {other:?}"),
    }
}

struct RecordingMailbox {
    trashed: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl MailStore for RecordingMailbox {
    async fn trash(&self, message_id: &str) -> Result<(), AdapterError> {
        self.trashed.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn untrash(&self, message_id: &str) -> Result<(), AdapterError> {
        self.trashed.lock().unwrap().retain(|m| m != message_id);
        Ok(())
    }
}

#[tokio::test]
async fn decisions_feed_cleanup_and_restore() {
    let engine = engine().await;

    for i in 0..2 {
        let e = email(
            &format!("promo-{i}"),
            &format!("offers{i}@deals.example"),
            "Sale",
        );
        engine.store.upsert_email(&e).await.unwrap();
        engine.router.process(&e).await.unwrap();
    }

    let mailbox = Arc::new(RecordingMailbox {
        trashed: std::sync::Mutex::new(Vec::new()),
    });
    let cleanup = CleanupOrchestrator::new(engine.store.clone(), mailbox.clone(), &engine.config);
    let filter = CandidateFilter {
        categories: vec![EmailCategory::Promotional],
        max_fraud_score: Some(30),
        older_than_days: Some(365),
        min_confidence: 0.75,
    };

    // Default is a dry run
    let report = cleanup.execute(&filter, None).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.candidates, 2);
    assert!(mailbox.trashed.lock().unwrap().is_empty());

    // Live run trashes both; restore brings one back
    let report = cleanup.execute(&filter, Some(false)).await.unwrap();
    assert_eq!(report.deleted, 2);
    cleanup.restore("promo-0").await.unwrap();
    assert_eq!(mailbox.trashed.lock().unwrap().as_slice(), ["promo-1"]);

    // The restored email is a candidate again, the trashed one is not
    let candidates = cleanup.preview(&filter).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].email_id, "promo-0");
}
