use std::sync::Arc;

use anyhow::{Context, Result, bail};
use mailsift::classifier::{HttpClassifierBackend, PersonalizedClassifier};
use mailsift::cleanup::{CandidateFilter, CleanupOrchestrator, MailStore};
use mailsift::config::EngineConfig;
use mailsift::learning::LearningCoordinator;
use mailsift::llm::HttpLlmClient;
use mailsift::llm::reasoner::LlmReasoner;
use mailsift::review::ReviewQueue;
use mailsift::router::{BatchProcessor, TierRouter};
use mailsift::rules::RulesEngine;
use mailsift::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    mailsift::telemetry::init();

    let db_path =
        std::env::var("MAILSIFT_DB_PATH").unwrap_or_else(|_| "./data/mailsift.db".to_string());
    let ollama_url =
        std::env::var("MAILSIFT_OLLAMA_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".into());
    let llm_model = std::env::var("MAILSIFT_LLM_MODEL").unwrap_or_else(|_| "llama3.1:8b".into());
    let classifier_url = std::env::var("MAILSIFT_CLASSIFIER_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8901".into());

    let config = EngineConfig::default();

    let store = Arc::new(
        Store::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("opening database at {db_path}"))?,
    );

    let rules = Arc::new(RulesEngine::load(store.clone(), &config).await?);
    let classifier = Arc::new(
        PersonalizedClassifier::load(
            store.clone(),
            Arc::new(HttpClassifierBackend::new(classifier_url)),
            &config,
        )
        .await?,
    );
    let reasoner = Arc::new(LlmReasoner::new(
        store.clone(),
        Arc::new(HttpLlmClient::new(ollama_url, llm_model)),
        &config,
    ));
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

    let command = std::env::args().nth(1).unwrap_or_else(|| "analyze".into());
    match command.as_str() {
        "analyze" => {
            let limit: usize = std::env::args()
                .nth(2)
                .map(|s| s.parse().context("batch limit must be a number"))
                .transpose()?
                .unwrap_or(200);

            let batch = BatchProcessor::new(router, store.clone(), &config);
            let summary = batch.run_pending(limit).await?;
            println!(
                "decided {} / enqueued {} / skipped {} / failed {}",
                summary.decided, summary.enqueued, summary.skipped, summary.failed
            );
        }
        "review" => {
            let queue = ReviewQueue::new(store.clone(), Some(learning.clone()), &config);
            match queue.next().await? {
                Some(item) => {
                    println!(
                        "#{} email {} priority {} ({})",
                        item.id, item.email_id, item.priority, item.provenance
                    );
                    for suggestion in &item.suggestions {
                        match &suggestion.verdict {
                            Some(v) => println!(
                                "  tier {:?}: {} / {} at {:.2}",
                                suggestion.tier,
                                v.category.as_str(),
                                v.action.as_str(),
                                v.confidence
                            ),
                            None => println!(
                                "  tier {:?}: declined ({})",
                                suggestion.tier,
                                suggestion.decline_reason.as_deref().unwrap_or("no guess")
                            ),
                        }
                    }
                }
                None => println!("review queue is empty"),
            }
        }
        "cleanup-preview" => {
            let orchestrator =
                CleanupOrchestrator::new(store.clone(), Arc::new(NullMailbox), &config);
            let filter = CandidateFilter {
                min_confidence: 0.75,
                older_than_days: Some(365),
                max_fraud_score: Some(30),
                ..Default::default()
            };
            let candidates = orchestrator.preview(&filter).await?;
            println!("{} deletion candidates", candidates.len());
            for c in candidates.iter().take(50) {
                println!(
                    "  {} [{}] {} ({:.2})",
                    c.email_id,
                    c.category.as_str(),
                    c.subject,
                    c.confidence
                );
            }
        }
        other => bail!("unknown command '{other}' (expected analyze, review, cleanup-preview)"),
    }

    Ok(())
}

/// Preview-only stand-in; executing a cleanup needs a real mailbox adapter.
struct NullMailbox;

#[async_trait::async_trait]
impl MailStore for NullMailbox {
    async fn trash(
        &self,
        _message_id: &str,
    ) -> std::result::Result<(), mailsift::error::AdapterError> {
        Err(mailsift::error::AdapterError::Unavailable {
            name: "mailbox".into(),
            reason: "no mailbox adapter configured".into(),
        })
    }

    async fn untrash(
        &self,
        _message_id: &str,
    ) -> std::result::Result<(), mailsift::error::AdapterError> {
        Err(mailsift::error::AdapterError::Unavailable {
            name: "mailbox".into(),
            reason: "no mailbox adapter configured".into(),
        })
    }
}
