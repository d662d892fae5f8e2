//! Cleanup — acting on accumulated DELETE decisions.
//!
//! Deletion is remote-first and accounted per email: the operation row
//! exists before the first remote call, successes are recorded with a
//! restoration deadline, and a failure mid-batch never rolls back the
//! emails already deleted. Restore works strictly before the deadline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{AdapterError, CleanupError, DatabaseError, Result};
use crate::store::{DeletionCandidate, Store};
use crate::types::EmailCategory;

/// The remote mailbox: whatever actually holds the mail.
///
/// `trash` moves a message to the provider's trash (recoverable until the
/// provider purges it); `untrash` moves it back.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn trash(&self, message_id: &str) -> std::result::Result<(), AdapterError>;
    async fn untrash(&self, message_id: &str) -> std::result::Result<(), AdapterError>;
}

/// Safety filter for selecting deletion candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Empty means any category.
    pub categories: Vec<EmailCategory>,
    /// Exclude likely-fraud emails from bulk deletion so they stay
    /// visible for review.
    pub max_fraud_score: Option<u8>,
    pub older_than_days: Option<i64>,
    pub min_confidence: f32,
}

/// What one cleanup run did.
#[derive(Debug)]
pub struct CleanupReport {
    pub operation_id: Uuid,
    pub dry_run: bool,
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Emails deleted by this run can be restored until this instant.
    pub restoration_deadline: Option<DateTime<Utc>>,
}

pub struct CleanupOrchestrator {
    store: Arc<Store>,
    mail: Arc<dyn MailStore>,
    analysis_version: String,
    trash_retention: ChronoDuration,
    dry_run_default: bool,
}

impl CleanupOrchestrator {
    pub fn new(store: Arc<Store>, mail: Arc<dyn MailStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            mail,
            analysis_version: config.analysis_version.clone(),
            trash_retention: ChronoDuration::from_std(config.trash_retention)
                .unwrap_or_else(|_| ChronoDuration::days(30)),
            dry_run_default: config.cleanup_dry_run_default,
        }
    }

    /// What would be deleted, without touching anything.
    pub async fn preview(&self, filter: &CandidateFilter) -> Result<Vec<DeletionCandidate>> {
        Ok(self
            .store
            .deletion_candidates(
                &self.analysis_version,
                &filter.categories,
                filter.max_fraud_score,
                filter.older_than_days,
                filter.min_confidence,
            )
            .await?)
    }

    /// Run a cleanup. `dry_run: None` falls back to the configured
    /// default, which ships as true — destructive runs are opt-in.
    ///
    /// Per-email failures are counted and skipped; already-deleted emails
    /// stay deleted no matter what fails after them.
    pub async fn execute(
        &self,
        filter: &CandidateFilter,
        dry_run: Option<bool>,
    ) -> Result<CleanupReport> {
        let dry_run = dry_run.unwrap_or(self.dry_run_default);
        let candidates = self.preview(filter).await?;

        let operation_id = Uuid::new_v4();
        self.store
            .insert_cleanup_operation(operation_id, dry_run)
            .await?;
        info!(
            operation_id = %operation_id,
            dry_run,
            candidates = candidates.len(),
            "Cleanup started"
        );

        if dry_run {
            self.store
                .finish_cleanup_operation(
                    operation_id,
                    "completed",
                    candidates.len() as i64,
                    0,
                    0,
                    None,
                )
                .await?;
            return Ok(CleanupReport {
                operation_id,
                dry_run: true,
                candidates: candidates.len(),
                deleted: 0,
                failed: 0,
                restoration_deadline: None,
            });
        }

        let deadline = Utc::now() + self.trash_retention;
        let mut deleted = 0usize;
        let mut failed = 0usize;
        for candidate in &candidates {
            match self.mail.trash(&candidate.email_id).await {
                Ok(()) => {
                    self.store
                        .insert_deleted_email(
                            operation_id,
                            &candidate.email_id,
                            Utc::now(),
                            deadline,
                        )
                        .await?;
                    deleted += 1;
                }
                Err(e) => {
                    warn!(email_id = %candidate.email_id, error = %e, "Remote deletion failed");
                    failed += 1;
                }
            }
        }

        let status = if failed == 0 {
            "completed"
        } else {
            "completed_with_errors"
        };
        self.store
            .finish_cleanup_operation(
                operation_id,
                status,
                candidates.len() as i64,
                deleted as i64,
                failed as i64,
                Some(deadline),
            )
            .await?;
        info!(operation_id = %operation_id, deleted, failed, "Cleanup finished");

        Ok(CleanupReport {
            operation_id,
            dry_run: false,
            candidates: candidates.len(),
            deleted,
            failed,
            restoration_deadline: Some(deadline),
        })
    }

    /// Restore one deleted email. Succeeds only strictly before its
    /// restoration deadline; after that the provider may have purged it
    /// and the record is left untouched.
    pub async fn restore(&self, email_id: &str) -> Result<()> {
        let record =
            self.store
                .get_deleted_email(email_id)
                .await?
                .ok_or(DatabaseError::NotFound {
                    entity: "deleted email".into(),
                    id: email_id.to_string(),
                })?;

        if Utc::now() >= record.restoration_deadline {
            return Err(CleanupError::DeadlinePassed {
                message_id: email_id.to_string(),
                deadline: record.restoration_deadline.to_rfc3339(),
            }
            .into());
        }

        self.mail
            .untrash(email_id)
            .await
            .map_err(|e| CleanupError::RemoteRestore {
                message_id: email_id.to_string(),
                reason: e.to_string(),
            })?;
        self.store.mark_restored(record.id).await?;
        info!(email_id, "Email restored");
        Ok(())
    }
}
