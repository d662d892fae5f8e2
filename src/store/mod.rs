//! Persistence layer — libSQL-backed storage for the engine's schema.
//!
//! Decision rows (`email_analysis`) are append-only per
//! `(email_id, analysis_version, model)`: re-analysis inserts, never
//! overwrites, so every tier/model comparison and audit stays possible.

pub mod migrations;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::types::{Decision, EmailAction, EmailCategory, EmailRecord, Tier, TierSuggestion};

// ── Row types ───────────────────────────────────────────────────────

/// Rule matching key: what email field the pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Exact sender address match.
    Email,
    /// Sender domain match.
    Domain,
    /// Exact (lowercased) subject match.
    ExactSubject,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Domain => "domain",
            Self::ExactSubject => "exact_subject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "domain" => Some(Self::Domain),
            "exact_subject" => Some(Self::ExactSubject),
            _ => None,
        }
    }
}

/// A learned tier-0 rule.
#[derive(Debug, Clone)]
pub struct RuleRow {
    pub id: i64,
    pub rule_type: RuleType,
    /// Lowercased pattern text.
    pub pattern: String,
    pub action: EmailAction,
    pub category: Option<EmailCategory>,
    pub confidence: f32,
    pub times_matched: i64,
    pub times_correct: i64,
    pub times_checked: i64,
    pub is_active: bool,
}

impl RuleRow {
    /// Rolling accuracy over feedback samples, if any exist.
    pub fn accuracy(&self) -> Option<f64> {
        if self.times_checked == 0 {
            None
        } else {
            Some(self.times_correct as f64 / self.times_checked as f64)
        }
    }
}

/// Where a training example came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Human,
    HighConfidenceAuto,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::HighConfidenceAuto => "high_confidence_auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "high_confidence_auto" => Some(Self::HighConfidenceAuto),
            _ => None,
        }
    }
}

/// An immutable labeled training example.
#[derive(Debug, Clone)]
pub struct TrainingExampleRow {
    pub id: i64,
    pub email_id: String,
    pub text: String,
    pub category: EmailCategory,
    pub action: EmailAction,
    pub provenance: Provenance,
    pub example_type: String,
    pub effectiveness_score: f64,
    pub used: bool,
}

/// A trained classifier version, with lineage to its parent.
#[derive(Debug, Clone)]
pub struct ModelVersionRow {
    pub id: i64,
    pub name: String,
    pub model_type: String,
    pub parent_id: Option<i64>,
    pub example_count: i64,
    pub validation_accuracy: f64,
    pub is_active: bool,
}

/// Review item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
    Reviewed,
    Skipped,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reviewed => "reviewed",
            Self::Skipped => "skipped",
        }
    }
}

fn str_to_review_status(s: &str) -> ReviewStatus {
    match s {
        "reviewed" => ReviewStatus::Reviewed,
        "skipped" => ReviewStatus::Skipped,
        _ => ReviewStatus::Pending,
    }
}

/// A queued human-review item.
#[derive(Debug, Clone)]
pub struct ReviewItemRow {
    pub id: i64,
    pub email_id: String,
    /// Suggestions from the tiers the email visited, as recorded JSON.
    pub suggestions: Vec<TierSuggestion>,
    pub provenance: String,
    pub priority: u8,
    pub status: ReviewStatus,
    pub added_at: DateTime<Utc>,
}

/// A batched deletion operation.
#[derive(Debug, Clone)]
pub struct CleanupOperationRow {
    pub id: Uuid,
    pub dry_run: bool,
    pub status: String,
    pub emails_affected: i64,
    pub emails_deleted: i64,
    pub emails_failed: i64,
    pub reversal_deadline: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// A remotely deleted email and its restoration window.
#[derive(Debug, Clone)]
pub struct DeletedEmailRow {
    pub id: i64,
    pub operation_id: Uuid,
    pub email_id: String,
    pub deleted_at: DateTime<Utc>,
    pub restoration_deadline: DateTime<Utc>,
    pub restored: bool,
}

/// An email eligible for cleanup, with the decision that flagged it.
#[derive(Debug, Clone)]
pub struct DeletionCandidate {
    pub email_id: String,
    pub subject: String,
    pub sender_email: String,
    pub category: EmailCategory,
    pub confidence: f32,
    pub fraud_score: Option<u8>,
}

// ── Store ───────────────────────────────────────────────────────────

/// libSQL store.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct Store {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl Store {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to connect: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Store opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory store (for tests).
    ///
    /// Uses a uniquely named shared-cache memory database so that extra
    /// connections from `tx_connection()` see the migrated schema — a plain
    /// `:memory:` database is isolated per connection.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let uri = format!("file:mem_{}?mode=memory&cache=shared", Uuid::new_v4().simple());
        let db = libsql::Builder::new_local(uri)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to create database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to connect: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Dedicated connection for transactional paths. Statements issued
    /// through the shared connection by concurrent tasks must never join
    /// an open transaction or be lost to its rollback.
    fn tx_connection(&self) -> Result<Connection, DatabaseError> {
        self.db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to connect: {e}")))
    }

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert or refresh an email record from the sync layer.
    pub async fn upsert_email(&self, email: &EmailRecord) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO emails (message_id, thread_id, subject, sender_email, sender_name,
                    recipients, date_sent, snippet, labels, has_attachments, attachment_count,
                    size_bytes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                 ON CONFLICT (message_id) DO UPDATE SET
                    subject = excluded.subject,
                    snippet = excluded.snippet,
                    labels = excluded.labels,
                    updated_at = excluded.updated_at",
                params![
                    email.message_id.clone(),
                    email.thread_id.clone(),
                    email.subject.clone(),
                    email.sender_email.to_lowercase(),
                    email.sender_name.clone(),
                    to_json(&email.recipients)?,
                    email.date_sent.map(|d| d.to_rfc3339()),
                    email.snippet.clone(),
                    to_json(&email.labels)?,
                    email.has_attachments as i64,
                    email.attachment_count as i64,
                    email.size_bytes.map(|s| s as i64),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to upsert email: {e}")))?;
        Ok(())
    }

    /// Look up an email by message id.
    pub async fn get_email(&self, message_id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, thread_id, subject, sender_email, sender_name, recipients,
                        date_sent, snippet, labels, has_attachments, attachment_count, size_bytes
                 FROM emails WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query email: {e}")))?;

        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_email(&row)?)),
            None => Ok(None),
        }
    }

    // ── Decisions (append-only) ─────────────────────────────────────

    /// Append a decision row.
    ///
    /// A second insert for the same `(email, analysis_version, model)`
    /// triple is a data-integrity violation and is surfaced, not coerced.
    pub async fn insert_decision(
        &self,
        decision: &Decision,
        suggestions: &[TierSuggestion],
    ) -> Result<(), DatabaseError> {
        let result = self
            .conn
            .execute(
                "INSERT INTO email_analysis (email_id, analysis_version, model, category, action,
                    confidence, fraud_score, reasoning, tier, suggestions, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    decision.email_id.clone(),
                    decision.analysis_version.clone(),
                    decision.model.clone(),
                    decision.category.as_str(),
                    decision.action.as_str(),
                    decision.confidence as f64,
                    decision.fraud_score.map(|s| s as i64),
                    decision.reasoning.clone(),
                    decision.tier.as_i64(),
                    to_json(suggestions)?,
                    decision.decided_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Constraint(format!(
                "decision already exists for ({}, {}, {})",
                decision.email_id, decision.analysis_version, decision.model
            ))),
            Err(e) => Err(DatabaseError::Query(format!(
                "Failed to insert decision: {e}"
            ))),
        }
    }

    /// All decisions for an email, newest first.
    pub async fn decisions_for(&self, email_id: &str) -> Result<Vec<Decision>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT email_id, analysis_version, model, category, action, confidence,
                        fraud_score, reasoning, tier, decided_at
                 FROM email_analysis WHERE email_id = ?1 ORDER BY id DESC",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query decisions: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            out.push(row_to_decision(&row)?);
        }
        Ok(out)
    }

    /// The most recent decision for an email within an epoch.
    pub async fn latest_decision(
        &self,
        email_id: &str,
        analysis_version: &str,
    ) -> Result<Option<Decision>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT email_id, analysis_version, model, category, action, confidence,
                        fraud_score, reasoning, tier, decided_at
                 FROM email_analysis
                 WHERE email_id = ?1 AND analysis_version = ?2
                 ORDER BY id DESC LIMIT 1",
                params![email_id, analysis_version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query decision: {e}")))?;

        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_decision(&row)?)),
            None => Ok(None),
        }
    }

    /// Message ids of emails with no decision under this epoch yet.
    pub async fn unanalyzed_emails(
        &self,
        analysis_version: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.message_id FROM emails e
                 LEFT JOIN email_analysis a
                   ON e.message_id = a.email_id AND a.analysis_version = ?1
                 WHERE a.id IS NULL
                 ORDER BY e.date_sent ASC
                 LIMIT ?2",
                params![analysis_version, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query unanalyzed: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            out.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?,
            );
        }
        Ok(out)
    }

    // ── Rules ───────────────────────────────────────────────────────

    /// Insert a new rule, or reinforce an existing one with the same key.
    ///
    /// Reinforcement keeps the higher confidence, bumps the learned-from
    /// counter, and reactivates the rule. A pattern already bound to a
    /// *different* action is rejected — no two active rules may disagree
    /// on the same `(rule_type, pattern)`.
    pub async fn insert_or_reinforce_rule(
        &self,
        rule_type: RuleType,
        pattern: &str,
        action: EmailAction,
        category: Option<EmailCategory>,
        confidence: f32,
        created_by_tier: Tier,
    ) -> Result<i64, DatabaseError> {
        let pattern = pattern.to_lowercase();

        let mut rows = self
            .conn
            .query(
                "SELECT id, action FROM tier0_rules WHERE rule_type = ?1 AND pattern = ?2",
                params![rule_type.as_str(), pattern.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query rule: {e}")))?;

        if let Some(row) = next_row(&mut rows).await? {
            let id: i64 = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
            let existing: String = row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?;
            if existing != action.as_str() {
                return Err(DatabaseError::Constraint(format!(
                    "rule ({}, {pattern}) already bound to action {existing}",
                    rule_type.as_str()
                )));
            }
            self.conn
                .execute(
                    "UPDATE tier0_rules SET
                        confidence = MAX(confidence, ?1),
                        learned_from = learned_from + 1,
                        is_active = 1
                     WHERE id = ?2",
                    params![confidence as f64, id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("Failed to reinforce rule: {e}")))?;
            debug!(rule_id = id, pattern = %pattern, "Rule reinforced");
            return Ok(id);
        }

        self.conn
            .execute(
                "INSERT INTO tier0_rules (rule_type, pattern, action, category, confidence,
                    created_by_tier, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule_type.as_str(),
                    pattern.clone(),
                    action.as_str(),
                    category.map(|c| c.as_str()),
                    confidence as f64,
                    created_by_tier.as_i64(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert rule: {e}")))?;

        let id = self.conn.last_insert_rowid();
        info!(rule_id = id, rule_type = rule_type.as_str(), pattern = %pattern,
              action = action.as_str(), "Rule learned");
        Ok(id)
    }

    /// All active rules, most trusted first.
    pub async fn list_active_rules(&self) -> Result<Vec<RuleRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, rule_type, pattern, action, category, confidence,
                        times_matched, times_correct, times_checked, is_active
                 FROM tier0_rules WHERE is_active = 1
                 ORDER BY confidence DESC, times_matched DESC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list rules: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            out.push(row_to_rule(&row)?);
        }
        Ok(out)
    }

    /// Look up a single rule (active or not — deactivated rules stay
    /// queryable for audit).
    pub async fn get_rule(&self, id: i64) -> Result<Option<RuleRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, rule_type, pattern, action, category, confidence,
                        times_matched, times_correct, times_checked, is_active
                 FROM tier0_rules WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query rule: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    /// Bump match statistics for a rule. Lost increments under racing
    /// writers are acceptable — these are approximate counters.
    pub async fn record_rule_match(&self, id: i64) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tier0_rules SET times_matched = times_matched + 1, last_used = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to record match: {e}")))?;
        Ok(())
    }

    /// Apply correctness feedback and return the updated row in the same
    /// call, so activation decisions use a consistent read.
    pub async fn apply_rule_feedback(
        &self,
        id: i64,
        was_correct: bool,
    ) -> Result<RuleRow, DatabaseError> {
        self.conn
            .execute(
                "UPDATE tier0_rules SET
                    times_checked = times_checked + 1,
                    times_correct = times_correct + ?1
                 WHERE id = ?2",
                params![was_correct as i64, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to apply feedback: {e}")))?;

        self.get_rule(id).await?.ok_or(DatabaseError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })
    }

    /// Deactivate a rule. It stays in the table for audit but never matches.
    pub async fn deactivate_rule(&self, id: i64) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tier0_rules SET is_active = 0 WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to deactivate rule: {e}")))?;
        warn!(rule_id = id, "Rule deactivated");
        Ok(())
    }

    /// Consistent high-confidence decisions agreeing on (sender, action),
    /// used for rule induction tallies. Tier 0 decisions are excluded —
    /// a rule must not vote for itself.
    pub async fn count_agreeing_sender_decisions(
        &self,
        sender_email: &str,
        action: EmailAction,
        min_confidence: f32,
    ) -> Result<i64, DatabaseError> {
        self.count_scalar(
            "SELECT COUNT(*) FROM email_analysis a
             JOIN emails e ON a.email_id = e.message_id
             WHERE e.sender_email = ?1 AND a.action = ?2
               AND a.confidence >= ?3 AND a.tier >= 1",
            params![
                sender_email.to_lowercase(),
                action.as_str(),
                min_confidence as f64
            ],
        )
        .await
    }

    /// Same tally keyed by sender domain.
    pub async fn count_agreeing_domain_decisions(
        &self,
        domain: &str,
        action: EmailAction,
        min_confidence: f32,
    ) -> Result<i64, DatabaseError> {
        self.count_scalar(
            "SELECT COUNT(*) FROM email_analysis a
             JOIN emails e ON a.email_id = e.message_id
             WHERE e.sender_email LIKE ?1 AND a.action = ?2
               AND a.confidence >= ?3 AND a.tier >= 1",
            params![
                format!("%@{}", domain.to_lowercase()),
                action.as_str(),
                min_confidence as f64
            ],
        )
        .await
    }

    // ── Training examples ───────────────────────────────────────────

    /// Record a new training example. Examples are immutable once created.
    pub async fn insert_training_example(
        &self,
        email_id: &str,
        text: &str,
        category: EmailCategory,
        action: EmailAction,
        provenance: Provenance,
        example_type: &str,
    ) -> Result<i64, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO training_examples (email_id, text, category, action, provenance,
                    example_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email_id,
                    text,
                    category.as_str(),
                    action.as_str(),
                    provenance.as_str(),
                    example_type,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert example: {e}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Training examples not yet consumed by a training session.
    pub async fn count_unused_examples(&self) -> Result<i64, DatabaseError> {
        self.count_scalar("SELECT COUNT(*) FROM training_examples WHERE used = 0", ())
            .await
    }

    pub async fn list_unused_examples(&self) -> Result<Vec<TrainingExampleRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, email_id, text, category, action, provenance, example_type,
                        effectiveness_score, used
                 FROM training_examples WHERE used = 0 ORDER BY id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list examples: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            out.push(row_to_example(&row)?);
        }
        Ok(out)
    }

    /// Mark examples consumed by a training session.
    pub async fn mark_examples_used(&self, ids: &[i64]) -> Result<(), DatabaseError> {
        for id in ids {
            self.conn
                .execute(
                    "UPDATE training_examples SET used = 1 WHERE id = ?1",
                    params![*id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("Failed to mark example used: {e}")))?;
        }
        Ok(())
    }

    /// Few-shot set for one category: the `cap` most effective examples.
    /// Examples that fall out of the top-`cap` are implicitly evicted from
    /// prompt duty without being deleted.
    pub async fn few_shot_examples(
        &self,
        category: EmailCategory,
        cap: u32,
    ) -> Result<Vec<TrainingExampleRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, email_id, text, category, action, provenance, example_type,
                        effectiveness_score, used
                 FROM training_examples
                 WHERE category = ?1
                 ORDER BY effectiveness_score DESC, created_at DESC
                 LIMIT ?2",
                params![category.as_str(), cap as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query few-shot set: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            out.push(row_to_example(&row)?);
        }
        Ok(out)
    }

    /// Nudge an example's effectiveness score (clamped to 0..=1).
    pub async fn adjust_example_effectiveness(
        &self,
        id: i64,
        delta: f64,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE training_examples
                 SET effectiveness_score = MIN(1.0, MAX(0.0, effectiveness_score + ?1))
                 WHERE id = ?2",
                params![delta, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to adjust effectiveness: {e}")))?;
        Ok(())
    }

    // ── Training sessions / model versions ──────────────────────────

    pub async fn insert_training_session(
        &self,
        id: Uuid,
        example_count: i64,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO training_sessions (id, started_at, example_count)
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), Utc::now().to_rfc3339(), example_count],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert session: {e}")))?;
        Ok(())
    }

    pub async fn complete_training_session(
        &self,
        id: Uuid,
        status: &str,
        model_version: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE training_sessions
                 SET status = ?1, model_version = ?2, completed_at = ?3
                 WHERE id = ?4",
                params![
                    status,
                    model_version,
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to complete session: {e}")))?;
        Ok(())
    }

    /// Record a newly trained model version, inactive by default.
    pub async fn insert_model_version(
        &self,
        name: &str,
        model_type: &str,
        parent_id: Option<i64>,
        example_count: i64,
        validation_accuracy: f64,
    ) -> Result<i64, DatabaseError> {
        let result = self
            .conn
            .execute(
                "INSERT INTO model_versions (name, model_type, parent_id, example_count,
                    validation_accuracy, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    model_type,
                    parent_id,
                    example_count,
                    validation_accuracy,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Constraint(format!(
                "model version {name} already exists"
            ))),
            Err(e) => Err(DatabaseError::Query(format!("Failed to insert model: {e}"))),
        }
    }

    /// The currently active version for a classifier type, if any.
    pub async fn active_model(
        &self,
        model_type: &str,
    ) -> Result<Option<ModelVersionRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, model_type, parent_id, example_count, validation_accuracy,
                        is_active
                 FROM model_versions WHERE model_type = ?1 AND is_active = 1",
                params![model_type],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query active model: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_model(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_model(&self, id: i64) -> Result<Option<ModelVersionRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, model_type, parent_id, example_count, validation_accuracy,
                        is_active
                 FROM model_versions WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query model: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_model(&row)?)),
            None => Ok(None),
        }
    }

    /// Atomically flip the active model version: deactivate the old,
    /// activate the new, in one transaction. This is the single critical
    /// section of the learning subsystem.
    pub async fn promote_model(&self, id: i64) -> Result<(), DatabaseError> {
        let model = self.get_model(id).await?.ok_or(DatabaseError::NotFound {
            entity: "model_version".into(),
            id: id.to_string(),
        })?;

        let conn = self.tx_connection()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        tx.execute(
            "UPDATE model_versions SET is_active = 0 WHERE model_type = ?1",
            params![model.model_type.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to deactivate models: {e}")))?;

        tx.execute(
            "UPDATE model_versions SET is_active = 1 WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to activate model: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit promotion: {e}")))?;

        info!(model_id = id, name = %model.name, "Model version promoted");
        Ok(())
    }

    // ── Human review queue ──────────────────────────────────────────

    /// Enqueue an email for human review with the suggestions gathered so far.
    pub async fn enqueue_review(
        &self,
        email_id: &str,
        suggestions: &[TierSuggestion],
        provenance: &str,
        priority: u8,
    ) -> Result<i64, DatabaseError> {
        if !(1..=10).contains(&priority) {
            return Err(DatabaseError::Constraint(format!(
                "priority {priority} out of range 1..=10"
            )));
        }
        self.conn
            .execute(
                "INSERT INTO human_review_queue (email_id, suggestions, provenance, priority, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    email_id,
                    to_json(suggestions)?,
                    provenance,
                    priority as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to enqueue review: {e}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Next pending item: lowest priority number first, oldest first
    /// within a band.
    pub async fn next_review(&self) -> Result<Option<ReviewItemRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, email_id, suggestions, provenance, priority, status, added_at
                 FROM human_review_queue WHERE status = 'pending'
                 ORDER BY priority ASC, added_at ASC, id ASC LIMIT 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query review queue: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_review(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_review_item(&self, id: i64) -> Result<Option<ReviewItemRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, email_id, suggestions, provenance, priority, status, added_at
                 FROM human_review_queue WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query review item: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_review(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn pending_review_count(&self) -> Result<i64, DatabaseError> {
        self.count_scalar(
            "SELECT COUNT(*) FROM human_review_queue WHERE status = 'pending'",
            (),
        )
        .await
    }

    /// Whether an email already has a pending review item, so escalation
    /// does not enqueue it twice.
    pub async fn has_pending_review(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .count_scalar(
                "SELECT COUNT(*) FROM human_review_queue
                 WHERE email_id = ?1 AND status = 'pending'",
                params![email_id],
            )
            .await?;
        Ok(count > 0)
    }

    /// Mark an item skipped (terminal; produces no decision).
    pub async fn skip_review(&self, id: i64) -> Result<(), DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE human_review_queue
                 SET status = 'skipped', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to skip review item: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "pending review item".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a review item in a single transaction: append the tier-3
    /// decision, create the human training example, and flip the item to
    /// `reviewed`. Either all three happen or none do.
    pub async fn resolve_review(
        &self,
        item_id: i64,
        decision: &Decision,
        suggestions: &[TierSuggestion],
        example_text: &str,
    ) -> Result<i64, DatabaseError> {
        let conn = self.tx_connection()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        let flipped = tx
            .execute(
                "UPDATE human_review_queue
                 SET status = 'reviewed', resolved_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update review item: {e}")))?;
        if flipped == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("Rollback failed: {e}")))?;
            return Err(DatabaseError::NotFound {
                entity: "pending review item".into(),
                id: item_id.to_string(),
            });
        }

        let inserted = tx
            .execute(
                "INSERT INTO email_analysis (email_id, analysis_version, model, category, action,
                    confidence, fraud_score, reasoning, tier, suggestions, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    decision.email_id.clone(),
                    decision.analysis_version.clone(),
                    decision.model.clone(),
                    decision.category.as_str(),
                    decision.action.as_str(),
                    decision.confidence as f64,
                    decision.fraud_score.map(|s| s as i64),
                    decision.reasoning.clone(),
                    decision.tier.as_i64(),
                    to_json(suggestions)?,
                    decision.decided_at.to_rfc3339(),
                ],
            )
            .await;
        if let Err(e) = inserted {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("Rollback failed: {e}")))?;
            if is_unique_violation(&e) {
                return Err(DatabaseError::Constraint(format!(
                    "decision already exists for ({}, {}, {})",
                    decision.email_id, decision.analysis_version, decision.model
                )));
            }
            return Err(DatabaseError::Query(format!(
                "Failed to insert decision: {e}"
            )));
        }

        tx.execute(
            "INSERT INTO training_examples (email_id, text, category, action, provenance,
                example_type, created_at)
             VALUES (?1, ?2, ?3, ?4, 'human', 'positive', ?5)",
            params![
                decision.email_id.clone(),
                example_text,
                decision.category.as_str(),
                decision.action.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to insert training example: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit resolve: {e}")))?;
        Ok(item_id)
    }

    // ── Cleanup ─────────────────────────────────────────────────────

    /// Emails whose most recent decision under the epoch says DELETE and
    /// which pass the safety filter. Already-deleted (unrestored) emails
    /// are excluded; so are emails with no decision yet.
    pub async fn deletion_candidates(
        &self,
        analysis_version: &str,
        categories: &[EmailCategory],
        max_fraud_score: Option<u8>,
        older_than_days: Option<i64>,
        min_confidence: f32,
    ) -> Result<Vec<DeletionCandidate>, DatabaseError> {
        let mut sql = String::from(
            "SELECT e.message_id, e.subject, e.sender_email, a.category, a.confidence, a.fraud_score
             FROM emails e
             JOIN email_analysis a ON a.id = (
                 SELECT id FROM email_analysis
                 WHERE email_id = e.message_id AND analysis_version = ?1
                 ORDER BY id DESC LIMIT 1
             )
             WHERE a.action = 'DELETE' AND a.confidence >= ?2
               AND e.message_id NOT IN (
                 SELECT email_id FROM deleted_emails WHERE restored = 0
               )",
        );

        if !categories.is_empty() {
            let list = categories
                .iter()
                .map(|c| format!("'{}'", c.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND a.category IN ({list})"));
        }
        if let Some(max_fraud) = max_fraud_score {
            sql.push_str(&format!(
                " AND (a.fraud_score IS NULL OR a.fraud_score <= {max_fraud})"
            ));
        }
        if let Some(days) = older_than_days {
            let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
            sql.push_str(&format!(" AND e.date_sent < '{cutoff}'"));
        }
        sql.push_str(" ORDER BY e.date_sent ASC");

        let mut rows = self
            .conn
            .query(&sql, params![analysis_version, min_confidence as f64])
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query candidates: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows).await? {
            let category_str: String =
                row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?;
            // Unparseable rows are excluded from candidates, not fatal.
            let Some(category) = EmailCategory::parse(&category_str) else {
                continue;
            };
            out.push(DeletionCandidate {
                email_id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
                subject: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
                sender_email: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
                category,
                confidence: row
                    .get::<f64>(4)
                    .map_err(|e| DatabaseError::Query(e.to_string()))? as f32,
                fraud_score: row
                    .get::<Option<i64>>(5)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .map(|v| v as u8),
            });
        }
        Ok(out)
    }

    /// Create the operation row before any remote deletion happens.
    pub async fn insert_cleanup_operation(
        &self,
        id: Uuid,
        dry_run: bool,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO cleanup_operations (id, dry_run, started_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), dry_run as i64, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert operation: {e}")))?;
        Ok(())
    }

    pub async fn finish_cleanup_operation(
        &self,
        id: Uuid,
        status: &str,
        affected: i64,
        deleted: i64,
        failed: i64,
        reversal_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE cleanup_operations
                 SET status = ?1, emails_affected = ?2, emails_deleted = ?3, emails_failed = ?4,
                     reversal_deadline = ?5, completed_at = ?6
                 WHERE id = ?7",
                params![
                    status,
                    affected,
                    deleted,
                    failed,
                    reversal_deadline.map(|d| d.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to finish operation: {e}")))?;
        Ok(())
    }

    pub async fn get_cleanup_operation(
        &self,
        id: Uuid,
    ) -> Result<Option<CleanupOperationRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, dry_run, status, emails_affected, emails_deleted, emails_failed,
                        reversal_deadline, started_at
                 FROM cleanup_operations WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query operation: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_operation(&row)?)),
            None => Ok(None),
        }
    }

    /// Record a successful remote deletion and its restoration deadline.
    pub async fn insert_deleted_email(
        &self,
        operation_id: Uuid,
        email_id: &str,
        deleted_at: DateTime<Utc>,
        restoration_deadline: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO deleted_emails (operation_id, email_id, deleted_at, restoration_deadline)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    operation_id.to_string(),
                    email_id,
                    deleted_at.to_rfc3339(),
                    restoration_deadline.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert deleted email: {e}")))?;
        Ok(())
    }

    /// The unrestored deletion record for an email, if one exists.
    pub async fn get_deleted_email(
        &self,
        email_id: &str,
    ) -> Result<Option<DeletedEmailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, operation_id, email_id, deleted_at, restoration_deadline, restored
                 FROM deleted_emails
                 WHERE email_id = ?1 AND restored = 0
                 ORDER BY id DESC LIMIT 1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query deleted email: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(row_to_deleted(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn mark_restored(&self, deleted_id: i64) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE deleted_emails SET restored = 1, restored_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), deleted_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to mark restored: {e}")))?;
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query setting: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => Ok(Some(
                row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to set setting: {e}")))?;
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn count_scalar(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("Count query failed: {e}")))?;
        match next_row(&mut rows).await? {
            Some(row) => row.get(0).map_err(|e| DatabaseError::Query(e.to_string())),
            None => Ok(0),
        }
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

async fn next_row(rows: &mut libsql::Rows) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read row: {e}")))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn get_str(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get(idx).map_err(|e| DatabaseError::Query(e.to_string()))
}

fn parse_category(s: &str) -> Result<EmailCategory, DatabaseError> {
    EmailCategory::parse(s).ok_or_else(|| DatabaseError::Serialization(format!("bad category {s}")))
}

fn parse_action(s: &str) -> Result<EmailAction, DatabaseError> {
    EmailAction::parse(s).ok_or_else(|| DatabaseError::Serialization(format!("bad action {s}")))
}

fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, DatabaseError> {
    let recipients: Vec<String> = serde_json::from_str(&get_str(row, 5)?)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let labels: Vec<String> = serde_json::from_str(&get_str(row, 8)?)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(EmailRecord {
        message_id: get_str(row, 0)?,
        thread_id: row
            .get::<Option<String>>(1)
            .map_err(|e| DatabaseError::Query(e.to_string()))?,
        subject: get_str(row, 2)?,
        sender_email: get_str(row, 3)?,
        sender_name: row
            .get::<Option<String>>(4)
            .map_err(|e| DatabaseError::Query(e.to_string()))?,
        recipients,
        date_sent: row
            .get::<Option<String>>(6)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .map(|s| parse_datetime(&s)),
        snippet: get_str(row, 7)?,
        labels,
        has_attachments: row
            .get::<i64>(9)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
        attachment_count: row
            .get::<i64>(10)
            .map_err(|e| DatabaseError::Query(e.to_string()))? as u32,
        size_bytes: row
            .get::<Option<i64>>(11)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .map(|s| s as u64),
    })
}

fn row_to_decision(row: &libsql::Row) -> Result<Decision, DatabaseError> {
    let tier_raw: i64 = row.get(8).map_err(|e| DatabaseError::Query(e.to_string()))?;
    Ok(Decision {
        email_id: get_str(row, 0)?,
        analysis_version: get_str(row, 1)?,
        model: get_str(row, 2)?,
        category: parse_category(&get_str(row, 3)?)?,
        action: parse_action(&get_str(row, 4)?)?,
        confidence: row
            .get::<f64>(5)
            .map_err(|e| DatabaseError::Query(e.to_string()))? as f32,
        fraud_score: row
            .get::<Option<i64>>(6)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .map(|v| v as u8),
        reasoning: row
            .get::<Option<String>>(7)
            .map_err(|e| DatabaseError::Query(e.to_string()))?,
        tier: Tier::from_i64(tier_raw)
            .ok_or_else(|| DatabaseError::Serialization(format!("bad tier {tier_raw}")))?,
        decided_at: parse_datetime(&get_str(row, 9)?),
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<RuleRow, DatabaseError> {
    let rule_type_str = get_str(row, 1)?;
    let category = row
        .get::<Option<String>>(4)
        .map_err(|e| DatabaseError::Query(e.to_string()))?
        .as_deref()
        .and_then(EmailCategory::parse);
    Ok(RuleRow {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        rule_type: RuleType::parse(&rule_type_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("bad rule type {rule_type_str}")))?,
        pattern: get_str(row, 2)?,
        action: parse_action(&get_str(row, 3)?)?,
        category,
        confidence: row
            .get::<f64>(5)
            .map_err(|e| DatabaseError::Query(e.to_string()))? as f32,
        times_matched: row.get(6).map_err(|e| DatabaseError::Query(e.to_string()))?,
        times_correct: row.get(7).map_err(|e| DatabaseError::Query(e.to_string()))?,
        times_checked: row.get(8).map_err(|e| DatabaseError::Query(e.to_string()))?,
        is_active: row
            .get::<i64>(9)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
    })
}

fn row_to_example(row: &libsql::Row) -> Result<TrainingExampleRow, DatabaseError> {
    let provenance_str = get_str(row, 5)?;
    Ok(TrainingExampleRow {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        email_id: get_str(row, 1)?,
        text: get_str(row, 2)?,
        category: parse_category(&get_str(row, 3)?)?,
        action: parse_action(&get_str(row, 4)?)?,
        provenance: Provenance::parse(&provenance_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("bad provenance {provenance_str}"))
        })?,
        example_type: get_str(row, 6)?,
        effectiveness_score: row.get(7).map_err(|e| DatabaseError::Query(e.to_string()))?,
        used: row
            .get::<i64>(8)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
    })
}

fn row_to_model(row: &libsql::Row) -> Result<ModelVersionRow, DatabaseError> {
    Ok(ModelVersionRow {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        name: get_str(row, 1)?,
        model_type: get_str(row, 2)?,
        parent_id: row
            .get::<Option<i64>>(3)
            .map_err(|e| DatabaseError::Query(e.to_string()))?,
        example_count: row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?,
        validation_accuracy: row.get(5).map_err(|e| DatabaseError::Query(e.to_string()))?,
        is_active: row
            .get::<i64>(6)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
    })
}

fn row_to_review(row: &libsql::Row) -> Result<ReviewItemRow, DatabaseError> {
    let suggestions: Vec<TierSuggestion> = serde_json::from_str(&get_str(row, 2)?)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(ReviewItemRow {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        email_id: get_str(row, 1)?,
        suggestions,
        provenance: get_str(row, 3)?,
        priority: row
            .get::<i64>(4)
            .map_err(|e| DatabaseError::Query(e.to_string()))? as u8,
        status: str_to_review_status(&get_str(row, 5)?),
        added_at: parse_datetime(&get_str(row, 6)?),
    })
}

fn row_to_operation(row: &libsql::Row) -> Result<CleanupOperationRow, DatabaseError> {
    let id_str = get_str(row, 0)?;
    Ok(CleanupOperationRow {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad operation id: {e}")))?,
        dry_run: row
            .get::<i64>(1)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
        status: get_str(row, 2)?,
        emails_affected: row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?,
        emails_deleted: row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?,
        emails_failed: row.get(5).map_err(|e| DatabaseError::Query(e.to_string()))?,
        reversal_deadline: row
            .get::<Option<String>>(6)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .map(|s| parse_datetime(&s)),
        started_at: parse_datetime(&get_str(row, 7)?),
    })
}

fn row_to_deleted(row: &libsql::Row) -> Result<DeletedEmailRow, DatabaseError> {
    let op_str = get_str(row, 1)?;
    Ok(DeletedEmailRow {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        operation_id: Uuid::parse_str(&op_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad operation id: {e}")))?,
        email_id: get_str(row, 2)?,
        deleted_at: parse_datetime(&get_str(row, 3)?),
        restoration_deadline: parse_datetime(&get_str(row, 4)?),
        restored: row
            .get::<i64>(5)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(id: &str, sender: &str) -> EmailRecord {
        EmailRecord {
            message_id: id.into(),
            thread_id: None,
            subject: "Subject".into(),
            sender_email: sender.into(),
            sender_name: None,
            recipients: vec![],
            date_sent: Some(Utc::now() - ChronoDuration::days(400)),
            snippet: "snippet".into(),
            labels: vec![],
            has_attachments: false,
            attachment_count: 0,
            size_bytes: None,
        }
    }

    fn decision(email_id: &str, tier: Tier, action: EmailAction, confidence: f32) -> Decision {
        Decision {
            email_id: email_id.into(),
            analysis_version: "v2.0".into(),
            model: format!("test-model-t{}", tier.as_i64()),
            category: EmailCategory::Shopping,
            action,
            confidence,
            fraud_score: Some(5),
            reasoning: Some("test".into()),
            tier,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn local_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        {
            let store = Store::new_local(&path).await.unwrap();
            store.upsert_email(&email("m1", "a@b.com")).await.unwrap();
        }
        let store = Store::new_local(&path).await.unwrap();
        assert!(store.get_email("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn email_roundtrip() {
        let store = Store::new_memory().await.unwrap();
        let e = email("m1", "Deals@Groupon.com");
        store.upsert_email(&e).await.unwrap();

        let got = store.get_email("m1").await.unwrap().unwrap();
        // Sender address is lowercased on write
        assert_eq!(got.sender_email, "deals@groupon.com");
        assert_eq!(got.subject, "Subject");
        assert!(store.get_email("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decisions_are_append_only() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("m1", "a@b.com")).await.unwrap();

        let d = decision("m1", Tier::Classifier, EmailAction::Delete, 0.9);
        store.insert_decision(&d, &[]).await.unwrap();

        // Same (email, version, model) triple is rejected
        let dup = store.insert_decision(&d, &[]).await;
        assert!(matches!(dup, Err(DatabaseError::Constraint(_))));

        // A different model appends a second row
        let mut d2 = d.clone();
        d2.model = "other-model".into();
        store.insert_decision(&d2, &[]).await.unwrap();

        let all = store.decisions_for("m1").await.unwrap();
        assert_eq!(all.len(), 2);

        let latest = store.latest_decision("m1", "v2.0").await.unwrap().unwrap();
        assert_eq!(latest.model, "other-model");
    }

    #[tokio::test]
    async fn unanalyzed_emails_excludes_decided() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("m1", "a@b.com")).await.unwrap();
        store.upsert_email(&email("m2", "c@d.com")).await.unwrap();

        let d = decision("m1", Tier::Llm, EmailAction::Keep, 0.8);
        store.insert_decision(&d, &[]).await.unwrap();

        let pending = store.unanalyzed_emails("v2.0", 10).await.unwrap();
        assert_eq!(pending, vec!["m2".to_string()]);
    }

    #[tokio::test]
    async fn rule_reinforcement_keeps_max_confidence() {
        let store = Store::new_memory().await.unwrap();
        let id = store
            .insert_or_reinforce_rule(
                RuleType::Domain,
                "Groupon.com",
                EmailAction::Delete,
                Some(EmailCategory::Promotional),
                0.95,
                Tier::Llm,
            )
            .await
            .unwrap();

        let id2 = store
            .insert_or_reinforce_rule(
                RuleType::Domain,
                "groupon.com",
                EmailAction::Delete,
                Some(EmailCategory::Promotional),
                0.90,
                Tier::Llm,
            )
            .await
            .unwrap();
        assert_eq!(id, id2);

        let rule = store.get_rule(id).await.unwrap().unwrap();
        assert!((rule.confidence - 0.95).abs() < 1e-6);
        assert_eq!(rule.pattern, "groupon.com");
    }

    #[tokio::test]
    async fn conflicting_rule_action_rejected() {
        let store = Store::new_memory().await.unwrap();
        store
            .insert_or_reinforce_rule(
                RuleType::Email,
                "boss@work.com",
                EmailAction::Keep,
                Some(EmailCategory::Work),
                0.95,
                Tier::Human,
            )
            .await
            .unwrap();

        let conflict = store
            .insert_or_reinforce_rule(
                RuleType::Email,
                "boss@work.com",
                EmailAction::Delete,
                None,
                0.99,
                Tier::Llm,
            )
            .await;
        assert!(matches!(conflict, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn rule_feedback_returns_consistent_counters() {
        let store = Store::new_memory().await.unwrap();
        let id = store
            .insert_or_reinforce_rule(
                RuleType::Domain,
                "spam.org",
                EmailAction::Delete,
                None,
                0.9,
                Tier::Llm,
            )
            .await
            .unwrap();

        let r1 = store.apply_rule_feedback(id, true).await.unwrap();
        assert_eq!(r1.times_checked, 1);
        assert_eq!(r1.times_correct, 1);

        let r2 = store.apply_rule_feedback(id, false).await.unwrap();
        assert_eq!(r2.times_checked, 2);
        assert_eq!(r2.times_correct, 1);
        assert_eq!(r2.accuracy(), Some(0.5));
    }

    #[tokio::test]
    async fn deactivated_rules_stay_queryable_but_unlisted() {
        let store = Store::new_memory().await.unwrap();
        let id = store
            .insert_or_reinforce_rule(
                RuleType::Domain,
                "spam.org",
                EmailAction::Delete,
                None,
                0.9,
                Tier::Llm,
            )
            .await
            .unwrap();
        store.deactivate_rule(id).await.unwrap();

        assert!(store.list_active_rules().await.unwrap().is_empty());
        let rule = store.get_rule(id).await.unwrap().unwrap();
        assert!(!rule.is_active);
    }

    #[tokio::test]
    async fn agreeing_decision_tallies() {
        let store = Store::new_memory().await.unwrap();
        for i in 0..3 {
            let id = format!("m{i}");
            store
                .upsert_email(&email(&id, "deals@groupon.com"))
                .await
                .unwrap();
            let mut d = decision(&id, Tier::Llm, EmailAction::Delete, 0.97);
            d.model = format!("model-{i}");
            store.insert_decision(&d, &[]).await.unwrap();
        }
        // One low-confidence decision that must not count
        store
            .upsert_email(&email("m-low", "deals@groupon.com"))
            .await
            .unwrap();
        let low = decision("m-low", Tier::Llm, EmailAction::Delete, 0.5);
        store.insert_decision(&low, &[]).await.unwrap();

        let by_sender = store
            .count_agreeing_sender_decisions("deals@groupon.com", EmailAction::Delete, 0.95)
            .await
            .unwrap();
        assert_eq!(by_sender, 3);

        let by_domain = store
            .count_agreeing_domain_decisions("groupon.com", EmailAction::Delete, 0.95)
            .await
            .unwrap();
        assert_eq!(by_domain, 3);
    }

    #[tokio::test]
    async fn training_example_lifecycle() {
        let store = Store::new_memory().await.unwrap();
        let id = store
            .insert_training_example(
                "m1",
                "Subject: Sale",
                EmailCategory::Promotional,
                EmailAction::Delete,
                Provenance::HighConfidenceAuto,
                "positive",
            )
            .await
            .unwrap();

        assert_eq!(store.count_unused_examples().await.unwrap(), 1);
        store.mark_examples_used(&[id]).await.unwrap();
        assert_eq!(store.count_unused_examples().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn few_shot_set_is_capped_and_ordered() {
        let store = Store::new_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = store
                .insert_training_example(
                    &format!("m{i}"),
                    &format!("example {i}"),
                    EmailCategory::Work,
                    EmailAction::Keep,
                    Provenance::Human,
                    "positive",
                )
                .await
                .unwrap();
            ids.push(id);
        }
        // Make example 3 clearly the most effective
        store.adjust_example_effectiveness(ids[3], 0.4).await.unwrap();

        let set = store
            .few_shot_examples(EmailCategory::Work, 3)
            .await
            .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set[0].id, ids[3]);
    }

    #[tokio::test]
    async fn model_promotion_is_exclusive() {
        let store = Store::new_memory().await.unwrap();
        let v1 = store
            .insert_model_version("personalized-v1", "personalized", None, 300, 0.82)
            .await
            .unwrap();
        store.promote_model(v1).await.unwrap();

        let v2 = store
            .insert_model_version("personalized-v2", "personalized", Some(v1), 600, 0.88)
            .await
            .unwrap();
        // Recorded but inactive until promoted
        let active = store.active_model("personalized").await.unwrap().unwrap();
        assert_eq!(active.id, v1);

        store.promote_model(v2).await.unwrap();
        let active = store.active_model("personalized").await.unwrap().unwrap();
        assert_eq!(active.id, v2);
        assert_eq!(active.parent_id, Some(v1));

        // Exactly one active row
        let old = store.get_model(v1).await.unwrap().unwrap();
        assert!(!old.is_active);
    }

    #[tokio::test]
    async fn duplicate_model_name_rejected() {
        let store = Store::new_memory().await.unwrap();
        store
            .insert_model_version("personalized-v1", "personalized", None, 10, 0.8)
            .await
            .unwrap();
        let dup = store
            .insert_model_version("personalized-v1", "personalized", None, 10, 0.8)
            .await;
        assert!(matches!(dup, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn review_queue_ordering() {
        let store = Store::new_memory().await.unwrap();
        store.enqueue_review("m1", &[], "low_confidence", 5).await.unwrap();
        store.enqueue_review("m2", &[], "llm_failed", 3).await.unwrap();
        store.enqueue_review("m3", &[], "low_confidence", 3).await.unwrap();

        // Priority 3 wins over 5; within band, FIFO by added_at/id → m2
        let next = store.next_review().await.unwrap().unwrap();
        assert_eq!(next.email_id, "m2");
    }

    #[tokio::test]
    async fn review_priority_range_enforced() {
        let store = Store::new_memory().await.unwrap();
        let bad = store.enqueue_review("m1", &[], "low_confidence", 0).await;
        assert!(matches!(bad, Err(DatabaseError::Constraint(_))));
        let bad = store.enqueue_review("m1", &[], "low_confidence", 11).await;
        assert!(matches!(bad, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn resolve_review_is_atomic() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("m1", "a@b.com")).await.unwrap();
        let item_id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();

        let d = Decision {
            email_id: "m1".into(),
            analysis_version: "v2.0".into(),
            model: "human".into(),
            category: EmailCategory::Financial,
            action: EmailAction::Keep,
            confidence: 1.0,
            fraud_score: None,
            reasoning: Some("human verdict".into()),
            tier: Tier::Human,
            decided_at: Utc::now(),
        };
        store
            .resolve_review(item_id, &d, &[], "Subject: statement")
            .await
            .unwrap();

        // All three effects happened
        let item = store.get_review_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ReviewStatus::Reviewed);
        let latest = store.latest_decision("m1", "v2.0").await.unwrap().unwrap();
        assert_eq!(latest.tier, Tier::Human);
        assert_eq!(store.count_unused_examples().await.unwrap(), 1);

        // Resolving again fails and adds nothing
        let again = store
            .resolve_review(item_id, &d, &[], "Subject: statement")
            .await;
        assert!(again.is_err());
        assert_eq!(store.count_unused_examples().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resolve_review_rolls_back_on_duplicate_decision() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("m1", "a@b.com")).await.unwrap();
        let item_id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();

        // Pre-existing decision with the human model triple
        let d = Decision {
            email_id: "m1".into(),
            analysis_version: "v2.0".into(),
            model: "human".into(),
            category: EmailCategory::Financial,
            action: EmailAction::Keep,
            confidence: 1.0,
            fraud_score: None,
            reasoning: None,
            tier: Tier::Human,
            decided_at: Utc::now(),
        };
        store.insert_decision(&d, &[]).await.unwrap();

        let result = store.resolve_review(item_id, &d, &[], "text").await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));

        // Neither the status flip nor the example survived the rollback
        let item = store.get_review_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ReviewStatus::Pending);
        assert_eq!(store.count_unused_examples().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transactions_run_on_their_own_connection() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("m1", "a@b.com")).await.unwrap();

        // Commits on the transactional connection are visible through the
        // shared one
        let v1 = store
            .insert_model_version("personalized-v1", "personalized", None, 10, 0.9)
            .await
            .unwrap();
        store.promote_model(v1).await.unwrap();
        let active = store.active_model("personalized").await.unwrap().unwrap();
        assert_eq!(active.name, "personalized-v1");

        // A rollback over there never touches rows written through the
        // shared connection
        let bystander = Decision {
            email_id: "m1".into(),
            analysis_version: "v2.0".into(),
            model: "llama".into(),
            category: EmailCategory::Work,
            action: EmailAction::Keep,
            confidence: 0.9,
            fraud_score: None,
            reasoning: None,
            tier: Tier::Llm,
            decided_at: Utc::now(),
        };
        store.insert_decision(&bystander, &[]).await.unwrap();

        let item_id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();
        let human = Decision {
            model: "human".into(),
            confidence: 1.0,
            tier: Tier::Human,
            ..bystander.clone()
        };
        store.insert_decision(&human, &[]).await.unwrap();
        // Duplicate human decision forces the rollback path
        let result = store.resolve_review(item_id, &human, &[], "text").await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));

        let decisions = store.decisions_for("m1").await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(
            store.active_model("personalized").await.unwrap().unwrap().id,
            v1
        );
    }

    #[tokio::test]
    async fn skip_review_is_terminal() {
        let store = Store::new_memory().await.unwrap();
        let id = store
            .enqueue_review("m1", &[], "low_confidence", 5)
            .await
            .unwrap();
        store.skip_review(id).await.unwrap();
        assert!(store.skip_review(id).await.is_err());
        assert!(store.next_review().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletion_candidates_filtering() {
        let store = Store::new_memory().await.unwrap();

        // Old shopping email, high-confidence DELETE → candidate
        store.upsert_email(&email("del1", "shop@x.com")).await.unwrap();
        let d = decision("del1", Tier::Llm, EmailAction::Delete, 0.9);
        store.insert_decision(&d, &[]).await.unwrap();

        // KEEP decision → never a candidate
        store.upsert_email(&email("keep1", "work@y.com")).await.unwrap();
        let k = decision("keep1", Tier::Llm, EmailAction::Keep, 0.99);
        store.insert_decision(&k, &[]).await.unwrap();

        // Low-confidence DELETE → excluded by min confidence
        store.upsert_email(&email("low1", "z@z.com")).await.unwrap();
        let low = decision("low1", Tier::Llm, EmailAction::Delete, 0.5);
        store.insert_decision(&low, &[]).await.unwrap();

        let candidates = store
            .deletion_candidates("v2.0", &[EmailCategory::Shopping], Some(30), Some(365), 0.7)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].email_id, "del1");
    }

    #[tokio::test]
    async fn deletion_candidates_excludes_already_deleted() {
        let store = Store::new_memory().await.unwrap();
        store.upsert_email(&email("del1", "shop@x.com")).await.unwrap();
        let d = decision("del1", Tier::Llm, EmailAction::Delete, 0.9);
        store.insert_decision(&d, &[]).await.unwrap();

        let op = Uuid::new_v4();
        store.insert_cleanup_operation(op, false).await.unwrap();
        let now = Utc::now();
        store
            .insert_deleted_email(op, "del1", now, now + ChronoDuration::days(30))
            .await
            .unwrap();

        let candidates = store
            .deletion_candidates("v2.0", &[], None, None, 0.0)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = Store::new_memory().await.unwrap();
        assert_eq!(
            store.get_setting("system_phase").await.unwrap().as_deref(),
            Some("training")
        );
        store.set_setting("system_phase", "production").await.unwrap();
        assert_eq!(
            store.get_setting("system_phase").await.unwrap().as_deref(),
            Some("production")
        );
        assert!(store.get_setting("missing").await.unwrap().is_none());
    }
}
