//! Shared domain types for the classification engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Email record ────────────────────────────────────────────────────

/// A stored email, as exposed by the mail-sync layer.
///
/// The engine treats this as read-only input keyed by `message_id`
/// (globally unique and stable). Sync, pagination, and attachment
/// handling live outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Remote message id — the engine's stable key.
    pub message_id: String,
    /// Conversation thread id, if the mailbox provides one.
    pub thread_id: Option<String>,
    pub subject: String,
    /// Bare sender address, lowercased (e.g. "deals@groupon.com").
    pub sender_email: String,
    /// Display name, if present.
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub date_sent: Option<DateTime<Utc>>,
    /// Short body preview used for classification text.
    pub snippet: String,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub attachment_count: u32,
    pub size_bytes: Option<u64>,
}

impl EmailRecord {
    /// Domain part of the sender address, if well-formed.
    pub fn sender_domain(&self) -> Option<&str> {
        self.sender_email.rsplit_once('@').map(|(_, d)| d)
    }

    /// The text the classifier and LLM see: subject, sender, preview.
    pub fn classification_text(&self) -> String {
        format!(
            "Subject: {}\nFrom: {}\n{}",
            self.subject, self.sender_email, self.snippet
        )
    }
}

// ── Categories, actions, tiers ──────────────────────────────────────

/// Email categories — the closed classification set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailCategory {
    Newsletter,
    Promotional,
    Work,
    Financial,
    Personal,
    Social,
    Health,
    Legal,
    Shopping,
    Entertainment,
    Spam,
    Unknown,
}

impl EmailCategory {
    /// All categories, in a stable order.
    pub const ALL: [EmailCategory; 12] = [
        Self::Newsletter,
        Self::Promotional,
        Self::Work,
        Self::Financial,
        Self::Personal,
        Self::Social,
        Self::Health,
        Self::Legal,
        Self::Shopping,
        Self::Entertainment,
        Self::Spam,
        Self::Unknown,
    ];

    /// Categories whose senders may be whitelisted by rule induction.
    pub fn is_protected(self) -> bool {
        matches!(
            self,
            Self::Work | Self::Financial | Self::Personal | Self::Health
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newsletter => "NEWSLETTER",
            Self::Promotional => "PROMOTIONAL",
            Self::Work => "WORK",
            Self::Financial => "FINANCIAL",
            Self::Personal => "PERSONAL",
            Self::Social => "SOCIAL",
            Self::Health => "HEALTH",
            Self::Legal => "LEGAL",
            Self::Shopping => "SHOPPING",
            Self::Entertainment => "ENTERTAINMENT",
            Self::Spam => "SPAM",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

/// What to do with an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailAction {
    Keep,
    Delete,
    Archive,
}

impl EmailAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "KEEP",
            Self::Delete => "DELETE",
            Self::Archive => "ARCHIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "KEEP" => Some(Self::Keep),
            "DELETE" => Some(Self::Delete),
            "ARCHIVE" => Some(Self::Archive),
            _ => None,
        }
    }
}

/// Pipeline tier that produced a decision, ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 0 — learned exact-match rules. Deterministic, confidence 1.0.
    Rules,
    /// Tier 1 — personalized text classifier.
    Classifier,
    /// Tier 2 — LLM few-shot reasoning.
    Llm,
    /// Tier 3 — human review. Terminal; verdicts are confidence 1.0 by fiat.
    Human,
}

impl Tier {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Rules => 0,
            Self::Classifier => 1,
            Self::Llm => 2,
            Self::Human => 3,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Rules),
            1 => Some(Self::Classifier),
            2 => Some(Self::Llm),
            3 => Some(Self::Human),
            _ => None,
        }
    }
}

// ── Verdicts and tier outcomes ──────────────────────────────────────

/// A tier's proposed classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub category: EmailCategory,
    pub action: EmailAction,
    /// 0.0–1.0.
    pub confidence: f32,
    /// Free-text explanation (LLM tiers supply one; rules synthesize one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// 0–100, when the tier assessed fraud likelihood.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud_score: Option<u8>,
}

/// Outcome of one tier's attempt at one email.
///
/// `Decline` is an explicit refusal to finalize — low confidence, an
/// UNKNOWN category, a timeout, or backend failure. It is distinct from
/// an error: a decline escalates, it never fails the email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TierOutcome {
    Decline {
        reason: String,
        /// The tier's best guess, carried forward as escalation context
        /// even though it did not clear the gate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggestion: Option<Verdict>,
    },
    Verdict(Verdict),
}

/// A visited tier's recorded suggestion, kept for audit and for
/// training-example construction when the email escalates past it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSuggestion {
    pub tier: Tier,
    /// None when the tier declined without a guess (e.g. no rule matched).
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
}

// ── Decisions ───────────────────────────────────────────────────────

/// The engine's central output: one finalized classification of one email.
///
/// Decisions are append-only. Re-analysis creates a new row under a new
/// (epoch, model) pair; nothing ever mutates or deletes an old decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub email_id: String,
    /// Decision epoch (e.g. "v2.0").
    pub analysis_version: String,
    /// The specific rule id or model version that produced this decision,
    /// so old decisions stay interpretable after rules/models are revised.
    pub model: String,
    pub category: EmailCategory,
    pub action: EmailAction,
    pub confidence: f32,
    pub fraud_score: Option<u8>,
    pub reasoning: Option<String>,
    pub tier: Tier,
    pub decided_at: DateTime<Utc>,
}
