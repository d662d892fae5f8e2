//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// Every threshold here is a tunable, not a constant: the defaults come
/// from the settings the system shipped with, and persisted overrides can
/// be loaded from the `system_settings` table at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Analysis epoch written to every decision row (append-only key part).
    pub analysis_version: String,
    /// Tier 1 finalizes at or above this confidence; below it the
    /// classifier declines and the email escalates.
    pub classifier_confidence_threshold: f32,
    /// Tier 2 finalizes at or above this confidence. Lower than tier 1's
    /// because the LLM is the more expensive, more accurate stage.
    pub llm_confidence_threshold: f32,
    /// Per-call timeout for the tier 1 classifier.
    pub classifier_timeout: Duration,
    /// Per-call timeout for the tier 2 LLM call.
    pub llm_timeout: Duration,
    /// LLM retry attempts before escalating as `llm_failed`.
    pub llm_max_retries: u32,
    /// Base backoff between LLM retries (jittered, doubled per attempt).
    pub llm_retry_backoff: Duration,
    /// Consistent agreeing decisions required before a rule is induced.
    pub rule_induction_min_agreements: u32,
    /// Minimum decision confidence that counts toward rule induction.
    pub rule_induction_min_confidence: f32,
    /// A rule is deactivated when its rolling accuracy drops below this.
    pub rule_accuracy_floor: f64,
    /// Feedback samples required before the accuracy floor applies.
    pub rule_min_feedback_samples: u32,
    /// Minimum confidence for an auto-decision to become a training example.
    pub auto_example_min_confidence: f32,
    /// Unused training examples that accumulate before retraining fires.
    pub retraining_threshold: u32,
    /// Validation-accuracy margin a new model must clear to be promoted.
    pub promotion_margin: f64,
    /// Few-shot examples kept per category.
    pub few_shot_cap_per_category: u32,
    /// Few-shot examples actually placed in each prompt.
    pub few_shot_prompt_size: usize,
    /// Review-queue priority for LLM-declined emails (1 = highest, 10 = lowest).
    pub review_default_priority: u8,
    /// Review-queue priority when the LLM backend failed outright.
    pub review_llm_failed_priority: u8,
    /// Concurrent email pipelines in a batch run.
    pub max_concurrent_emails: usize,
    /// Whether cleanup execution defaults to dry-run.
    pub cleanup_dry_run_default: bool,
    /// Remote trash retention — the restoration window for deleted emails.
    pub trash_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analysis_version: "v2.0".to_string(),
            classifier_confidence_threshold: 0.85,
            llm_confidence_threshold: 0.75,
            classifier_timeout: Duration::from_secs(5),
            llm_timeout: Duration::from_secs(30),
            llm_max_retries: 2,
            llm_retry_backoff: Duration::from_millis(500),
            rule_induction_min_agreements: 3,
            rule_induction_min_confidence: 0.95,
            rule_accuracy_floor: 0.8,
            rule_min_feedback_samples: 5,
            auto_example_min_confidence: 0.9,
            retraining_threshold: 300,
            promotion_margin: 0.01,
            few_shot_cap_per_category: 5,
            few_shot_prompt_size: 3,
            review_default_priority: 5,
            review_llm_failed_priority: 3,
            max_concurrent_emails: 4,
            cleanup_dry_run_default: true,
            trash_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}
