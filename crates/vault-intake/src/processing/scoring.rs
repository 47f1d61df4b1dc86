//! Priority scoring for queue placement
//!
//! The score orders triage only. It is a fixed rule set, deterministic for the
//! same inputs, so `now` is passed in rather than read from the clock.

use chrono::{DateTime, Duration, Utc};

use crate::config::ScoringConfig;
use crate::types::{ProcessingCategory, QueueTier};

/// Subtypes weighted as spreadsheets rather than text documents
const SPREADSHEET_SUBTYPES: &[&str] = &["xlsx", "xls", "ods", "csv", "tsv"];

/// Metadata the scorer looks at
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub modified_at: DateTime<Utc>,
    pub category: ProcessingCategory,
    pub subtype: &'a str,
    pub file_name: &'a str,
    pub size_bytes: u64,
}

/// Rule-based priority scorer
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: ScoringConfig,
    keywords: Vec<String>,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        let keywords = config
            .keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { config, keywords }
    }

    /// Score in 0..=100. Each step is clamped so the running total stays in range.
    pub fn score(&self, input: &ScoreInput<'_>, now: DateTime<Utc>) -> u8 {
        let mut score = clamp(self.config.baseline);

        score = clamp(score + self.recency_bonus(input.modified_at, now));
        score = clamp(score + self.category_weight(input.category, input.subtype));
        if self.matched_keyword(input.file_name).is_some() {
            score = clamp(score + self.config.keyword_bonus);
        }
        if input.size_bytes > self.config.large_file_bytes && score < self.config.important_threshold {
            score = clamp(score - self.config.large_file_penalty);
        }
        if input.size_bytes > self.config.very_large_file_bytes {
            score = clamp(score - self.config.very_large_penalty);
        }

        score as u8
    }

    /// Map a score onto exactly one tier
    pub fn tier_for(&self, score: u8) -> QueueTier {
        if score >= self.config.priority_threshold {
            QueueTier::Priority
        } else if score >= self.config.normal_threshold {
            QueueTier::Normal
        } else {
            QueueTier::Bulk
        }
    }

    /// Large files, and mid-sized media and PDFs, go straight to the deep path
    pub fn routes_deep_only(&self, input: &ScoreInput<'_>) -> bool {
        if input.size_bytes > self.config.deep_size_threshold {
            return true;
        }
        input.size_bytes > self.config.deep_type_size_threshold
            && self
                .config
                .deep_subtypes
                .iter()
                .any(|s| s.eq_ignore_ascii_case(input.subtype))
    }

    /// First configured keyword found in the filename, case-insensitively
    pub fn matched_keyword(&self, file_name: &str) -> Option<&str> {
        let name = file_name.to_lowercase();
        self.keywords
            .iter()
            .find(|k| name.contains(k.as_str()))
            .map(|k| k.as_str())
    }

    fn recency_bonus(&self, modified_at: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
        // a modification time in the future counts as brand new
        let age = now.signed_duration_since(modified_at).max(Duration::zero());
        if age < Duration::hours(1) {
            self.config.recency_hour_bonus
        } else if age < Duration::days(1) {
            self.config.recency_day_bonus
        } else if age < Duration::weeks(1) {
            self.config.recency_week_bonus
        } else {
            0
        }
    }

    fn category_weight(&self, category: ProcessingCategory, subtype: &str) -> i32 {
        let weights = &self.config.weights;
        match category {
            ProcessingCategory::Communication => weights.communication,
            ProcessingCategory::Documents if SPREADSHEET_SUBTYPES.contains(&subtype) => {
                weights.spreadsheets
            }
            ProcessingCategory::Documents => weights.documents,
            ProcessingCategory::Audio => weights.audio,
            ProcessingCategory::Video => weights.video,
            ProcessingCategory::Images => weights.images,
            ProcessingCategory::Archive => weights.archive,
            ProcessingCategory::Other => weights.other,
        }
    }
}

/// Clamp a caller-supplied override into range
pub fn clamp_override(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

fn clamp(value: i32) -> i32 {
    value.clamp(0, 100)
}
