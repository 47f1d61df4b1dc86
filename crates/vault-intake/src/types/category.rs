//! Processing categories and queue tiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Worker pool a job is routed to, derived from its detected content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingCategory {
    /// Text documents, spreadsheets, presentations, e-books
    Documents,
    /// Raster and layered images
    Images,
    /// Audio recordings
    Audio,
    /// Video containers
    Video,
    /// Compressed archives
    Archive,
    /// Mail and message stores
    Communication,
    /// Binaries, databases and anything unrecognized
    Other,
}

impl ProcessingCategory {
    /// All categories, in pool index order
    pub const ALL: [ProcessingCategory; 7] = [
        ProcessingCategory::Documents,
        ProcessingCategory::Images,
        ProcessingCategory::Audio,
        ProcessingCategory::Video,
        ProcessingCategory::Archive,
        ProcessingCategory::Communication,
        ProcessingCategory::Other,
    ];

    /// Stable index into per-category arrays
    pub fn index(self) -> usize {
        match self {
            Self::Documents => 0,
            Self::Images => 1,
            Self::Audio => 2,
            Self::Video => 3,
            Self::Archive => 4,
            Self::Communication => 5,
            Self::Other => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Images => "images",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Archive => "archive",
            Self::Communication => "communication",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProcessingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown processing category: {}", s))
    }
}

/// Priority bucket a job is placed in at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueTier {
    Priority,
    Normal,
    Bulk,
}

impl QueueTier {
    /// All tiers, highest first
    pub const ALL: [QueueTier; 3] = [QueueTier::Priority, QueueTier::Normal, QueueTier::Bulk];

    pub fn index(self) -> usize {
        match self {
            Self::Priority => 0,
            Self::Normal => 1,
            Self::Bulk => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Normal => "normal",
            Self::Bulk => "bulk",
        }
    }
}

impl fmt::Display for QueueTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown queue tier: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_index_is_dense() {
        for (i, category) in ProcessingCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn test_parse_round_trip_names() {
        assert_eq!("communication".parse::<ProcessingCategory>().unwrap(), ProcessingCategory::Communication);
        assert_eq!("bulk".parse::<QueueTier>().unwrap(), QueueTier::Bulk);
        assert!("spreadsheets".parse::<ProcessingCategory>().is_err());
    }

    #[test]
    fn test_tiers_ordered_highest_first() {
        assert!(QueueTier::Priority < QueueTier::Normal);
        assert!(QueueTier::Normal < QueueTier::Bulk);
    }
}
