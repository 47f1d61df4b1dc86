//! Processing results and the versioned slot that publishes them

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::job::PathMode;

/// Output of one processing path for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub content: String,
    pub confidence: f32,
    pub backend_id: String,
    pub duration_ms: u64,
    pub path: PathMode,
    pub produced_at: DateTime<Utc>,
}

/// Why a slot write was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotConflict {
    /// Another writer committed since the token was read; retry with `current`
    Stale { current: u64 },
    /// A deep result is already visible; fast output is dropped
    Superseded,
}

#[derive(Debug, Default)]
struct SlotInner {
    version: u64,
    visible: Option<Arc<ProcessingResult>>,
    replaced_fast: Option<Arc<ProcessingResult>>,
}

/// The single published result of a job.
///
/// Writers read a version token, then commit against it. A commit with a stale
/// token is refused and the writer re-reads. Once a deep result is visible a fast
/// result can never replace it, and the visible value is swapped in one step so
/// readers never observe an empty slot after the first commit.
#[derive(Debug, Default)]
pub struct ResultSlot {
    inner: RwLock<SlotInner>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot seeded with a previously persisted result
    pub fn restored(result: ProcessingResult, version: u64) -> Self {
        Self {
            inner: RwLock::new(SlotInner {
                version,
                visible: Some(Arc::new(result)),
                replaced_fast: None,
            }),
        }
    }

    /// Current version token
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Currently visible result
    pub fn current(&self) -> Option<Arc<ProcessingResult>> {
        self.inner.read().visible.clone()
    }

    /// The fast result a deep result replaced, if any
    pub fn replaced_fast(&self) -> Option<Arc<ProcessingResult>> {
        self.inner.read().replaced_fast.clone()
    }

    /// Commit `result` if the slot is still at `expected`. Returns the new version.
    pub fn try_commit(&self, result: ProcessingResult, expected: u64) -> Result<u64, SlotConflict> {
        let mut inner = self.inner.write();

        let deep_visible = inner
            .visible
            .as_ref()
            .is_some_and(|r| r.path == PathMode::Deep);
        if result.path == PathMode::Fast && deep_visible {
            return Err(SlotConflict::Superseded);
        }
        if inner.version != expected {
            return Err(SlotConflict::Stale { current: inner.version });
        }

        let previous = inner.visible.replace(Arc::new(result));
        if let Some(prev) = previous {
            if prev.path == PathMode::Fast {
                inner.replaced_fast = Some(prev);
            }
        }
        inner.version += 1;
        Ok(inner.version)
    }

    /// Optimistic write loop: re-read the token until the commit lands or is superseded
    pub fn publish(&self, result: ProcessingResult) -> Result<u64, SlotConflict> {
        let mut token = self.version();
        loop {
            match self.try_commit(result.clone(), token) {
                Err(SlotConflict::Stale { current }) => token = current,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: PathMode, content: &str) -> ProcessingResult {
        ProcessingResult {
            content: content.to_string(),
            confidence: 0.5,
            backend_id: "test".to_string(),
            duration_ms: 1,
            path,
            produced_at: Utc::now(),
        }
    }

    #[test]
    fn test_deep_supersedes_fast() {
        let slot = ResultSlot::new();
        assert_eq!(slot.publish(result(PathMode::Fast, "quick")), Ok(1));
        assert_eq!(slot.current().unwrap().content, "quick");

        assert_eq!(slot.publish(result(PathMode::Deep, "thorough")), Ok(2));
        assert_eq!(slot.current().unwrap().content, "thorough");
        assert_eq!(slot.replaced_fast().unwrap().content, "quick");
    }

    #[test]
    fn test_late_fast_is_rejected_after_deep() {
        let slot = ResultSlot::new();
        slot.publish(result(PathMode::Deep, "thorough")).unwrap();
        assert_eq!(
            slot.publish(result(PathMode::Fast, "quick")),
            Err(SlotConflict::Superseded)
        );
        assert_eq!(slot.current().unwrap().path, PathMode::Deep);
    }

    #[test]
    fn test_stale_token_is_refused() {
        let slot = ResultSlot::new();
        let token = slot.version();
        slot.publish(result(PathMode::Fast, "quick")).unwrap();
        assert_eq!(
            slot.try_commit(result(PathMode::Deep, "thorough"), token),
            Err(SlotConflict::Stale { current: 1 })
        );
        // the visible value is untouched by the refused write
        assert_eq!(slot.current().unwrap().content, "quick");
    }

    #[test]
    fn test_visible_result_never_empties() {
        let slot = Arc::new(ResultSlot::new());
        slot.publish(result(PathMode::Fast, "quick")).unwrap();

        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 0..200 {
                    slot.publish(result(PathMode::Deep, &format!("deep-{}", i))).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            assert!(slot.current().is_some());
        }
        writer.join().unwrap();
        assert_eq!(slot.current().unwrap().path, PathMode::Deep);
    }
}
