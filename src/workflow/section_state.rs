//! 章节状态机

use std::fmt::{self, Display};

use crate::error::TaskError;
use crate::models::SectionIndex;

/// 单个章节在流水线中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionState {
    Pending,
    ResearchAcquired,
    ContextBuilt,
    Generated,
    QualityChecked,
    RegenerationPending,
    Persisted,
    Failed,
}

impl SectionState {
    pub fn name(self) -> &'static str {
        match self {
            SectionState::Pending => "pending",
            SectionState::ResearchAcquired => "research_acquired",
            SectionState::ContextBuilt => "context_built",
            SectionState::Generated => "generated",
            SectionState::QualityChecked => "quality_checked",
            SectionState::RegenerationPending => "regeneration_pending",
            SectionState::Persisted => "persisted",
            SectionState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: SectionState) -> bool {
        use SectionState::*;
        matches!(
            (self, next),
            (Pending, ResearchAcquired)
                | (ResearchAcquired, ContextBuilt)
                | (ContextBuilt, Generated)
                | (ContextBuilt, Failed)
                | (Generated, QualityChecked)
                | (QualityChecked, RegenerationPending)
                | (QualityChecked, Persisted)
                | (QualityChecked, Failed)
                | (RegenerationPending, Generated)
                // 重写调用失败时沿用上一版
                | (RegenerationPending, QualityChecked)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SectionState::Persisted | SectionState::Failed)
    }
}

impl Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 跟踪单个章节的状态，拒绝非法转换
#[derive(Debug, Clone)]
pub struct SectionTracker {
    index: SectionIndex,
    state: SectionState,
}

impl SectionTracker {
    pub fn new(index: SectionIndex) -> Self {
        Self {
            index,
            state: SectionState::Pending,
        }
    }

    /// 已完成质量检查的章节（例如断点续跑时从存储中读到的）
    pub fn checked(index: SectionIndex) -> Self {
        Self {
            index,
            state: SectionState::QualityChecked,
        }
    }

    pub fn state(&self) -> SectionState {
        self.state
    }

    pub fn advance(&mut self, next: SectionState) -> Result<SectionState, TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::IllegalTransition {
                index: self.index.to_string(),
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_one_regeneration() {
        let mut tracker = SectionTracker::new(SectionIndex::top(1));
        for next in [
            SectionState::ResearchAcquired,
            SectionState::ContextBuilt,
            SectionState::Generated,
            SectionState::QualityChecked,
            SectionState::RegenerationPending,
            SectionState::Generated,
            SectionState::QualityChecked,
            SectionState::Persisted,
        ] {
            tracker.advance(next).unwrap();
        }
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut tracker = SectionTracker::new(SectionIndex::child(2, 1));
        let err = tracker.advance(SectionState::Generated).unwrap_err();
        assert!(err.to_string().contains("2.1"));
        assert_eq!(tracker.state(), SectionState::Pending);

        let mut done = SectionTracker::checked(SectionIndex::top(1));
        done.advance(SectionState::Persisted).unwrap();
        assert!(done.advance(SectionState::Generated).is_err());
        assert!(!SectionState::Failed.can_transition_to(SectionState::Pending));
    }
}
