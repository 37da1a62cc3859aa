//! Fence state tracking.
//!
//! A fence is signaled by the device when submitted work completes and is
//! observed by the host. It must be reset before it can accompany another
//! submission; attaching a fence that is still in flight, or that was
//! signaled and never reset, is a usage violation.

use crate::{RuleId, Violation};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

/// Who currently owns a fence's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceScope {
    Internal,
    External,
}

/// The lifecycle state of a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    /// Reset and ready to accompany a submission.
    Unsignaled,

    /// Attached to submitted work that has not yet completed.
    Inflight,

    /// Signaled by the device and not yet reset.
    Retired,
}

/// Durable record for a fence.
#[derive(Debug)]
pub struct FenceRecord {
    handle: vk::Fence,
    state: Mutex<FenceStateInner>,
}

#[derive(Debug)]
struct FenceStateInner {
    scope: FenceScope,
    state: FenceState,
}

impl FenceRecord {
    /// Creates the record for a fence, optionally created pre-signaled.
    pub fn new(handle: vk::Fence, signaled: bool) -> Self {
        FenceRecord {
            handle,
            state: Mutex::new(FenceStateInner {
                scope: FenceScope::Internal,
                state: if signaled {
                    FenceState::Retired
                } else {
                    FenceState::Unsignaled
                },
            }),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn state(&self) -> FenceState {
        self.state.lock().state
    }

    pub fn scope(&self) -> FenceScope {
        self.state.lock().scope
    }

    /// Records that an external payload was imported into this fence.
    pub fn import(&self) {
        self.state.lock().scope = FenceScope::External;
    }

    /// Resets the fence to the unsignaled state.
    pub fn reset(&self) -> Result<(), FenceResetError> {
        let mut state = self.state.lock();

        if state.state == FenceState::Inflight {
            return Err(FenceResetError::InFlight);
        }

        state.state = FenceState::Unsignaled;

        Ok(())
    }

    /// Records that the device signaled the fence.
    pub fn retire(&self) {
        self.state.lock().state = FenceState::Retired;
    }

    /// Commits this fence into the in-flight state for a submitted batch.
    pub(crate) fn mark_inflight(&self) {
        self.state.lock().state = FenceState::Inflight;
    }

    /// Checks that the fence can accompany a new submission.
    ///
    /// This check is independent of every other record; it consults fence
    /// state only.
    pub(crate) fn validate_submission(&self, context: &str, violations: &mut Vec<Violation>) {
        match self.state.lock().state {
            FenceState::Unsignaled => {}
            FenceState::Inflight => violations.push(Violation::new(
                RuleId::FenceInFlight,
                smallvec![self.handle.as_raw()],
                format!(
                    "{}: is already associated with submitted work that has not completed",
                    context,
                ),
            )),
            FenceState::Retired => violations.push(Violation::new(
                RuleId::FenceAlreadySignaled,
                smallvec![self.handle.as_raw()],
                format!("{}: is already signaled and has not been reset", context),
            )),
        }
    }
}

/// Error that can happen when resetting a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceResetError {
    /// The fence is attached to submitted work that has not completed.
    InFlight,
}

impl Error for FenceResetError {}

impl Display for FenceResetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::InFlight => {
                write!(f, "the fence is associated with submitted work that has not completed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_unsignaled() {
        let fence = FenceRecord::new(vk::Fence::from_raw(1), false);
        assert_eq!(fence.state(), FenceState::Unsignaled);

        let mut violations = Vec::new();
        fence.validate_submission("fence", &mut violations);
        assert!(violations.is_empty());
    }

    #[test]
    fn created_signaled_requires_reset() {
        let fence = FenceRecord::new(vk::Fence::from_raw(1), true);
        assert_eq!(fence.state(), FenceState::Retired);

        let mut violations = Vec::new();
        fence.validate_submission("fence", &mut violations);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, RuleId::FenceAlreadySignaled);

        fence.reset().unwrap();
        let mut violations = Vec::new();
        fence.validate_submission("fence", &mut violations);
        assert!(violations.is_empty());
    }

    #[test]
    fn in_flight_cannot_be_reset_or_reused() {
        let fence = FenceRecord::new(vk::Fence::from_raw(1), false);
        fence.mark_inflight();

        assert_eq!(fence.reset(), Err(FenceResetError::InFlight));

        let mut violations = Vec::new();
        fence.validate_submission("fence", &mut violations);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, RuleId::FenceInFlight);

        fence.retire();
        fence.reset().unwrap();
        assert_eq!(fence.state(), FenceState::Unsignaled);
    }
}
