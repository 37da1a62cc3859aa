//! Semaphore state tracking.
//!
//! A binary semaphore alternates between unsignaled and signaled, and its
//! signal and wait operations must alternate strictly for every queue to
//! make forward progress. A timeline semaphore instead carries a
//! monotonically non-decreasing 64-bit counter; operations wait for or
//! signal specific counter values, and every signal must strictly increase
//! the set of known values without outrunning the device's
//! `maxTimelineSemaphoreValueDifference` limit.
//!
//! Durable state changes here only when a submission call is committed
//! after the driver accepted it, or through the host signal path.

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

/// Whether a semaphore is binary or carries a timeline counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreType {
    Binary,
    Timeline,
}

/// Who currently owns a semaphore's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreScope {
    /// The payload is owned and fully tracked by this device.
    Internal,

    /// The payload was permanently imported; external processes may signal
    /// and wait at any time, so forward progress cannot be proven.
    ExternalPermanent,

    /// The payload was temporarily imported; the next wait consumes the
    /// import and returns the semaphore to internal tracking.
    ExternalTemporary,
}

/// Durable record for a semaphore.
#[derive(Debug)]
pub struct SemaphoreRecord {
    handle: vk::Semaphore,
    ty: SemaphoreType,

    state: Mutex<SemaphoreState>,
}

#[derive(Debug)]
pub(crate) struct SemaphoreState {
    pub(crate) scope: SemaphoreScope,
    pub(crate) payload: SemaphorePayload,
}

#[derive(Debug)]
pub(crate) enum SemaphorePayload {
    Binary {
        /// There is a pending or completed signal that no wait has consumed.
        signaled: bool,

        /// The queue whose committed submission will produce the pending
        /// signal, if it came from a queue operation.
        signaled_by: Option<vk::Queue>,

        /// The queue holding a pending, unconsumed wait, if any.
        pending_wait: Option<vk::Queue>,
    },
    Timeline {
        /// The counter value the device has completed.
        completed_value: u64,

        /// Signal values of committed but unfinished submissions.
        pending_signals: Vec<u64>,

        /// Wait values of committed but unfinished submissions.
        pending_waits: Vec<u64>,
    },
}

impl SemaphorePayload {
    /// The highest signal value known for a timeline semaphore, completed
    /// or pending. Zero for binary semaphores.
    pub(crate) fn best_signal_value(&self) -> u64 {
        match self {
            SemaphorePayload::Binary { .. } => 0,
            SemaphorePayload::Timeline {
                completed_value,
                pending_signals,
                ..
            } => pending_signals
                .iter()
                .copied()
                .fold(*completed_value, u64::max),
        }
    }
}

impl SemaphoreRecord {
    /// Creates the record for a binary semaphore, initially unsignaled.
    pub fn new_binary(handle: vk::Semaphore) -> Self {
        SemaphoreRecord {
            handle,
            ty: SemaphoreType::Binary,
            state: Mutex::new(SemaphoreState {
                scope: SemaphoreScope::Internal,
                payload: SemaphorePayload::Binary {
                    signaled: false,
                    signaled_by: None,
                    pending_wait: None,
                },
            }),
        }
    }

    /// Creates the record for a timeline semaphore with the given initial
    /// counter value.
    pub fn new_timeline(handle: vk::Semaphore, initial_value: u64) -> Self {
        SemaphoreRecord {
            handle,
            ty: SemaphoreType::Timeline,
            state: Mutex::new(SemaphoreState {
                scope: SemaphoreScope::Internal,
                payload: SemaphorePayload::Timeline {
                    completed_value: initial_value,
                    pending_signals: Vec::new(),
                    pending_waits: Vec::new(),
                },
            }),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    #[inline]
    pub fn semaphore_type(&self) -> SemaphoreType {
        self.ty
    }

    pub fn scope(&self) -> SemaphoreScope {
        self.state.lock().scope
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock()
    }

    /// Records that an external payload was imported into this semaphore.
    pub fn import(&self, temporary: bool) {
        self.state.lock().scope = if temporary {
            SemaphoreScope::ExternalTemporary
        } else {
            SemaphoreScope::ExternalPermanent
        };
    }

    /// The current counter value of a timeline semaphore, or `None` for a
    /// binary semaphore.
    pub fn counter_value(&self) -> Option<u64> {
        match &self.state.lock().payload {
            SemaphorePayload::Binary { .. } => None,
            SemaphorePayload::Timeline {
                completed_value, ..
            } => Some(*completed_value),
        }
    }

    /// Signals a timeline semaphore from the host, completing immediately.
    ///
    /// The signaled value obeys the same rules as a queue signal operation:
    /// strictly greater than every known signal value, and no further than
    /// `max_value_difference` ahead of the last known value.
    pub fn signal(
        &self,
        value: u64,
        max_value_difference: u64,
    ) -> Result<(), SemaphoreSignalError> {
        let mut state = self.state.lock();

        let SemaphorePayload::Timeline {
            completed_value,
            pending_signals,
            ..
        } = &mut state.payload
        else {
            return Err(SemaphoreSignalError::NotTimeline);
        };

        let best = pending_signals
            .iter()
            .copied()
            .fold(*completed_value, u64::max);

        if value <= best {
            return Err(SemaphoreSignalError::NonIncreasingValue {
                value,
                current: best,
            });
        }

        if value - best > max_value_difference {
            return Err(SemaphoreSignalError::MaxDifferenceExceeded {
                value,
                current: best,
                max_value_difference,
            });
        }

        *completed_value = value;

        Ok(())
    }
}

/// Error that can happen when signaling a timeline semaphore from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreSignalError {
    /// The semaphore is not a timeline semaphore.
    NotTimeline,

    /// The signaled value is not strictly greater than the current value.
    NonIncreasingValue { value: u64, current: u64 },

    /// The signaled value is too far ahead of the current value.
    MaxDifferenceExceeded {
        value: u64,
        current: u64,
        max_value_difference: u64,
    },
}

impl Error for SemaphoreSignalError {}

impl Display for SemaphoreSignalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotTimeline => write!(f, "the semaphore is not a timeline semaphore"),
            Self::NonIncreasingValue { value, current } => write!(
                f,
                "the signaled value {} is not strictly greater than the current value {}",
                value, current,
            ),
            Self::MaxDifferenceExceeded {
                value,
                current,
                max_value_difference,
            } => write!(
                f,
                "the signaled value {} is more than {} ahead of the current value {}",
                value, max_value_difference, current,
            ),
        }
    }
}
