//! Runtime conformance checking for Vulkan-style queue submission.
//!
//! `vklint` sits between an application and a driver for an explicit
//! graphics/compute API and decides whether the *act of submitting* a batch
//! of command buffers to a queue is legal, given the tracked lifecycle and
//! synchronization state of every object the batch references. It never
//! alters or blocks the call it inspects; it only reports violations.
//!
//! The crate is built around three pieces:
//!
//! - The [`Tracker`](tracker::Tracker) holds durable, reference-counted
//!   records for command buffers, semaphores, fences and queues, mirroring
//!   the state transitions the application performs on the real objects.
//! - The [`Validator`](submit::Validator) simulates the ordering effects of
//!   an entire submission call before any of it executes: binary-semaphore
//!   forward progress, timeline-semaphore monotonicity, command-buffer
//!   reuse, fence state, and the cross-buffer invariants of the batch
//!   (render-pass suspension balance, protected-memory consistency,
//!   device-group masks).
//! - A [`DiagnosticSink`] receives one [`Violation`] per broken rule. The
//!   aggregate result is advisory: even a rejected call may still be
//!   forwarded to the driver by the surrounding dispatch layer.
//!
//! Validation is a pure decision over a call-private simulation. Durable
//! state changes only through [`Validator::commit`](submit::Validator::commit)
//! once the driver has accepted the work, so a failed batch leaves no trace.

pub use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt::{Display, Formatter, Result as FmtResult};

pub mod command_buffer;
pub mod device;
pub mod submit;
pub mod sync;
pub mod tracker;

/// How serious a reported violation is.
///
/// Everything the submission validator reports is a contract violation, so
/// almost all rules are [`Error`](Severity::Error); `Warning` exists for
/// advisory diagnostics raised by embedders through the same sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// Identifies the usage rule that a [`Violation`] reports.
///
/// Each variant corresponds to one stable identifier of the API's valid
/// usage catalogue, returned by [`RuleId::vuid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleId {
    /// A command buffer in the initial state was submitted.
    NotRecorded,
    /// A command buffer was submitted before recording ended.
    StillRecording,
    /// A command buffer was submitted after a resource it references was
    /// destroyed, updated or re-recorded.
    Invalidated,
    /// A one-time-submit command buffer was submitted more than once.
    OneTimeSubmitViolation,
    /// A command buffer without simultaneous use is already in flight, or
    /// appears more than once in the same call.
    ConcurrentUseViolation,
    /// A linked secondary command buffer is not executable.
    SecondaryNotExecutable,
    /// A linked secondary command buffer is bound to a different primary
    /// and was not recorded with simultaneous use.
    SecondaryBoundElsewhere,
    /// A command buffer was submitted to a queue of a different family than
    /// the pool it was allocated from.
    QueueFamilyMismatch,
    /// An object with concurrent sharing is used on a queue family absent
    /// from its declared family list.
    ConcurrentSharingViolation,
    /// A binary semaphore wait raced with an unconsumed wait on another
    /// queue.
    OtherQueueWaiting,
    /// A binary semaphore wait can never be satisfied: no pending or
    /// completed signal exists.
    CannotBeSignalled,
    /// A binary semaphore signal would overwrite an unconsumed signal.
    QueueForwardProgress,
    /// A timeline semaphore signal value is not strictly greater than every
    /// other known signal value.
    NonIncreasingValue,
    /// A timeline semaphore operation value is too far ahead of the last
    /// known value.
    MaxDiffExceeded,
    /// One call both waits for and signals a timeline value such that the
    /// wait can never be ordered after the signal.
    WaitValueNotLessThanSignal,
    /// The fence is already associated with unfinished submitted work.
    FenceInFlight,
    /// The fence is signaled and was not reset before reuse.
    FenceAlreadySignaled,
    /// A suspended render pass instance was followed by a command buffer
    /// that contains a render pass instance without resuming it.
    UnresumedSuspension,
    /// A command buffer resumes a render pass instance that was never
    /// suspended.
    ResumeWithoutSuspension,
    /// A render pass instance is still suspended at the end of a submission
    /// descriptor.
    DanglingSuspension,
    /// A protected submission references an unprotected command buffer.
    UnprotectedInProtectedBatch,
    /// An unprotected submission references a protected command buffer.
    ProtectedInUnprotectedBatch,
    /// A protected submission was made to a queue whose family does not
    /// support protected memory.
    ProtectedQueueRequired,
    /// A device-group mask or device index exceeds the physical device
    /// count.
    MaskOutOfRange,
    /// Device-group per-structure counts disagree with the submission's own
    /// counts.
    MaskCountMismatch,
}

impl RuleId {
    /// Returns the stable valid-usage identifier for this rule.
    pub fn vuid(self) -> &'static str {
        match self {
            Self::NotRecorded | Self::StillRecording | Self::Invalidated => {
                "VUID-vkQueueSubmit-pCommandBuffers-00072"
            }
            Self::OneTimeSubmitViolation => "VUID-vkQueueSubmit-pCommandBuffers-00071",
            Self::ConcurrentUseViolation => "VUID-vkQueueSubmit-pCommandBuffers-00070",
            Self::SecondaryNotExecutable => "VUID-vkQueueSubmit-pCommandBuffers-00072",
            Self::SecondaryBoundElsewhere => "VUID-vkQueueSubmit-pCommandBuffers-00073",
            Self::QueueFamilyMismatch => "VUID-vkQueueSubmit-pCommandBuffers-00074",
            Self::ConcurrentSharingViolation => "VUID-vkQueueSubmit-pSubmits-04626",
            Self::OtherQueueWaiting => "VUID-vkQueueSubmit-pWaitSemaphores-00068",
            Self::CannotBeSignalled => "VUID-vkQueueSubmit-pWaitSemaphores-03238",
            Self::QueueForwardProgress => "VUID-vkQueueSubmit-pSignalSemaphores-00067",
            Self::NonIncreasingValue => "VUID-VkSubmitInfo-pSignalSemaphores-03242",
            Self::MaxDiffExceeded => "VUID-VkSubmitInfo-pSignalSemaphores-03244",
            Self::WaitValueNotLessThanSignal => "VUID-VkSubmitInfo-pWaitSemaphores-03243",
            Self::FenceInFlight => "VUID-vkQueueSubmit-fence-00064",
            Self::FenceAlreadySignaled => "VUID-vkQueueSubmit-fence-00063",
            Self::UnresumedSuspension => "VUID-VkSubmitInfo-pCommandBuffers-06016",
            Self::ResumeWithoutSuspension => "VUID-VkSubmitInfo-pCommandBuffers-06193",
            Self::DanglingSuspension => "VUID-VkSubmitInfo-pCommandBuffers-06014",
            Self::UnprotectedInProtectedBatch => "VUID-VkSubmitInfo-pNext-04148",
            Self::ProtectedInUnprotectedBatch => "VUID-VkSubmitInfo-pNext-04120",
            Self::ProtectedQueueRequired => "VUID-vkQueueSubmit-queue-06448",
            Self::MaskOutOfRange => {
                "VUID-VkDeviceGroupSubmitInfo-pCommandBufferDeviceMasks-00086"
            }
            Self::MaskCountMismatch => "VUID-VkDeviceGroupSubmitInfo-commandBufferCount-00083",
        }
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.vuid())
    }
}

/// One detected violation of the API's usage contract.
#[derive(Clone, Debug)]
pub struct Violation {
    pub severity: Severity,
    pub rule: RuleId,
    /// Raw handles of the objects involved, most specific first.
    pub objects: SmallVec<[u64; 4]>,
    pub message: String,
}

impl Violation {
    pub(crate) fn new(
        rule: RuleId,
        objects: SmallVec<[u64; 4]>,
        message: impl Into<String>,
    ) -> Self {
        Violation {
            severity: Severity::Error,
            rule,
            objects,
            message: message.into(),
        }
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}: {}", self.rule.vuid(), self.message)?;

        if !self.objects.is_empty() {
            write!(f, " (objects:")?;

            for object in &self.objects {
                write!(f, " {:#x}", object)?;
            }

            write!(f, ")")?;
        }

        Ok(())
    }
}

/// Receives every violation the validator detects.
///
/// The sink is append-only: reporting never fails and never aborts the
/// validation that produced the report.
pub trait DiagnosticSink {
    fn report(&self, violation: &Violation);
}

/// A [`DiagnosticSink`] that stores every reported violation.
#[derive(Debug, Default)]
pub struct CollectingSink {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything reported so far.
    pub fn take(&self) -> Vec<Violation> {
        std::mem::take(&mut self.violations.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a
/// field of this type can only be constructed by calling a constructor
/// function or `Default::default()`. The effect is similar to the standard
/// Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
