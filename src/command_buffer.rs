//! Tracking and validation of command buffer lifecycle state.
//!
//! A command buffer moves from `Initial` through `Recording` to
//! `Executable`, and drops into an invalid state when a resource it
//! references is destroyed, updated or re-recorded. Submission validation
//! reads this state without mutating it; the projected effects of a passing
//! batch are committed separately, once the driver has accepted the work.

use crate::{device::QueueRecord, RuleId, Violation};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

/// Whether a command buffer is directly submittable or executed from within
/// a primary command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// The lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandBufferLifecycle {
    /// Freshly allocated or reset; contains no commands.
    #[default]
    Initial,

    /// Between the begin and end of recording.
    Recording,

    /// Recording has ended and the buffer can be submitted.
    Executable,

    /// A referenced resource was invalidated before recording ended.
    InvalidIncomplete,

    /// A referenced resource was invalidated after recording ended.
    InvalidComplete,
}

/// Render-pass-instance properties recorded into a command buffer.
///
/// A render pass instance may be suspended in one command buffer and
/// resumed in a later buffer of the same submission descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderPassInstanceFlags {
    /// The command buffer contains at least one render pass instance.
    pub has_instance: bool,

    /// The last render pass instance in the buffer is suspended.
    pub suspends: bool,

    /// The first render pass instance in the buffer resumes a previously
    /// suspended instance.
    pub resumes: bool,
}

/// Declares that an object bound into the command buffer was created with
/// concurrent sharing across the given queue families.
#[derive(Clone, Debug)]
pub struct ConcurrentSharing {
    /// Raw handle of the shared object.
    pub object: u64,

    /// The queue families the object was declared to be used on.
    pub queue_family_indices: SmallVec<[u32; 2]>,
}

/// Why a command buffer left the recorded state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationCause {
    /// A bound descriptor set was destroyed.
    DescriptorSetDestroyed(u64),

    /// A bound descriptor set was updated without the update-after-bind
    /// capability.
    DescriptorSetUpdated(u64),

    /// A linked secondary command buffer was reset or re-recorded.
    SecondaryRerecorded(u64),

    /// Another referenced resource was destroyed.
    ResourceDestroyed(u64),
}

impl InvalidationCause {
    fn object(self) -> u64 {
        match self {
            Self::DescriptorSetDestroyed(object)
            | Self::DescriptorSetUpdated(object)
            | Self::SecondaryRerecorded(object)
            | Self::ResourceDestroyed(object) => object,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::DescriptorSetDestroyed(_) => "a bound descriptor set was destroyed",
            Self::DescriptorSetUpdated(_) => "a bound descriptor set was updated",
            Self::SecondaryRerecorded(_) => "a linked secondary command buffer was re-recorded",
            Self::ResourceDestroyed(_) => "a referenced resource was destroyed",
        }
    }
}

/// Durable record for a command buffer.
#[derive(Debug)]
pub struct CommandBufferRecord {
    handle: vk::CommandBuffer,
    level: CommandBufferLevel,
    queue_family_index: u32,
    protected: bool,

    state: Mutex<CommandBufferState>,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    lifecycle: CommandBufferLifecycle,
    usage: vk::CommandBufferUsageFlags,

    /// Completed and in-flight submissions, cumulative since the last reset.
    submit_count: u64,

    /// Submissions currently executing on a queue.
    pending_submits: u32,

    invalidated_by: Option<InvalidationCause>,
    render_pass_instance: RenderPassInstanceFlags,
    secondaries: Vec<Arc<CommandBufferRecord>>,

    /// For a secondary buffer, the primary it was most recently recorded
    /// into.
    bound_primary: Option<vk::CommandBuffer>,

    concurrent_sharing: Vec<ConcurrentSharing>,
}

impl CommandBufferRecord {
    pub fn new(
        handle: vk::CommandBuffer,
        level: CommandBufferLevel,
        queue_family_index: u32,
        protected: bool,
    ) -> Self {
        CommandBufferRecord {
            handle,
            level,
            queue_family_index,
            protected,
            state: Mutex::new(CommandBufferState::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Returns the index of the queue family of the pool this buffer was
    /// allocated from.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn lifecycle(&self) -> CommandBufferLifecycle {
        self.state.lock().lifecycle
    }

    pub fn usage(&self) -> vk::CommandBufferUsageFlags {
        self.state.lock().usage
    }

    /// Returns whether any submission of this buffer is still executing.
    pub fn is_in_flight(&self) -> bool {
        self.state.lock().pending_submits != 0
    }

    pub fn render_pass_instance(&self) -> RenderPassInstanceFlags {
        self.state.lock().render_pass_instance
    }

    /// Begins recording, implicitly resetting the buffer first.
    pub fn begin(&self, usage: vk::CommandBufferUsageFlags) -> Result<(), RecordStateError> {
        let mut state = self.state.lock();

        if state.lifecycle == CommandBufferLifecycle::Recording {
            return Err(RecordStateError::AlreadyRecording);
        }

        if state.pending_submits != 0 {
            return Err(RecordStateError::InFlight);
        }

        *state = CommandBufferState {
            lifecycle: CommandBufferLifecycle::Recording,
            usage,
            ..Default::default()
        };

        Ok(())
    }

    /// Ends recording, making the buffer executable.
    pub fn end(&self) -> Result<(), RecordStateError> {
        let mut state = self.state.lock();

        if state.lifecycle != CommandBufferLifecycle::Recording {
            return Err(RecordStateError::NotRecording);
        }

        state.lifecycle = CommandBufferLifecycle::Executable;

        Ok(())
    }

    /// Returns the buffer to the initial state, discarding its contents.
    pub fn reset(&self) -> Result<(), RecordStateError> {
        let mut state = self.state.lock();

        if state.pending_submits != 0 {
            return Err(RecordStateError::InFlight);
        }

        *state = CommandBufferState::default();

        Ok(())
    }

    /// Marks the buffer invalid because a resource it references was
    /// destroyed, updated or re-recorded.
    pub fn invalidate(&self, cause: InvalidationCause) {
        let mut state = self.state.lock();

        state.lifecycle = match state.lifecycle {
            CommandBufferLifecycle::Initial => return,
            CommandBufferLifecycle::Recording | CommandBufferLifecycle::InvalidIncomplete => {
                CommandBufferLifecycle::InvalidIncomplete
            }
            CommandBufferLifecycle::Executable | CommandBufferLifecycle::InvalidComplete => {
                CommandBufferLifecycle::InvalidComplete
            }
        };
        state.invalidated_by = Some(cause);
    }

    /// Records the render-pass-instance properties of the buffer's
    /// contents.
    pub fn record_render_pass_instance(
        &self,
        flags: RenderPassInstanceFlags,
    ) -> Result<(), RecordStateError> {
        let mut state = self.state.lock();

        if state.lifecycle != CommandBufferLifecycle::Recording {
            return Err(RecordStateError::NotRecording);
        }

        state.render_pass_instance = flags;

        Ok(())
    }

    /// Links a secondary command buffer executed from this primary buffer.
    ///
    /// The secondary remembers the primary it was last recorded into; a
    /// submission through a different primary is flagged unless the
    /// secondary allows simultaneous use.
    pub fn record_secondary(
        &self,
        secondary: &Arc<CommandBufferRecord>,
    ) -> Result<(), RecordStateError> {
        if self.level != CommandBufferLevel::Primary {
            return Err(RecordStateError::NotPrimary);
        }

        if secondary.level != CommandBufferLevel::Secondary {
            return Err(RecordStateError::NotSecondary);
        }

        let mut state = self.state.lock();

        if state.lifecycle != CommandBufferLifecycle::Recording {
            return Err(RecordStateError::NotRecording);
        }

        secondary.state.lock().bound_primary = Some(self.handle);
        state.secondaries.push(secondary.clone());

        Ok(())
    }

    /// Declares that an object bound into this buffer was created with
    /// concurrent sharing across the given queue families.
    pub fn declare_concurrent_sharing(&self, object: u64, queue_family_indices: &[u32]) {
        self.state.lock().concurrent_sharing.push(ConcurrentSharing {
            object,
            queue_family_indices: queue_family_indices.iter().copied().collect(),
        });
    }

    /// Checks every lifecycle rule for submitting this buffer to `queue`.
    ///
    /// `occurrences_in_call` is the number of times the buffer appears among
    /// the command buffers of the whole submission call, across all
    /// descriptors. Nothing is mutated; failures accumulate in `violations`.
    pub(crate) fn validate_submission(
        &self,
        queue: &QueueRecord,
        occurrences_in_call: u32,
        context: &str,
        violations: &mut Vec<Violation>,
    ) {
        let state = self.state.lock();
        let objects: SmallVec<[u64; 4]> = smallvec![self.handle.as_raw()];

        // The remaining rules inspect recorded contents, so a buffer that
        // is not executable ends its checks here.
        match state.lifecycle {
            CommandBufferLifecycle::Initial => {
                violations.push(Violation::new(
                    RuleId::NotRecorded,
                    objects,
                    format!("{}: is unrecorded and contains no commands", context),
                ));
                return;
            }
            CommandBufferLifecycle::Recording => {
                violations.push(Violation::new(
                    RuleId::StillRecording,
                    objects,
                    format!("{}: is still being recorded, recording was never ended", context),
                ));
                return;
            }
            CommandBufferLifecycle::InvalidIncomplete
            | CommandBufferLifecycle::InvalidComplete => {
                let mut objects = objects;
                let cause = match state.invalidated_by {
                    Some(cause) => {
                        objects.push(cause.object());
                        cause.describe()
                    }
                    None => "a referenced resource was invalidated",
                };
                violations.push(Violation::new(
                    RuleId::Invalidated,
                    objects,
                    format!("{}: is invalid because {}", context, cause),
                ));
                return;
            }
            CommandBufferLifecycle::Executable => {}
        }

        if state.usage.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            && state.submit_count + u64::from(occurrences_in_call) > 1
        {
            violations.push(Violation::new(
                RuleId::OneTimeSubmitViolation,
                objects.clone(),
                format!(
                    "{}: was recorded with one-time-submit usage but would be submitted \
                    {} times in total",
                    context,
                    state.submit_count + u64::from(occurrences_in_call),
                ),
            ));
        }

        if !state
            .usage
            .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
        {
            if state.pending_submits != 0 {
                violations.push(Violation::new(
                    RuleId::ConcurrentUseViolation,
                    objects.clone(),
                    format!(
                        "{}: is already executing on a queue and was not recorded with \
                        simultaneous use",
                        context,
                    ),
                ));
            } else if occurrences_in_call > 1 {
                violations.push(Violation::new(
                    RuleId::ConcurrentUseViolation,
                    objects.clone(),
                    format!(
                        "{}: appears {} times in this call and was not recorded with \
                        simultaneous use",
                        context, occurrences_in_call,
                    ),
                ));
            }
        }

        if self.queue_family_index != queue.queue_family_index() {
            violations.push(Violation::new(
                RuleId::QueueFamilyMismatch,
                objects.clone(),
                format!(
                    "{}: was allocated from a pool of queue family {} but is submitted to a \
                    queue of family {}",
                    context,
                    self.queue_family_index,
                    queue.queue_family_index(),
                ),
            ));
        }

        for sharing in &state.concurrent_sharing {
            if !sharing
                .queue_family_indices
                .contains(&queue.queue_family_index())
            {
                violations.push(Violation::new(
                    RuleId::ConcurrentSharingViolation,
                    smallvec![self.handle.as_raw(), sharing.object],
                    format!(
                        "{}: uses a concurrently shared object on queue family {}, which is \
                        absent from the object's declared family list",
                        context,
                        queue.queue_family_index(),
                    ),
                ));
            }
        }

        // A secondary's state is locked only after this record's guard is
        // released, so concurrent validations never hold two record locks
        // at once.
        let secondaries = state.secondaries.clone();
        drop(state);

        for secondary in &secondaries {
            let secondary_state = secondary.state.lock();
            let objects: SmallVec<[u64; 4]> =
                smallvec![self.handle.as_raw(), secondary.handle.as_raw()];

            if secondary_state.lifecycle != CommandBufferLifecycle::Executable {
                violations.push(Violation::new(
                    RuleId::SecondaryNotExecutable,
                    objects,
                    format!("{}: executes a secondary command buffer that is not executable", context),
                ));
                continue;
            }

            if !secondary_state
                .usage
                .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
                && secondary_state
                    .bound_primary
                    .is_some_and(|primary| primary != self.handle)
            {
                violations.push(Violation::new(
                    RuleId::SecondaryBoundElsewhere,
                    objects,
                    format!(
                        "{}: executes a secondary command buffer that was re-recorded into a \
                        different primary and does not allow simultaneous use",
                        context,
                    ),
                ));
            }
        }
    }

    /// Commits `count` submissions of this buffer into durable state.
    pub(crate) fn mark_submitted(&self, count: u32) {
        let mut state = self.state.lock();
        state.submit_count += u64::from(count);
        state.pending_submits += count;
    }

    /// Records completion of `count` previously committed submissions.
    pub(crate) fn retire_submission(&self, count: u32) {
        let mut state = self.state.lock();
        state.pending_submits = state.pending_submits.saturating_sub(count);
    }
}

/// Error that can happen when transitioning a command buffer's recording
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStateError {
    /// The buffer is already being recorded.
    AlreadyRecording,

    /// The operation requires the buffer to be in the recording state.
    NotRecording,

    /// The buffer is still executing on a queue.
    InFlight,

    /// The operation requires a primary command buffer.
    NotPrimary,

    /// The operation requires a secondary command buffer.
    NotSecondary,
}

impl Error for RecordStateError {}

impl Display for RecordStateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::AlreadyRecording => write!(f, "the command buffer is already being recorded"),
            Self::NotRecording => write!(f, "the command buffer is not in the recording state"),
            Self::InFlight => write!(f, "the command buffer is still executing on a queue"),
            Self::NotPrimary => {
                write!(f, "the command buffer is not a primary command buffer")
            }
            Self::NotSecondary => {
                write!(f, "the command buffer is not a secondary command buffer")
            }
        }
    }
}
