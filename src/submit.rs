//! Queue submission validation.
//!
//! A single submission call hands the driver an ordered sequence of
//! submission descriptors, each with semaphores to wait for, command
//! buffers to execute and semaphores to signal, plus an optional fence for
//! the whole batch. None of it has executed when the call must be judged,
//! so the [`Validator`] simulates the ordering effects of the entire call
//! against a private working copy of semaphore state, checks every
//! lifecycle and batch-structural rule, and accumulates all violations
//! rather than stopping at the first.
//!
//! Descriptor order within the call is treated as the authoritative
//! execution order for the simulation. The simulation never touches
//! durable state; [`Validator::commit`] applies the projections once the
//! real call has returned success, and [`Validator::retire`] unwinds the
//! in-flight effects when the driver reports the work complete.

use crate::{
    device::{DeviceProfile, QueueRecord},
    sync::semaphore::{SemaphorePayload, SemaphoreRecord, SemaphoreScope, SemaphoreType},
    tracker::Tracker,
    DiagnosticSink, RuleId, Violation,
};
use ash::vk::{self, Handle};
use foldhash::{HashMap, HashSet};
use smallvec::smallvec;
use std::sync::Arc;

/// Parameters for one submission descriptor within a queue submission
/// call.
#[derive(Clone, Debug)]
pub struct SubmitInfo {
    /// The semaphores to wait for before beginning execution of this
    /// descriptor's command buffers.
    ///
    /// The default value is empty.
    pub wait_semaphores: Vec<SemaphoreSubmitInfo>,

    /// The command buffers to execute, in order.
    ///
    /// The default value is empty.
    pub command_buffers: Vec<vk::CommandBuffer>,

    /// The semaphores to signal after execution of this descriptor's
    /// command buffers has completed.
    ///
    /// The default value is empty.
    pub signal_semaphores: Vec<SemaphoreSubmitInfo>,

    /// Device-group information accompanying this descriptor, if the
    /// device was created from a group of physical devices.
    ///
    /// The default value is `None`.
    pub device_group: Option<DeviceGroupSubmitInfo>,

    /// Whether this is a protected submission. A protected submission may
    /// only execute protected command buffers.
    ///
    /// The default value is `false`.
    pub protected: bool,

    pub _ne: crate::NonExhaustive,
}

impl Default for SubmitInfo {
    fn default() -> Self {
        SubmitInfo {
            wait_semaphores: Vec::new(),
            command_buffers: Vec::new(),
            signal_semaphores: Vec::new(),
            device_group: None,
            protected: false,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Parameters for a semaphore signal or wait operation in a submission
/// descriptor.
#[derive(Clone, Debug)]
pub struct SemaphoreSubmitInfo {
    /// The semaphore to signal or wait for.
    pub semaphore: vk::Semaphore,

    /// For a timeline semaphore, the counter value to wait for or signal.
    /// Ignored for binary semaphores.
    ///
    /// The default value is `0`.
    pub value: u64,

    pub _ne: crate::NonExhaustive,
}

impl SemaphoreSubmitInfo {
    /// Returns a `SemaphoreSubmitInfo` for the specified binary
    /// `semaphore`.
    #[inline]
    pub fn semaphore(semaphore: vk::Semaphore) -> Self {
        SemaphoreSubmitInfo {
            semaphore,
            value: 0,
            _ne: crate::NonExhaustive(()),
        }
    }

    /// Returns a `SemaphoreSubmitInfo` for the specified timeline
    /// `semaphore` and counter `value`.
    #[inline]
    pub fn with_value(semaphore: vk::Semaphore, value: u64) -> Self {
        SemaphoreSubmitInfo {
            semaphore,
            value,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Device-group parameters for one submission descriptor.
#[derive(Clone, Debug)]
pub struct DeviceGroupSubmitInfo {
    /// For each wait operation, the index of the physical device that
    /// executes it. Must match the descriptor's wait count.
    pub wait_semaphore_device_indices: Vec<u32>,

    /// For each command buffer, a mask of the physical devices that execute
    /// it. Must match the descriptor's command buffer count.
    pub command_buffer_device_masks: Vec<u32>,

    /// For each signal operation, the index of the physical device that
    /// executes it. Must match the descriptor's signal count.
    pub signal_semaphore_device_indices: Vec<u32>,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceGroupSubmitInfo {
    fn default() -> Self {
        DeviceGroupSubmitInfo {
            wait_semaphore_device_indices: Vec::new(),
            command_buffer_device_masks: Vec::new(),
            signal_semaphore_device_indices: Vec::new(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// The projected effects of one submission call, accumulated while the
/// call is validated and committed only if the driver accepts the work.
///
/// The simulation is private to its call. Concurrent validations on other
/// queues each build their own; only committed durable records are shared.
#[derive(Debug)]
pub struct SubmitSimulation {
    queue: vk::Queue,

    binary: HashMap<vk::Semaphore, BinaryProjection>,
    timeline: HashMap<vk::Semaphore, TimelineProjection>,

    /// Semaphores whose temporarily imported payload is consumed by a wait
    /// in this call, returning them to internal tracking.
    promoted: HashSet<vk::Semaphore>,

    /// How many times each command buffer is executed by this call.
    command_buffers: HashMap<vk::CommandBuffer, u32>,

    fence: Option<vk::Fence>,
}

#[derive(Debug)]
struct BinaryProjection {
    signaled: bool,
    signaled_by: Option<vk::Queue>,
    pending_wait: Option<vk::Queue>,
}

#[derive(Debug)]
struct TimelineProjection {
    /// The highest signal value known when the call began, completed or
    /// already pending.
    base_value: u64,

    /// Signal values this call adds.
    pending_signals: Vec<u64>,

    /// Wait values this call adds.
    pending_waits: Vec<u64>,
}

impl TimelineProjection {
    fn best_signal_value(&self) -> u64 {
        self.pending_signals
            .iter()
            .copied()
            .fold(self.base_value, u64::max)
    }
}

impl SubmitSimulation {
    fn new(queue: vk::Queue) -> Self {
        SubmitSimulation {
            queue,
            binary: HashMap::default(),
            timeline: HashMap::default(),
            promoted: HashSet::default(),
            command_buffers: HashMap::default(),
            fence: None,
        }
    }

    /// Returns the working copy for a binary semaphore, seeding it from the
    /// durable record on first touch.
    fn binary_entry(&mut self, record: &SemaphoreRecord) -> &mut BinaryProjection {
        self.binary.entry(record.handle()).or_insert_with(|| {
            match &record.state().payload {
                &SemaphorePayload::Binary {
                    signaled,
                    signaled_by,
                    pending_wait,
                } => BinaryProjection {
                    signaled,
                    signaled_by,
                    pending_wait,
                },
                // a record's payload kind is fixed at construction and the
                // caller dispatched on it
                SemaphorePayload::Timeline { .. } => {
                    unreachable!("binary semaphore record carries a timeline payload")
                }
            }
        })
    }

    fn timeline_entry(&mut self, record: &SemaphoreRecord) -> &mut TimelineProjection {
        self.timeline
            .entry(record.handle())
            .or_insert_with(|| TimelineProjection {
                base_value: record.state().payload.best_signal_value(),
                pending_signals: Vec::new(),
                pending_waits: Vec::new(),
            })
    }

    /// Validates one semaphore wait operation against the simulation.
    fn validate_wait(
        &mut self,
        record: &SemaphoreRecord,
        value: u64,
        profile: &DeviceProfile,
        context: &str,
        violations: &mut Vec<Violation>,
    ) {
        let queue = self.queue;

        match record.semaphore_type() {
            SemaphoreType::Binary => {
                let scope = if self.promoted.contains(&record.handle()) {
                    SemaphoreScope::Internal
                } else {
                    record.state().scope
                };

                match scope {
                    SemaphoreScope::ExternalPermanent => {
                        // The payload is owned externally; the signal that
                        // satisfies this wait may come from anywhere, so
                        // forward progress cannot be checked.
                        let entry = self.binary_entry(record);
                        entry.signaled = false;
                        entry.signaled_by = None;
                        entry.pending_wait = Some(queue);
                    }
                    SemaphoreScope::ExternalTemporary => {
                        // This wait consumes the temporary import; the
                        // semaphore is internal for the rest of the call.
                        self.promoted.insert(record.handle());
                        let entry = self.binary_entry(record);
                        entry.signaled = false;
                        entry.signaled_by = None;
                        entry.pending_wait = Some(queue);
                    }
                    SemaphoreScope::Internal => {
                        let entry = self.binary_entry(record);

                        if entry.pending_wait.is_some_and(|waiter| waiter != queue) {
                            violations.push(Violation::new(
                                RuleId::OtherQueueWaiting,
                                smallvec![record.handle().as_raw()],
                                format!(
                                    "{}: another queue already holds an unconsumed wait on \
                                    this semaphore",
                                    context,
                                ),
                            ));
                        } else if !entry.signaled {
                            violations.push(Violation::new(
                                RuleId::CannotBeSignalled,
                                smallvec![record.handle().as_raw()],
                                format!(
                                    "{}: has no pending or completed signal operation, the \
                                    wait can never be satisfied",
                                    context,
                                ),
                            ));
                        } else {
                            entry.signaled = false;
                            entry.signaled_by = None;
                            entry.pending_wait = Some(queue);
                        }
                    }
                }
            }
            SemaphoreType::Timeline => {
                let max_diff = profile.max_timeline_semaphore_value_difference;
                let entry = self.timeline_entry(record);
                let best = entry.best_signal_value();

                if value > best && value - best > max_diff {
                    violations.push(Violation::new(
                        RuleId::MaxDiffExceeded,
                        smallvec![record.handle().as_raw()],
                        format!(
                            "{}: waits for value {}, which is more than {} ahead of the last \
                            known value {}",
                            context, value, max_diff, best,
                        ),
                    ));
                } else {
                    entry.pending_waits.push(value);
                }
            }
        }
    }

    /// Validates one semaphore signal operation against the simulation.
    fn validate_signal(
        &mut self,
        record: &SemaphoreRecord,
        value: u64,
        profile: &DeviceProfile,
        context: &str,
        violations: &mut Vec<Violation>,
    ) {
        let queue = self.queue;

        match record.semaphore_type() {
            SemaphoreType::Binary => {
                let scope = if self.promoted.contains(&record.handle()) {
                    SemaphoreScope::Internal
                } else {
                    record.state().scope
                };
                let entry = self.binary_entry(record);

                if scope != SemaphoreScope::ExternalPermanent && entry.signaled {
                    violations.push(Violation::new(
                        RuleId::QueueForwardProgress,
                        smallvec![record.handle().as_raw()],
                        format!(
                            "{}: is already signaled and the signal has not been consumed by \
                            a wait; queue forward progress cannot be guaranteed",
                            context,
                        ),
                    ));
                } else {
                    entry.signaled = true;
                    entry.signaled_by = Some(queue);
                }
            }
            SemaphoreType::Timeline => {
                let max_diff = profile.max_timeline_semaphore_value_difference;
                let entry = self.timeline_entry(record);
                let best = entry.best_signal_value();

                if value <= best {
                    violations.push(Violation::new(
                        RuleId::NonIncreasingValue,
                        smallvec![record.handle().as_raw()],
                        format!(
                            "{}: signals value {}, which is not strictly greater than the \
                            highest known signal value {}",
                            context, value, best,
                        ),
                    ));
                } else if value - best > max_diff {
                    violations.push(Violation::new(
                        RuleId::MaxDiffExceeded,
                        smallvec![record.handle().as_raw()],
                        format!(
                            "{}: signals value {}, which is more than {} ahead of the last \
                            known value {}",
                            context, value, max_diff, best,
                        ),
                    ));
                } else {
                    entry.pending_signals.push(value);
                }
            }
        }
    }

    /// Checks, once the whole call has been simulated, that no timeline
    /// wait depends on a signal of the same call that cannot be ordered
    /// before it.
    fn cross_validate(&self, violations: &mut Vec<Violation>) {
        for (handle, entry) in &self.timeline {
            if entry.pending_signals.is_empty() {
                continue;
            }

            for &wait in &entry.pending_waits {
                // A wait satisfiable by state known before this call does
                // not depend on this call's signals.
                if wait <= entry.base_value {
                    continue;
                }

                if let Some(&signal) = entry
                    .pending_signals
                    .iter()
                    .find(|&&signal| wait >= signal)
                {
                    violations.push(Violation::new(
                        RuleId::WaitValueNotLessThanSignal,
                        smallvec![handle.as_raw()],
                        format!(
                            "this call waits for value {} and signals value {} on the same \
                            semaphore; execution order within one call cannot guarantee the \
                            signal happens first",
                            wait, signal,
                        ),
                    ));
                }
            }
        }
    }
}

/// The outcome of validating one queue submission call.
#[derive(Debug)]
pub struct SubmitValidation {
    rejected: bool,
    violations: Vec<Violation>,
    simulation: SubmitSimulation,
}

impl SubmitValidation {
    /// Whether the call violates the usage contract.
    ///
    /// This result is advisory: the surrounding dispatch layer decides
    /// whether to forward the call regardless.
    #[inline]
    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Every violation detected in the call, in rule evaluation order.
    #[inline]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

/// Validates queue submission calls against tracked object state.
#[derive(Debug, Default)]
pub struct Validator {
    profile: DeviceProfile,
    tracker: Tracker,
}

impl Validator {
    pub fn new(profile: DeviceProfile) -> Self {
        Validator {
            profile,
            tracker: Tracker::new(),
        }
    }

    #[inline]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    #[inline]
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Validates one submission call on `queue` before it reaches the
    /// driver.
    ///
    /// Every rule is evaluated and every violation is reported to `sink`;
    /// there is no early termination, except that checks depending on a
    /// missing or non-executable object are skipped. Durable state is not
    /// touched: pass the returned [`SubmitValidation`] to
    /// [`commit`](Self::commit) once the real call has returned success.
    pub fn validate_queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo],
        fence: Option<vk::Fence>,
        sink: &dyn DiagnosticSink,
    ) -> SubmitValidation {
        let mut violations = Vec::new();
        let mut simulation = SubmitSimulation::new(queue);

        let Some(queue_record) = self.tracker.queue(queue) else {
            // An untracked queue leaves nothing to validate against.
            return SubmitValidation {
                rejected: false,
                violations,
                simulation,
            };
        };

        // Duplicate detection is call-wide, across all descriptors.
        let mut occurrences: HashMap<vk::CommandBuffer, u32> = HashMap::default();

        for submit in submits {
            for &command_buffer in &submit.command_buffers {
                *occurrences.entry(command_buffer).or_default() += 1;
            }
        }

        for (index, submit) in submits.iter().enumerate() {
            self.validate_submit_info(
                &queue_record,
                index,
                submit,
                &occurrences,
                &mut simulation,
                &mut violations,
            );
        }

        simulation.cross_validate(&mut violations);

        if let Some(fence) = fence {
            if let Some(record) = self.tracker.fence(fence) {
                record.validate_submission("fence", &mut violations);
                simulation.fence = Some(fence);
            }
        }

        for violation in &violations {
            sink.report(violation);
        }

        SubmitValidation {
            rejected: !violations.is_empty(),
            violations,
            simulation,
        }
    }

    fn validate_submit_info(
        &self,
        queue: &Arc<QueueRecord>,
        index: usize,
        submit: &SubmitInfo,
        occurrences: &HashMap<vk::CommandBuffer, u32>,
        simulation: &mut SubmitSimulation,
        violations: &mut Vec<Violation>,
    ) {
        if submit.protected
            && self
                .profile
                .queue_family_properties
                .get(queue.queue_family_index() as usize)
                .is_some_and(|family| !family.queue_flags.contains(vk::QueueFlags::PROTECTED))
        {
            violations.push(Violation::new(
                RuleId::ProtectedQueueRequired,
                smallvec![queue.handle().as_raw()],
                format!(
                    "submits[{}]: is a protected submission, but queue family {} does not \
                    support protected memory",
                    index,
                    queue.queue_family_index(),
                ),
            ));
        }

        for (wait_index, wait) in submit.wait_semaphores.iter().enumerate() {
            let Some(record) = self.tracker.semaphore(wait.semaphore) else {
                continue;
            };

            simulation.validate_wait(
                &record,
                wait.value,
                &self.profile,
                &format!("submits[{}].wait_semaphores[{}]", index, wait_index),
                violations,
            );
        }

        let mut suspended = false;
        let mut last_suspend = None;

        for (buffer_index, &handle) in submit.command_buffers.iter().enumerate() {
            let context = format!("submits[{}].command_buffers[{}]", index, buffer_index);

            let Some(record) = self.tracker.command_buffer(handle) else {
                continue;
            };

            record.validate_submission(queue, occurrences[&handle], &context, violations);

            // The protected flag must agree in both directions.
            if submit.protected && !record.is_protected() {
                violations.push(Violation::new(
                    RuleId::UnprotectedInProtectedBatch,
                    smallvec![handle.as_raw()],
                    format!(
                        "{}: is unprotected but was submitted in a protected submission",
                        context,
                    ),
                ));
            } else if !submit.protected && record.is_protected() {
                violations.push(Violation::new(
                    RuleId::ProtectedInUnprotectedBatch,
                    smallvec![handle.as_raw()],
                    format!(
                        "{}: is protected but was submitted in an unprotected submission",
                        context,
                    ),
                ));
            }

            let instance = record.render_pass_instance();

            if suspended && instance.has_instance && !instance.resumes {
                violations.push(Violation::new(
                    RuleId::UnresumedSuspension,
                    smallvec![handle.as_raw()],
                    format!(
                        "{}: contains a render pass instance while an earlier instance is \
                        suspended, but does not resume it",
                        context,
                    ),
                ));
            }

            if instance.resumes {
                if !suspended {
                    violations.push(Violation::new(
                        RuleId::ResumeWithoutSuspension,
                        smallvec![handle.as_raw()],
                        format!(
                            "{}: resumes a render pass instance, but no instance is suspended",
                            context,
                        ),
                    ));
                }

                suspended = false;
                last_suspend = None;
            }

            if instance.suspends {
                suspended = true;
                last_suspend = Some(handle);
            }

            *simulation.command_buffers.entry(handle).or_default() += 1;
        }

        if suspended {
            let objects = match last_suspend {
                Some(handle) => smallvec![handle.as_raw()],
                None => smallvec![],
            };
            violations.push(Violation::new(
                RuleId::DanglingSuspension,
                objects,
                format!(
                    "submits[{}]: a render pass instance is still suspended after the last \
                    command buffer of the submission",
                    index,
                ),
            ));
        }

        if let Some(device_group) = &submit.device_group {
            self.validate_device_group(index, submit, device_group, violations);
        }

        for (signal_index, signal) in submit.signal_semaphores.iter().enumerate() {
            let Some(record) = self.tracker.semaphore(signal.semaphore) else {
                continue;
            };

            simulation.validate_signal(
                &record,
                signal.value,
                &self.profile,
                &format!("submits[{}].signal_semaphores[{}]", index, signal_index),
                violations,
            );
        }
    }

    fn validate_device_group(
        &self,
        index: usize,
        submit: &SubmitInfo,
        device_group: &DeviceGroupSubmitInfo,
        violations: &mut Vec<Violation>,
    ) {
        let device_count = self.profile.physical_device_count;
        let valid_mask = if device_count >= u32::BITS {
            u32::MAX
        } else {
            (1 << device_count) - 1
        };

        if device_group.wait_semaphore_device_indices.len() != submit.wait_semaphores.len() {
            violations.push(Violation::new(
                RuleId::MaskCountMismatch,
                smallvec![],
                format!(
                    "submits[{}].device_group: has {} wait device indices but the submission \
                    has {} wait semaphores",
                    index,
                    device_group.wait_semaphore_device_indices.len(),
                    submit.wait_semaphores.len(),
                ),
            ));
        }

        if device_group.command_buffer_device_masks.len() != submit.command_buffers.len() {
            violations.push(Violation::new(
                RuleId::MaskCountMismatch,
                smallvec![],
                format!(
                    "submits[{}].device_group: has {} command buffer device masks but the \
                    submission has {} command buffers",
                    index,
                    device_group.command_buffer_device_masks.len(),
                    submit.command_buffers.len(),
                ),
            ));
        }

        if device_group.signal_semaphore_device_indices.len() != submit.signal_semaphores.len() {
            violations.push(Violation::new(
                RuleId::MaskCountMismatch,
                smallvec![],
                format!(
                    "submits[{}].device_group: has {} signal device indices but the \
                    submission has {} signal semaphores",
                    index,
                    device_group.signal_semaphore_device_indices.len(),
                    submit.signal_semaphores.len(),
                ),
            ));
        }

        for (mask_index, &mask) in device_group.command_buffer_device_masks.iter().enumerate() {
            if mask & !valid_mask != 0 {
                violations.push(Violation::new(
                    RuleId::MaskOutOfRange,
                    smallvec![],
                    format!(
                        "submits[{}].device_group.command_buffer_device_masks[{}]: mask {:#b} \
                        addresses physical devices beyond the device count {}",
                        index, mask_index, mask, device_count,
                    ),
                ));
            }
        }

        for (device_indices, name) in [
            (&device_group.wait_semaphore_device_indices, "wait"),
            (&device_group.signal_semaphore_device_indices, "signal"),
        ] {
            for (device_index_index, &device_index) in device_indices.iter().enumerate() {
                if device_index >= device_count {
                    violations.push(Violation::new(
                        RuleId::MaskOutOfRange,
                        smallvec![],
                        format!(
                            "submits[{}].device_group.{}_semaphore_device_indices[{}]: device \
                            index {} is not below the device count {}",
                            index, name, device_index_index, device_index, device_count,
                        ),
                    ));
                }
            }
        }
    }

    /// Commits the projections of a validated call into durable state.
    ///
    /// Call this only after the real driver call has returned success; if
    /// the real call failed, drop the [`SubmitValidation`] instead and no
    /// durable state changes.
    pub fn commit(&self, validation: &SubmitValidation) {
        let simulation = &validation.simulation;

        for (&handle, &count) in &simulation.command_buffers {
            if let Some(record) = self.tracker.command_buffer(handle) {
                record.mark_submitted(count);
            }
        }

        for (&handle, projection) in &simulation.binary {
            if let Some(record) = self.tracker.semaphore(handle) {
                let mut state = record.state();

                if simulation.promoted.contains(&handle) {
                    state.scope = SemaphoreScope::Internal;
                }

                if let SemaphorePayload::Binary {
                    signaled,
                    signaled_by,
                    pending_wait,
                } = &mut state.payload
                {
                    *signaled = projection.signaled;
                    *signaled_by = projection.signaled_by;
                    *pending_wait = projection.pending_wait;
                }
            }
        }

        for (&handle, projection) in &simulation.timeline {
            if let Some(record) = self.tracker.semaphore(handle) {
                if let SemaphorePayload::Timeline {
                    pending_signals,
                    pending_waits,
                    ..
                } = &mut record.state().payload
                {
                    pending_signals.extend(&projection.pending_signals);
                    pending_waits.extend(&projection.pending_waits);
                }
            }
        }

        if let Some(handle) = simulation.fence {
            if let Some(record) = self.tracker.fence(handle) {
                record.mark_inflight();
            }
        }
    }

    /// Records that the driver finished executing a previously committed
    /// call, unwinding its in-flight effects.
    pub fn retire(&self, validation: &SubmitValidation) {
        let simulation = &validation.simulation;

        for (&handle, &count) in &simulation.command_buffers {
            if let Some(record) = self.tracker.command_buffer(handle) {
                record.retire_submission(count);
            }
        }

        for &handle in simulation.binary.keys() {
            if let Some(record) = self.tracker.semaphore(handle) {
                if let SemaphorePayload::Binary { pending_wait, .. } =
                    &mut record.state().payload
                {
                    if *pending_wait == Some(simulation.queue) {
                        *pending_wait = None;
                    }
                }
            }
        }

        for (&handle, projection) in &simulation.timeline {
            if let Some(record) = self.tracker.semaphore(handle) {
                if let SemaphorePayload::Timeline {
                    completed_value,
                    pending_signals,
                    pending_waits,
                } = &mut record.state().payload
                {
                    for &value in &projection.pending_signals {
                        if let Some(position) =
                            pending_signals.iter().position(|&pending| pending == value)
                        {
                            pending_signals.swap_remove(position);
                        }

                        *completed_value = (*completed_value).max(value);
                    }

                    for &value in &projection.pending_waits {
                        if let Some(position) =
                            pending_waits.iter().position(|&pending| pending == value)
                        {
                            pending_waits.swap_remove(position);
                        }
                    }
                }
            }
        }

        if let Some(handle) = simulation.fence {
            if let Some(record) = self.tracker.fence(handle) {
                record.retire();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_buffer::{CommandBufferLevel, CommandBufferRecord, RenderPassInstanceFlags},
        device::QueueRecord,
        CollectingSink,
    };

    fn validator() -> Validator {
        let validator = Validator::new(DeviceProfile::default());
        validator
            .tracker()
            .register_queue(QueueRecord::new(vk::Queue::from_raw(90), 0));
        validator
    }

    fn protected_validator() -> Validator {
        let mut profile = DeviceProfile::default();
        profile.queue_family_properties[0].queue_flags |= vk::QueueFlags::PROTECTED;

        let validator = Validator::new(profile);
        validator
            .tracker()
            .register_queue(QueueRecord::new(vk::Queue::from_raw(90), 0));
        validator
    }

    fn executable_command_buffer(validator: &Validator, raw: u64) -> vk::CommandBuffer {
        let record = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(raw),
                CommandBufferLevel::Primary,
                0,
                false,
            ),
        );
        record.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        record.end().unwrap();
        record.handle()
    }

    fn rules(validation: &SubmitValidation) -> Vec<RuleId> {
        validation
            .violations()
            .iter()
            .map(|violation| violation.rule)
            .collect()
    }

    #[test]
    fn empty_call_passes() {
        let validator = validator();
        let sink = CollectingSink::new();

        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo::default()],
            None,
            &sink,
        );

        assert!(!validation.is_rejected());
        assert!(sink.is_empty());
    }

    #[test]
    fn untracked_queue_is_skipped() {
        let validator = validator();
        let sink = CollectingSink::new();

        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(91),
            &[SubmitInfo::default()],
            None,
            &sink,
        );

        assert!(!validation.is_rejected());
    }

    #[test]
    fn untracked_objects_are_skipped() {
        let validator = validator();
        let sink = CollectingSink::new();

        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                wait_semaphores: vec![SemaphoreSubmitInfo::semaphore(vk::Semaphore::from_raw(7))],
                command_buffers: vec![vk::CommandBuffer::from_raw(7)],
                signal_semaphores: vec![SemaphoreSubmitInfo::semaphore(
                    vk::Semaphore::from_raw(8),
                )],
                ..Default::default()
            }],
            Some(vk::Fence::from_raw(7)),
            &sink,
        );

        assert!(!validation.is_rejected());
    }

    #[test]
    fn binary_signal_then_wait_within_one_call() {
        let validator = validator();
        validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_binary(vk::Semaphore::from_raw(1)));
        let sink = CollectingSink::new();

        // The first descriptor signals, the second waits; descriptor order
        // guarantees the signal is available.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[
                SubmitInfo {
                    signal_semaphores: vec![SemaphoreSubmitInfo::semaphore(
                        vk::Semaphore::from_raw(1),
                    )],
                    ..Default::default()
                },
                SubmitInfo {
                    wait_semaphores: vec![SemaphoreSubmitInfo::semaphore(
                        vk::Semaphore::from_raw(1),
                    )],
                    ..Default::default()
                },
            ],
            None,
            &sink,
        );

        assert!(!validation.is_rejected());
    }

    #[test]
    fn binary_alternation_is_enforced() {
        let validator = validator();
        validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_binary(vk::Semaphore::from_raw(1)));
        let sink = CollectingSink::new();

        let signal = SubmitInfo {
            signal_semaphores: vec![SemaphoreSubmitInfo::semaphore(vk::Semaphore::from_raw(1))],
            ..Default::default()
        };
        let wait = SubmitInfo {
            wait_semaphores: vec![SemaphoreSubmitInfo::semaphore(vk::Semaphore::from_raw(1))],
            ..Default::default()
        };

        // Alternating signal/wait pairs pass regardless of length.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[signal.clone(), wait.clone(), signal.clone(), wait.clone()],
            None,
            &sink,
        );
        assert!(!validation.is_rejected());

        // Two signals back to back fail forward progress.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[signal.clone(), signal.clone()],
            None,
            &sink,
        );
        assert_eq!(rules(&validation), vec![RuleId::QueueForwardProgress]);

        // Two waits back to back fail because the second has no signal.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[signal, wait.clone(), wait],
            None,
            &sink,
        );
        assert_eq!(rules(&validation), vec![RuleId::CannotBeSignalled]);
    }

    #[test]
    fn externally_owned_binary_wait_is_not_checked() {
        let validator = validator();
        let semaphore = validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_binary(vk::Semaphore::from_raw(1)));
        semaphore.import(false);
        let sink = CollectingSink::new();

        // No signal exists, but the payload is externally owned.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                wait_semaphores: vec![SemaphoreSubmitInfo::semaphore(vk::Semaphore::from_raw(1))],
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert!(!validation.is_rejected());
    }

    #[test]
    fn temporary_import_is_consumed_by_wait() {
        let validator = validator();
        let semaphore = validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_binary(vk::Semaphore::from_raw(1)));
        semaphore.import(true);
        let sink = CollectingSink::new();

        // The first wait consumes the import without checks; the second
        // wait sees an internal, unsignaled semaphore.
        let wait = SubmitInfo {
            wait_semaphores: vec![SemaphoreSubmitInfo::semaphore(vk::Semaphore::from_raw(1))],
            ..Default::default()
        };
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[wait.clone(), wait],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::CannotBeSignalled]);

        // Committing the call makes the promotion durable.
        validator.commit(&validation);
        assert_eq!(semaphore.scope(), crate::sync::semaphore::SemaphoreScope::Internal);
    }

    #[test]
    fn suspend_resume_balance() {
        let validator = validator();
        let suspending = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(1),
                CommandBufferLevel::Primary,
                0,
                false,
            ),
        );
        suspending
            .begin(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
            .unwrap();
        suspending
            .record_render_pass_instance(RenderPassInstanceFlags {
                has_instance: true,
                suspends: true,
                resumes: false,
            })
            .unwrap();
        suspending.end().unwrap();

        let resuming = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(2),
                CommandBufferLevel::Primary,
                0,
                false,
            ),
        );
        resuming
            .begin(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
            .unwrap();
        resuming
            .record_render_pass_instance(RenderPassInstanceFlags {
                has_instance: true,
                suspends: false,
                resumes: true,
            })
            .unwrap();
        resuming.end().unwrap();

        let sink = CollectingSink::new();

        // Balanced suspend/resume passes.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![suspending.handle(), resuming.handle()],
                ..Default::default()
            }],
            None,
            &sink,
        );
        assert!(!validation.is_rejected());

        // A suspension left open at the end of the descriptor fails.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![suspending.handle()],
                ..Default::default()
            }],
            None,
            &sink,
        );
        assert_eq!(rules(&validation), vec![RuleId::DanglingSuspension]);

        // Resuming without a suspension fails.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![resuming.handle()],
                ..Default::default()
            }],
            None,
            &sink,
        );
        assert_eq!(rules(&validation), vec![RuleId::ResumeWithoutSuspension]);
    }

    #[test]
    fn suspension_does_not_span_descriptors() {
        let validator = validator();
        let suspending = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(1),
                CommandBufferLevel::Primary,
                0,
                false,
            ),
        );
        suspending
            .begin(vk::CommandBufferUsageFlags::empty())
            .unwrap();
        suspending
            .record_render_pass_instance(RenderPassInstanceFlags {
                has_instance: true,
                suspends: true,
                resumes: false,
            })
            .unwrap();
        suspending.end().unwrap();

        let resuming = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(2),
                CommandBufferLevel::Primary,
                0,
                false,
            ),
        );
        resuming
            .begin(vk::CommandBufferUsageFlags::empty())
            .unwrap();
        resuming
            .record_render_pass_instance(RenderPassInstanceFlags {
                has_instance: true,
                suspends: false,
                resumes: true,
            })
            .unwrap();
        resuming.end().unwrap();

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[
                SubmitInfo {
                    command_buffers: vec![suspending.handle()],
                    ..Default::default()
                },
                SubmitInfo {
                    command_buffers: vec![resuming.handle()],
                    ..Default::default()
                },
            ],
            None,
            &sink,
        );

        assert_eq!(
            rules(&validation),
            vec![RuleId::DanglingSuspension, RuleId::ResumeWithoutSuspension],
        );
    }

    fn protected_command_buffer(validator: &Validator, raw: u64) -> vk::CommandBuffer {
        let record = validator.tracker().register_command_buffer(
            CommandBufferRecord::new(
                vk::CommandBuffer::from_raw(raw),
                CommandBufferLevel::Primary,
                0,
                true,
            ),
        );
        record.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        record.end().unwrap();
        record.handle()
    }

    #[test]
    fn protected_batch_requires_protected_buffers() {
        let validator = protected_validator();
        let unprotected = executable_command_buffer(&validator, 1);
        let protected = protected_command_buffer(&validator, 2);

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![protected, unprotected],
                protected: true,
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::UnprotectedInProtectedBatch]);
        assert_eq!(
            validation.violations()[0].objects[0],
            unprotected.as_raw(),
        );
    }

    #[test]
    fn unprotected_batch_rejects_protected_buffers() {
        let validator = protected_validator();
        let unprotected = executable_command_buffer(&validator, 1);
        let protected = protected_command_buffer(&validator, 2);

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![unprotected, protected],
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::ProtectedInUnprotectedBatch]);
        assert_eq!(validation.violations()[0].objects[0], protected.as_raw());
    }

    #[test]
    fn protected_submission_requires_capable_queue_family() {
        // The default profile's only queue family lacks protected memory
        // support.
        let validator = validator();
        let protected = protected_command_buffer(&validator, 1);

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![protected],
                protected: true,
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::ProtectedQueueRequired]);
    }

    #[test]
    fn device_group_count_mismatch() {
        let validator = validator();
        let command_buffer = executable_command_buffer(&validator, 1);

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![command_buffer],
                device_group: Some(DeviceGroupSubmitInfo {
                    command_buffer_device_masks: vec![0b1, 0b1],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::MaskCountMismatch]);
    }

    #[test]
    fn device_group_mask_out_of_range() {
        let validator = validator();
        let command_buffer = executable_command_buffer(&validator, 1);

        let sink = CollectingSink::new();

        // The default profile has a single physical device, so only bit 0
        // may be set.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                command_buffers: vec![command_buffer],
                device_group: Some(DeviceGroupSubmitInfo {
                    command_buffer_device_masks: vec![0b10],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::MaskOutOfRange]);
    }

    #[test]
    fn device_group_device_index_out_of_range() {
        let validator = validator();
        validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_binary(vk::Semaphore::from_raw(1)));

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                signal_semaphores: vec![SemaphoreSubmitInfo::semaphore(
                    vk::Semaphore::from_raw(1),
                )],
                device_group: Some(DeviceGroupSubmitInfo {
                    signal_semaphore_device_indices: vec![1],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::MaskOutOfRange]);
    }

    #[test]
    fn timeline_wait_and_signal_in_one_call_must_be_ordered() {
        let validator = validator();
        validator
            .tracker()
            .register_semaphore(SemaphoreRecord::new_timeline(vk::Semaphore::from_raw(1), 0));

        let sink = CollectingSink::new();
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                wait_semaphores: vec![SemaphoreSubmitInfo::with_value(
                    vk::Semaphore::from_raw(1),
                    10,
                )],
                signal_semaphores: vec![SemaphoreSubmitInfo::with_value(
                    vk::Semaphore::from_raw(1),
                    10,
                )],
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert_eq!(rules(&validation), vec![RuleId::WaitValueNotLessThanSignal]);

        // A wait strictly below the signaled value is fine.
        let validation = validator.validate_queue_submit(
            vk::Queue::from_raw(90),
            &[SubmitInfo {
                wait_semaphores: vec![SemaphoreSubmitInfo::with_value(
                    vk::Semaphore::from_raw(1),
                    5,
                )],
                signal_semaphores: vec![SemaphoreSubmitInfo::with_value(
                    vk::Semaphore::from_raw(1),
                    10,
                )],
                ..Default::default()
            }],
            None,
            &sink,
        );

        assert!(!validation.is_rejected());
    }
}
