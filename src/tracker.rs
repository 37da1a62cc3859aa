//! The object state store.
//!
//! The tracker keeps one reference-counted record per live object, shared
//! safely across the application threads that concurrently enter the
//! validator. Lookups take the store lock for the duration of the read;
//! per-record mutable state sits behind each record's own mutex, so a
//! validation in progress on one queue never blocks record lookups for
//! another.

use crate::{
    command_buffer::CommandBufferRecord,
    device::QueueRecord,
    sync::{fence::FenceRecord, semaphore::SemaphoreRecord},
};
use ash::vk;
use foldhash::HashMap;
use parking_lot::RwLock;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

/// Reference-counted records for every tracked object, keyed by handle.
#[derive(Debug, Default)]
pub struct Tracker {
    inner: RwLock<TrackerMaps>,
}

#[derive(Debug, Default)]
struct TrackerMaps {
    command_buffers: HashMap<vk::CommandBuffer, Arc<CommandBufferRecord>>,
    semaphores: HashMap<vk::Semaphore, Arc<SemaphoreRecord>>,
    fences: HashMap<vk::Fence, Arc<FenceRecord>>,
    queues: HashMap<vk::Queue, Arc<QueueRecord>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command_buffer(
        &self,
        record: CommandBufferRecord,
    ) -> Arc<CommandBufferRecord> {
        let record = Arc::new(record);
        self.inner
            .write()
            .command_buffers
            .insert(record.handle(), record.clone());
        record
    }

    pub fn register_semaphore(&self, record: SemaphoreRecord) -> Arc<SemaphoreRecord> {
        let record = Arc::new(record);
        self.inner
            .write()
            .semaphores
            .insert(record.handle(), record.clone());
        record
    }

    pub fn register_fence(&self, record: FenceRecord) -> Arc<FenceRecord> {
        let record = Arc::new(record);
        self.inner
            .write()
            .fences
            .insert(record.handle(), record.clone());
        record
    }

    pub fn register_queue(&self, record: QueueRecord) -> Arc<QueueRecord> {
        let record = Arc::new(record);
        self.inner
            .write()
            .queues
            .insert(record.handle(), record.clone());
        record
    }

    /// Returns the record for the given command buffer, if it is tracked.
    pub fn command_buffer(&self, handle: vk::CommandBuffer) -> Option<Arc<CommandBufferRecord>> {
        self.inner.read().command_buffers.get(&handle).cloned()
    }

    pub fn semaphore(&self, handle: vk::Semaphore) -> Option<Arc<SemaphoreRecord>> {
        self.inner.read().semaphores.get(&handle).cloned()
    }

    pub fn fence(&self, handle: vk::Fence) -> Option<Arc<FenceRecord>> {
        self.inner.read().fences.get(&handle).cloned()
    }

    pub fn queue(&self, handle: vk::Queue) -> Option<Arc<QueueRecord>> {
        self.inner.read().queues.get(&handle).cloned()
    }

    /// Removes the record for a freed command buffer.
    ///
    /// Freeing is rejected while the buffer is still executing on a queue;
    /// the record stays tracked so later submissions of the dangling handle
    /// keep being validated against it.
    pub fn free_command_buffer(&self, handle: vk::CommandBuffer) -> Result<(), FreeError> {
        let mut maps = self.inner.write();

        let Some(record) = maps.command_buffers.get(&handle) else {
            return Err(FreeError::UnknownHandle);
        };

        if record.is_in_flight() {
            return Err(FreeError::InFlight);
        }

        maps.command_buffers.remove(&handle);

        Ok(())
    }

    /// Removes the records of every command buffer allocated from the given
    /// queue family's pools. Used when a pool is destroyed wholesale.
    pub fn free_pool_command_buffers(&self, queue_family_index: u32) -> Result<(), FreeError> {
        let mut maps = self.inner.write();

        if maps
            .command_buffers
            .values()
            .any(|record| record.queue_family_index() == queue_family_index && record.is_in_flight())
        {
            return Err(FreeError::InFlight);
        }

        maps.command_buffers
            .retain(|_, record| record.queue_family_index() != queue_family_index);

        Ok(())
    }
}

/// Error that can happen when freeing a tracked command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeError {
    /// The handle does not correspond to a tracked object.
    UnknownHandle,

    /// The object is still executing on a queue.
    InFlight,
}

impl Error for FreeError {}

impl Display for FreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::UnknownHandle => write!(f, "the handle does not correspond to a tracked object"),
            Self::InFlight => write!(f, "the object is still executing on a queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_buffer::CommandBufferLevel;
    use ash::vk::Handle;

    fn command_buffer(raw: u64) -> CommandBufferRecord {
        CommandBufferRecord::new(
            vk::CommandBuffer::from_raw(raw),
            CommandBufferLevel::Primary,
            0,
            false,
        )
    }

    #[test]
    fn lookup_after_register() {
        let tracker = Tracker::new();
        let record = tracker.register_command_buffer(command_buffer(1));

        let found = tracker
            .command_buffer(vk::CommandBuffer::from_raw(1))
            .unwrap();
        assert!(Arc::ptr_eq(&record, &found));
        assert!(tracker
            .command_buffer(vk::CommandBuffer::from_raw(2))
            .is_none());
    }

    #[test]
    fn free_unknown_handle() {
        let tracker = Tracker::new();

        assert_eq!(
            tracker.free_command_buffer(vk::CommandBuffer::from_raw(1)),
            Err(FreeError::UnknownHandle),
        );
    }

    #[test]
    fn free_in_flight_rejected() {
        let tracker = Tracker::new();
        let record = tracker.register_command_buffer(command_buffer(1));

        record.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        record.end().unwrap();
        record.mark_submitted(1);

        assert_eq!(
            tracker.free_command_buffer(record.handle()),
            Err(FreeError::InFlight),
        );

        record.retire_submission(1);
        tracker.free_command_buffer(record.handle()).unwrap();
        assert!(tracker.command_buffer(record.handle()).is_none());
    }

    #[test]
    fn free_pool_removes_only_its_family() {
        let tracker = Tracker::new();
        tracker.register_command_buffer(command_buffer(1));
        tracker.register_command_buffer(command_buffer(2));
        tracker.register_command_buffer(CommandBufferRecord::new(
            vk::CommandBuffer::from_raw(3),
            CommandBufferLevel::Primary,
            1,
            false,
        ));

        tracker.free_pool_command_buffers(0).unwrap();

        assert!(tracker.command_buffer(vk::CommandBuffer::from_raw(1)).is_none());
        assert!(tracker.command_buffer(vk::CommandBuffer::from_raw(2)).is_none());
        assert!(tracker.command_buffer(vk::CommandBuffer::from_raw(3)).is_some());
    }
}
