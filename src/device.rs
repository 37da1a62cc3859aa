//! Device-level information consumed during validation.
//!
//! The validator never talks to a device itself; it is handed the few limits
//! and queue-family properties that submission rules depend on.

use ash::vk;

/// The device limits and capabilities that submission validation consults.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    /// The number of physical devices in the device group this device was
    /// created from. Device masks in a submission may only address these.
    pub physical_device_count: u32,

    /// The `maxTimelineSemaphoreValueDifference` limit: how far ahead of the
    /// last known value a timeline wait or signal may reach.
    pub max_timeline_semaphore_value_difference: u64,

    /// Properties of each queue family, indexed by family index.
    pub queue_family_properties: Vec<QueueFamilyProperties>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            physical_device_count: 1,
            // The minimum value the API requires an implementation to support.
            max_timeline_semaphore_value_difference: 0x7fff_ffff,
            queue_family_properties: vec![QueueFamilyProperties::default()],
        }
    }
}

/// Properties of one queue family.
#[derive(Clone, Debug)]
pub struct QueueFamilyProperties {
    /// Attributes of the queue family.
    pub queue_flags: vk::QueueFlags,
}

impl Default for QueueFamilyProperties {
    fn default() -> Self {
        QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
        }
    }
}

/// Durable record for a device queue.
#[derive(Debug)]
pub struct QueueRecord {
    handle: vk::Queue,
    queue_family_index: u32,
}

impl QueueRecord {
    pub fn new(handle: vk::Queue, queue_family_index: u32) -> Self {
        QueueRecord {
            handle,
            queue_family_index,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Returns the index of the queue family that this queue belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}
