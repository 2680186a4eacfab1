//! Device configuration.

use ash::vk;

use crate::{
    MAX_CB_PER_QUEUE_FAMILY, MAX_QUEUES_PER_TYPE,
    queue::{QUEUE_TYPE_COUNT, QueueType},
};

/// The queue family backing one [`QueueType`], and how many of its queues are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub family_index: u32,
    pub queue_count: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub queues: [Option<QueueFamilySelection>; QUEUE_TYPE_COUNT],
    /// Upper bound on live command buffers per queue family.
    pub command_buffers_per_family: usize,
    /// Query slots per native query pool block.
    pub query_block_size: u32,
    /// How long dropping a submitted command buffer waits for it to finish.
    pub fence_timeout_ns: u64,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queues: [None; QUEUE_TYPE_COUNT],
            command_buffers_per_family: MAX_CB_PER_QUEUE_FAMILY,
            query_block_size: 16,
            fence_timeout_ns: 1_000_000_000,
            timestamp_period: 1.0,
        }
    }
}

impl DeviceConfig {
    /// Picks a family per queue type: the first graphics family, the first compute family
    /// without graphics and the first transfer family without graphics or compute.
    pub fn from_queue_families(families: &[vk::QueueFamilyProperties]) -> Self {
        let mut config = Self::default();
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            families.iter().enumerate().find(|(_, props)| {
                props.queue_count > 0
                    && props.queue_flags.contains(required)
                    && !props.queue_flags.intersects(excluded)
            })
        };
        let selections = [
            (
                QueueType::Graphics,
                find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty()),
            ),
            (
                QueueType::Compute,
                find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS),
            ),
            (
                QueueType::Upload,
                find(
                    vk::QueueFlags::TRANSFER,
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                ),
            ),
        ];
        for (ty, found) in selections {
            if let Some((index, props)) = found {
                config = config.with_queue(ty, index as u32, props.queue_count);
            }
        }
        config
    }

    /// Queue counts above [`MAX_QUEUES_PER_TYPE`] are clamped.
    pub fn with_queue(mut self, ty: QueueType, family_index: u32, queue_count: u32) -> Self {
        self.queues[ty.index()] = Some(QueueFamilySelection {
            family_index,
            queue_count: queue_count.min(MAX_QUEUES_PER_TYPE),
        });
        self
    }
    pub fn with_command_buffers_per_family(mut self, count: usize) -> Self {
        self.command_buffers_per_family = count;
        self
    }
    pub fn with_query_block_size(mut self, size: u32) -> Self {
        self.query_block_size = size.max(1);
        self
    }
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }
    pub fn with_timestamp_period(mut self, period: f32) -> Self {
        self.timestamp_period = period;
        self
    }

    pub fn queue(&self, ty: QueueType) -> Option<QueueFamilySelection> {
        self.queues[ty.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_queue_families() {
        let config = DeviceConfig::from_queue_families(&[
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::TRANSFER, 1),
        ]);
        assert_eq!(
            config.queue(QueueType::Graphics),
            Some(QueueFamilySelection {
                family_index: 0,
                queue_count: MAX_QUEUES_PER_TYPE
            })
        );
        assert_eq!(config.queue(QueueType::Compute).unwrap().family_index, 1);
        assert_eq!(config.queue(QueueType::Upload).unwrap().family_index, 2);
    }

    #[test]
    fn test_single_family_device() {
        let config = DeviceConfig::from_queue_families(&[family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            1,
        )]);
        assert!(config.queue(QueueType::Graphics).is_some());
        assert!(config.queue(QueueType::Compute).is_none());
        assert!(config.queue(QueueType::Upload).is_none());
    }
}
