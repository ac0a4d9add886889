//! Timestamp queries.
//!
//! A [`TimestampQueryPool`] holds a start/end pair of queries per slot and a
//! host-visible buffer the pairs are resolved into. Recording, resolving and
//! reading are separate steps: resolve happens on the GPU inside the same
//! command buffer as the measured work, reading happens on the host once the
//! submission is known to have retired.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::buffer::ReadbackBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Queries per slot: start and end.
pub const QUERIES_PER_SLOT: u32 = 2;

const TICK_SIZE: vk::DeviceSize = std::mem::size_of::<u64>() as vk::DeviceSize;

/// Pool of timestamp query pairs with a readback area per pair.
pub struct TimestampQueryPool {
    device: Arc<Device>,
    pool: vk::QueryPool,
    readback: ReadbackBuffer,
    slots: u32,
    valid_mask: u64,
}

impl TimestampQueryPool {
    /// Creates `slots` query pairs on `device`.
    pub fn new(device: Arc<Device>, slots: u32) -> RhiResult<Self> {
        if slots == 0 {
            return Err(RhiError::InvalidRequest(
                "timestamp pool needs at least one slot".to_string(),
            ));
        }

        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(slots * QUERIES_PER_SLOT);
        let pool = unsafe { device.handle().create_query_pool(&create_info, None)? };

        let readback = match ReadbackBuffer::new(
            device.clone(),
            "timestamp readback",
            vk::DeviceSize::from(slots * QUERIES_PER_SLOT) * TICK_SIZE,
        ) {
            Ok(readback) => readback,
            Err(e) => {
                unsafe { device.handle().destroy_query_pool(pool, None) };
                return Err(e);
            }
        };

        let valid_mask = valid_bits_mask(device.adapter().timestamp_valid_bits);
        debug!("Created timestamp query pool on {} ({} pair(s))", device.label(), slots);

        Ok(Self {
            device,
            pool,
            readback,
            slots,
            valid_mask,
        })
    }

    fn check(&self, slot: u32) -> RhiResult<u32> {
        if slot >= self.slots {
            return Err(RhiError::InvalidRequest(format!(
                "timestamp slot {} out of range ({} slot(s))",
                slot, self.slots
            )));
        }
        Ok(slot * QUERIES_PER_SLOT)
    }

    /// Resets the pair of `slot` and records the start timestamp.
    pub fn cmd_begin(&self, command_buffer: vk::CommandBuffer, slot: u32) -> RhiResult<()> {
        let first = self.check(slot)?;
        unsafe {
            let device = self.device.handle();
            device.cmd_reset_query_pool(command_buffer, self.pool, first, QUERIES_PER_SLOT);
            device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.pool,
                first,
            );
        }
        Ok(())
    }

    /// Records the end timestamp after all transfer work of `slot`.
    pub fn cmd_end(&self, command_buffer: vk::CommandBuffer, slot: u32) -> RhiResult<()> {
        let first = self.check(slot)?;
        unsafe {
            self.device.handle().cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.pool,
                first + 1,
            );
        }
        Ok(())
    }

    /// Resolves the pair of `slot` into its readback area and makes it host visible.
    pub fn cmd_resolve(&self, command_buffer: vk::CommandBuffer, slot: u32) -> RhiResult<()> {
        let first = self.check(slot)?;
        let offset = vk::DeviceSize::from(first) * TICK_SIZE;
        unsafe {
            let device = self.device.handle();
            device.cmd_copy_query_pool_results(
                command_buffer,
                self.pool,
                first,
                QUERIES_PER_SLOT,
                self.readback.handle(),
                offset,
                TICK_SIZE,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );

            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(self.readback.handle())
                .offset(offset)
                .size(vk::DeviceSize::from(QUERIES_PER_SLOT) * TICK_SIZE);
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    /// Reads the resolved `(start, end)` ticks of `slot`.
    ///
    /// Only meaningful after the submission that resolved the pair retired.
    pub fn read(&self, slot: u32) -> RhiResult<(u64, u64)> {
        let first = self.check(slot)?;
        let ticks: Vec<u64> = self.readback.read(
            vk::DeviceSize::from(first) * TICK_SIZE,
            QUERIES_PER_SLOT as usize,
        )?;
        Ok((ticks[0] & self.valid_mask, ticks[1] & self.valid_mask))
    }
}

impl Drop for TimestampQueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_query_pool(self.pool, None);
        }
    }
}

/// Mask keeping the meaningful low bits of a timestamp.
fn valid_bits_mask(valid_bits: u32) -> u64 {
    match valid_bits {
        0 => 0,
        64.. => u64::MAX,
        bits => (1u64 << bits) - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bits_mask() {
        assert_eq!(valid_bits_mask(64), u64::MAX);
        assert_eq!(valid_bits_mask(36), (1 << 36) - 1);
        assert_eq!(valid_bits_mask(0), 0);
    }
}
