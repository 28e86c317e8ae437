use super::context::Context;
use crate::error::{Error, Result};
use spark::{vk, Builder};
use std::slice;
use std::sync::Arc;
use tracing::trace;

/// Command buffers recorded once, submitted, then waited on before the next begins.
pub struct OneTimeCommandPool {
    context: Arc<Context>,
    pool: vk::CommandPool,
    fence: vk::Fence,
}

impl OneTimeCommandPool {
    const FENCE_TIMEOUT_NS: u64 = 1000 * 1000 * 1000;

    pub fn new(context: &Arc<Context>) -> Result<Self> {
        let device = &context.device;

        let pool = {
            let command_pool_create_info = vk::CommandPoolCreateInfo {
                flags: vk::CommandPoolCreateFlags::TRANSIENT,
                queue_family_index: context.queue_family_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&command_pool_create_info, None) }
                .map_err(|err| Error::backend("vkCreateCommandPool", err))?
        };

        let fence = match unsafe { device.create_fence(&Default::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.destroy_command_pool(Some(pool), None) };
                return Err(Error::backend("vkCreateFence", err));
            }
        };

        Ok(Self {
            context: Arc::clone(context),
            pool,
            fence,
        })
    }

    pub fn begin(&self) -> Result<vk::CommandBuffer> {
        let device = &self.context.device;

        let command_buffer_allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: Some(self.pool),
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let [cmd]: [vk::CommandBuffer; 1] = unsafe { device.allocate_command_buffers_array(&command_buffer_allocate_info) }
            .map_err(|err| Error::backend("vkAllocateCommandBuffers", err))?;

        let command_buffer_begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        if let Err(err) = unsafe { device.begin_command_buffer(cmd, &command_buffer_begin_info) } {
            unsafe { device.free_command_buffers(self.pool, slice::from_ref(&cmd)) };
            return Err(Error::backend("vkBeginCommandBuffer", err));
        }
        Ok(cmd)
    }

    /// Ends, submits and waits for the command buffer, which is freed whatever the outcome.
    pub fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self.submit_and_wait_inner(cmd);
        unsafe { self.context.device.free_command_buffers(self.pool, slice::from_ref(&cmd)) };
        result
    }

    fn submit_and_wait_inner(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let device = &self.context.device;

        unsafe { device.end_command_buffer(cmd) }.map_err(|err| Error::backend("vkEndCommandBuffer", err))?;

        let submit_info = *vk::SubmitInfo::builder().p_command_buffers(slice::from_ref(&cmd));
        unsafe { device.queue_submit(self.context.queue, slice::from_ref(&submit_info), Some(self.fence)) }
            .map_err(|err| Error::backend("vkQueueSubmit", err))?;

        loop {
            let res = unsafe { device.wait_for_fences(slice::from_ref(&self.fence), true, Self::FENCE_TIMEOUT_NS) };
            match res {
                Ok(_) => break,
                Err(vk::Result::TIMEOUT) => trace!("still waiting for submission"),
                Err(err) => return Err(Error::backend("vkWaitForFences", err)),
            }
        }

        unsafe { device.reset_fences(slice::from_ref(&self.fence)) }
            .map_err(|err| Error::backend("vkResetFences", err))
    }
}

impl Drop for OneTimeCommandPool {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_fence(Some(self.fence), None);
            device.destroy_command_pool(Some(self.pool), None);
        }
    }
}
