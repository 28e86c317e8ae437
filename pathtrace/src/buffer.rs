use crate::backend::*;
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Buffer that owns its backend allocation and frees it on drop.
pub struct DeviceBuffer<B: Backend> {
    backend: Arc<B>,
    buffer: B::Buffer,
    size: DeviceSize,
    device_address: Option<DeviceAddress>,
}

impl<B: Backend> DeviceBuffer<B> {
    /// Zero sized requests are clamped to one byte so every buffer has a valid handle.
    pub fn new(backend: &Arc<B>, size: DeviceSize, usage: BufferUsage, location: MemoryLocation) -> Result<Self> {
        let size = size.max(1);
        let buffer = backend.create_buffer(size, usage, location)?;
        let device_address = if usage.contains(BufferUsage::DEVICE_ADDRESS) {
            Some(backend.buffer_device_address(buffer))
        } else {
            None
        };
        Ok(Self {
            backend: Arc::clone(backend),
            buffer,
            size,
            device_address,
        })
    }

    /// Host-visible buffer holding `data`.
    pub fn with_data(backend: &Arc<B>, data: &[u8], usage: BufferUsage) -> Result<Self> {
        let buffer = Self::new(backend, data.len() as DeviceSize, usage, MemoryLocation::HostVisible)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a staging copy.
    ///
    /// Blocks until the copy has completed, so the result is safe to use immediately.
    pub fn upload(backend: &Arc<B>, data: &[u8], usage: BufferUsage) -> Result<Self> {
        let size = data.len() as DeviceSize;
        let staging = Self::with_data(backend, data, BufferUsage::TRANSFER_SRC)?;
        let buffer = Self::new(
            backend,
            size,
            usage | BufferUsage::TRANSFER_DST,
            MemoryLocation::DeviceLocal,
        )?;

        let mut cmd = backend.begin_commands()?;
        backend.cmd_copy_buffer(&mut cmd, staging.buffer, buffer.buffer, staging.size);
        backend.submit_and_wait(cmd)?;
        debug!(size, "uploaded buffer");

        Ok(buffer)
    }

    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<()> {
        self.backend.write_buffer(self.buffer, offset, data)
    }

    pub fn buffer(&self) -> B::Buffer {
        self.buffer
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Only present for buffers created with `BufferUsage::DEVICE_ADDRESS`.
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.device_address
    }
}

impl<B: Backend> Drop for DeviceBuffer<B> {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.buffer);
    }
}
