use crate::backend::*;
use crate::error::Result;
use tracing::trace;

/// Transient working memory for a single acceleration structure build.
///
/// The buffer is released on drop, so it must be kept alive until the build
/// that references it has retired on the device.
pub struct ScratchBuffer<'a, B: Backend> {
    backend: &'a B,
    buffer: B::Buffer,
    device_address: DeviceAddress,
    size: DeviceSize,
}

impl<'a, B: Backend> ScratchBuffer<'a, B> {
    /// `size` must be the scratch size reported by the backend for the build this serves.
    pub fn acquire(backend: &'a B, size: DeviceSize) -> Result<Self> {
        let size = size.max(1);
        let buffer = backend.create_buffer(
            size,
            BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            MemoryLocation::DeviceLocal,
        )?;
        let device_address = backend.buffer_device_address(buffer);
        trace!(size, device_address, "acquired scratch");
        Ok(Self {
            backend,
            buffer,
            device_address,
            size,
        })
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }
}

impl<'a, B: Backend> Drop for ScratchBuffer<'a, B> {
    fn drop(&mut self) {
        trace!(device_address = self.device_address, "released scratch");
        self.backend.destroy_buffer(self.buffer);
    }
}
