// GPU buffer resources
//
// Buffers are shared handles stamped with a cookie. Dropping the last
// reference never destroys the VkBuffer synchronously; the handle and
// its memory are queued on the current frame context and reclaimed
// once the frame's timeline work has provably completed.

use ash::vk;

use crate::cookie::generate_cookie;
use crate::device::Device;
use crate::memory::{BufferDomain, DeviceAllocation};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

bitflags::bitflags! {
    pub struct BufferMiscFlags: u32 {
        /// Fill the buffer with zeroes before first use.
        const ZERO_INITIALIZE = 1 << 0;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BufferCreateInfo {
    pub domain: BufferDomain,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub misc: BufferMiscFlags,
}

impl Default for BufferCreateInfo {
    fn default() -> Self {
        Self {
            domain: BufferDomain::Device,
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            misc: BufferMiscFlags::empty(),
        }
    }
}

/// A device buffer and the allocation backing it.
pub struct Buffer {
    dev: Weak<Device>,
    buffer: vk::Buffer,
    cookie: u64,
    alloc: DeviceAllocation,
    info: BufferCreateInfo,
    internal_sync: AtomicBool,
}

impl Buffer {
    pub(crate) fn new(
        dev: Weak<Device>,
        buffer: vk::Buffer,
        alloc: DeviceAllocation,
        info: BufferCreateInfo,
    ) -> Self {
        Self {
            dev,
            buffer,
            cookie: generate_cookie(),
            alloc,
            info,
            internal_sync: AtomicBool::new(false),
        }
    }

    pub fn vk_handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn info(&self) -> &BufferCreateInfo {
        &self.info
    }

    pub fn allocation(&self) -> &DeviceAllocation {
        &self.alloc
    }

    /// Mapped pointer for host visible domains.
    pub fn host_ptr(&self) -> Option<*mut u8> {
        self.alloc.host_ptr()
    }

    /// Route this buffer's destruction through the lockless frame
    /// queue. Used for buffers owned by per-frame allocators which
    /// drop while the device lock is held.
    pub(crate) fn set_internal_sync(&self) {
        self.internal_sync.store(true, Ordering::Relaxed);
    }

    /// Teardown path: destroy the handles directly. The later Drop
    /// no-ops because the device backref is already dead.
    pub(crate) fn destroy_now(&self, dev: &ash::Device, allocator: &crate::memory::DeviceAllocator) {
        unsafe { dev.destroy_buffer(self.buffer, None) };
        allocator.free(&self.alloc);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(dev) = self.dev.upgrade() {
            dev.destroy_buffer_deferred(
                self.buffer,
                self.alloc,
                self.internal_sync.load(Ordering::Relaxed),
            );
        }
        // with no device left, teardown already destroyed the handle
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BufferViewCreateInfo {
    pub format: vk::Format,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// A typed view over a buffer, for texel buffer bindings.
///
/// The view keeps its buffer alive through shared ownership.
pub struct BufferView {
    dev: Weak<Device>,
    view: vk::BufferView,
    cookie: u64,
    info: BufferViewCreateInfo,
    buffer: Arc<Buffer>,
    internal_sync: AtomicBool,
}

impl BufferView {
    pub(crate) fn new(
        dev: Weak<Device>,
        view: vk::BufferView,
        buffer: Arc<Buffer>,
        info: BufferViewCreateInfo,
    ) -> Self {
        Self {
            dev,
            view,
            cookie: generate_cookie(),
            info,
            buffer,
            internal_sync: AtomicBool::new(false),
        }
    }

    pub fn vk_handle(&self) -> vk::BufferView {
        self.view
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn info(&self) -> &BufferViewCreateInfo {
        &self.info
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        if let Some(dev) = self.dev.upgrade() {
            dev.destroy_buffer_view_deferred(
                self.view,
                self.internal_sync.load(Ordering::Relaxed),
            );
        }
    }
}
