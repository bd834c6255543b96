// Synchronization primitive pools
//
// Fences, binary semaphores and events are recycled through free
// vectors instead of being created per use. The public wrappers route
// their handles back through the owning device's frame contexts on
// drop, so nothing is destroyed while the GPU may still touch it.

#![allow(dead_code)]

use ash::vk;

use crate::device::Device;
use crate::{CandelaError, Result};

use std::sync::{Arc, Weak};

/// Recycles binary VkSemaphores.
pub(crate) struct SemaphoreManager {
    dev: ash::Device,
    semaphores: Vec<vk::Semaphore>,
}

impl SemaphoreManager {
    pub fn new(dev: ash::Device) -> Self {
        Self {
            dev,
            semaphores: Vec::new(),
        }
    }

    pub fn request(&mut self) -> vk::Semaphore {
        if let Some(sema) = self.semaphores.pop() {
            return sema;
        }

        let info = vk::SemaphoreCreateInfo::builder().build();
        unsafe {
            self.dev
                .create_semaphore(&info, None)
                .expect("Could not create semaphore")
        }
    }

    pub fn recycle(&mut self, sema: vk::Semaphore) {
        self.semaphores.push(sema);
    }

    /// Destroy every pooled handle now; used at device teardown so
    /// nothing outlives the VkDevice.
    pub fn clear_all(&mut self) {
        unsafe {
            for sema in self.semaphores.drain(..) {
                self.dev.destroy_semaphore(sema, None);
            }
        }
    }
}

impl Drop for SemaphoreManager {
    fn drop(&mut self) {
        unsafe {
            for sema in self.semaphores.drain(..) {
                self.dev.destroy_semaphore(sema, None);
            }
        }
    }
}

/// Recycles VkFences.
pub(crate) struct FenceManager {
    dev: ash::Device,
    fences: Vec<vk::Fence>,
}

impl FenceManager {
    pub fn new(dev: ash::Device) -> Self {
        Self {
            dev,
            fences: Vec::new(),
        }
    }

    pub fn request(&mut self) -> vk::Fence {
        if let Some(fence) = self.fences.pop() {
            return fence;
        }

        let info = vk::FenceCreateInfo::builder().build();
        unsafe {
            self.dev
                .create_fence(&info, None)
                .expect("Could not create fence")
        }
    }

    /// Hand back a reset fence.
    pub fn recycle(&mut self, fence: vk::Fence) {
        self.fences.push(fence);
    }

    pub fn clear_all(&mut self) {
        unsafe {
            for fence in self.fences.drain(..) {
                self.dev.destroy_fence(fence, None);
            }
        }
    }
}

impl Drop for FenceManager {
    fn drop(&mut self) {
        unsafe {
            for fence in self.fences.drain(..) {
                self.dev.destroy_fence(fence, None);
            }
        }
    }
}

/// Recycles VkEvents.
pub(crate) struct EventManager {
    dev: ash::Device,
    events: Vec<vk::Event>,
}

impl EventManager {
    pub fn new(dev: ash::Device) -> Self {
        Self {
            dev,
            events: Vec::new(),
        }
    }

    pub fn request(&mut self) -> vk::Event {
        if let Some(event) = self.events.pop() {
            return event;
        }

        let info = vk::EventCreateInfo::builder().build();
        unsafe {
            self.dev
                .create_event(&info, None)
                .expect("Could not create event")
        }
    }

    pub fn recycle(&mut self, event: vk::Event) {
        self.events.push(event);
    }

    pub fn clear_all(&mut self) {
        unsafe {
            for event in self.events.drain(..) {
                self.dev.destroy_event(event, None);
            }
        }
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        unsafe {
            for event in self.events.drain(..) {
                self.dev.destroy_event(event, None);
            }
        }
    }
}

/// Which flavor of VkSemaphore a wrapper holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SemaphoreType {
    Binary,
    Timeline,
}

/// A shared semaphore handle.
///
/// Binary semaphores flow between swapchain acquire/release and queue
/// submission; timeline semaphores are queue owned and only referenced
/// here with their wait value. On last drop a binary handle that was
/// signalled is destroyed through the current frame (a pending signal
/// cannot be recycled), an unsignalled one goes back to the pool.
///
/// The device backref is weak because these wrappers are also parked
/// inside the device's own WSI and wait lists.
pub struct Semaphore {
    dev: Weak<Device>,
    sema: vk::Semaphore,
    sema_type: SemaphoreType,
    /// non-zero for timeline semaphores
    timeline: u64,
    signalled: bool,
    pending_wait: bool,
    internal_sync: bool,
}

impl Semaphore {
    pub(crate) fn new_binary(dev: Weak<Device>, sema: vk::Semaphore, signalled: bool) -> Self {
        Self {
            dev,
            sema,
            sema_type: SemaphoreType::Binary,
            timeline: 0,
            signalled,
            pending_wait: false,
            internal_sync: false,
        }
    }

    pub(crate) fn new_timeline(dev: Weak<Device>, sema: vk::Semaphore, value: u64) -> Self {
        Self {
            dev,
            sema,
            sema_type: SemaphoreType::Timeline,
            timeline: value,
            signalled: true,
            pending_wait: false,
            internal_sync: false,
        }
    }

    pub(crate) fn set_internal_sync(&mut self) {
        self.internal_sync = true;
    }

    pub(crate) fn vk_handle(&self) -> vk::Semaphore {
        self.sema
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled
    }

    pub fn timeline_value(&self) -> u64 {
        self.timeline
    }

    pub(crate) fn is_timeline(&self) -> bool {
        self.sema_type == SemaphoreType::Timeline
    }

    pub(crate) fn is_pending_wait(&self) -> bool {
        self.pending_wait
    }

    pub(crate) fn set_pending_wait(&mut self) {
        self.pending_wait = true;
    }

    /// Consume the pending signal. The submission that waited on the
    /// semaphore now owns the handle's lifetime.
    pub(crate) fn consume(&mut self) -> vk::Semaphore {
        assert!(self.signalled || self.sema_type == SemaphoreType::Timeline);
        let ret = self.sema;
        self.sema = vk::Semaphore::null();
        self.signalled = false;
        ret
    }

    /// Mark a signal operation on this semaphore.
    pub(crate) fn signal(&mut self) {
        assert!(!self.signalled);
        self.signalled = true;
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.sema == vk::Semaphore::null() || self.sema_type == SemaphoreType::Timeline {
            // timeline semaphores are owned by their queue
            return;
        }

        if let Some(dev) = self.dev.upgrade() {
            dev.release_binary_semaphore(self.sema, self.signalled, self.internal_sync);
        }
        // with no device left, teardown already destroyed the handle
    }
}

/// What backs a fence wrapper.
pub(crate) enum FenceInner {
    /// A legacy binary VkFence.
    Fence(vk::Fence),
    /// A point on a queue timeline.
    Timeline { sema: vk::Semaphore, value: u64 },
}

/// A waitable handle for one queue submission.
///
/// On timeline capable devices this is just a (semaphore, value)
/// pair; the legacy fence path survives for swapchain style waits.
/// The wrapper releases its VkFence back to the device on drop,
/// flagging whether it was already observed signalled.
pub struct Fence {
    dev: Arc<Device>,
    inner: FenceInner,
    waited: bool,
}

impl Fence {
    pub(crate) fn new_timeline(dev: Arc<Device>, sema: vk::Semaphore, value: u64) -> Self {
        Self {
            dev,
            inner: FenceInner::Timeline { sema, value },
            waited: false,
        }
    }

    pub(crate) fn new_fence(dev: Arc<Device>, fence: vk::Fence) -> Self {
        Self {
            dev,
            inner: FenceInner::Fence(fence),
            waited: false,
        }
    }

    /// Block until the submission this fence tracks has completed.
    pub fn wait(&mut self) -> Result<()> {
        if self.waited {
            return Ok(());
        }

        match &self.inner {
            FenceInner::Fence(fence) => unsafe {
                self.dev
                    .vk_dev()
                    .wait_for_fences(&[*fence], true, u64::MAX)
                    .or(Err(CandelaError::TIMEOUT))?;
            },
            FenceInner::Timeline { sema, value } => {
                let semas = [*sema];
                let values = [*value];
                let wait_info = vk::SemaphoreWaitInfo::builder()
                    .semaphores(&semas)
                    .values(&values)
                    .build();
                unsafe {
                    self.dev
                        .vk_dev()
                        .wait_semaphores(&wait_info, u64::MAX)
                        .or(Err(CandelaError::TIMEOUT))?;
                }
            }
        }

        self.waited = true;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        match self.inner {
            FenceInner::Fence(fence) => self.dev.release_fence(fence, self.waited),
            // the queue owns its timeline semaphore
            FenceInner::Timeline { .. } => {}
        }
    }
}
