// Command buffer pools
//
// One pool exists per (queue family, worker thread, frame slot).
// Buffers are handed out in order and the whole pool resets in one
// call when its frame slot comes around again, which is much cheaper
// than per-buffer resets.

use ash::vk;

pub(crate) struct CommandPool {
    dev: ash::Device,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    used_count: usize,
}

impl CommandPool {
    pub fn new(dev: ash::Device, queue_family: u32) -> Self {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family)
            .build();

        let pool = unsafe {
            dev.create_command_pool(&info, None)
                .expect("Could not create command pool")
        };

        Self {
            dev,
            pool,
            buffers: Vec::new(),
            used_count: 0,
        }
    }

    /// Hand out the next buffer, growing the pool if every buffer is
    /// already in use this frame.
    pub fn request_command_buffer(&mut self) -> vk::CommandBuffer {
        if self.used_count < self.buffers.len() {
            let buffer = self.buffers[self.used_count];
            self.used_count += 1;
            return buffer;
        }

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .build();

        let buffer = unsafe {
            self.dev
                .allocate_command_buffers(&info)
                .expect("Could not allocate command buffer")[0]
        };

        self.buffers.push(buffer);
        self.used_count += 1;
        buffer
    }

    /// Reset the pool for its next frame slot.
    pub fn begin_frame(&mut self) {
        if self.used_count > 0 {
            self.used_count = 0;
            unsafe {
                self.dev
                    .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                    .expect("Could not reset command pool");
            }
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            if !self.buffers.is_empty() {
                self.dev.free_command_buffers(self.pool, &self.buffers);
            }
            self.dev.destroy_command_pool(self.pool, None);
        }
    }
}
