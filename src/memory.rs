// Device memory allocation
//
// This is the facade the resource constructors go through. It picks a
// memory type for a buffer or image based on its usage domain, binds
// the memory, and keeps host visible allocations persistently mapped.

use ash::vk;

use crate::{CandelaError, Result};

bitflags::bitflags! {
    /// Host access directions for map/unmap cache maintenance.
    pub struct MemoryAccessFlags: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// Where a buffer's memory should live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferDomain {
    /// GPU only.
    Device,
    /// GPU local but host mappable, used for streaming writes.
    LinkedDeviceHost,
    /// CPU only, used for staging sources.
    Host,
    /// CPU cached, used for readbacks.
    CachedHost,
}

/// Where an image's memory should live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageDomain {
    /// GPU only.
    Physical,
    /// Lazily allocated, expected to live on tile memory.
    Transient,
    /// Linear tiling, host visible.
    LinearHost,
    /// Linear tiling, host cached readback.
    LinearHostCached,
}

/// One device memory allocation.
///
/// If `host_base` is non-null the allocation is persistently mapped
/// for its whole lifetime. Allocations are owned: they are returned
/// through the frame destruction queues and freed once the GPU is
/// provably done with them.
#[derive(Copy, Clone, Debug)]
pub struct DeviceAllocation {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    /// memory type bits this allocation satisfied
    pub(crate) mask: u32,
    pub(crate) host_base: *mut u8,
    pub(crate) mem_flags: vk::MemoryPropertyFlags,
}

// The mapped pointer is only dereferenced behind the owning
// resource's synchronization, never shared mutably.
unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

impl DeviceAllocation {
    pub(crate) fn null() -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            offset: 0,
            size: 0,
            mask: 0,
            host_base: std::ptr::null_mut(),
            mem_flags: vk::MemoryPropertyFlags::empty(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mapped base pointer, or None for GPU-only memory.
    pub fn host_ptr(&self) -> Option<*mut u8> {
        if self.host_base.is_null() {
            None
        } else {
            Some(self.host_base)
        }
    }

    pub(crate) fn is_coherent(&self) -> bool {
        self.mem_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// The allocator facade over raw device memory.
pub struct DeviceAllocator {
    dev: ash::Device,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    atom_size: u64,
}

impl DeviceAllocator {
    pub(crate) fn new(
        dev: ash::Device,
        mem_props: vk::PhysicalDeviceMemoryProperties,
        limits: &vk::PhysicalDeviceLimits,
    ) -> Self {
        Self {
            dev,
            mem_props,
            atom_size: limits.non_coherent_atom_size,
        }
    }

    /// Preferred and required property flag sets for a buffer domain.
    fn buffer_domain_flags(
        domain: BufferDomain,
    ) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
        match domain {
            BufferDomain::Device => (
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            BufferDomain::LinkedDeviceHost => (
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            BufferDomain::Host => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            BufferDomain::CachedHost => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
        }
    }

    fn image_domain_flags(
        domain: ImageDomain,
    ) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
        match domain {
            ImageDomain::Physical => (
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            ),
            ImageDomain::Transient => (
                vk::MemoryPropertyFlags::LAZILY_ALLOCATED | vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            ),
            ImageDomain::LinearHost => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            ImageDomain::LinearHostCached => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
        }
    }

    fn buffer_domain_is_mapped(domain: BufferDomain) -> bool {
        match domain {
            BufferDomain::Device => false,
            _ => true,
        }
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory. Device
    /// local memory is resident on the GPU, while host visible memory can be
    /// read from the system side.
    fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in props.memory_types.iter().enumerate() {
            // Bit i of memoryBitTypes will be set if the resource supports
            // the ith memory type in props.
            if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocate and optionally map device memory.
    pub(crate) fn allocate(
        &self,
        reqs: vk::MemoryRequirements,
        preferred: vk::MemoryPropertyFlags,
        required: vk::MemoryPropertyFlags,
        host_mapped: bool,
    ) -> Result<DeviceAllocation> {
        let index = Self::find_memory_type_index(&self.mem_props, reqs.memory_type_bits, preferred)
            .or_else(|| {
                Self::find_memory_type_index(&self.mem_props, reqs.memory_type_bits, required)
            })
            .ok_or(CandelaError::OUT_OF_MEMORY)?;

        let flags = self.mem_props.memory_types[index as usize].property_flags;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index)
            .build();

        let memory = unsafe {
            self.dev
                .allocate_memory(&alloc_info, None)
                .or(Err(CandelaError::OUT_OF_MEMORY))?
        };

        let mut host_base = std::ptr::null_mut();
        if host_mapped && flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            host_base = unsafe {
                self.dev
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .or(Err(CandelaError::OUT_OF_MEMORY))? as *mut u8
            };
        }

        Ok(DeviceAllocation {
            memory,
            offset: 0,
            size: reqs.size,
            mask: reqs.memory_type_bits,
            host_base,
            mem_flags: flags,
        })
    }

    /// Create a buffer and bind fresh memory for its domain.
    pub(crate) fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo,
        domain: BufferDomain,
    ) -> Result<(vk::Buffer, DeviceAllocation)> {
        let buffer = unsafe {
            self.dev
                .create_buffer(info, None)
                .or(Err(CandelaError::COULD_NOT_CREATE_BUFFER))?
        };

        let reqs = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
        let (preferred, required) = Self::buffer_domain_flags(domain);
        let alloc = match self.allocate(
            reqs,
            preferred,
            required,
            Self::buffer_domain_is_mapped(domain),
        ) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe {
            self.dev
                .bind_buffer_memory(buffer, alloc.memory, alloc.offset)
                .or(Err(CandelaError::COULD_NOT_CREATE_BUFFER))?
        };

        Ok((buffer, alloc))
    }

    /// Create an image and bind fresh memory for its domain.
    pub(crate) fn create_image(
        &self,
        info: &vk::ImageCreateInfo,
        domain: ImageDomain,
    ) -> Result<(vk::Image, DeviceAllocation)> {
        let image = unsafe {
            self.dev
                .create_image(info, None)
                .or(Err(CandelaError::COULD_NOT_CREATE_IMAGE))?
        };

        let reqs = unsafe { self.dev.get_image_memory_requirements(image) };
        let (preferred, required) = Self::image_domain_flags(domain);
        let host_mapped = match domain {
            ImageDomain::LinearHost | ImageDomain::LinearHostCached => true,
            _ => false,
        };
        let alloc = match self.allocate(reqs, preferred, required, host_mapped) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        unsafe {
            self.dev
                .bind_image_memory(image, alloc.memory, alloc.offset)
                .or(Err(CandelaError::COULD_NOT_CREATE_IMAGE))?
        };

        Ok((image, alloc))
    }

    /// Map a range of an allocation for host access.
    ///
    /// Non-coherent memory is invalidated before a read so the host
    /// sees the device's writes.
    pub(crate) fn map(
        &self,
        alloc: &DeviceAllocation,
        access: MemoryAccessFlags,
        offset: u64,
        len: u64,
    ) -> Result<*mut u8> {
        if alloc.host_base.is_null() {
            return Err(CandelaError::INVALID);
        }

        if access.contains(MemoryAccessFlags::READ) && !alloc.is_coherent() {
            let range = self.mapped_range(alloc, offset, len);
            unsafe {
                self.dev
                    .invalidate_mapped_memory_ranges(&[range])
                    .or(Err(CandelaError::INVALID))?
            };
        }

        Ok(unsafe { alloc.host_base.add(offset as usize) })
    }

    /// Finish host access to a mapped range.
    ///
    /// Non-coherent memory is flushed after a write so the device
    /// sees the host's writes.
    pub(crate) fn unmap(
        &self,
        alloc: &DeviceAllocation,
        access: MemoryAccessFlags,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        if access.contains(MemoryAccessFlags::WRITE) && !alloc.is_coherent() {
            let range = self.mapped_range(alloc, offset, len);
            unsafe {
                self.dev
                    .flush_mapped_memory_ranges(&[range])
                    .or(Err(CandelaError::INVALID))?
            };
        }
        Ok(())
    }

    fn mapped_range(
        &self,
        alloc: &DeviceAllocation,
        offset: u64,
        len: u64,
    ) -> vk::MappedMemoryRange {
        // ranges of non-coherent memory have to honor the atom size
        let start = (alloc.offset + offset) & !(self.atom_size - 1);
        let end = alloc.offset + offset + len;
        let size = if end >= alloc.size {
            vk::WHOLE_SIZE
        } else {
            ((end + self.atom_size - 1) & !(self.atom_size - 1)) - start
        };

        vk::MappedMemoryRange::builder()
            .memory(alloc.memory)
            .offset(start)
            .size(size)
            .build()
    }

    /// Free an allocation, unmapping it first if needed.
    pub(crate) fn free(&self, alloc: &DeviceAllocation) {
        if alloc.memory == vk::DeviceMemory::null() {
            return;
        }
        unsafe {
            if !alloc.host_base.is_null() {
                self.dev.unmap_memory(alloc.memory);
            }
            self.dev.free_memory(alloc.memory, None);
        }
    }
}
