// Pipeline cache persistence
//
// The driver's pipeline cache blob is written out at device teardown
// and validated on the next startup against the device identity baked
// into its header. A mismatched blob (driver update, different GPU)
// is discarded and the cache starts empty.

use ash::vk;

use std::fs;
use std::path::PathBuf;

const PIPELINE_CACHE_PATH: &str = ".export/pipeline_cache.bin";

/// Fixed prefix of a VkPipelineCache blob.
struct CacheHeader {
    header_length: u32,
    header_version: u32,
    vendor_id: u32,
    device_id: u32,
    uuid: [u8; vk::UUID_SIZE],
}

impl CacheHeader {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 16 + vk::UUID_SIZE {
            return None;
        }

        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut uuid = [0u8; vk::UUID_SIZE];
        uuid.copy_from_slice(&data[16..16 + vk::UUID_SIZE]);

        Some(Self {
            header_length: word(0),
            header_version: word(4),
            vendor_id: word(8),
            device_id: word(12),
            uuid,
        })
    }

    fn matches(&self, props: &vk::PhysicalDeviceProperties) -> bool {
        self.header_length >= 16 + vk::UUID_SIZE as u32
            && self.header_version == vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32
            && self.vendor_id == props.vendor_id
            && self.device_id == props.device_id
            && self.uuid == props.pipeline_cache_uuid
    }
}

pub(crate) struct PersistentPipelineCache {
    cache: vk::PipelineCache,
    path: PathBuf,
}

impl PersistentPipelineCache {
    /// Load the persisted blob if it matches this device, and create
    /// the VkPipelineCache from it.
    pub fn open(dev: &ash::Device, props: &vk::PhysicalDeviceProperties) -> Self {
        let path = PathBuf::from(PIPELINE_CACHE_PATH);

        let initial_data = match fs::read(&path) {
            Ok(data) => match CacheHeader::parse(&data) {
                Some(header) if header.matches(props) => data,
                Some(_) => {
                    log::warn!("Persisted pipeline cache is for a different device, discarding");
                    Vec::new()
                }
                None => Vec::new(),
            },
            Err(_) => Vec::new(),
        };

        let info = vk::PipelineCacheCreateInfo::builder()
            .initial_data(&initial_data)
            .build();

        let cache = unsafe {
            match dev.create_pipeline_cache(&info, None) {
                Ok(cache) => cache,
                Err(_) => {
                    // a corrupt blob can fail creation; retry empty
                    let empty = vk::PipelineCacheCreateInfo::builder().build();
                    dev.create_pipeline_cache(&empty, None)
                        .expect("Could not create pipeline cache")
                }
            }
        };

        Self { cache, path }
    }

    pub fn vk_handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Persist the blob and destroy the cache object.
    pub fn save_and_destroy(&self, dev: &ash::Device) {
        unsafe {
            match dev.get_pipeline_cache_data(self.cache) {
                Ok(data) if !data.is_empty() => {
                    if let Some(parent) = self.path.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    if let Err(e) = fs::write(&self.path, &data) {
                        log::warn!("Could not persist pipeline cache: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Could not read back pipeline cache: {:?}", e),
            }
            dev.destroy_pipeline_cache(self.cache, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props_with(vendor: u32, device: u32, uuid: [u8; vk::UUID_SIZE]) -> vk::PhysicalDeviceProperties {
        let mut props = vk::PhysicalDeviceProperties::default();
        props.vendor_id = vendor;
        props.device_id = device;
        props.pipeline_cache_uuid = uuid;
        props
    }

    fn header_bytes(vendor: u32, device: u32, uuid: [u8; vk::UUID_SIZE]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&32u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&vendor.to_le_bytes());
        data.extend_from_slice(&device.to_le_bytes());
        data.extend_from_slice(&uuid);
        data
    }

    #[test]
    fn matching_header_validates() {
        let uuid = [7u8; vk::UUID_SIZE];
        let data = header_bytes(0x10de, 0x2204, uuid);
        let header = CacheHeader::parse(&data).unwrap();
        assert!(header.matches(&props_with(0x10de, 0x2204, uuid)));
    }

    #[test]
    fn mismatched_device_is_rejected() {
        let uuid = [7u8; vk::UUID_SIZE];
        let data = header_bytes(0x10de, 0x2204, uuid);
        let header = CacheHeader::parse(&data).unwrap();
        assert!(!header.matches(&props_with(0x10de, 0x2206, uuid)));
        assert!(!header.matches(&props_with(0x1002, 0x2204, uuid)));
        assert!(!header.matches(&props_with(0x10de, 0x2204, [8u8; vk::UUID_SIZE])));
    }

    #[test]
    fn truncated_blob_fails_parse() {
        assert!(CacheHeader::parse(&[0u8; 8]).is_none());
    }
}
