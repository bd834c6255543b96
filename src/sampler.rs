// Samplers
//
// Samplers come in two lifetimes: immutable samplers are baked into
// descriptor set layouts and live as long as the device, transient
// samplers are released through the frame destruction queues like any
// other resource. The stock samplers cover the common filter/address
// combinations.

use ash::vk;

use crate::cache::HashCombiner;
use crate::cookie::generate_cookie;
use crate::device::Device;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// The set of samplers every device keeps alive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StockSampler {
    NearestClamp,
    NearestWrap,
    PointClamp,
    PointWrap,
}

pub const STOCK_SAMPLER_COUNT: usize = 4;

impl StockSampler {
    pub(crate) fn index(&self) -> usize {
        match self {
            StockSampler::NearestClamp => 0,
            StockSampler::NearestWrap => 1,
            StockSampler::PointClamp => 2,
            StockSampler::PointWrap => 3,
        }
    }

    pub(crate) fn create_info(&self) -> SamplerCreateInfo {
        let (filter, mipmap_mode) = match self {
            // point sampling snaps to the base level, nearest walks
            // the chain
            StockSampler::NearestClamp | StockSampler::NearestWrap => {
                (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
            }
            StockSampler::PointClamp | StockSampler::PointWrap => {
                (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
            }
        };

        let address_mode = match self {
            StockSampler::NearestClamp | StockSampler::PointClamp => {
                vk::SamplerAddressMode::CLAMP_TO_EDGE
            }
            StockSampler::NearestWrap | StockSampler::PointWrap => vk::SamplerAddressMode::REPEAT,
        };

        let max_lod = match self {
            StockSampler::PointClamp | StockSampler::PointWrap => 0.0,
            _ => vk::LOD_CLAMP_NONE,
        };

        SamplerCreateInfo {
            mag_filter: filter,
            min_filter: filter,
            mipmap_mode,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            max_lod,
            ..Default::default()
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerCreateInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mip_lod_bias: 0.0,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            compare_enable: false,
            compare_op: vk::CompareOp::NEVER,
            min_lod: 0.0,
            max_lod: 0.0,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

impl SamplerCreateInfo {
    /// Digest of every field, used to dedupe immutable samplers.
    pub(crate) fn get_hash(&self) -> u64 {
        let mut hasher = HashCombiner::new();
        hasher
            .u32(self.mag_filter.as_raw() as u32)
            .u32(self.min_filter.as_raw() as u32)
            .u32(self.mipmap_mode.as_raw() as u32)
            .u32(self.address_mode_u.as_raw() as u32)
            .u32(self.address_mode_v.as_raw() as u32)
            .u32(self.address_mode_w.as_raw() as u32)
            .f32(self.mip_lod_bias)
            .bool(self.anisotropy_enable)
            .f32(self.max_anisotropy)
            .bool(self.compare_enable)
            .u32(self.compare_op.as_raw() as u32)
            .f32(self.min_lod)
            .f32(self.max_lod)
            .u32(self.border_color.as_raw() as u32)
            .bool(self.unnormalized_coordinates);
        hasher.get()
    }

    pub(crate) fn as_vk(&self) -> vk::SamplerCreateInfo {
        vk::SamplerCreateInfo::builder()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode_u)
            .address_mode_v(self.address_mode_v)
            .address_mode_w(self.address_mode_w)
            .mip_lod_bias(self.mip_lod_bias)
            .anisotropy_enable(self.anisotropy_enable)
            .max_anisotropy(self.max_anisotropy)
            .compare_enable(self.compare_enable)
            .compare_op(self.compare_op)
            .min_lod(self.min_lod)
            .max_lod(self.max_lod)
            .border_color(self.border_color)
            .unnormalized_coordinates(self.unnormalized_coordinates)
            .build()
    }
}

/// One VkSampler.
///
/// Immutable samplers skip the deferred destruction path entirely:
/// they are owned by the device's sampler cache and torn down with it.
pub struct Sampler {
    dev: Weak<Device>,
    sampler: vk::Sampler,
    cookie: u64,
    info: SamplerCreateInfo,
    is_immutable: bool,
    internal_sync: AtomicBool,
}

impl Sampler {
    pub(crate) fn new(
        dev: Weak<Device>,
        sampler: vk::Sampler,
        info: SamplerCreateInfo,
        is_immutable: bool,
    ) -> Self {
        Self {
            dev,
            sampler,
            cookie: generate_cookie(),
            info,
            is_immutable,
            internal_sync: AtomicBool::new(false),
        }
    }

    pub fn vk_handle(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn info(&self) -> &SamplerCreateInfo {
        &self.info
    }

    pub fn is_immutable(&self) -> bool {
        self.is_immutable
    }

    pub(crate) fn set_internal_sync(&self) {
        self.internal_sync.store(true, Ordering::Relaxed);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if self.is_immutable {
            // the device sampler cache destroys the handle at teardown
            return;
        }

        if let Some(dev) = self.dev.upgrade() {
            dev.destroy_sampler_deferred(
                self.sampler,
                self.internal_sync.load(Ordering::Relaxed),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_hash_covers_every_field() {
        let base = SamplerCreateInfo::default();
        let mut wrap = base;
        wrap.address_mode_u = vk::SamplerAddressMode::REPEAT;
        let mut lod = base;
        lod.max_lod = 4.0;

        assert_eq!(base.get_hash(), SamplerCreateInfo::default().get_hash());
        assert_ne!(base.get_hash(), wrap.get_hash());
        assert_ne!(base.get_hash(), lod.get_hash());
        assert_ne!(wrap.get_hash(), lod.get_hash());
    }

    #[test]
    fn stock_samplers_have_distinct_infos() {
        let clamp = StockSampler::NearestClamp.create_info();
        let wrap = StockSampler::NearestWrap.create_info();
        assert_ne!(clamp.get_hash(), wrap.get_hash());
    }
}
