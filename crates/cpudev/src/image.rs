//! Host-side image and sampler descriptions and their device-side encodings.

use cpudev_abi::{
    DevImage, DevSampler, CLK_ADDRESS_CLAMP, CLK_ADDRESS_CLAMP_TO_EDGE,
    CLK_ADDRESS_MIRRORED_REPEAT, CLK_ADDRESS_NONE, CLK_ADDRESS_REPEAT, CLK_FILTER_LINEAR,
    CLK_FILTER_NEAREST, CLK_NORMALIZED_COORDS_FALSE, CLK_NORMALIZED_COORDS_TRUE,
};

use crate::alloc::MemoryObject;
use crate::device::DeviceId;
use crate::error::{DriverError, DriverResult};

/// Image channel order (`CL_R` .. `CL_RGBx` values).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R = 0x10B0,
    A = 0x10B1,
    Rg = 0x10B2,
    Ra = 0x10B3,
    Rgb = 0x10B4,
    Rgba = 0x10B5,
    Bgra = 0x10B6,
    Argb = 0x10B7,
    Intensity = 0x10B8,
    Luminance = 0x10B9,
    Rx = 0x10BA,
    Rgx = 0x10BB,
    Rgbx = 0x10BC,
}

impl ChannelOrder {
    pub fn num_channels(self) -> u32 {
        match self {
            Self::R | Self::A | Self::Intensity | Self::Luminance | Self::Rx => 1,
            Self::Rg | Self::Ra | Self::Rgx => 2,
            Self::Rgb | Self::Rgbx => 3,
            Self::Rgba | Self::Bgra | Self::Argb => 4,
        }
    }
}

/// Image channel data type (`CL_SNORM_INT8` .. `CL_FLOAT` values).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8 = 0x10D0,
    SnormInt16 = 0x10D1,
    UnormInt8 = 0x10D2,
    UnormInt16 = 0x10D3,
    UnormShort565 = 0x10D4,
    UnormShort555 = 0x10D5,
    UnormInt101010 = 0x10D6,
    SignedInt8 = 0x10D7,
    SignedInt16 = 0x10D8,
    SignedInt32 = 0x10D9,
    UnsignedInt8 = 0x10DA,
    UnsignedInt16 = 0x10DB,
    UnsignedInt32 = 0x10DC,
    HalfFloat = 0x10DD,
    Float = 0x10DE,
}

impl ChannelType {
    /// Bytes per channel; for packed types, bytes per whole pixel.
    pub fn elem_size(self) -> u32 {
        match self {
            Self::SnormInt8 | Self::UnormInt8 | Self::SignedInt8 | Self::UnsignedInt8 => 1,
            Self::SnormInt16
            | Self::UnormInt16
            | Self::SignedInt16
            | Self::UnsignedInt16
            | Self::HalfFloat
            | Self::UnormShort565
            | Self::UnormShort555 => 2,
            Self::SignedInt32 | Self::UnsignedInt32 | Self::Float | Self::UnormInt101010 => 4,
        }
    }

    pub fn is_packed(self) -> bool {
        matches!(
            self,
            Self::UnormShort565 | Self::UnormShort555 | Self::UnormInt101010
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub row_pitch: u32,
    pub slice_pitch: u32,
    pub num_mip_levels: u32,
    pub num_samples: u32,
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageDesc {
    /// Tightly packed 2D image.
    pub fn new_2d(width: u32, height: u32, order: ChannelOrder, data_type: ChannelType) -> Self {
        let mut desc = Self {
            width,
            height,
            depth: 1,
            array_size: 0,
            row_pitch: 0,
            slice_pitch: 0,
            num_mip_levels: 0,
            num_samples: 0,
            order,
            data_type,
        };
        desc.row_pitch = width.saturating_mul(desc.pixel_size());
        desc.slice_pitch = desc.row_pitch.saturating_mul(height);
        desc
    }

    /// Channels as seen by the device; packed formats carry their channels in one element.
    pub fn num_channels(&self) -> u32 {
        if self.data_type.is_packed() {
            1
        } else {
            self.order.num_channels()
        }
    }

    pub fn pixel_size(&self) -> u32 {
        self.num_channels() * self.data_type.elem_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    None,
    ClampToEdge,
    Clamp,
    Repeat,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub normalized_coords: bool,
    pub addressing: AddressingMode,
    pub filter: FilterMode,
}

/// Encodes `mem`'s image description for `dev_id`.
///
/// The data pointer is the object's resolved address for that instance, so the object must be
/// resolved first.
pub fn fill_dev_image(mem: &MemoryObject, dev_id: DeviceId) -> DriverResult<DevImage> {
    let desc = mem.image().ok_or_else(|| {
        DriverError::Precondition("image argument bound to a non-image memory object".to_string())
    })?;
    let data = mem.device_ptr(dev_id).ok_or_else(|| {
        DriverError::Precondition(format!("image not resolved for device {dev_id}"))
    })?;

    Ok(DevImage {
        data: data.as_ptr() as usize as u64,
        width: desc.width,
        height: desc.height,
        depth: desc.depth,
        image_array_size: desc.array_size,
        row_pitch: desc.row_pitch,
        slice_pitch: desc.slice_pitch,
        num_mip_levels: desc.num_mip_levels,
        num_samples: desc.num_samples,
        order: desc.order as u32,
        data_type: desc.data_type as u32,
        num_channels: desc.num_channels(),
        elem_size: desc.data_type.elem_size(),
    })
}

pub fn fill_dev_sampler(sampler: &SamplerDesc) -> DevSampler {
    let coords = if sampler.normalized_coords {
        CLK_NORMALIZED_COORDS_TRUE
    } else {
        CLK_NORMALIZED_COORDS_FALSE
    };
    let addressing = match sampler.addressing {
        AddressingMode::None => CLK_ADDRESS_NONE,
        AddressingMode::ClampToEdge => CLK_ADDRESS_CLAMP_TO_EDGE,
        AddressingMode::Clamp => CLK_ADDRESS_CLAMP,
        AddressingMode::Repeat => CLK_ADDRESS_REPEAT,
        AddressingMode::MirroredRepeat => CLK_ADDRESS_MIRRORED_REPEAT,
    };
    let filter = match sampler.filter {
        FilterMode::Nearest => CLK_FILTER_NEAREST,
        FilterMode::Linear => CLK_FILTER_LINEAR,
    };
    DevSampler(coords | addressing | filter)
}
