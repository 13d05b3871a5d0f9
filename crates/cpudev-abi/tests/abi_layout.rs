use cpudev_abi::{DevImage, DevSampler, WorkgroupContext, CPUDEV_ABI_VERSION};
use memoffset::offset_of;

// Offsets here are mirrored by the code generator's struct definitions. Changing any of them
// requires a `CPUDEV_ABI_VERSION` bump.

#[test]
fn abi_version_is_pinned() {
    assert_eq!(CPUDEV_ABI_VERSION, 1);
}

#[test]
fn workgroup_context_layout() {
    assert_eq!(core::mem::size_of::<WorkgroupContext>(), 104);
    assert_eq!(core::mem::align_of::<WorkgroupContext>(), 8);

    assert_eq!(offset_of!(WorkgroupContext, work_dim), 0);
    assert_eq!(offset_of!(WorkgroupContext, reserved0), 4);
    assert_eq!(offset_of!(WorkgroupContext, num_groups), 8);
    assert_eq!(offset_of!(WorkgroupContext, group_id), 32);
    assert_eq!(offset_of!(WorkgroupContext, global_offset), 56);
    assert_eq!(offset_of!(WorkgroupContext, local_size), 80);
}

#[test]
fn dev_image_layout() {
    assert_eq!(core::mem::size_of::<DevImage>(), 56);
    assert_eq!(core::mem::align_of::<DevImage>(), 8);

    assert_eq!(offset_of!(DevImage, data), 0);
    assert_eq!(offset_of!(DevImage, width), 8);
    assert_eq!(offset_of!(DevImage, height), 12);
    assert_eq!(offset_of!(DevImage, depth), 16);
    assert_eq!(offset_of!(DevImage, image_array_size), 20);
    assert_eq!(offset_of!(DevImage, row_pitch), 24);
    assert_eq!(offset_of!(DevImage, slice_pitch), 28);
    assert_eq!(offset_of!(DevImage, num_mip_levels), 32);
    assert_eq!(offset_of!(DevImage, num_samples), 36);
    assert_eq!(offset_of!(DevImage, order), 40);
    assert_eq!(offset_of!(DevImage, data_type), 44);
    assert_eq!(offset_of!(DevImage, num_channels), 48);
    assert_eq!(offset_of!(DevImage, elem_size), 52);
}

#[test]
fn dev_sampler_is_a_single_word() {
    assert_eq!(core::mem::size_of::<DevSampler>(), 4);
    assert_eq!(core::mem::align_of::<DevSampler>(), 4);
}

#[test]
fn dev_image_bytes_follow_field_order() {
    let image = DevImage {
        data: 0x1122_3344_5566_7788,
        width: 640,
        elem_size: 4,
        ..DevImage::default()
    };
    let bytes = bytemuck::bytes_of(&image);
    assert_eq!(bytes.len(), DevImage::SIZE_BYTES);
    assert_eq!(
        u64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
        0x1122_3344_5566_7788
    );
    assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 640);
    assert_eq!(u32::from_ne_bytes(bytes[52..56].try_into().unwrap()), 4);
}
