//! GPU radix sort over depth keys.
//!
//! Implements the depth-key encoder (`spec.md` §4.C) and the stable 4-pass 8-bit LSD
//! radix sort (§4.D) used to bring splats into ascending-depth order before tile
//! binning. Every pass is encoded into the caller's command encoder; nothing here
//! blocks on the GPU or reads data back to the CPU.

use splat_kernel::bytemuck;
use splat_kernel::wgsl_kernel;
use splat_kernel::{calc_dispatch_1d, create_storage_buffer, create_uniform_buffer};

#[wgsl_kernel(source = "src/shaders/encode_keys.wgsl")]
pub struct EncodeKeys;

#[wgsl_kernel(source = "src/shaders/sort_count.wgsl")]
pub struct SortCount;

#[wgsl_kernel(source = "src/shaders/sort_reduce.wgsl")]
pub struct SortReduce;

#[wgsl_kernel(source = "src/shaders/sort_scan.wgsl")]
pub struct SortScan;

#[wgsl_kernel(source = "src/shaders/sort_scan_add.wgsl")]
pub struct SortScanAdd;

#[wgsl_kernel(source = "src/shaders/sort_scatter.wgsl")]
pub struct SortScatter;

/// Number of keys a single radix-count/scatter workgroup walks sequentially.
/// Must match `BLOCK_SIZE` in `sort_count.wgsl` and `sort_scatter.wgsl`.
const BLOCK_SIZE: u32 = 3840;
const RADIX: u32 = 256;
const PASSES: [u32; 4] = [0, 8, 16, 24];

fn bind_group(
    device: &wgpu::Device,
    pipeline: &wgpu::ComputePipeline,
    entries: &[(u32, &wgpu::Buffer)],
) -> wgpu::BindGroup {
    let layout = pipeline.get_bind_group_layout(0);
    let entries: Vec<wgpu::BindGroupEntry> = entries
        .iter()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: *binding,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor { label: None, layout: &layout, entries: &entries })
}

fn dispatch_blocks(encoder: &mut wgpu::CommandEncoder, label: &str, pipeline: &wgpu::ComputePipeline, bg: &wgpu::BindGroup, num_blocks: u32) {
    let (x, y, z) = calc_dispatch_1d(num_blocks, 1);
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(label), timestamp_writes: None });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bg, &[]);
    pass.dispatch_workgroups(x, y, z);
}

fn dispatch_digits(encoder: &mut wgpu::CommandEncoder, label: &str, pipeline: &wgpu::ComputePipeline, bg: &wgpu::BindGroup) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(label), timestamp_writes: None });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bg, &[]);
    pass.dispatch_workgroups(1, 1, 1);
}

/// Encode view-space depths into sortable u32 keys (`spec.md` §4.C). `depths` must
/// hold exactly `num_splats` floats; the returned buffer holds `num_splats` keys in
/// the same order.
pub fn encode_depth_keys(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    depths: &wgpu::Buffer,
    num_splats: u32,
) -> wgpu::Buffer {
    let pipeline = EncodeKeys::create_pipeline(device, "cs_encode_keys");
    let keys_out = create_storage_buffer::<u32>(
        device,
        "depth keys",
        num_splats as usize,
        wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
    );
    let uniforms = encode_keys::Uniforms { num_splats, _pad0: 0, _pad1: 0, _pad2: 0 };
    let ubo = create_uniform_buffer(device, "encode keys uniforms", uniforms);
    let bg = bind_group(device, &pipeline, &[(0, &ubo), (1, depths), (2, &keys_out)]);

    let (x, y, z) = calc_dispatch_1d(num_splats, encode_keys::WORKGROUP_SIZE[0]);
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("encode_depth_keys"),
        timestamp_writes: None,
    });
    pass.set_pipeline(&pipeline);
    pass.set_bind_group(0, &bg, &[]);
    pass.dispatch_workgroups(x, y, z);
    drop(pass);

    keys_out
}

/// Stably sort `keys` ascending, permuting `payload` (typically splat indices) the
/// same way. Returns the sorted `(keys, payload)` buffers; one of the two ping-pong
/// slots is returned directly rather than copied, so callers must not assume
/// identity with the buffers they passed in.
pub fn radix_argsort(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    keys: wgpu::Buffer,
    payload: wgpu::Buffer,
    num_keys: u32,
) -> (wgpu::Buffer, wgpu::Buffer) {
    if num_keys == 0 {
        return (keys, payload);
    }

    let num_blocks = num_keys.div_ceil(BLOCK_SIZE).max(1);

    let count_pipeline = SortCount::create_pipeline(device, "cs_count");
    let reduce_pipeline = SortReduce::create_pipeline(device, "cs_reduce");
    let scan_pipeline = SortScan::create_pipeline(device, "cs_scan");
    let scan_add_pipeline = SortScanAdd::create_pipeline(device, "cs_scan_add");
    let scatter_pipeline = SortScatter::create_pipeline(device, "cs_scatter");

    let block_hist = create_storage_buffer::<u32>(device, "radix block_hist", (num_blocks * RADIX) as usize, wgpu::BufferUsages::empty());
    let local_rank = create_storage_buffer::<u32>(device, "radix local_rank", num_keys as usize, wgpu::BufferUsages::empty());
    let digit_totals = create_storage_buffer::<u32>(device, "radix digit_totals", RADIX as usize, wgpu::BufferUsages::empty());
    let digit_offsets = create_storage_buffer::<u32>(device, "radix digit_offsets", RADIX as usize, wgpu::BufferUsages::empty());
    let block_digit_base =
        create_storage_buffer::<u32>(device, "radix block_digit_base", (num_blocks * RADIX) as usize, wgpu::BufferUsages::empty());

    let mut keys_a = keys;
    let mut payload_a = payload;
    let usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    let mut keys_b = create_storage_buffer::<u32>(device, "radix keys_b", num_keys as usize, usage);
    let mut payload_b = create_storage_buffer::<u32>(device, "radix payload_b", num_keys as usize, usage);

    for &shift in &PASSES {
        let uniforms = sort_count::Uniforms { shift, num_keys, num_blocks, _pad: 0 };
        let ubo = create_uniform_buffer(device, "radix pass uniforms", uniforms);

        let count_bg = bind_group(device, &count_pipeline, &[(0, &ubo), (1, &keys_a), (2, &block_hist), (3, &local_rank)]);
        dispatch_blocks(encoder, "sort_count", &count_pipeline, &count_bg, num_blocks);

        let reduce_bg = bind_group(device, &reduce_pipeline, &[(0, &ubo), (1, &block_hist), (2, &digit_totals)]);
        dispatch_digits(encoder, "sort_reduce", &reduce_pipeline, &reduce_bg);

        let scan_bg = bind_group(device, &scan_pipeline, &[(0, &digit_totals), (1, &digit_offsets)]);
        {
            let mut pass =
                encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("sort_scan"), timestamp_writes: None });
            pass.set_pipeline(&scan_pipeline);
            pass.set_bind_group(0, &scan_bg, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }

        let scan_add_bg =
            bind_group(device, &scan_add_pipeline, &[(0, &ubo), (1, &block_hist), (2, &digit_offsets), (3, &block_digit_base)]);
        dispatch_digits(encoder, "sort_scan_add", &scan_add_pipeline, &scan_add_bg);

        let scatter_bg = bind_group(
            device,
            &scatter_pipeline,
            &[
                (0, &ubo),
                (1, &keys_a),
                (2, &payload_a),
                (3, &local_rank),
                (4, &block_digit_base),
                (5, &keys_b),
                (6, &payload_b),
            ],
        );
        dispatch_blocks(encoder, "sort_scatter", &scatter_pipeline, &scatter_bg, num_blocks);

        std::mem::swap(&mut keys_a, &mut keys_b);
        std::mem::swap(&mut payload_a, &mut payload_b);
    }

    (keys_a, payload_a)
}

/// CPU reference for [`encode_depth_keys`], used by tests and by the render crate's
/// CPU-oracle comparisons. Mirrors `encode_keys.wgsl::encode_depth_key` bit for bit.
pub fn encode_depth_key_cpu(depth: f32) -> u32 {
    let d = if depth == 0.0 { 0.0_f32 } else { depth };
    let bits = d.to_bits();
    let mask = if (bits >> 31) == 1 { 0xFFFF_FFFFu32 } else { 0x8000_0000u32 };
    bits ^ mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_preserves_depth_order() {
        let depths = [-100.0f32, -1.0, -0.0, 0.0, f32::MIN_POSITIVE, 1.0, 100.0, f32::MAX];
        let keys: Vec<u32> = depths.iter().map(|&d| encode_depth_key_cpu(d)).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted, "keys must already be in ascending order for ascending depths");
    }

    #[test]
    fn negative_and_positive_zero_encode_identically() {
        assert_eq!(encode_depth_key_cpu(0.0), encode_depth_key_cpu(-0.0));
    }

    #[test]
    fn encoding_is_monotonic_across_random_samples() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut depths: Vec<f32> = (0..2000).map(|_| rng.random_range(-1.0e6..1.0e6)).collect();
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let keys: Vec<u32> = depths.iter().map(|&d| encode_depth_key_cpu(d)).collect();
        for w in keys.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }
}
