//! Hierarchical exclusive prefix sum over u32 arrays.
//!
//! Used to turn the tile counter's per-tile atomic counts into per-tile write offsets
//! (`spec.md` §4.F), and to size the scattered intersection list via the single CPU
//! readback the core pipeline performs each frame. Scans any length by recursively
//! scanning block totals when there is more than one 512-element block, the same
//! shape as the GPU-local radix sort's per-block passes in `splat-sort`.

use splat_kernel::bytemuck;
use splat_kernel::wgsl_kernel;
use splat_kernel::{create_storage_buffer, create_uniform_buffer};

#[wgsl_kernel(source = "src/shaders/scan_blocks.wgsl")]
pub struct ScanBlocks;

#[wgsl_kernel(source = "src/shaders/add_block_sums.wgsl")]
pub struct AddBlockSums;

#[wgsl_kernel(source = "src/shaders/sum_total.wgsl")]
pub struct SumTotal;

const BLOCK_ELEMS: u32 = 512;

fn bind_group(
    device: &wgpu::Device,
    pipeline: &wgpu::ComputePipeline,
    entries: &[(u32, &wgpu::Buffer)],
) -> wgpu::BindGroup {
    let layout = pipeline.get_bind_group_layout(0);
    let entries: Vec<wgpu::BindGroupEntry> = entries
        .iter()
        .map(|(binding, buffer)| wgpu::BindGroupEntry { binding: *binding, resource: buffer.as_entire_binding() })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor { label: None, layout: &layout, entries: &entries })
}

/// Exclusive prefix sum of `values_in` (length `n`), written into a freshly allocated
/// buffer of the same length. `values_in` only needs `STORAGE` usage; the result
/// buffer is created with `COPY_SRC | COPY_DST` so callers can chain further passes
/// or read it back.
pub fn prefix_sum(device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, values_in: &wgpu::Buffer, n: u32) -> wgpu::Buffer {
    let out = create_storage_buffer::<u32>(
        device,
        "prefix sum output",
        n as usize,
        wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
    );
    if n == 0 {
        return out;
    }

    let num_blocks = n.div_ceil(BLOCK_ELEMS).max(1);
    let block_sums = create_storage_buffer::<u32>(
        device,
        "prefix sum block_sums",
        num_blocks as usize,
        wgpu::BufferUsages::STORAGE,
    );

    let uniforms = scan_blocks::Uniforms { n, _pad0: 0, _pad1: 0, _pad2: 0 };
    let ubo = create_uniform_buffer(device, "prefix sum uniforms", uniforms);

    let scan_pipeline = ScanBlocks::create_pipeline(device, "cs_scan_blocks");
    let scan_bg = bind_group(device, &scan_pipeline, &[(0, &ubo), (1, values_in), (2, &out), (3, &block_sums)]);
    {
        let mut pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("scan_blocks"), timestamp_writes: None });
        pass.set_pipeline(&scan_pipeline);
        pass.set_bind_group(0, &scan_bg, &[]);
        pass.dispatch_workgroups(num_blocks, 1, 1);
    }

    if num_blocks > 1 {
        let scanned_block_sums = prefix_sum(device, encoder, &block_sums, num_blocks);
        let add_uniforms = add_block_sums::Uniforms { n, _pad0: 0, _pad1: 0, _pad2: 0 };
        let add_ubo = create_uniform_buffer(device, "add block sums uniforms", add_uniforms);
        let add_pipeline = AddBlockSums::create_pipeline(device, "cs_add_block_sums");
        let add_bg = bind_group(device, &add_pipeline, &[(0, &add_ubo), (1, &scanned_block_sums), (2, &out)]);
        let mut pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("add_block_sums"), timestamp_writes: None });
        pass.set_pipeline(&add_pipeline);
        pass.set_bind_group(0, &add_bg, &[]);
        pass.dispatch_workgroups(num_blocks, 1, 1);
    }

    out
}

/// Exclusive prefix sum of `counts_in`, plus a 1-element `COPY_SRC` buffer holding the
/// grand total (`offsets[n-1] + counts[n-1]`), the value the tile-binning pass reads
/// back to size the scattered intersection list.
pub fn prefix_sum_with_total(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    counts_in: &wgpu::Buffer,
    n: u32,
) -> (wgpu::Buffer, wgpu::Buffer) {
    let offsets = prefix_sum(device, encoder, counts_in, n);
    let total = create_storage_buffer::<u32>(device, "prefix sum total", 1, wgpu::BufferUsages::COPY_SRC);

    let uniforms = sum_total::Uniforms { n, _pad0: 0, _pad1: 0, _pad2: 0 };
    let ubo = create_uniform_buffer(device, "sum total uniforms", uniforms);
    let pipeline = SumTotal::create_pipeline(device, "cs_sum_total");
    let bg = bind_group(device, &pipeline, &[(0, &ubo), (1, counts_in), (2, &offsets), (3, &total)]);
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("sum_total"), timestamp_writes: None });
    pass.set_pipeline(&pipeline);
    pass.set_bind_group(0, &bg, &[]);
    pass.dispatch_workgroups(1, 1, 1);
    drop(pass);

    (offsets, total)
}

/// CPU reference exclusive scan, used by tests and by the render crate's oracle
/// comparisons.
pub fn prefix_sum_cpu(values: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(values.len());
    let mut running = 0u32;
    for &v in values {
        out.push(running);
        running = running.wrapping_add(v);
    }
    out
}
