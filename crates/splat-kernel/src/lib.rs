//! Runtime infrastructure shared by the sort, prefix-sum and render crates.
//!
//! This crate provides:
//! - the `#[wgsl_kernel]` proc macro for turning a `.wgsl` file into a typed Rust wrapper
//! - dispatch-size arithmetic for 1-D and 3-D compute dispatches
//! - small helpers for creating POD storage/uniform buffers and for the one blocking
//!   readback the core pipeline performs per frame (the 4-byte `total` between the scan
//!   and fill passes, see `spec.md` §4.F)

pub use bytemuck;
pub use splat_kernel_macros::wgsl_kernel;

/// WebGPU's per-dimension workgroup dispatch limit.
pub const MAX_DISPATCH_PER_DIM: u32 = 65_535;

/// Calculate a (possibly 2-D tiled) dispatch size for a 1-D array of `num_elements` items
/// processed `workgroup_size` at a time, tiling into the y dimension at a fixed stride of
/// `MAX_DISPATCH_PER_DIM` if the naive 1-D dispatch would exceed the device's per-dimension
/// workgroup limit. The fixed stride (rather than a sqrt-balanced one) is what lets every
/// kernel unflatten its invocation id back to a flat element index from compile-time
/// constants alone: `gid.x + gid.y * (MAX_DISPATCH_PER_DIM * workgroup_size)`.
pub fn calc_dispatch_1d(num_elements: u32, workgroup_size: u32) -> (u32, u32, u32) {
    let total_wgs = num_elements.div_ceil(workgroup_size.max(1));
    if total_wgs <= MAX_DISPATCH_PER_DIM {
        (total_wgs.max(1), 1, 1)
    } else {
        (MAX_DISPATCH_PER_DIM, total_wgs.div_ceil(MAX_DISPATCH_PER_DIM), 1)
    }
}

/// Calculate the dispatch size for a 2-D grid of `size` elements with the given per-axis
/// workgroup size (used by the tile rasteriser, one thread per pixel).
pub fn calc_dispatch_2d(size: [u32; 2], workgroup_size: [u32; 2]) -> (u32, u32, u32) {
    (
        size[0].div_ceil(workgroup_size[0].max(1)),
        size[1].div_ceil(workgroup_size[1].max(1)),
        1,
    )
}

/// Create a GPU storage buffer initialised from a POD slice.
pub fn create_storage_buffer_init<T: bytemuck::Pod>(
    device: &wgpu::Device,
    label: &str,
    data: &[T],
    extra_usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: wgpu::BufferUsages::STORAGE | extra_usage,
    })
}

/// Create a zeroed GPU storage buffer holding `len` elements of `T`.
pub fn create_storage_buffer<T: bytemuck::Pod>(
    device: &wgpu::Device,
    label: &str,
    len: usize,
    extra_usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    let size = (len * std::mem::size_of::<T>()).max(std::mem::size_of::<T>()) as u64;
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE | extra_usage,
        mapped_at_creation: false,
    })
}

/// Create a uniform buffer initialised from a single POD value.
pub fn create_uniform_buffer<T: bytemuck::Pod>(device: &wgpu::Device, label: &str, value: T) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(&value),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

/// Block on the one blocking readback the pipeline performs per frame: copy `buffer`
/// (already `COPY_SRC`) into a transient `MAP_READ` staging buffer and read it back as
/// `T`. The caller is responsible for submitting the copy command before calling this.
///
/// This is the "single small readback between F and G" of `spec.md` §2; it is not used
/// anywhere else in the per-frame pipeline.
pub fn blocking_readback<T: bytemuck::Pod>(device: &wgpu::Device, staging: &wgpu::Buffer) -> T {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::PollType::Wait).expect("device poll failed");
    rx.recv()
        .expect("map_async callback dropped")
        .expect("failed to map staging buffer");
    let data = slice.get_mapped_range();
    let value = *bytemuck::from_bytes::<T>(&data[..std::mem::size_of::<T>()]);
    drop(data);
    staging.unmap();
    value
}

/// Read an entire buffer back to the CPU, blocking. Used only by tests and by the
/// diagnostic CPU-oracle comparisons; never on the hot per-frame path.
pub fn blocking_readback_vec<T: bytemuck::Pod>(device: &wgpu::Device, staging: &wgpu::Buffer, len: usize) -> Vec<T> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::PollType::Wait).expect("device poll failed");
    rx.recv()
        .expect("map_async callback dropped")
        .expect("failed to map staging buffer");
    let data = slice.get_mapped_range();
    let values = bytemuck::cast_slice::<u8, T>(&data[..len * std::mem::size_of::<T>()]).to_vec();
    drop(data);
    staging.unmap();
    values
}
