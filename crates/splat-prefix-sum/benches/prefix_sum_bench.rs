//! Benchmarks for the hierarchical prefix sum.
//!
//! Requires a GPU adapter; run with `cargo bench -p splat-prefix-sum`.

use rand::Rng;
use splat_kernel::{blocking_readback_vec, create_storage_buffer};
use splat_prefix_sum::prefix_sum;

fn main() {
    divan::main();
}

fn test_device() -> (wgpu::Device, wgpu::Queue) {
    pollster::block_on(async {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .expect("no GPU adapter available");
        adapter.request_device(&wgpu::DeviceDescriptor::default()).await.expect("failed to create device")
    })
}

#[divan::bench(args = [512, 8192, 1_000_000])]
fn scan(bencher: divan::Bencher, n: u32) {
    let (device, queue) = test_device();
    let mut rng = rand::rng();
    let values: Vec<u32> = (0..n).map(|_| rng.random_range(0..8)).collect();
    let input = create_storage_buffer::<u32>(&device, "bench input", n as usize, wgpu::BufferUsages::COPY_DST);
    queue.write_buffer(&input, 0, bytemuck::cast_slice(&values));

    bencher.bench_local(|| {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        let out = prefix_sum(&device, &mut encoder, &input, n);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: n as u64 * 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&out, 0, &staging, 0, n as u64 * 4);
        queue.submit(Some(encoder.finish()));
        let _: Vec<u32> = blocking_readback_vec(&device, &staging, n as usize);
    });
}
