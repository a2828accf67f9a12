//! Benchmarks for the radix sort and depth-key encoder.
//!
//! Requires a GPU adapter; run with `cargo bench -p splat-sort`.

use rand::Rng;
use splat_kernel::{blocking_readback_vec, create_storage_buffer, create_storage_buffer_init};
use splat_sort::{encode_depth_keys, radix_argsort};

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

#[divan::bench(args = [1_000, 50_000, 500_000])]
fn radix_sort(bencher: divan::Bencher, n: u32) {
    let (device, queue) = test_device();
    let mut rng = rand::rng();
    let keys: Vec<u32> = (0..n).map(|_| rng.random::<u32>()).collect();
    let payload: Vec<u32> = (0..n).collect();
    let usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;

    bencher.bench_local(|| {
        let keys_buf = create_storage_buffer_init(&device, "bench keys", &keys, usage);
        let payload_buf = create_storage_buffer_init(&device, "bench payload", &payload, usage);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        let (sorted, _) = radix_argsort(&device, &mut encoder, keys_buf, payload_buf, n);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: n as u64 * 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&sorted, 0, &staging, 0, n as u64 * 4);
        queue.submit(Some(encoder.finish()));
        let _: Vec<u32> = blocking_readback_vec(&device, &staging, n as usize);
    });
}

#[divan::bench(args = [1_000, 500_000])]
fn depth_key_encode(bencher: divan::Bencher, n: u32) {
    let (device, queue) = test_device();
    let mut rng = rand::rng();
    let depths: Vec<f32> = (0..n).map(|_| rng.random_range(-1.0e4..1.0e4)).collect();
    let usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    let depths_buf = create_storage_buffer_init(&device, "bench depths", &depths, usage);

    bencher.bench_local(|| {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        let keys = encode_depth_keys(&device, &mut encoder, &depths_buf, n);
        let staging = create_storage_buffer::<u32>(&device, "bench staging", n as usize, wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST);
        encoder.copy_buffer_to_buffer(&keys, 0, &staging, 0, n as u64 * 4);
        queue.submit(Some(encoder.finish()));
        let _: Vec<u32> = blocking_readback_vec(&device, &staging, n as usize);
    });
}
