//! End-to-end benchmarks for the full per-frame rasterisation pipeline.
//!
//! Requires a GPU adapter; run with `cargo bench -p splat-render`.

use rand::Rng;
use splat_render::{CameraUniforms, RenderConfig, Renderer, Splat};

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

fn scattered_splats(n: u32) -> Vec<Splat> {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| Splat {
            centre: [rng.random_range(-4.0..4.0), rng.random_range(-4.0..4.0), rng.random_range(-4.0..4.0)],
            radius: rng.random_range(0.05..0.3),
            colour: [rng.random_range(0.0..1.0), rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)],
            opacity: rng.random_range(0.3..1.0),
            normal: glam::Vec3::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0))
                .normalize_or_zero()
                .into(),
        })
        .collect()
}

fn camera(viewport: [u32; 2]) -> CameraUniforms {
    let eye = glam::Vec3::new(0.0, 0.0, 10.0);
    let view = glam::Mat4::look_at_rh(eye, glam::Vec3::ZERO, glam::Vec3::Y);
    let aspect = viewport[0] as f32 / viewport[1] as f32;
    let proj = glam::Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, aspect, 0.1, 100.0);
    CameraUniforms::from_glam(proj * view, eye, [viewport[0] as f32, viewport[1] as f32])
}

#[divan::bench(args = [1_000, 50_000, 500_000])]
fn render_frame(bencher: divan::Bencher, n: u32) {
    let (device, queue) = test_device();
    let viewport = [1920, 1080];
    let mut renderer = Renderer::new(device, queue, RenderConfig::default(), viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
    let splats = scattered_splats(n);
    let cam = camera(viewport);

    bencher.bench_local(|| {
        renderer.render_frame(&splats, &cam);
    });
}

#[divan::bench(args = [[1280u32, 720], [1920, 1080], [3840, 2160]])]
fn render_frame_by_resolution(bencher: divan::Bencher, viewport: [u32; 2]) {
    let (device, queue) = test_device();
    let mut renderer = Renderer::new(device, queue, RenderConfig::default(), viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
    let splats = scattered_splats(100_000);
    let cam = camera(viewport);

    bencher.bench_local(|| {
        renderer.render_frame(&splats, &cam);
    });
}
