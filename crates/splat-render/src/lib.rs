//! GPU rasterisation core for oriented point-splat clouds (`spec.md` §2).
//!
//! Owns every GPU-resident buffer and texture the per-frame pipeline touches and drives
//! the whole dataflow B -> C -> D -> E -> F -> G -> H -> I (projector, depth-key encode,
//! radix sort, tile counter, exclusive scan, tile filler, tile rasteriser, presenter) from
//! a single [`Renderer`] value. The only host/device synchronisation point is the 4-byte
//! `total` readback between the scan and fill passes (§4.F); everything else stays on the
//! GPU for the lifetime of the frame.

use splat_kernel::wgsl_kernel;
use splat_kernel::{calc_dispatch_1d, calc_dispatch_2d, create_storage_buffer, create_uniform_buffer};
use thiserror::Error;

pub mod types;

pub use types::Splat;

#[wgsl_kernel(source = "src/shaders/project.wgsl")]
pub struct Project;

#[wgsl_kernel(source = "src/shaders/tile_count.wgsl")]
pub struct TileCount;

#[wgsl_kernel(source = "src/shaders/tile_fill.wgsl")]
pub struct TileFill;

#[wgsl_kernel(source = "src/shaders/tile_sort.wgsl")]
pub struct TileSort;

#[wgsl_kernel(source = "src/shaders/rasterize.wgsl")]
pub struct Rasterize;

#[wgsl_kernel(source = "src/shaders/clear.wgsl")]
pub struct Clear;

/// Tunable parameters exposed upstream (`spec.md` §6 "Configuration options").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    /// Square tile dimension in pixels. Default 16.
    pub tile_size: u32,
    /// Multiplier applied to the projected screen radius when forming a splat's AABB.
    /// Default 1.5 (~99% Gaussian energy capture).
    pub aabb_padding_factor: f32,
    /// Gaussian falloff standard deviation in units of the screen radius. Default 0.5.
    pub sigma: f32,
    /// Accumulated alpha at which the rasteriser stops walking a tile's segment.
    /// Default 0.99.
    pub early_alpha_cutoff: f32,
    /// Background colour composited behind every pixel, RGB in [0, 1].
    pub background_colour: [f32; 3],
    /// When set, skips the per-frame `total` readback and sizes `tile_indices` to this
    /// fixed capacity instead (`spec.md` §4.F / §9: "fully read-back-free mode"). The tile
    /// filler still clamps writes to the allocation, so an undersized value silently drops
    /// the excess intersections rather than corrupting memory, but the spec's "do not
    /// truncate silently" guidance means this should be sized generously (e.g. `num_splats
    /// * 8`) and monitored via [`RenderStats::total_intersections`] when the readback is
    /// later re-enabled for diagnosis.
    pub conservative_capacity: Option<u32>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tile_size: 16,
            aabb_padding_factor: 1.5,
            sigma: 0.5,
            early_alpha_cutoff: 0.99,
            background_colour: [0.0, 0.0, 0.0],
            conservative_capacity: None,
        }
    }
}

impl RenderConfig {
    fn validate(&self) -> Result<(), RenderError> {
        if self.tile_size == 0 {
            return Err(RenderError::InvalidConfig("tile_size must be positive".into()));
        }
        if !(self.aabb_padding_factor > 0.0) {
            return Err(RenderError::InvalidConfig("aabb_padding_factor must be positive".into()));
        }
        if !(self.sigma > 0.0) {
            return Err(RenderError::InvalidConfig("sigma must be positive".into()));
        }
        if !(self.early_alpha_cutoff > 0.0 && self.early_alpha_cutoff <= 1.0) {
            return Err(RenderError::InvalidConfig("early_alpha_cutoff must be in (0, 1]".into()));
        }
        Ok(())
    }
}

/// The external interface between the SDF/camera subsystem and this pipeline
/// (`spec.md` §6): a view-projection matrix, camera position, and viewport size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub camera_pos: [f32; 3],
    pub viewport: [f32; 2],
}

impl CameraUniforms {
    /// Build from `glam` types, the convention the rest of the ambient stack uses for
    /// camera/orbit math (kept external to this crate per `spec.md` §1's non-goals).
    pub fn from_glam(view_proj: glam::Mat4, camera_pos: glam::Vec3, viewport: [f32; 2]) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            camera_pos: camera_pos.into(),
            viewport,
        }
    }
}

/// Errors raised by [`Renderer`] construction/configuration. Per-frame anomalies
/// (`spec.md` §7 "Allocation exceeded", "Pathological overlap", "Empty scene") are not
/// modelled as errors: they are logged via `tracing` and resolved by clearing the frame,
/// reported back through [`RenderStats::frame_cleared`] rather than by returning `Err`.
/// Device loss is the host harness's concern (`spec.md` §5), surfaced through wgpu's own
/// device-lost callback rather than through this API.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render config: {0}")]
    InvalidConfig(String),
}

/// Diagnostic summary of one [`Renderer::render_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub num_splats: u32,
    /// `total` from the exclusive scan: the number of (splat, tile) pairs rasterised.
    pub total_intersections: u32,
    /// Set when the frame was cleared to background instead of rasterised (empty scene
    /// or a pathological-overlap anomaly), per `spec.md` §7.
    pub frame_cleared: bool,
}

fn bind_group(device: &wgpu::Device, pipeline: &wgpu::ComputePipeline, entries: &[(u32, wgpu::BindingResource<'_>)]) -> wgpu::BindGroup {
    let layout = pipeline.get_bind_group_layout(0);
    let entries: Vec<wgpu::BindGroupEntry> =
        entries.iter().map(|(binding, resource)| wgpu::BindGroupEntry { binding: *binding, resource: resource.clone() }).collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor { label: None, layout: &layout, entries: &entries })
}

fn buf(buffer: &wgpu::Buffer) -> wgpu::BindingResource<'_> {
    buffer.as_entire_binding()
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Owns every GPU resource the per-frame rasterisation pipeline touches: persistent
/// buffers sized to the current viewport/splat count, the output storage texture, and
/// the compiled pipelines. Constructed with a device/queue and destroyed by dropping it;
/// no process-wide state (`spec.md` §9, "Ad-hoc module-global state").
pub struct Renderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: RenderConfig,

    viewport: [u32; 2],
    num_tiles: [u32; 2],

    centre_radius_buf: wgpu::Buffer,
    colour_opacity_buf: wgpu::Buffer,
    normal_buf: wgpu::Buffer,
    splat_capacity: u32,

    tile_counts: wgpu::Buffer,
    tile_current_offsets: wgpu::Buffer,
    tile_indices: wgpu::Buffer,
    tile_indices_capacity: u32,

    output_texture: wgpu::Texture,
    output_view: wgpu::TextureView,

    project_pipeline: wgpu::ComputePipeline,
    tile_count_pipeline: wgpu::ComputePipeline,
    tile_fill_pipeline: wgpu::ComputePipeline,
    tile_sort_pipeline: wgpu::ComputePipeline,
    rasterize_pipeline: wgpu::ComputePipeline,
    clear_pipeline: wgpu::ComputePipeline,

    present_format: wgpu::TextureFormat,
    present_pipeline: wgpu::RenderPipeline,
    present_bind_group_layout: wgpu::BindGroupLayout,
    present_sampler: wgpu::Sampler,
}

impl Renderer {
    /// `present_format` is the swap-chain's surface format (Component I blits the
    /// RGBA8-unorm storage texture into it); the core never acquires a swap-chain image
    /// itself (`spec.md` §1 non-goals).
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        config: RenderConfig,
        viewport: [u32; 2],
        present_format: wgpu::TextureFormat,
    ) -> Result<Self, RenderError> {
        config.validate()?;

        let num_tiles = Self::tile_grid(viewport, config.tile_size);
        let num_tiles_total = (num_tiles[0] * num_tiles[1]).max(1);

        let tile_counts = create_storage_buffer::<u32>(&device, "tile counts", num_tiles_total as usize, wgpu::BufferUsages::COPY_DST);
        let tile_current_offsets =
            create_storage_buffer::<u32>(&device, "tile current offsets", num_tiles_total as usize, wgpu::BufferUsages::COPY_DST);
        let tile_indices = create_storage_buffer::<u32>(&device, "tile indices", 1, wgpu::BufferUsages::empty());

        let (output_texture, output_view) = Self::make_output_texture(&device, viewport);

        let project_pipeline = Project::create_pipeline(&device, "cs_project");
        let tile_count_pipeline = TileCount::create_pipeline(&device, "cs_tile_count");
        let tile_fill_pipeline = TileFill::create_pipeline(&device, "cs_tile_fill");
        let tile_sort_pipeline = TileSort::create_pipeline(&device, "cs_tile_sort");
        let rasterize_pipeline = Rasterize::create_pipeline(&device, "cs_rasterize");
        let clear_pipeline = Clear::create_pipeline(&device, "cs_clear");

        let (present_pipeline, present_bind_group_layout) = Self::make_present_pipeline(&device, present_format);
        let present_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("present sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let centre_radius_buf = create_storage_buffer::<types::CentreRadius>(&device, "centre_radius", 1, wgpu::BufferUsages::COPY_DST);
        let colour_opacity_buf = create_storage_buffer::<types::ColourOpacity>(&device, "colour_opacity", 1, wgpu::BufferUsages::COPY_DST);
        let normal_buf = create_storage_buffer::<types::Normal>(&device, "normal", 1, wgpu::BufferUsages::COPY_DST);

        Ok(Self {
            device,
            queue,
            config,
            viewport,
            num_tiles,
            centre_radius_buf,
            colour_opacity_buf,
            normal_buf,
            splat_capacity: 1,
            tile_counts,
            tile_current_offsets,
            tile_indices,
            tile_indices_capacity: 1,
            output_texture,
            output_view,
            project_pipeline,
            tile_count_pipeline,
            tile_fill_pipeline,
            tile_sort_pipeline,
            rasterize_pipeline,
            clear_pipeline,
            present_format,
            present_pipeline,
            present_bind_group_layout,
            present_sampler,
        })
    }

    pub fn config(&self) -> RenderConfig {
        self.config
    }

    pub fn viewport(&self) -> [u32; 2] {
        self.viewport
    }

    fn tile_grid(viewport: [u32; 2], tile_size: u32) -> [u32; 2] {
        [viewport[0].div_ceil(tile_size).max(1), viewport[1].div_ceil(tile_size).max(1)]
    }

    fn make_output_texture(device: &wgpu::Device, viewport: [u32; 2]) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("splat-render output"),
            size: wgpu::Extent3d { width: viewport[0].max(1), height: viewport[1].max(1), depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn make_present_pipeline(device: &wgpu::Device, format: wgpu::TextureFormat) -> (wgpu::RenderPipeline, wgpu::BindGroupLayout) {
        // present.wgsl has two entry points (vertex + fragment), which `#[wgsl_kernel]`
        // cannot wrap (it assumes exactly one compute entry point), so it is built by hand.
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("present"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/present.wgsl").into()),
        });
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("present bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("present pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("present"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_present"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_present"),
                targets: &[Some(wgpu::ColorTargetState { format, blend: None, write_mask: wgpu::ColorWrites::ALL })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        (pipeline, bind_group_layout)
    }

    /// Rebuilds the viewport-dependent allocations: the tile grid (and its counters),
    /// and the output texture. Called on a swap-chain/window resize (`spec.md` §7
    /// "Viewport resize").
    pub fn resize(&mut self, viewport: [u32; 2]) {
        if viewport == self.viewport {
            return;
        }
        self.viewport = viewport;
        self.num_tiles = Self::tile_grid(viewport, self.config.tile_size);
        let num_tiles_total = (self.num_tiles[0] * self.num_tiles[1]).max(1);

        self.tile_counts = create_storage_buffer::<u32>(&self.device, "tile counts", num_tiles_total as usize, wgpu::BufferUsages::COPY_DST);
        self.tile_current_offsets =
            create_storage_buffer::<u32>(&self.device, "tile current offsets", num_tiles_total as usize, wgpu::BufferUsages::COPY_DST);

        let (texture, view) = Self::make_output_texture(&self.device, viewport);
        self.output_texture = texture;
        self.output_view = view;
    }

    pub fn output_texture(&self) -> &wgpu::Texture {
        &self.output_texture
    }

    fn ensure_splat_capacity(&mut self, num_splats: u32) {
        if num_splats <= self.splat_capacity {
            return;
        }
        let capacity = num_splats;
        self.centre_radius_buf =
            create_storage_buffer::<types::CentreRadius>(&self.device, "centre_radius", capacity as usize, wgpu::BufferUsages::COPY_DST);
        self.colour_opacity_buf =
            create_storage_buffer::<types::ColourOpacity>(&self.device, "colour_opacity", capacity as usize, wgpu::BufferUsages::COPY_DST);
        self.normal_buf = create_storage_buffer::<types::Normal>(&self.device, "normal", capacity as usize, wgpu::BufferUsages::COPY_DST);
        self.splat_capacity = capacity;
    }

    fn ensure_tile_indices_capacity(&mut self, required: u32) {
        if required <= self.tile_indices_capacity {
            return;
        }
        let capacity = required.max(self.tile_indices_capacity.saturating_mul(2));
        self.tile_indices = create_storage_buffer::<u32>(&self.device, "tile indices", capacity as usize, wgpu::BufferUsages::empty());
        self.tile_indices_capacity = capacity;
    }

    /// Uploads the per-frame splat buffer (Component A), splitting it into the three
    /// tightly packed GPU records `upload_splats`'s doc on [`types::Splat`] describes.
    fn upload_splats(&mut self, splats: &[Splat]) {
        self.ensure_splat_capacity(splats.len() as u32);
        let centre_radius: Vec<types::CentreRadius> = splats.iter().map(Splat::centre_radius).collect();
        let colour_opacity: Vec<types::ColourOpacity> = splats.iter().map(Splat::colour_opacity).collect();
        let normals: Vec<types::Normal> = splats.iter().map(Splat::normal_record).collect();
        self.queue.write_buffer(&self.centre_radius_buf, 0, bytemuck::cast_slice(&centre_radius));
        self.queue.write_buffer(&self.colour_opacity_buf, 0, bytemuck::cast_slice(&colour_opacity));
        self.queue.write_buffer(&self.normal_buf, 0, bytemuck::cast_slice(&normals));
    }

    fn clear_params(&self) -> clear::ClearParams {
        let [bg_r, bg_g, bg_b] = self.config.background_colour;
        clear::ClearParams {
            background_colour: [bg_r, bg_g, bg_b, 1.0],
            viewport: [self.viewport[0] as f32, self.viewport[1] as f32],
            _pad0: 0.0,
            _pad1: 0.0,
        }
    }

    fn encode_clear(&self, encoder: &mut wgpu::CommandEncoder) {
        let ubo = create_uniform_buffer(&self.device, "clear params", self.clear_params());
        let bg = bind_group(&self.device, &self.clear_pipeline, &[(0, buf(&ubo)), (1, wgpu::BindingResource::TextureView(&self.output_view))]);
        let (x, y, z) = calc_dispatch_2d(self.viewport, clear::WORKGROUP_SIZE[0..2].try_into().expect("2 dims"));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("clear"), timestamp_writes: None });
        pass.set_pipeline(&self.clear_pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(x, y, z);
    }

    /// Runs one frame of the pipeline end to end (`spec.md` §2 "Control flow per frame"):
    /// project, encode+sort depth keys, bin into tiles, scan, fill+sort segments,
    /// rasterise, ready for [`Renderer::present`]. Never panics on a frame's worth of
    /// anomalous data; instead it logs and reports [`RenderStats::frame_cleared`].
    pub fn render_frame(&mut self, splats: &[Splat], camera: &CameraUniforms) -> RenderStats {
        let num_splats = splats.len() as u32;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("splat-render frame") });

        if num_splats == 0 {
            tracing::debug!("empty scene (0 splats); clearing to background");
            self.encode_clear(&mut encoder);
            self.queue.submit(Some(encoder.finish()));
            return RenderStats { num_splats: 0, total_intersections: 0, frame_cleared: true };
        }

        self.upload_splats(splats);

        let projected = create_storage_buffer::<project::ProjectedSplat>(&self.device, "projected", num_splats as usize, wgpu::BufferUsages::empty());
        let depths = create_storage_buffer::<f32>(&self.device, "depths", num_splats as usize, wgpu::BufferUsages::empty());
        let payload = create_storage_buffer::<u32>(&self.device, "payload", num_splats as usize, wgpu::BufferUsages::empty());

        let camera_params = project::CameraParams {
            view_proj: camera.view_proj,
            camera_pos_splats: [camera.camera_pos[0], camera.camera_pos[1], camera.camera_pos[2], f32::from_bits(num_splats)],
            viewport: camera.viewport,
            aabb_padding_factor: self.config.aabb_padding_factor,
        };
        let camera_ubo = create_uniform_buffer(&self.device, "camera params", camera_params);
        let project_bg = bind_group(
            &self.device,
            &self.project_pipeline,
            &[(0, buf(&camera_ubo)), (1, buf(&self.centre_radius_buf)), (2, buf(&projected)), (3, buf(&depths)), (4, buf(&payload))],
        );
        {
            let (x, y, z) = calc_dispatch_1d(num_splats, project::WORKGROUP_SIZE[0]);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("project"), timestamp_writes: None });
            pass.set_pipeline(&self.project_pipeline);
            pass.set_bind_group(0, &project_bg, &[]);
            pass.dispatch_workgroups(x, y, z);
        }

        let keys = splat_sort::encode_depth_keys(&self.device, &mut encoder, &depths, num_splats);
        let (_sorted_keys, sorted_indices) = splat_sort::radix_argsort(&self.device, &mut encoder, keys, payload, num_splats);

        encoder.clear_buffer(&self.tile_counts, 0, None);
        let num_tiles_total = self.num_tiles[0] * self.num_tiles[1];
        let tile_params = tile_count::TileParams {
            num_splats,
            num_tiles_x: self.num_tiles[0],
            num_tiles_y: self.num_tiles[1],
            tile_size: self.config.tile_size as f32,
        };
        let tile_count_ubo = create_uniform_buffer(&self.device, "tile count params", tile_params);
        let tile_count_bg = bind_group(
            &self.device,
            &self.tile_count_pipeline,
            &[(0, buf(&tile_count_ubo)), (1, buf(&projected)), (2, buf(&sorted_indices)), (3, buf(&self.tile_counts))],
        );
        {
            let (x, y, z) = calc_dispatch_1d(num_splats, tile_count::WORKGROUP_SIZE[0]);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("tile_count"), timestamp_writes: None });
            pass.set_pipeline(&self.tile_count_pipeline);
            pass.set_bind_group(0, &tile_count_bg, &[]);
            pass.dispatch_workgroups(x, y, z);
        }

        let (offsets, total_buf) = splat_prefix_sum::prefix_sum_with_total(&self.device, &mut encoder, &self.tile_counts, num_tiles_total);

        let total = match self.config.conservative_capacity {
            Some(capacity) => {
                self.queue.submit(Some(encoder.finish()));
                encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("splat-render frame (fill)") });
                capacity
            }
            None => {
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("total readback staging"),
                    size: 4,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(&total_buf, 0, &staging, 0, 4);
                // The one CPU<->GPU synchronisation point the core performs per frame
                // (`spec.md` §2, §5): size `tile_indices` exactly before the fill pass.
                self.queue.submit(Some(encoder.finish()));
                let total: u32 = splat_kernel::blocking_readback(&self.device, &staging);
                encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("splat-render frame (fill)") });

                // Only a measured total can be pathological; a caller-supplied
                // `conservative_capacity` is trusted as-is and has nothing to compare against.
                if total > num_splats.saturating_mul(50) {
                    tracing::warn!(total, num_splats, "pathological tile overlap; skipping frame");
                    self.encode_clear(&mut encoder);
                    self.queue.submit(Some(encoder.finish()));
                    return RenderStats { num_splats, total_intersections: total, frame_cleared: true };
                }

                total
            }
        };

        self.ensure_tile_indices_capacity(total.max(1));
        encoder.copy_buffer_to_buffer(&offsets, 0, &self.tile_current_offsets, 0, u64::from(num_tiles_total) * 4);

        let tile_fill_ubo = create_uniform_buffer(&self.device, "tile fill params", tile_params);
        let tile_fill_bg = bind_group(
            &self.device,
            &self.tile_fill_pipeline,
            &[
                (0, buf(&tile_fill_ubo)),
                (1, buf(&projected)),
                (2, buf(&sorted_indices)),
                (3, buf(&self.tile_current_offsets)),
                (4, buf(&self.tile_indices)),
            ],
        );
        {
            let (x, y, z) = calc_dispatch_1d(num_splats, tile_fill::WORKGROUP_SIZE[0]);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("tile_fill"), timestamp_writes: None });
            pass.set_pipeline(&self.tile_fill_pipeline);
            pass.set_bind_group(0, &tile_fill_bg, &[]);
            pass.dispatch_workgroups(x, y, z);
        }

        let sort_params = tile_sort::SortParams { num_tiles: num_tiles_total, _pad0: 0, _pad1: 0, _pad2: 0 };
        let sort_ubo = create_uniform_buffer(&self.device, "tile sort params", sort_params);
        let tile_sort_bg = bind_group(
            &self.device,
            &self.tile_sort_pipeline,
            &[(0, buf(&sort_ubo)), (1, buf(&offsets)), (2, buf(&self.tile_counts)), (3, buf(&projected)), (4, buf(&self.tile_indices))],
        );
        {
            let (x, y, z) = splat_kernel::calc_dispatch_1d(num_tiles_total, 1);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("tile_sort"), timestamp_writes: None });
            pass.set_pipeline(&self.tile_sort_pipeline);
            pass.set_bind_group(0, &tile_sort_bg, &[]);
            pass.dispatch_workgroups(x, y, z);
        }

        let [bg_r, bg_g, bg_b] = self.config.background_colour;
        let raster_params = rasterize::RasterParams {
            background_colour: [bg_r, bg_g, bg_b, 1.0],
            viewport: [self.viewport[0] as f32, self.viewport[1] as f32],
            num_tiles_x: self.num_tiles[0],
            num_tiles_y: self.num_tiles[1],
            tile_size: self.config.tile_size as f32,
            sigma: self.config.sigma,
            early_alpha_cutoff: self.config.early_alpha_cutoff,
        };
        let raster_ubo = create_uniform_buffer(&self.device, "raster params", raster_params);
        let raster_bg = bind_group(
            &self.device,
            &self.rasterize_pipeline,
            &[
                (0, buf(&raster_ubo)),
                (1, buf(&projected)),
                (2, buf(&self.colour_opacity_buf)),
                (3, buf(&self.normal_buf)),
                (4, buf(&offsets)),
                (5, buf(&self.tile_counts)),
                (6, buf(&self.tile_indices)),
                (7, wgpu::BindingResource::TextureView(&self.output_view)),
            ],
        );
        {
            let (x, y, z) = calc_dispatch_2d(self.viewport, rasterize::WORKGROUP_SIZE[0..2].try_into().expect("2 dims"));
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("rasterize"), timestamp_writes: None });
            pass.set_pipeline(&self.rasterize_pipeline);
            pass.set_bind_group(0, &raster_bg, &[]);
            pass.dispatch_workgroups(x, y, z);
        }

        self.queue.submit(Some(encoder.finish()));
        RenderStats { num_splats, total_intersections: total, frame_cleared: false }
    }

    /// Component I: blit the rendered storage texture into `target` (a swap-chain view).
    pub fn present(&self, encoder: &mut wgpu::CommandEncoder, target: &wgpu::TextureView) {
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present bind group"),
            layout: &self.present_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&self.output_view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.present_sampler) },
            ],
        });
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("present"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.present_pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.draw(0..3, 0..1);
    }

    /// Blocking readback of the output texture as tightly packed RGBA8 rows, for tests
    /// and offline diagnostics; never called on the per-frame path.
    pub fn read_pixels(&self) -> Vec<[u8; 4]> {
        let [width, height] = self.viewport;
        let unpadded_bytes_per_row = width * 4;
        let padded_bytes_per_row = align_up(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_pixels staging"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_pixels") });
        encoder.copy_texture_to_buffer(
            self.output_texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(padded_bytes_per_row), rows_per_image: Some(height) },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::PollType::Wait).expect("device poll failed");
        rx.recv().expect("map_async callback dropped").expect("failed to map staging buffer");
        let data = slice.get_mapped_range();

        let mut pixels = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            let start = (row * padded_bytes_per_row) as usize;
            for col in 0..width {
                let px_start = start + (col * 4) as usize;
                pixels.push([data[px_start], data[px_start + 1], data[px_start + 2], data[px_start + 3]]);
            }
        }
        drop(data);
        staging.unmap();
        pixels
    }
}

/// Pure-Rust reference functions mirroring the WGSL kernels bit for bit, used only by
/// tests (`spec.md` §8's CPU-oracle properties) and never on the render path.
pub mod oracle {
    /// Mirrors `tile_range` in `tile_count.wgsl`/`tile_fill.wgsl`. Returns `None` when the
    /// AABB touches no tile (off-screen, behind-camera, or degenerate).
    pub fn tile_range(
        bounds_min: [f32; 2],
        bounds_max: [f32; 2],
        tile_size: f32,
        num_tiles_x: u32,
        num_tiles_y: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        if bounds_min[0] >= bounds_max[0] || bounds_min[1] >= bounds_max[1] {
            return None;
        }
        let max_px_x = num_tiles_x as f32 * tile_size;
        let max_px_y = num_tiles_y as f32 * tile_size;
        if bounds_max[0] < 0.0 || bounds_min[0] > max_px_x || bounds_max[1] < 0.0 || bounds_min[1] > max_px_y {
            return None;
        }
        let clamp_tile = |v: f32, count: u32| ((v / tile_size).floor() as i64).clamp(0, i64::from(count) - 1) as u32;
        let min_tx = clamp_tile(bounds_min[0], num_tiles_x);
        let max_tx = clamp_tile(bounds_max[0], num_tiles_x);
        let min_ty = clamp_tile(bounds_min[1], num_tiles_y);
        let max_ty = clamp_tile(bounds_max[1], num_tiles_y);
        Some((min_tx, max_tx, min_ty, max_ty))
    }

    /// CPU reference for the count/fill passes: for every splat (in any order, since the
    /// result is order-independent before the per-tile depth sort), the full set of
    /// `(tile, splat)` pairs its AABB overlaps.
    pub fn reference_tile_pairs(
        bounds: &[([f32; 2], [f32; 2])],
        tile_size: f32,
        num_tiles_x: u32,
        num_tiles_y: u32,
    ) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        for (splat, &(bounds_min, bounds_max)) in bounds.iter().enumerate() {
            let Some((min_tx, max_tx, min_ty, max_ty)) = tile_range(bounds_min, bounds_max, tile_size, num_tiles_x, num_tiles_y) else {
                continue;
            };
            for ty in min_ty..=max_ty {
                for tx in min_tx..=max_tx {
                    pairs.push((ty * num_tiles_x + tx, splat as u32));
                }
            }
        }
        pairs
    }

    /// Mirrors the Gaussian-weighted "over" compositing law in `rasterize.wgsl`.
    pub fn composite_over(colour: [f32; 3], alpha: f32, lit_colour: [f32; 3], alpha_s: f32) -> ([f32; 3], f32) {
        let mut out = [0.0; 3];
        for c in 0..3 {
            out[c] = colour[c] * (1.0 - alpha_s) + lit_colour[c] * alpha_s;
        }
        (out, alpha * (1.0 - alpha_s) + alpha_s)
    }

    /// Mirrors `cs_rasterize`'s Gaussian weight.
    pub fn gaussian_weight(normalized_distance: f32, sigma: f32) -> f32 {
        (-0.5 * normalized_distance * normalized_distance / (sigma * sigma)).exp()
    }
}


#[cfg(all(test, not(target_family = "wasm")))]
mod gpu_tests {
    use super::*;

    async fn test_device() -> (wgpu::Device, wgpu::Queue) {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .expect("no GPU adapter available for render integration tests");
        adapter.request_device(&wgpu::DeviceDescriptor::default()).await.expect("failed to create device")
    }

    /// A camera looking down -z at the origin from `(0, 0, distance)`, framing a unit
    /// viewport-relative field of view. Good enough to place known splats at known
    /// screen positions without depending on any external camera module.
    fn look_at_origin(distance: f32, viewport: [u32; 2]) -> CameraUniforms {
        let eye = glam::Vec3::new(0.0, 0.0, distance);
        let view = glam::Mat4::look_at_rh(eye, glam::Vec3::ZERO, glam::Vec3::Y);
        let aspect = viewport[0] as f32 / viewport[1] as f32;
        let proj = glam::Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, aspect, 0.1, 100.0);
        CameraUniforms::from_glam(proj * view, eye, [viewport[0] as f32, viewport[1] as f32])
    }

    fn white_splat(centre: [f32; 3], radius: f32) -> Splat {
        Splat { centre, radius, colour: [1.0, 1.0, 1.0], opacity: 1.0, normal: [0.0, 0.0, 1.0] }
    }

    #[test]
    fn empty_scene_clears_to_background() {
        // S1 in spec.md §8.
        pollster::block_on(async {
            let (device, queue) = test_device().await;
            let viewport = [64, 64];
            let mut renderer =
                Renderer::new(device, queue, RenderConfig::default(), viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
            let camera = look_at_origin(5.0, viewport);
            let stats = renderer.render_frame(&[], &camera);
            assert_eq!(stats, RenderStats { num_splats: 0, total_intersections: 0, frame_cleared: true });

            let pixels = renderer.read_pixels();
            assert_eq!(pixels.len(), (viewport[0] * viewport[1]) as usize);
            assert!(pixels.iter().all(|&p| p == [0, 0, 0, 255]), "every pixel should be opaque background");
        });
    }

    #[test]
    fn single_centred_splat_lights_the_middle_and_leaves_the_corners_alone() {
        let viewport = [64, 64];
        pollster::block_on(async {
            let (device, queue) = test_device().await;
            let mut renderer =
                Renderer::new(device, queue, RenderConfig::default(), viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
            let camera = look_at_origin(5.0, viewport);
            let splats = [white_splat([0.0, 0.0, 0.0], 0.5)];
            let stats = renderer.render_frame(&splats, &camera);
            assert!(!stats.frame_cleared);
            assert!(stats.total_intersections > 0);

            let pixels = renderer.read_pixels();
            let centre_idx = (viewport[1] / 2 * viewport[0] + viewport[0] / 2) as usize;
            let corner_idx = 0usize;
            assert!(pixels[centre_idx][0] > 100, "splat should light up the centre pixel, got {:?}", pixels[centre_idx]);
            assert_eq!(pixels[corner_idx], [0, 0, 0, 255], "far corner is outside the splat's footprint");
        });
    }

    #[test]
    fn nearer_splat_composites_over_a_farther_one() {
        // S2 in spec.md §8.
        let viewport = [64, 64];
        pollster::block_on(async {
            let (device, queue) = test_device().await;
            let mut renderer =
                Renderer::new(device, queue, RenderConfig::default(), viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
            let camera = look_at_origin(10.0, viewport);
            let far = Splat { centre: [0.0, 0.0, -1.0], radius: 1.0, colour: [0.0, 1.0, 0.0], opacity: 1.0, normal: [0.0, 0.0, 1.0] };
            let near = Splat { centre: [0.0, 0.0, 1.0], radius: 1.0, colour: [1.0, 0.0, 0.0], opacity: 1.0, normal: [0.0, 0.0, 1.0] };
            let stats = renderer.render_frame(&[far, near], &camera);
            assert!(!stats.frame_cleared);

            let pixels = renderer.read_pixels();
            let centre_idx = (viewport[1] / 2 * viewport[0] + viewport[0] / 2) as usize;
            let [r, g, b, _] = pixels[centre_idx];
            assert!(r > g, "the nearer, fully opaque red splat should dominate over the farther green one, got rgb=({r},{g},{b})");
        });
    }

    #[test]
    fn resize_changes_the_output_texture_dimensions() {
        pollster::block_on(async {
            let (device, queue) = test_device().await;
            let mut renderer =
                Renderer::new(device, queue, RenderConfig::default(), [64, 64], wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
            renderer.resize([32, 48]);
            assert_eq!(renderer.viewport(), [32, 48]);
            let camera = look_at_origin(5.0, [32, 48]);
            renderer.render_frame(&[], &camera);
            assert_eq!(renderer.read_pixels().len(), 32 * 48);
        });
    }

    #[test]
    fn conservative_capacity_skips_the_readback_and_still_renders() {
        let viewport = [64, 64];
        pollster::block_on(async {
            let (device, queue) = test_device().await;
            let config = RenderConfig { conservative_capacity: Some(4096), ..RenderConfig::default() };
            let mut renderer = Renderer::new(device, queue, config, viewport, wgpu::TextureFormat::Rgba8Unorm).expect("valid config");
            let camera = look_at_origin(5.0, viewport);
            let splats = [white_splat([0.0, 0.0, 0.0], 0.5)];
            let stats = renderer.render_frame(&splats, &camera);
            assert!(!stats.frame_cleared);
            assert_eq!(stats.total_intersections, 4096, "conservative mode reports its fixed capacity, not a measured total");
        });
    }
}
