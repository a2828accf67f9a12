//! Host-side splat buffer layouts.
//!
//! These are written by hand rather than through `#[wgsl_kernel]`: the macro mirrors
//! named WGSL structs field-by-field, and its `vec3<f32> -> [f32; 4]` mapping only
//! stays byte-compatible with WGSL's true (12-byte) vec3 size when no scalar field
//! follows a vec3 field in the same struct. The buffers below are read on the GPU
//! side as bare `array<vec4<f32>>`, so there is no named WGSL struct to mirror in the
//! first place, and bytemuck only cares about the raw 16 bytes per record matching.

use bytemuck::{Pod, Zeroable};

/// One splat's world-space centre and isotropic radius, packed to match a GPU-side
/// `array<vec4<f32>>` read as `(xyz = centre, w = radius)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CentreRadius {
    pub centre: [f32; 3],
    pub radius: f32,
}

/// One splat's base colour and opacity, packed as `(xyz = colour, w = opacity)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColourOpacity {
    pub colour: [f32; 3],
    pub opacity: f32,
}

/// One splat's shading normal. The trailing scalar is unused padding, not a second
/// field, so this is just a 16-byte record and carries no layout hazard.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Normal {
    pub normal: [f32; 3],
    pub _pad: f32,
}

/// One splat as the caller supplies it; `Renderer::upload_splats` splits this into
/// the three tightly packed GPU buffers above.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splat {
    pub centre: [f32; 3],
    pub radius: f32,
    pub colour: [f32; 3],
    pub opacity: f32,
    pub normal: [f32; 3],
}

impl Splat {
    pub fn centre_radius(&self) -> CentreRadius {
        CentreRadius {
            centre: self.centre,
            radius: self.radius,
        }
    }

    pub fn colour_opacity(&self) -> ColourOpacity {
        ColourOpacity {
            colour: self.colour,
            opacity: self.opacity,
        }
    }

    pub fn normal_record(&self) -> Normal {
        Normal {
            normal: self.normal,
            _pad: 0.0,
        }
    }
}
