//! Procedural macro for generating WGSL kernel wrappers.
//!
//! # Basic usage
//!
//! Imports from the same directory are auto-discovered from `#import` statements
//! in the WGSL source, so usually only `source` needs to be given:
//!
//! ```ignore
//! #[wgsl_kernel(source = "src/shaders/rasterize.wgsl")]
//! pub struct Rasterize;
//! ```
//!
//! For imports that live in another crate, pass them explicitly:
//!
//! ```ignore
//! #[wgsl_kernel(
//!     source = "src/shaders/tile_fill.wgsl",
//!     includes = ["../splat-render/src/shaders/helpers.wgsl"],
//! )]
//! pub struct TileFill;
//! ```
//!
//! The macro extracts the entry point's workgroup size, any top-level `struct` and `const`
//! declarations, and the fully composed WGSL source, then emits a module with:
//! - `pub const WORKGROUP_SIZE: [u32; 3]`
//! - `bytemuck::Pod` mirrors of every WGSL struct (for building uniform/storage buffers)
//! - `pub const SHADER_SOURCE: &str` plus `pub fn create_shader_module`/`create_pipeline`
//!   helpers that build a `wgpu::ComputePipeline` with an automatically inferred layout.
use std::collections::HashSet;
use std::sync::OnceLock;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use regex::Regex;
use syn::{
    Expr, ExprLit, Fields, ItemStruct, Lit, Meta, Token,
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    spanned::Spanned,
};
use wgpu::naga::{self, common::wgsl::TypeContext};

struct WgslKernelArgs {
    source: String,
    includes: Vec<String>,
}

impl Parse for WgslKernelArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut source = None;
        let mut includes = Vec::new();

        for meta in Punctuated::<Meta, Token![,]>::parse_terminated(input)? {
            match meta {
                Meta::NameValue(nv) if nv.path.is_ident("source") => {
                    if let Expr::Lit(ExprLit { lit: Lit::Str(s), .. }) = &nv.value {
                        source = Some(s.value());
                    } else {
                        return Err(syn::Error::new(nv.value.span(), "expected string literal"));
                    }
                }
                Meta::NameValue(nv) if nv.path.is_ident("includes") => {
                    if let Expr::Array(arr) = &nv.value {
                        for elem in &arr.elems {
                            if let Expr::Lit(ExprLit { lit: Lit::Str(s), .. }) = elem {
                                includes.push(s.value());
                            } else {
                                return Err(syn::Error::new(elem.span(), "expected string literal"));
                            }
                        }
                    } else {
                        return Err(syn::Error::new(nv.value.span(), "expected array of strings"));
                    }
                }
                _ => {
                    return Err(syn::Error::new(
                        meta.span(),
                        "unknown attribute, expected `source` or `includes`",
                    ));
                }
            }
        }

        let source = source.ok_or_else(|| {
            syn::Error::new(proc_macro2::Span::call_site(), "missing `source` attribute")
        })?;
        Ok(WgslKernelArgs { source, includes })
    }
}

/// Extract `#import <name>` statements from a WGSL source (naga_oil syntax).
fn extract_import_names(source: &str) -> Vec<String> {
    static IMPORT_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = IMPORT_REGEX.get_or_init(|| {
        Regex::new(r"#import\s+([a-zA-Z_][a-zA-Z0-9_]*)(?:\s+as\s+[a-zA-Z_][a-zA-Z0-9_]*)?;?")
            .expect("valid regex")
    });
    re.captures_iter(source).map(|cap| cap[1].to_string()).collect()
}

fn make_valid_rust_import(value: &str) -> String {
    let v = value.replace("\"../", "").replace('"', "");
    std::path::Path::new(&v)
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or(&v)
        .to_owned()
}

fn rust_type_name(ty: naga::Handle<naga::Type>, ctx: &naga::proc::GlobalCtx) -> String {
    let wgsl_name = ctx.type_to_string(ty);
    match wgsl_name.as_str() {
        "i32" | "u32" | "f32" => wgsl_name,
        "atomic<u32>" => "u32".to_owned(),
        "atomic<i32>" => "i32".to_owned(),
        "vec2<f32>" => "[f32; 2]".to_owned(),
        "vec4<f32>" => "[f32; 4]".to_owned(),
        "mat4x4<f32>" => "[[f32; 4]; 4]".to_owned(),
        "vec2<u32>" => "[u32; 2]".to_owned(),
        "vec2<i32>" => "[i32; 2]".to_owned(),
        "vec3<u32>" => "[u32; 4]".to_owned(),
        "vec3<f32>" => "[f32; 4]".to_owned(),
        "vec4<u32>" => "[u32; 4]".to_owned(),
        other => panic!("Unsupported WGSL type in kernel struct: {other}"),
    }
}

fn alignment_of(ty: naga::Handle<naga::Type>, ctx: &naga::proc::GlobalCtx) -> usize {
    let wgsl_name = ctx.type_to_string(ty);
    match wgsl_name.as_str() {
        "i32" | "u32" | "f32" | "atomic<u32>" | "atomic<i32>" => 4,
        "vec2<f32>" | "vec2<u32>" | "vec2<i32>" => 8,
        "vec3<f32>" | "vec4<f32>" | "mat4x4<f32>" | "vec4<u32>" => 16,
        other => panic!("Unknown alignment for WGSL type: {other}"),
    }
}

struct IncludeInfo {
    source: String,
    file_path: String,
    as_name: String,
}

fn create_composer(includes: &[IncludeInfo]) -> naga_oil::compose::Composer {
    let mut composer =
        naga_oil::compose::Composer::default().with_capabilities(naga::valid::Capabilities::all());
    for include in includes {
        composer
            .add_composable_module(naga_oil::compose::ComposableModuleDescriptor {
                source: &include.source,
                file_path: &include.file_path,
                as_name: Some(include.as_name.clone()),
                ..Default::default()
            })
            .expect("failed to add composable module");
    }
    composer
}

struct ExtractedType {
    name: String,
    alignment: usize,
    fields: Vec<(String, String)>,
}

struct ExtractedConstant {
    name: String,
    rust_type: String,
    value: String,
}

struct ShaderInfo {
    workgroup_size: [u32; 3],
    types: Vec<ExtractedType>,
    constants: Vec<ExtractedConstant>,
    wgsl: String,
}

fn extract_shader_info(source: &str, source_path: &str, includes: &[IncludeInfo]) -> ShaderInfo {
    let mut composer = create_composer(includes);
    let module = composer
        .make_naga_module(naga_oil::compose::NagaModuleDescriptor {
            source,
            file_path: source_path,
            ..Default::default()
        })
        .expect("failed to compile WGSL kernel");

    let entries = &module.entry_points;
    assert!(entries.len() == 1, "kernel must have exactly one entry point");
    let workgroup_size = entries[0].workgroup_size;
    let ctx = &module.to_ctx();

    let mut constants = Vec::new();
    for (_, constant) in module.constants.iter() {
        let Some(name) = constant.name.clone() else { continue };
        let type_and_value = match module.global_expressions[constant.init] {
            naga::Expression::Literal(literal) => match literal {
                naga::Literal::F32(v) => Some(("f32", format!("{v}f32"))),
                naga::Literal::U32(v) => Some(("u32", format!("{v}u32"))),
                naga::Literal::I32(v) => Some(("i32", format!("{v}i32"))),
                naga::Literal::Bool(v) => Some(("bool", format!("{v}"))),
                _ => None,
            },
            _ => None,
        };
        if let Some((rust_type, value)) = type_and_value {
            constants.push(ExtractedConstant { name, rust_type: rust_type.to_string(), value });
        }
    }

    let mut types = Vec::new();
    for (_, ty) in module.types.iter() {
        if let naga::TypeInner::Struct { members, .. } = &ty.inner {
            if members.is_empty() {
                continue;
            }
            let Some(name) = ty.name.clone() else { continue };
            let max_align = members.iter().map(|m| alignment_of(m.ty, ctx)).max().unwrap_or(4);
            let fields = members
                .iter()
                .map(|m| (m.name.clone().expect("named field"), rust_type_name(m.ty, ctx)))
                .collect();
            types.push(ExtractedType { name, alignment: max_align, fields });
        }
    }

    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::empty(), naga::valid::Capabilities::all())
        .validate(&module)
        .expect("kernel module failed validation");
    let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .expect("failed to re-emit WGSL");

    ShaderInfo { workgroup_size, types, constants, wgsl }
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn generate_code(
    struct_name: &syn::Ident,
    struct_vis: &syn::Visibility,
    info: &ShaderInfo,
    source_path: &str,
    include_paths: Vec<String>,
) -> TokenStream2 {
    let [wg_x, wg_y, wg_z] = info.workgroup_size;

    let type_defs: Vec<TokenStream2> = info
        .types
        .iter()
        .map(|t| {
            let name = format_ident!("{}", t.name);
            let align = proc_macro2::Literal::usize_unsuffixed(t.alignment);
            let fields: Vec<TokenStream2> = t
                .fields
                .iter()
                .map(|(fname, ftype)| {
                    let fname = format_ident!("{}", fname);
                    let ftype: TokenStream2 = ftype.parse().expect("valid rust type");
                    quote! { pub #fname: #ftype }
                })
                .collect();
            quote! {
                #[repr(C, align(#align))]
                #[derive(bytemuck::Pod, bytemuck::Zeroable, Debug, Clone, Copy)]
                pub struct #name {
                    #(#fields),*
                }
            }
        })
        .collect();

    let const_defs: Vec<TokenStream2> = info
        .constants
        .iter()
        .map(|c| {
            let name = format_ident!("{}", c.name);
            let ty: TokenStream2 = c.rust_type.parse().expect("valid rust type");
            let value: TokenStream2 = c.value.parse().expect("valid rust literal");
            quote! { pub const #name: #ty = #value; }
        })
        .collect();

    let wgsl = &info.wgsl;
    let struct_name_str = struct_name.to_string();

    let track_source =
        quote! { const _: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/", #source_path)); };
    let track_includes: Vec<TokenStream2> = include_paths
        .into_iter()
        .map(|p| quote! { const _: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/", #p)); })
        .collect();

    let mod_name = to_snake_case(&struct_name.to_string());
    let mod_ident = format_ident!("{}", mod_name);

    quote! {
        #struct_vis mod #mod_ident {
            #track_source
            #(#track_includes)*

            #(#type_defs)*
            #(#const_defs)*

            pub const SHADER_SOURCE: &str = #wgsl;

            /// Workgroup size declared by the kernel's `@compute @workgroup_size(..)`.
            pub const WORKGROUP_SIZE: [u32; 3] = [#wg_x, #wg_y, #wg_z];

            #[derive(Debug, Copy, Clone)]
            pub struct #struct_name;

            impl #struct_name {
                /// Compile the kernel's WGSL into a shader module.
                pub fn create_shader_module(device: &wgpu::Device) -> wgpu::ShaderModule {
                    device.create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(#struct_name_str),
                        source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
                    })
                }

                /// Build a compute pipeline with an automatically inferred bind group layout.
                pub fn create_pipeline(device: &wgpu::Device, entry_point: &str) -> wgpu::ComputePipeline {
                    let module = Self::create_shader_module(device);
                    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(#struct_name_str),
                        layout: None,
                        module: &module,
                        entry_point: Some(entry_point),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    })
                }
            }
        }

        #struct_vis use #mod_ident::#struct_name;
    }
}

/// Attribute macro for generating WGSL kernel wrappers.
///
/// `source` is a path to the `.wgsl` file (required, relative to `CARGO_MANIFEST_DIR`).
/// `includes` lists additional files to make available to `#import` (optional); imports
/// that live next to `source` are auto-discovered and do not need to be listed.
#[proc_macro_attribute]
pub fn wgsl_kernel(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as WgslKernelArgs);
    let input = parse_macro_input!(item as ItemStruct);

    if !matches!(input.fields, Fields::Unit) {
        return syn::Error::new(input.fields.span(), "wgsl_kernel structs must be unit structs")
            .to_compile_error()
            .into();
    }

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let source_path = std::path::Path::new(&manifest_dir).join(&args.source);
    let source = match std::fs::read_to_string(&source_path) {
        Ok(s) => s,
        Err(e) => {
            return syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("failed to read '{}': {e}", source_path.display()),
            )
            .to_compile_error()
            .into();
        }
    };

    let import_names = extract_import_names(&source);
    let source_dir = source_path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| manifest_dir.clone().into());

    let explicit: HashSet<String> = args.includes.iter().map(|s| make_valid_rust_import(s)).collect();

    let mut include_infos = Vec::new();
    for import_name in &import_names {
        if explicit.contains(import_name) {
            continue;
        }
        let import_path = source_dir.join(format!("{import_name}.wgsl"));
        if import_path.exists() {
            let include_source = std::fs::read_to_string(&import_path).expect("readable import");
            let relative_path = import_path
                .strip_prefix(&manifest_dir)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| import_path.to_string_lossy().to_string());
            include_infos.push(IncludeInfo {
                source: include_source,
                file_path: relative_path,
                as_name: import_name.clone(),
            });
        }
    }
    for include in &args.includes {
        let include_path = std::path::Path::new(&manifest_dir).join(include);
        let include_source = match std::fs::read_to_string(&include_path) {
            Ok(s) => s,
            Err(e) => {
                return syn::Error::new(
                    proc_macro2::Span::call_site(),
                    format!("failed to read include '{}': {e}", include_path.display()),
                )
                .to_compile_error()
                .into();
            }
        };
        include_infos.push(IncludeInfo {
            source: include_source,
            file_path: include.clone(),
            as_name: make_valid_rust_import(include),
        });
    }

    let info = extract_shader_info(&source, &args.source, &include_infos);
    let all_include_paths: Vec<String> = include_infos.iter().map(|i| i.file_path.clone()).collect();
    generate_code(&input.ident, &input.vis, &info, &args.source, all_include_paths).into()
}
