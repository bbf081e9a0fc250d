// SPDX-License-Identifier: GPL-3.0-only

//! GLES compositor drawing decoded frames into scanout buffers.

use smithay::{
    backend::{
        allocator::{dmabuf::Dmabuf, Fourcc},
        renderer::{
            gles::{ffi, link_program, GlesError, GlesFrame, GlesRenderer, GlesTexture},
            Bind, Frame, ImportDma, ImportMem, Offscreen, Renderer, Texture,
        },
    },
    utils::{Buffer as BufferCoords, Physical, Rectangle, Size, Transform},
};
use tracing::{debug, warn};

use crate::{
    decoder::{DecodedFrame, FramePayload},
    keystone::Corner,
    pipeline::{
        swapchain::NativeSurface, CompositeError, CompositePass, Compositor, Overlay, RenderMode,
        WarpParams,
    },
};

pub static BLIT_VERTEX_SHADER: &str = include_str!("./shaders/blit.vert");
pub static BLIT_SHADER: &str = include_str!("./shaders/blit.frag");
pub static WARP_VERTEX_SHADER: &str = include_str!("./shaders/warp.vert");
pub static WARP_SHADER: &str = include_str!("./shaders/warp.frag");
pub static FULLSCREEN_VERTEX_SHADER: &str = include_str!("./shaders/fullscreen.vert");
pub static HOMOGRAPHY_SHADER: &str = include_str!("./shaders/homography.frag");
pub static SOLID_SHADER: &str = include_str!("./shaders/solid.frag");

/// Above this spread of projective weights the interpolated quad loses precision and the
/// per-pixel inverse mapping is used instead.
const MAX_Q_RATIO: f64 = 8.0;
const MARKER_SIZE: f64 = 12.0;

const BORDER_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
const MARKER_COLOR: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const ACTIVE_MARKER_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

const FULLSCREEN: [f32; 12] = [
    -1.0, -1.0, 1.0, -1.0, -1.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, -1.0, 1.0,
];

/// A swap chain surface whose buffers can be rendered to with GL.
pub trait DmabufSurface: NativeSurface {
    fn dmabuf(&self, slot: usize) -> Option<Dmabuf>;
}

#[derive(Debug, Clone, Copy)]
struct ShaderProgram {
    program: u32,
    a_position: i32,
    a_tex_q: i32,
    u_tex: i32,
    u_inverse: i32,
    u_size: i32,
    u_color: i32,
}

impl ShaderProgram {
    unsafe fn new(gl: &ffi::Gles2, vert: &str, frag: &str) -> Result<Self, GlesError> {
        let program = link_program(gl, vert, frag)?;
        Ok(ShaderProgram {
            program,
            a_position: gl.GetAttribLocation(program, c"position".as_ptr() as *const _),
            a_tex_q: gl.GetAttribLocation(program, c"tex_q".as_ptr() as *const _),
            u_tex: gl.GetUniformLocation(program, c"tex".as_ptr() as *const _),
            u_inverse: gl.GetUniformLocation(program, c"inverse".as_ptr() as *const _),
            u_size: gl.GetUniformLocation(program, c"size".as_ptr() as *const _),
            u_color: gl.GetUniformLocation(program, c"color".as_ptr() as *const _),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Programs {
    blit: ShaderProgram,
    warp: ShaderProgram,
    homography: ShaderProgram,
    solid: ShaderProgram,
}

impl Programs {
    fn compile(renderer: &mut GlesRenderer) -> Result<Programs, GlesError> {
        renderer.with_context(|gl| unsafe {
            Ok(Programs {
                blit: ShaderProgram::new(gl, BLIT_VERTEX_SHADER, BLIT_SHADER)?,
                warp: ShaderProgram::new(gl, WARP_VERTEX_SHADER, WARP_SHADER)?,
                homography: ShaderProgram::new(gl, FULLSCREEN_VERTEX_SHADER, HOMOGRAPHY_SHADER)?,
                solid: ShaderProgram::new(gl, FULLSCREEN_VERTEX_SHADER, SOLID_SHADER)?,
            })
        })?
    }
}

struct Source {
    texture: GlesTexture,
    flipped: bool,
    external: bool,
}

pub struct GlesCompositor {
    renderer: GlesRenderer,
    programs: Option<Programs>,
    upload: Option<(GlesTexture, (u32, u32))>,
    offscreen: Option<(GlesTexture, (u32, u32))>,
    warp_failed: bool,
}

impl std::fmt::Debug for GlesCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlesCompositor")
            .field("programs", &self.programs.is_some())
            .field("warp_failed", &self.warp_failed)
            .finish_non_exhaustive()
    }
}

impl GlesCompositor {
    pub fn new(mut renderer: GlesRenderer) -> Self {
        let programs = match Programs::compile(&mut renderer) {
            Ok(programs) => Some(programs),
            Err(err) => {
                warn!(
                    ?err,
                    "Failed to compile shaders, keystone correction is unavailable."
                );
                None
            }
        };
        GlesCompositor {
            renderer,
            programs,
            upload: None,
            offscreen: None,
            warp_failed: false,
        }
    }

    pub fn renderer(&mut self) -> &mut GlesRenderer {
        &mut self.renderer
    }

    fn import(&mut self, frame: &DecodedFrame) -> Result<Source, CompositeError> {
        let texture = match &frame.payload {
            FramePayload::Pixels(pixels) => {
                let dimensions = (frame.width, frame.height);
                if pixels.len() < frame.width as usize * frame.height as usize {
                    return Err(CompositeError::Unsupported);
                }
                let data: &[u8] = bytemuck::cast_slice(pixels);
                let size: Size<i32, BufferCoords> =
                    (frame.width as i32, frame.height as i32).into();
                match &self.upload {
                    Some((texture, uploaded)) if *uploaded == dimensions => {
                        self.renderer
                            .update_memory(texture, data, Rectangle::from_size(size))?;
                        texture.clone()
                    }
                    _ => {
                        let texture =
                            self.renderer
                                .import_memory(data, Fourcc::Xrgb8888, size, false)?;
                        debug!(width = frame.width, height = frame.height, "Created upload texture.");
                        self.upload = Some((texture.clone(), dimensions));
                        texture
                    }
                }
            }
            FramePayload::External(dmabuf) => self.renderer.import_dmabuf(dmabuf, None)?,
        };
        Ok(Source {
            texture,
            flipped: frame.flipped,
            external: frame.is_external(),
        })
    }

    fn offscreen_texture(&mut self, width: u32, height: u32) -> Result<GlesTexture, GlesError> {
        if let Some((texture, size)) = &self.offscreen {
            if *size == (width, height) {
                return Ok(texture.clone());
            }
        }
        let texture = Offscreen::<GlesTexture>::create_buffer(
            &mut self.renderer,
            Fourcc::Abgr8888,
            (width as i32, height as i32).into(),
        )?;
        self.offscreen = Some((texture.clone(), (width, height)));
        Ok(texture)
    }
}

impl<S: DmabufSurface> Compositor<S> for GlesCompositor {
    fn composite(
        &mut self,
        surface: &mut S,
        slot: usize,
        frame: Option<&DecodedFrame>,
        pass: &CompositePass,
    ) -> Result<(), CompositeError> {
        profiling::scope!("GlesCompositor::composite");
        let (width, height) = surface.size();
        let size: Size<i32, Physical> = (width as i32, height as i32).into();
        let mut dmabuf = surface
            .dmabuf(slot)
            .ok_or(CompositeError::MissingBuffer(slot))?;
        let source = frame.map(|frame| self.import(frame)).transpose()?;
        let programs = self.programs;

        let warp = match (pass.mode, &pass.warp, programs) {
            (RenderMode::Keystone, Some(warp), Some(programs)) if !self.warp_failed => {
                Some((warp, programs))
            }
            _ => None,
        };

        let Some((warp, programs)) = warp else {
            let mut target = self.renderer.bind(&mut dmabuf)?;
            let mut gl_frame = self.renderer.render(&mut target, size, Transform::Normal)?;
            draw_source(&mut gl_frame, programs.as_ref(), source.as_ref(), size)?;
            let sync = gl_frame.finish()?;
            let _ = sync.wait();
            return Ok(());
        };

        // first pass: the upright picture, filling the offscreen target
        let mut offscreen = self.offscreen_texture(width, height)?;
        {
            let mut target = self.renderer.bind(&mut offscreen)?;
            let mut gl_frame = self.renderer.render(&mut target, size, Transform::Normal)?;
            draw_source(&mut gl_frame, Some(&programs), source.as_ref(), size)?;
            let _ = gl_frame.finish()?;
        }

        // second pass: warp it onto the scanout buffer
        let tex_id = offscreen.tex_id();
        let mut target = self.renderer.bind(&mut dmabuf)?;
        let mut gl_frame = self.renderer.render(&mut target, size, Transform::Normal)?;
        let result = gl_frame.with_context(|gl| unsafe {
            scoped(gl, size, |gl| {
                gl.ClearColor(0.0, 0.0, 0.0, 1.0);
                gl.Clear(ffi::COLOR_BUFFER_BIT);
                draw_warp(gl, &programs, tex_id, warp, size);
                draw_overlay(gl, &programs.solid, pass, warp, size);
            })
        })?;
        let sync = gl_frame.finish()?;
        let _ = sync.wait();

        if let Err(err) = result {
            warn!(?err, "Perspective warp failed, disabling keystone correction.");
            self.warp_failed = true;
            return Err(err);
        }
        Ok(())
    }

    fn warp_available(&self) -> bool {
        self.programs.is_some() && !self.warp_failed
    }
}

/// Runs `draw` with the GL state our programs expect, restoring what smithay expects afterwards.
unsafe fn scoped(
    gl: &ffi::Gles2,
    size: Size<i32, Physical>,
    draw: impl FnOnce(&ffi::Gles2),
) -> Result<(), CompositeError> {
    let mut viewport = [0i32; 4];
    gl.GetIntegerv(ffi::VIEWPORT, viewport.as_mut_ptr());
    gl.Viewport(0, 0, size.w, size.h);
    gl.Disable(ffi::SCISSOR_TEST);
    gl.Disable(ffi::BLEND);
    gl.GetError(); // clear

    draw(gl);

    let err = gl.GetError();
    gl.BindTexture(ffi::TEXTURE_2D, 0);
    gl.Viewport(viewport[0], viewport[1], viewport[2], viewport[3]);
    gl.Enable(ffi::SCISSOR_TEST);
    gl.Enable(ffi::BLEND);

    if err != ffi::NO_ERROR {
        return Err(CompositeError::Draw(err));
    }
    Ok(())
}

fn draw_source(
    frame: &mut GlesFrame<'_, '_>,
    programs: Option<&Programs>,
    source: Option<&Source>,
    size: Size<i32, Physical>,
) -> Result<(), CompositeError> {
    let blit = programs
        .map(|programs| programs.blit)
        .filter(|_| source.is_some_and(|source| !source.external));
    let tex_id = source.map(|source| source.texture.tex_id());
    let flipped = source.is_some_and(|source| source.flipped);

    frame.with_context(|gl| unsafe {
        scoped(gl, size, |gl| {
            gl.ClearColor(0.0, 0.0, 0.0, 1.0);
            gl.Clear(ffi::COLOR_BUFFER_BIT);
            if let (Some(blit), Some(tex_id)) = (blit, tex_id) {
                draw_blit(gl, &blit, tex_id, flipped);
            }
        })
    })??;

    // external buffers may need a sampler only smithay knows about
    if let Some(source) = source.filter(|_| blit.is_none()) {
        let damage = [Rectangle::from_size(size)];
        frame.render_texture_from_to(
            &source.texture,
            Rectangle::from_size(source.texture.size()).to_f64(),
            Rectangle::from_size(size),
            &damage,
            &[],
            if source.flipped {
                Transform::Flipped180
            } else {
                Transform::Normal
            },
            1.0,
            None,
            &[],
        )?;
    }
    Ok(())
}

unsafe fn bind_texture(gl: &ffi::Gles2, program: &ShaderProgram, tex_id: u32) {
    gl.ActiveTexture(ffi::TEXTURE0);
    gl.BindTexture(ffi::TEXTURE_2D, tex_id);
    gl.TexParameteri(ffi::TEXTURE_2D, ffi::TEXTURE_MIN_FILTER, ffi::LINEAR as i32);
    gl.TexParameteri(ffi::TEXTURE_2D, ffi::TEXTURE_MAG_FILTER, ffi::LINEAR as i32);
    gl.TexParameteri(ffi::TEXTURE_2D, ffi::TEXTURE_WRAP_S, ffi::CLAMP_TO_EDGE as i32);
    gl.TexParameteri(ffi::TEXTURE_2D, ffi::TEXTURE_WRAP_T, ffi::CLAMP_TO_EDGE as i32);
    gl.Uniform1i(program.u_tex, 0);
}

unsafe fn draw_triangles(
    gl: &ffi::Gles2,
    program: &ShaderProgram,
    positions: &[f32],
    tex_q: Option<&[f32]>,
) {
    gl.BindBuffer(ffi::ARRAY_BUFFER, 0);
    gl.EnableVertexAttribArray(program.a_position as u32);
    gl.VertexAttribPointer(
        program.a_position as u32,
        2,
        ffi::FLOAT,
        ffi::FALSE,
        0,
        positions.as_ptr() as *const _,
    );
    if let Some(tex_q) = tex_q {
        gl.EnableVertexAttribArray(program.a_tex_q as u32);
        gl.VertexAttribPointer(
            program.a_tex_q as u32,
            3,
            ffi::FLOAT,
            ffi::FALSE,
            0,
            tex_q.as_ptr() as *const _,
        );
    }

    gl.DrawArrays(ffi::TRIANGLES, 0, (positions.len() / 2) as i32);

    gl.DisableVertexAttribArray(program.a_position as u32);
    if tex_q.is_some() {
        gl.DisableVertexAttribArray(program.a_tex_q as u32);
    }
}

/// Texture coordinates for the [`FULLSCREEN`] vertices, `v = 0` being the first row
/// of the texture. NDC `y = -1` is the first row of the target.
fn blit_tex_coords(flipped: bool) -> [f32; 18] {
    let mut tex_q = [0.0f32; 18];
    for (vertex, tex) in FULLSCREEN.chunks_exact(2).zip(tex_q.chunks_exact_mut(3)) {
        let (x, y) = (vertex[0], vertex[1]);
        let v = if flipped { (1.0 - y) * 0.5 } else { (1.0 + y) * 0.5 };
        tex.copy_from_slice(&[(x + 1.0) * 0.5, v, 1.0]);
    }
    tex_q
}

unsafe fn draw_blit(gl: &ffi::Gles2, program: &ShaderProgram, tex_id: u32, flipped: bool) {
    gl.UseProgram(program.program);
    bind_texture(gl, program, tex_id);
    draw_triangles(gl, program, &FULLSCREEN, Some(&blit_tex_coords(flipped)));
}

/// Whether the quad needs the per-pixel inverse mapping.
fn needs_inverse_mapping(q_weights: Option<[f64; 4]>) -> bool {
    let Some(q) = q_weights else {
        return true;
    };
    let max = q.iter().copied().fold(f64::MIN, f64::max);
    let min = q.iter().copied().fold(f64::MAX, f64::min);
    min <= 0.0 || max / min > MAX_Q_RATIO
}

/// Triangle vertices and projective texture coordinates of the warped quad.
fn warp_vertices(warp: &WarpParams) -> Option<([f32; 12], [f32; 18])> {
    let q = warp.q_weights?;
    // corners in TL, TR, BL, BR order with their texture corners
    let corner = |i: usize| {
        let p = warp.corners[i];
        let (u, v) = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)][i];
        (
            [(2.0 * p.x - 1.0) as f32, (2.0 * p.y - 1.0) as f32],
            [(u * q[i]) as f32, (v * q[i]) as f32, q[i] as f32],
        )
    };
    let mut positions = [0.0f32; 12];
    let mut tex_q = [0.0f32; 18];
    for (n, i) in [0, 1, 2, 1, 3, 2].into_iter().enumerate() {
        let (position, tex) = corner(i);
        positions[n * 2..n * 2 + 2].copy_from_slice(&position);
        tex_q[n * 3..n * 3 + 3].copy_from_slice(&tex);
    }
    Some((positions, tex_q))
}

unsafe fn draw_warp(
    gl: &ffi::Gles2,
    programs: &Programs,
    tex_id: u32,
    warp: &WarpParams,
    size: Size<i32, Physical>,
) {
    match warp_vertices(warp).filter(|_| !needs_inverse_mapping(warp.q_weights)) {
        Some((positions, tex_q)) => {
            let program = &programs.warp;
            gl.UseProgram(program.program);
            bind_texture(gl, program, tex_id);
            draw_triangles(gl, program, &positions, Some(&tex_q));
        }
        None => {
            let program = &programs.homography;
            gl.UseProgram(program.program);
            bind_texture(gl, program, tex_id);
            let inverse = warp.homography.inverse_f32();
            gl.UniformMatrix3fv(program.u_inverse, 1, ffi::FALSE, inverse.as_ptr());
            gl.Uniform2f(program.u_size, size.w as f32, size.h as f32);
            draw_triangles(gl, program, &FULLSCREEN, None);
        }
    }
}

fn to_ndc(point: (f64, f64), size: Size<i32, Physical>) -> [f32; 2] {
    [
        (2.0 * point.0 / size.w as f64 - 1.0) as f32,
        (2.0 * point.1 / size.h as f64 - 1.0) as f32,
    ]
}

/// Two triangles covering the pixel space quad `a b c d` (in strip order).
fn quad(points: [(f64, f64); 4], size: Size<i32, Physical>, out: &mut Vec<f32>) {
    for i in [0, 1, 2, 1, 3, 2] {
        out.extend_from_slice(&to_ndc(points[i], size));
    }
}

fn border_triangles(
    corners: &[cgmath::Point2<f64>; 4],
    width: f64,
    size: Size<i32, Physical>,
) -> Vec<f32> {
    let px = |i: usize| (corners[i].x * size.w as f64, corners[i].y * size.h as f64);
    let half = width / 2.0;
    let mut out = Vec::with_capacity(4 * 12);
    let [tl, tr, bl, br] = [px(0), px(1), px(2), px(3)];
    for (a, b) in [(tl, tr), (tr, br), (br, bl), (bl, tl)] {
        let (dx, dy) = (b.0 - a.0, b.1 - a.1);
        let length = dx.hypot(dy);
        if length < f64::EPSILON {
            continue;
        }
        let (dx, dy) = (dx / length * half, dy / length * half);
        let (nx, ny) = (-dy, dx);
        // extended by half the width so the corners close
        let a = (a.0 - dx, a.1 - dy);
        let b = (b.0 + dx, b.1 + dy);
        quad(
            [
                (a.0 + nx, a.1 + ny),
                (b.0 + nx, b.1 + ny),
                (a.0 - nx, a.1 - ny),
                (b.0 - nx, b.1 - ny),
            ],
            size,
            &mut out,
        );
    }
    out
}

fn marker_triangles(center: cgmath::Point2<f64>, size: Size<i32, Physical>) -> Vec<f32> {
    let (x, y) = (center.x * size.w as f64, center.y * size.h as f64);
    let half = MARKER_SIZE / 2.0;
    let mut out = Vec::with_capacity(12);
    quad(
        [
            (x - half, y - half),
            (x + half, y - half),
            (x - half, y + half),
            (x + half, y + half),
        ],
        size,
        &mut out,
    );
    out
}

unsafe fn draw_overlay(
    gl: &ffi::Gles2,
    program: &ShaderProgram,
    pass: &CompositePass,
    warp: &WarpParams,
    size: Size<i32, Physical>,
) {
    if pass.overlay.is_empty() {
        return;
    }
    gl.UseProgram(program.program);

    if pass.overlay.contains(Overlay::BORDER) {
        let [r, g, b, a] = BORDER_COLOR;
        gl.Uniform4f(program.u_color, r, g, b, a);
        let triangles = border_triangles(&warp.corners, pass.border_width as f64, size);
        draw_triangles(gl, program, &triangles, None);
    }

    if pass.overlay.contains(Overlay::MARKERS) {
        for corner in Corner::ALL {
            let [r, g, b, a] = if corner == pass.active_corner {
                ACTIVE_MARKER_COLOR
            } else {
                MARKER_COLOR
            };
            gl.Uniform4f(program.u_color, r, g, b, a);
            let triangles = marker_triangles(warp.corners[corner.index()], size);
            draw_triangles(gl, program, &triangles, None);
        }
    }
}
