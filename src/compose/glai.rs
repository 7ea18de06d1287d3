//! GLAI path: layers whose content is produced by an on-device model

use super::{Classifier, DisplayCaps, GlaiOutput, ReasonCode};
use crate::display::Rect;
use crate::hal::{transform, BlendMode, PixelFormat};
use crate::layer::HwcLayer;
use std::fmt;
use std::sync::Arc;

/// The model accepted the layer
pub const GLAI_OK: u32 = 1 << 0;
/// A model was loaded for the layer; `agent_id` is valid
pub const GLAI_MODEL_LOADED: u32 = 1 << 1;

/// Input to `GlaiEngine::validate_layer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlaiRequest {
    /// Agent previously assigned to the layer, or -1
    pub agent_id: i32,
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub y_stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlaiResponse {
    /// `GLAI_*` bits
    pub flags: u32,
    pub agent_id: i32,
    pub roi: Rect,
    pub format: PixelFormat,
}

/// Model runtime that decides whether a buffer can be fed to inference
pub trait GlaiEngine: Send + Sync {
    fn validate_layer(&self, req: &GlaiRequest) -> GlaiResponse;

    /// Unload the model held by `agent_id`
    fn clean_model(&self, agent_id: i32);
}

/// Engine used when no model runtime is present
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGlaiEngine;

impl GlaiEngine for NullGlaiEngine {
    fn validate_layer(&self, req: &GlaiRequest) -> GlaiResponse {
        GlaiResponse {
            flags: 0,
            agent_id: req.agent_id,
            roi: Rect::default(),
            format: req.format,
        }
    }

    fn clean_model(&self, _agent_id: i32) {}
}

/// A model loaded on behalf of one layer, unloaded when dropped
pub struct GlaiAgent {
    id: i32,
    engine: Arc<dyn GlaiEngine>,
}

impl GlaiAgent {
    pub fn new(id: i32, engine: Arc<dyn GlaiEngine>) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> i32 {
        self.id
    }
}

impl fmt::Debug for GlaiAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlaiAgent").field("id", &self.id).finish()
    }
}

impl Drop for GlaiAgent {
    fn drop(&mut self) {
        self.engine.clean_model(self.id);
    }
}

pub(super) struct GlaiVerdict {
    pub agent_id: Option<i32>,
    pub result: Result<GlaiOutput, ReasonCode>,
}

impl From<ReasonCode> for GlaiVerdict {
    fn from(reason: ReasonCode) -> Self {
        Self {
            agent_id: None,
            result: Err(reason),
        }
    }
}

pub(super) fn check(c: &Classifier, layer: &HwcLayer, disp: &DisplayCaps) -> GlaiVerdict {
    let Some(buf) = layer.buffer() else {
        return ReasonCode::NoBuffer.into();
    };
    let p = c.platform();

    if !buf.glai_enable {
        return ReasonCode::PathDisabled.into();
    }
    if buf.compressed && !p.disp_support_decompress {
        return ReasonCode::CompressionUnsupported.into();
    }
    if buf.g2g_compressed {
        return ReasonCode::G2gCompressed.into();
    }

    let (mut w, mut h) = (buf.width, buf.height);
    if buf.prexform != 0 {
        if p.prexform_ui == 0 {
            return ReasonCode::PrexformUnsupported.into();
        }
        if buf.prexform & transform::ROT_90 != 0 {
            std::mem::swap(&mut w, &mut h);
        }
    }
    if layer.transform() != buf.prexform {
        return ReasonCode::RotationUnsupported.into();
    }

    let resp = c.glai.validate_layer(&GlaiRequest {
        agent_id: layer.glai_agent_id(),
        handle: buf.handle,
        width: w,
        height: h,
        format: buf.format_original,
        y_stride: buf.y_stride,
    });
    let agent_id = (resp.flags & GLAI_MODEL_LOADED != 0).then_some(resp.agent_id);
    let result = judge_output(c, layer, disp, buf.glai_inference, &resp);
    GlaiVerdict { agent_id, result }
}

fn judge_output(
    c: &Classifier,
    layer: &HwcLayer,
    disp: &DisplayCaps,
    inference: bool,
    resp: &GlaiResponse,
) -> Result<GlaiOutput, ReasonCode> {
    let p = c.platform();
    if resp.flags & GLAI_OK == 0 {
        return Err(ReasonCode::GlaiModelRejected);
    }
    if !inference {
        return Err(ReasonCode::GlaiNoInference);
    }

    let output = GlaiOutput {
        roi: resp.roi,
        format: resp.format,
    };
    let format = output.format;
    let allowed = match format {
        PixelFormat::Yuyv | PixelFormat::YCbCr422I | PixelFormat::Img1Bgrx8888 | PixelFormat::RgbaFp16 => true,
        PixelFormat::Rgba1010102 => p.is_ovl_support_rgba1010102,
        f => f.in_ovl_rgb_range(),
    };
    if !allowed {
        return Err(ReasonCode::UnsupportedFormat);
    }
    match layer.blend() {
        BlendMode::Coverage => return Err(ReasonCode::CoverageBlend),
        BlendMode::None if format == PixelFormat::Bgra8888 => return Err(ReasonCode::OpaqueBgra),
        _ => {}
    }
    c.check_constant_alpha(layer, format)?;

    let (roi_w, roi_h) = (output.roi.width(), output.roi.height());
    if roi_w <= 0 || roi_h <= 0 || !c.overlay.is_supported_size(disp.id, roi_w as u32, roi_h as u32) {
        return Err(ReasonCode::UnsupportedSize);
    }
    let frame = layer.display_frame();
    if frame.width() != roi_w || frame.height() != roi_h {
        if !disp.rpo {
            return Err(ReasonCode::ScalingUnsupported);
        }
        c.check_rsz_input(disp, format, roi_w)?;
    }
    Ok(output)
}
