//! Layer composition classifier
//!
//! Decides, per layer and per frame, which hardware path presents the
//! layer. The decision chain is ordered: framework requests and hints come
//! first, then security, then the GLAI, UI and MM rules, and finally the
//! GPU fallback. Every decision carries the rule that made it and a reason
//! code so a rejected layer can be explained.
//!
//! ```text
//!   client? ── dim? ── buffer? ── security ── hints ── GLAI ── UI ── MM ── GPU
//! ```
//!
//! `Classifier::classify` is pure: it reads the layer and the display's
//! capabilities and returns a `Classification`; only `HwcLayer::validate`
//! stores the outcome.

mod glai;
mod mm;
mod ui;

use crate::config::{FeatureList, PlatformConfig};
use crate::display::{DisplayId, Rect};
use crate::hal::{usage, BlitColor, CompositionType, HwLayerType, PixelFormat, ProducerType};
use crate::layer::HwcLayer;
use crate::overlay::OverlayCaps;
use std::sync::Arc;
use tracing::trace;

pub use glai::{GlaiAgent, GlaiEngine, GlaiRequest, GlaiResponse, NullGlaiEngine, GLAI_MODEL_LOADED, GLAI_OK};

/// Capabilities of the display a layer is classified for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayCaps {
    pub id: DisplayId,
    pub secure: bool,
    pub internal: bool,
    /// Display resizer can scale overlay layers
    pub rpo: bool,
    /// MML engine is available
    pub mml: bool,
    /// External tone-mapping block is in the path
    pub ethdr: bool,
}

impl DisplayCaps {
    pub fn new(id: DisplayId) -> Self {
        Self {
            id,
            secure: false,
            internal: id.is_primary(),
            rpo: false,
            mml: false,
            ethdr: false,
        }
    }
}

/// Which step of the chain produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    ClientRequest,
    Dim,
    NoBuffer,
    Security,
    MmHint,
    UiHint,
    Glai,
    Ui,
    MmDisabled,
    Mm,
    Fallback,
}

/// Why a rule accepted or rejected a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Accepted,
    ClientComposition,
    EmptyDimFrame,
    NoBuffer,
    ProtectedOnNonSecureDisplay,
    SecureOnUnsecuredDisplay,
    PathDisabled,
    UnsupportedSize,
    CompressionUnsupported,
    G2gCompressed,
    NeedsGamePq,
    HdrContent,
    UnsupportedFormat,
    RxHal10Bit,
    OddSubsampledRoi,
    CoverageBlend,
    OpaqueBgra,
    PqEnhance,
    ConstantAlpha,
    EmptySource,
    NegativeCropOffset,
    PrexformUnsupported,
    RotationUnsupported,
    ScalingUnsupported,
    ResizerInputTooWide,
    EthdrOddSize,
    EthdrRgba1010102,
    TooSmall,
    NoBlitColor,
    Rgba1010102Unsupported,
    Fp16Unsupported,
    CompressedRgb565,
    RotateCropUnaligned,
    HdrWithoutScenario,
    ForcedGpu,
    ForcedMdp,
    BlitRejected,
    HyfbcVideoLimit,
    OddDestination,
    DisplayUnsupported,
    GlaiModelRejected,
    GlaiNoInference,
}

/// Result of classifying one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationOutcome {
    pub result: HwLayerType,
    pub reason: ReasonCode,
    pub rule: Rule,
}

impl ClassificationOutcome {
    pub const fn new(result: HwLayerType, reason: ReasonCode, rule: Rule) -> Self {
        Self { result, reason, rule }
    }
}

/// Output region and format produced by a GLAI model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlaiOutput {
    pub roi: Rect,
    pub format: PixelFormat,
}

/// Everything a classification decided for one layer
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub outcome: ClassificationOutcome,
    /// `layer::mdp_caps` bits requested by the MM path
    pub mdp_caps: u32,
    /// Model agent reported by the GLAI engine, if one was loaded
    pub glai_agent_id: Option<i32>,
    pub glai: Option<GlaiOutput>,
}

impl Classification {
    fn decided(result: HwLayerType, reason: ReasonCode, rule: Rule) -> Self {
        Self {
            outcome: ClassificationOutcome::new(result, reason, rule),
            mdp_caps: 0,
            glai_agent_id: None,
            glai: None,
        }
    }
}

/// Blit engine a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitEngine {
    Mdp,
    Mml,
}

/// One blit feasibility question
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitQuery {
    pub engine: BlitEngine,
    pub src_width: i32,
    pub src_height: i32,
    pub dst_width: i32,
    pub dst_height: i32,
    pub orientation: u32,
    pub src_color: BlitColor,
    pub dst_color: BlitColor,
    pub pq_enhance: bool,
    pub secure: bool,
}

/// Answers whether the blit engine can perform a transfer
pub trait BlitOracle: Send + Sync {
    fn is_valid(&self, query: &BlitQuery) -> bool;
}

/// Blit oracle bounded by scale ratios and a maximum source width
#[derive(Debug, Clone, Copy)]
pub struct BlitLimits {
    pub max_src_width: i32,
    /// Largest allowed dst/src ratio
    pub max_upscale: i32,
    /// Largest allowed src/dst ratio
    pub max_downscale: i32,
}

impl Default for BlitLimits {
    fn default() -> Self {
        Self {
            max_src_width: 4096,
            max_upscale: 32,
            max_downscale: 16,
        }
    }
}

impl BlitOracle for BlitLimits {
    fn is_valid(&self, q: &BlitQuery) -> bool {
        let (dst_w, dst_h) = if q.orientation & crate::hal::transform::ROT_90 != 0 {
            (q.dst_height, q.dst_width)
        } else {
            (q.dst_width, q.dst_height)
        };
        if q.src_width <= 0 || q.src_height <= 0 || dst_w <= 0 || dst_h <= 0 {
            return false;
        }
        if q.src_width > self.max_src_width {
            return false;
        }
        let within = |src: i32, dst: i32| {
            dst <= src.saturating_mul(self.max_upscale) && src <= dst.saturating_mul(self.max_downscale)
        };
        within(q.src_width, dst_w) && within(q.src_height, dst_h)
    }
}

/// Ordered classification chain over the platform's capabilities
pub struct Classifier {
    platform: PlatformConfig,
    features: FeatureList,
    overlay: Arc<dyn OverlayCaps>,
    blit: Arc<dyn BlitOracle>,
    glai: Arc<dyn GlaiEngine>,
}

impl Classifier {
    pub fn new(
        platform: PlatformConfig,
        features: FeatureList,
        overlay: Arc<dyn OverlayCaps>,
        blit: Arc<dyn BlitOracle>,
        glai: Arc<dyn GlaiEngine>,
    ) -> Self {
        Self {
            platform,
            features,
            overlay,
            blit,
            glai,
        }
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn glai_engine(&self) -> &Arc<dyn GlaiEngine> {
        &self.glai
    }

    pub fn features(&self) -> &FeatureList {
        &self.features
    }

    /// Whether the platform's debug hint routes this layer to `t`
    pub fn is_hint(&self, layer: &HwcLayer, t: HwLayerType) -> bool {
        let p = &self.platform;
        if layer.composition_type_before_validate() == CompositionType::Client {
            return false;
        }
        if p.hint_id == 0 && p.hint_name.is_empty() {
            return false;
        }
        let id_match = p.hint_id > 0 && layer.id() == p.hint_id;
        let name_match = !p.hint_name.is_empty()
            && layer
                .name()
                .get(p.hint_name_shift..)
                .map_or(false, |rest| rest.starts_with(&p.hint_name));
        if !id_match && !name_match {
            return false;
        }
        if p.hint_hwlayer_type != t {
            return false;
        }
        !(p.mm_disabled() && t == HwLayerType::Mm) && !(p.ui_disabled() && t == HwLayerType::Ui)
    }

    /// Run the decision chain for `layer` on a display with `disp` caps
    pub fn classify(&self, layer: &HwcLayer, disp: &DisplayCaps) -> Classification {
        let sf_type = layer.composition_type_before_validate();
        let p = &self.platform;

        if sf_type == CompositionType::Client || self.is_hint(layer, HwLayerType::Invalid) {
            return Classification::decided(
                HwLayerType::Invalid,
                ReasonCode::ClientComposition,
                Rule::ClientRequest,
            );
        }

        if sf_type == CompositionType::SolidColor || self.is_hint(layer, HwLayerType::Dim) {
            let frame = layer.display_frame();
            return if frame.width() > 0 && frame.height() > 0 {
                Classification::decided(HwLayerType::Dim, ReasonCode::Accepted, Rule::Dim)
            } else {
                Classification::decided(HwLayerType::Invalid, ReasonCode::EmptyDimFrame, Rule::Dim)
            };
        }

        let Some(buf) = layer.buffer() else {
            return Classification::decided(HwLayerType::Invalid, ReasonCode::NoBuffer, Rule::NoBuffer);
        };

        if usage::has_protected(buf.usage) && !disp.secure {
            return Classification::decided(
                HwLayerType::Invalid,
                ReasonCode::ProtectedOnNonSecureDisplay,
                Rule::Security,
            );
        }
        if usage::has_secure(buf.usage)
            && buf.producer != ProducerType::Video
            && !disp.secure
            && !disp.internal
        {
            return Classification::decided(
                HwLayerType::Invalid,
                ReasonCode::SecureOnUnsecuredDisplay,
                Rule::Security,
            );
        }

        if self.is_hint(layer, HwLayerType::Mm) {
            if let Ok(caps) = mm::check(self, layer, disp) {
                let mut c = Classification::decided(HwLayerType::Mm, ReasonCode::Accepted, Rule::MmHint);
                c.mdp_caps = caps;
                return c;
            }
        }
        if self.is_hint(layer, HwLayerType::Ui) && ui::check(self, layer, disp).is_ok() {
            return Classification::decided(HwLayerType::Ui, ReasonCode::Accepted, Rule::UiHint);
        }

        let mut glai_agent_id = None;
        if !p.glai_disabled() {
            let verdict = glai::check(self, layer, disp);
            glai_agent_id = verdict.agent_id;
            match verdict.result {
                Ok(output) => {
                    let mut c = Classification::decided(HwLayerType::Glai, ReasonCode::Accepted, Rule::Glai);
                    c.glai_agent_id = glai_agent_id;
                    c.glai = Some(output);
                    return c;
                }
                Err(reason) => trace!(layer = layer.id(), ?reason, "glai rejected"),
            }
        }

        let fallback = |result, reason, rule| {
            let mut c = Classification::decided(result, reason, rule);
            c.glai_agent_id = glai_agent_id;
            c
        };

        if !p.ui_disabled() {
            match ui::check(self, layer, disp) {
                Ok(()) => {
                    let t = if layer.sf_composition_type() == CompositionType::Cursor {
                        HwLayerType::Cursor
                    } else {
                        HwLayerType::Ui
                    };
                    return fallback(t, ReasonCode::Accepted, Rule::Ui);
                }
                Err(reason) => trace!(layer = layer.id(), ?reason, "ui rejected"),
            }
        }

        if p.mm_disabled() {
            return fallback(HwLayerType::Invalid, ReasonCode::PathDisabled, Rule::MmDisabled);
        }

        match mm::check(self, layer, disp) {
            Ok(caps) => {
                let mut c = fallback(HwLayerType::Mm, ReasonCode::Accepted, Rule::Mm);
                c.mdp_caps = caps;
                c
            }
            Err(reason) => fallback(HwLayerType::Invalid, reason, Rule::Fallback),
        }
    }

    /// Constant plane alpha on formats the overlay cannot blend that way
    fn check_constant_alpha(&self, layer: &HwcLayer, format: PixelFormat) -> Result<(), ReasonCode> {
        if self.overlay.constant_alpha_for_rgba() || layer.plane_alpha() >= 1.0 {
            return Ok(());
        }
        let premultiplied = layer.blend() == crate::hal::BlendMode::Premultiplied;
        if matches!(format, PixelFormat::Rgbx8888 | PixelFormat::Img1Bgrx8888) || premultiplied {
            return Err(ReasonCode::ConstantAlpha);
        }
        Ok(())
    }

    /// Display resizer width limit for opaque RGB sources
    fn check_rsz_input(&self, disp: &DisplayCaps, format: PixelFormat, width: i32) -> Result<(), ReasonCode> {
        let rgb = matches!(
            format,
            PixelFormat::Rgbx8888 | PixelFormat::Bgrx8888 | PixelFormat::Rgb888 | PixelFormat::Rgb565
        );
        if rgb && width > self.overlay.rsz_max_width_input(disp.id) as i32 {
            return Err(ReasonCode::ResizerInputTooWide);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::display::FRect;
    use crate::hal::BlendMode;
    use crate::layer::BufferInfo;

    fn layer_with(format: PixelFormat, w: i32, h: i32) -> HwcLayer {
        let mut layer = HwcLayer::new();
        layer.set_blend(BlendMode::Premultiplied);
        layer.set_display_frame(Rect::sized(w, h));
        layer.set_source_crop(FRect::new(0.0, 0.0, w as f32, h as f32));
        layer.set_buffer(Some(BufferInfo::new(7, w as u32, h as u32, format)));
        layer
    }

    fn primary() -> DisplayCaps {
        DisplayCaps {
            secure: true,
            rpo: true,
            ..DisplayCaps::new(DisplayId::PRIMARY)
        }
    }

    #[test]
    fn test_rgba_layer_goes_to_overlay() {
        let c = classifier();
        let layer = layer_with(PixelFormat::Rgba8888, 100, 100);
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Ui);
        assert_eq!(out.rule, Rule::Ui);
        assert_eq!(out.reason, ReasonCode::Accepted);
    }

    #[test]
    fn test_classify_is_pure() {
        let c = classifier();
        let layer = layer_with(PixelFormat::Yv12, 640, 480);
        let first = c.classify(&layer, &primary());
        let second = c.classify(&layer, &primary());
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_buffer_is_invalid() {
        let c = classifier();
        let mut layer = layer_with(PixelFormat::Rgba8888, 100, 100);
        layer.set_buffer(None);
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Invalid);
        assert_eq!(out.reason, ReasonCode::NoBuffer);
    }

    #[test]
    fn test_protected_content_needs_secure_display() {
        let c = classifier();
        let mut layer = HwcLayer::new();
        layer.set_display_frame(Rect::sized(64, 64));
        layer.set_source_crop(FRect::new(0.0, 0.0, 64.0, 64.0));
        let mut buf = BufferInfo::new(3, 64, 64, PixelFormat::Rgbx8888);
        buf.usage = usage::PROTECTED;
        layer.set_buffer(Some(buf));

        let external = DisplayCaps::new(DisplayId::EXTERNAL);
        let out = c.classify(&layer, &external).outcome;
        assert_eq!(out.result, HwLayerType::Invalid);
        assert_eq!(out.rule, Rule::Security);

        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Ui);
    }

    #[test]
    fn test_client_request_wins() {
        let c = classifier();
        let mut layer = layer_with(PixelFormat::Rgba8888, 100, 100);
        layer.set_sf_composition_type(CompositionType::Client);
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out, ClassificationOutcome::new(
            HwLayerType::Invalid,
            ReasonCode::ClientComposition,
            Rule::ClientRequest,
        ));
    }

    #[test]
    fn test_solid_color_is_dim_unless_empty() {
        let c = classifier();
        let mut layer = HwcLayer::new();
        layer.set_sf_composition_type(CompositionType::SolidColor);
        layer.set_display_frame(Rect::sized(10, 10));
        assert_eq!(c.classify(&layer, &primary()).outcome.result, HwLayerType::Dim);

        layer.set_display_frame(Rect::sized(10, 0));
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Invalid);
        assert_eq!(out.reason, ReasonCode::EmptyDimFrame);
    }

    #[test]
    fn test_need_pq_layer_leaves_overlay() {
        let mut features = FeatureList::default();
        features.game_pq = 1;
        let c = classifier_with(PlatformConfig::default(), features, true);
        let mut layer = layer_with(PixelFormat::Rgba8888, 100, 100);
        layer.set_need_pq(true);
        let out = c.classify(&layer, &primary()).outcome;
        assert_ne!(out.result, HwLayerType::Ui);
    }

    #[test]
    fn test_yuv_video_goes_to_mm() {
        let c = classifier();
        let layer = layer_with(PixelFormat::Yv12, 1280, 720);
        let cl = c.classify(&layer, &primary());
        assert_eq!(cl.outcome.result, HwLayerType::Mm);
        assert_eq!(cl.outcome.rule, Rule::Mm);
    }

    #[test]
    fn test_blit_rejection_falls_back_with_reason() {
        let c = classifier_with(PlatformConfig::default(), FeatureList::default(), false);
        let layer = layer_with(PixelFormat::Yv12, 1280, 720);
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Invalid);
        assert_eq!(out.rule, Rule::Fallback);
        assert_eq!(out.reason, ReasonCode::BlitRejected);
    }

    #[test]
    fn test_disabled_ui_routes_rgb_to_mm() {
        let platform = PlatformConfig {
            compose_level: crate::config::COMPOSE_DISABLE_UI,
            enable_rgba_rotate: true,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        let layer = layer_with(PixelFormat::Rgbx8888, 100, 100);
        assert_eq!(c.classify(&layer, &primary()).outcome.result, HwLayerType::Mm);

        let platform = PlatformConfig {
            compose_level: crate::config::COMPOSE_DISABLE_UI,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        assert_eq!(c.classify(&layer, &primary()).outcome.result, HwLayerType::Invalid);
    }

    #[test]
    fn test_disabled_mm_reports_rule() {
        let platform = PlatformConfig {
            compose_level: crate::config::COMPOSE_DISABLE_MM,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        let layer = layer_with(PixelFormat::Yv12, 640, 480);
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Invalid);
        assert_eq!(out.rule, Rule::MmDisabled);
    }

    #[test]
    fn test_name_hint_routes_to_mm() {
        let platform = PlatformConfig {
            hint_name: "Video".to_string(),
            hint_name_shift: 4,
            hint_hwlayer_type: HwLayerType::Mm,
            enable_rgba_rotate: true,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        let mut layer = layer_with(PixelFormat::Rgbx8888, 100, 100);
        layer.set_name("SFV:VideoSurface");
        let out = c.classify(&layer, &primary()).outcome;
        assert_eq!(out.result, HwLayerType::Mm);
        assert_eq!(out.rule, Rule::MmHint);

        layer.set_name("SFV:Wallpaper");
        assert_eq!(c.classify(&layer, &primary()).outcome.rule, Rule::Ui);
    }

    #[test]
    fn test_cursor_request_returns_cursor() {
        let c = classifier();
        let mut layer = layer_with(PixelFormat::Rgba8888, 32, 32);
        layer.set_sf_composition_type(CompositionType::Cursor);
        assert_eq!(c.classify(&layer, &primary()).outcome.result, HwLayerType::Cursor);
    }

    #[test]
    fn test_cursor_follows_framework_type_across_frames() {
        let c = classifier();
        let features = FeatureList::default();
        let mut layer = layer_with(PixelFormat::Rgba8888, 32, 32);
        layer.set_sf_composition_type(CompositionType::Cursor);
        layer.set_hwlayer_type(HwLayerType::Cursor);
        layer.after_present(true, &features);
        // the returned type is Device now, the framework still asks for a cursor
        assert_eq!(layer.composition_type_before_validate(), CompositionType::Device);
        assert_eq!(c.classify(&layer, &primary()).outcome.result, HwLayerType::Cursor);
    }

    #[test]
    fn test_blit_limits() {
        let limits = BlitLimits::default();
        let mut q = BlitQuery {
            engine: BlitEngine::Mdp,
            src_width: 1920,
            src_height: 1080,
            dst_width: 1280,
            dst_height: 720,
            orientation: 0,
            src_color: BlitColor::Yv12,
            dst_color: BlitColor::Unknown,
            pq_enhance: false,
            secure: false,
        };
        assert!(limits.is_valid(&q));
        q.dst_width = 64;
        assert!(!limits.is_valid(&q));
        q.src_width = 8192;
        assert!(!limits.is_valid(&q));
    }
}
