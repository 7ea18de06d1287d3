//! Per-layer state tracked across composition cycles
//!
//! The framework pushes layer properties through the setters; each setter
//! raises a state-changed bit only when the value really differs. `validate`
//! stores the classification for this cycle and `after_present` rolls the
//! current state into the "previous" slots used for change detection.

use crate::compose::{Classification, ClassificationOutcome, Classifier, DisplayCaps, GlaiAgent, GlaiEngine, GlaiOutput};
use crate::config::{FeatureList, PlatformConfig};
use crate::display::{FRect, Rect};
use crate::hal::{
    dataspace, transform, usage, BlendMode, CompositionType, HdrScenario, HwLayerType,
    PixelFormat, ProducerType,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// State-changed reason bits
pub mod state_change {
    pub const DATASPACE: u32 = 1 << 0;
    pub const BLEND: u32 = 1 << 1;
    pub const DISPLAY_FRAME_OFFSET: u32 = 1 << 2;
    pub const DISPLAY_FRAME_SIZE: u32 = 1 << 3;
    pub const SOURCE_CROP: u32 = 1 << 4;
    pub const PLANE_ALPHA: u32 = 1 << 5;
    pub const ZORDER: u32 = 1 << 6;
    pub const TRANSFORM: u32 = 1 << 7;
    pub const VISIBLE_REGION: u32 = 1 << 8;
    pub const COLOR: u32 = 1 << 9;
    pub const FORMAT: u32 = 1 << 10;
    pub const PREXFORM: u32 = 1 << 11;
    pub const SECURE: u32 = 1 << 12;

    /// Changes that do not wake an otherwise inactive layer
    pub const INACTIVE_IGNORED: u32 = ZORDER | VISIBLE_REGION;
}

/// MDP capability bits requested by a classification
pub mod mdp_caps {
    pub const ROT: u32 = 1 << 0;
    pub const RSZ: u32 = 1 << 1;
    pub const HDR: u32 = 1 << 2;
}

/// Attributes of the buffer attached to a layer for this frame
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    /// Opaque buffer identity, stable for the buffer's lifetime
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    /// Format used for composition decisions
    pub format: PixelFormat,
    /// Format as allocated
    pub format_original: PixelFormat,
    /// Real layout of a private YUV format
    pub private_format: Option<PixelFormat>,
    pub y_stride: u32,
    pub usage: u64,
    pub producer: ProducerType,
    pub prexform: u32,
    pub compressed: bool,
    pub g2g_compressed: bool,
    pub pq_enable: bool,
    pub pq_info_size: u32,
    pub ai_pq: bool,
    pub is_hdr: bool,
    pub hdr_static_metadata: bool,
    /// 10-bit RGBA produced by the HDMI RX HAL
    pub rx_hal_10bit: bool,
    pub glai_enable: bool,
    pub glai_inference: bool,
}

impl BufferInfo {
    pub fn new(handle: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            handle,
            width,
            height,
            format,
            format_original: format,
            private_format: None,
            y_stride: width,
            usage: 0,
            producer: ProducerType::Unknown,
            prexform: 0,
            compressed: false,
            g2g_compressed: false,
            pq_enable: false,
            pq_info_size: 0,
            ai_pq: false,
            is_hdr: false,
            hdr_static_metadata: false,
            rx_hal_10bit: false,
            glai_enable: false,
            glai_inference: false,
        }
    }

    pub fn is_protected_or_secure(&self) -> bool {
        usage::has_protected_or_secure(self.usage)
    }
}

/// Rotation/flip as a 2x2 integer matrix
type Mat = [[i32; 2]; 2];

fn mat_mul(a: Mat, b: Mat) -> Mat {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

fn transform_matrix(code: u32) -> Mat {
    let mut m: Mat = [[1, 0], [0, 1]];
    if code & transform::FLIP_H != 0 {
        m = mat_mul([[-1, 0], [0, 1]], m);
    }
    if code & transform::FLIP_V != 0 {
        m = mat_mul([[1, 0], [0, -1]], m);
    }
    if code & transform::ROT_90 != 0 {
        m = mat_mul([[0, -1], [1, 0]], m);
    }
    m
}

/// Opaque RGBA is composed as RGBX
fn opaque_format(buf: &mut BufferInfo, blend: BlendMode) {
    if buf.format_original == PixelFormat::Rgba8888 {
        buf.format = if blend == BlendMode::None {
            PixelFormat::Rgbx8888
        } else {
            PixelFormat::Rgba8888
        };
    }
}

/// Transform still to apply once the producer already applied `prexform`
pub fn rectify_xform(xform: u32, prexform: u32) -> u32 {
    if prexform == 0 {
        return xform;
    }
    let target = transform_matrix(xform & 0x7);
    let pre = transform_matrix(prexform & 0x7);
    (0..8u32)
        .find(|&r| mat_mul(transform_matrix(r), pre) == target)
        .unwrap_or(xform)
}

/// One compositor input surface
#[derive(Debug)]
pub struct HwcLayer {
    id: u64,
    name: String,
    sf_type: CompositionType,
    sf_type_from_framework: bool,
    returned_type: CompositionType,

    dataspace: i32,
    blend: BlendMode,
    display_frame: Rect,
    source_crop: FRect,
    plane_alpha: f32,
    z_order: u32,
    transform: u32,
    visible_region: Vec<Rect>,
    layer_color: u32,
    buffer: Option<BufferInfo>,
    buffer_changed: bool,
    state_changed: u32,
    need_pq: bool,
    hdr_scenario: HdrScenario,

    hwlayer_type: HwLayerType,
    outcome: Option<ClassificationOutcome>,
    prev_hwlayer_type: HwLayerType,
    is_composited_by_hwc: bool,
    mdp_caps: u32,
    glai_agent: Option<GlaiAgent>,
    glai_output: Option<GlaiOutput>,

    last_app_game_pq: bool,
    last_ai_pq: bool,
    last_hdr_scenario: HdrScenario,
    glai_last_inference: bool,

    unchanged_cnt: u32,
    inactive_cnt: u32,
}

impl Default for HwcLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl HwcLayer {
    pub fn new() -> Self {
        Self {
            id: NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed),
            name: String::new(),
            sf_type: CompositionType::Invalid,
            sf_type_from_framework: false,
            returned_type: CompositionType::Invalid,
            dataspace: dataspace::UNKNOWN,
            blend: BlendMode::None,
            display_frame: Rect::default(),
            source_crop: FRect::default(),
            plane_alpha: 1.0,
            z_order: 0,
            transform: 0,
            visible_region: Vec::new(),
            layer_color: 0,
            buffer: None,
            buffer_changed: false,
            state_changed: 0,
            need_pq: false,
            hdr_scenario: HdrScenario::None,
            hwlayer_type: HwLayerType::None,
            outcome: None,
            prev_hwlayer_type: HwLayerType::None,
            is_composited_by_hwc: false,
            mdp_caps: 0,
            glai_agent: None,
            glai_output: None,
            last_app_game_pq: false,
            last_ai_pq: false,
            last_hdr_scenario: HdrScenario::None,
            glai_last_inference: false,
            unchanged_cnt: 0,
            inactive_cnt: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // ---- framework setters ----

    pub fn set_sf_composition_type(&mut self, t: CompositionType) {
        self.sf_type = t;
        self.sf_type_from_framework = true;
    }

    pub fn sf_composition_type(&self) -> CompositionType {
        self.sf_type
    }

    /// Type the classification chain starts from this cycle
    pub fn composition_type_before_validate(&self) -> CompositionType {
        if self.sf_type_from_framework {
            self.sf_type
        } else {
            self.returned_type
        }
    }

    pub fn set_dataspace(&mut self, ds: i32) {
        if self.dataspace != ds {
            self.state_changed |= state_change::DATASPACE;
            self.dataspace = ds;
        }
    }

    pub fn set_blend(&mut self, blend: BlendMode) {
        if self.blend != blend {
            self.state_changed |= state_change::BLEND;
            self.blend = blend;
            if let Some(buf) = self.buffer.as_mut() {
                opaque_format(buf, blend);
            }
        }
    }

    pub fn set_display_frame(&mut self, frame: Rect) {
        if self.display_frame == frame {
            return;
        }
        if self.display_frame.left != frame.left || self.display_frame.top != frame.top {
            self.state_changed |= state_change::DISPLAY_FRAME_OFFSET;
        }
        if self.display_frame.width() != frame.width() || self.display_frame.height() != frame.height() {
            self.state_changed |= state_change::DISPLAY_FRAME_SIZE;
        }
        self.display_frame = frame;
    }

    pub fn set_source_crop(&mut self, crop: FRect) {
        if self.source_crop != crop {
            self.state_changed |= state_change::SOURCE_CROP;
            self.source_crop = crop;
        }
    }

    pub fn set_plane_alpha(&mut self, alpha: f32) {
        if self.plane_alpha != alpha {
            self.state_changed |= state_change::PLANE_ALPHA;
            self.plane_alpha = alpha;
        }
    }

    pub fn set_z_order(&mut self, z: u32) {
        if self.z_order != z {
            self.state_changed |= state_change::ZORDER;
            self.z_order = z;
        }
    }

    pub fn set_transform(&mut self, t: u32) {
        if self.transform != t {
            self.state_changed |= state_change::TRANSFORM;
            self.transform = t;
        }
    }

    pub fn set_visible_region(&mut self, region: Vec<Rect>) {
        if self.visible_region != region {
            self.state_changed |= state_change::VISIBLE_REGION;
            self.visible_region = region;
        }
    }

    /// ARGB color of a solid-color layer
    pub fn set_layer_color(&mut self, a: u8, r: u8, g: u8, b: u8) {
        let color = u32::from(a) << 24 | u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b);
        if self.layer_color != color {
            self.state_changed |= state_change::COLOR;
            self.layer_color = color;
        }
    }

    pub fn set_need_pq(&mut self, need: bool) {
        self.need_pq = need;
    }

    /// Attach this frame's buffer, or detach with `None`
    pub fn set_buffer(&mut self, buffer: Option<BufferInfo>) {
        let prev = self.buffer.take();
        let mut buffer = buffer;

        if let Some(buf) = buffer.as_mut() {
            opaque_format(buf, self.blend);
        }

        match (&prev, &buffer) {
            (Some(p), Some(b)) => {
                if p.handle != b.handle {
                    self.buffer_changed = true;
                }
                if p.format_original != b.format_original {
                    self.state_changed |= state_change::FORMAT;
                }
                if p.prexform != b.prexform {
                    self.state_changed |= state_change::PREXFORM;
                }
                if p.is_protected_or_secure() != b.is_protected_or_secure() {
                    self.state_changed |= state_change::SECURE;
                }
            }
            (None, Some(b)) => {
                self.buffer_changed = true;
                self.state_changed |= state_change::FORMAT;
                if b.prexform != 0 {
                    self.state_changed |= state_change::PREXFORM;
                }
                if b.is_protected_or_secure() {
                    self.state_changed |= state_change::SECURE;
                }
            }
            (Some(_), None) => self.buffer_changed = true,
            (None, None) => {}
        }
        self.buffer = buffer;
    }

    // ---- accessors ----

    pub fn buffer(&self) -> Option<&BufferInfo> {
        self.buffer.as_ref()
    }

    pub fn dataspace(&self) -> i32 {
        self.dataspace
    }

    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    pub fn display_frame(&self) -> Rect {
        self.display_frame
    }

    pub fn source_crop(&self) -> FRect {
        self.source_crop
    }

    pub fn plane_alpha(&self) -> f32 {
        self.plane_alpha
    }

    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    pub fn transform(&self) -> u32 {
        self.transform
    }

    pub fn layer_color(&self) -> u32 {
        self.layer_color
    }

    pub fn hdr_scenario(&self) -> HdrScenario {
        self.hdr_scenario
    }

    pub fn is_buffer_changed(&self) -> bool {
        self.buffer_changed
    }

    pub fn state_changed(&self) -> u32 {
        self.state_changed
    }

    pub fn unchanged_cnt(&self) -> u32 {
        self.unchanged_cnt
    }

    pub fn inactive_cnt(&self) -> u32 {
        self.inactive_cnt
    }

    pub fn mdp_caps(&self) -> u32 {
        self.mdp_caps
    }

    pub fn glai_agent_id(&self) -> i32 {
        self.glai_agent.as_ref().map_or(-1, GlaiAgent::id)
    }

    /// Unload the model bound to this layer, if any
    pub fn release_glai_agent(&mut self) {
        self.glai_agent = None;
    }

    pub fn glai_output(&self) -> Option<&GlaiOutput> {
        self.glai_output.as_ref()
    }

    pub fn outcome(&self) -> Option<&ClassificationOutcome> {
        self.outcome.as_ref()
    }

    pub fn prev_hwlayer_type(&self) -> HwLayerType {
        self.prev_hwlayer_type
    }

    pub fn last_hdr_scenario(&self) -> HdrScenario {
        self.last_hdr_scenario
    }

    pub fn last_app_game_pq(&self) -> bool {
        self.last_app_game_pq
    }

    pub fn last_ai_pq(&self) -> bool {
        self.last_ai_pq
    }

    pub fn glai_last_inference(&self) -> bool {
        self.glai_last_inference
    }

    // ---- classification ----

    pub fn hwlayer_type(&self) -> HwLayerType {
        self.hwlayer_type
    }

    pub fn is_composited_by_hwc(&self) -> bool {
        self.is_composited_by_hwc
    }

    pub fn returned_composition_type(&self) -> CompositionType {
        self.returned_type
    }

    pub fn set_hwlayer_type(&mut self, t: HwLayerType) {
        self.hwlayer_type = t;
        self.is_composited_by_hwc = t != HwLayerType::Invalid;
        self.returned_type = match t {
            HwLayerType::None => CompositionType::Invalid,
            HwLayerType::Invalid => CompositionType::Client,
            HwLayerType::Ui | HwLayerType::Mm | HwLayerType::Glai => {
                if self.sf_type == CompositionType::SolidColor {
                    CompositionType::SolidColor
                } else {
                    CompositionType::Device
                }
            }
            HwLayerType::Dim => CompositionType::SolidColor,
            HwLayerType::Cursor => CompositionType::Device,
        };
    }

    /// Classify this layer for the coming frame
    pub fn validate(&mut self, classifier: &Classifier, disp: &DisplayCaps) -> &ClassificationOutcome {
        self.mdp_caps = 0;
        self.setup_hdr_scenario(classifier.features());
        let classification = classifier.classify(self, disp);
        self.apply_classification(classification, classifier.glai_engine())
    }

    fn apply_classification(&mut self, c: Classification, glai: &Arc<dyn GlaiEngine>) -> &ClassificationOutcome {
        trace!(layer = self.id, result = ?c.outcome.result, reason = ?c.outcome.reason,
            rule = ?c.outcome.rule, "classified");
        if let Some(agent) = c.glai_agent_id {
            if self.glai_agent_id() != agent {
                self.glai_agent = Some(GlaiAgent::new(agent, Arc::clone(glai)));
            }
        }
        if c.glai.is_some() {
            self.glai_output = c.glai;
        }
        self.mdp_caps |= c.mdp_caps;
        self.set_hwlayer_type(c.outcome.result);
        self.outcome.insert(c.outcome)
    }

    /// Roll this frame's state into the "previous" slots
    pub fn after_present(&mut self, should_clear_state: bool, features: &FeatureList) {
        self.buffer_changed = false;
        if should_clear_state {
            self.state_changed = 0;
        }
        self.sf_type_from_framework = false;
        self.last_app_game_pq = self.is_need_pq(features, 1);
        self.last_ai_pq = self.is_ai_pq();
        self.last_hdr_scenario = self.hdr_scenario;
        self.glai_last_inference = self.buffer.as_ref().map_or(false, |b| b.glai_inference);
        self.prev_hwlayer_type = self.hwlayer_type;
    }

    fn is_special(&self, features: &FeatureList) -> bool {
        self.is_ai_pq()
            || self.is_need_pq(features, 1)
            || self.hdr_scenario != HdrScenario::None
            || self.buffer.as_ref().map_or(false, |b| b.pq_enable)
            || !matches!(self.hwlayer_type, HwLayerType::Ui | HwLayerType::Invalid)
            || self.sf_type == CompositionType::Client
    }

    pub fn is_unchanged(&self, features: &FeatureList) -> bool {
        !self.buffer_changed && self.state_changed == 0 && !self.is_special(features)
    }

    pub fn is_inactive(&self, features: &FeatureList) -> bool {
        !self.buffer_changed
            && self.state_changed & !state_change::INACTIVE_IGNORED == 0
            && !self.is_special(features)
            && !self.need_scaling()
    }

    pub fn handle_unchanged_layer(&mut self, features: &FeatureList) {
        if self.is_unchanged(features) {
            self.unchanged_cnt += 1;
        } else {
            self.unchanged_cnt = 0;
        }
        trace!(layer = self.id, count = self.unchanged_cnt, "unchanged");
    }

    pub fn handle_inactive_layer(&mut self, features: &FeatureList) {
        if self.is_inactive(features) {
            self.inactive_cnt += 1;
        } else {
            self.inactive_cnt = 0;
        }
        trace!(layer = self.id, count = self.inactive_cnt, "inactive");
    }

    // ---- PQ / HDR ----

    pub fn is_need_pq(&self, features: &FeatureList, version: i32) -> bool {
        if features.game_pq == 0 {
            return false;
        }
        if version != 0 && version < features.game_pq {
            return false;
        }
        if self.buffer.as_ref().map_or(false, |b| b.pq_info_size > 0) {
            return true;
        }
        self.need_pq
    }

    pub fn is_ai_pq(&self) -> bool {
        self.buffer.as_ref().map_or(false, |b| b.ai_pq)
    }

    /// Whether the blit needs PQ enhancement for this layer
    pub fn pq_enhance(&self, features: &FeatureList) -> bool {
        self.buffer.as_ref().map_or(false, |b| b.pq_enable)
            || self.is_ai_pq()
            || self.is_need_pq(features, 0)
            || self.hdr_scenario != HdrScenario::None
    }

    pub fn setup_hdr_scenario(&mut self, features: &FeatureList) {
        self.hdr_scenario = match &self.buffer {
            Some(buf) => Self::hdr_scenario_for(buf, self.dataspace, features.game_hdr),
            None => HdrScenario::None,
        };
    }

    fn hdr_scenario_for(buf: &BufferInfo, ds: i32, game_hdr: bool) -> HdrScenario {
        if game_hdr
            && buf.producer == ProducerType::Gpu
            && buf.format == PixelFormat::Rgba1010102
            && ds == dataspace::BT2020_PQ
        {
            return HdrScenario::Game;
        }
        if buf.producer == ProducerType::Video && dataspace::is_hdr(ds) {
            return HdrScenario::Video;
        }
        let ten_bit = matches!(buf.format, PixelFormat::YCbCrP010 | PixelFormat::Rgba1010102);
        if ten_bit && (ds == dataspace::BT2020_ITU_PQ || ds == dataspace::BT2020_ITU_HLG) {
            if buf.producer == ProducerType::Camera {
                return HdrScenario::CameraPreview;
            }
            if ds == dataspace::BT2020_ITU_HLG || buf.hdr_static_metadata {
                return HdrScenario::Common;
            }
        }
        HdrScenario::None
    }

    /// Dataspace the MDP should write
    pub fn mdp_out_dataspace(&self) -> i32 {
        if self.hdr_scenario != HdrScenario::None {
            return dataspace::V0_BT709;
        }
        let ds = self.dataspace;
        let standard = dataspace::standard(ds);
        let transfer = ds & dataspace::TRANSFER_MASK;
        match standard {
            dataspace::STANDARD_BT601_625
            | dataspace::STANDARD_BT601_625_UNADJUSTED
            | dataspace::STANDARD_BT601_525
            | dataspace::STANDARD_BT601_525_UNADJUSTED => {
                let range = match dataspace::range(ds) {
                    dataspace::RANGE_LIMITED => dataspace::RANGE_LIMITED,
                    dataspace::RANGE_FULL | dataspace::RANGE_EXTENDED => dataspace::RANGE_FULL,
                    _ => 0,
                };
                transfer | standard | range
            }
            dataspace::STANDARD_BT709 | dataspace::STANDARD_DCI_P3 | dataspace::STANDARD_BT2020 => {
                transfer | dataspace::STANDARD_BT709 | dataspace::RANGE_LIMITED
            }
            _ => dataspace::V0_BT601_625,
        }
    }

    /// Format the MDP should write
    pub fn mdp_output_format(
        &self,
        platform: &PlatformConfig,
        features: &FeatureList,
        disp: &DisplayCaps,
    ) -> Option<PixelFormat> {
        let buf = self.buffer.as_ref()?;
        if let Some(forced) = platform.force_mdp_output_format {
            return Some(forced);
        }
        let ten_bit_video = buf.format.is_10bit_block_or_ufo() || buf.format == PixelFormat::P010Hyfbc;
        if buf.rx_hal_10bit && buf.format == PixelFormat::Rgba1010102 {
            return Some(if disp.ethdr {
                PixelFormat::YCbCrP010
            } else {
                PixelFormat::Rgba1010102
            });
        }
        if disp.ethdr && ten_bit_video {
            return Some(PixelFormat::YCbCrP010);
        }
        if disp.id.is_primary() && ten_bit_video {
            return Some(PixelFormat::Rgba1010102);
        }
        if self.is_ai_pq() {
            return Some(PixelFormat::Yuyv);
        }
        if features.pq_supported && features.video_whitelist && disp.internal && buf.pq_enable {
            return Some(PixelFormat::Yuyv);
        }
        Some(buf.format)
    }

    // ---- geometry ----

    /// Transform rectified by the buffer's pre-transform
    pub fn xform(&self) -> u32 {
        let prexform = self.buffer.as_ref().map_or(0, |b| b.prexform);
        rectify_xform(self.transform, prexform)
    }

    pub fn need_rotate(&self) -> bool {
        self.xform() != 0
    }

    pub fn need_scaling(&self) -> bool {
        let crop_w = self.source_crop.width();
        let crop_h = self.source_crop.height();
        let frame_w = self.display_frame.width() as f32;
        let frame_h = self.display_frame.height() as f32;
        if self.xform() & transform::ROT_90 != 0 {
            crop_w != frame_h || crop_h != frame_w
        } else {
            crop_w != frame_w || crop_h != frame_h
        }
    }

    pub fn has_alpha(&self) -> bool {
        self.plane_alpha < 1.0 || self.is_pixel_alpha_used()
    }

    pub fn is_pixel_alpha_used(&self) -> bool {
        self.blend != BlendMode::None && self.buffer.as_ref().map_or(false, |b| b.format.has_alpha())
    }

    /// Integer source geometry as the overlay sees it
    pub fn src_left(&self) -> i32 {
        self.source_crop.left as i32
    }

    pub fn src_top(&self) -> i32 {
        self.source_crop.top as i32
    }

    pub fn src_width(&self) -> i32 {
        self.source_crop.right as i32 - self.source_crop.left as i32
    }

    pub fn src_height(&self) -> i32 {
        self.source_crop.bottom as i32 - self.source_crop.top as i32
    }
}
