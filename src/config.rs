//! Composer configuration and runtime properties
//!
//! `HwcConfig` is read once at startup from TOML. Debug knobs that the
//! platform flips at runtime (fake vsync rate, test hotplug, forced paths)
//! are read through a `PropertyStore` at thread setup or on explicit
//! refresh, never per frame.

use crate::hal::{HwLayerType, PixelFormat};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Compose level bits that switch off whole hardware paths
pub const COMPOSE_DISABLE_UI: u32 = 1 << 0;
pub const COMPOSE_DISABLE_MM: u32 = 1 << 1;
pub const COMPOSE_DISABLE_GLAI: u32 = 1 << 2;

/// Platform capabilities used by the layer classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Bitmask of `COMPOSE_DISABLE_*`
    pub compose_level: u32,
    /// Overlay can present buffers with a producer pre-transform
    pub prexform_ui: u32,
    pub enable_rgba_rotate: bool,
    pub enable_rgbx_scaling: bool,
    pub disp_support_decompress: bool,
    pub mdp_support_decompress: bool,
    pub is_ovl_support_rgba1010102: bool,
    pub is_mdp_support_rgba1010102: bool,
    pub support_2subsample_with_odd_size_roi: bool,
    pub is_ovl_support_odd_size: bool,
    /// Zero disables MDP scaling for video formats
    pub mdp_scale_percentage: f64,
    pub force_mdp_output_format: Option<PixelFormat>,
    /// 0 off, 1 force GPU, 2 force MDP
    pub primary_force_pat: u32,
    pub ext_force_pat: u32,
    /// HYFBC video larger than this goes to the GPU unless PQ is needed
    pub limited_video_size: usize,
    pub hint_id: u64,
    pub hint_name: String,
    pub hint_name_shift: usize,
    pub hint_hwlayer_type: HwLayerType,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            compose_level: 0,
            prexform_ui: 1,
            enable_rgba_rotate: false,
            enable_rgbx_scaling: true,
            disp_support_decompress: false,
            mdp_support_decompress: false,
            is_ovl_support_rgba1010102: false,
            is_mdp_support_rgba1010102: false,
            support_2subsample_with_odd_size_roi: true,
            is_ovl_support_odd_size: true,
            mdp_scale_percentage: 1.0,
            force_mdp_output_format: None,
            primary_force_pat: 0,
            ext_force_pat: 0,
            limited_video_size: 3840 * 2160,
            hint_id: 0,
            hint_name: String::new(),
            hint_name_shift: 0,
            hint_hwlayer_type: HwLayerType::None,
        }
    }
}

impl PlatformConfig {
    /// MT8195 capability preset
    pub fn mt8195() -> Self {
        Self {
            enable_rgba_rotate: true,
            enable_rgbx_scaling: true,
            mdp_scale_percentage: 0.1,
            disp_support_decompress: true,
            mdp_support_decompress: true,
            is_ovl_support_rgba1010102: true,
            is_mdp_support_rgba1010102: true,
            ..Default::default()
        }
    }

    pub fn ui_disabled(&self) -> bool {
        self.compose_level & COMPOSE_DISABLE_UI != 0
    }

    pub fn mm_disabled(&self) -> bool {
        self.compose_level & COMPOSE_DISABLE_MM != 0
    }

    pub fn glai_disabled(&self) -> bool {
        self.compose_level & COMPOSE_DISABLE_GLAI != 0
    }
}

/// Product feature switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureList {
    /// Game PQ level; 0 disables game PQ entirely
    pub game_pq: i32,
    pub game_hdr: bool,
    pub pq_supported: bool,
    pub video_whitelist: bool,
    pub ai_pq: bool,
    /// 0 none, 1 external displays, 2 external and virtual displays
    pub trigger_by_vsync: u32,
}

impl Default for FeatureList {
    fn default() -> Self {
        Self {
            game_pq: 0,
            game_hdr: false,
            pq_supported: false,
            video_whitelist: false,
            ai_pq: false,
            trigger_by_vsync: 0,
        }
    }
}

/// How a fake display divides the primary resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakeShrink {
    /// Alternate between 2 and 4 on every fake connect
    Alternate,
    Fixed(u32),
}

impl Default for FakeShrink {
    fn default() -> Self {
        FakeShrink::Alternate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub fake_shrink: FakeShrink,
    pub listener_wait_retries: u32,
    pub listener_wait_interval_ms: u64,
    pub hotplug_done_timeout_ms: u64,
    pub applied_fence_timeout_ms: u64,
    /// Pause between a disconnect and the following reconnect
    pub replug_delay_ms: u64,
    pub uevent_poll_timeout_ms: u64,
    pub force_sw_vsync: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            fake_shrink: FakeShrink::Alternate,
            listener_wait_retries: 400,
            listener_wait_interval_ms: 5,
            hotplug_done_timeout_ms: 3000,
            applied_fence_timeout_ms: 1500,
            replug_delay_ms: 32,
            uevent_poll_timeout_ms: 500,
            force_sw_vsync: false,
        }
    }
}

/// One connector mode of a simulated display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A display described by configuration instead of a kernel driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDisplay {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub physical_width_mm: u32,
    pub physical_height_mm: u32,
    pub density: u32,
    pub connected: bool,
    pub internal: bool,
    pub secure: bool,
    pub hdcp_version: u32,
    pub rpo: bool,
    pub mml: bool,
    pub ethdr: bool,
    pub modes: Vec<ModeSpec>,
}

impl Default for SimulatedDisplay {
    fn default() -> Self {
        Self {
            id: 0,
            width: 1080,
            height: 2340,
            fps: 60,
            physical_width_mm: 68,
            physical_height_mm: 148,
            density: 0,
            connected: true,
            internal: true,
            secure: true,
            hdcp_version: 0,
            rpo: true,
            mml: false,
            ethdr: false,
            modes: Vec::new(),
        }
    }
}

/// Top-level composer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwcConfig {
    pub platform: PlatformConfig,
    pub features: FeatureList,
    pub debug: DebugConfig,
    pub displays: Vec<SimulatedDisplay>,
    /// Seed values for the in-memory property store
    pub properties: HashMap<String, String>,
}

impl HwcConfig {
    /// Load from a TOML file, falling back to defaults
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded composer config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Ignoring invalid composer config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                info!("No composer config at {:?} ({}), using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Runtime key/value properties
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get(key)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(default)
    }
}

/// Android system properties via `getprop`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProperties;

impl PropertyStore for SystemProperties {
    fn get(&self, key: &str) -> Option<String> {
        let output = std::process::Command::new("getprop").arg(key).output().ok()?;
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            None
        } else {
            debug!(key, value = %value, "property");
            Some(value)
        }
    }
}

/// In-memory property store
#[derive(Debug, Default)]
pub struct MemoryProperties {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.into());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }
}

/// Property keys read by the composer
pub mod props {
    pub const SW_VSYNC_FPS: &str = "vendor.debug.sf.sw_vsync_fps";
    pub const PERIOD_IO: &str = "vendor.debug.hwc.period_io";
    pub const PERIOD_REQ: &str = "vendor.debug.hwc.period_req";
    pub const TEST_HDMI_CONNECT: &str = "vendor.debug.hwc.test_hdmi_connect";
    pub const ENABLE_HWC_VDS: &str = "debug.sf.enable_hwc_vds";
    pub const HWROTATION: &str = "ro.vendor.sf.hwrotation";
    pub const HWROTATION_EXT: &str = "ro.vendor.sf.hwrotation.ext";
}
