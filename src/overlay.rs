//! Display driver collaborators
//!
//! The DRM/KMS resource layer is an external service here. `OverlayDevice`
//! is the capability and session surface the composer needs from it;
//! `SimulatedOverlay` implements it from configuration so the daemon and the
//! tests run without a kernel driver.

use crate::clock;
use crate::config::SimulatedDisplay;
use crate::display::{DisplayId, DisplayTable};
use crate::{Error, Result};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Session data reported by the driver for one display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    pub width: u32,
    pub height: u32,
    /// Physical size in micrometres, 0 if unknown
    pub physical_width_um: u32,
    pub physical_height_um: u32,
    pub format: u32,
    pub density: u32,
    pub hdcp_version: u32,
    pub connected: bool,
    pub internal: bool,
    pub secure: bool,
}

/// One connector mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl ModeInfo {
    pub const fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }
}

/// Result of matching a requested mode against the connector's list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedMode {
    NotFound,
    AlreadyCurrent,
    Index(usize),
}

/// Mode list of a connector plus the mode in use
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorModes {
    pub modes: Vec<ModeInfo>,
    pub current: usize,
}

impl ConnectorModes {
    pub fn supported_mode(&self, wanted: &ModeInfo) -> SupportedMode {
        if self.modes.is_empty() {
            return SupportedMode::NotFound;
        }
        if self.modes.get(self.current) == Some(wanted) {
            return SupportedMode::AlreadyCurrent;
        }
        match self.modes.iter().position(|m| m == wanted) {
            Some(index) if index != self.current => SupportedMode::Index(index),
            _ => SupportedMode::NotFound,
        }
    }
}

/// Overlay engine limits consulted by the layer classifier
pub trait OverlayCaps: Send + Sync {
    fn is_supported_size(&self, dpy: DisplayId, width: u32, height: u32) -> bool;

    /// Widest source the display resizer accepts
    fn rsz_max_width_input(&self, dpy: DisplayId) -> u32;

    fn constant_alpha_for_rgba(&self) -> bool;
}

/// Display driver surface used by the display manager and vsync threads
pub trait OverlayDevice: OverlayCaps {
    fn update_display_resolution(&self, dpy: DisplayId) -> Result<()>;

    fn update_connector_mode(&self, dpy: DisplayId) -> Result<()>;

    /// Block until the next hardware vsync; returns its timestamp
    fn wait_vsync(&self, dpy: DisplayId, period_ns: i64) -> Result<i64>;

    fn session_info(&self, dpy: DisplayId) -> Result<SessionInfo>;

    fn num_configs(&self, dpy: DisplayId) -> usize;

    fn mode(&self, dpy: DisplayId, config: usize) -> Option<ModeInfo>;

    fn current_fps(&self, dpy: DisplayId) -> u32;

    fn ethdr_support(&self, dpy: DisplayId) -> bool;

    fn rpo_supported(&self, dpy: DisplayId) -> bool;

    fn mml_supported(&self, dpy: DisplayId) -> bool;

    fn supported_connector_mode(&self, dpy: DisplayId, wanted: &ModeInfo) -> SupportedMode;

    /// Mode to apply on the next `update_connector_mode`
    fn select_connector_mode(&self, dpy: DisplayId, index: usize);

    fn set_hdmi_enabled(&self, dpy: DisplayId, enabled: bool);

    fn hdmi_enabled(&self, dpy: DisplayId) -> bool;
}

/// Downstream frame dispatcher
pub trait JobDispatcher: Send + Sync {
    /// Drop (or resume) frame jobs for a display
    fn ignore_job(&self, dpy: DisplayId, ignore: bool);
}

#[derive(Debug, Clone, Default)]
struct SimState {
    spec: Option<SimulatedDisplay>,
    modes: ConnectorModes,
    pending_mode: Option<usize>,
    hdmi_enabled: bool,
}

/// Overlay device driven by `[[displays]]` configuration
pub struct SimulatedOverlay {
    state: Mutex<DisplayTable<SimState>>,
    rsz_max_width: u32,
    max_width: u32,
    max_height: u32,
}

impl SimulatedOverlay {
    pub fn new(displays: &[SimulatedDisplay]) -> Self {
        let mut table: DisplayTable<SimState> = DisplayTable::default();
        for spec in displays {
            let Some(dpy) = DisplayId::new(spec.id) else {
                warn!("Ignoring simulated display with id {}", spec.id);
                continue;
            };
            let mut modes: Vec<ModeInfo> = spec
                .modes
                .iter()
                .map(|m| ModeInfo::new(m.width, m.height, m.fps))
                .collect();
            let native = ModeInfo::new(spec.width, spec.height, spec.fps);
            let current = match modes.iter().position(|m| *m == native) {
                Some(index) => index,
                None => {
                    modes.insert(0, native);
                    0
                }
            };
            info!(dpy = %dpy, width = spec.width, height = spec.height, fps = spec.fps,
                "Simulated display");
            table[dpy] = SimState {
                spec: Some(spec.clone()),
                modes: ConnectorModes { modes, current },
                pending_mode: None,
                hdmi_enabled: true,
            };
        }
        Self {
            state: Mutex::new(table),
            rsz_max_width: 1920,
            max_width: 4096,
            max_height: 4096,
        }
    }

    /// Flip the simulated cable state of a display
    pub fn set_connected(&self, dpy: DisplayId, connected: bool) {
        if let Ok(mut table) = self.state.lock() {
            if let Some(spec) = table[dpy].spec.as_mut() {
                spec.connected = connected;
            }
        }
    }

    fn with_state<T>(&self, dpy: DisplayId, f: impl FnOnce(&SimState) -> T) -> Result<T> {
        let table = self
            .state
            .lock()
            .map_err(|_| Error::Driver("simulated overlay lock poisoned".into()))?;
        Ok(f(&table[dpy]))
    }

    fn current_mode(state: &SimState) -> Option<ModeInfo> {
        state.modes.modes.get(state.modes.current).copied()
    }
}

impl OverlayCaps for SimulatedOverlay {
    fn is_supported_size(&self, _dpy: DisplayId, width: u32, height: u32) -> bool {
        width > 0 && height > 0 && width <= self.max_width && height <= self.max_height
    }

    fn rsz_max_width_input(&self, _dpy: DisplayId) -> u32 {
        self.rsz_max_width
    }

    fn constant_alpha_for_rgba(&self) -> bool {
        false
    }
}

impl OverlayDevice for SimulatedOverlay {
    fn update_display_resolution(&self, dpy: DisplayId) -> Result<()> {
        let connected = self.with_state(dpy, |s| s.spec.as_ref().map_or(false, |d| d.connected))?;
        if !connected {
            return Err(Error::NoDisplay(dpy));
        }
        // the resolution query reports the mode the next commit will use
        self.update_connector_mode(dpy)
    }

    fn update_connector_mode(&self, dpy: DisplayId) -> Result<()> {
        let mut table = self
            .state
            .lock()
            .map_err(|_| Error::Driver("simulated overlay lock poisoned".into()))?;
        let state = &mut table[dpy];
        if state.spec.is_none() {
            return Err(Error::NoDisplay(dpy));
        }
        if let Some(index) = state.pending_mode.take() {
            if index < state.modes.modes.len() {
                debug!(dpy = %dpy, index, "Applying connector mode");
                state.modes.current = index;
            }
        }
        Ok(())
    }

    fn wait_vsync(&self, dpy: DisplayId, period_ns: i64) -> Result<i64> {
        let connected = self.with_state(dpy, |s| s.spec.as_ref().map_or(false, |d| d.connected))?;
        if !connected || period_ns <= 0 {
            return Err(Error::NoDisplay(dpy));
        }
        let now = clock::monotonic_now();
        let next = (now / period_ns + 1) * period_ns;
        clock::sleep_until(next);
        Ok(next)
    }

    fn session_info(&self, dpy: DisplayId) -> Result<SessionInfo> {
        self.with_state(dpy, |s| {
            let spec = s.spec.as_ref().ok_or(Error::NoDisplay(dpy))?;
            let mode = Self::current_mode(s).unwrap_or(ModeInfo::new(spec.width, spec.height, spec.fps));
            Ok(SessionInfo {
                width: mode.width,
                height: mode.height,
                physical_width_um: spec.physical_width_mm.saturating_mul(1000),
                physical_height_um: spec.physical_height_mm.saturating_mul(1000),
                format: 0,
                density: spec.density,
                hdcp_version: spec.hdcp_version,
                connected: spec.connected,
                internal: spec.internal,
                secure: spec.secure,
            })
        })?
    }

    fn num_configs(&self, dpy: DisplayId) -> usize {
        self.with_state(dpy, |s| s.modes.modes.len()).unwrap_or(0)
    }

    fn mode(&self, dpy: DisplayId, config: usize) -> Option<ModeInfo> {
        self.with_state(dpy, |s| s.modes.modes.get(config).copied())
            .ok()
            .flatten()
    }

    fn current_fps(&self, dpy: DisplayId) -> u32 {
        self.with_state(dpy, |s| Self::current_mode(s).map_or(0, |m| m.fps))
            .unwrap_or(0)
    }

    fn ethdr_support(&self, dpy: DisplayId) -> bool {
        self.with_state(dpy, |s| s.spec.as_ref().map_or(false, |d| d.ethdr))
            .unwrap_or(false)
    }

    fn rpo_supported(&self, dpy: DisplayId) -> bool {
        self.with_state(dpy, |s| s.spec.as_ref().map_or(false, |d| d.rpo))
            .unwrap_or(false)
    }

    fn mml_supported(&self, dpy: DisplayId) -> bool {
        self.with_state(dpy, |s| s.spec.as_ref().map_or(false, |d| d.mml))
            .unwrap_or(false)
    }

    fn supported_connector_mode(&self, dpy: DisplayId, wanted: &ModeInfo) -> SupportedMode {
        self.with_state(dpy, |s| s.modes.supported_mode(wanted))
            .unwrap_or(SupportedMode::NotFound)
    }

    fn select_connector_mode(&self, dpy: DisplayId, index: usize) {
        if let Ok(mut table) = self.state.lock() {
            table[dpy].pending_mode = Some(index);
        }
    }

    fn set_hdmi_enabled(&self, dpy: DisplayId, enabled: bool) {
        if let Ok(mut table) = self.state.lock() {
            table[dpy].hdmi_enabled = enabled;
            info!(dpy = %dpy, enabled, "HDMI output");
        }
    }

    fn hdmi_enabled(&self, dpy: DisplayId) -> bool {
        self.with_state(dpy, |s| s.hdmi_enabled).unwrap_or(false)
    }
}
