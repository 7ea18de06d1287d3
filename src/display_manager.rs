//! Display lifecycle: hotplug, virtual displays, power and vsync plumbing
//!
//! `DisplayManager` owns the per-display config table and the vsync threads.
//! Three locks are involved and never nest in the wrong order:
//!
//! - the per-display hotplug lock serializes connect/disconnect of one slot
//! - the per-display vsync lock guards only the thread handle
//! - the state lock guards configs, counters and flags
//!
//! Vsync threads are joined with no lock held; the handle is cleared under
//! the vsync lock afterwards. The listener is never called with the state
//! lock held.
//!
//! When built with a fence oracle each display also gets a `VsyncEstimator`.
//! Present fences go in through `update_present_fence` and the display's
//! software vsync follows the predicted hardware vsync.

use crate::config::{props, DebugConfig, FakeShrink, FeatureList, HwcConfig, PropertyStore};
use crate::display::{refresh_period_ns, DisplayConfig, DisplayId, DisplaySubtype, DisplayTable, PowerMode, Rect};
use crate::fence::{Fence, FenceOracle};
use crate::hal::RefreshKind;
use crate::overlay::{JobDispatcher, OverlayDevice, SessionInfo};
use crate::vsync::{VsyncEstimator, VsyncSink, VsyncThread};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Display usage bits reported by the framework for virtual displays
pub mod usage {
    pub const IS_WFD: u32 = 1 << 0;
    pub const IS_SECURE: u32 = 1 << 1;
}

/// Placeholder the primary falls back to while unplugged
const PRIMARY_UNPLUGGED_WIDTH: u32 = 3840;
const PRIMARY_UNPLUGGED_HEIGHT: u32 = 2160;
const PRIMARY_UNPLUGGED_REFRESH: i64 = 16_666_667;

const DEFAULT_DENSITY: u32 = 160;

/// Callbacks into the framework
pub trait EventListener: Send + Sync {
    /// A display came up; `boot` is set for the initial primary bring-up
    fn on_plug_in(&self, dpy: DisplayId, boot: bool);
    fn on_plug_out(&self, dpy: DisplayId);
    fn on_hotplug_ext(&self, dpy: DisplayId, connected: bool);
    fn on_vsync(&self, dpy: DisplayId, timestamp: i64, enabled: bool);
    fn on_refresh(&self, dpy: DisplayId, kind: RefreshKind);
    fn on_vsync_period_timing_change(
        &self,
        dpy: DisplayId,
        applied_time: i64,
        refresh_required: bool,
        refresh_time: i64,
    );
}

struct State {
    /// Index 0 is the basic config, the rest are extra connector modes
    data: DisplayTable<Vec<DisplayConfig>>,
    connected: DisplayTable<bool>,
    power_on: DisplayTable<bool>,
    hdmi_change: DisplayTable<bool>,
    usage: DisplayTable<u32>,
    active_config: usize,
    curr_disp_num: u32,
    fake_disp_num: u32,
    last_shrink: u32,
}

impl State {
    fn basic(&self, dpy: DisplayId) -> &DisplayConfig {
        &self.data[dpy][0]
    }

    fn basic_mut(&mut self, dpy: DisplayId) -> &mut DisplayConfig {
        let configs = &mut self.data[dpy];
        if configs.is_empty() {
            configs.push(DisplayConfig::default());
        }
        &mut configs[0]
    }
}

/// Hotplug-done acknowledgement from downstream
#[derive(Default)]
struct HotplugAck {
    active: Mutex<bool>,
    cond: Condvar,
}

impl HotplugAck {
    fn set(&self, dpy: DisplayId, active: bool) {
        let mut current = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if *current != active {
            *current = active;
            self.cond.notify_all();
            info!(dpy = %dpy, active, "Hotplug acknowledged");
        }
    }

    /// Wait until the flag reaches `active`, false on timeout
    fn wait_for(&self, active: bool, timeout: Duration) -> bool {
        let current = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let (_current, result) = self
            .cond
            .wait_timeout_while(current, timeout, |a| *a != active)
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }
}

pub struct DisplayManager {
    this: Weak<DisplayManager>,
    features: FeatureList,
    debug: DebugConfig,
    overlay: Arc<dyn OverlayDevice>,
    dispatcher: Arc<dyn JobDispatcher>,
    properties: Arc<dyn PropertyStore>,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    state: Mutex<State>,
    vsyncs: DisplayTable<Mutex<Option<Arc<VsyncThread>>>>,
    estimators: Option<DisplayTable<Arc<VsyncEstimator>>>,
    hotplug: DisplayTable<Mutex<()>>,
    ack: DisplayTable<HotplugAck>,
    video_hdcp: RwLock<u32>,
}

impl DisplayManager {
    pub fn new(
        config: HwcConfig,
        overlay: Arc<dyn OverlayDevice>,
        dispatcher: Arc<dyn JobDispatcher>,
        properties: Arc<dyn PropertyStore>,
    ) -> Arc<Self> {
        Self::build(config, overlay, dispatcher, properties, None)
    }

    /// Like `new`, with per-display hardware vsync estimation from present fences
    pub fn with_fence_oracle(
        config: HwcConfig,
        overlay: Arc<dyn OverlayDevice>,
        dispatcher: Arc<dyn JobDispatcher>,
        properties: Arc<dyn PropertyStore>,
        oracle: Arc<dyn FenceOracle>,
    ) -> Arc<Self> {
        Self::build(config, overlay, dispatcher, properties, Some(oracle))
    }

    fn build(
        config: HwcConfig,
        overlay: Arc<dyn OverlayDevice>,
        dispatcher: Arc<dyn JobDispatcher>,
        properties: Arc<dyn PropertyStore>,
        oracle: Option<Arc<dyn FenceOracle>>,
    ) -> Arc<Self> {
        let estimators = oracle.map(|oracle| {
            DisplayTable::from_fn(|_| Arc::new(VsyncEstimator::new(oracle.clone(), PRIMARY_UNPLUGGED_REFRESH)))
        });
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            features: config.features,
            debug: config.debug,
            overlay,
            dispatcher,
            properties,
            listener: RwLock::new(None),
            state: Mutex::new(State {
                data: DisplayTable::from_fn(|_| vec![DisplayConfig::default()]),
                connected: DisplayTable::default(),
                power_on: DisplayTable::default(),
                hdmi_change: DisplayTable::default(),
                usage: DisplayTable::default(),
                active_config: 0,
                curr_disp_num: 0,
                fake_disp_num: 0,
                last_shrink: 4,
            }),
            vsyncs: DisplayTable::default(),
            estimators,
            hotplug: DisplayTable::default(),
            ack: DisplayTable::default(),
            video_hdcp: RwLock::new(u32::MAX),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn vsync_slot(&self, dpy: DisplayId) -> MutexGuard<'_, Option<Arc<VsyncThread>>> {
        self.vsyncs[dpy].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> Option<Arc<dyn EventListener>> {
        self.listener.read().ok().and_then(|l| l.clone())
    }

    pub fn set_listener(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = Some(listener);
        }
    }

    pub fn overlay(&self) -> &Arc<dyn OverlayDevice> {
        &self.overlay
    }

    /// Boot-time bring-up of a display that is already lit
    pub fn init_internal(&self, dpy: DisplayId) -> Result<()> {
        if !dpy.is_primary() {
            self.hotplug_ext(dpy, true, false, true);
            return Ok(());
        }

        self.set_display_data_for_phy(dpy);
        self.lock().curr_disp_num += 1;

        if let Some(listener) = self.listener() {
            listener.on_plug_in(dpy, true);
        }
        self.create_vsync_thread(dpy)?;

        {
            let mut s = self.lock();
            info!(devices = s.curr_disp_num, "Display information");
            print_display_info(dpy, s.basic(dpy));
            s.power_on[dpy] = true;
            s.connected[dpy] = true;
        }
        if let Some(listener) = self.listener() {
            listener.on_hotplug_ext(dpy, true);
        }
        Ok(())
    }

    fn create_vsync_thread(&self, dpy: DisplayId) -> Result<()> {
        let (has_vsync, refresh) = {
            let s = self.lock();
            (s.basic(dpy).has_vsync, s.basic(dpy).refresh)
        };
        let sink: Weak<dyn VsyncSink> = self.this.clone();
        let thread = Arc::new(VsyncThread::new(dpy, self.overlay.clone(), sink));
        if let Some(estimator) = self.estimator(dpy) {
            estimator.reset_avg_period(refresh);
            thread.set_estimator(estimator.clone());
        }

        thread.initialize(!has_vsync || self.debug.force_sw_vsync, refresh)?;
        thread.set_property(self.properties.as_ref());
        let old = self.vsync_slot(dpy).replace(thread);
        if let Some(old) = old {
            warn!(dpy = %dpy, "Replacing a live vsync thread");
            old.request_exit();
            old.set_loop_again();
            old.join();
        }
        Ok(())
    }

    fn estimator(&self, dpy: DisplayId) -> Option<&Arc<VsyncEstimator>> {
        self.estimators.as_ref().map(|table| &table[dpy])
    }

    /// Feed a present fence of `dpy` submitted while `period` was in effect
    ///
    /// The fence is dropped when the manager was built without a fence oracle.
    pub fn update_present_fence(&self, dpy: DisplayId, fence: Fence, period: i64) {
        let Some(estimator) = self.estimator(dpy) else {
            return;
        };
        estimator.push_present_fence(fence, period);
        estimator.update();
    }

    /// Predicted hardware vsync of `dpy` after `now`, or -1 when unknown
    pub fn next_hw_vsync(&self, dpy: DisplayId, now: i64) -> i64 {
        self.estimator(dpy).map_or(-1, |e| e.next_hw_vsync(now))
    }

    fn destroy_vsync_thread(&self, dpy: DisplayId) {
        let thread = self.vsync_slot(dpy).clone();
        let Some(thread) = thread else {
            return;
        };
        thread.request_exit();
        thread.set_loop_again();
        // the vsync thread calls back into the manager; join it unlocked
        thread.join();
        *self.vsync_slot(dpy) = None;
        debug!(dpy = %dpy, "Vsync thread destroyed");
    }

    pub fn has_vsync_thread(&self, dpy: DisplayId) -> bool {
        self.vsync_slot(dpy).is_some()
    }

    /// Forward a vsync to the listener, also as the primary's when it borrows this display's vsync
    pub fn vsync(&self, dpy: DisplayId, timestamp: i64, enabled: bool) {
        let Some(listener) = self.listener() else {
            return;
        };
        if !dpy.is_primary() {
            let borrowed = self.lock().basic(DisplayId::PRIMARY).vsync_source == dpy;
            if borrowed {
                listener.on_vsync(DisplayId::PRIMARY, timestamp, enabled);
            }
        }
        listener.on_vsync(dpy, timestamp, enabled);
    }

    /// Connect or disconnect a physical display
    ///
    /// `fake` re-plugs replace the data with a shrunk copy of the primary.
    /// `notify` controls the logical hotplug callback and, for external
    /// connectors, waiting for the downstream acknowledgement.
    pub fn hotplug_ext(&self, dpy: DisplayId, connected: bool, fake: bool, notify: bool) {
        info!(dpy = %dpy, connected, fake, "Hotplug external display");
        let _serial = self.hotplug[dpy].lock().unwrap_or_else(|e| e.into_inner());

        let trigger_by_vsync = self.features.trigger_by_vsync > 0;
        let was_connected = {
            let mut s = self.lock();
            s.basic_mut(dpy).trigger_by_vsync = trigger_by_vsync;
            s.connected[dpy]
        };

        match (connected, was_connected) {
            (true, false) => self.plug_in(dpy, fake, notify, trigger_by_vsync),
            (false, true) => self.plug_out(dpy, fake, notify, trigger_by_vsync),
            _ => debug!(dpy = %dpy, connected, "Hotplug ignored, state unchanged"),
        }
    }

    fn plug_in(&self, dpy: DisplayId, fake: bool, notify: bool, trigger_by_vsync: bool) {
        match self.overlay.update_display_resolution(dpy) {
            Ok(()) => self.set_display_data_for_phy(dpy),
            Err(e) => error!(dpy = %dpy, error = %e, "Display resolution update failed, keeping stale data"),
        }

        if dpy.is_primary() {
            if !self.wait_for_listener() {
                warn!(dpy = %dpy, "No listener registered, giving up hotplug");
                return;
            }
        } else if self.listener().is_none() {
            return;
        }

        if let Err(e) = self.overlay.update_connector_mode(dpy) {
            info!(dpy = %dpy, error = %e, "Hotplug in ended at connector mode update");
            return;
        }

        if let Some(listener) = self.listener() {
            listener.on_plug_in(dpy, false);
        }

        if fake {
            self.clone_shrunk_primary(dpy);
        }

        if let Err(e) = self.create_vsync_thread(dpy) {
            error!(dpy = %dpy, error = %e, "Failed to start vsync thread");
        }

        self.hotplug_post(dpy, true, notify);
        self.lock().connected[dpy] = true;

        if notify {
            if let Some(listener) = self.listener() {
                listener.on_hotplug_ext(dpy, true);
            }
        }
        if trigger_by_vsync {
            self.request_vsync(dpy, true);
        }
        self.dispatcher.ignore_job(dpy, false);

        if dpy.is_primary() {
            info!("Primary display hotplug in done");
            thread::sleep(Duration::from_millis(self.debug.replug_delay_ms));
            return;
        }

        if !self.is_internal(dpy) && notify && !self.ack[dpy].wait_for(true, self.hotplug_timeout()) {
            warn!(dpy = %dpy, "Hotplug in is still not finished");
        }
        info!(dpy = %dpy, "External display hotplug in done");
    }

    fn plug_out(&self, dpy: DisplayId, fake: bool, notify: bool, trigger_by_vsync: bool) {
        self.dispatcher.ignore_job(dpy, true);

        if fake {
            let mut s = self.lock();
            if s.fake_disp_num < 1 {
                warn!(fake_displays = s.fake_disp_num, "Fake display count underflow");
                s.fake_disp_num = 1;
            }
            s.fake_disp_num -= 1;
        }

        if trigger_by_vsync {
            self.request_vsync(dpy, false);
        }
        self.destroy_vsync_thread(dpy);

        if dpy.is_primary() {
            {
                let mut s = self.lock();
                s.active_config = 0;
                s.connected[dpy] = false;
            }
            self.hotplug_post(dpy, false, true);
            {
                let mut s = self.lock();
                let data = s.basic_mut(dpy);
                data.width = PRIMARY_UNPLUGGED_WIDTH;
                data.height = PRIMARY_UNPLUGGED_HEIGHT;
                data.refresh = PRIMARY_UNPLUGGED_REFRESH;
            }
            if let Some(listener) = self.listener() {
                listener.on_plug_out(dpy);
                if notify {
                    // the primary always stays logically connected
                    listener.on_hotplug_ext(dpy, true);
                }
            }
            info!("Primary display hotplug out done");
            return;
        }

        self.lock().connected[dpy] = false;

        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.on_plug_out(dpy);
        }
        self.hotplug_post(dpy, false, true);
        if let (Some(listener), true) = (&listener, notify) {
            listener.on_hotplug_ext(dpy, false);
        }

        if !self.is_internal(dpy) {
            if notify {
                if !self.ack[dpy].wait_for(false, self.hotplug_timeout()) {
                    warn!(dpy = %dpy, "Hotplug out is still not finished");
                }
            } else {
                self.notify_hotplug_out_done(dpy);
            }
        }
        info!(dpy = %dpy, "External display hotplug out done");
    }

    fn wait_for_listener(&self) -> bool {
        for _ in 0..self.debug.listener_wait_retries {
            if self.listener().is_some() {
                return true;
            }
            trace!("Waiting for a listener");
            thread::sleep(Duration::from_millis(self.debug.listener_wait_interval_ms));
        }
        self.listener().is_some()
    }

    fn hotplug_timeout(&self) -> Duration {
        Duration::from_millis(self.debug.hotplug_done_timeout_ms)
    }

    fn is_internal(&self, dpy: DisplayId) -> bool {
        dpy.is_primary() || self.overlay.session_info(dpy).map_or(false, |s| s.internal)
    }

    fn clone_shrunk_primary(&self, dpy: DisplayId) {
        let mut s = self.lock();
        let shrink = match self.debug.fake_shrink {
            FakeShrink::Alternate => {
                s.last_shrink = if s.last_shrink == 2 { 4 } else { 2 };
                s.last_shrink
            }
            FakeShrink::Fixed(n) => n.max(1),
        };
        let mut data = s.basic(DisplayId::PRIMARY).clone();
        data.width /= shrink;
        data.height /= shrink;
        data.subtype = DisplaySubtype::Fake;
        data.update_pixels();
        *s.basic_mut(dpy) = data;
        s.fake_disp_num += 1;
        debug!(dpy = %dpy, shrink, fake_displays = s.fake_disp_num, "Fake display data");
    }

    fn hotplug_post(&self, dpy: DisplayId, connected: bool, print_info: bool) {
        let mut s = self.lock();
        if connected {
            info!(dpy = %dpy, "Added display");
            let main = s.basic(DisplayId::PRIMARY).clone();
            s.basic_mut(dpy).set_mirror_region(&main);
            if print_info {
                print_display_info(dpy, s.basic(dpy));
            }
            s.curr_disp_num += 1;
        } else {
            info!(dpy = %dpy, "Removed display");
            if print_info {
                print_display_info(dpy, s.basic(dpy));
            }
            let configs = &mut s.data[dpy];
            configs.truncate(1);
            configs.shrink_to_fit();
            *s.basic_mut(dpy) = DisplayConfig::default();
            if s.curr_disp_num == 0 {
                warn!(dpy = %dpy, "Display count underflow");
            }
            s.curr_disp_num = s.curr_disp_num.saturating_sub(1);
        }
    }

    pub fn notify_hotplug_in_done(&self, dpy: DisplayId) {
        self.ack[dpy].set(dpy, true);
    }

    pub fn notify_hotplug_out_done(&self, dpy: DisplayId) {
        self.ack[dpy].set(dpy, false);
    }

    /// Connect or disconnect the virtual display with caller-provided geometry
    pub fn hotplug_vir(&self, dpy: DisplayId, connected: bool, width: u32, height: u32, format: u32) {
        if dpy != DisplayId::VIRTUAL {
            warn!(dpy = %dpy, "Virtual hotplug on a non-virtual display");
            return;
        }
        info!(dpy = %dpy, connected, width, height, "Hotplug virtual display");
        let _serial = self.hotplug[dpy].lock().unwrap_or_else(|e| e.into_inner());
        self.lock().basic_mut(dpy).trigger_by_vsync = self.features.trigger_by_vsync > 1;

        if connected {
            self.set_display_data_for_vir(dpy, width, height, format);
            self.hotplug_post(dpy, true, true);
            self.lock().connected[dpy] = true;
            if let Some(listener) = self.listener() {
                listener.on_plug_in(dpy, false);
            }
        } else {
            self.lock().connected[dpy] = false;
            if let Some(listener) = self.listener() {
                listener.on_plug_out(dpy);
            }
            self.hotplug_post(dpy, false, true);
        }
    }

    fn is_wfd(&self, dpy: DisplayId, usage_bits: u32) -> bool {
        let enable_hwc_vds = self.properties.get_i32(props::ENABLE_HWC_VDS, -1);
        // with hardware virtual displays disabled the framework only sends WFD here
        let wfd = enable_hwc_vds == 0 || usage_bits & usage::IS_WFD != 0;
        debug!(dpy = %dpy, wfd, enable_hwc_vds, usage = usage_bits, "WFD check");
        wfd
    }

    fn set_display_data_for_vir(&self, dpy: DisplayId, width: u32, height: u32, format: u32) {
        let usage_bits = self.lock().usage[dpy];
        let wfd = self.is_wfd(dpy, usage_bits);

        let mut s = self.lock();
        let primary = s.basic(DisplayId::PRIMARY).clone();
        let data = s.basic_mut(dpy);
        data.width = width;
        data.height = height;
        data.format = format;
        data.xdpi = primary.xdpi;
        data.ydpi = primary.ydpi;
        data.density = primary.density;
        data.has_vsync = false;
        data.connected = true;
        if wfd {
            data.secure = usage_bits & usage::IS_SECURE != 0;
            data.subtype = DisplaySubtype::Wireless;
            data.hdcp_version = u32::MAX;
        } else {
            data.secure = false;
            data.subtype = DisplaySubtype::Memory;
        }
        let aspect = if height > 0 { width as f32 / height as f32 } else { 0.0 };
        data.aspect_portrait = aspect;
        data.aspect_landscape = aspect;
        data.vsync_source = DisplayId::PRIMARY;
        data.hwrotation = 0;
        data.update_pixels();
    }

    /// Fill the config table of a physical display from its session info
    pub fn set_display_data_for_phy(&self, dpy: DisplayId) {
        if dpy == DisplayId::VIRTUAL {
            error!(dpy = %dpy, "Physical display data requested for the virtual display");
            return;
        }
        let info = match self.overlay.session_info(dpy) {
            Ok(info) => info,
            Err(e) => {
                error!(dpy = %dpy, error = %e, "No session info");
                return;
            }
        };
        let internal = dpy.is_primary() || info.internal;
        if !internal && !info.connected {
            error!(dpy = %dpy, "Failed to add display, not connected");
            return;
        }

        let density = if info.density == 0 { DEFAULT_DENSITY } else { info.density };
        let mut data = DisplayConfig {
            width: info.width,
            height: info.height,
            format: info.format,
            density,
            has_vsync: true,
            connected: info.connected,
            secure: true,
            vsync_source: dpy,
            ..DisplayConfig::default()
        };
        (data.xdpi, data.ydpi) = dpi(&info, info.width, info.height, density as f32);
        data.aspect_portrait = aspect(info.width, info.height);

        if internal {
            data.hdcp_version = u32::MAX;
            data.subtype = DisplaySubtype::Lcm;
            data.aspect_landscape = aspect(info.height, info.width);
            data.mir_portrait = Rect::sized(info.width as i32, info.height as i32);
            data.mir_landscape = data.mir_portrait;
            let fps = self.overlay.mode(dpy, 0).map_or(0, |m| m.fps);
            data.refresh = refresh_period_ns(fps as i32);
            data.hwrotation = rotation(self.properties.get_i32(props::HWROTATION, 0));
            data.trigger_by_vsync = false;
        } else {
            data.hdcp_version = info.hdcp_version;
            info!(dpy = %dpy, hdcp = info.hdcp_version, "External HDCP version");
            data.subtype = DisplaySubtype::HdmiMhl;
            // only valid without physical rotation
            data.aspect_landscape = data.aspect_portrait;
            data.refresh = refresh_period_ns(self.overlay.current_fps(dpy) as i32);
            data.hwrotation = rotation(self.properties.get_i32(props::HWROTATION_EXT, 0));
            data.trigger_by_vsync = self.features.trigger_by_vsync > 0;
        }
        data.group = 0;
        data.update_pixels();

        let mut configs = vec![data];
        self.push_extra_configs(dpy, &info, &mut configs);
        self.lock().data[dpy] = configs;
    }

    fn push_extra_configs(&self, dpy: DisplayId, info: &SessionInfo, configs: &mut Vec<DisplayConfig>) {
        let num_configs = self.overlay.num_configs(dpy);
        if num_configs <= 1 {
            return;
        }
        let basic = configs[0].clone();
        let internal = dpy.is_primary() || info.internal;
        let mut groups: Vec<(u32, u32)> = vec![(basic.width, basic.height)];

        for index in 1..num_configs {
            let Some(mode) = self.overlay.mode(dpy, index) else {
                warn!(dpy = %dpy, index, "Connector mode vanished");
                break;
            };
            let mut extra = basic.clone();
            extra.width = mode.width;
            extra.height = mode.height;
            // internal panels without a physical size report no dpi for extra modes
            let fallback = if internal { 0.0 } else { basic.density as f32 };
            (extra.xdpi, extra.ydpi) = dpi(info, mode.width, mode.height, fallback);
            extra.aspect_portrait = aspect(mode.width, mode.height);
            extra.aspect_landscape = aspect(mode.height, mode.width);
            extra.mir_portrait = Rect::sized(mode.width as i32, mode.height as i32);
            extra.mir_landscape = extra.mir_portrait;
            extra.refresh = refresh_period_ns(mode.fps as i32);
            extra.update_pixels();

            let key = (mode.width, mode.height);
            extra.group = match groups.iter().position(|g| *g == key) {
                Some(group) => group as u32,
                None => {
                    groups.push(key);
                    (groups.len() - 1) as u32
                }
            };
            trace!(dpy = %dpy, index, width = mode.width, height = mode.height,
                fps = mode.fps, group = extra.group, "Extra config");
            configs.push(extra);
        }
    }

    /// Recompute the mirror regions of `dpy` against the primary
    pub fn set_mirror_region(&self, dpy: DisplayId) {
        let mut s = self.lock();
        let main = s.basic(DisplayId::PRIMARY).clone();
        s.basic_mut(dpy).set_mirror_region(&main);
    }

    pub fn request_vsync(&self, dpy: DisplayId, enabled: bool) {
        if let Some(thread) = self.vsync_slot(dpy).as_ref() {
            thread.set_enabled(enabled);
        }
    }

    pub fn request_next_vsync(&self, dpy: DisplayId) {
        if let Some(thread) = self.vsync_slot(dpy).as_ref() {
            thread.set_loop_again();
        }
    }

    pub fn update_vsync_thread_period(&self, dpy: DisplayId, period: i64) {
        if let Some(thread) = self.vsync_slot(dpy).as_ref() {
            thread.update_period(period);
        }
        if let Some(estimator) = self.estimator(dpy) {
            if period > 0 {
                estimator.reset_avg_period(period);
            }
        }
    }

    /// Re-read vsync property overrides on every live vsync thread
    pub fn refresh_vsync_properties(&self) {
        for dpy in DisplayId::all() {
            if let Some(thread) = self.vsync_slot(dpy).as_ref() {
                thread.set_property(self.properties.as_ref());
            }
        }
    }

    pub fn update_vsync_period_timing_change(
        &self,
        dpy: DisplayId,
        applied_time: i64,
        refresh_required: bool,
        refresh_time: i64,
    ) {
        if let Some(listener) = self.listener() {
            listener.on_vsync_period_timing_change(dpy, applied_time, refresh_required, refresh_time);
        }
    }

    pub fn refresh_for_display(&self, dpy: DisplayId, kind: RefreshKind) {
        if let Some(listener) = self.listener() {
            trace!(dpy = %dpy, ?kind, "Refresh requested");
            listener.on_refresh(dpy, kind);
        }
    }

    /// Pick the primary's vsync source for a smartbook setup
    pub fn set_power_mode(&self, dpy: DisplayId, mode: PowerMode) {
        if !dpy.is_primary() {
            return;
        }
        let mut s = self.lock();
        let ext = s.basic(DisplayId::EXTERNAL);
        if ext.connected && ext.subtype == DisplaySubtype::Smartbook {
            let source = if mode == PowerMode::Off {
                DisplayId::EXTERNAL
            } else {
                DisplayId::PRIMARY
            };
            debug!(?mode, source = %source, "Primary vsync source");
            s.basic_mut(dpy).vsync_source = source;
        }
    }

    pub fn set_display_power_state(&self, dpy: DisplayId, mode: PowerMode) {
        self.lock().power_on[dpy] = mode != PowerMode::Off;
    }

    pub fn display_power_state(&self, dpy: DisplayId) -> bool {
        self.lock().power_on[dpy]
    }

    pub fn is_all_display_off(&self) -> bool {
        let s = self.lock();
        let all_off = s.power_on.iter().all(|(_, on)| !*on);
        all_off
    }

    pub fn set_video_hdcp(&self, version: u32) {
        if let Ok(mut hdcp) = self.video_hdcp.write() {
            *hdcp = version;
        }
    }

    pub fn video_hdcp(&self) -> u32 {
        self.video_hdcp.read().map_or(u32::MAX, |v| *v)
    }

    pub fn set_hdmi_change_state(&self, dpy: DisplayId, changing: bool) {
        self.lock().hdmi_change[dpy] = changing;
    }

    pub fn hdmi_change_state(&self, dpy: DisplayId) -> bool {
        self.lock().hdmi_change[dpy]
    }

    pub fn set_usage(&self, dpy: DisplayId, usage_bits: u32) {
        self.lock().usage[dpy] = usage_bits;
    }

    pub fn set_active_config(&self, dpy: DisplayId, config: usize) -> Result<()> {
        let mut s = self.lock();
        if config >= s.data[dpy].len() {
            return Err(Error::BadConfig { dpy, config });
        }
        if dpy.is_primary() {
            s.active_config = config;
        }
        Ok(())
    }

    /// Active config index; only the primary tracks one
    pub fn active_config(&self, dpy: DisplayId) -> usize {
        if dpy.is_primary() {
            self.lock().active_config
        } else {
            0
        }
    }

    pub fn display_config(&self, dpy: DisplayId, config: usize) -> Option<DisplayConfig> {
        self.lock().data[dpy].get(config).cloned()
    }

    pub fn num_configs(&self, dpy: DisplayId) -> usize {
        self.lock().data[dpy].len()
    }

    pub fn is_connected(&self, dpy: DisplayId) -> bool {
        self.lock().connected[dpy]
    }

    pub fn number_plugin_display(&self) -> u32 {
        self.lock().curr_disp_num
    }

    pub fn fake_display_count(&self) -> u32 {
        self.lock().fake_disp_num
    }

    /// Stop every vsync thread; used on daemon exit
    pub fn shutdown(&self) {
        for dpy in DisplayId::all() {
            self.destroy_vsync_thread(dpy);
        }
    }
}

impl VsyncSink for DisplayManager {
    fn on_vsync(&self, dpy: DisplayId, timestamp: i64, enabled: bool) {
        self.vsync(dpy, timestamp, enabled);
    }
}

fn aspect(num: u32, den: u32) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Dots per inch from the physical size, or `fallback` when it is unknown
fn dpi(info: &SessionInfo, width: u32, height: u32, fallback: f32) -> (f32, f32) {
    let axis = |pixels: u32, um: u32| {
        if um == 0 {
            fallback
        } else {
            pixels as f32 * 25.4 * 1000.0 / um as f32
        }
    };
    (
        axis(width, info.physical_width_um),
        axis(height, info.physical_height_um),
    )
}

fn rotation(degrees: i32) -> u32 {
    (degrees / 90).rem_euclid(4) as u32
}

fn print_display_info(dpy: DisplayId, data: &DisplayConfig) {
    info!(
        dpy = %dpy,
        width = data.width,
        height = data.height,
        xdpi = data.xdpi,
        ydpi = data.ydpi,
        density = data.density,
        refresh = data.refresh,
        subtype = ?data.subtype,
        secure = data.secure,
        hdcp = data.hdcp_version,
        hwrotation = data.hwrotation,
        "Display info"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::config::{MemoryProperties, ModeSpec, SimulatedDisplay};
    use crate::fence::testing::{dummy_fence, ScriptedOracle};
    use crate::fence::FenceStatus;
    use crate::overlay::SimulatedOverlay;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        PlugIn(DisplayId, bool),
        PlugOut(DisplayId),
        HotplugExt(DisplayId, bool),
        Refresh(DisplayId, RefreshKind),
        TimingChange(DisplayId, i64),
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<Event>>,
        vsyncs: Mutex<Vec<DisplayId>>,
        vsync_times: Mutex<Vec<i64>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl EventListener for RecordingListener {
        fn on_plug_in(&self, dpy: DisplayId, boot: bool) {
            self.push(Event::PlugIn(dpy, boot));
        }
        fn on_plug_out(&self, dpy: DisplayId) {
            self.push(Event::PlugOut(dpy));
        }
        fn on_hotplug_ext(&self, dpy: DisplayId, connected: bool) {
            self.push(Event::HotplugExt(dpy, connected));
        }
        fn on_vsync(&self, dpy: DisplayId, timestamp: i64, _enabled: bool) {
            self.vsyncs.lock().unwrap().push(dpy);
            self.vsync_times.lock().unwrap().push(timestamp);
        }
        fn on_refresh(&self, dpy: DisplayId, kind: RefreshKind) {
            self.push(Event::Refresh(dpy, kind));
        }
        fn on_vsync_period_timing_change(&self, dpy: DisplayId, applied_time: i64, _r: bool, _t: i64) {
            self.push(Event::TimingChange(dpy, applied_time));
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<(DisplayId, bool)>>,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn ignore_job(&self, dpy: DisplayId, ignore: bool) {
            self.calls.lock().unwrap().push((dpy, ignore));
        }
    }

    fn external(modes: Vec<ModeSpec>) -> SimulatedDisplay {
        SimulatedDisplay {
            id: 1,
            width: 1920,
            height: 1080,
            physical_width_mm: 0,
            physical_height_mm: 0,
            internal: false,
            hdcp_version: 2,
            modes,
            ..SimulatedDisplay::default()
        }
    }

    struct Fixture {
        manager: Arc<DisplayManager>,
        listener: Arc<RecordingListener>,
        dispatcher: Arc<RecordingDispatcher>,
        properties: Arc<MemoryProperties>,
    }

    fn fixture(displays: Vec<SimulatedDisplay>) -> Fixture {
        let mut config = HwcConfig::default();
        config.debug.hotplug_done_timeout_ms = 20;
        config.debug.replug_delay_ms = 0;
        config.debug.listener_wait_retries = 2;
        let overlay = Arc::new(SimulatedOverlay::new(&displays));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let properties = Arc::new(MemoryProperties::new());
        let manager = DisplayManager::new(config, overlay, dispatcher.clone(), properties.clone());
        let listener = Arc::new(RecordingListener::default());
        manager.set_listener(listener.clone());
        Fixture {
            manager,
            listener,
            dispatcher,
            properties,
        }
    }

    fn mode(width: u32, height: u32, fps: u32) -> ModeSpec {
        ModeSpec { width, height, fps }
    }

    #[test]
    fn test_init_internal_primary() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();

        assert_eq!(f.manager.number_plugin_display(), 1);
        assert!(f.manager.is_connected(DisplayId::PRIMARY));
        assert!(f.manager.display_power_state(DisplayId::PRIMARY));
        assert!(f.manager.has_vsync_thread(DisplayId::PRIMARY));
        assert_eq!(
            f.listener.events(),
            vec![
                Event::PlugIn(DisplayId::PRIMARY, true),
                Event::HotplugExt(DisplayId::PRIMARY, true)
            ]
        );

        let data = f.manager.display_config(DisplayId::PRIMARY, 0).unwrap();
        assert_eq!((data.width, data.height), (1080, 2340));
        assert_eq!(data.subtype, DisplaySubtype::Lcm);
        assert_eq!(data.density, DEFAULT_DENSITY);
        assert_eq!(data.refresh, 16_666_667);
        assert_eq!(data.hdcp_version, u32::MAX);
        // 1080 px over 68 mm
        assert!((data.xdpi - 403.41).abs() < 0.1, "xdpi {}", data.xdpi);
        f.manager.shutdown();
        assert!(!f.manager.has_vsync_thread(DisplayId::PRIMARY));
    }

    #[test]
    fn test_external_connect_disconnect_balances_counter() {
        let f = fixture(vec![SimulatedDisplay::default(), external(Vec::new())]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();

        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, false, true);
        assert_eq!(f.manager.number_plugin_display(), 2);
        assert!(f.manager.has_vsync_thread(DisplayId::EXTERNAL));
        let data = f.manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        assert_eq!(data.subtype, DisplaySubtype::HdmiMhl);
        assert_eq!(data.hdcp_version, 2);
        assert_eq!(data.xdpi, DEFAULT_DENSITY as f32);

        // a second connect is a no-op
        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, false, true);
        assert_eq!(f.manager.number_plugin_display(), 2);

        f.manager.hotplug_ext(DisplayId::EXTERNAL, false, false, true);
        assert_eq!(f.manager.number_plugin_display(), 1);
        assert!(!f.manager.has_vsync_thread(DisplayId::EXTERNAL));
        assert!(!f.manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(f.manager.num_configs(DisplayId::EXTERNAL), 1);
        assert_eq!(f.manager.display_config(DisplayId::EXTERNAL, 0).unwrap().width, 0);

        let events = f.listener.events();
        assert!(events.contains(&Event::PlugIn(DisplayId::EXTERNAL, false)));
        assert!(events.contains(&Event::HotplugExt(DisplayId::EXTERNAL, true)));
        assert!(events.contains(&Event::PlugOut(DisplayId::EXTERNAL)));
        assert!(events.contains(&Event::HotplugExt(DisplayId::EXTERNAL, false)));

        let calls = f.dispatcher.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(DisplayId::EXTERNAL, false), (DisplayId::EXTERNAL, true)]);
        f.manager.shutdown();
    }

    #[test]
    fn test_mirror_region_against_portrait_primary() {
        let f = fixture(vec![SimulatedDisplay::default(), external(Vec::new())]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();
        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);

        let data = f.manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        // pillarbox the portrait primary, letterbox its landscape form
        assert_eq!(data.mir_portrait, Rect::new(711, 0, 1209, 1080));
        assert_eq!(data.mir_landscape, Rect::new(0, 97, 1920, 983));
        f.manager.shutdown();
    }

    #[test]
    fn test_extra_configs_group_by_size() {
        let modes = vec![
            mode(1920, 1080, 60),
            mode(1280, 720, 60),
            mode(1920, 1080, 30),
            mode(3840, 2160, 30),
        ];
        let f = fixture(vec![SimulatedDisplay::default(), external(modes)]);
        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);

        assert_eq!(f.manager.num_configs(DisplayId::EXTERNAL), 4);
        let groups: Vec<u32> = (0..4)
            .map(|i| f.manager.display_config(DisplayId::EXTERNAL, i).unwrap().group)
            .collect();
        assert_eq!(groups, vec![0, 1, 0, 2]);
        let slow = f.manager.display_config(DisplayId::EXTERNAL, 2).unwrap();
        assert_eq!(slow.refresh, 33_333_333);
        assert_eq!(slow.mir_portrait, Rect::sized(1920, 1080));
        f.manager.shutdown();
    }

    #[test]
    fn test_fake_connect_shrinks_primary() {
        let f = fixture(vec![SimulatedDisplay::default(), external(Vec::new())]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();

        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, true, false);
        let data = f.manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        assert_eq!((data.width, data.height), (540, 1170));
        assert_eq!(data.subtype, DisplaySubtype::Fake);
        assert_eq!(f.manager.fake_display_count(), 1);

        f.manager.hotplug_ext(DisplayId::EXTERNAL, false, true, false);
        assert_eq!(f.manager.fake_display_count(), 0);
        f.manager.hotplug_ext(DisplayId::EXTERNAL, true, true, false);
        let data = f.manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        assert_eq!((data.width, data.height), (270, 585));
        f.manager.shutdown();
    }

    #[test]
    fn test_hotplug_waits_for_acknowledgement() {
        let mut config = HwcConfig::default();
        config.debug.hotplug_done_timeout_ms = 5000;
        let overlay = Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default(), external(Vec::new())]));
        let manager = DisplayManager::new(
            config,
            overlay,
            Arc::new(RecordingDispatcher::default()),
            Arc::new(MemoryProperties::new()),
        );
        manager.set_listener(Arc::new(RecordingListener::default()));

        let acker = manager.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            acker.notify_hotplug_in_done(DisplayId::EXTERNAL);
        });
        let start = Instant::now();
        manager.hotplug_ext(DisplayId::EXTERNAL, true, false, true);
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_virtual_display_wfd_detection() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();

        f.manager.hotplug_vir(DisplayId::VIRTUAL, true, 1280, 720, 1);
        let data = f.manager.display_config(DisplayId::VIRTUAL, 0).unwrap();
        assert_eq!(data.subtype, DisplaySubtype::Memory);
        assert!(!data.secure);
        assert!(!data.has_vsync);
        assert_eq!(data.density, DEFAULT_DENSITY);
        assert_eq!(f.manager.number_plugin_display(), 2);
        f.manager.hotplug_vir(DisplayId::VIRTUAL, false, 0, 0, 0);
        assert_eq!(f.manager.number_plugin_display(), 1);

        f.manager.set_usage(DisplayId::VIRTUAL, usage::IS_WFD | usage::IS_SECURE);
        f.manager.hotplug_vir(DisplayId::VIRTUAL, true, 1280, 720, 1);
        let data = f.manager.display_config(DisplayId::VIRTUAL, 0).unwrap();
        assert_eq!(data.subtype, DisplaySubtype::Wireless);
        assert!(data.secure);
        assert_eq!(data.hdcp_version, u32::MAX);
        f.manager.hotplug_vir(DisplayId::VIRTUAL, false, 0, 0, 0);

        f.manager.set_usage(DisplayId::VIRTUAL, 0);
        f.properties.set(props::ENABLE_HWC_VDS, "0");
        f.manager.hotplug_vir(DisplayId::VIRTUAL, true, 1280, 720, 1);
        let data = f.manager.display_config(DisplayId::VIRTUAL, 0).unwrap();
        assert_eq!(data.subtype, DisplaySubtype::Wireless);
        assert!(!data.secure);
        f.manager.shutdown();
    }

    #[test]
    fn test_virtual_hotplug_rejects_other_slots() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        f.manager.hotplug_vir(DisplayId::EXTERNAL, true, 1280, 720, 1);
        assert_eq!(f.manager.number_plugin_display(), 0);
    }

    #[test]
    fn test_primary_borrows_external_vsync_when_off() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        {
            let mut s = f.manager.lock();
            let ext = s.basic_mut(DisplayId::EXTERNAL);
            ext.connected = true;
            ext.subtype = DisplaySubtype::Smartbook;
        }
        f.manager.set_power_mode(DisplayId::PRIMARY, PowerMode::Off);
        f.manager.vsync(DisplayId::EXTERNAL, 100, true);
        assert_eq!(
            *f.listener.vsyncs.lock().unwrap(),
            vec![DisplayId::PRIMARY, DisplayId::EXTERNAL]
        );

        f.manager.set_power_mode(DisplayId::PRIMARY, PowerMode::On);
        f.manager.vsync(DisplayId::EXTERNAL, 200, true);
        assert_eq!(f.listener.vsyncs.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_power_and_config_accessors() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        assert!(f.manager.is_all_display_off());
        f.manager.set_display_power_state(DisplayId::EXTERNAL, PowerMode::Doze);
        assert!(!f.manager.is_all_display_off());
        f.manager.set_display_power_state(DisplayId::EXTERNAL, PowerMode::Off);
        assert!(f.manager.is_all_display_off());

        assert_eq!(f.manager.video_hdcp(), u32::MAX);
        f.manager.set_video_hdcp(1);
        assert_eq!(f.manager.video_hdcp(), 1);

        assert!(f.manager.set_active_config(DisplayId::PRIMARY, 3).is_err());
        f.manager.set_active_config(DisplayId::PRIMARY, 0).unwrap();
        assert_eq!(f.manager.active_config(DisplayId::EXTERNAL), 0);

        f.manager.refresh_for_display(DisplayId::PRIMARY, RefreshKind::ConfigChange);
        f.manager.update_vsync_period_timing_change(DisplayId::PRIMARY, 42, true, 50);
        assert_eq!(
            f.listener.events(),
            vec![
                Event::Refresh(DisplayId::PRIMARY, RefreshKind::ConfigChange),
                Event::TimingChange(DisplayId::PRIMARY, 42)
            ]
        );
    }

    #[test]
    fn test_recreated_vsync_thread_joins_the_old_one() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        f.manager.init_internal(DisplayId::PRIMARY).unwrap();
        let old = f.manager.vsync_slot(DisplayId::PRIMARY).clone().unwrap();
        assert!(old.is_running());

        f.manager.create_vsync_thread(DisplayId::PRIMARY).unwrap();
        assert!(!old.is_running());
        let current = f.manager.vsync_slot(DisplayId::PRIMARY).clone().unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert!(current.is_running());
        f.manager.shutdown();
        assert!(!current.is_running());
    }

    #[test]
    fn test_present_fences_phase_software_vsync() {
        let mut config = HwcConfig::default();
        config.debug.force_sw_vsync = true;
        let oracle = Arc::new(ScriptedOracle::new());
        let overlay = Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default()]));
        let manager = DisplayManager::with_fence_oracle(
            config,
            overlay,
            Arc::new(RecordingDispatcher::default()),
            Arc::new(MemoryProperties::new()),
            oracle.clone(),
        );
        let listener = Arc::new(RecordingListener::default());
        manager.set_listener(listener.clone());
        manager.init_internal(DisplayId::PRIMARY).unwrap();

        let period = manager.display_config(DisplayId::PRIMARY, 0).unwrap().refresh;
        let last = clock::monotonic_now() - 3_000_000;
        assert_eq!(manager.next_hw_vsync(DisplayId::PRIMARY, last), -1);
        let fences = [dummy_fence(), dummy_fence()];
        for (fence, t) in fences.into_iter().zip([last - period, last]) {
            oracle.set(&fence, FenceStatus::Signaled(t));
            manager.update_present_fence(DisplayId::PRIMARY, fence, period);
        }
        assert_eq!(manager.next_hw_vsync(DisplayId::PRIMARY, last + 1), last + period);

        manager.request_vsync(DisplayId::PRIMARY, true);
        std::thread::sleep(Duration::from_millis(60));
        manager.shutdown();

        let times = listener.vsync_times.lock().unwrap().clone();
        assert!(times.len() >= 2, "got {} vsyncs", times.len());
        assert!(times.iter().all(|t| (t - last) % period == 0), "{:?}", times);
    }

    #[test]
    fn test_present_fences_ignored_without_oracle() {
        let f = fixture(vec![SimulatedDisplay::default()]);
        f.manager.update_present_fence(DisplayId::PRIMARY, dummy_fence(), 16_666_667);
        assert_eq!(f.manager.next_hw_vsync(DisplayId::PRIMARY, 1_000), -1);
    }
}
