//! Serialized HDMI and display-config change requests
//!
//! Mode changes on external connectors are applied by re-plugging the
//! display, which blocks for tens of milliseconds and may wait on the
//! framework. Requests are queued and applied one at a time on a worker.

use crate::display::DisplayId;
use crate::display_manager::DisplayManager;
use crate::overlay::{ModeInfo, SupportedMode};
use crate::worker::Worker;
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Mode used when the framework asks for the config one past the last
const FALLBACK_MODE: ModeInfo = ModeInfo::new(1920, 1080, 60);

/// A setting pushed by the HDMI service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdmiSetting {
    /// HDMI service resolution code
    Resolution(u32),
    Enable(bool),
}

/// Map an HDMI service resolution code to a connector mode
pub fn hdmi_resolution_mode(code: u32) -> Option<ModeInfo> {
    let (width, height, fps) = match code {
        2 => (720, 480, 60),
        3 => (720, 576, 50),
        4 | 15 => (1280, 720, 60),
        5 | 16 => (1280, 720, 50),
        8 => (1920, 1080, 30),
        9 => (1920, 1080, 25),
        10 | 19 => (1920, 1080, 24),
        11 | 20 => (1920, 1080, 23),
        12 => (1920, 1080, 29),
        13 => (1920, 1080, 60),
        14 => (1920, 1080, 50),
        22 => (3840, 2160, 24),
        23 => (3840, 2160, 25),
        25 => (3840, 2160, 30),
        27 => (3840, 2160, 60),
        28 => (3840, 2160, 50),
        _ => return None,
    };
    Some(ModeInfo::new(width, height, fps))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeRequest {
    SetActiveConfig { dpy: DisplayId, config: usize },
    Hdmi { dpy: DisplayId, setting: HdmiSetting },
}

#[derive(Default)]
struct Queue {
    requests: VecDeque<ModeRequest>,
    busy: bool,
    stop: bool,
}

struct Shared {
    manager: Arc<DisplayManager>,
    replug_delay: Duration,
    queue: Mutex<Queue>,
    /// Signaled when work is queued or a stop is requested
    work: Condvar,
    /// Signaled when the queue drains
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct ModeHandler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ModeHandler {
    pub fn new(manager: Arc<DisplayManager>, replug_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                replug_delay,
                queue: Mutex::new(Queue::default()),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        self.shared.lock().stop = false;
        let shared = self.shared.clone();
        *slot = Some(Worker::spawn("ModeHandle", move || run(&shared))?);
        Ok(())
    }

    pub fn stop(&self) {
        {
            let mut q = self.shared.lock();
            q.stop = true;
            self.shared.work.notify_all();
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join();
        }
    }

    pub fn send_set_active_config(&self, dpy: DisplayId, config: usize) {
        self.push(ModeRequest::SetActiveConfig { dpy, config });
    }

    pub fn send_hdmi_setting(&self, dpy: DisplayId, setting: HdmiSetting) {
        self.push(ModeRequest::Hdmi { dpy, setting });
    }

    fn push(&self, request: ModeRequest) {
        let mut q = self.shared.lock();
        debug!(?request, "Queued mode request");
        q.requests.push_back(request);
        self.shared.work.notify_one();
    }

    /// Wait until every queued request has been handled
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let q = self.shared.lock();
        let (_q, result) = self
            .shared
            .idle
            .wait_timeout_while(q, timeout, |q| q.busy || !q.requests.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }
}

impl Drop for ModeHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    loop {
        let request = {
            let mut q = shared.lock();
            loop {
                if q.stop {
                    return;
                }
                if let Some(request) = q.requests.pop_front() {
                    q.busy = true;
                    break request;
                }
                q.busy = false;
                shared.idle.notify_all();
                q = shared.work.wait(q).unwrap_or_else(|e| e.into_inner());
            }
        };

        match request {
            ModeRequest::SetActiveConfig { dpy, config } => handle_set_active_config(shared, dpy, config),
            ModeRequest::Hdmi { dpy, setting } => handle_hdmi_setting(shared, dpy, setting),
        }
    }
}

fn handle_set_active_config(shared: &Shared, dpy: DisplayId, config: usize) {
    let manager = &shared.manager;
    let overlay = manager.overlay();
    let max_config = overlay.num_configs(dpy);
    if config > max_config {
        error!(dpy = %dpy, config, max_config, "Config out of range");
        return;
    }
    let wanted = if config < max_config {
        overlay.mode(dpy, config).unwrap_or(FALLBACK_MODE)
    } else {
        FALLBACK_MODE
    };
    info!(dpy = %dpy, width = wanted.width, height = wanted.height, fps = wanted.fps, "Set active config");

    match overlay.supported_connector_mode(dpy, &wanted) {
        SupportedMode::Index(index) => {
            info!(dpy = %dpy, index, "Switching connector mode");
            overlay.select_connector_mode(dpy, index);
            manager.set_hdmi_change_state(dpy, true);
            manager.hotplug_ext(dpy, false, true, true);
            thread::sleep(shared.replug_delay);
            manager.hotplug_ext(dpy, true, true, true);
            manager.set_hdmi_change_state(dpy, false);
            info!(dpy = %dpy, "Resolution change done");
        }
        other => warn!(dpy = %dpy, config, ?other, "Mode not supported or already in use"),
    }
}

fn handle_hdmi_setting(shared: &Shared, dpy: DisplayId, setting: HdmiSetting) {
    let manager = &shared.manager;
    let overlay = manager.overlay();
    match setting {
        HdmiSetting::Resolution(code) => {
            let wanted = hdmi_resolution_mode(code).unwrap_or(ModeInfo::new(0, 0, 0));
            let connected = manager.is_connected(dpy);
            let index = match overlay.supported_connector_mode(dpy, &wanted) {
                SupportedMode::Index(index) => Some(index),
                // replug a cable-less display even if the mode did not change
                SupportedMode::AlreadyCurrent if !connected => Some(0),
                _ => None,
            };
            let Some(index) = index else {
                debug!(dpy = %dpy, code, "Resolution not supported or already in use");
                return;
            };
            info!(dpy = %dpy, index, width = wanted.width, height = wanted.height, "HDMI resolution change");
            if index > 0 || connected {
                overlay.select_connector_mode(dpy, index);
            }
            manager.set_hdmi_change_state(dpy, true);
            if connected {
                // skip the logical notification to avoid two hotplugs in a row
                manager.hotplug_ext(dpy, false, false, false);
            }
            manager.hotplug_ext(dpy, true, false, true);
            manager.set_hdmi_change_state(dpy, false);
        }
        HdmiSetting::Enable(enable) => {
            let enabled = overlay.hdmi_enabled(dpy);
            if !enable && enabled {
                manager.set_hdmi_change_state(dpy, true);
                manager.hotplug_ext(dpy, false, false, true);
                overlay.set_hdmi_enabled(dpy, false);
                manager.set_hdmi_change_state(dpy, false);
                info!(dpy = %dpy, "HDMI turned off");
            } else if enable && !enabled {
                manager.set_hdmi_change_state(dpy, true);
                overlay.set_hdmi_enabled(dpy, true);
                thread::sleep(shared.replug_delay);
                manager.hotplug_ext(dpy, true, false, true);
                manager.set_hdmi_change_state(dpy, false);
                info!(dpy = %dpy, "HDMI turned on");
            } else {
                warn!(dpy = %dpy, enable, enabled, "HDMI already in the requested state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HwcConfig, MemoryProperties, ModeSpec, SimulatedDisplay};
    use crate::overlay::{JobDispatcher, SimulatedOverlay};

    struct NoDispatch;

    impl JobDispatcher for NoDispatch {
        fn ignore_job(&self, _dpy: DisplayId, _ignore: bool) {}
    }

    struct Listener;

    impl crate::display_manager::EventListener for Listener {
        fn on_plug_in(&self, _dpy: DisplayId, _boot: bool) {}
        fn on_plug_out(&self, _dpy: DisplayId) {}
        fn on_hotplug_ext(&self, _dpy: DisplayId, _connected: bool) {}
        fn on_vsync(&self, _dpy: DisplayId, _timestamp: i64, _enabled: bool) {}
        fn on_refresh(&self, _dpy: DisplayId, _kind: crate::hal::RefreshKind) {}
        fn on_vsync_period_timing_change(&self, _dpy: DisplayId, _a: i64, _r: bool, _t: i64) {}
    }

    fn setup() -> (Arc<DisplayManager>, ModeHandler) {
        let mut config = HwcConfig::default();
        config.debug.hotplug_done_timeout_ms = 10;
        config.debug.replug_delay_ms = 0;
        let external = SimulatedDisplay {
            id: 1,
            width: 1920,
            height: 1080,
            internal: false,
            modes: vec![
                ModeSpec { width: 1920, height: 1080, fps: 60 },
                ModeSpec { width: 1280, height: 720, fps: 60 },
            ],
            ..SimulatedDisplay::default()
        };
        let overlay = Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default(), external]));
        let manager = DisplayManager::new(config, overlay, Arc::new(NoDispatch), Arc::new(MemoryProperties::new()));
        manager.set_listener(Arc::new(Listener));
        let handler = ModeHandler::new(manager.clone(), Duration::ZERO);
        handler.start().unwrap();
        (manager, handler)
    }

    #[test]
    fn test_resolution_codes() {
        assert_eq!(hdmi_resolution_mode(13), Some(ModeInfo::new(1920, 1080, 60)));
        assert_eq!(hdmi_resolution_mode(16), Some(ModeInfo::new(1280, 720, 50)));
        assert_eq!(hdmi_resolution_mode(27), Some(ModeInfo::new(3840, 2160, 60)));
        assert_eq!(hdmi_resolution_mode(6), None);
    }

    #[test]
    fn test_hdmi_resolution_replugs_in_new_mode() {
        let (manager, handler) = setup();
        manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);

        handler.send_hdmi_setting(DisplayId::EXTERNAL, HdmiSetting::Resolution(4));
        assert!(handler.wait_idle(Duration::from_secs(3)));

        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert!(!manager.hdmi_change_state(DisplayId::EXTERNAL));
        let data = manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        assert_eq!((data.width, data.height), (1280, 720));
        assert_eq!(manager.number_plugin_display(), 1);
        handler.stop();
        manager.shutdown();
    }

    #[test]
    fn test_unsupported_resolution_is_ignored() {
        let (manager, handler) = setup();
        manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);
        handler.send_hdmi_setting(DisplayId::EXTERNAL, HdmiSetting::Resolution(27));
        handler.send_set_active_config(DisplayId::EXTERNAL, 7);
        assert!(handler.wait_idle(Duration::from_secs(3)));
        let data = manager.display_config(DisplayId::EXTERNAL, 0).unwrap();
        assert_eq!(data.width, 1920);
        handler.stop();
        manager.shutdown();
    }

    #[test]
    fn test_set_active_config_replugs() {
        let (manager, handler) = setup();
        manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);
        handler.send_set_active_config(DisplayId::EXTERNAL, 1);
        assert!(handler.wait_idle(Duration::from_secs(3)));
        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(manager.overlay().current_fps(DisplayId::EXTERNAL), 60);
        assert_eq!(manager.overlay().session_info(DisplayId::EXTERNAL).unwrap().width, 1280);
        assert_eq!(manager.fake_display_count(), 1);
        handler.stop();
        manager.shutdown();
    }

    #[test]
    fn test_hdmi_enable_toggles_connection() {
        let (manager, handler) = setup();
        manager.hotplug_ext(DisplayId::EXTERNAL, true, false, false);

        handler.send_hdmi_setting(DisplayId::EXTERNAL, HdmiSetting::Enable(false));
        assert!(handler.wait_idle(Duration::from_secs(3)));
        assert!(!manager.is_connected(DisplayId::EXTERNAL));
        assert!(!manager.overlay().hdmi_enabled(DisplayId::EXTERNAL));

        handler.send_hdmi_setting(DisplayId::EXTERNAL, HdmiSetting::Enable(true));
        assert!(handler.wait_idle(Duration::from_secs(3)));
        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert!(manager.overlay().hdmi_enabled(DisplayId::EXTERNAL));
        handler.stop();
        manager.shutdown();
    }
}
