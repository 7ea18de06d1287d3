//! Kernel uevent listener for cable and content-protection events
//!
//! Reads `NETLINK_KOBJECT_UEVENT` datagrams and turns switch-device changes
//! into hotplug, HDCP and refresh calls on the `DisplayManager`.

use crate::config::{props, PropertyStore};
use crate::display::{DisplayId, DisplayTable};
use crate::display_manager::DisplayManager;
use crate::hal::RefreshKind;
use crate::worker::Worker;
use crate::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 4096;
const SOCKET_RCVBUF: libc::c_int = 64 * 1024;

/// `vendor.debug.hwc.test_hdmi_connect` values
const FAKE_HDMI_NONE: i32 = 0;
const FAKE_HDMI_PLUG: i32 = 1;
const FAKE_HDMI_UNPLUG: i32 = 2;

/// HDMI receiver notifications carried in `SWITCH_STATE`
mod hdmirx {
    pub const PWR_5V_CHANGE: i32 = 0;
    pub const TIMING_LOCK: i32 = 1;
    pub const TIMING_UNLOCK: i32 = 2;
    pub const AVI_INFO_CHANGE: i32 = 6;
    pub const PLUG_OUT: i32 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UEventKind {
    Hdmi,
    HdmiResolution,
    Widevine,
    Dptx,
    Edptx,
    HdmiRx,
}

impl UEventKind {
    fn from_action(action: &str) -> Option<Self> {
        Some(match action {
            "change@/devices/virtual/switch/hdmi" => UEventKind::Hdmi,
            "change@/devices/virtual/switch/res_hdmi" => UEventKind::HdmiResolution,
            "change@/devices/virtual/switch/widevine" => UEventKind::Widevine,
            "change@/devices/virtual/dptxswitch/dptx" => UEventKind::Dptx,
            "change@/devices/virtual/edptxswitch/edptx" => UEventKind::Edptx,
            "change@/devices/virtual/hdmirxswitch/hdmi" => UEventKind::HdmiRx,
            _ => return None,
        })
    }

    fn is_cable(self) -> bool {
        matches!(self, UEventKind::Hdmi | UEventKind::Dptx | UEventKind::Edptx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UEvent {
    pub kind: UEventKind,
    pub state: i32,
    pub dpy: DisplayId,
}

/// Leading-integer parse; garbage reads as 0
fn parse_int(value: &str) -> i64 {
    let value = value.trim_start();
    let end = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(value.len(), |(i, _)| i);
    value[..end].parse().unwrap_or(0)
}

/// Parse one uevent datagram
///
/// Returns `None` for events this composer does not care about and for
/// events naming a CRTC outside the display table.
pub fn parse_uevent(buf: &[u8]) -> Option<UEvent> {
    let mut fields = buf
        .split(|&b| b == 0)
        .map(String::from_utf8_lossy);
    let action = fields.next()?;
    let kind = UEventKind::from_action(&action)?;
    debug!(action = %action, len = buf.len(), "uevent");

    let mut event = UEvent {
        kind,
        state: 0,
        dpy: DisplayId::EXTERNAL,
    };
    for field in fields {
        if let Some(value) = field.strip_prefix("SWITCH_STATE=") {
            event.state = parse_int(value) as i32;
        } else if let Some(value) = field.strip_prefix("CRTC=") {
            let raw = parse_int(value);
            let Some(dpy) = u64::try_from(raw).ok().and_then(DisplayId::new) else {
                error!(crtc = raw, "uevent names an invalid display");
                return None;
            };
            event.dpy = dpy;
        } else if !field.is_empty() {
            trace!(field = %field, "uevent field");
        }
    }
    Some(event)
}

/// Applies parsed uevents to the display manager
pub struct UEventHandler {
    manager: Arc<DisplayManager>,
    replug_delay: Duration,
    is_hotplug: DisplayTable<bool>,
    fake_hotplug: bool,
}

impl UEventHandler {
    pub fn new(manager: Arc<DisplayManager>, replug_delay: Duration) -> Self {
        Self {
            manager,
            replug_delay,
            is_hotplug: DisplayTable::default(),
            fake_hotplug: false,
        }
    }

    pub fn is_hotplugged(&self, dpy: DisplayId) -> bool {
        self.is_hotplug[dpy]
    }

    pub fn handle(&mut self, event: &UEvent) {
        let dpy = event.dpy;
        let state = event.state;

        if (event.kind.is_cable() || event.kind == UEventKind::HdmiResolution)
            && self.manager.hdmi_change_state(dpy)
        {
            info!(dpy = %dpy, "Rejecting uevent while the HDMI mode is switching");
            return;
        }

        match event.kind {
            kind if kind.is_cable() => {
                if state == 1 {
                    info!(dpy = %dpy, ?kind, "Cable connected");
                    self.manager.hotplug_ext(dpy, true, false, true);
                    self.is_hotplug[dpy] = true;
                } else {
                    info!(dpy = %dpy, ?kind, "Cable disconnected");
                    if self.is_hotplug[dpy] {
                        self.manager.hotplug_ext(dpy, false, false, true);
                    }
                    self.is_hotplug[dpy] = false;
                }
            }
            UEventKind::HdmiResolution => {
                if state != 0 {
                    if self.is_hotplug[dpy] {
                        info!(dpy = %dpy, "Disconnecting before the resolution change");
                        self.manager.hotplug_ext(dpy, false, false, true);
                        thread::sleep(self.replug_delay);
                    }
                    info!(dpy = %dpy, "HDMI resolution changed");
                    self.manager.hotplug_ext(dpy, true, false, true);
                    self.is_hotplug[dpy] = true;
                }
            }
            UEventKind::Widevine => {
                info!(hdcp = state, "Video HDCP version");
                self.manager.set_video_hdcp(state as u32);
            }
            UEventKind::HdmiRx => {
                info!(dpy = %dpy, state, "HDMI RX event");
                if !(hdmirx::PWR_5V_CHANGE..=hdmirx::PLUG_OUT).contains(&state) {
                    return;
                }
                match state {
                    hdmirx::TIMING_UNLOCK => {
                        self.manager.refresh_for_display(dpy, RefreshKind::LowLatencyRepaint);
                    }
                    hdmirx::TIMING_LOCK | hdmirx::AVI_INFO_CHANGE => {
                        debug!(state, "HDMI RX status is handled by the receiver service");
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Apply one `test_hdmi_connect` request
    pub fn handle_fake(&mut self, request: i32) {
        let dpy = DisplayId::EXTERNAL;
        match request {
            FAKE_HDMI_PLUG => {
                if self.is_hotplug[dpy] {
                    debug!("Disconnecting HDMI before the fake plug");
                    self.manager.hotplug_ext(dpy, false, false, true);
                    thread::sleep(self.replug_delay);
                }
                debug!("Fake HDMI plug");
                self.manager.hotplug_ext(dpy, true, true, true);
                self.fake_hotplug = true;
            }
            FAKE_HDMI_UNPLUG if self.fake_hotplug => {
                debug!("Fake HDMI unplug");
                self.manager.hotplug_ext(dpy, false, true, true);
                self.fake_hotplug = false;
            }
            _ => {}
        }
    }
}

fn open_uevent_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before use
    let fd = unsafe {
        libc::socket(
            libc::PF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is a freshly created descriptor owned by nobody else
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let optval = SOCKET_RCVBUF;
    let set = |opt| {
        // SAFETY: optval lives across the call and the length matches its type
        unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                &optval as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        }
    };
    if set(libc::SO_RCVBUFFORCE) < 0 && set(libc::SO_RCVBUF) < 0 {
        return Err(Error::Driver(format!(
            "failed to size uevent socket buffer: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: sockaddr_nl is plain data; zeroed is a valid initial value
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    // SAFETY: getpid never fails
    addr.nl_pid = unsafe { libc::getpid() } as u32;
    addr.nl_groups = 1;
    // SAFETY: addr is a valid sockaddr_nl and the length matches
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(socket)
}

struct Shared {
    handler: Mutex<UEventHandler>,
    properties: Arc<dyn PropertyStore>,
    fake_hdmi: AtomicI32,
    stop: AtomicBool,
    poll_timeout_ms: u64,
}

/// Thread polling the uevent socket
pub struct UEventThread {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl UEventThread {
    pub fn new(
        manager: Arc<DisplayManager>,
        properties: Arc<dyn PropertyStore>,
        replug_delay: Duration,
        poll_timeout_ms: u64,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler: Mutex::new(UEventHandler::new(manager, replug_delay)),
                properties,
                fake_hdmi: AtomicI32::new(FAKE_HDMI_NONE),
                stop: AtomicBool::new(false),
                poll_timeout_ms,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open the socket, reset external HDMI outputs and start listening
    pub fn initialize(&self) -> Result<()> {
        let socket = open_uevent_socket()?;

        {
            let handler = self.shared.handler.lock().unwrap_or_else(|e| e.into_inner());
            let overlay = handler.manager.overlay();
            for dpy in [DisplayId::EXTERNAL, DisplayId::EXTERNAL_1] {
                if overlay.session_info(dpy).map_or(false, |s| !s.internal) {
                    // disable before enable so the sink sees a clean start
                    overlay.set_hdmi_enabled(dpy, false);
                    overlay.set_hdmi_enabled(dpy, true);
                }
            }
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let worker = Worker::spawn("UEventThreadHWC", move || run(&shared, socket))?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        info!("Listening for uevents");
        Ok(())
    }

    /// Pick up a pending `test_hdmi_connect` request
    pub fn set_property(&self) {
        let request = self.shared.properties.get_i32(props::TEST_HDMI_CONNECT, FAKE_HDMI_NONE);
        debug!(request, "Fake HDMI request");
        self.shared.fake_hdmi.store(request, Ordering::SeqCst);
    }

    /// Feed a datagram through the same path the socket loop uses
    pub fn dispatch(&self, buf: &[u8]) {
        if let Some(event) = parse_uevent(buf) {
            self.shared
                .handler
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle(&event);
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join();
        }
    }
}

impl Drop for UEventThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, socket: OwnedFd) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let timeout = shared.poll_timeout_ms.min(i32::MAX as u64) as libc::c_int;

    while !shared.stop.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd points at one valid pollfd
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!(error = %err, "uevent poll failed");
                thread::sleep(Duration::from_millis(100));
            }
        } else if ret > 0 && pfd.revents & libc::POLLIN != 0 {
            // SAFETY: buf is valid for buf.len() bytes of writes
            let count = unsafe {
                libc::recv(
                    socket.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if count > 0 {
                if let Some(event) = parse_uevent(&buf[..count as usize]) {
                    shared
                        .handler
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .handle(&event);
                }
            }
        }

        let request = shared.fake_hdmi.swap(FAKE_HDMI_NONE, Ordering::SeqCst);
        if request != FAKE_HDMI_NONE {
            shared
                .handler
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle_fake(request);
        }
    }
    debug!("uevent loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HwcConfig, MemoryProperties, SimulatedDisplay};
    use crate::display_manager::EventListener;
    use crate::overlay::{JobDispatcher, SimulatedOverlay};

    #[derive(Default)]
    struct Refreshes(Mutex<Vec<(DisplayId, RefreshKind)>>);

    impl EventListener for Refreshes {
        fn on_plug_in(&self, _dpy: DisplayId, _boot: bool) {}
        fn on_plug_out(&self, _dpy: DisplayId) {}
        fn on_hotplug_ext(&self, _dpy: DisplayId, _connected: bool) {}
        fn on_vsync(&self, _dpy: DisplayId, _timestamp: i64, _enabled: bool) {}
        fn on_refresh(&self, dpy: DisplayId, kind: RefreshKind) {
            self.0.lock().unwrap().push((dpy, kind));
        }
        fn on_vsync_period_timing_change(&self, _dpy: DisplayId, _a: i64, _r: bool, _t: i64) {}
    }

    struct NoDispatch;

    impl JobDispatcher for NoDispatch {
        fn ignore_job(&self, _dpy: DisplayId, _ignore: bool) {}
    }

    fn datagram(fields: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in fields {
            buf.extend_from_slice(field.as_bytes());
            buf.push(0);
        }
        buf
    }

    fn manager() -> (Arc<DisplayManager>, Arc<Refreshes>) {
        let mut config = HwcConfig::default();
        config.debug.hotplug_done_timeout_ms = 10;
        let external = SimulatedDisplay {
            id: 1,
            width: 1920,
            height: 1080,
            internal: false,
            ..SimulatedDisplay::default()
        };
        let overlay = Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default(), external]));
        let manager = DisplayManager::new(config, overlay, Arc::new(NoDispatch), Arc::new(MemoryProperties::new()));
        let listener = Arc::new(Refreshes::default());
        manager.set_listener(listener.clone());
        (manager, listener)
    }

    #[test]
    fn test_parse_hdmi_connect() {
        let buf = datagram(&[
            "change@/devices/virtual/switch/hdmi",
            "ACTION=change",
            "SWITCH_NAME=hdmi",
            "SWITCH_STATE=1",
        ]);
        let event = parse_uevent(&buf).unwrap();
        assert_eq!(event.kind, UEventKind::Hdmi);
        assert_eq!(event.state, 1);
        assert_eq!(event.dpy, DisplayId::EXTERNAL);
    }

    #[test]
    fn test_parse_crtc_selects_display() {
        let buf = datagram(&["change@/devices/virtual/dptxswitch/dptx", "SWITCH_STATE=0", "CRTC=3"]);
        let event = parse_uevent(&buf).unwrap();
        assert_eq!(event.kind, UEventKind::Dptx);
        assert_eq!(event.dpy, DisplayId::EXTERNAL_1);

        let bad = datagram(&["change@/devices/virtual/dptxswitch/dptx", "SWITCH_STATE=1", "CRTC=9"]);
        assert_eq!(parse_uevent(&bad), None);
    }

    #[test]
    fn test_parse_ignores_unrelated_events() {
        let buf = datagram(&["add@/devices/platform/usb", "SWITCH_STATE=1"]);
        assert_eq!(parse_uevent(&buf), None);
        assert_eq!(parse_uevent(&[]), None);
    }

    #[test]
    fn test_parse_int_prefix() {
        assert_eq!(parse_int("12abc"), 12);
        assert_eq!(parse_int("-3"), -3);
        assert_eq!(parse_int("x"), 0);
    }

    #[test]
    fn test_cable_events_drive_hotplug() {
        let (manager, _) = manager();
        let mut handler = UEventHandler::new(manager.clone(), Duration::ZERO);

        // unplug without a prior plug is ignored
        handler.handle(&UEvent { kind: UEventKind::Hdmi, state: 0, dpy: DisplayId::EXTERNAL });
        assert!(!manager.is_connected(DisplayId::EXTERNAL));

        handler.handle(&UEvent { kind: UEventKind::Hdmi, state: 1, dpy: DisplayId::EXTERNAL });
        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert!(handler.is_hotplugged(DisplayId::EXTERNAL));

        handler.handle(&UEvent { kind: UEventKind::HdmiResolution, state: 1, dpy: DisplayId::EXTERNAL });
        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(manager.number_plugin_display(), 1);

        handler.handle(&UEvent { kind: UEventKind::Hdmi, state: 0, dpy: DisplayId::EXTERNAL });
        assert!(!manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(manager.number_plugin_display(), 0);
    }

    #[test]
    fn test_events_rejected_while_switching() {
        let (manager, _) = manager();
        let mut handler = UEventHandler::new(manager.clone(), Duration::ZERO);
        manager.set_hdmi_change_state(DisplayId::EXTERNAL, true);
        handler.handle(&UEvent { kind: UEventKind::Hdmi, state: 1, dpy: DisplayId::EXTERNAL });
        assert!(!manager.is_connected(DisplayId::EXTERNAL));
    }

    #[test]
    fn test_widevine_and_hdmirx() {
        let (manager, listener) = manager();
        let mut handler = UEventHandler::new(manager.clone(), Duration::ZERO);
        handler.handle(&UEvent { kind: UEventKind::Widevine, state: 2, dpy: DisplayId::EXTERNAL });
        assert_eq!(manager.video_hdcp(), 2);

        handler.handle(&UEvent { kind: UEventKind::HdmiRx, state: hdmirx::TIMING_UNLOCK, dpy: DisplayId::EXTERNAL });
        handler.handle(&UEvent { kind: UEventKind::HdmiRx, state: 40, dpy: DisplayId::EXTERNAL });
        assert_eq!(
            *listener.0.lock().unwrap(),
            vec![(DisplayId::EXTERNAL, RefreshKind::LowLatencyRepaint)]
        );
    }

    #[test]
    fn test_fake_hdmi_plug_and_unplug() {
        let (manager, _) = manager();
        let mut handler = UEventHandler::new(manager.clone(), Duration::ZERO);

        // unplug before any fake plug does nothing
        handler.handle_fake(FAKE_HDMI_UNPLUG);
        assert!(!manager.is_connected(DisplayId::EXTERNAL));

        handler.handle_fake(FAKE_HDMI_PLUG);
        assert!(manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(manager.fake_display_count(), 1);

        handler.handle_fake(FAKE_HDMI_UNPLUG);
        assert!(!manager.is_connected(DisplayId::EXTERNAL));
        assert_eq!(manager.fake_display_count(), 0);
        manager.shutdown();
    }

    #[test]
    fn test_dispatch_and_fake_property() {
        let (manager, _) = manager();
        let properties = Arc::new(MemoryProperties::new());
        let uevents = UEventThread::new(manager.clone(), properties.clone(), Duration::ZERO, 10);
        uevents.dispatch(&datagram(&["change@/devices/virtual/switch/widevine", "SWITCH_STATE=1"]));
        assert_eq!(manager.video_hdcp(), 1);

        properties.set(props::TEST_HDMI_CONNECT, "1");
        uevents.set_property();
        assert_eq!(uevents.shared.fake_hdmi.load(Ordering::SeqCst), FAKE_HDMI_PLUG);
    }
}
