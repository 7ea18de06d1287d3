//! Per-display vsync generator

use crate::clock::{self, NSEC_PER_MSEC};
use crate::config::{props, PropertyStore};
use crate::display::{refresh_period_ns, DisplayId};
use crate::overlay::OverlayDevice;
use crate::vsync::VsyncEstimator;
use crate::worker::Worker;
use crate::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use tracing::{debug, info, trace};

/// Slack added to the period before an I/O wait counts as slow
const TIMEOUT_ERROR: f64 = 0.1;

/// Receives the vsync events a `VsyncThread` produces
pub trait VsyncSink: Send + Sync {
    fn on_vsync(&self, dpy: DisplayId, timestamp: i64, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsyncThreadState {
    Idle,
    Trigger,
}

struct VsyncState {
    enabled: bool,
    loop_again: bool,
    exit_pending: bool,
    fake_vsync: bool,
    refresh: i64,
    prev_fake_vsync: i64,
    max_period_io_ms: i64,
    max_period_req_ms: i64,
    thread_state: VsyncThreadState,
    estimator: Option<Arc<VsyncEstimator>>,
}

struct Shared {
    dpy: DisplayId,
    state: Mutex<VsyncState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VsyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn io_limit_ms(refresh: i64) -> i64 {
    let timeout = (TIMEOUT_ERROR * refresh as f64) as i64;
    clock::ns_to_ms(refresh + timeout)
}

/// Drives periodic vsync events for one display
///
/// Blocks while disabled. When enabled (or asked to loop once more) it waits
/// for the hardware vsync, falling back to a software timer when the driver
/// wait fails or software vsync is forced. With an estimator attached the
/// software timer follows the predicted hardware vsync instead of its own
/// grid.
pub struct VsyncThread {
    shared: Arc<Shared>,
    overlay: Arc<dyn OverlayDevice>,
    sink: Weak<dyn VsyncSink>,
    worker: Mutex<Option<Worker>>,
}

impl VsyncThread {
    pub fn new(dpy: DisplayId, overlay: Arc<dyn OverlayDevice>, sink: Weak<dyn VsyncSink>) -> Self {
        let refresh = refresh_period_ns(0);
        Self {
            shared: Arc::new(Shared {
                dpy,
                state: Mutex::new(VsyncState {
                    enabled: false,
                    loop_again: false,
                    exit_pending: false,
                    fake_vsync: false,
                    refresh,
                    prev_fake_vsync: 0,
                    max_period_io_ms: 20,
                    max_period_req_ms: 500,
                    thread_state: VsyncThreadState::Idle,
                    estimator: None,
                }),
                cond: Condvar::new(),
            }),
            overlay,
            sink,
            worker: Mutex::new(None),
        }
    }

    pub fn dpy(&self) -> DisplayId {
        self.shared.dpy
    }

    /// Configure the period and start the thread
    pub fn initialize(&self, force_sw_vsync: bool, refresh: i64) -> Result<()> {
        let dpy = self.shared.dpy;
        {
            let mut s = self.shared.lock();
            if force_sw_vsync {
                info!(dpy = %dpy, "Forcing software vsync");
                s.fake_vsync = true;
            }
            if refresh > 0 {
                s.refresh = refresh;
                s.max_period_io_ms = io_limit_ms(refresh);
            }
            debug!(dpy = %dpy, hw_vsync = !s.fake_vsync, period = s.refresh, "Vsync thread starting");
        }

        let shared = self.shared.clone();
        let overlay = self.overlay.clone();
        let sink = self.sink.clone();
        let worker = Worker::spawn(format!("VSyncThread_{}", dpy.index()), move || {
            run(&shared, overlay.as_ref(), &sink);
        })?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        Ok(())
    }

    /// Phase software vsync onto the hardware vsync `estimator` predicts
    pub fn set_estimator(&self, estimator: Arc<VsyncEstimator>) {
        self.shared.lock().estimator = Some(estimator);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut s = self.shared.lock();
        if s.enabled != enabled {
            trace!(dpy = %self.shared.dpy, enabled, "vsync enable");
        }
        s.enabled = enabled;
        self.shared.cond.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Produce one more vsync even while disabled
    pub fn set_loop_again(&self) {
        let mut s = self.shared.lock();
        s.loop_again = true;
        self.shared.cond.notify_one();
    }

    /// Re-read the software vsync and watchdog overrides
    pub fn set_property(&self, properties: &dyn PropertyStore) {
        let mut s = self.shared.lock();
        let fps = properties.get_i32(props::SW_VSYNC_FPS, 0);
        if fps > 0 {
            s.refresh = (1e9 / f64::from(fps)) as i64;
            debug!(fps, period = s.refresh, "Software vsync fps override");
        }
        let io = properties.get_i32(props::PERIOD_IO, 0);
        if io != 0 {
            s.max_period_io_ms = i64::from(io);
            debug!(period_io = io, "Max vsync I/O period override");
        }
        let req = properties.get_i32(props::PERIOD_REQ, 0);
        if req != 0 {
            s.max_period_req_ms = i64::from(req);
            debug!(period_req = req, "Max vsync request period override");
        }
    }

    pub fn update_period(&self, period: i64) {
        let mut s = self.shared.lock();
        if period > 0 && period != s.refresh {
            s.refresh = period;
            s.max_period_io_ms = io_limit_ms(period);
            debug!(dpy = %self.shared.dpy, period, "Vsync period updated");
        }
    }

    pub fn period(&self) -> i64 {
        self.shared.lock().refresh
    }

    pub fn thread_state(&self) -> VsyncThreadState {
        self.shared.lock().thread_state
    }

    /// Ask the loop to exit at its next wakeup
    pub fn request_exit(&self) {
        let mut s = self.shared.lock();
        s.exit_pending = true;
        self.shared.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Request exit and wait for the thread to finish
    pub fn join(&self) {
        self.request_exit();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join();
            debug!(dpy = %self.shared.dpy, "Vsync thread joined");
        }
    }
}

fn run(shared: &Shared, overlay: &dyn OverlayDevice, sink: &Weak<dyn VsyncSink>) {
    let dpy = shared.dpy;
    loop {
        let (enabled, fake, refresh, max_io, max_req) = {
            let mut s = shared.lock();
            while !s.enabled && !s.loop_again && !s.exit_pending {
                s.thread_state = VsyncThreadState::Idle;
                s = shared.cond.wait(s).unwrap_or_else(|e| e.into_inner());
            }
            if s.exit_pending {
                return;
            }
            s.thread_state = VsyncThreadState::Trigger;
            s.loop_again = false;
            (s.enabled, s.fake_vsync, s.refresh, s.max_period_io_ms, s.max_period_req_ms)
        };

        let mut next_vsync = 0;
        let mut use_fake = fake;
        if !use_fake {
            let started = clock::monotonic_now();
            match overlay.wait_vsync(dpy, refresh) {
                Ok(ts) => {
                    next_vsync = ts;
                    let io_ms = clock::ns_to_ms(clock::monotonic_now() - started);
                    if io_ms > max_io || io_ms > max_req {
                        debug!(dpy = %dpy, io_ms, max_io, "Slow hardware vsync");
                    }
                }
                Err(e) => {
                    trace!(dpy = %dpy, error = %e, "Hardware vsync unavailable, using software");
                    use_fake = true;
                }
            }
        }

        if use_fake {
            next_vsync = software_vsync(shared, refresh);
        }

        if let Some(sink) = sink.upgrade() {
            sink.on_vsync(dpy, next_vsync, enabled);
        }
    }
}

/// Sleep to the next software vsync boundary and return its time
fn software_vsync(shared: &Shared, period: i64) -> i64 {
    let (prev, estimator) = {
        let s = shared.lock();
        (s.prev_fake_vsync, s.estimator.clone())
    };
    let now = clock::monotonic_now();
    let predicted = estimator.map_or(-1, |e| e.next_hw_vsync(now));
    let next = pick_software_vsync(prev, period, now, predicted);
    trace!(
        dpy = %shared.dpy,
        sleep_ms = (next - clock::monotonic_now()) as f64 / NSEC_PER_MSEC as f64,
        "software vsync"
    );
    clock::sleep_until(next);
    shared.lock().prev_fake_vsync = next;
    next
}

/// Predicted hardware vsync when there is one ahead of `now`, else the timer grid
fn pick_software_vsync(prev: i64, period: i64, now: i64, predicted: i64) -> i64 {
    if predicted > now && predicted > prev {
        predicted
    } else {
        next_software_vsync(prev, period, now)
    }
}

/// Next software vsync after `prev`, re-phased onto `now` when late
fn next_software_vsync(prev: i64, period: i64, now: i64) -> i64 {
    let next = prev + period;
    if next - now < 0 {
        now + (period - (now - next) % period)
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryProperties;
    use crate::config::SimulatedDisplay;
    use crate::fence::testing::{dummy_fence, ScriptedOracle};
    use crate::fence::FenceStatus;
    use crate::overlay::SimulatedOverlay;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(DisplayId, i64, bool)>>,
    }

    impl VsyncSink for RecordingSink {
        fn on_vsync(&self, dpy: DisplayId, timestamp: i64, enabled: bool) {
            self.events.lock().unwrap().push((dpy, timestamp, enabled));
        }
    }

    fn overlay() -> Arc<dyn OverlayDevice> {
        Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default()]))
    }

    #[test]
    fn test_next_software_vsync() {
        assert_eq!(next_software_vsync(1000, 100, 1050), 1100);
        // late by 30: re-phase to the next boundary of the old grid
        assert_eq!(next_software_vsync(1000, 100, 1130), 1200);
        assert_eq!(next_software_vsync(0, 100, 1000), 1100);
    }

    #[test]
    fn test_prediction_overrides_timer_grid() {
        assert_eq!(pick_software_vsync(1000, 100, 1050, 1070), 1070);
        // no prediction yet
        assert_eq!(pick_software_vsync(1000, 100, 1050, -1), 1100);
        // stale prediction behind the last emitted vsync
        assert_eq!(pick_software_vsync(1000, 100, 990, 995), 1100);
    }

    #[test]
    fn test_software_vsync_follows_estimator() {
        let period = 4_000_000;
        let oracle = Arc::new(ScriptedOracle::new());
        let estimator = Arc::new(VsyncEstimator::new(oracle.clone(), period));
        let last = clock::monotonic_now() - 1_234_567;
        let fences = [dummy_fence(), dummy_fence()];
        for (fence, t) in fences.into_iter().zip([last - period, last]) {
            oracle.set(&fence, FenceStatus::Signaled(t));
            estimator.push_present_fence(fence, period);
            estimator.update();
        }
        assert_eq!(estimator.avg_period(), period);

        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn VsyncSink> = Arc::downgrade(&sink) as Weak<dyn VsyncSink>;
        let thread = VsyncThread::new(DisplayId::VIRTUAL, overlay(), weak);
        thread.set_estimator(estimator);
        thread.initialize(true, period).unwrap();
        thread.set_enabled(true);
        std::thread::sleep(Duration::from_millis(30));
        thread.join();

        let events = sink.events.lock().unwrap();
        assert!(events.len() >= 2, "got {} events", events.len());
        assert!(events.iter().all(|e| (e.1 - last) % period == 0), "{:?}", *events);
    }

    #[test]
    fn test_io_limit() {
        assert_eq!(io_limit_ms(16_666_667), 18);
    }

    #[test]
    fn test_software_vsync_delivers_events() {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn VsyncSink> = Arc::downgrade(&sink) as Weak<dyn VsyncSink>;
        let thread = VsyncThread::new(DisplayId::VIRTUAL, overlay(), weak);
        thread.initialize(true, 4_000_000).unwrap();
        thread.set_enabled(true);
        std::thread::sleep(Duration::from_millis(40));
        thread.join();

        let events = sink.events.lock().unwrap();
        assert!(events.len() >= 3, "got {} events", events.len());
        assert!(events.iter().all(|e| e.0 == DisplayId::VIRTUAL && e.2));
        assert!(events.windows(2).all(|w| w[1].1 > w[0].1));
    }

    #[test]
    fn test_disabled_thread_stays_idle_and_joins() {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn VsyncSink> = Arc::downgrade(&sink) as Weak<dyn VsyncSink>;
        let thread = VsyncThread::new(DisplayId::EXTERNAL, overlay(), weak);
        thread.initialize(true, 4_000_000).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(thread.thread_state(), VsyncThreadState::Idle);

        thread.set_loop_again();
        std::thread::sleep(Duration::from_millis(30));
        thread.join();
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].2);
    }

    #[test]
    fn test_property_overrides() {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn VsyncSink> = Arc::downgrade(&sink) as Weak<dyn VsyncSink>;
        let thread = VsyncThread::new(DisplayId::PRIMARY, overlay(), weak);
        let store = MemoryProperties::new();
        store.set(props::SW_VSYNC_FPS, "30");
        thread.set_property(&store);
        assert_eq!(thread.period(), 33_333_333);

        thread.update_period(8_333_333);
        assert_eq!(thread.period(), 8_333_333);
        thread.update_period(0);
        assert_eq!(thread.period(), 8_333_333);
    }
}
