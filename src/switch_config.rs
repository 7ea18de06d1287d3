//! Asynchronous confirmation of display config switches
//!
//! A config switch is requested in one frame and takes effect some vsyncs
//! later, confirmed by a present fence. Two loops track it:
//!
//! - the active loop wakes at the earliest per-display deadline and asks
//!   the host whether the client must refresh to make the switch happen
//! - the applied loop waits on the present fence of each applied config,
//!   oldest target first, and reports the real switch time
//!
//! Each loop has its own lock, condition variable and stop flag.

use crate::clock;
use crate::display::{DisplayId, DisplayTable};
use crate::fence::{Fence, FenceOracle, FenceStatus};
use crate::worker::Worker;
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Answer of `SwitchConfigHost::need_request_refresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshDecision {
    pub need_refresh: bool,
    pub index: i64,
    pub applied_time: i64,
    pub refresh_time: i64,
    /// More work is pending; check again at `deadline`
    pub has_task: bool,
    pub deadline: i64,
}

/// Display-side state the monitor drives
pub trait SwitchConfigHost: Send + Sync {
    fn need_request_refresh(&self, dpy: DisplayId, index: i64) -> RefreshDecision;

    fn update_applied_config_state(&self, dpy: DisplayId, index: i64, config: u32, period: i64);

    fn vsync_period_timing_changed(
        &self,
        dpy: DisplayId,
        applied_time: i64,
        refresh_required: bool,
        refresh_time: i64,
    );
}

/// A config that was committed and waits for its present fence
#[derive(Debug)]
pub struct AppliedConfig {
    pub index: i64,
    pub config: u32,
    pub applied_time: i64,
    pub target_time: i64,
    pub period: i64,
    pub present_fence_index: u32,
    pub fence: Fence,
}

#[derive(Debug, Clone, Copy, Default)]
struct ActiveInfo {
    need_check: bool,
    index: i64,
    deadline: i64,
}

#[derive(Default)]
struct ActiveState {
    stop: bool,
    displays: DisplayTable<ActiveInfo>,
}

#[derive(Default)]
struct AppliedState {
    stop: bool,
    queues: DisplayTable<VecDeque<AppliedConfig>>,
}

struct Channel<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T: Default> Channel<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(T::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Shared {
    host: Arc<dyn SwitchConfigHost>,
    oracle: Arc<dyn FenceOracle>,
    fence_timeout_ms: u64,
    active: Channel<ActiveState>,
    applied: Channel<AppliedState>,
}

pub struct SwitchConfigMonitor {
    shared: Arc<Shared>,
    active_worker: Mutex<Option<Worker>>,
    applied_worker: Mutex<Option<Worker>>,
}

impl SwitchConfigMonitor {
    pub fn new(host: Arc<dyn SwitchConfigHost>, oracle: Arc<dyn FenceOracle>, fence_timeout_ms: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                host,
                oracle,
                fence_timeout_ms,
                active: Channel::new(),
                applied: Channel::new(),
            }),
            active_worker: Mutex::new(None),
            applied_worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.start_active()?;
        self.start_applied()
    }

    pub fn start_active(&self) -> Result<()> {
        let mut slot = self.active_worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        self.shared.active.lock().stop = false;
        let shared = self.shared.clone();
        *slot = Some(Worker::spawn("SwitchConfigActive", move || run_active(&shared))?);
        Ok(())
    }

    pub fn start_applied(&self) -> Result<()> {
        let mut slot = self.applied_worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        self.shared.applied.lock().stop = false;
        let shared = self.shared.clone();
        *slot = Some(Worker::spawn("SwitchConfigApplied", move || run_applied(&shared))?);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_active();
        self.stop_applied();
    }

    pub fn stop_active(&self) {
        {
            let mut s = self.shared.active.lock();
            s.stop = true;
            self.shared.active.cond.notify_all();
        }
        let worker = self.active_worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join();
        }
    }

    /// Blocks at most one fence timeout when the loop is mid-wait
    pub fn stop_applied(&self) {
        {
            let mut s = self.shared.applied.lock();
            s.stop = true;
            self.shared.applied.cond.notify_all();
        }
        let worker = self.applied_worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join();
        }
    }

    /// Schedule (or cancel) a refresh check for `dpy` at `deadline`
    pub fn set_check_point(&self, dpy: DisplayId, need_check: bool, index: i64, deadline: i64) {
        let mut s = self.shared.active.lock();
        s.displays[dpy] = ActiveInfo {
            need_check,
            index,
            deadline,
        };
        trace!(dpy = %dpy, index, deadline, need_check, "check point");
        self.shared.active.cond.notify_one();
    }

    /// Queue an applied config; the monitor owns its fence from here on
    pub fn monitor_applied_config(&self, dpy: DisplayId, applied: AppliedConfig) {
        let mut s = self.shared.applied.lock();
        trace!(dpy = %dpy, index = applied.index, fence_index = applied.present_fence_index,
            "monitor applied config");
        s.queues[dpy].push_back(applied);
        self.shared.applied.cond.notify_one();
    }
}

impl Drop for SwitchConfigMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn earliest_check(s: &ActiveState) -> Option<(DisplayId, ActiveInfo)> {
    s.displays
        .iter()
        .filter(|(_, info)| info.need_check)
        .min_by_key(|(_, info)| info.deadline)
        .map(|(dpy, info)| (dpy, *info))
}

fn run_active(shared: &Shared) {
    loop {
        let (dpy, info) = {
            let s = shared.active.lock();
            if s.stop {
                break;
            }
            let Some((dpy, info)) = earliest_check(&s) else {
                drop(shared.active.cond.wait(s).unwrap_or_else(|e| e.into_inner()));
                continue;
            };
            if info.deadline > 0 {
                let diff = info.deadline - clock::monotonic_now();
                if diff > 0 {
                    // a new check point may be earlier; pick again after waking
                    let timeout = Duration::from_nanos(diff as u64);
                    drop(shared.active.cond.wait_timeout(s, timeout).unwrap_or_else(|e| e.into_inner()));
                    continue;
                }
            }
            (dpy, info)
        };

        let decision = shared.host.need_request_refresh(dpy, info.index);
        trace!(dpy = %dpy, ?decision, "refresh decision");
        {
            let mut s = shared.active.lock();
            let slot = &mut s.displays[dpy];
            slot.need_check = decision.has_task;
            if decision.has_task {
                slot.index = decision.index;
                slot.deadline = decision.deadline;
            }
        }
        if decision.need_refresh {
            debug!(dpy = %dpy, applied_time = decision.applied_time, "Requesting client refresh");
            shared
                .host
                .vsync_period_timing_changed(dpy, decision.applied_time, true, decision.refresh_time);
        }
    }
}

/// Queue front with the earliest (target_time, applied_time)
fn earliest_applied(s: &AppliedState) -> Option<DisplayId> {
    s.queues
        .iter()
        .filter_map(|(dpy, queue)| queue.front().map(|info| (dpy, info)))
        .min_by_key(|(_, info)| (info.target_time, info.applied_time))
        .map(|(dpy, _)| dpy)
}

fn run_applied(shared: &Shared) {
    loop {
        let (dpy, applied) = {
            let mut s = shared.applied.lock();
            if s.stop {
                break;
            }
            let next = earliest_applied(&s).and_then(|dpy| s.queues[dpy].pop_front().map(|a| (dpy, a)));
            match next {
                Some(next) => next,
                None => {
                    drop(shared.applied.cond.wait(s).unwrap_or_else(|e| e.into_inner()));
                    continue;
                }
            }
        };

        match shared.oracle.wait(&applied.fence, shared.fence_timeout_ms) {
            Ok(()) => {
                let signal_time = match shared.oracle.status(&applied.fence) {
                    FenceStatus::Signaled(t) => t,
                    _ => clock::monotonic_now(),
                };
                debug!(dpy = %dpy, signal_time, config = applied.config, "Config switch confirmed");
                shared.host.vsync_period_timing_changed(dpy, signal_time, false, 0);
            }
            Err(e) => {
                warn!(dpy = %dpy, config = applied.config, error = %e, "Applied display config is overtime");
            }
        }
        let AppliedConfig {
            index, config, period, fence, ..
        } = applied;
        drop(fence);
        shared.host.update_applied_config_state(dpy, index, config, period);
    }
}
