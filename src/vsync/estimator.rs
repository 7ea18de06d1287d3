//! Hardware vsync period estimation from present-fence signal times

use crate::fence::{Fence, FenceOracle, FenceStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

/// Outstanding present fences kept for estimation
pub const HISTORY_SIZE: usize = 8;

/// Running-average weight cap; keeps the estimate responsive to drift
const MAX_SAMPLE_COUNT: i64 = 100;

/// Largest vsync gap between two signals that still counts as a sample
const MAX_VSYNC_GAP: u32 = 4;

struct EstimatorState {
    fences: VecDeque<Fence>,
    avg_period: i64,
    /// Period the queued fences were submitted under, -1 when unknown
    cur_config_period: i64,
    sample_count: i64,
    last_signal_time: i64,
}

/// Smoothed hardware vsync period derived from present fences
///
/// Owns every fence pushed into it and closes them once they are older than
/// the newest signaled one.
pub struct VsyncEstimator {
    oracle: Arc<dyn FenceOracle>,
    fallback_period: i64,
    state: Mutex<EstimatorState>,
}

impl VsyncEstimator {
    /// `period` seeds the average and stands in when no config period is known
    pub fn new(oracle: Arc<dyn FenceOracle>, period: i64) -> Self {
        Self {
            oracle,
            fallback_period: period,
            state: Mutex::new(EstimatorState {
                fences: VecDeque::with_capacity(HISTORY_SIZE + 1),
                avg_period: period,
                cur_config_period: -1,
                sample_count: 0,
                last_signal_time: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EstimatorState> {
        // the state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop all queued fences and restart averaging from `period`
    pub fn reset_avg_period(&self, period: i64) {
        let mut s = self.lock();
        s.fences.clear();
        s.avg_period = period;
        s.cur_config_period = -1;
    }

    /// Queue a present fence submitted while `cur_period` was in effect
    pub fn push_present_fence(&self, fence: Fence, cur_period: i64) {
        let mut s = self.lock();
        if s.cur_config_period != -1 && s.cur_config_period != cur_period {
            warn!(
                old = s.cur_config_period,
                new = cur_period,
                "Vsync period changed without reset"
            );
        }
        s.cur_config_period = cur_period;
        s.fences.push_back(fence);
        if s.fences.len() > HISTORY_SIZE {
            s.fences.pop_front();
        }
    }

    pub fn update(&self) {
        let mut s = self.lock();
        self.update_locked(&mut s);
    }

    /// Next predicted hardware vsync after `now`, or -1 before any signal
    pub fn next_hw_vsync(&self, now: i64) -> i64 {
        let mut s = self.lock();
        self.update_locked(&mut s);
        if s.last_signal_time <= 0 || s.avg_period <= 0 {
            return -1;
        }
        let last = s.last_signal_time;
        last + ((now - last) / s.avg_period + 1) * s.avg_period
    }

    pub fn avg_period(&self) -> i64 {
        self.lock().avg_period
    }

    pub fn queued_fences(&self) -> usize {
        self.lock().fences.len()
    }

    fn update_locked(&self, s: &mut EstimatorState) {
        if s.cur_config_period <= 0 {
            trace!("No config period, using fallback");
            s.cur_config_period = self.fallback_period;
        }
        let config_period = s.cur_config_period as f64;

        let mut prev_signal: Option<i64> = None;
        let mut last_signaled_index = None;
        let mut cur_signal = 0;
        for (index, fence) in s.fences.iter().enumerate() {
            let FenceStatus::Signaled(t) = self.oracle.status(fence) else {
                continue;
            };
            cur_signal = t;
            if let Some(prev) = prev_signal {
                let delta = t - prev;
                let num_vsync = (delta as f64 / config_period + 0.5) as u32;
                if s.sample_count < MAX_SAMPLE_COUNT {
                    s.sample_count += 1;
                }
                if (1..=MAX_VSYNC_GAP).contains(&num_vsync) {
                    let n = s.sample_count;
                    s.avg_period = ((n - 1) * s.avg_period + delta / i64::from(num_vsync)) / n;
                }
            }
            prev_signal = Some(t);
            last_signaled_index = Some(index);
        }

        if let Some(index) = last_signaled_index {
            // keep the newest signaled fence as the anchor for the next pair
            s.fences.drain(..index);
        }
        s.last_signal_time = cur_signal;
    }
}
