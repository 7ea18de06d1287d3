//! Vsync diagnostic
//! Runs a software vsync thread for a number of frames, feeds each tick to
//! the estimator as a signaled present fence and prints the observed periods.

use anyhow::{Context, Result};
use flick_hwc::config::SimulatedDisplay;
use flick_hwc::display::refresh_period_ns;
use flick_hwc::overlay::SimulatedOverlay;
use flick_hwc::vsync::VsyncSink;
use flick_hwc::{DisplayId, Fence, FenceOracle, FenceStatus, VsyncEstimator, VsyncThread};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use tracing::Level;

/// Reports the vsync time each fence was created for
#[derive(Default)]
struct TickOracle {
    signals: Mutex<HashMap<RawFd, i64>>,
}

impl FenceOracle for TickOracle {
    fn status(&self, fence: &Fence) -> FenceStatus {
        match self.signals.lock() {
            Ok(signals) => signals
                .get(&fence.as_raw_fd())
                .map_or(FenceStatus::Pending, |&ts| FenceStatus::Signaled(ts)),
            Err(_) => FenceStatus::Invalid,
        }
    }

    fn wait(&self, _fence: &Fence, _timeout_ms: u64) -> flick_hwc::Result<()> {
        Ok(())
    }
}

struct TickSink {
    ticks: Mutex<Sender<i64>>,
}

impl VsyncSink for TickSink {
    fn on_vsync(&self, _dpy: DisplayId, timestamp: i64, _enabled: bool) {
        if let Ok(ticks) = self.ticks.lock() {
            let _ = ticks.send(timestamp);
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let mut args = std::env::args().skip(1);
    let frames: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(120);
    let fps: i32 = args.next().and_then(|a| a.parse().ok()).unwrap_or(60);
    let period = refresh_period_ns(fps);

    println!("=== Vsync diagnostic ===");
    println!("frames: {}, fps: {}, period: {} ns", frames, fps, period);

    let overlay = Arc::new(SimulatedOverlay::new(&[SimulatedDisplay::default()]));
    let (tx, rx) = mpsc::channel();
    let sink = Arc::new(TickSink { ticks: Mutex::new(tx) });
    let weak: Weak<dyn VsyncSink> = Arc::downgrade(&sink) as Weak<dyn VsyncSink>;

    let thread = VsyncThread::new(DisplayId::PRIMARY, overlay, weak);
    thread
        .initialize(true, period)
        .context("Failed to start vsync thread")?;

    let oracle = Arc::new(TickOracle::default());
    let estimator = VsyncEstimator::new(oracle.clone(), period);

    thread.set_enabled(true);
    let mut prev = None;
    let mut gaps = Vec::with_capacity(frames);
    for frame in 0..frames {
        let ts = rx.recv().context("Vsync thread stopped")?;
        if let Some(prev) = prev {
            gaps.push(ts - prev);
        }
        prev = Some(ts);

        let fd: OwnedFd = File::open("/dev/null")
            .context("Failed to open a stand-in fence")?
            .into();
        let fence = Fence::new(fd);
        if let Ok(mut signals) = oracle.signals.lock() {
            signals.insert(fence.as_raw_fd(), ts);
        }
        estimator.push_present_fence(fence, period);
        estimator.update();

        if frame % 30 == 0 {
            println!(
                "frame {:4}: ts {} avg period {} ns, queued fences {}",
                frame,
                ts,
                estimator.avg_period(),
                estimator.queued_fences()
            );
        }
    }
    thread.set_enabled(false);
    thread.join();

    if !gaps.is_empty() {
        let min = gaps.iter().min().copied().unwrap_or(0);
        let max = gaps.iter().max().copied().unwrap_or(0);
        let mean = gaps.iter().sum::<i64>() / gaps.len() as i64;
        println!("observed period: min {} ns, max {} ns, mean {} ns", min, max, mean);
    }
    println!("estimated period: {} ns", estimator.avg_period());
    println!("Done!");
    Ok(())
}
