//! Hardware composer daemon
//!
//! Brings up the displays described by the config file, drives primary
//! vsync and listens for hotplug uevents.

use anyhow::{Context, Result};
use clap::Parser;
use flick_hwc::config::MemoryProperties;
use flick_hwc::hal::RefreshKind;
use flick_hwc::overlay::SimulatedOverlay;
use flick_hwc::switch_config::RefreshDecision;
use flick_hwc::{
    DisplayId, DisplayManager, EventListener, HwcConfig, JobDispatcher, ModeHandler,
    SwitchConfigHost, SwitchConfigMonitor, SyncFileOracle, UEventThread,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "flick-hwcd")]
#[command(about = "Hardware composer display service", long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(short, long, default_value = "/etc/flick/hwc.toml")]
    config: PathBuf,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,

    /// Exit after this many primary vsyncs (0 runs forever)
    #[arg(short, long, default_value_t = 0)]
    frames: u64,
}

/// Logs frame job gating
struct LoggingDispatcher;

impl JobDispatcher for LoggingDispatcher {
    fn ignore_job(&self, dpy: DisplayId, ignore: bool) {
        debug!(dpy = %dpy, ignore, "Job dispatch gate");
    }
}

/// Stands in for the framework: acknowledges hotplugs and counts frames
struct DaemonListener {
    manager: OnceLock<Weak<DisplayManager>>,
    frames: AtomicU64,
    limit: u64,
    done: Mutex<Option<Sender<()>>>,
}

impl DaemonListener {
    fn manager(&self) -> Option<Arc<DisplayManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }
}

impl EventListener for DaemonListener {
    fn on_plug_in(&self, dpy: DisplayId, boot: bool) {
        info!(dpy = %dpy, boot, "Display plugged in");
    }

    fn on_plug_out(&self, dpy: DisplayId) {
        info!(dpy = %dpy, "Display plugged out");
    }

    fn on_hotplug_ext(&self, dpy: DisplayId, connected: bool) {
        let Some(manager) = self.manager() else {
            return;
        };
        if connected {
            manager.notify_hotplug_in_done(dpy);
        } else {
            manager.notify_hotplug_out_done(dpy);
        }
    }

    fn on_vsync(&self, dpy: DisplayId, timestamp: i64, _enabled: bool) {
        if !dpy.is_primary() {
            return;
        }
        let frame = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(frame, timestamp, "vsync");
        if self.limit > 0 && frame == self.limit {
            if let Some(done) = self.done.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = done.send(());
            }
        }
    }

    fn on_refresh(&self, dpy: DisplayId, kind: RefreshKind) {
        debug!(dpy = %dpy, ?kind, "Refresh requested");
    }

    fn on_vsync_period_timing_change(
        &self,
        dpy: DisplayId,
        applied_time: i64,
        refresh_required: bool,
        refresh_time: i64,
    ) {
        info!(dpy = %dpy, applied_time, refresh_required, refresh_time, "Vsync period timing changed");
    }
}

/// Applies confirmed config switches to the display manager
struct DaemonSwitchHost {
    manager: Arc<DisplayManager>,
}

impl SwitchConfigHost for DaemonSwitchHost {
    fn need_request_refresh(&self, _dpy: DisplayId, index: i64) -> RefreshDecision {
        RefreshDecision {
            need_refresh: false,
            index,
            applied_time: 0,
            refresh_time: 0,
            has_task: false,
            deadline: -1,
        }
    }

    fn update_applied_config_state(&self, dpy: DisplayId, index: i64, config: u32, period: i64) {
        info!(dpy = %dpy, index, config, period, "Config applied");
        self.manager.update_vsync_thread_period(dpy, period);
    }

    fn vsync_period_timing_changed(
        &self,
        dpy: DisplayId,
        applied_time: i64,
        refresh_required: bool,
        refresh_time: i64,
    ) {
        self.manager
            .update_vsync_period_timing_change(dpy, applied_time, refresh_required, refresh_time);
    }
}

fn log_dir() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("flick-hwc")
}

fn main() -> Result<()> {
    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let crash_log = log_dir.join("crash.log");
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("PANIC: {}", panic_info);
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log)
        {
            use std::io::Write;
            let _ = writeln!(f, "PANIC: {}", panic_info);
        }
    }));

    let args = Args::parse();

    let file_appender = rolling::daily(&log_dir, "hwc.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if args.debug {
        "debug,flick_hwc=debug"
    } else {
        "warn,flick_hwc=info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!(log_path = %log_dir.display(), config = %args.config.display(), "flick-hwcd starting");

    let config = HwcConfig::load(&args.config);
    let debug_config = config.debug.clone();
    let displays = if config.displays.is_empty() {
        vec![Default::default()]
    } else {
        config.displays.clone()
    };

    let properties = Arc::new(MemoryProperties::with_values(config.properties.clone()));
    let overlay = Arc::new(SimulatedOverlay::new(&displays));
    let manager = DisplayManager::with_fence_oracle(
        config,
        overlay,
        Arc::new(LoggingDispatcher),
        properties.clone(),
        Arc::new(SyncFileOracle),
    );

    let (done_tx, done_rx) = mpsc::channel();
    let listener = Arc::new(DaemonListener {
        manager: OnceLock::new(),
        frames: AtomicU64::new(0),
        limit: args.frames,
        done: Mutex::new(Some(done_tx)),
    });
    let _ = listener.manager.set(Arc::downgrade(&manager));
    manager.set_listener(listener.clone());

    manager
        .init_internal(DisplayId::PRIMARY)
        .context("Failed to bring up the primary display")?;
    for dpy in [DisplayId::EXTERNAL, DisplayId::EXTERNAL_1] {
        if displays.iter().any(|d| d.id == dpy.index() as u64 && d.connected) {
            manager.init_internal(dpy)?;
        }
    }

    let monitor = SwitchConfigMonitor::new(
        Arc::new(DaemonSwitchHost {
            manager: manager.clone(),
        }),
        Arc::new(SyncFileOracle),
        debug_config.applied_fence_timeout_ms,
    );
    monitor.start().context("Failed to start the config switch monitor")?;

    let replug_delay = Duration::from_millis(debug_config.replug_delay_ms);
    let mode_handler = ModeHandler::new(manager.clone(), replug_delay);
    mode_handler.start().context("Failed to start the mode handler")?;

    let uevents = UEventThread::new(
        manager.clone(),
        properties,
        replug_delay,
        debug_config.uevent_poll_timeout_ms,
    );
    uevents.set_property();
    if let Err(e) = uevents.initialize() {
        warn!(error = %e, "Hotplug uevents unavailable");
    }

    manager.request_vsync(DisplayId::PRIMARY, true);

    // without a frame limit the sender is never taken and this blocks forever
    let _ = done_rx.recv();
    info!(frames = listener.frames.load(Ordering::Relaxed), "Frame limit reached");

    manager.request_vsync(DisplayId::PRIMARY, false);
    uevents.stop();
    mode_handler.stop();
    monitor.stop();
    manager.shutdown();
    info!("flick-hwcd stopped");
    Ok(())
}
