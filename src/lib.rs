//! Hardware composer core for Flick
//!
//! Decides, per layer and per display, whether a buffer is presented by the
//! overlay engine (OVL), pre-processed by the memory-to-memory engine
//! (MDP/MML), run through ML inference (GLAI), or left to GPU composition.
//! It also owns the display lifecycle: hotplug, mode switching, vsync
//! generation and power state across a fixed table of displays.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Framework / compositor                      │
//! │        (layer properties, validate, present, configs)       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ layers                         ▲ EventListener
//!          ▼                                │
//! ┌──────────────────────┐   ┌──────────────────────────────────┐
//! │ HwcLayer + Classifier│   │ DisplayManager                   │
//! │ (Invalid/Dim/UI/MM/  │   │  ┌────────────┐ ┌──────────────┐ │
//! │  GLAI/Cursor)        │   │  │VsyncThread │ │ DisplayTable │ │
//! └──────────────────────┘   │  │ per display│ │ of configs   │ │
//!          │ caps queries    │  └────────────┘ └──────────────┘ │
//!          ▼                 └──────────────────────────────────┘
//! ┌──────────────────────┐      ▲ hotplug        ▲ re-plug
//! │ OverlayDevice /      │   ┌──────────────┐ ┌──────────────┐
//! │ BlitOracle / Glai    │   │ UEventThread │ │ ModeHandler  │
//! └──────────────────────┘   └──────────────┘ └──────────────┘
//!
//!   VsyncEstimator ◄── present fences ──► SwitchConfigMonitor
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use flick_hwc::{DisplayManager, DisplayId, HwcConfig};
//!
//! let config = HwcConfig::load("/etc/flick/hwc.toml");
//! let manager = DisplayManager::new(config, overlay, dispatcher, properties);
//! manager.set_listener(listener);
//! manager.init_internal(DisplayId::PRIMARY)?;
//! ```

pub mod clock;
pub mod compose;
pub mod config;
pub mod display;
pub mod display_manager;
pub mod error;
pub mod fence;
pub mod hal;
pub mod layer;
pub mod mode_handler;
pub mod overlay;
pub mod switch_config;
pub mod uevent;
pub mod vsync;
pub mod worker;

pub use compose::{Classification, ClassificationOutcome, Classifier, DisplayCaps};
pub use config::HwcConfig;
pub use display::{DisplayConfig, DisplayId, DisplayTable, MAX_DISPLAYS};
pub use display_manager::{DisplayManager, EventListener};
pub use error::Error;
pub use fence::{Fence, FenceOracle, FenceStatus, SyncFileOracle};
pub use layer::HwcLayer;
pub use mode_handler::{HdmiSetting, ModeHandler};
pub use overlay::{JobDispatcher, OverlayDevice};
pub use switch_config::{SwitchConfigHost, SwitchConfigMonitor};
pub use uevent::UEventThread;
pub use vsync::{VsyncEstimator, VsyncThread};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
