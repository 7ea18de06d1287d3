//! Display identities, the fixed display table and per-mode configuration
//!
//! Displays live in a fixed-capacity table for the whole process lifetime.
//! Hotplug mutates entries in place; nothing is allocated or destroyed per
//! connection except the extra configs of a multi-mode connector.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Number of display slots
pub const MAX_DISPLAYS: usize = 4;

/// Default refresh rate when the driver reports nothing usable
pub const DEFAULT_FPS: i32 = 60;

/// A display slot index, always `< MAX_DISPLAYS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisplayId(u8);

impl DisplayId {
    pub const PRIMARY: DisplayId = DisplayId(0);
    pub const EXTERNAL: DisplayId = DisplayId(1);
    pub const VIRTUAL: DisplayId = DisplayId(2);
    pub const EXTERNAL_1: DisplayId = DisplayId(3);

    /// Validate an untrusted index (uevent CRTC, property values)
    pub fn new(index: u64) -> Option<DisplayId> {
        if index < MAX_DISPLAYS as u64 {
            Some(DisplayId(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = DisplayId> {
        (0..MAX_DISPLAYS as u8).map(DisplayId)
    }

    pub fn is_primary(self) -> bool {
        self == DisplayId::PRIMARY
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-capacity storage with one entry per display slot
#[derive(Debug, Clone)]
pub struct DisplayTable<T> {
    slots: [T; MAX_DISPLAYS],
}

impl<T> DisplayTable<T> {
    pub fn from_fn(mut f: impl FnMut(DisplayId) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| f(DisplayId(i as u8))),
        }
    }

    /// Lookup by raw index; panics on an index outside the table
    pub fn slot(&self, index: usize) -> &T {
        match self.slots.get(index) {
            Some(slot) => slot,
            None => panic!("display index {} out of range (max {})", index, MAX_DISPLAYS),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DisplayId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (DisplayId(i as u8), slot))
    }
}

impl<T: Default> Default for DisplayTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<DisplayId> for DisplayTable<T> {
    type Output = T;

    fn index(&self, dpy: DisplayId) -> &T {
        self.slot(dpy.index())
    }
}

impl<T> IndexMut<DisplayId> for DisplayTable<T> {
    fn index_mut(&mut self, dpy: DisplayId) -> &mut T {
        let index = dpy.index();
        match self.slots.get_mut(index) {
            Some(slot) => slot,
            None => panic!("display index {} out of range (max {})", index, MAX_DISPLAYS),
        }
    }
}

/// Integer rectangle, right/bottom exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Rectangle anchored at the origin
    pub const fn sized(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Floating point rectangle used for source crops
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FRect {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Kind of sink behind a display slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplaySubtype {
    #[default]
    Lcm,
    HdmiMhl,
    Smartbook,
    Memory,
    Wireless,
    Fake,
}

/// One supported mode of a display
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Driver pixel format code
    pub format: u32,
    /// Vsync period in nanoseconds
    pub refresh: i64,
    pub xdpi: f32,
    pub ydpi: f32,
    pub density: u32,
    pub has_vsync: bool,
    pub connected: bool,
    pub secure: bool,
    pub subtype: DisplaySubtype,
    pub hdcp_version: u32,
    pub aspect_portrait: f32,
    pub aspect_landscape: f32,
    pub mir_portrait: Rect,
    pub mir_landscape: Rect,
    pub vsync_source: DisplayId,
    /// Physically installed rotation in quarter turns
    pub hwrotation: u32,
    pub pixels: u32,
    pub trigger_by_vsync: bool,
    /// Configs with identical width x height share a group
    pub group: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: 0,
            refresh: 0,
            xdpi: 0.0,
            ydpi: 0.0,
            density: 0,
            has_vsync: false,
            connected: false,
            secure: false,
            subtype: DisplaySubtype::Lcm,
            hdcp_version: 0,
            aspect_portrait: 0.0,
            aspect_landscape: 0.0,
            mir_portrait: Rect::default(),
            mir_landscape: Rect::default(),
            vsync_source: DisplayId::PRIMARY,
            hwrotation: 0,
            pixels: 0,
            trigger_by_vsync: false,
            group: 0,
        }
    }
}

impl DisplayConfig {
    pub fn update_pixels(&mut self) {
        self.pixels = self.width.saturating_mul(self.height);
    }

    /// Letterbox or pillarbox regions for mirroring `main` onto this display
    pub fn set_mirror_region(&mut self, main: &DisplayConfig) {
        let width = self.width as i32;
        let height = self.height as i32;

        self.mir_portrait = if main.aspect_portrait > self.aspect_portrait {
            let portrait_h = (width as f32 / main.aspect_portrait) as i32;
            let portrait_y = (height - portrait_h) / 2;
            Rect::new(0, portrait_y, width, portrait_y + portrait_h)
        } else {
            let portrait_w = (height as f32 * main.aspect_portrait) as i32;
            let portrait_x = (width - portrait_w) / 2;
            Rect::new(portrait_x, 0, portrait_x + portrait_w, height)
        };

        self.mir_landscape = if main.aspect_landscape > self.aspect_landscape {
            let landscape_h = (width as f32 / main.aspect_landscape) as i32;
            let landscape_y = (height - landscape_h) / 2;
            Rect::new(0, landscape_y, width, landscape_y + landscape_h)
        } else {
            let landscape_w = (height as f32 * main.aspect_landscape) as i32;
            let landscape_x = (width - landscape_w) / 2;
            Rect::new(landscape_x, 0, landscape_x + landscape_w, height)
        };
    }
}

/// Convert a refresh rate in Hz to a rounded period in nanoseconds
pub fn refresh_period_ns(fps: i32) -> i64 {
    let fps = if fps <= 0 { DEFAULT_FPS } else { fps };
    (1e9 / fps as f64 + 0.5) as i64
}

/// Framework power modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    Doze,
    On,
    DozeSuspend,
}
