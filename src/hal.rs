//! Composer HAL vocabulary: composition types, blend modes, transforms,
//! pixel formats, dataspaces and buffer usage bits
//!
//! Values mirror the Android hwcomposer2/graphics HAL where a standard code
//! exists; vendor formats carry the codes the display driver expects.

use serde::{Deserialize, Serialize};

/// Composition type requested by, or returned to, the framework
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompositionType {
    #[default]
    Invalid,
    Client,
    Device,
    SolidColor,
    Cursor,
    Sideband,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendMode {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

/// Transform bits (HAL_TRANSFORM_*)
pub mod transform {
    pub const FLIP_H: u32 = 0x01;
    pub const FLIP_V: u32 = 0x02;
    pub const ROT_90: u32 = 0x04;
    pub const ROT_180: u32 = FLIP_H | FLIP_V;
    pub const ROT_270: u32 = ROT_180 | ROT_90;
}

/// Pixel formats seen on layer buffers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8888 = 0x01,
    Rgbx8888 = 0x02,
    Rgb888 = 0x03,
    Rgb565 = 0x04,
    Bgra8888 = 0x05,
    YCbCr422Sp = 0x10,
    YCrCb420Sp = 0x11,
    YCbCr422I = 0x14,
    RgbaFp16 = 0x16,
    Bgrx8888 = 0x1e,
    YCbCr420_888 = 0x23,
    Rgba1010102 = 0x2b,
    YCbCrP010 = 0x36,
    Yv12 = 0x3231_5659,
    // vendor formats
    Yuyv = 0x1000_0001,
    Uyvy = 0x1000_0002,
    Img1Bgrx8888 = 0x1000_0003,
    I420 = 0x1000_0004,
    Nv12Blk = 0x1000_0005,
    Nv12Blk10BitH = 0x1000_0006,
    Nv12Blk10BitHJump = 0x1000_0007,
    Nv12Blk10BitV = 0x1000_0008,
    Nv12Blk10BitVJump = 0x1000_0009,
    Ufo = 0x1000_000a,
    Ufo10BitH = 0x1000_000b,
    Ufo10BitHJump = 0x1000_000c,
    Ufo10BitV = 0x1000_000d,
    Ufo10BitVJump = 0x1000_000e,
    YuvPrivate = 0x1000_0010,
    YuvPrivate10Bit = 0x1000_0011,
    Nv12Hyfbc = 0x1000_0020,
    P010Hyfbc = 0x1000_0021,
    Dim = 0x1000_0030,
}

impl PixelFormat {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Formats whose real layout lives in the buffer's extra status bits
    pub fn is_private(self) -> bool {
        matches!(
            self,
            PixelFormat::YuvPrivate | PixelFormat::YCbCr420_888 | PixelFormat::YuvPrivate10Bit
        )
    }

    /// 10-bit block and UFO video formats
    pub fn is_10bit_block_or_ufo(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12Blk10BitH
                | PixelFormat::Nv12Blk10BitHJump
                | PixelFormat::Nv12Blk10BitV
                | PixelFormat::Nv12Blk10BitVJump
                | PixelFormat::Ufo10BitH
                | PixelFormat::Ufo10BitHJump
                | PixelFormat::Ufo10BitV
                | PixelFormat::Ufo10BitVJump
        )
    }

    pub fn is_hyfbc(self) -> bool {
        matches!(self, PixelFormat::Nv12Hyfbc | PixelFormat::P010Hyfbc)
    }

    /// RGBA_8888 through BGRA_8888 by code, the range the overlay accepts natively
    pub fn in_ovl_rgb_range(self) -> bool {
        (PixelFormat::Rgba8888.code()..=PixelFormat::Bgra8888.code()).contains(&self.code())
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8888
                | PixelFormat::Bgra8888
                | PixelFormat::Rgba1010102
                | PixelFormat::RgbaFp16
        )
    }

    /// Color enum understood by the blit engine, if any
    pub fn blit_color(self) -> Option<BlitColor> {
        let color = match self {
            PixelFormat::Rgba8888 => BlitColor::Rgba8888,
            PixelFormat::Rgbx8888 => BlitColor::Rgbx8888,
            PixelFormat::Rgb888 => BlitColor::Rgb888,
            PixelFormat::Rgb565 => BlitColor::Rgb565,
            PixelFormat::Bgra8888 => BlitColor::Bgra8888,
            PixelFormat::Bgrx8888 | PixelFormat::Img1Bgrx8888 => BlitColor::Bgrx8888,
            PixelFormat::Rgba1010102 => BlitColor::Rgba1010102,
            PixelFormat::YCbCr422I | PixelFormat::Yuyv => BlitColor::Yuyv,
            PixelFormat::Uyvy => BlitColor::Uyvy,
            PixelFormat::YCbCr422Sp => BlitColor::Nv16,
            PixelFormat::YCrCb420Sp => BlitColor::Nv21,
            PixelFormat::Yv12 => BlitColor::Yv12,
            PixelFormat::I420 => BlitColor::I420,
            PixelFormat::YCbCrP010 => BlitColor::P010,
            PixelFormat::Nv12Blk => BlitColor::Nv12Blk,
            PixelFormat::Nv12Blk10BitH
            | PixelFormat::Nv12Blk10BitHJump
            | PixelFormat::Nv12Blk10BitV
            | PixelFormat::Nv12Blk10BitVJump => BlitColor::Nv12Blk10Bit,
            PixelFormat::Ufo => BlitColor::Ufo,
            PixelFormat::Ufo10BitH
            | PixelFormat::Ufo10BitHJump
            | PixelFormat::Ufo10BitV
            | PixelFormat::Ufo10BitVJump => BlitColor::Ufo10Bit,
            PixelFormat::Nv12Hyfbc => BlitColor::Nv12Hyfbc,
            PixelFormat::P010Hyfbc => BlitColor::P010Hyfbc,
            PixelFormat::RgbaFp16
            | PixelFormat::YCbCr420_888
            | PixelFormat::YuvPrivate
            | PixelFormat::YuvPrivate10Bit
            | PixelFormat::Dim => return None,
        };
        Some(color)
    }
}

/// Blit engine color formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitColor {
    Unknown,
    Rgb565,
    Rgb888,
    Rgba8888,
    Bgra8888,
    Rgbx8888,
    Bgrx8888,
    Rgba1010102,
    Yuyv,
    Uyvy,
    Nv16,
    Nv21,
    Yv12,
    I420,
    P010,
    Nv12Blk,
    Nv12Blk10Bit,
    Ufo,
    Ufo10Bit,
    Nv12Hyfbc,
    P010Hyfbc,
}

impl BlitColor {
    /// Chroma is horizontally sub-sampled
    pub fn h_subsampled(self) -> bool {
        !matches!(
            self,
            BlitColor::Unknown
                | BlitColor::Rgb565
                | BlitColor::Rgb888
                | BlitColor::Rgba8888
                | BlitColor::Bgra8888
                | BlitColor::Rgbx8888
                | BlitColor::Bgrx8888
                | BlitColor::Rgba1010102
        )
    }
}

/// Dataspace encoding (standard | transfer | range)
pub mod dataspace {
    pub const UNKNOWN: i32 = 0;

    pub const STANDARD_SHIFT: i32 = 16;
    pub const STANDARD_MASK: i32 = 63 << STANDARD_SHIFT;
    pub const STANDARD_BT709: i32 = 1 << STANDARD_SHIFT;
    pub const STANDARD_BT601_625: i32 = 2 << STANDARD_SHIFT;
    pub const STANDARD_BT601_625_UNADJUSTED: i32 = 3 << STANDARD_SHIFT;
    pub const STANDARD_BT601_525: i32 = 4 << STANDARD_SHIFT;
    pub const STANDARD_BT601_525_UNADJUSTED: i32 = 5 << STANDARD_SHIFT;
    pub const STANDARD_BT2020: i32 = 6 << STANDARD_SHIFT;
    pub const STANDARD_DCI_P3: i32 = 10 << STANDARD_SHIFT;

    pub const TRANSFER_SHIFT: i32 = 22;
    pub const TRANSFER_MASK: i32 = 31 << TRANSFER_SHIFT;
    pub const TRANSFER_SMPTE_170M: i32 = 3 << TRANSFER_SHIFT;
    pub const TRANSFER_ST2084: i32 = 7 << TRANSFER_SHIFT;
    pub const TRANSFER_HLG: i32 = 8 << TRANSFER_SHIFT;

    pub const RANGE_SHIFT: i32 = 27;
    pub const RANGE_MASK: i32 = 7 << RANGE_SHIFT;
    pub const RANGE_FULL: i32 = 1 << RANGE_SHIFT;
    pub const RANGE_LIMITED: i32 = 2 << RANGE_SHIFT;
    pub const RANGE_EXTENDED: i32 = 3 << RANGE_SHIFT;

    pub const BT2020_PQ: i32 = 0x09C6_0000;
    pub const BT2020_ITU_PQ: i32 = 0x11C6_0000;
    pub const BT2020_ITU_HLG: i32 = 0x1206_0000;
    pub const V0_BT709: i32 = 0x10C1_0000;
    pub const V0_BT601_625: i32 = STANDARD_BT601_625 | TRANSFER_SMPTE_170M | RANGE_LIMITED;

    pub fn standard(ds: i32) -> i32 {
        ds & STANDARD_MASK
    }

    pub fn range(ds: i32) -> i32 {
        ds & RANGE_MASK
    }

    /// PQ or HLG transfer
    pub fn is_hdr(ds: i32) -> bool {
        let transfer = ds & TRANSFER_MASK;
        transfer == TRANSFER_ST2084 || transfer == TRANSFER_HLG
    }
}

/// Gralloc usage bits the classifier cares about
pub mod usage {
    pub const PROTECTED: u64 = 0x0000_4000;
    pub const SECURE: u64 = 0x0100_0000;

    pub fn has_protected(usage: u64) -> bool {
        usage & PROTECTED != 0
    }

    pub fn has_secure(usage: u64) -> bool {
        usage & SECURE != 0
    }

    pub fn has_protected_or_secure(usage: u64) -> bool {
        has_protected(usage) || has_secure(usage)
    }
}

/// Which client produced a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProducerType {
    #[default]
    Unknown,
    Gpu,
    Video,
    Camera,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HdrScenario {
    #[default]
    None,
    Common,
    Video,
    Game,
    CameraPreview,
}

/// Hardware path chosen for a layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwLayerType {
    /// Not classified yet this cycle
    #[default]
    None,
    /// GPU/client composition
    Invalid,
    Dim,
    /// Overlay engine
    Ui,
    /// Memory-to-memory blit/scale/PQ
    Mm,
    /// ML inference output
    Glai,
    Cursor,
}

impl HwLayerType {
    pub const ALL: [HwLayerType; 7] = [
        HwLayerType::None,
        HwLayerType::Invalid,
        HwLayerType::Dim,
        HwLayerType::Ui,
        HwLayerType::Mm,
        HwLayerType::Glai,
        HwLayerType::Cursor,
    ];
}

/// Refresh request reasons passed to `EventListener::on_refresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Normal,
    LowLatencyRepaint,
    ConfigChange,
}
