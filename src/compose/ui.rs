//! Overlay (UI) path eligibility

use super::{Classifier, DisplayCaps, ReasonCode};
use crate::hal::{transform, BlendMode, CompositionType, HdrScenario, PixelFormat};
use crate::layer::HwcLayer;

pub(super) fn check(c: &Classifier, layer: &HwcLayer, disp: &DisplayCaps) -> Result<(), ReasonCode> {
    let Some(buf) = layer.buffer() else {
        return Err(ReasonCode::NoBuffer);
    };
    let p = c.platform();

    if !c.overlay.is_supported_size(disp.id, buf.width, buf.height) {
        return Err(ReasonCode::UnsupportedSize);
    }
    if buf.compressed && !p.disp_support_decompress {
        return Err(ReasonCode::CompressionUnsupported);
    }
    if buf.g2g_compressed {
        return Err(ReasonCode::G2gCompressed);
    }
    if layer.is_need_pq(c.features(), 1) {
        return Err(ReasonCode::NeedsGamePq);
    }
    if layer.hdr_scenario() != HdrScenario::None {
        return Err(ReasonCode::HdrContent);
    }

    let format = buf.format;
    let allowed = match format {
        PixelFormat::Yuyv | PixelFormat::YCbCr422I | PixelFormat::Img1Bgrx8888 => true,
        PixelFormat::Rgba1010102 => p.is_ovl_support_rgba1010102,
        f => f.in_ovl_rgb_range(),
    };
    if !allowed {
        return Err(ReasonCode::UnsupportedFormat);
    }
    if buf.rx_hal_10bit && format == PixelFormat::Rgba1010102 {
        return Err(ReasonCode::RxHal10Bit);
    }
    if !p.support_2subsample_with_odd_size_roi
        && matches!(format, PixelFormat::Yuyv | PixelFormat::YCbCr422I)
    {
        return Err(ReasonCode::OddSubsampledRoi);
    }

    match layer.blend() {
        BlendMode::Coverage => return Err(ReasonCode::CoverageBlend),
        BlendMode::None if format == PixelFormat::Bgra8888 => return Err(ReasonCode::OpaqueBgra),
        _ => {}
    }
    if buf.pq_enable || layer.is_ai_pq() {
        return Err(ReasonCode::PqEnhance);
    }
    c.check_constant_alpha(layer, format)?;

    let (mut w, mut h) = (layer.src_width(), layer.src_height());
    if w <= 0 || h <= 0 {
        return Err(ReasonCode::EmptySource);
    }
    if layer.src_left() < 0 || layer.src_top() < 0 {
        return Err(ReasonCode::NegativeCropOffset);
    }

    if buf.prexform != 0 {
        if p.prexform_ui == 0 {
            return Err(ReasonCode::PrexformUnsupported);
        }
        if buf.prexform & transform::ROT_90 != 0 {
            std::mem::swap(&mut w, &mut h);
        }
    }
    if layer.transform() != buf.prexform {
        return Err(ReasonCode::RotationUnsupported);
    }

    let frame = layer.display_frame();
    if frame.width() != w || frame.height() != h {
        if !disp.rpo {
            return Err(ReasonCode::ScalingUnsupported);
        }
        let input_width = if layer.xform() & transform::ROT_90 != 0 {
            layer.src_height()
        } else {
            layer.src_width()
        };
        c.check_rsz_input(disp, format, input_width)?;
    }

    if disp.ethdr {
        let odd = w % 2 != 0 || h % 2 != 0;
        if odd && layer.composition_type_before_validate() != CompositionType::Cursor {
            return Err(ReasonCode::EthdrOddSize);
        }
        if format == PixelFormat::Rgba1010102 {
            return Err(ReasonCode::EthdrRgba1010102);
        }
    }
    Ok(())
}
