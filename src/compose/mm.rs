//! Memory-to-memory (MM) path eligibility

use super::{BlitEngine, BlitQuery, Classifier, DisplayCaps, ReasonCode};
use crate::display::DisplayId;
use crate::hal::{dataspace, BlendMode, BlitColor, HdrScenario, PixelFormat};
use crate::layer::{mdp_caps, HwcLayer};

/// Minimum source and destination edge the blit engine accepts
const MIN_EDGE: i32 = 4;

/// Returns the `mdp_caps` bits the layer needs on success
pub(super) fn check(c: &Classifier, layer: &HwcLayer, disp: &DisplayCaps) -> Result<u32, ReasonCode> {
    let Some(buf) = layer.buffer() else {
        return Err(ReasonCode::NoBuffer);
    };
    let p = c.platform();
    let mut caps = 0;

    if layer.blend() == BlendMode::Coverage {
        return Err(ReasonCode::CoverageBlend);
    }
    c.check_constant_alpha(layer, buf.format)?;

    let frame = layer.display_frame();
    let (src_w, src_h) = (layer.src_width(), layer.src_height());
    let (dst_w, dst_h) = (frame.width(), frame.height());
    if src_w < MIN_EDGE || src_h < MIN_EDGE || dst_w < MIN_EDGE || dst_h < MIN_EDGE {
        return Err(ReasonCode::TooSmall);
    }
    if layer.src_left() < 0 || layer.src_top() < 0 {
        return Err(ReasonCode::NegativeCropOffset);
    }

    let format = if buf.format.is_private() {
        buf.private_format.ok_or(ReasonCode::NoBlitColor)?
    } else {
        buf.format
    };
    let src_color = format.blit_color().ok_or(ReasonCode::NoBlitColor)?;
    if format == PixelFormat::Rgba1010102 && !p.is_mdp_support_rgba1010102 {
        return Err(ReasonCode::Rgba1010102Unsupported);
    }
    if format == PixelFormat::RgbaFp16 {
        return Err(ReasonCode::Fp16Unsupported);
    }
    if buf.compressed {
        if !p.mdp_support_decompress {
            return Err(ReasonCode::CompressionUnsupported);
        }
        if format == PixelFormat::Rgb565 {
            return Err(ReasonCode::CompressedRgb565);
        }
    }

    let rotate = layer.need_rotate();
    let scaling = layer.need_scaling();
    let rx_1010102 = buf.rx_hal_10bit && format == PixelFormat::Rgba1010102;
    let rotate_crop_ok = layer.src_left() == 0 && layer.src_top() == 0 && src_w > 8;
    match format {
        PixelFormat::Rgba8888 | PixelFormat::Bgra8888 | PixelFormat::Rgba1010102 => {
            if !p.enable_rgba_rotate {
                return Err(ReasonCode::RotationUnsupported);
            }
            if !rx_1010102 && scaling && !disp.rpo {
                return Err(ReasonCode::ScalingUnsupported);
            }
            if rotate {
                if !rotate_crop_ok {
                    return Err(ReasonCode::RotateCropUnaligned);
                }
                caps |= mdp_caps::ROT;
            }
        }
        PixelFormat::Rgbx8888 | PixelFormat::Bgrx8888 | PixelFormat::Rgb888 | PixelFormat::Rgb565 => {
            if scaling {
                if !p.enable_rgbx_scaling && !disp.rpo {
                    return Err(ReasonCode::ScalingUnsupported);
                }
                if p.enable_rgbx_scaling {
                    caps |= mdp_caps::RSZ;
                }
            }
            if rotate {
                if !rotate_crop_ok {
                    return Err(ReasonCode::RotateCropUnaligned);
                }
                caps |= mdp_caps::ROT;
            }
            // the blitter handles neither RGBX scaling nor rotation without this
            if !p.enable_rgba_rotate {
                return Err(ReasonCode::RotationUnsupported);
            }
        }
        _ => {
            if rotate {
                caps |= mdp_caps::ROT;
            }
            if scaling && p.mdp_scale_percentage.abs() >= 0.05 {
                caps |= mdp_caps::RSZ;
            }
        }
    }

    let scenario = layer.hdr_scenario();
    if dataspace::is_hdr(layer.dataspace()) && scenario == HdrScenario::None {
        return Err(ReasonCode::HdrWithoutScenario);
    }
    if scenario != HdrScenario::None {
        caps |= mdp_caps::HDR;
    }

    let dst_color = layer
        .mdp_output_format(p, c.features(), disp)
        .and_then(PixelFormat::blit_color)
        .unwrap_or(BlitColor::Unknown);
    let mut query = if disp.mml && scenario != HdrScenario::Game {
        BlitQuery {
            engine: BlitEngine::Mml,
            src_width: src_w,
            src_height: src_h,
            dst_width: dst_w,
            dst_height: dst_h,
            orientation: layer.xform(),
            src_color,
            dst_color,
            pq_enhance: layer.pq_enhance(c.features()),
            secure: buf.is_protected_or_secure(),
        }
    } else {
        BlitQuery {
            engine: BlitEngine::Mdp,
            src_width: src_w,
            src_height: src_h,
            dst_width: dst_w,
            dst_height: dst_h,
            orientation: layer.xform(),
            src_color: BlitColor::Unknown,
            dst_color: BlitColor::Unknown,
            pq_enhance: layer.pq_enhance(c.features()),
            secure: buf.is_protected_or_secure(),
        }
    };
    let mut blit_valid = c.blit.is_valid(&query);
    if src_color.h_subsampled() || dst_color.h_subsampled() {
        // sub-sampled chroma also needs the odd-aligned variant to pass
        query.src_width -= 1;
        query.src_height -= 1;
        query.dst_width += 2;
        query.dst_height += 2;
        blit_valid &= c.blit.is_valid(&query);
    }

    let force_pat = if disp.id.is_primary() {
        p.primary_force_pat
    } else if disp.id == DisplayId::EXTERNAL {
        p.ext_force_pat
    } else {
        0
    };
    match force_pat {
        1 => return Err(ReasonCode::ForcedGpu),
        2 => return Ok(caps),
        _ => {}
    }
    if !blit_valid {
        return Err(ReasonCode::BlitRejected);
    }

    let secure = buf.is_protected_or_secure();
    if format.is_hyfbc() && !secure && !buf.is_hdr {
        let passthrough = format == PixelFormat::P010Hyfbc && disp.id.is_primary();
        if !passthrough {
            let video_size = src_w.max(0) as usize * src_h.max(0) as usize;
            if video_size > p.limited_video_size || !layer.pq_enhance(c.features()) {
                return Err(ReasonCode::HyfbcVideoLimit);
            }
            caps |= mdp_caps::RSZ;
        }
    }

    let odd_dst = dst_w % 2 != 0 || dst_h % 2 != 0;
    if !p.is_ovl_support_odd_size && !disp.id.is_primary() && !secure && odd_dst {
        return Err(ReasonCode::OddDestination);
    }
    if disp.ethdr && format == PixelFormat::Rgba1010102 && !rx_1010102 {
        return Err(ReasonCode::EthdrRgba1010102);
    }

    let display_ok = disp.id.is_primary() || secure || odd_dst || disp.id == DisplayId::EXTERNAL;
    if !display_ok {
        return Err(ReasonCode::DisplayUnsupported);
    }
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::{FeatureList, PlatformConfig};
    use crate::display::{FRect, Rect};
    use crate::hal::{transform, usage, ProducerType};
    use crate::layer::BufferInfo;

    fn video(w: i32, h: i32, dst_w: i32, dst_h: i32, format: PixelFormat) -> HwcLayer {
        let mut layer = HwcLayer::new();
        layer.set_display_frame(Rect::sized(dst_w, dst_h));
        layer.set_source_crop(FRect::new(0.0, 0.0, w as f32, h as f32));
        let mut buf = BufferInfo::new(9, w as u32, h as u32, format);
        buf.producer = ProducerType::Video;
        layer.set_buffer(Some(buf));
        layer
    }

    fn primary() -> DisplayCaps {
        DisplayCaps::new(DisplayId::PRIMARY)
    }

    #[test]
    fn test_video_scaling_requests_resizer() {
        let c = classifier();
        let l = video(1280, 720, 1920, 1080, PixelFormat::Yv12);
        assert_eq!(check(&c, &l, &primary()), Ok(mdp_caps::RSZ));
    }

    #[test]
    fn test_video_rotation_requests_rotator() {
        let c = classifier();
        let mut l = video(1280, 720, 720, 1280, PixelFormat::Yv12);
        l.set_transform(transform::ROT_90);
        assert_eq!(check(&c, &l, &primary()), Ok(mdp_caps::ROT));
    }

    #[test]
    fn test_tiny_source_rejected() {
        let c = classifier();
        let l = video(3, 3, 100, 100, PixelFormat::Yv12);
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::TooSmall));
    }

    #[test]
    fn test_private_format_resolves_through_buffer() {
        let c = classifier();
        let mut l = video(640, 480, 640, 480, PixelFormat::YuvPrivate);
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::NoBlitColor));

        let mut buf = l.buffer().cloned().unwrap();
        buf.private_format = Some(PixelFormat::Nv12Blk);
        l.set_buffer(Some(buf));
        assert_eq!(check(&c, &l, &primary()), Ok(0));
    }

    #[test]
    fn test_subsampled_color_queries_twice() {
        let blit = std::sync::Arc::new(FixedBlit::new(true));
        let c = super::super::Classifier::new(
            PlatformConfig::default(),
            FeatureList::default(),
            std::sync::Arc::new(FakeOverlay::default()),
            blit.clone(),
            std::sync::Arc::new(super::super::NullGlaiEngine),
        );
        let disp = DisplayCaps { mml: true, ..primary() };
        let l = video(640, 480, 640, 480, PixelFormat::Yv12);
        check(&c, &l, &disp).unwrap();
        let queries = blit.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].engine, BlitEngine::Mml);
        assert_eq!((queries[1].src_width, queries[1].src_height), (639, 479));
        assert_eq!((queries[1].dst_width, queries[1].dst_height), (642, 482));
    }

    #[test]
    fn test_force_pat_overrides_blit() {
        let platform = PlatformConfig {
            primary_force_pat: 2,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), false);
        let l = video(640, 480, 640, 480, PixelFormat::Yv12);
        assert_eq!(check(&c, &l, &primary()), Ok(0));

        let platform = PlatformConfig {
            primary_force_pat: 1,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::ForcedGpu));
    }

    #[test]
    fn test_rgba_needs_rotate_support() {
        let c = classifier();
        let mut l = video(640, 480, 640, 480, PixelFormat::Rgba8888);
        l.set_blend(BlendMode::Premultiplied);
        let mut buf = l.buffer().cloned().unwrap();
        buf.format = PixelFormat::Rgba8888;
        l.set_buffer(Some(buf));
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::RotationUnsupported));

        let c = classifier_with(PlatformConfig::mt8195(), FeatureList::default(), true);
        assert_eq!(check(&c, &l, &primary()), Ok(0));
    }

    #[test]
    fn test_virtual_display_with_even_destination_unsupported() {
        let c = classifier();
        let l = video(640, 480, 640, 480, PixelFormat::Yv12);
        let virt = DisplayCaps::new(DisplayId::VIRTUAL);
        assert_eq!(check(&c, &l, &virt), Err(ReasonCode::DisplayUnsupported));
        let ext = DisplayCaps::new(DisplayId::EXTERNAL);
        assert_eq!(check(&c, &l, &ext), Ok(0));
    }

    #[test]
    fn test_virtual_display_validity_follows_layer_security() {
        let c = classifier();
        let mut secure_layer = video(640, 480, 640, 480, PixelFormat::Yv12);
        let mut buf = secure_layer.buffer().cloned().unwrap();
        buf.usage |= usage::SECURE;
        secure_layer.set_buffer(Some(buf));
        let virt = DisplayCaps::new(DisplayId::VIRTUAL);
        assert_eq!(check(&c, &secure_layer, &virt), Ok(0));

        // a secure sink does not make a plain layer valid
        let plain = video(640, 480, 640, 480, PixelFormat::Yv12);
        let secure_virt = DisplayCaps {
            secure: true,
            ..DisplayCaps::new(DisplayId::VIRTUAL)
        };
        assert_eq!(check(&c, &plain, &secure_virt), Err(ReasonCode::DisplayUnsupported));
    }

    #[test]
    fn test_rgbx_needs_rotate_support_without_transform() {
        let l = video(640, 480, 640, 480, PixelFormat::Rgbx8888);
        let c = classifier();
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::RotationUnsupported));

        let platform = PlatformConfig {
            enable_rgba_rotate: true,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        assert_eq!(check(&c, &l, &primary()), Ok(0));
    }

    #[test]
    fn test_hyfbc_video_limit_uses_source_crop() {
        let platform = PlatformConfig {
            limited_video_size: 1920 * 1080,
            ..Default::default()
        };
        let c = classifier_with(platform, FeatureList::default(), true);
        let mut l = video(3840, 2160, 1920, 1080, PixelFormat::Nv12Hyfbc);
        let mut buf = l.buffer().cloned().unwrap();
        buf.pq_enable = true;
        l.set_buffer(Some(buf));
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::HyfbcVideoLimit));

        // a 1080p crop of the 4K buffer fits
        l.set_source_crop(FRect::new(0.0, 0.0, 1920.0, 1080.0));
        assert_eq!(check(&c, &l, &primary()), Ok(mdp_caps::RSZ));
    }

    #[test]
    fn test_hdr_dataspace_without_scenario_rejected() {
        let c = classifier();
        let mut l = video(640, 480, 640, 480, PixelFormat::Yv12);
        l.set_dataspace(dataspace::BT2020_ITU_PQ);
        assert_eq!(check(&c, &l, &primary()), Err(ReasonCode::HdrWithoutScenario));

        l.setup_hdr_scenario(&FeatureList::default());
        assert_eq!(l.hdr_scenario(), HdrScenario::Video);
        assert_eq!(check(&c, &l, &primary()), Ok(mdp_caps::HDR));
    }
}
