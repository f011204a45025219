//! Pure helper functions for the KMS core.
//!
//! Mode selection and normalization, FourCC arithmetic and `IN_FORMATS` blob parsing. Nothing in
//! here touches the device.

use drm_ffi::drm_mode_modeinfo;
use scanout_config::GuiSizeLimit;
use smithay::backend::allocator::Fourcc;
use smithay::reexports::drm::control::{Mode, ModeTypeFlags};
use tracing::{debug, warn};

use super::error::KmsError;
use super::types::{Resolution, ScanType};

// =============================================================================
// Mode Selection
// =============================================================================

fn is_interlaced(mode: &Mode) -> bool {
    drm_mode_modeinfo::from(*mode).flags & drm_ffi::DRM_MODE_FLAG_INTERLACE != 0
}

/// Short description of a mode for logs, e.g. `1920x1080i @ 60 Hz`.
pub fn describe_mode(mode: &Mode) -> String {
    let (width, height) = mode.size();
    let interlace = if is_interlaced(mode) { "i" } else { "" };
    format!("{width}x{height}{interlace} @ {} Hz", mode.vrefresh())
}

/// Picks the mode the display prefers, or the largest one if none is marked preferred.
///
/// The first preferred mode wins. Among modes of equal area the earliest is kept. Modes with a
/// zero width or height are never picked, so a list holding only those fails like an empty one.
pub fn find_preferred_mode(modes: &[Mode]) -> Result<usize, KmsError> {
    let mut best = None;
    let mut best_area = 0;

    for (index, mode) in modes.iter().enumerate() {
        if mode.mode_type().contains(ModeTypeFlags::PREFERRED) {
            debug!("found preferred mode: {}", describe_mode(mode));
            return Ok(index);
        }

        let (width, height) = mode.size();
        let area = u32::from(width) * u32::from(height);
        if area > best_area {
            best = Some(index);
            best_area = area;
        }
    }

    match best {
        Some(index) => {
            debug!("no preferred mode, using largest: {}", describe_mode(&modes[index]));
            Ok(index)
        }
        None => {
            warn!("failed to find preferred mode");
            Err(KmsError::ModeListEmpty)
        }
    }
}

// =============================================================================
// Mode Normalization
// =============================================================================

/// GUI size for a screen of `size` at `vrefresh` under `limit`.
///
/// Only screens larger than 1920×1080 in both dimensions are capped.
pub fn gui_size(limit: GuiSizeLimit, size: (u32, u32), vrefresh: u32) -> (u32, u32) {
    const HD_720: (u32, u32) = (1280, 720);
    const HD_1080: (u32, u32) = (1920, 1080);

    if size.0 <= HD_1080.0 || size.1 <= HD_1080.1 {
        return size;
    }

    let above_30hz = vrefresh > 30;
    match limit {
        GuiSizeLimit::Unlimited => size,
        GuiSizeLimit::Cap720p => HD_720,
        GuiSizeLimit::Cap720pAbove30Hz if above_30hz => HD_720,
        GuiSizeLimit::Cap720pAbove30Hz => HD_1080,
        GuiSizeLimit::Cap1080p => HD_1080,
        GuiSizeLimit::Cap1080pAbove30Hz if above_30hz => HD_1080,
        GuiSizeLimit::Cap1080pAbove30Hz => size,
    }
}

/// Refresh rate of a mode in Hz.
///
/// A pixel clock that is not a multiple of 5 kHz marks an NTSC-style fractional rate.
pub fn refresh_rate(mode: &Mode) -> f32 {
    let vrefresh = mode.vrefresh() as f32;
    if mode.clock() % 5 != 0 {
        vrefresh * (1000. / 1001.)
    } else {
        vrefresh
    }
}

/// Scan type of a mode. Stereo 3D layouts take precedence over interlacing.
pub fn scan_type(mode: &Mode) -> ScanType {
    let flags = drm_mode_modeinfo::from(*mode).flags;
    let layout = flags & drm_ffi::DRM_MODE_FLAG_3D_MASK;

    if layout != 0 {
        match layout {
            drm_ffi::DRM_MODE_FLAG_3D_TOP_AND_BOTTOM => ScanType::StereoTopAndBottom,
            drm_ffi::DRM_MODE_FLAG_3D_SIDE_BY_SIDE_HALF => ScanType::StereoSideBySide,
            // Other stereo layouts aren't presented; show them as the 2D frame.
            _ => ScanType::Progressive,
        }
    } else if flags & drm_ffi::DRM_MODE_FLAG_INTERLACE != 0 {
        ScanType::Interlaced
    } else {
        ScanType::Progressive
    }
}

/// Subtitle safe-area offset: 96.5% of the GUI height, rounded down.
pub fn subtitle_offset(height: u32) -> u32 {
    height * 965 / 1000
}

/// Converts a raw driver mode into a resolution for the GUI.
pub fn normalize_mode(mode: &Mode, limit: GuiSizeLimit) -> Resolution {
    let (screen_width, screen_height) = mode.size();
    let (screen_width, screen_height) = (u32::from(screen_width), u32::from(screen_height));
    let (width, height) = gui_size(limit, (screen_width, screen_height), mode.vrefresh());

    let refresh_rate = refresh_rate(mode);
    let scan = scan_type(mode);
    let interlace = if scan == ScanType::Interlaced { "i" } else { "" };
    let name = format!("{screen_width}x{screen_height}{interlace} @ {refresh_rate:.6} Hz");

    Resolution {
        id: None,
        screen_width,
        screen_height,
        width,
        height,
        refresh_rate,
        subtitles: subtitle_offset(height),
        pixel_ratio: 1.,
        fullscreen: true,
        scan,
        name,
    }
}

// =============================================================================
// FourCC Helpers
// =============================================================================

fn replace_alpha_char(format: Fourcc, alpha: u8) -> Option<Fourcc> {
    let code = (format as u32 & 0xFFFF_FF00) | u32::from(alpha);
    Fourcc::try_from(code).ok()
}

/// The variant of an RGB format with an alpha channel, e.g. `XR24` → `AR24`.
pub fn with_alpha(format: Fourcc) -> Option<Fourcc> {
    replace_alpha_char(format, b'A')
}

/// The variant of an RGB format with the alpha channel ignored, e.g. `AR24` → `XR24`.
pub fn without_alpha(format: Fourcc) -> Option<Fourcc> {
    replace_alpha_char(format, b'X')
}

/// Printable form of a FourCC code, e.g. `XR24`.
pub fn fourcc_string(code: u32) -> String {
    code.to_le_bytes().iter().map(|&b| char::from(b)).collect()
}

// =============================================================================
// IN_FORMATS Parsing
// =============================================================================

const FORMAT_BLOB_CURRENT: u32 = 1;
const FORMAT_MODIFIER_SIZE: usize = 24;

fn read_u32(blob: &[u8], offset: usize) -> Option<u32> {
    blob.get(offset..offset.checked_add(4)?)
        .map(bytemuck::pod_read_unaligned)
}

fn read_u64(blob: &[u8], offset: usize) -> Option<u64> {
    blob.get(offset..offset.checked_add(8)?)
        .map(bytemuck::pod_read_unaligned)
}

/// Parses a plane's `IN_FORMATS` property blob into formats with their modifiers.
///
/// The blob is a `drm_format_modifier_blob` header followed by a format array and an array of
/// `drm_format_modifier`, each of which applies to up to 64 formats starting at its offset.
pub fn parse_in_formats(blob: &[u8]) -> Option<Vec<(u32, Vec<u64>)>> {
    let version = read_u32(blob, 0)?;
    if version != FORMAT_BLOB_CURRENT {
        warn!("IN_FORMATS blob has unsupported version {version}");
        return None;
    }

    let count_formats = read_u32(blob, 8)? as usize;
    let formats_offset = read_u32(blob, 12)? as usize;
    let count_modifiers = read_u32(blob, 16)? as usize;
    let modifiers_offset = read_u32(blob, 20)? as usize;

    let mut formats = (0..count_formats)
        .map(|i| read_u32(blob, formats_offset.checked_add(i * 4)?).map(|f| (f, Vec::new())))
        .collect::<Option<Vec<_>>>()?;

    for i in 0..count_modifiers {
        let base = modifiers_offset.checked_add(i * FORMAT_MODIFIER_SIZE)?;
        let mut indices = read_u64(blob, base)?;
        let offset = read_u32(blob, base + 8)? as usize;
        let modifier = read_u64(blob, base + 16)?;

        while indices != 0 {
            let bit = indices.trailing_zeros() as usize;
            indices &= indices - 1;

            let Some((_, modifiers)) = formats.get_mut(offset + bit) else {
                warn!("IN_FORMATS modifier offset is out of bounds");
                return None;
            };
            modifiers.push(modifier);
        }
    }

    Some(formats)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use insta::assert_snapshot;
    use proptest::prelude::*;

    use super::*;
    use crate::kms::tests::fixtures::{mode, mode_with};

    #[test]
    fn preferred_mode_wins_immediately() {
        let modes = [
            mode(1280, 720, 60),
            mode_with(1920, 1080, 60, 148_500, drm_ffi::DRM_MODE_TYPE_PREFERRED, 0),
            mode(3840, 2160, 30),
            mode_with(1280, 1024, 60, 108_000, drm_ffi::DRM_MODE_TYPE_PREFERRED, 0),
        ];
        assert_eq!(find_preferred_mode(&modes).unwrap(), 1);
    }

    #[test]
    fn largest_mode_without_preferred() {
        let modes = [
            mode(1280, 720, 60),
            mode(1920, 1080, 60),
            mode(1920, 1080, 50),
            mode(1024, 768, 60),
        ];
        // Ties keep the earliest.
        assert_eq!(find_preferred_mode(&modes).unwrap(), 1);
    }

    #[test]
    fn empty_mode_list() {
        assert!(matches!(
            find_preferred_mode(&[]),
            Err(KmsError::ModeListEmpty)
        ));
    }

    #[test]
    fn zero_area_modes_are_never_picked() {
        let modes = [mode(0, 1080, 60), mode(1920, 0, 60)];
        assert!(matches!(
            find_preferred_mode(&modes),
            Err(KmsError::ModeListEmpty)
        ));

        let modes = [mode(0, 0, 60), mode(640, 480, 60)];
        assert_eq!(find_preferred_mode(&modes).unwrap(), 1);
    }

    #[test]
    fn fractional_refresh_rate() {
        let ntsc = mode_with(1920, 1080, 60, 148_352, 0, 0);
        assert_abs_diff_eq!(refresh_rate(&ntsc), 59.94006, epsilon = 1e-4);

        let exact = mode_with(1920, 1080, 60, 148_500, 0, 0);
        assert_eq!(refresh_rate(&exact), 60.);
    }

    #[test]
    fn gui_size_tiers() {
        let uhd = (3840, 2160);
        assert_eq!(gui_size(GuiSizeLimit::Unlimited, uhd, 60), uhd);
        assert_eq!(gui_size(GuiSizeLimit::Cap720p, uhd, 24), (1280, 720));
        assert_eq!(gui_size(GuiSizeLimit::Cap720pAbove30Hz, uhd, 60), (1280, 720));
        assert_eq!(gui_size(GuiSizeLimit::Cap720pAbove30Hz, uhd, 30), (1920, 1080));
        assert_eq!(gui_size(GuiSizeLimit::Cap1080p, uhd, 24), (1920, 1080));
        assert_eq!(gui_size(GuiSizeLimit::Cap1080p, uhd, 60), (1920, 1080));
        assert_eq!(gui_size(GuiSizeLimit::Cap1080pAbove30Hz, uhd, 60), (1920, 1080));
        assert_eq!(gui_size(GuiSizeLimit::Cap1080pAbove30Hz, uhd, 24), uhd);
    }

    #[test]
    fn gui_size_needs_both_dimensions_above_1080p() {
        assert_eq!(
            gui_size(GuiSizeLimit::Cap720p, (1920, 1080), 60),
            (1920, 1080)
        );
        assert_eq!(
            gui_size(GuiSizeLimit::Cap720p, (2560, 1080), 60),
            (2560, 1080)
        );
        assert_eq!(
            gui_size(GuiSizeLimit::Cap720p, (2560, 1440), 60),
            (1280, 720)
        );
    }

    #[test]
    fn subtitle_offsets() {
        assert_eq!(subtitle_offset(1080), 1042);
        assert_eq!(subtitle_offset(720), 694);
        assert_eq!(subtitle_offset(2160), 2084);
    }

    #[test]
    fn normalize_uhd_with_1080p_cap() {
        let uhd = mode_with(3840, 2160, 60, 594_000, 0, 0);

        let res = normalize_mode(&uhd, GuiSizeLimit::Cap1080p);
        assert_eq!((res.screen_width, res.screen_height), (3840, 2160));
        assert_eq!((res.width, res.height), (1920, 1080));
        assert_eq!(res.subtitles, 1042);
        assert_eq!(res.scan, ScanType::Progressive);

        let res = normalize_mode(&uhd, GuiSizeLimit::Unlimited);
        assert_eq!((res.width, res.height), (3840, 2160));
        assert_eq!(res.subtitles, 2084);
    }

    #[test]
    fn mode_names() {
        let progressive = mode_with(1920, 1080, 60, 148_500, 0, 0);
        assert_snapshot!(
            normalize_mode(&progressive, GuiSizeLimit::Unlimited).name,
            @"1920x1080 @ 60.000000 Hz"
        );

        let interlaced = mode_with(1920, 1080, 50, 74_250, 0, drm_ffi::DRM_MODE_FLAG_INTERLACE);
        assert_snapshot!(
            normalize_mode(&interlaced, GuiSizeLimit::Unlimited).name,
            @"1920x1080i @ 50.000000 Hz"
        );
    }

    #[test]
    fn stereo_layout_beats_interlace() {
        let flags = |layout| layout | drm_ffi::DRM_MODE_FLAG_INTERLACE;

        let tab = mode_with(
            1920,
            1080,
            24,
            74_250,
            0,
            flags(drm_ffi::DRM_MODE_FLAG_3D_TOP_AND_BOTTOM),
        );
        assert_eq!(scan_type(&tab), ScanType::StereoTopAndBottom);

        let sbs = mode_with(
            1920,
            1080,
            24,
            74_250,
            0,
            flags(drm_ffi::DRM_MODE_FLAG_3D_SIDE_BY_SIDE_HALF),
        );
        assert_eq!(scan_type(&sbs), ScanType::StereoSideBySide);

        let packed = mode_with(
            1920,
            1080,
            24,
            74_250,
            0,
            flags(drm_ffi::DRM_MODE_FLAG_3D_FRAME_PACKING),
        );
        assert_eq!(scan_type(&packed), ScanType::Progressive);

        let interlaced = mode_with(1920, 1080, 60, 74_250, 0, drm_ffi::DRM_MODE_FLAG_INTERLACE);
        assert_eq!(scan_type(&interlaced), ScanType::Interlaced);
    }

    #[test]
    fn fourcc_alpha_variants() {
        assert_eq!(with_alpha(Fourcc::Xrgb8888), Some(Fourcc::Argb8888));
        assert_eq!(without_alpha(Fourcc::Argb8888), Some(Fourcc::Xrgb8888));
        assert_eq!(with_alpha(Fourcc::Xbgr2101010), Some(Fourcc::Abgr2101010));
        assert_eq!(fourcc_string(Fourcc::Xrgb8888 as u32), "XR24");
        assert_eq!(fourcc_string(Fourcc::Nv12 as u32), "NV12");
    }

    fn in_formats_blob(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
        let formats_offset = 24u32;
        let modifiers_offset = formats_offset + formats.len() as u32 * 4;

        let mut blob = Vec::new();
        for value in [
            FORMAT_BLOB_CURRENT,
            0,
            formats.len() as u32,
            formats_offset,
            modifiers.len() as u32,
            modifiers_offset,
        ] {
            blob.extend_from_slice(&value.to_ne_bytes());
        }
        for format in formats {
            blob.extend_from_slice(&format.to_ne_bytes());
        }
        for &(indices, offset, modifier) in modifiers {
            blob.extend_from_slice(&indices.to_ne_bytes());
            blob.extend_from_slice(&offset.to_ne_bytes());
            blob.extend_from_slice(&0u32.to_ne_bytes());
            blob.extend_from_slice(&modifier.to_ne_bytes());
        }
        blob
    }

    #[test]
    fn in_formats_assigns_modifiers() {
        let xrgb = Fourcc::Xrgb8888 as u32;
        let argb = Fourcc::Argb8888 as u32;
        let nv12 = Fourcc::Nv12 as u32;
        let tiled = 0x0100_0000_0000_0001;

        let blob = in_formats_blob(&[xrgb, argb, nv12], &[(0b011, 0, tiled), (0b101, 0, 0)]);
        assert_eq!(
            parse_in_formats(&blob).unwrap(),
            vec![
                (xrgb, vec![tiled, 0]),
                (argb, vec![tiled]),
                (nv12, vec![0]),
            ]
        );
    }

    #[test]
    fn in_formats_rejects_bad_blobs() {
        let xrgb = Fourcc::Xrgb8888 as u32;

        // Truncated header.
        assert_eq!(parse_in_formats(&[1, 0, 0, 0]), None);

        // Wrong version.
        let mut blob = in_formats_blob(&[xrgb], &[]);
        blob[..4].copy_from_slice(&2u32.to_ne_bytes());
        assert_eq!(parse_in_formats(&blob), None);

        // Modifier pointing past the format list.
        let blob = in_formats_blob(&[xrgb], &[(0b10, 0, 0)]);
        assert_eq!(parse_in_formats(&blob), None);

        // Format array past the end.
        let mut blob = in_formats_blob(&[xrgb], &[]);
        blob.truncate(26);
        assert_eq!(parse_in_formats(&blob), None);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(
            width in 640u16..7680,
            height in 480u16..4320,
            vrefresh in 23u32..240,
            clock in 25_000u32..1_200_000,
            limit in 0u8..5,
        ) {
            let limit = GuiSizeLimit::from_setting(limit).unwrap();
            let mode = mode_with(width, height, vrefresh, clock, 0, 0);
            prop_assert_eq!(normalize_mode(&mode, limit), normalize_mode(&mode, limit));
        }

        #[test]
        fn gui_size_never_grows(
            width in 640u32..7680,
            height in 480u32..4320,
            vrefresh in 23u32..240,
            limit in 0u8..5,
        ) {
            let limit = GuiSizeLimit::from_setting(limit).unwrap();
            let (w, h) = gui_size(limit, (width, height), vrefresh);
            prop_assert!(w <= width && h <= height);
        }
    }
}
