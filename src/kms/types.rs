//! Type definitions for the KMS core.
//!
//! Driver objects are stored in per-type arenas (`Resources`) and refer to each other only by
//! driver identity or enumeration index, never by reference.

use std::collections::HashMap;
use std::fmt;

use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::reexports::drm::control::{connector, Mode};

// =============================================================================
// Constants
// =============================================================================

/// Driver-assigned object identity.
pub type ObjectId = u32;

/// Format the GUI plane scans out by default.
pub const GUI_FORMAT: Fourcc = Fourcc::Xrgb8888;

/// Format the GUI plane needs when it is blended over a video plane.
pub const GUI_ALPHA_FORMAT: Fourcc = Fourcc::Argb8888;

/// 4:2:0 chroma-subsampled format a video plane must accept.
pub const VIDEO_FORMAT: Fourcc = Fourcc::Nv12;

/// Formats that get a linear modifier when the driver reports no modifiers for a plane.
pub(super) const LINEAR_FALLBACK_FORMATS: [Fourcc; 2] = [GUI_ALPHA_FORMAT, GUI_FORMAT];

/// Whether bit `index` is set in a possible-CRTC bitmask.
pub fn crtc_mask_contains(mask: u32, index: usize) -> bool {
    index < u32::BITS as usize && mask & (1 << index) != 0
}

// =============================================================================
// Object Wrappers
// =============================================================================

/// A physical output.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: ObjectId,
    /// Name in the `<interface>-<index>` form, e.g. `HDMI-A-1`.
    pub name: String,
    pub state: connector::State,
    /// Encoder currently associated with the connector, if any.
    pub encoder: Option<ObjectId>,
    pub modes: Vec<Mode>,
}

impl Connector {
    pub fn is_connected(&self) -> bool {
        self.state == connector::State::Connected
    }

    /// Whether the connector can drive a display right now.
    pub fn is_usable(&self) -> bool {
        self.encoder.is_some() && self.is_connected()
    }

    pub fn mode(&self, index: usize) -> Option<&Mode> {
        self.modes.get(index)
    }
}

/// A signal path from a CRTC to a connector.
#[derive(Debug, Clone)]
pub struct Encoder {
    pub id: ObjectId,
    /// CRTC the encoder is currently bound to.
    pub crtc: Option<ObjectId>,
    /// Bit `i` is set if the encoder can be driven by the CRTC at index `i`.
    pub possible_crtcs: u32,
}

impl Encoder {
    pub fn can_use_crtc(&self, index: usize) -> bool {
        crtc_mask_contains(self.possible_crtcs, index)
    }
}

/// A scanout engine, with the state it had when it was enumerated.
#[derive(Debug, Clone)]
pub struct Crtc {
    pub id: ObjectId,
    pub mode: Option<Mode>,
    pub framebuffer: Option<ObjectId>,
    pub position: (u32, u32),
}

/// A compositable surface.
#[derive(Debug, Clone)]
pub struct Plane {
    pub id: ObjectId,
    /// Bit `i` is set if the plane can be attached to the CRTC at index `i`.
    pub possible_crtcs: u32,
    pub formats: Vec<Fourcc>,
    pub modifiers: HashMap<Fourcc, Vec<Modifier>>,
    /// Format buffers scanned out on this plane are registered with.
    pub format: Fourcc,
}

impl Plane {
    pub fn new(id: ObjectId, possible_crtcs: u32, formats: Vec<Fourcc>) -> Self {
        Self {
            id,
            possible_crtcs,
            formats,
            modifiers: HashMap::new(),
            format: GUI_FORMAT,
        }
    }

    pub fn can_use_crtc(&self, index: usize) -> bool {
        crtc_mask_contains(self.possible_crtcs, index)
    }

    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }

    pub fn modifiers_for_format(&self, format: Fourcc) -> &[Modifier] {
        self.modifiers.get(&format).map_or(&[], |m| m.as_slice())
    }

    /// Gives every baseline format the plane supports a linear modifier.
    ///
    /// Does nothing if the driver reported modifiers for the plane.
    pub(super) fn add_linear_fallback(&mut self) {
        if !self.modifiers.is_empty() {
            return;
        }

        for format in LINEAR_FALLBACK_FORMATS {
            if self.supports_format(format) {
                self.modifiers
                    .entry(format)
                    .or_default()
                    .push(Modifier::Linear);
            }
        }
    }
}

// =============================================================================
// Arena and Selection
// =============================================================================

/// All driver objects of a device, in enumeration order.
#[derive(Debug, Default, Clone)]
pub struct Resources {
    pub connectors: Vec<Connector>,
    pub encoders: Vec<Encoder>,
    pub crtcs: Vec<Crtc>,
    pub planes: Vec<Plane>,
}

/// Indices into `Resources` of the objects driving the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub connector: usize,
    pub encoder: usize,
    /// CRTC the session scans out on.
    pub crtc: usize,
    /// CRTC the encoder was bound to before the session started.
    pub original_crtc: usize,
    pub gui_plane: usize,
    pub video_plane: Option<usize>,
}

/// Outcome of plane assignment: a CRTC with its planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneAssignment {
    pub crtc: usize,
    pub gui_plane: usize,
    pub video_plane: Option<usize>,
}

/// How the mode scans out, as reported to the GUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanType {
    Progressive,
    Interlaced,
    StereoTopAndBottom,
    StereoSideBySide,
}

/// A normalized display mode.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Resolution {
    /// Index of the mode in the connector's mode list.
    pub id: Option<usize>,
    pub screen_width: u32,
    pub screen_height: u32,
    /// GUI width, possibly capped below the screen width.
    pub width: u32,
    /// GUI height, possibly capped below the screen height.
    pub height: u32,
    pub refresh_rate: f32,
    /// Vertical offset of the subtitle safe area.
    pub subtitles: u32,
    pub pixel_ratio: f32,
    pub fullscreen: bool,
    pub scan: ScanType,
    pub name: String,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if (self.width, self.height) != (self.screen_width, self.screen_height) {
            write!(f, " (GUI {}x{})", self.width, self.height)?;
        }
        Ok(())
    }
}
