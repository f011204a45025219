//! KMS display resource discovery and scanout allocation.
//!
//! This module is split into submodules:
//! - `types` - driver object wrappers and selection results
//! - `error` - the error taxonomy
//! - `device` - the driver seam and device discovery
//! - `topology` - connector, encoder, CRTC and plane selection
//! - `helpers` - mode selection and normalization, FourCC and blob helpers
//! - `framebuffer` - buffer to framebuffer binding
//! - `gbm` - `ScanoutBuffer` for GBM buffer objects

mod device;
mod error;
mod framebuffer;
mod gbm;
mod helpers;
mod topology;
mod types;


use std::io;
use std::rc::Rc;

use scanout_config::GuiSizeLimit;
use smithay::backend::allocator::Fourcc;
use smithay::reexports::drm::ClientCapability;
use tracing::{debug, info, warn};

pub use self::device::{
    has_usable_connector, open_display, select_device, Candidate, Card, DisplayDevice, DriverInfo,
    KmsDevice, ResourceIds,
};
pub use self::error::KmsError;
pub use self::framebuffer::{
    explicit_modifier, BufferPlane, Framebuffer, FramebufferDescriptor, ScanoutBuffer, MAX_PLANES,
};
pub use self::helpers::{
    describe_mode, find_preferred_mode, fourcc_string, gui_size, normalize_mode, parse_in_formats,
    refresh_rate, scan_type, subtitle_offset, with_alpha, without_alpha,
};
pub use self::topology::{find_connector, find_crtc, find_encoder, find_planes, resolve};
pub use self::types::{
    crtc_mask_contains, Connector, Crtc, Encoder, ObjectId, Plane, PlaneAssignment, Resolution,
    Resources, ScanType, Topology, GUI_ALPHA_FORMAT, GUI_FORMAT, VIDEO_FORMAT,
};

/// How the session is allowed to modeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Authority {
    /// The session is DRM master.
    Master,
    /// Another client is master and authorized the session's magic token.
    Magic,
}

pub(crate) fn capability_name(capability: ClientCapability) -> &'static str {
    match capability {
        ClientCapability::UniversalPlanes => "universal planes",
        ClientCapability::Stereo3D => "stereo 3D",
        ClientCapability::AspectRatio => "aspect ratio",
        ClientCapability::Atomic => "atomic",
        _ => "other",
    }
}

fn enable_capabilities(device: &impl KmsDevice) -> Result<(), KmsError> {
    for capability in [ClientCapability::UniversalPlanes, ClientCapability::Stereo3D] {
        device
            .enable_capability(capability, true)
            .map_err(|source| KmsError::CapabilityUnsupported {
                capability: capability_name(capability),
                source,
            })?;
    }

    if let Err(err) = device.enable_capability(ClientCapability::AspectRatio, false) {
        warn!("error disabling the aspect ratio capability: {err:?}");
    }

    Ok(())
}

fn query_all<T>(
    ids: &[ObjectId],
    query: impl Fn(ObjectId) -> io::Result<T>,
    what: &'static str,
) -> Result<Vec<T>, KmsError> {
    ids.iter()
        .map(|&id| query(id))
        .collect::<io::Result<Vec<_>>>()
        .map_err(KmsError::query(what))
}

/// Queries every connector, encoder, CRTC and plane of the device.
fn enumerate(device: &impl KmsDevice) -> Result<Resources, KmsError> {
    let _span = tracy_client::span!("kms::enumerate");

    let ids = device
        .list_resources()
        .map_err(KmsError::query("resources"))?;
    let plane_ids = device.list_planes().map_err(KmsError::query("planes"))?;

    let mut planes = query_all(&plane_ids, |id| device.query_plane(id), "plane")?;
    for plane in &mut planes {
        plane.add_linear_fallback();
    }

    let resources = Resources {
        connectors: query_all(&ids.connectors, |id| device.query_connector(id), "connector")?,
        encoders: query_all(&ids.encoders, |id| device.query_encoder(id), "encoder")?,
        crtcs: query_all(&ids.crtcs, |id| device.query_crtc(id), "crtc")?,
        planes,
    };

    debug!(
        "found {} connectors, {} encoders, {} crtcs, {} planes",
        resources.connectors.len(),
        resources.encoders.len(),
        resources.crtcs.len(),
        resources.planes.len()
    );

    Ok(resources)
}

fn acquire_authority(device: &impl KmsDevice) -> Result<Authority, KmsError> {
    let err = match device.become_master() {
        Ok(()) => return Ok(Authority::Master),
        Err(err) => err,
    };

    debug!("error acquiring drm master: {err:?}; trying magic authorization");
    device
        .authorize_magic()
        .map_err(KmsError::MasterAcquisitionFailed)?;

    warn!("not drm master; continuing with an authorized magic token");
    Ok(Authority::Magic)
}

/// An initialized display: the chosen objects, the current mode, and modesetting authority.
///
/// Dropping the session restores the original CRTC state and gives up master.
pub struct KmsSession<D: KmsDevice = Card> {
    device: Rc<D>,
    resources: Resources,
    topology: Topology,
    /// Index of the current mode in the connector's mode list.
    mode: usize,
    gui_size_limit: GuiSizeLimit,
    authority: Authority,
}

impl<D: KmsDevice> KmsSession<D> {
    /// Sets up the device and picks everything needed to drive the display.
    ///
    /// Nothing is left held on failure except the device itself, which is dropped.
    pub fn initialize(device: D, gui_size_limit: GuiSizeLimit) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("KmsSession::initialize");

        enable_capabilities(&device)?;

        let mut resources = enumerate(&device)?;
        let topology = topology::resolve(&resources)?;
        let mode = find_preferred_mode(&resources.connectors[topology.connector].modes)?;

        // The GUI is blended over video, so it needs an alpha channel.
        if topology.video_plane.is_some() {
            let gui_plane = &mut resources.planes[topology.gui_plane];
            gui_plane.format = with_alpha(gui_plane.format).unwrap_or(GUI_ALPHA_FORMAT);
        }

        let authority = acquire_authority(&device)?;

        let session = Self {
            device: Rc::new(device),
            resources,
            topology,
            mode,
            gui_size_limit,
            authority,
        };
        info!(
            "initialized {} on crtc {}: {}",
            session.connector().name,
            session.crtc().id,
            session.current_resolution()
        );

        Ok(session)
    }

    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn connector(&self) -> &Connector {
        &self.resources.connectors[self.topology.connector]
    }

    pub fn encoder(&self) -> &Encoder {
        &self.resources.encoders[self.topology.encoder]
    }

    pub fn crtc(&self) -> &Crtc {
        &self.resources.crtcs[self.topology.crtc]
    }

    /// The CRTC state from before the session started.
    pub fn original_crtc(&self) -> &Crtc {
        &self.resources.crtcs[self.topology.original_crtc]
    }

    pub fn gui_plane(&self) -> &Plane {
        &self.resources.planes[self.topology.gui_plane]
    }

    pub fn video_plane(&self) -> Option<&Plane> {
        self.topology
            .video_plane
            .map(|index| &self.resources.planes[index])
    }

    pub fn gui_format(&self) -> Fourcc {
        self.gui_plane().format
    }

    /// Changes the format GUI buffers are registered with.
    pub fn set_gui_format(&mut self, format: Fourcc) -> Result<(), KmsError> {
        let plane = &mut self.resources.planes[self.topology.gui_plane];
        if !plane.supports_format(format) {
            warn!(
                "gui plane {} does not support {}",
                plane.id,
                fourcc_string(format as u32)
            );
            return Err(KmsError::UnsupportedFormat(format));
        }

        debug!("gui plane {} format: {}", plane.id, fourcc_string(format as u32));
        plane.format = format;
        Ok(())
    }

    pub fn gui_size_limit(&self) -> GuiSizeLimit {
        self.gui_size_limit
    }

    pub fn set_gui_size_limit(&mut self, limit: GuiSizeLimit) {
        self.gui_size_limit = limit;
    }

    fn resolution(&self, index: usize) -> Option<Resolution> {
        let mode = self.connector().mode(index)?;
        Some(Resolution {
            id: Some(index),
            ..normalize_mode(mode, self.gui_size_limit)
        })
    }

    /// Every mode of the connector, normalized, with its index as id.
    pub fn modes(&self) -> Vec<Resolution> {
        (0..self.connector().modes.len())
            .filter_map(|index| self.resolution(index))
            .collect()
    }

    pub fn current_mode(&self) -> usize {
        self.mode
    }

    pub fn current_resolution(&self) -> Resolution {
        let mode = &self.connector().modes[self.mode];
        Resolution {
            id: Some(self.mode),
            ..normalize_mode(mode, self.gui_size_limit)
        }
    }

    /// Switches to mode `id` of the connector, after probing it again.
    pub fn set_mode(&mut self, id: usize) -> Result<Resolution, KmsError> {
        let connector = self
            .device
            .query_connector(self.connector().id)
            .map_err(KmsError::query("connector"))?;

        if !connector.is_connected() {
            warn!("connector {} is disconnected", connector.name);
            return Err(KmsError::ConnectorDisconnected(connector.name));
        }
        let Some(mode) = connector.mode(id) else {
            return Err(KmsError::ModeUnavailable(id));
        };

        debug!("switching {} to {}", connector.name, describe_mode(mode));
        self.resources.connectors[self.topology.connector] = connector;
        self.mode = id;

        Ok(self.current_resolution())
    }

    /// Returns the framebuffer for `buffer` in the GUI plane's format.
    pub fn framebuffer_for_buffer<B>(&self, buffer: &mut B) -> Result<ObjectId, KmsError>
    where
        D: 'static,
        B: ScanoutBuffer + ?Sized,
    {
        framebuffer::framebuffer_for_buffer(&self.device, buffer, self.gui_format())
    }

    /// Puts the original CRTC's mode, framebuffer and origin back on the connector.
    pub fn restore_original_mode(&self) -> Result<(), KmsError> {
        let crtc = self
            .resources
            .crtcs
            .get(self.topology.original_crtc)
            .ok_or(KmsError::NoSuitableCrtc)?;

        self.device
            .apply_crtc(crtc, self.connector().id)
            .map_err(KmsError::RestoreFailed)?;

        debug!("restored the original mode on crtc {}", crtc.id);
        Ok(())
    }
}

impl<D: KmsDevice> Drop for KmsSession<D> {
    fn drop(&mut self) {
        if let Err(err) = self.restore_original_mode() {
            warn!("error restoring the original mode: {err:?}");
        }

        if self.authority == Authority::Master {
            if let Err(err) = self.device.drop_master() {
                warn!("error dropping drm master: {err:?}");
            }
        }
    }
}
