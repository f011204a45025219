//! Access to the display device.
//!
//! This module contains:
//! - `KmsDevice` - the driver requests the session makes
//! - `Card` - `KmsDevice` over an open DRM primary node
//! - `open_display` - picks and opens the device to drive

use std::array;
use std::collections::HashSet;
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use scanout_config::Display;
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::backend::drm::{DrmNode, NodeType};
use smithay::backend::udev;
use smithay::reexports::drm::buffer::{self, PlanarBuffer};
use smithay::reexports::drm::control::{
    self, connector, plane, CrtcListFilter, Device as ControlDevice, FbCmd2Flags,
    RawResourceHandle,
};
use smithay::reexports::drm::{ClientCapability, Device as _};
use smithay::reexports::rustix::fs::{self, OFlags};
use smithay::reexports::udev::{Device as UdevDevice, DeviceType};
use tracing::{debug, info, warn};

use super::error::KmsError;
use super::framebuffer::FramebufferDescriptor;
use super::helpers::parse_in_formats;
use super::types::{Connector, Crtc, Encoder, ObjectId, Plane};

/// Driver identification, for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub description: String,
}

/// Object ids from the device's resource listing, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIds {
    pub connectors: Vec<ObjectId>,
    pub encoders: Vec<ObjectId>,
    pub crtcs: Vec<ObjectId>,
}

/// Requests the session issues to the display driver.
///
/// Possible-CRTC masks returned by `query_encoder` and `query_plane` are indexed by the order of
/// `ResourceIds::crtcs`.
pub trait KmsDevice {
    fn driver_info(&self) -> io::Result<DriverInfo>;
    fn enable_capability(&self, capability: ClientCapability, enable: bool) -> io::Result<()>;

    fn list_resources(&self) -> io::Result<ResourceIds>;
    fn list_planes(&self) -> io::Result<Vec<ObjectId>>;
    /// Queries a connector, probing it for its current state and modes.
    fn query_connector(&self, id: ObjectId) -> io::Result<Connector>;
    fn query_encoder(&self, id: ObjectId) -> io::Result<Encoder>;
    fn query_crtc(&self, id: ObjectId) -> io::Result<Crtc>;
    fn query_plane(&self, id: ObjectId) -> io::Result<Plane>;

    fn become_master(&self) -> io::Result<()>;
    fn drop_master(&self) -> io::Result<()>;
    /// Obtains a magic token and has the device authorize it.
    fn authorize_magic(&self) -> io::Result<()>;

    fn register_framebuffer(&self, descriptor: &FramebufferDescriptor) -> io::Result<ObjectId>;
    fn remove_framebuffer(&self, id: ObjectId) -> io::Result<()>;
    /// Programs `crtc`'s mode, framebuffer and origin onto `connector`.
    fn apply_crtc(&self, crtc: &Crtc, connector: ObjectId) -> io::Result<()>;
}

/// Whether the device has a connected connector with an encoder.
pub fn has_usable_connector(device: &impl KmsDevice) -> bool {
    let ids = match device.list_resources() {
        Ok(ids) => ids,
        Err(err) => {
            warn!("error getting resources: {err:?}");
            return false;
        }
    };

    ids.connectors.iter().any(|&id| match device.query_connector(id) {
        Ok(connector) => connector.is_usable(),
        Err(err) => {
            debug!("error querying connector {id}: {err:?}");
            false
        }
    })
}

// =============================================================================
// Card
// =============================================================================

/// An open DRM primary node.
#[derive(Debug)]
pub struct Card {
    fd: OwnedFd,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl smithay::reexports::drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Opens the node at `path` read-write.
    pub fn open(path: &Path) -> io::Result<Self> {
        open_node(path).map(Self::new)
    }

    /// Converts a driver filter into a mask indexed by CRTC enumeration order.
    fn crtc_mask(&self, filter: CrtcListFilter) -> io::Result<u32> {
        let res = self.resource_handles()?;
        let allowed = res.filter_crtcs(filter);

        let mask = res
            .crtcs()
            .iter()
            .take(u32::BITS as usize)
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(crtc))
            .fold(0, |mask, (index, _)| mask | 1 << index);
        Ok(mask)
    }

    fn in_formats_blob(&self, plane: plane::Handle) -> io::Result<Option<Vec<u8>>> {
        let props = self.get_properties(plane)?;

        let blob = props.into_iter().find_map(|(handle, value)| {
            let info = self.get_property(handle).ok()?;
            if info.name().to_str() != Ok("IN_FORMATS") {
                return None;
            }
            info.value_type().convert_value(value).as_blob()
        });

        match blob {
            Some(blob) => self.get_property_blob(blob).map(Some),
            None => Ok(None),
        }
    }
}

fn handle<H: From<RawResourceHandle>>(id: ObjectId) -> io::Result<H> {
    control::from_u32(id).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
}

pub(super) fn format_connector_name(info: &connector::Info) -> String {
    format!("{}-{}", info.interface().as_str(), info.interface_id())
}

impl KmsDevice for Card {
    fn driver_info(&self) -> io::Result<DriverInfo> {
        let driver = self.get_driver()?;
        Ok(DriverInfo {
            name: driver.name().to_string_lossy().into_owned(),
            description: driver.description().to_string_lossy().into_owned(),
        })
    }

    fn enable_capability(&self, capability: ClientCapability, enable: bool) -> io::Result<()> {
        self.set_client_capability(capability, enable)
    }

    fn list_resources(&self) -> io::Result<ResourceIds> {
        let res = self.resource_handles()?;
        Ok(ResourceIds {
            connectors: res.connectors().iter().map(|&h| u32::from(h)).collect(),
            encoders: res.encoders().iter().map(|&h| u32::from(h)).collect(),
            crtcs: res.crtcs().iter().map(|&h| u32::from(h)).collect(),
        })
    }

    fn list_planes(&self) -> io::Result<Vec<ObjectId>> {
        let planes = self.plane_handles()?;
        Ok(planes.into_iter().map(u32::from).collect())
    }

    fn query_connector(&self, id: ObjectId) -> io::Result<Connector> {
        let info = self.get_connector(handle(id)?, true)?;
        Ok(Connector {
            id,
            name: format_connector_name(&info),
            state: info.state(),
            encoder: info.current_encoder().map(u32::from),
            modes: info.modes().to_vec(),
        })
    }

    fn query_encoder(&self, id: ObjectId) -> io::Result<Encoder> {
        let info = self.get_encoder(handle(id)?)?;
        Ok(Encoder {
            id,
            crtc: info.crtc().map(u32::from),
            possible_crtcs: self.crtc_mask(info.possible_crtcs())?,
        })
    }

    fn query_crtc(&self, id: ObjectId) -> io::Result<Crtc> {
        let info = self.get_crtc(handle(id)?)?;
        Ok(Crtc {
            id,
            mode: info.mode(),
            framebuffer: info.framebuffer().map(u32::from),
            position: info.position(),
        })
    }

    fn query_plane(&self, id: ObjectId) -> io::Result<Plane> {
        let _span = tracy_client::span!("Card::query_plane");

        let plane_handle: plane::Handle = handle(id)?;
        let info = self.get_plane(plane_handle)?;
        let formats = info
            .formats()
            .iter()
            .filter_map(|&code| Fourcc::try_from(code).ok())
            .collect();
        let mut plane = Plane::new(id, self.crtc_mask(info.possible_crtcs())?, formats);

        let blob = match self.in_formats_blob(plane_handle) {
            Ok(blob) => blob,
            Err(err) => {
                debug!("error getting IN_FORMATS for plane {id}: {err:?}");
                None
            }
        };

        for (code, modifiers) in blob.as_deref().and_then(parse_in_formats).unwrap_or_default() {
            let Ok(format) = Fourcc::try_from(code) else {
                continue;
            };
            if !modifiers.is_empty() {
                let modifiers = modifiers.into_iter().map(Modifier::from).collect();
                plane.modifiers.insert(format, modifiers);
            }
        }

        Ok(plane)
    }

    fn become_master(&self) -> io::Result<()> {
        self.acquire_master_lock()
    }

    fn drop_master(&self) -> io::Result<()> {
        self.release_master_lock()
    }

    fn authorize_magic(&self) -> io::Result<()> {
        let token = self.generate_auth_token()?;
        self.authenticate_auth_token(token)
    }

    fn register_framebuffer(&self, descriptor: &FramebufferDescriptor) -> io::Result<ObjectId> {
        let flags = if descriptor.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        self.add_planar_framebuffer(descriptor, flags)
            .map(u32::from)
    }

    fn remove_framebuffer(&self, id: ObjectId) -> io::Result<()> {
        self.destroy_framebuffer(handle(id)?)
    }

    fn apply_crtc(&self, crtc: &Crtc, connector: ObjectId) -> io::Result<()> {
        let framebuffer = crtc.framebuffer.map(handle).transpose()?;
        self.set_crtc(
            handle(crtc.id)?,
            framebuffer,
            crtc.position,
            &[handle(connector)?],
            crtc.mode,
        )
    }
}

impl PlanarBuffer for FramebufferDescriptor {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<Modifier> {
        self.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        array::from_fn(|i| self.planes.get(i).map_or(0, |p| p.stride))
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        array::from_fn(|i| {
            self.planes
                .get(i)
                .and_then(|p| NonZeroU32::new(p.handle))
                .map(buffer::Handle::from)
        })
    }

    fn offsets(&self) -> [u32; 4] {
        array::from_fn(|i| self.planes.get(i).map_or(0, |p| p.offset))
    }
}

// =============================================================================
// Device Discovery
// =============================================================================

/// A GPU found on the seat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    /// Primary node.
    pub path: PathBuf,
    pub render: Option<PathBuf>,
    /// Device number and bus address, for logs.
    pub location: Option<String>,
}

impl Candidate {
    fn is_ignored(&self, ignored: &HashSet<PathBuf>) -> bool {
        ignored.contains(&self.path)
            || self.render.as_ref().is_some_and(|render| ignored.contains(render))
    }
}

/// The device chosen to drive the display.
#[derive(Debug)]
pub struct DisplayDevice<D = Card> {
    pub card: D,
    pub path: PathBuf,
    /// Render node of the same GPU, if it could be opened.
    pub render: Option<OwnedFd>,
}

fn open_node(path: &Path) -> io::Result<OwnedFd> {
    let fd = fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, fs::Mode::empty())?;
    Ok(fd)
}

fn open_render_node(path: &Path) -> Option<OwnedFd> {
    match open_node(path) {
        Ok(fd) => {
            debug!("opened render node {path:?}");
            Some(fd)
        }
        Err(err) => {
            warn!("error opening render node {path:?}: {err:?}");
            None
        }
    }
}

fn log_device_info(card: &impl KmsDevice, candidate: &Candidate) {
    let path = &candidate.path;
    let location = candidate.location.as_deref().unwrap_or("unknown location");
    match card.driver_info() {
        Ok(driver) => debug!(
            "opened {path:?} ({location}): driver {}, {}",
            driver.name, driver.description
        ),
        Err(err) => debug!("opened {path:?} ({location}); error getting driver info: {err:?}"),
    }
}

/// Walks `candidates` in order and returns the first one that opens and qualifies.
///
/// Candidates whose primary or render node is in `ignored` are skipped. With
/// `require_connector`, a device without a usable connector is closed and the walk continues.
pub fn select_device<D: KmsDevice>(
    candidates: impl IntoIterator<Item = Candidate>,
    ignored: &HashSet<PathBuf>,
    require_connector: bool,
    open: impl Fn(&Path) -> io::Result<D>,
) -> Result<DisplayDevice<D>, KmsError> {
    for candidate in candidates {
        if candidate.is_ignored(ignored) {
            debug!("skipping ignored device {:?}", candidate.path);
            continue;
        }

        let card = match open(&candidate.path) {
            Ok(card) => card,
            Err(err) => {
                warn!("error opening {:?}: {err:?}", candidate.path);
                continue;
            }
        };

        if require_connector && !has_usable_connector(&card) {
            debug!("skipping {:?}: no connected display", candidate.path);
            continue;
        }

        log_device_info(&card, &candidate);
        let render = match &candidate.render {
            Some(path) => open_render_node(path),
            None => {
                debug!("device has no render node");
                None
            }
        };
        info!("using display device {:?}", candidate.path);

        return Ok(DisplayDevice {
            card,
            path: candidate.path,
            render,
        });
    }

    warn!("no usable display device found");
    Err(KmsError::DeviceUnavailable)
}

// =============================================================================
// Udev
// =============================================================================

/// Node paths to skip, including the sibling primary and render nodes of each configured path.
fn ignored_nodes(paths: &[PathBuf]) -> HashSet<PathBuf> {
    let mut ignored = HashSet::new();

    for path in paths {
        ignored.insert(path.clone());

        let node = match DrmNode::from_path(path) {
            Ok(node) => node,
            Err(err) => {
                warn!("error opening ignored DRM device {path:?}: {err:?}");
                continue;
            }
        };

        for ty in [NodeType::Primary, NodeType::Render] {
            if let Some(Ok(sibling)) = node.node_with_type(ty) {
                ignored.extend(sibling.dev_path());
            }
        }
        ignored.extend(node.dev_path());
    }

    ignored
}

/// Device number and parent bus of a node, e.g. `226:0 on pci 0000:03:00.0`.
fn node_location(node: &DrmNode) -> String {
    let dev_id = node.dev_id();
    let number = format!("{}:{}", fs::major(dev_id), fs::minor(dev_id));

    let parent = UdevDevice::from_devnum(DeviceType::Character, dev_id)
        .ok()
        .and_then(|device| device.parent());
    let Some(parent) = parent else {
        return number;
    };

    let bus = parent
        .subsystem()
        .map_or_else(|| String::from("unknown bus"), |s| s.to_string_lossy().into_owned());
    format!("{number} on {bus} {}", parent.sysname().to_string_lossy())
}

fn candidate(gpu: PathBuf) -> Option<Candidate> {
    let node = match DrmNode::from_path(&gpu) {
        Ok(node) => node,
        Err(err) => {
            debug!("skipping {gpu:?}: {err:?}");
            return None;
        }
    };

    let node = match node.node_with_type(NodeType::Primary) {
        Some(Ok(primary)) => primary,
        _ => node,
    };
    let render = match node.node_with_type(NodeType::Render) {
        Some(Ok(render)) => render.dev_path(),
        Some(Err(err)) => {
            warn!("error getting the render node of {gpu:?}: {err:?}");
            None
        }
        None => None,
    };

    Some(Candidate {
        path: node.dev_path().unwrap_or(gpu),
        render,
        location: Some(node_location(&node)),
    })
}

/// Opens the first display device on the configured seat.
///
/// With `require-connector`, devices without a connected display are skipped.
pub fn open_display(config: &Display) -> Result<DisplayDevice, KmsError> {
    let _span = tracy_client::span!("open_display");

    let ignored = ignored_nodes(&config.ignored_drm_devices);
    let gpus = udev::all_gpus(&config.seat).map_err(|err| {
        warn!("error enumerating GPUs on {}: {err:?}", config.seat);
        KmsError::DeviceUnavailable
    })?;

    let candidates = gpus.into_iter().filter_map(candidate);
    select_device(candidates, &ignored, config.require_connector, Card::open)
}
