//! Selection of the connector, encoder, CRTC and planes that drive the display.
//!
//! Everything here is a pure function over the enumerated `Resources`.

use tracing::debug;

use super::error::KmsError;
use super::types::{
    Connector, Crtc, Encoder, Plane, PlaneAssignment, Resources, Topology, GUI_ALPHA_FORMAT,
    GUI_FORMAT, VIDEO_FORMAT,
};

/// Finds the first connector with an encoder that is connected.
pub fn find_connector(connectors: &[Connector]) -> Result<usize, KmsError> {
    connectors
        .iter()
        .position(Connector::is_usable)
        .ok_or(KmsError::NoSuitableConnector)
}

/// Finds the encoder the connector is associated with.
pub fn find_encoder(encoders: &[Encoder], connector: &Connector) -> Result<usize, KmsError> {
    let id = connector.encoder.ok_or(KmsError::NoSuitableEncoder)?;
    encoders
        .iter()
        .position(|encoder| encoder.id == id)
        .ok_or(KmsError::NoSuitableEncoder)
}

/// Finds the CRTC the encoder is currently bound to, among the ones it can use.
///
/// This is the CRTC whose state gets restored when the session ends.
pub fn find_crtc(crtcs: &[Crtc], encoder: &Encoder) -> Result<usize, KmsError> {
    let bound = encoder.crtc.ok_or(KmsError::NoSuitableCrtc)?;
    crtcs
        .iter()
        .enumerate()
        .position(|(index, crtc)| encoder.can_use_crtc(index) && crtc.id == bound)
        .ok_or(KmsError::NoSuitableCrtc)
}

fn find_plane(
    planes: &[Plane],
    crtc_index: usize,
    mut pred: impl FnMut(usize, &Plane) -> bool,
) -> Option<usize> {
    planes
        .iter()
        .enumerate()
        .position(|(index, plane)| plane.can_use_crtc(crtc_index) && pred(index, plane))
}

/// Picks a CRTC together with a GUI plane and, if possible, a video plane.
///
/// A CRTC that has both a video plane and a GUI plane able to blend over it wins outright. Failing
/// that, the first CRTC with only a GUI plane is used, provided the encoder is currently bound to
/// it.
pub fn find_planes(
    crtcs: &[Crtc],
    planes: &[Plane],
    encoder: &Encoder,
) -> Result<PlaneAssignment, KmsError> {
    let mut assignment = None;

    for (index, crtc) in crtcs.iter().enumerate() {
        let video_plane = find_plane(planes, index, |_, plane| {
            plane.supports_format(VIDEO_FORMAT)
        });

        let gui_plane = find_plane(planes, index, |plane_index, plane| {
            Some(plane_index) != video_plane
                && (video_plane.is_none() || plane.supports_format(GUI_ALPHA_FORMAT))
                && plane.supports_format(GUI_FORMAT)
        });

        match (gui_plane, video_plane) {
            (Some(gui_plane), Some(video_plane)) => {
                assignment = Some(PlaneAssignment {
                    crtc: index,
                    gui_plane,
                    video_plane: Some(video_plane),
                });
                break;
            }
            (Some(gui_plane), None) => {
                if assignment.is_none() && encoder.crtc == Some(crtc.id) {
                    assignment = Some(PlaneAssignment {
                        crtc: index,
                        gui_plane,
                        video_plane: None,
                    });
                }
            }
            _ => (),
        }
    }

    let assignment = assignment.ok_or(KmsError::NoSuitablePlane)?;

    if let Some(video_plane) = assignment.video_plane {
        debug!("using video plane {}", planes[video_plane].id);
    }
    debug!(
        "using gui plane {} on crtc {}",
        planes[assignment.gui_plane].id, crtcs[assignment.crtc].id
    );

    Ok(assignment)
}

/// Resolves the full topology: connector, encoder, original CRTC, then planes.
pub fn resolve(resources: &Resources) -> Result<Topology, KmsError> {
    let _span = tracy_client::span!("topology::resolve");

    let connector = find_connector(&resources.connectors)?;
    let encoder = find_encoder(&resources.encoders, &resources.connectors[connector])?;
    let original_crtc = find_crtc(&resources.crtcs, &resources.encoders[encoder])?;
    let planes = find_planes(
        &resources.crtcs,
        &resources.planes,
        &resources.encoders[encoder],
    )?;

    debug!(
        "using connector {} with encoder {}",
        resources.connectors[connector].name, resources.encoders[encoder].id
    );

    Ok(Topology {
        connector,
        encoder,
        crtc: planes.crtc,
        original_crtc,
        gui_plane: planes.gui_plane,
        video_plane: planes.video_plane,
    })
}
