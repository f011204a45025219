use std::io;

use smithay::backend::allocator::Fourcc;

/// Errors of display discovery, allocation and framebuffer binding.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("no usable display device found")]
    DeviceUnavailable,
    #[error("required client capability {capability} was rejected")]
    CapabilityUnsupported {
        capability: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("error querying {what}")]
    Query {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("no connected connector with an encoder")]
    NoSuitableConnector,
    #[error("no encoder matches the connector")]
    NoSuitableEncoder,
    #[error("no crtc matches the encoder")]
    NoSuitableCrtc,
    #[error("no plane can scan out the gui")]
    NoSuitablePlane,
    #[error("connector has no usable modes")]
    ModeListEmpty,
    #[error("connector has no mode {0}")]
    ModeUnavailable(usize),
    #[error("connector {0} is no longer connected")]
    ConnectorDisconnected(String),
    #[error("gui plane does not support format {0:?}")]
    UnsupportedFormat(Fourcc),
    #[error("error adding framebuffer")]
    FramebufferRegistrationFailed(#[source] io::Error),
    #[error("error acquiring drm master or authorizing magic")]
    MasterAcquisitionFailed(#[source] io::Error),
    #[error("error restoring the original crtc mode")]
    RestoreFailed(#[source] io::Error),
}

impl KmsError {
    pub(super) fn query(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Query { what, source }
    }
}
