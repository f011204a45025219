//! Display resource discovery and scanout allocation over KMS.
//!
//! [`kms::open_display`] picks a device, [`kms::KmsSession`] selects the connector, CRTC and planes
//! that drive it and binds buffers to framebuffers.

pub mod kms;
