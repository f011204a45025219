//! Binding of graphics buffers to driver framebuffers.
//!
//! A registered framebuffer is stored on the buffer it was created for and removed from the driver
//! when the buffer lets go of it.

use std::fmt;
use std::rc::Rc;

use smithay::backend::allocator::{Fourcc, Modifier};
use tracing::{debug, trace, warn};

use super::device::KmsDevice;
use super::error::KmsError;
use super::helpers::fourcc_string;
use super::types::ObjectId;

/// Maximum number of memory planes a framebuffer can have.
pub const MAX_PLANES: usize = 4;

/// Memory layout of one plane of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlane {
    /// Driver-local handle of the memory object.
    pub handle: u32,
    pub stride: u32,
    pub offset: u32,
}

/// Everything the driver needs to create a framebuffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub size: (u32, u32),
    pub format: Fourcc,
    /// Between one and [`MAX_PLANES`] planes.
    pub planes: Vec<BufferPlane>,
    /// Explicit layout modifier applied to every plane, or `None` for legacy registration.
    pub modifier: Option<Modifier>,
}

/// A graphics buffer that can be scanned out.
///
/// Buffers hold at most one [`Framebuffer`]; dropping it removes the framebuffer from the driver.
pub trait ScanoutBuffer {
    fn dimensions(&self) -> (u32, u32);
    /// Memory planes of the buffer, in order.
    fn planes(&self) -> Vec<BufferPlane>;
    fn layout_modifier(&self) -> Modifier;

    fn framebuffer(&self) -> Option<&Framebuffer>;
    /// Stores `framebuffer` on the buffer, returning the previous one.
    fn attach_framebuffer(&mut self, framebuffer: Framebuffer) -> Option<Framebuffer>;
    fn detach_framebuffer(&mut self) -> Option<Framebuffer>;
}

/// A framebuffer registered with the driver.
///
/// The release hook runs exactly once, when the value is dropped.
pub struct Framebuffer {
    id: ObjectId,
    format: Fourcc,
    on_release: Option<Box<dyn FnOnce(ObjectId)>>,
}

impl Framebuffer {
    pub fn new(id: ObjectId, format: Fourcc, on_release: impl FnOnce(ObjectId) + 'static) -> Self {
        Self {
            id,
            format,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release(self.id);
        }
    }
}

/// The modifier to register a buffer with, if it has an explicit one.
///
/// A linear modifier is indistinguishable from "no modifier" in the legacy interface, and an
/// invalid one means the layout is implicit.
pub fn explicit_modifier(modifier: Modifier) -> Option<Modifier> {
    match modifier {
        Modifier::Linear | Modifier::Invalid => None,
        modifier => Some(modifier),
    }
}

impl FramebufferDescriptor {
    pub fn for_buffer<B: ScanoutBuffer + ?Sized>(buffer: &B, format: Fourcc) -> Self {
        let mut planes = buffer.planes();
        planes.truncate(MAX_PLANES);

        Self {
            size: buffer.dimensions(),
            format,
            planes,
            modifier: explicit_modifier(buffer.layout_modifier()),
        }
    }

    fn without_modifier(&self) -> Self {
        Self {
            modifier: None,
            ..self.clone()
        }
    }
}

fn register(
    device: &impl KmsDevice,
    descriptor: &FramebufferDescriptor,
) -> Result<ObjectId, KmsError> {
    let mut attempts = Vec::with_capacity(2);
    if let Some(modifier) = descriptor.modifier {
        debug!("using modifier: {:#x}", u64::from(modifier));
        attempts.push(descriptor.clone());
    }
    attempts.push(descriptor.without_modifier());

    let mut last_err = None;
    for attempt in &attempts {
        match device.register_framebuffer(attempt) {
            Ok(id) => return Ok(id),
            Err(err) => {
                debug!(
                    "error adding framebuffer (modifier: {:?}): {err:?}",
                    attempt.modifier
                );
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| std::io::Error::other("no registration attempted"));
    warn!("error adding framebuffer: {err:?}");
    Err(KmsError::FramebufferRegistrationFailed(err))
}

/// Returns the framebuffer for `buffer`, registering one in `format` if needed.
///
/// A framebuffer already stored on the buffer is reused if its format matches, and removed
/// otherwise.
pub fn framebuffer_for_buffer<D, B>(
    device: &Rc<D>,
    buffer: &mut B,
    format: Fourcc,
) -> Result<ObjectId, KmsError>
where
    D: KmsDevice + 'static,
    B: ScanoutBuffer + ?Sized,
{
    let _span = tracy_client::span!("framebuffer_for_buffer");

    if let Some(framebuffer) = buffer.framebuffer() {
        if framebuffer.format() == format {
            return Ok(framebuffer.id());
        }

        debug!(
            "removing framebuffer {} with stale format {}",
            framebuffer.id(),
            fourcc_string(framebuffer.format() as u32)
        );
        drop(buffer.detach_framebuffer());
    }

    let descriptor = FramebufferDescriptor::for_buffer(buffer, format);
    let id = register(device.as_ref(), &descriptor)?;
    trace!(
        "added framebuffer {id} ({}x{} {})",
        descriptor.size.0,
        descriptor.size.1,
        fourcc_string(format as u32)
    );

    let device = Rc::clone(device);
    let framebuffer = Framebuffer::new(id, format, move |id| {
        if let Err(err) = device.remove_framebuffer(id) {
            warn!("error removing framebuffer {id}: {err:?}");
        }
    });
    drop(buffer.attach_framebuffer(framebuffer));

    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::kms::tests::fixtures::{standard_resources, FakeDevice, TestBuffer};

    const TILED: u64 = 0x0100_0000_0000_0001;

    fn device() -> Rc<FakeDevice> {
        Rc::new(FakeDevice::new(standard_resources()))
    }

    #[test]
    fn hook_runs_once_on_drop() {
        let calls = Rc::new(Cell::new(0));
        let fb = {
            let calls = calls.clone();
            Framebuffer::new(7, Fourcc::Xrgb8888, move |id| {
                assert_eq!(id, 7);
                calls.set(calls.get() + 1);
            })
        };
        assert_eq!(calls.get(), 0);
        drop(fb);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn linear_and_invalid_are_not_explicit() {
        assert_eq!(explicit_modifier(Modifier::Linear), None);
        assert_eq!(explicit_modifier(Modifier::Invalid), None);
        assert_eq!(
            explicit_modifier(Modifier::from(TILED)),
            Some(Modifier::from(TILED))
        );
    }

    #[test]
    fn second_call_reuses_framebuffer() {
        let device = device();
        let mut buffer = TestBuffer::new(Modifier::from(TILED));

        let first = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();
        let second = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();

        assert_eq!(first, second);
        assert_eq!(device.registered.borrow().len(), 1);
        assert!(device.removed.borrow().is_empty());
    }

    #[test]
    fn stale_format_is_replaced() {
        let device = device();
        let mut buffer = TestBuffer::new(Modifier::Linear);

        let old = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();
        let new = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Xrgb8888).unwrap();

        assert_ne!(old, new);
        assert_eq!(*device.removed.borrow(), [old]);
        assert_eq!(buffer.framebuffer().unwrap().format(), Fourcc::Xrgb8888);
    }

    #[test]
    fn explicit_modifier_is_tried_first() {
        let device = device();
        let mut buffer = TestBuffer::new(Modifier::from(TILED));

        framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();

        let registered = device.registered.borrow();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].modifier, Some(Modifier::from(TILED)));
        assert_eq!(registered[0].planes, buffer.planes);
        assert_eq!(registered[0].size, (1920, 1080));
    }

    #[test]
    fn implicit_modifier_registers_once_without_modifier() {
        let device = device();
        device.fail_legacy_registration.set(true);
        let mut buffer = TestBuffer::new(Modifier::Invalid);

        assert!(matches!(
            framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888),
            Err(KmsError::FramebufferRegistrationFailed(_))
        ));
        assert_eq!(device.attempts.get(), 1);
    }

    #[test]
    fn falls_back_to_legacy_registration() {
        let device = device();
        device.fail_modifier_registration.set(true);
        let mut buffer = TestBuffer::new(Modifier::from(TILED));

        let id = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();

        assert_eq!(device.attempts.get(), 2);
        let registered = device.registered.borrow();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].modifier, None);
        assert_eq!(buffer.framebuffer().unwrap().id(), id);
    }

    #[test]
    fn both_registrations_failing_leaves_buffer_untouched() {
        let device = device();
        device.fail_modifier_registration.set(true);
        device.fail_legacy_registration.set(true);
        let mut buffer = TestBuffer::new(Modifier::from(TILED));

        assert!(matches!(
            framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888),
            Err(KmsError::FramebufferRegistrationFailed(_))
        ));
        assert!(buffer.framebuffer().is_none());
        assert!(device.removed.borrow().is_empty());
    }

    #[test]
    fn releasing_buffer_removes_framebuffer_once() {
        let device = device();
        let mut buffer = TestBuffer::new(Modifier::Linear);

        let id = framebuffer_for_buffer(&device, &mut buffer, Fourcc::Argb8888).unwrap();
        assert!(device.removed.borrow().is_empty());

        drop(buffer);
        assert_eq!(*device.removed.borrow(), [id]);
    }

    #[test]
    fn planes_beyond_four_are_dropped() {
        let mut buffer = TestBuffer::new(Modifier::Linear);
        buffer.planes = (1..=6)
            .map(|handle| BufferPlane {
                handle,
                stride: 7680,
                offset: 0,
            })
            .collect();

        let descriptor = FramebufferDescriptor::for_buffer(&buffer, Fourcc::Nv12);
        assert_eq!(descriptor.planes.len(), MAX_PLANES);
    }
}
