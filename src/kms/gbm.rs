//! `ScanoutBuffer` for GBM buffer objects.
//!
//! The framebuffer lives in the buffer object's user data, so it is released together with the
//! buffer object.

use smithay::backend::allocator::Modifier;
use smithay::reexports::drm::buffer::PlanarBuffer;
use smithay::reexports::gbm::BufferObject;

use super::framebuffer::{BufferPlane, Framebuffer, ScanoutBuffer};

impl ScanoutBuffer for BufferObject<Framebuffer> {
    fn dimensions(&self) -> (u32, u32) {
        PlanarBuffer::size(self)
    }

    fn planes(&self) -> Vec<BufferPlane> {
        let handles = PlanarBuffer::handles(self);
        let pitches = PlanarBuffer::pitches(self);
        let offsets = PlanarBuffer::offsets(self);

        handles
            .into_iter()
            .zip(pitches)
            .zip(offsets)
            .map_while(|((handle, stride), offset)| {
                Some(BufferPlane {
                    handle: u32::from(handle?),
                    stride,
                    offset,
                })
            })
            .collect()
    }

    fn layout_modifier(&self) -> Modifier {
        PlanarBuffer::modifier(self).unwrap_or(Modifier::Invalid)
    }

    fn framebuffer(&self) -> Option<&Framebuffer> {
        self.userdata()
    }

    fn attach_framebuffer(&mut self, framebuffer: Framebuffer) -> Option<Framebuffer> {
        self.set_userdata(framebuffer)
    }

    fn detach_framebuffer(&mut self) -> Option<Framebuffer> {
        self.take_userdata()
    }
}
