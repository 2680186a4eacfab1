use ash::vk;
use glam::Vec4;

mod idalloc;

pub use idalloc::IdAlloc;

pub trait AsVkHandle {
    type Handle: ash::vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// Converts a normalized `(x, y, width, height)` rectangle into pixels of a
/// `width × height` target.
pub fn normalized_to_rect(area: Vec4, width: u32, height: u32) -> vk::Rect2D {
    let size = glam::Vec2::new(width as f32, height as f32);
    let offset = area.truncate().truncate() * size;
    let extent = glam::Vec2::new(area.z, area.w) * size;
    vk::Rect2D {
        offset: vk::Offset2D {
            x: offset.x as i32,
            y: offset.y as i32,
        },
        extent: vk::Extent2D {
            width: extent.x as u32,
            height: extent.y as u32,
        },
    }
}

pub fn full_rect(width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    }
}

pub fn same_rect(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x
        && a.offset.y == b.offset.y
        && a.extent.width == b.extent.width
        && a.extent.height == b.extent.height
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_to_rect() {
        let rect = normalized_to_rect(Vec4::new(0.5, 0.25, 0.5, 0.5), 200, 100);
        assert_eq!(rect.offset.x, 100);
        assert_eq!(rect.offset.y, 25);
        assert_eq!(rect.extent.width, 100);
        assert_eq!(rect.extent.height, 50);
        assert!(same_rect(
            &normalized_to_rect(Vec4::new(0.0, 0.0, 1.0, 1.0), 64, 32),
            &full_rect(64, 32)
        ));
    }
}
