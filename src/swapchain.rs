use std::sync::{Arc, Mutex, MutexGuard};

use ash::{prelude::VkResult, vk};

use crate::{
    driver::Driver,
    framebuffer::{Framebuffer, FramebufferAttachment, FramebufferInfo},
    image::{Image, ImageDesc, ImageUsage},
    resource::{Resource, ResourceUsage},
    sync::Semaphore,
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Copy)]
pub struct SwapChainDesc {
    pub surface: vk::SurfaceKHR,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    pub usage: vk::ImageUsageFlags,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        Self {
            surface: vk::SurfaceKHR::null(),
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            width: 1,
            height: 1,
            image_count: 3,
            present_mode: vk::PresentModeKHR::FIFO,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }
}

/// Result of acquiring a back buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// Acquired, but the swap chain no longer matches the surface exactly.
    Suboptimal(u32),
    /// Nothing was acquired. The swap chain has to be recreated by its owner.
    OutOfDate,
}

struct SwapSurface {
    image: Arc<Image>,
    view: vk::ImageView,
    framebuffer: Arc<Framebuffer>,
    /// Signaled by the presentation engine once the image can be rendered to.
    semaphore: Arc<Semaphore>,
    acquired: bool,
    /// No submission has waited on `semaphore` since the image was acquired.
    needs_wait: bool,
}

struct SwapState {
    surfaces: Vec<SwapSurface>,
    back_buffer: u32,
}

/// A snapshot of the surface currently used as back buffer.
#[derive(Clone)]
pub struct BackBuffer {
    pub index: u32,
    pub image: Arc<Image>,
    pub framebuffer: Arc<Framebuffer>,
    pub semaphore: Arc<Semaphore>,
    pub acquired: bool,
    pub needs_wait: bool,
}

/// A ring of presentable surfaces, each with its own acquire semaphore and a framebuffer
/// that leaves the image ready for presentation.
pub struct SwapChain {
    driver: Arc<dyn Driver>,
    handle: vk::SwapchainKHR,
    width: u32,
    height: u32,
    state: Mutex<SwapState>,
    usage: ResourceUsage,
}

impl SwapChain {
    pub fn new(driver: Arc<dyn Driver>, desc: &SwapChainDesc) -> VkResult<Arc<Self>> {
        tracing::info!(
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            images = desc.image_count,
            "Creating swapchain"
        );
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format)
            .image_color_space(desc.color_space)
            .image_extent(vk::Extent2D {
                width: desc.width,
                height: desc.height,
            })
            .image_array_layers(1)
            .image_usage(desc.usage | vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);
        let handle = driver.create_swapchain(&info)?;
        // Constructed early so a failure below destroys the swap chain and every surface
        // created so far.
        let mut swap_chain = Self {
            driver: driver.clone(),
            handle,
            width: desc.width,
            height: desc.height,
            state: Mutex::new(SwapState {
                surfaces: Vec::new(),
                back_buffer: 0,
            }),
            usage: ResourceUsage::default(),
        };
        let images = driver.swapchain_images(handle)?;
        for raw in images {
            let surface = swap_chain.create_surface(raw, desc)?;
            swap_chain.lock_mut().surfaces.push(surface);
        }
        let state = swap_chain.lock_mut();
        // The first acquire then uses the semaphore of surface 0.
        state.back_buffer = state.surfaces.len().saturating_sub(1) as u32;
        Ok(Arc::new(swap_chain))
    }

    fn create_surface(&self, raw: vk::Image, desc: &SwapChainDesc) -> VkResult<SwapSurface> {
        let image = Arc::new(Image::from_raw(
            raw,
            ImageDesc {
                format: desc.format,
                extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
                usage: ImageUsage::RENDER_TARGET,
                ..Default::default()
            },
        ));
        let view = self.driver.create_image_view(
            &vk::ImageViewCreateInfo::default()
                .image(raw)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format)
                .subresource_range(image.full_range()),
        )?;
        let semaphore = match Semaphore::new(self.driver.clone()) {
            Ok(semaphore) => Arc::new(semaphore),
            Err(err) => {
                self.driver.destroy_image_view(view);
                return Err(err);
            }
        };
        let framebuffer = Arc::new(Framebuffer::new(
            self.driver.clone(),
            FramebufferInfo {
                colors: vec![FramebufferAttachment {
                    image: image.clone(),
                    view,
                    mip_level: 0,
                    base_layer: 0,
                    layer_count: 1,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                }],
                depth: None,
                width: desc.width,
                height: desc.height,
                layers: 1,
            },
        ));
        Ok(SwapSurface {
            image,
            view,
            framebuffer,
            semaphore,
            acquired: false,
            needs_wait: false,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn image_count(&self) -> u32 {
        self.lock().surfaces.len() as u32
    }

    /// Acquires the next surface from the presentation engine.
    ///
    /// The acquire signals the semaphore of the next surface in the ring. When the engine
    /// hands out a different surface, the two swap semaphores so that the acquired surface
    /// always owns the one that will be signaled.
    ///
    /// # Panics
    /// When the current back buffer, or the returned surface, was acquired and never
    /// presented.
    pub fn acquire_back_buffer(&self) -> VkResult<AcquireOutcome> {
        let mut state = self.lock();
        assert!(
            !state.surfaces[state.back_buffer as usize].acquired,
            "Same swap chain surface being acquired twice in a row without present()"
        );
        let count = state.surfaces.len() as u32;
        let slot = (state.back_buffer + 1) % count;
        let semaphore = state.surfaces[slot as usize].semaphore.handle();
        let (index, suboptimal) = match self.driver.acquire_next_image(self.handle, semaphore) {
            Ok(result) => result,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::warn!("Swap chain out of date, back buffer not acquired");
                return Ok(AcquireOutcome::OutOfDate);
            }
            Err(err) => return Err(err),
        };
        assert!(
            !state.surfaces[index as usize].acquired,
            "Same swap chain surface being acquired twice in a row without present()"
        );
        if index != slot {
            let taken = state.surfaces[slot as usize].semaphore.clone();
            let replaced =
                std::mem::replace(&mut state.surfaces[index as usize].semaphore, taken);
            state.surfaces[slot as usize].semaphore = replaced;
        }
        let surface = &mut state.surfaces[index as usize];
        surface.acquired = true;
        surface.needs_wait = true;
        state.back_buffer = index;
        tracing::trace!(index, suboptimal, "acquired back buffer");
        Ok(if suboptimal {
            AcquireOutcome::Suboptimal(index)
        } else {
            AcquireOutcome::Acquired(index)
        })
    }

    /// Acquires a back buffer unless one is already held.
    pub fn ensure_back_buffer(&self) -> VkResult<AcquireOutcome> {
        {
            let state = self.lock();
            if state.surfaces[state.back_buffer as usize].acquired {
                return Ok(AcquireOutcome::Acquired(state.back_buffer));
            }
        }
        self.acquire_back_buffer()
    }

    /// Releases the back buffer for presentation. `None` when no back buffer is held.
    pub fn prepare_for_present(&self) -> Option<u32> {
        let mut state = self.lock();
        let index = state.back_buffer;
        let surface = &mut state.surfaces[index as usize];
        if !surface.acquired {
            return None;
        }
        surface.acquired = false;
        Some(index)
    }

    pub fn back_buffer(&self) -> BackBuffer {
        let state = self.lock();
        let surface = &state.surfaces[state.back_buffer as usize];
        BackBuffer {
            index: state.back_buffer,
            image: surface.image.clone(),
            framebuffer: surface.framebuffer.clone(),
            semaphore: surface.semaphore.clone(),
            acquired: surface.acquired,
            needs_wait: surface.needs_wait,
        }
    }

    /// The semaphore the next submission touching the back buffer has to wait on, if
    /// none has waited on it yet.
    pub fn back_buffer_wait(&self) -> Option<Arc<Semaphore>> {
        let state = self.lock();
        let surface = &state.surfaces[state.back_buffer as usize];
        (surface.acquired && surface.needs_wait).then(|| surface.semaphore.clone())
    }

    pub fn notify_back_buffer_wait_issued(&self) {
        let mut state = self.lock();
        let index = state.back_buffer as usize;
        state.surfaces[index].needs_wait = false;
    }

    #[cfg(test)]
    fn surface_semaphore(&self, index: usize) -> vk::Semaphore {
        self.lock().surfaces[index].semaphore.handle()
    }

    fn lock(&self) -> MutexGuard<'_, SwapState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn lock_mut(&mut self) -> &mut SwapState {
        self.state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AsVkHandle for SwapChain {
    type Handle = vk::SwapchainKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for SwapChain {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        let driver = self.driver.clone();
        for surface in self.lock_mut().surfaces.drain(..) {
            drop(surface.framebuffer);
            driver.destroy_image_view(surface.view);
        }
        driver.destroy_swapchain(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HeadlessDriver;

    fn swap_chain(headless: &Arc<HeadlessDriver>) -> Arc<SwapChain> {
        SwapChain::new(
            headless.clone(),
            &SwapChainDesc {
                width: 64,
                height: 32,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_acquire_present_cycle() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.prepare_for_present(), None);

        assert_eq!(chain.ensure_back_buffer().unwrap(), AcquireOutcome::Acquired(0));
        // Held back buffers are not acquired again.
        assert_eq!(chain.ensure_back_buffer().unwrap(), AcquireOutcome::Acquired(0));
        let back = chain.back_buffer();
        assert!(back.acquired && back.needs_wait);
        assert_eq!(back.framebuffer.width(), 64);
        assert_eq!(
            back.framebuffer.color_attachments()[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );

        assert!(chain.back_buffer_wait().is_some());
        chain.notify_back_buffer_wait_issued();
        assert!(chain.back_buffer_wait().is_none());

        assert_eq!(chain.prepare_for_present(), Some(0));
        assert_eq!(chain.prepare_for_present(), None);
        assert_eq!(chain.ensure_back_buffer().unwrap(), AcquireOutcome::Acquired(1));
    }

    #[test]
    fn test_semaphores_follow_acquired_surface() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        let slot_semaphore = chain.surface_semaphore(0);
        let other = chain.surface_semaphore(2);
        headless.script_acquire([Ok(2)]);
        assert_eq!(chain.acquire_back_buffer().unwrap(), AcquireOutcome::Acquired(2));
        assert_eq!(chain.back_buffer().semaphore.handle(), slot_semaphore);
        assert_eq!(chain.surface_semaphore(0), other);
    }

    #[test]
    fn test_out_of_date_acquires_nothing() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        headless.script_acquire([Err(vk::Result::ERROR_OUT_OF_DATE_KHR)]);
        assert_eq!(chain.acquire_back_buffer().unwrap(), AcquireOutcome::OutOfDate);
        assert!(!chain.back_buffer().acquired);
        assert!(chain.back_buffer_wait().is_none());
    }

    #[test]
    #[should_panic(expected = "Same swap chain surface being acquired twice")]
    fn test_double_acquire_panics() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        headless.script_acquire([Ok(1), Ok(1)]);
        chain.acquire_back_buffer().unwrap();
        chain.acquire_back_buffer().unwrap();
    }

    #[test]
    #[should_panic(expected = "Same swap chain surface being acquired twice")]
    fn test_acquire_without_present_panics_for_next_image() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        assert_eq!(chain.acquire_back_buffer().unwrap(), AcquireOutcome::Acquired(0));
        // The engine would hand out image 1 next.
        chain.acquire_back_buffer().unwrap();
    }

    #[test]
    fn test_acquire_after_present_moves_on() {
        let headless = Arc::new(HeadlessDriver::new());
        let chain = swap_chain(&headless);
        for expected in [0, 1, 2, 0] {
            assert_eq!(
                chain.acquire_back_buffer().unwrap(),
                AcquireOutcome::Acquired(expected)
            );
            assert_eq!(chain.prepare_for_present(), Some(expected));
        }
    }
}
