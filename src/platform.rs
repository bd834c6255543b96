// Window system integration glue
//
// The runtime never links a windowing backend directly. The embedding
// application hands us one of these, and we pull the required
// extension lists and the VkSurfaceKHR through it.

use ash::vk;

use std::os::raw::c_char;

/// The platform half of swapchain presentation.
///
/// Implementations wrap whatever windowing system is in use and
/// provide surface creation plus the extension lists the instance and
/// device need for it. The runtime polls `is_alive` from the outer
/// frame loop and stops presenting once the platform reports dead.
pub trait WSIPlatform {
    /// Instance extensions this platform needs, e.g. VK_KHR_surface
    /// plus the platform specific surface extension.
    fn instance_extensions(&self) -> Vec<*const c_char>;

    /// Device extensions this platform needs, normally just
    /// VK_KHR_swapchain.
    fn device_extensions(&self) -> Vec<*const c_char>;

    /// Create a surface for the platform's window.
    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> std::result::Result<vk::SurfaceKHR, vk::Result>;

    /// Current drawable size of the window.
    fn get_window_size(&self) -> (u32, u32);

    /// Poll for input/window events. Called once per frame.
    fn poll_events(&mut self);

    /// Notify the platform that the swapchain was rebuilt at a new
    /// size.
    fn notify_resize(&mut self, width: u32, height: u32);

    /// False once the window has been closed and the outer loop
    /// should tear the device down.
    fn is_alive(&self) -> bool;
}
