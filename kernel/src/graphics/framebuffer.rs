//! Linear framebuffer handle.
//!
//! The Bochs-compatible display registers are programmed by the video
//! driver (external); the kernel side just records the geometry and the
//! mapped pixel pointer and hands the window system its single drawing
//! [`Context`](super::Context). 32-bit RGBA, default 800x600.

use spin::Mutex;

use super::Context;

/// Default mode requested from the display engine.
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

/// Framebuffer geometry and mapping.
pub struct Framebuffer {
    width: u32,
    height: u32,
    pitch: u32,
    buffer: Option<*mut u32>,
}

// SAFETY: the pointer is only handed out through configure/context under
// the module mutex; the mapped region lives for the kernel's lifetime.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    pub const fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            pitch: 0,
            buffer: None,
        }
    }

    /// Record the mode the display driver configured.
    pub fn configure(&mut self, width: u32, height: u32, buffer: *mut u32) {
        self.width = width;
        self.height = height;
        self.pitch = width * 4;
        self.buffer = Some(buffer);
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_configured(&self) -> bool {
        self.buffer.is_some()
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

static FRAMEBUFFER: Mutex<Framebuffer> = Mutex::new(Framebuffer::new());

/// Called by the display driver once the mode is set.
pub fn configure(width: u32, height: u32, buffer: *mut u32) {
    FRAMEBUFFER.lock().configure(width, height, buffer);
    log::info!("framebuffer: {}x{} @ {:p}", width, height, buffer);
}

/// Build the window system's drawing context over the framebuffer.
pub fn create_context() -> Option<Context> {
    let fb = FRAMEBUFFER.lock();
    let buffer = fb.buffer?;
    // SAFETY: the driver guarantees width*height mapped pixels.
    Some(unsafe { Context::new(buffer, fb.width as i32, fb.height as i32) })
}

/// Current mode, if configured.
pub fn mode() -> Option<(u32, u32)> {
    let fb = FRAMEBUFFER.lock();
    fb.is_configured().then(|| (fb.width, fb.height))
}
