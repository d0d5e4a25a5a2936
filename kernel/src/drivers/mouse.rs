//! PS/2 mouse driver.
//!
//! IRQ 12 delivers one byte per interrupt; the decoder assembles 3-byte
//! packets (4 bytes when the wheel was detected via the standard
//! 200/100/80 sample-rate knock), updates the absolute cursor position
//! clamped to the screen, and fires the registered move/button/scroll
//! callbacks. Events are also queued for the desktop pump.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU8, AtomicUsize, Ordering};

use crate::sync::IrqSpinLock;

/// Button bits in the first packet byte.
pub const BUTTON_LEFT: u8 = 0x01;
pub const BUTTON_RIGHT: u8 = 0x02;
pub const BUTTON_MIDDLE: u8 = 0x04;

/// Bit 3 of the first packet byte is always set; used to resynchronise.
const PACKET_SYNC: u8 = 0x08;
const SIGN_X: u8 = 0x10;
const SIGN_Y: u8 = 0x20;

/// A decoded mouse event: absolute position plus state.
#[derive(Debug, Clone, Copy)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
    pub wheel: i8,
}

/// Registered callbacks, fired on the IRQ path when state changes.
pub type MoveCallback = fn(i32, i32);
pub type ButtonCallback = fn(u8);
pub type ScrollCallback = fn(i8);

static MOVE_CALLBACK: IrqSpinLock<Option<MoveCallback>> = IrqSpinLock::new(None);
static BUTTON_CALLBACK: IrqSpinLock<Option<ButtonCallback>> = IrqSpinLock::new(None);
static SCROLL_CALLBACK: IrqSpinLock<Option<ScrollCallback>> = IrqSpinLock::new(None);

// Screen bounds for clamping the absolute position.
static SCREEN_WIDTH: AtomicU16 = AtomicU16::new(800);
static SCREEN_HEIGHT: AtomicU16 = AtomicU16::new(600);

// Absolute cursor position.
static CURSOR_X: AtomicI32 = AtomicI32::new(400);
static CURSOR_Y: AtomicI32 = AtomicI32::new(300);

static BUTTONS: AtomicU8 = AtomicU8::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// True when the sample-rate knock identified a wheel mouse (4-byte
/// packets).
static WHEEL_DEVICE: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------------
// Packet assembly
// ---------------------------------------------------------------------------

struct PacketState {
    bytes: [u8; 4],
    cycle: usize,
}

static PACKET: IrqSpinLock<PacketState> = IrqSpinLock::new(PacketState {
    bytes: [0; 4],
    cycle: 0,
});

// ---------------------------------------------------------------------------
// Event ring (producer: IRQ; consumer: desktop pump)
// ---------------------------------------------------------------------------

const EVENT_BUFFER_SIZE: usize = 64;

struct EventRing {
    buf: [MouseEvent; EVENT_BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl EventRing {
    const fn new() -> Self {
        const EMPTY: MouseEvent = MouseEvent {
            x: 0,
            y: 0,
            buttons: 0,
            wheel: 0,
        };
        Self {
            buf: [EMPTY; EVENT_BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn push(&mut self, event: MouseEvent) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (EVENT_BUFFER_SIZE - 1);
        if next == self.tail.load(Ordering::Acquire) {
            return; // full: drop
        }
        self.buf[head] = event;
        self.head.store(next, Ordering::Release);
    }

    fn pop(&self) -> Option<MouseEvent> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let event = self.buf[tail];
        self.tail
            .store((tail + 1) & (EVENT_BUFFER_SIZE - 1), Ordering::Release);
        Some(event)
    }
}

static EVENTS: IrqSpinLock<EventRing> = IrqSpinLock::new(EventRing::new());

// ---------------------------------------------------------------------------
// Public state queries
// ---------------------------------------------------------------------------

/// Absolute cursor position.
pub fn cursor_position() -> (i32, i32) {
    (
        CURSOR_X.load(Ordering::Relaxed),
        CURSOR_Y.load(Ordering::Relaxed),
    )
}

/// Current button state.
pub fn buttons() -> u8 {
    BUTTONS.load(Ordering::Relaxed)
}

/// Clamp bounds, set by the desktop when the mode is known.
pub fn set_screen_bounds(width: u16, height: u16) {
    SCREEN_WIDTH.store(width, Ordering::Relaxed);
    SCREEN_HEIGHT.store(height, Ordering::Relaxed);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Whether the device answered the wheel knock.
pub fn is_wheel_device() -> bool {
    WHEEL_DEVICE.load(Ordering::Relaxed)
}

/// Register callbacks; re-registration replaces.
pub fn set_move_callback(cb: MoveCallback) {
    *MOVE_CALLBACK.lock() = Some(cb);
}

pub fn set_button_callback(cb: ButtonCallback) {
    *BUTTON_CALLBACK.lock() = Some(cb);
}

pub fn set_scroll_callback(cb: ScrollCallback) {
    *SCROLL_CALLBACK.lock() = Some(cb);
}

/// Pop one event (desktop pump).
pub fn pop_event() -> Option<MouseEvent> {
    EVENTS.lock().pop()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Feed one byte from the auxiliary port. IRQ 12 path.
pub fn handle_byte(byte: u8) {
    let packet_len = if WHEEL_DEVICE.load(Ordering::Relaxed) {
        4
    } else {
        3
    };

    let complete = {
        let mut packet = PACKET.lock();
        if packet.cycle == 0 && byte & PACKET_SYNC == 0 {
            // Desynchronised: drop bytes until a header candidate.
            return;
        }
        let cycle = packet.cycle;
        packet.bytes[cycle] = byte;
        packet.cycle += 1;
        if packet.cycle >= packet_len {
            packet.cycle = 0;
            Some(packet.bytes)
        } else {
            None
        }
    };

    if let Some(bytes) = complete {
        process_packet(&bytes, packet_len);
    }
}

/// Apply one complete packet: position, buttons, wheel, callbacks.
fn process_packet(bytes: &[u8; 4], packet_len: usize) {
    let flags = bytes[0];

    // 9-bit two's-complement deltas; PS/2 y grows upward.
    let mut dx = bytes[1] as i32;
    if flags & SIGN_X != 0 {
        dx -= 256;
    }
    let mut dy = bytes[2] as i32;
    if flags & SIGN_Y != 0 {
        dy -= 256;
    }
    let dy = -dy;

    let width = SCREEN_WIDTH.load(Ordering::Relaxed) as i32;
    let height = SCREEN_HEIGHT.load(Ordering::Relaxed) as i32;

    let x = (CURSOR_X.load(Ordering::Relaxed) + dx).clamp(0, width - 1);
    let y = (CURSOR_Y.load(Ordering::Relaxed) + dy).clamp(0, height - 1);
    CURSOR_X.store(x, Ordering::Relaxed);
    CURSOR_Y.store(y, Ordering::Relaxed);

    let new_buttons = flags & (BUTTON_LEFT | BUTTON_RIGHT | BUTTON_MIDDLE);
    let old_buttons = BUTTONS.swap(new_buttons, Ordering::Relaxed);

    let wheel = if packet_len == 4 { bytes[3] as i8 } else { 0 };

    EVENTS.lock().push(MouseEvent {
        x,
        y,
        buttons: new_buttons,
        wheel,
    });

    // Fire callbacks on change.
    if dx != 0 || dy != 0 {
        let cb = *MOVE_CALLBACK.lock();
        if let Some(cb) = cb {
            cb(x, y);
        }
    }
    if new_buttons != old_buttons {
        let cb = *BUTTON_CALLBACK.lock();
        if let Some(cb) = cb {
            cb(new_buttons);
        }
    }
    if wheel != 0 {
        let cb = *SCROLL_CALLBACK.lock();
        if let Some(cb) = cb {
            cb(wheel);
        }
    }
}

/// IRQ 12 handler.
fn mouse_irq(_irq: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: reading the PS/2 data port in the mouse IRQ.
        let byte = unsafe { crate::arch::inb(0x60) };
        handle_byte(byte);
    }
}

// ---------------------------------------------------------------------------
// Device setup
// ---------------------------------------------------------------------------

/// Wait for the controller input buffer to drain, then send to the aux
/// device and collect the ack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn aux_write(byte: u8) -> u8 {
    // SAFETY: standard PS/2 controller handshake on ports 0x64/0x60.
    unsafe {
        for _ in 0..10000 {
            if crate::arch::inb(0x64) & 0x02 == 0 {
                break;
            }
        }
        crate::arch::outb(0x64, 0xD4);
        for _ in 0..10000 {
            if crate::arch::inb(0x64) & 0x02 == 0 {
                break;
            }
        }
        crate::arch::outb(0x60, byte);
        for _ in 0..10000 {
            if crate::arch::inb(0x64) & 0x01 != 0 {
                break;
            }
        }
        crate::arch::inb(0x60)
    }
}

/// The 200/100/80 sample-rate knock: a wheel mouse answers device id 3.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn detect_wheel() -> bool {
    for rate in [200u8, 100, 80] {
        aux_write(0xF3);
        aux_write(rate);
    }
    aux_write(0xF2);
    // SAFETY: read the device id byte that follows the ack.
    let id = unsafe { crate::arch::inb(0x60) };
    id == 3
}

/// Install the driver on IRQ 12 and enable the aux device.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: enable the auxiliary device and its interrupt through
        // the standard controller command sequence.
        unsafe {
            crate::arch::outb(0x64, 0xA8); // enable aux port
            crate::arch::outb(0x64, 0x20); // read command byte
            let mut cmd = crate::arch::inb(0x60);
            cmd |= 0x02; // aux interrupt enable
            crate::arch::outb(0x64, 0x60);
            crate::arch::outb(0x60, cmd);
        }
        let wheel = detect_wheel();
        WHEEL_DEVICE.store(wheel, Ordering::Relaxed);
        aux_write(0xF6); // defaults
        aux_write(0xF4); // enable reporting
        if wheel {
            log::info!("PS/2 wheel mouse on IRQ 12 (4-byte packets)");
        } else {
            log::info!("PS/2 mouse on IRQ 12");
        }
    }

    crate::irq::register_handler(12, mouse_irq);
    INITIALIZED.store(true, Ordering::Release);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Serialize against every other test touching the driver statics.
    fn reset() -> spin::MutexGuard<'static, ()> {
        let guard = crate::fs::TEST_LOCK.lock();
        set_screen_bounds(800, 600);
        CURSOR_X.store(400, Ordering::Relaxed);
        CURSOR_Y.store(300, Ordering::Relaxed);
        BUTTONS.store(0, Ordering::Relaxed);
        WHEEL_DEVICE.store(false, Ordering::Relaxed);
        PACKET.lock().cycle = 0;
        while pop_event().is_some() {}
        guard
    }

    fn send_packet(flags: u8, dx: u8, dy: u8) {
        handle_byte(flags | PACKET_SYNC);
        handle_byte(dx);
        handle_byte(dy);
    }

    #[test]
    fn motion_updates_absolute_position() {
        let _g = reset();
        send_packet(0, 10, 5); // PS/2 dy is inverted
        assert_eq!(cursor_position(), (410, 295));

        // Negative deltas via the sign bits.
        send_packet(SIGN_X | SIGN_Y, 0xF6, 0xFB); // dx = -10, dy = -5
        assert_eq!(cursor_position(), (400, 300));
    }

    #[test]
    fn position_clamps_to_screen() {
        let _g = reset();
        for _ in 0..20 {
            send_packet(SIGN_X, 0x00, 0); // dx = -256
        }
        assert_eq!(cursor_position().0, 0);
    }

    #[test]
    fn buttons_are_reported() {
        let _g = reset();
        send_packet(BUTTON_LEFT, 0, 0);
        assert_eq!(buttons(), BUTTON_LEFT);
        let event = pop_event().expect("event queued");
        assert_eq!(event.buttons, BUTTON_LEFT);

        send_packet(0, 0, 0);
        assert_eq!(buttons(), 0);
    }

    #[test]
    fn desync_bytes_are_dropped() {
        let _g = reset();
        // A byte without the sync bit must not start a packet.
        handle_byte(0x00);
        send_packet(0, 1, 0);
        assert_eq!(cursor_position(), (401, 300));
    }

    #[test]
    fn wheel_device_reads_four_byte_packets() {
        let _g = reset();
        WHEEL_DEVICE.store(true, Ordering::Relaxed);
        handle_byte(PACKET_SYNC);
        handle_byte(0);
        handle_byte(0);
        handle_byte(0xFF); // wheel -1
        let event = pop_event().expect("wheel event");
        assert_eq!(event.wheel, -1);
    }
}
