//! PS/2 keyboard driver.
//!
//! The IRQ 1 handler reads one byte from port 0x60 and feeds the decoder:
//! extended prefixes (0xE0/0xE1) are consumed into a flag, break codes
//! clear modifier state, make codes store the scan in the one-byte
//! last-scan buffer, and the lock toggles flip their status bit and write
//! the LED state back to the controller. Character decoding (scancode set
//! 1, US layout) goes through `pc_keyboard` into a ring buffer the shell
//! and desktop consume.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Keyboard status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyboardStatus: u16 {
        const SHIFT       = 1 << 0;
        const CTRL        = 1 << 1;
        const ALT         = 1 << 2;
        const NUM_LOCK    = 1 << 3;
        const CAPS_LOCK   = 1 << 4;
        const SCROLL_LOCK = 1 << 5;
        /// Basic assurance test passed.
        const BAT_OK      = 1 << 6;
        /// Diagnostic failure reported by the device.
        const DIAG_FAIL   = 1 << 7;
        /// Last command was answered with RESEND.
        const RESEND      = 1 << 8;
        /// Scanning enabled.
        const ENABLED     = 1 << 9;
        /// An 0xE0/0xE1 prefix is pending.
        const EXTENDED    = 1 << 10;
    }
}

/// Decoded key event for the window system.
#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    /// ASCII code (or one of the `KEY_*` specials).
    pub code: u8,
    /// Modifier bits at the time of the event (low byte of the status).
    pub mods: u8,
    /// Make (true) or break (false).
    pub pressed: bool,
}

/// Single-byte codes for non-ASCII keys.
pub const KEY_UP: u8 = 0x80;
pub const KEY_DOWN: u8 = 0x81;
pub const KEY_LEFT: u8 = 0x82;
pub const KEY_RIGHT: u8 = 0x83;
pub const KEY_HOME: u8 = 0x84;
pub const KEY_END: u8 = 0x85;
pub const KEY_DELETE: u8 = 0x86;

/// Status word, shared with the IRQ handler.
static STATUS: core::sync::atomic::AtomicU16 = core::sync::atomic::AtomicU16::new(0);

/// One-byte last-scan buffer; 0 means empty.
static LAST_SCAN: AtomicU8 = AtomicU8::new(0);

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Scancodes for the lock toggles (set 1 make codes).
const SCAN_CAPS_LOCK: u8 = 0x3A;
const SCAN_NUM_LOCK: u8 = 0x45;
const SCAN_SCROLL_LOCK: u8 = 0x46;
const SCAN_LSHIFT: u8 = 0x2A;
const SCAN_RSHIFT: u8 = 0x36;
const SCAN_CTRL: u8 = 0x1D;
const SCAN_ALT: u8 = 0x38;

/// Device response bytes.
const RSP_BAT_OK: u8 = 0xAA;
const RSP_ACK: u8 = 0xFA;
const RSP_RESEND: u8 = 0xFE;
const RSP_DIAG_FAIL: u8 = 0xFD;

/// Current status word.
pub fn status() -> KeyboardStatus {
    KeyboardStatus::from_bits_truncate(STATUS.load(Ordering::Relaxed))
}

fn set_status(flag: KeyboardStatus, on: bool) {
    if on {
        STATUS.fetch_or(flag.bits(), Ordering::Relaxed);
    } else {
        STATUS.fetch_and(!flag.bits(), Ordering::Relaxed);
    }
}

fn toggle_status(flag: KeyboardStatus) {
    STATUS.fetch_xor(flag.bits(), Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Key ring buffer (single producer: IRQ; single consumer: pump/shell)
// ---------------------------------------------------------------------------

const KEY_BUFFER_SIZE: usize = 256;

struct KeyRing {
    buf: [KeyEvent; KEY_BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyRing {
    const fn new() -> Self {
        const EMPTY: KeyEvent = KeyEvent {
            code: 0,
            mods: 0,
            pressed: false,
        };
        Self {
            buf: [EMPTY; KEY_BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn push(&mut self, event: KeyEvent) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (KEY_BUFFER_SIZE - 1);
        if next == self.tail.load(Ordering::Acquire) {
            return; // full: drop the key
        }
        self.buf[head] = event;
        self.head.store(next, Ordering::Release);
    }

    fn pop(&self) -> Option<KeyEvent> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let event = self.buf[tail];
        self.tail
            .store((tail + 1) & (KEY_BUFFER_SIZE - 1), Ordering::Release);
        Some(event)
    }

    fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }
}

// The ring is shared between the IRQ handler (producer) and the pump
// (consumer); the IRQ-saving lock prevents the handler from spinning on a
// lock held by the code it interrupted.
static KEY_RING: crate::sync::IrqSpinLock<KeyRing> = crate::sync::IrqSpinLock::new(KeyRing::new());

// ---------------------------------------------------------------------------
// Scancode decoding
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod decode {
    use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1};
    use spin::Mutex;

    use super::*;

    static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

    pub fn init() {
        *KEYBOARD.lock() = Some(Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::MapLettersToUnicode,
        ));
    }

    /// Run a scancode through the layout decoder, enqueueing a KeyEvent.
    pub fn decode(scancode: u8, pressed: bool) {
        let mut guard = KEYBOARD.lock();
        let Some(keyboard) = guard.as_mut() else {
            return;
        };
        let Ok(Some(key_event)) = keyboard.add_byte(scancode) else {
            return;
        };
        let Some(key) = keyboard.process_keyevent(key_event) else {
            return;
        };

        let mods = super::status().bits() as u8;
        let code = match key {
            DecodedKey::Unicode(ch) if ch.is_ascii() => Some(ch as u8),
            DecodedKey::RawKey(key) => match key {
                KeyCode::ArrowUp => Some(KEY_UP),
                KeyCode::ArrowDown => Some(KEY_DOWN),
                KeyCode::ArrowLeft => Some(KEY_LEFT),
                KeyCode::ArrowRight => Some(KEY_RIGHT),
                KeyCode::Home => Some(KEY_HOME),
                KeyCode::End => Some(KEY_END),
                KeyCode::Delete => Some(KEY_DELETE),
                _ => None,
            },
            _ => None,
        };
        if let Some(code) = code {
            KEY_RING.lock().push(KeyEvent {
                code,
                mods,
                pressed,
            });
        }
    }
}

/// Feed one byte from the controller through the state machine.
///
/// This is the IRQ 1 path; it must not print or block.
pub fn handle_byte(byte: u8) {
    // Device responses first.
    match byte {
        RSP_BAT_OK => {
            set_status(KeyboardStatus::BAT_OK, true);
            set_status(KeyboardStatus::DIAG_FAIL, false);
            return;
        }
        RSP_DIAG_FAIL => {
            set_status(KeyboardStatus::DIAG_FAIL, true);
            return;
        }
        RSP_RESEND => {
            set_status(KeyboardStatus::RESEND, true);
            return;
        }
        RSP_ACK => {
            set_status(KeyboardStatus::RESEND, false);
            return;
        }
        _ => {}
    }

    // Extended prefixes are consumed into the status word.
    if byte == 0xE0 || byte == 0xE1 {
        set_status(KeyboardStatus::EXTENDED, true);
        return;
    }
    let extended = status().contains(KeyboardStatus::EXTENDED);
    set_status(KeyboardStatus::EXTENDED, false);

    let is_break = byte & 0x80 != 0;
    let scan = byte & 0x7F;

    if is_break {
        // Break codes clear modifier state.
        match scan {
            SCAN_LSHIFT | SCAN_RSHIFT => set_status(KeyboardStatus::SHIFT, false),
            SCAN_CTRL => set_status(KeyboardStatus::CTRL, false),
            SCAN_ALT => set_status(KeyboardStatus::ALT, false),
            _ => {}
        }
    } else {
        match scan {
            SCAN_LSHIFT | SCAN_RSHIFT => set_status(KeyboardStatus::SHIFT, true),
            SCAN_CTRL => set_status(KeyboardStatus::CTRL, true),
            SCAN_ALT => set_status(KeyboardStatus::ALT, true),
            SCAN_CAPS_LOCK => {
                toggle_status(KeyboardStatus::CAPS_LOCK);
                write_leds();
            }
            SCAN_NUM_LOCK => {
                toggle_status(KeyboardStatus::NUM_LOCK);
                write_leds();
            }
            SCAN_SCROLL_LOCK => {
                toggle_status(KeyboardStatus::SCROLL_LOCK);
                write_leds();
            }
            _ => {
                // Ordinary make code: store the scan.
                LAST_SCAN.store(scan, Ordering::Relaxed);
            }
        }
    }

    // The layout decoder wants the raw stream including prefixes.
    #[cfg(target_arch = "x86_64")]
    {
        if extended {
            decode::decode(0xE0, !is_break);
        }
        decode::decode(byte, !is_break);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = extended;
}

/// Push the lock LEDs back to the device (command 0xED).
fn write_leds() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let s = status();
        let mut leds = 0u8;
        if s.contains(KeyboardStatus::SCROLL_LOCK) {
            leds |= 1;
        }
        if s.contains(KeyboardStatus::NUM_LOCK) {
            leds |= 2;
        }
        if s.contains(KeyboardStatus::CAPS_LOCK) {
            leds |= 4;
        }
        // SAFETY: standard keyboard LED sequence on port 0x60.
        unsafe {
            crate::arch::outb(0x60, 0xED);
            crate::arch::outb(0x60, leds);
        }
    }
}

/// IRQ 1 handler: read one byte and run the state machine.
fn keyboard_irq(_irq: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: reading the PS/2 data port in the keyboard IRQ.
        let byte = unsafe { crate::arch::inb(0x60) };
        handle_byte(byte);
    }
}

/// Install the driver on IRQ 1.
pub fn init() {
    #[cfg(target_arch = "x86_64")]
    decode::init();
    crate::irq::register_handler(1, keyboard_irq);
    set_status(KeyboardStatus::ENABLED, true);
    INITIALIZED.store(true, Ordering::Release);
    log::info!("PS/2 keyboard on IRQ 1");
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Polling consumer: return and clear the last decoded character.
pub fn getch() -> Option<u8> {
    KEY_RING.lock().pop().map(|e| e.code)
}

/// Return and clear the last raw scancode.
pub fn last_scan() -> Option<u8> {
    match LAST_SCAN.swap(0, Ordering::Relaxed) {
        0 => None,
        scan => Some(scan),
    }
}

/// Whether a key is waiting.
pub fn has_pending() -> bool {
    !KEY_RING.lock().is_empty()
}

/// Pop one decoded event (desktop pump).
pub fn pop_event() -> Option<KeyEvent> {
    KEY_RING.lock().pop()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Serialize against every other test touching the driver statics.
    fn reset() -> spin::MutexGuard<'static, ()> {
        let guard = crate::fs::TEST_LOCK.lock();
        STATUS.store(0, Ordering::Relaxed);
        LAST_SCAN.store(0, Ordering::Relaxed);
        while KEY_RING.lock().pop().is_some() {}
        guard
    }

    #[test]
    fn shift_make_and_break_track_status() {
        let _g = reset();
        handle_byte(SCAN_LSHIFT);
        assert!(status().contains(KeyboardStatus::SHIFT));
        handle_byte(SCAN_LSHIFT | 0x80);
        assert!(!status().contains(KeyboardStatus::SHIFT));
    }

    #[test]
    fn caps_lock_toggles_on_each_make() {
        let _g = reset();
        handle_byte(SCAN_CAPS_LOCK);
        assert!(status().contains(KeyboardStatus::CAPS_LOCK));
        handle_byte(SCAN_CAPS_LOCK | 0x80);
        assert!(status().contains(KeyboardStatus::CAPS_LOCK));
        handle_byte(SCAN_CAPS_LOCK);
        assert!(!status().contains(KeyboardStatus::CAPS_LOCK));
    }

    #[test]
    fn extended_prefix_is_consumed() {
        let _g = reset();
        handle_byte(0xE0);
        assert!(status().contains(KeyboardStatus::EXTENDED));
        handle_byte(0x48); // extended arrow-up make
        assert!(!status().contains(KeyboardStatus::EXTENDED));
    }

    #[test]
    fn bat_and_resend_responses_update_status() {
        let _g = reset();
        handle_byte(RSP_BAT_OK);
        assert!(status().contains(KeyboardStatus::BAT_OK));
        handle_byte(RSP_RESEND);
        assert!(status().contains(KeyboardStatus::RESEND));
        handle_byte(RSP_ACK);
        assert!(!status().contains(KeyboardStatus::RESEND));
    }

    #[test]
    fn make_codes_store_last_scan() {
        let _g = reset();
        handle_byte(0x1E); // 'a' make
        assert_eq!(last_scan(), Some(0x1E));
        // Cleared after consumption.
        assert_eq!(last_scan(), None);
    }

    #[test]
    fn decoded_ascii_reaches_the_ring() {
        let _g = reset();
        decode::init();
        handle_byte(0x1E); // 'a' make
        handle_byte(0x9E); // 'a' break
        let event = pop_event().expect("decoded key");
        assert_eq!(event.code, b'a');
        assert!(event.pressed);
    }
}
