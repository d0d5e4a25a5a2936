//! Desktop: the root of the window tree.
//!
//! Owns the window system over the framebuffer, the taskbar and the mouse
//! cursor. Input and ticks arrive through [`pump`], which the idle flow
//! calls: driver IRQ handlers only enqueue events, so the window tree is
//! mutated by exactly one execution context. Windows flagged
//! `SHOULD_CLOSE` are collected at the top of every mouse dispatch.

pub mod window;

pub use window::{Window, WindowFlags, WindowId, WindowSystem};

use spin::Mutex;

use crate::graphics::{framebuffer, Color};

/// Taskbar height in pixels.
const TASKBAR_HEIGHT: i32 = 30;

/// Desktop background color.
const DESKTOP_COLOR: Color = 0xFF2C3E50;
/// Taskbar colors.
const TASKBAR_COLOR: Color = 0xFF1A252F;
const TASKBAR_ENTRY_COLOR: Color = 0xFF34495E;
const TASKBAR_TEXT_COLOR: Color = 0xFFECF0F1;
/// Cursor color.
const CURSOR_COLOR: Color = 0xFFFFFFFF;

/// Desktop state: the tree plus the cursor.
pub struct Desktop {
    pub ws: WindowSystem,
    taskbar: WindowId,
    mouse_x: i32,
    mouse_y: i32,
}

static DESKTOP: Mutex<Option<Desktop>> = Mutex::new(None);

/// Paint the desktop background.
fn paint_background(ws: &mut WindowSystem, id: WindowId) {
    let (w, h) = {
        let win = ws.win(id);
        (win.width, win.height)
    };
    ws.context.fill_rect(0, 0, w, h, DESKTOP_COLOR);
}

/// Paint the taskbar: one entry per toplevel, non-floating window.
fn paint_taskbar(ws: &mut WindowSystem, id: WindowId) {
    let (w, h) = {
        let win = ws.win(id);
        (win.width, win.height)
    };
    ws.context.fill_rect(0, 0, w, h, TASKBAR_COLOR);

    let entries = taskbar_entries(ws, id);
    for (i, (_, title, minimized)) in entries.iter().enumerate() {
        let x = 4 + i as i32 * 124;
        let color = if *minimized {
            TASKBAR_COLOR
        } else {
            TASKBAR_ENTRY_COLOR
        };
        ws.context.fill_rect(x, 4, 120, h - 8, color);
        let label: alloc::string::String = title.chars().take(12).collect();
        ws.context.draw_text(&label, x + 6, 9, TASKBAR_TEXT_COLOR);
    }
}

/// Toplevel windows shown in the taskbar, in z-order.
fn taskbar_entries(
    ws: &WindowSystem,
    taskbar: WindowId,
) -> alloc::vec::Vec<(WindowId, alloc::string::String, bool)> {
    let root = ws.root();
    let mut tops: alloc::vec::Vec<WindowId> = ws
        .win(root)
        .children
        .iter()
        .copied()
        .filter(|&c| c != taskbar)
        .filter(|&c| !ws.win(c).flags.contains(WindowFlags::FLOATING))
        .collect();
    tops.sort_by_key(|&c| ws.win(c).index);
    tops.into_iter()
        .map(|c| {
            let w = ws.win(c);
            (c, w.title.clone(), w.flags.contains(WindowFlags::MINIMIZED))
        })
        .collect()
}

/// Taskbar click: focus the entry's window, restoring it if minimized.
fn taskbar_mousedown(ws: &mut WindowSystem, id: WindowId, x: i32, _y: i32) {
    let entries = taskbar_entries(ws, id);
    let index = ((x - 4) / 124) as usize;
    if x < 4 || index >= entries.len() {
        return;
    }
    let (target, _, minimized) = entries[index];
    if minimized {
        ws.restore(target);
    } else {
        ws.raise(target);
        let root = ws.root();
        ws.paint(root, None, true);
    }
}

/// Build the desktop over the configured framebuffer.
pub fn init() {
    let Some(context) = framebuffer::create_context() else {
        log::warn!("desktop: no framebuffer configured, running headless");
        return;
    };
    let (width, height) = (context.width(), context.height());

    let mut ws = WindowSystem::new(context);
    let root = ws.root();
    ws.win_mut(root).paint_fn = Some(paint_background);

    let taskbar = ws.create_window(
        root,
        0,
        height - TASKBAR_HEIGHT,
        width,
        TASKBAR_HEIGHT,
        WindowFlags::NODECORATION
            | WindowFlags::NO_DRAG
            | WindowFlags::NO_RESIZE
            | WindowFlags::FLOATING,
        "taskbar",
    );
    ws.win_mut(taskbar).paint_fn = Some(paint_taskbar);
    ws.win_mut(taskbar).mousedown_fn = Some(taskbar_mousedown);

    ws.paint(root, None, true);

    *DESKTOP.lock() = Some(Desktop {
        ws,
        taskbar,
        mouse_x: (width / 2) as i32,
        mouse_y: (height / 2) as i32,
    });
    log::info!("desktop up at {}x{}", width, height);
}

/// Open a decorated application window.
pub fn create_app_window(x: i32, y: i32, w: i32, h: i32, title: &str) -> Option<WindowId> {
    let mut guard = DESKTOP.lock();
    let desktop = guard.as_mut()?;
    let root = desktop.ws.root();
    let id = desktop
        .ws
        .create_window(root, x, y, w, h, WindowFlags::empty(), title);
    desktop.ws.paint(root, None, true);
    Some(id)
}

/// Pump queued input events and the tick fan-out. Called from the idle
/// flow; never from interrupt context.
pub fn pump() {
    let mut moved = false;

    // Drain the mouse queue; only the final position matters for the
    // cursor sprite.
    while let Some(event) = crate::drivers::mouse::pop_event() {
        moved = true;
        dispatch_mouse(event.x, event.y, event.buttons);
    }
    if moved {
        draw_cursor();
    }

    while let Some(key) = crate::drivers::keyboard::pop_event() {
        let mut guard = DESKTOP.lock();
        if let Some(desktop) = guard.as_mut() {
            let root = desktop.ws.root();
            desktop
                .ws
                .process_keyboard(root, key.code, key.mods, key.pressed as u8);
        }
    }

    let now = crate::timer::get_ticks();
    let mut guard = DESKTOP.lock();
    if let Some(desktop) = guard.as_mut() {
        let root = desktop.ws.root();
        desktop.ws.process_tick(root, now);
    }
}

/// One mouse event through the tree. Deferred closes are collected first.
fn dispatch_mouse(x: i32, y: i32, buttons: u8) {
    let mut guard = DESKTOP.lock();
    let Some(desktop) = guard.as_mut() else {
        return;
    };

    let closed = desktop.ws.collect_closed();
    if closed > 0 {
        let root = desktop.ws.root();
        desktop.ws.paint(root, None, true);
    }

    desktop.mouse_x = x;
    desktop.mouse_y = y;
    let root = desktop.ws.root();
    desktop.ws.process_mouse(root, x, y, buttons);
}

/// Draw the cursor sprite at the last dispatched position, directly over
/// whatever was painted.
fn draw_cursor() {
    let mut guard = DESKTOP.lock();
    let Some(desktop) = guard.as_mut() else {
        return;
    };
    let (x, y) = (desktop.mouse_x, desktop.mouse_y);
    let ctx = &mut desktop.ws.context;
    // A small left-leaning wedge.
    for row in 0..10 {
        ctx.fill_rect(x, y + row, (10 - row).min(4), 1, CURSOR_COLOR);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, vec};

    use super::*;
    use crate::graphics::Context;

    fn test_desktop(w: i32, h: i32) -> Desktop {
        let buf = Box::leak(vec![0u32; (w * h) as usize].into_boxed_slice());
        let ctx = unsafe { Context::new(buf.as_mut_ptr(), w, h) };
        let mut ws = WindowSystem::new(ctx);
        let root = ws.root();
        ws.win_mut(root).paint_fn = Some(paint_background);
        let taskbar = ws.create_window(
            root,
            0,
            h - TASKBAR_HEIGHT,
            w,
            TASKBAR_HEIGHT,
            WindowFlags::NODECORATION
                | WindowFlags::NO_DRAG
                | WindowFlags::NO_RESIZE
                | WindowFlags::FLOATING,
            "taskbar",
        );
        ws.win_mut(taskbar).paint_fn = Some(paint_taskbar);
        ws.win_mut(taskbar).mousedown_fn = Some(taskbar_mousedown);
        Desktop {
            ws,
            taskbar,
            mouse_x: 0,
            mouse_y: 0,
        }
    }

    #[test]
    fn taskbar_lists_toplevel_windows_in_z_order() {
        let mut d = test_desktop(640, 480);
        let root = d.ws.root();
        let a = d
            .ws
            .create_window(root, 10, 10, 100, 100, WindowFlags::empty(), "alpha");
        let _b = d
            .ws
            .create_window(root, 20, 20, 100, 100, WindowFlags::empty(), "beta");

        let entries = taskbar_entries(&d.ws, d.taskbar);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, a);
        assert_eq!(entries[0].1, "alpha");
        // The floating taskbar itself is not listed.
        assert!(entries.iter().all(|(id, _, _)| *id != d.taskbar));
    }

    #[test]
    fn taskbar_click_restores_minimized_window() {
        let mut d = test_desktop(640, 480);
        let root = d.ws.root();
        let a = d
            .ws
            .create_window(root, 10, 10, 100, 100, WindowFlags::empty(), "app");
        d.ws.minimize(a);
        assert!(d.ws.win(a).flags.contains(WindowFlags::MINIMIZED));

        // Click the first taskbar entry.
        taskbar_mousedown(&mut d.ws, d.taskbar, 10, 10);
        assert!(!d.ws.win(a).flags.contains(WindowFlags::MINIMIZED));
    }

    #[test]
    fn paint_covers_the_screen() {
        let mut d = test_desktop(64, 64);
        let root = d.ws.root();
        d.ws.paint(root, None, true);
        assert_eq!(d.ws.context.pixel(0, 0), Some(DESKTOP_COLOR));
        // Bottom rows belong to the taskbar.
        assert_eq!(d.ws.context.pixel(0, 63), Some(TASKBAR_COLOR));
    }
}
