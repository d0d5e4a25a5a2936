//! The window tree.
//!
//! Windows live in an arena keyed by [`WindowId`]; parent/child links are
//! handles, so removal and traversal are cycle-free by construction. The
//! paint traversal computes each window's clip region by subtracting the
//! screen rectangles of the siblings above it in z-order, intersecting
//! with the dirty region when one is supplied, then letting children
//! carve their own areas out before the window's painter runs.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use bitflags::bitflags;

use crate::graphics::{Color, Context, Rect};

bitflags! {
    /// Window behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowFlags: u16 {
        const NODECORATION = 0x01;
        const MINIMIZED    = 0x02;
        const SHOULD_CLOSE = 0x04;
        const NO_DRAG      = 0x08;
        const NO_RESIZE    = 0x10;
        const FLOATING     = 0x20;
        const MAXIMIZED    = 0x40;
    }
}

/// Decoration metrics.
pub const TITLE_HEIGHT: i32 = 31;
pub const BORDER_WIDTH: i32 = 3;

/// Default size clamps.
pub const DEFAULT_MIN_WIDTH: i32 = 72;
pub const DEFAULT_MIN_HEIGHT: i32 = 16;
pub const DEFAULT_MAX_WIDTH: i32 = 4096;
pub const DEFAULT_MAX_HEIGHT: i32 = 4096;

/// Chrome colors.
pub const WIN_BGCOLOR: Color = 0xFFBBBBBB;
pub const WIN_TITLECOLOR: Color = 0xFFBE9270;
pub const WIN_TITLECOLOR_INACTIVE: Color = 0xFF908080;
pub const WIN_TEXTCOLOR: Color = 0xFFFFE0E0;
pub const WIN_BORDERCOLOR: Color = 0xFF000000;

/// Size of the resize grip in the lower-right corner.
const RESIZE_GRIP: i32 = 16;

/// Handle into the window arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowId(pub u32);

/// Painter callback: the context is already translated and clipped.
pub type PaintFn = fn(&mut WindowSystem, WindowId);
/// Mouse-down callback (window coordinates).
pub type MouseDownFn = fn(&mut WindowSystem, WindowId, i32, i32);
/// Key callback: `(key, mods, action)`.
pub type KeyFn = fn(&mut WindowSystem, WindowId, u8, u8, u8);
/// Tick callback.
pub type TickFn = fn(&mut WindowSystem, WindowId, u64);

/// One window.
pub struct Window {
    pub parent: Option<WindowId>,
    /// Position in the parent's coordinate space.
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub flags: WindowFlags,
    pub title: String,
    /// Children in creation order; z-order is the `index` field.
    pub children: Vec<WindowId>,
    /// Z-position among siblings (higher paints later, i.e. on top).
    pub index: u32,
    pub last_button_state: u8,

    pub min_width: i32,
    pub min_height: i32,
    pub max_width: i32,
    pub max_height: i32,

    /// Geometry to restore when un-maximizing.
    saved_geometry: (i32, i32, i32, i32),

    pub active_child: Option<WindowId>,
    pub drag_child: Option<WindowId>,
    dragging: bool,
    resizing: bool,
    drag_off_x: i32,
    drag_off_y: i32,

    pub paint_fn: Option<PaintFn>,
    pub mousedown_fn: Option<MouseDownFn>,
    pub key_fn: Option<KeyFn>,
    pub tick_fn: Option<TickFn>,
}

impl Window {
    fn new(x: i32, y: i32, width: i32, height: i32, flags: WindowFlags, title: &str) -> Self {
        Self {
            parent: None,
            x,
            y,
            width,
            height,
            flags,
            title: title.to_string(),
            children: Vec::new(),
            index: 0,
            last_button_state: 0,
            min_width: DEFAULT_MIN_WIDTH,
            min_height: DEFAULT_MIN_HEIGHT,
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            saved_geometry: (x, y, width, height),
            active_child: None,
            drag_child: None,
            dragging: false,
            resizing: false,
            drag_off_x: 0,
            drag_off_y: 0,
            paint_fn: None,
            mousedown_fn: None,
            key_fn: None,
            tick_fn: None,
        }
    }

    /// Renderable width inside the decoration.
    pub fn inner_width(&self) -> i32 {
        if self.flags.contains(WindowFlags::NODECORATION) {
            self.width
        } else {
            self.width - 2 * BORDER_WIDTH
        }
    }

    /// Renderable height inside the decoration.
    pub fn inner_height(&self) -> i32 {
        if self.flags.contains(WindowFlags::NODECORATION) {
            self.height
        } else {
            self.height - TITLE_HEIGHT - BORDER_WIDTH
        }
    }
}

/// The compositing window system: arena, root, drawing context.
pub struct WindowSystem {
    slots: Vec<Option<Window>>,
    pub context: Context,
    root: WindowId,
}

impl WindowSystem {
    /// Create the system with a fullscreen, undecorated root window.
    pub fn new(context: Context) -> Self {
        let (w, h) = (context.width(), context.height());
        let mut ws = Self {
            slots: Vec::new(),
            context,
            root: WindowId(0),
        };
        let root = ws.alloc(Window::new(0, 0, w, h, WindowFlags::NODECORATION, "desktop"));
        ws.root = root;
        ws
    }

    pub fn root(&self) -> WindowId {
        self.root
    }

    fn alloc(&mut self, window: Window) -> WindowId {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(window);
                return WindowId(i as u32);
            }
        }
        self.slots.push(Some(window));
        WindowId(self.slots.len() as u32 - 1)
    }

    /// Borrow a window; stale handles panic, they are a kernel bug.
    pub fn win(&self, id: WindowId) -> &Window {
        self.slots[id.0 as usize].as_ref().expect("stale window id")
    }

    pub fn win_mut(&mut self, id: WindowId) -> &mut Window {
        self.slots[id.0 as usize].as_mut().expect("stale window id")
    }

    pub fn is_live(&self, id: WindowId) -> bool {
        (id.0 as usize) < self.slots.len() && self.slots[id.0 as usize].is_some()
    }

    /// Create a window under `parent`; it becomes topmost and active.
    pub fn create_window(
        &mut self,
        parent: WindowId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        flags: WindowFlags,
        title: &str,
    ) -> WindowId {
        let mut window = Window::new(x, y, width, height, flags, title);
        window.parent = Some(parent);
        window.index = self.win(parent).children.len() as u32;
        let id = self.alloc(window);

        let parent_win = self.win_mut(parent);
        parent_win.children.push(id);
        parent_win.active_child = Some(id);
        id
    }

    /// Window position in screen coordinates.
    pub fn screen_pos(&self, id: WindowId) -> (i32, i32) {
        let mut x = 0;
        let mut y = 0;
        let mut at = Some(id);
        while let Some(current) = at {
            let w = self.win(current);
            x += w.x;
            y += w.y;
            at = w.parent;
        }
        (x, y)
    }

    /// Window rectangle in screen coordinates.
    pub fn screen_rect(&self, id: WindowId) -> Rect {
        let (x, y) = self.screen_pos(id);
        let w = self.win(id);
        Rect::from_xywh(x, y, w.width, w.height)
    }

    /// Siblings stacked above `id`: higher z among its own layer, plus
    /// every floating sibling when `id` is not floating itself.
    pub fn windows_above(&self, id: WindowId) -> Vec<WindowId> {
        let Some(parent) = self.win(id).parent else {
            return Vec::new();
        };
        let my_index = self.win(id).index;
        let my_floating = self.win(id).flags.contains(WindowFlags::FLOATING);

        self.win(parent)
            .children
            .iter()
            .copied()
            .filter(|&sib| sib != id)
            .filter(|&sib| {
                let s = self.win(sib);
                if s.flags.contains(WindowFlags::MINIMIZED) {
                    return false;
                }
                let sib_floating = s.flags.contains(WindowFlags::FLOATING);
                match (my_floating, sib_floating) {
                    (false, true) => true,
                    (true, false) => false,
                    _ => s.index > my_index,
                }
            })
            .collect()
    }

    /// Siblings stacked below `id`: the complement of
    /// [`windows_above`](Self::windows_above) among the visible siblings.
    pub fn windows_below(&self, id: WindowId) -> Vec<WindowId> {
        let Some(parent) = self.win(id).parent else {
            return Vec::new();
        };
        let above = self.windows_above(id);
        self.win(parent)
            .children
            .iter()
            .copied()
            .filter(|&sib| sib != id)
            .filter(|&sib| !self.win(sib).flags.contains(WindowFlags::MINIMIZED))
            .filter(|sib| !above.contains(sib))
            .collect()
    }

    /// Children of `id` in z-order (bottom first), split into the
    /// non-floating and floating layers.
    fn children_by_z(&self, id: WindowId, floating: bool) -> Vec<WindowId> {
        let mut list: Vec<WindowId> = self
            .win(id)
            .children
            .iter()
            .copied()
            .filter(|&c| self.win(c).flags.contains(WindowFlags::FLOATING) == floating)
            .collect();
        list.sort_by_key(|&c| self.win(c).index);
        list
    }

    // -----------------------------------------------------------------
    // Clipping and paint
    // -----------------------------------------------------------------

    /// Install `id`'s clip region into the context.
    ///
    /// Starts from the window rectangle (the inner rectangle when inside
    /// a recursion step and decorated), restricted by every ancestor,
    /// minus every sibling stacked above, intersected with the dirty
    /// region at the root.
    pub fn apply_bound_clipping(&mut self, id: WindowId, in_recursion: bool, dirty: Option<&[Rect]>) {
        let (sx, sy) = self.screen_pos(id);
        let w = self.win(id);
        let decorated = !w.flags.contains(WindowFlags::NODECORATION);
        let (width, height) = (w.width, w.height);
        let parent = w.parent;

        let rect = if decorated && in_recursion {
            Rect::from_xywh(
                sx + BORDER_WIDTH,
                sy + TITLE_HEIGHT,
                width - 2 * BORDER_WIDTH,
                height - TITLE_HEIGHT - BORDER_WIDTH,
            )
        } else {
            Rect::from_xywh(sx, sy, width, height)
        };

        let Some(parent) = parent else {
            // Root: seed with the dirty region or the window rect.
            match dirty {
                Some(dirty_rects) => {
                    for d in dirty_rects {
                        self.context.add_clip_rect(*d);
                    }
                    self.context.intersect_clip_rect(&rect);
                }
                None => self.context.add_clip_rect(rect),
            }
            return;
        };

        self.apply_bound_clipping(parent, true, dirty);
        self.context.intersect_clip_rect(&rect);

        for sibling in self.windows_above(id) {
            let sib_rect = self.screen_rect(sibling);
            self.context.subtract_clip_rect(&sib_rect);
        }
    }

    /// Paint `id` (and optionally its subtree) honoring the dirty region.
    pub fn paint(&mut self, id: WindowId, dirty: Option<&[Rect]>, paint_children: bool) {
        if self.win(id).flags.contains(WindowFlags::MINIMIZED) {
            return;
        }

        self.apply_bound_clipping(id, false, dirty);

        let (mut sx, mut sy) = self.screen_pos(id);
        let decorated = !self.win(id).flags.contains(WindowFlags::NODECORATION);

        if decorated {
            self.draw_border(id);
            sx += BORDER_WIDTH;
            sy += TITLE_HEIGHT;
            let w = self.win(id);
            let inner = Rect::from_xywh(sx, sy, w.inner_width(), w.inner_height());
            self.context.intersect_clip_rect(&inner);
        }

        // Children paint themselves: carve them out of our clip.
        for child in self.children_by_z(id, false) {
            let flags = self.win(child).flags;
            if flags.contains(WindowFlags::MINIMIZED) {
                continue;
            }
            let child_rect = self.screen_rect(child);
            self.context.subtract_clip_rect(&child_rect);
        }

        self.context.translate_x = sx;
        self.context.translate_y = sy;
        if let Some(painter) = self.win(id).paint_fn {
            painter(self, id);
        }
        self.context.clear_clip();
        self.context.translate_x = 0;
        self.context.translate_y = 0;

        if !paint_children {
            return;
        }

        // Non-floating children bottom-up, then the floating layer.
        for layer in [false, true] {
            for child in self.children_by_z(id, layer) {
                if let Some(dirty_rects) = dirty {
                    let child_rect = self.screen_rect(child);
                    if !dirty_rects.iter().any(|d| d.overlaps(&child_rect)) {
                        continue;
                    }
                }
                self.paint(child, dirty, true);
            }
        }
    }

    /// Draw the title bar, borders and widget buttons.
    fn draw_border(&mut self, id: WindowId) {
        let (sx, sy) = self.screen_pos(id);
        let (w, h, title, active) = {
            let win = self.win(id);
            let active = win
                .parent
                .map(|p| self.win(p).active_child == Some(id))
                .unwrap_or(true);
            (win.width, win.height, win.title.clone(), active)
        };

        let title_color = if active {
            WIN_TITLECOLOR
        } else {
            WIN_TITLECOLOR_INACTIVE
        };

        let ctx = &mut self.context;
        // Outer border.
        ctx.draw_rect(sx, sy, w, h, WIN_BORDERCOLOR);
        ctx.draw_rect(sx + 1, sy + 1, w - 2, h - 2, WIN_BORDERCOLOR);
        ctx.draw_rect(sx + 2, sy + 2, w - 4, h - 4, WIN_BORDERCOLOR);
        // Title bar.
        ctx.fill_rect(
            sx + BORDER_WIDTH,
            sy + BORDER_WIDTH,
            w - 2 * BORDER_WIDTH,
            TITLE_HEIGHT - 2 * BORDER_WIDTH,
            title_color,
        );
        ctx.draw_text(&title, sx + 8, sy + 10, WIN_TEXTCOLOR);
        // Widgets, right to left: close, maximize, minimize.
        ctx.fill_rect(sx + w - 24, sy + 8, 16, 16, WIN_BORDERCOLOR);
        ctx.fill_rect(sx + w - 48, sy + 8, 16, 16, WIN_BORDERCOLOR);
        ctx.fill_rect(sx + w - 72, sy + 8, 16, 16, WIN_BORDERCOLOR);
        // Bottom title-bar separator.
        ctx.horizontal_line(
            sx + BORDER_WIDTH,
            sy + TITLE_HEIGHT - 1,
            w - 2 * BORDER_WIDTH,
            WIN_BORDERCOLOR,
        );
    }

    // -----------------------------------------------------------------
    // Input routing
    // -----------------------------------------------------------------

    /// Route a mouse event through `id`'s children (coordinates relative
    /// to `id`).
    pub fn process_mouse(&mut self, id: WindowId, mx: i32, my: i32, buttons: u8) {
        let pressed = buttons != 0 && self.win(id).last_button_state == 0;

        // Floating layer first, topmost first; then the normal layer.
        'layers: for layer in [true, false] {
            let mut children = self.children_by_z(id, layer);
            children.reverse();
            for child in children {
                let (cx, cy, cw, ch, cflags) = {
                    let c = self.win(child);
                    (c.x, c.y, c.width, c.height, c.flags)
                };
                if cflags.contains(WindowFlags::MINIMIZED) {
                    continue;
                }
                if !(mx >= cx && mx < cx + cw && my >= cy && my < cy + ch) {
                    continue;
                }

                if pressed {
                    self.raise(child);

                    if !cflags.contains(WindowFlags::NODECORATION)
                        && my >= cy
                        && my < cy + TITLE_HEIGHT
                    {
                        // Widget bands in the title bar.
                        let in_band = my >= cy + 8 && my < cy + 24;
                        if in_band && mx >= cx + cw - 24 && mx < cx + cw - 8 {
                            self.request_close(child);
                            break 'layers;
                        } else if in_band && mx >= cx + cw - 48 && mx < cx + cw - 32 {
                            if cflags.contains(WindowFlags::MAXIMIZED) {
                                self.unmaximize(child);
                            } else {
                                self.maximize(child);
                            }
                            break 'layers;
                        } else if in_band && mx >= cx + cw - 72 && mx < cx + cw - 56 {
                            self.minimize(child);
                            break 'layers;
                        } else if !self.win(child).flags.contains(WindowFlags::NO_DRAG) {
                            // Anywhere else on the decoration drags.
                            let me = self.win_mut(id);
                            me.dragging = true;
                            me.drag_off_x = mx - cx;
                            me.drag_off_y = my - cy;
                            me.drag_child = Some(child);
                            break 'layers;
                        }
                    }

                    // Lower-right grip starts a resize.
                    if !cflags.contains(WindowFlags::NODECORATION)
                        && !cflags.contains(WindowFlags::NO_RESIZE)
                        && mx >= cx + cw - RESIZE_GRIP
                        && mx < cx + cw
                        && my >= cy + ch - RESIZE_GRIP
                        && my < cy + ch
                    {
                        let me = self.win_mut(id);
                        me.resizing = true;
                        me.drag_off_x = mx - cw;
                        me.drag_off_y = my - ch;
                        me.drag_child = Some(child);
                        break 'layers;
                    }
                }

                self.process_mouse(child, mx - cx, my - cy, buttons);
                break 'layers;
            }
        }
        // Button release ends any drag or resize.
        if buttons == 0 {
            let me = self.win_mut(id);
            me.dragging = false;
            me.resizing = false;
            me.drag_child = None;
        }

        let (drag_child, dragging, resizing, off_x, off_y) = {
            let me = self.win(id);
            (me.drag_child, me.dragging, me.resizing, me.drag_off_x, me.drag_off_y)
        };
        if let Some(child) = drag_child {
            if dragging {
                self.move_window(child, mx - off_x, my - off_y);
            } else if resizing {
                self.resize(child, mx - off_x, my - off_y);
            }
        }

        if pressed {
            if let Some(handler) = self.win(id).mousedown_fn {
                handler(self, id, mx, my);
            }
        }
        self.win_mut(id).last_button_state = buttons;
    }

    /// Key events run down the active-child path, deepest first.
    pub fn process_keyboard(&mut self, id: WindowId, key: u8, mods: u8, action: u8) {
        if let Some(active) = self.win(id).active_child {
            if self.is_live(active) {
                self.process_keyboard(active, key, mods, action);
            }
        }
        if let Some(handler) = self.win(id).key_fn {
            handler(self, id, key, mods, action);
        }
    }

    /// Tick events fan out to all descendants first, then locally.
    pub fn process_tick(&mut self, id: WindowId, ticks: u64) {
        let children = self.win(id).children.clone();
        for child in children {
            if self.is_live(child) {
                self.process_tick(child, ticks);
            }
        }
        if let Some(handler) = self.win(id).tick_fn {
            handler(self, id, ticks);
        }
    }

    // -----------------------------------------------------------------
    // Window operations
    // -----------------------------------------------------------------

    /// Bring a window to the top of its layer and make it active.
    pub fn raise(&mut self, id: WindowId) {
        let Some(parent) = self.win(id).parent else {
            return;
        };
        let my_index = self.win(id).index;

        // Every sibling above steps down one; the raised window takes the
        // top index.
        let siblings = self.win(parent).children.clone();
        let mut top = 0;
        for sib in &siblings {
            let s = self.win_mut(*sib);
            if s.index > my_index {
                s.index -= 1;
            }
            top = top.max(s.index);
        }
        self.win_mut(id).index = top.max(siblings.len() as u32 - 1);
        self.win_mut(parent).active_child = Some(id);
    }

    /// Move a window, clamped inside the parent, repainting the vacated
    /// and occupied areas.
    pub fn move_window(&mut self, id: WindowId, new_x: i32, new_y: i32) {
        let Some(parent) = self.win(id).parent else {
            return;
        };
        let old_rect = self.screen_rect(id);

        {
            let w = self.win_mut(id);
            w.x = new_x;
            w.y = new_y;
        }
        let new_rect = self.screen_rect(id);

        self.paint(parent, Some(&[old_rect, new_rect]), true);
    }

    /// Resize a window, clamped to its min/max bounds.
    pub fn resize(&mut self, id: WindowId, new_width: i32, new_height: i32) {
        let Some(parent) = self.win(id).parent else {
            return;
        };
        let old_rect = self.screen_rect(id);

        {
            let w = self.win_mut(id);
            w.width = new_width.clamp(w.min_width, w.max_width);
            w.height = new_height.clamp(w.min_height, w.max_height);
        }
        let new_rect = self.screen_rect(id);

        self.paint(parent, Some(&[old_rect, new_rect]), true);
    }

    /// Repaint one window-relative rectangle.
    pub fn invalidate(&mut self, id: WindowId, rect: Rect) {
        let (sx, sy) = self.screen_pos(id);
        let dirty = Rect::new(
            rect.left + sx,
            rect.top + sy,
            rect.right + sx,
            rect.bottom + sy,
        );
        self.paint(id, Some(&[dirty]), false);
    }

    /// Hide a window; the vacated area is repainted by the parent.
    pub fn minimize(&mut self, id: WindowId) {
        if self.win(id).flags.contains(WindowFlags::MINIMIZED) {
            return;
        }
        let rect = self.screen_rect(id);
        self.win_mut(id).flags |= WindowFlags::MINIMIZED;
        if let Some(parent) = self.win(id).parent {
            self.paint(parent, Some(&[rect]), true);
        }
    }

    /// Restore a minimized window.
    pub fn restore(&mut self, id: WindowId) {
        if !self.win(id).flags.contains(WindowFlags::MINIMIZED) {
            return;
        }
        self.win_mut(id).flags -= WindowFlags::MINIMIZED;
        self.raise(id);
        let rect = self.screen_rect(id);
        if let Some(parent) = self.win(id).parent {
            self.paint(parent, Some(&[rect]), true);
        }
    }

    /// Grow to fill the parent's inner area.
    pub fn maximize(&mut self, id: WindowId) {
        let Some(parent) = self.win(id).parent else {
            return;
        };
        if self.win(id).flags.contains(WindowFlags::MAXIMIZED) {
            return;
        }
        let (pw, ph) = {
            let p = self.win(parent);
            (p.inner_width(), p.inner_height())
        };
        {
            let w = self.win_mut(id);
            w.saved_geometry = (w.x, w.y, w.width, w.height);
            w.flags |= WindowFlags::MAXIMIZED;
            w.x = 0;
            w.y = 0;
            w.width = pw.min(w.max_width);
            w.height = ph.min(w.max_height);
        }
        self.paint(parent, None, true);
    }

    /// Return to the geometry saved at maximize.
    pub fn unmaximize(&mut self, id: WindowId) {
        let Some(parent) = self.win(id).parent else {
            return;
        };
        if !self.win(id).flags.contains(WindowFlags::MAXIMIZED) {
            return;
        }
        {
            let w = self.win_mut(id);
            let (x, y, width, height) = w.saved_geometry;
            w.flags -= WindowFlags::MAXIMIZED;
            w.x = x;
            w.y = y;
            w.width = width;
            w.height = height;
        }
        self.paint(parent, None, true);
    }

    /// Flag a window for removal; the desktop collects it at the top of
    /// the next mouse dispatch.
    pub fn request_close(&mut self, id: WindowId) {
        self.win_mut(id).flags |= WindowFlags::SHOULD_CLOSE;
    }

    /// Remove every window whose close was requested. Returns how many
    /// were removed.
    pub fn collect_closed(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let doomed = self.slots.iter().enumerate().find_map(|(i, slot)| {
                slot.as_ref().and_then(|w| {
                    w.flags
                        .contains(WindowFlags::SHOULD_CLOSE)
                        .then_some(WindowId(i as u32))
                })
            });
            match doomed {
                Some(id) => {
                    self.remove_window(id);
                    removed += 1;
                }
                None => break,
            }
        }
        removed
    }

    /// Remove a window and its whole subtree, repainting the vacated
    /// rectangle.
    pub fn remove_window(&mut self, id: WindowId) {
        let rect = self.screen_rect(id);
        let parent = self.win(id).parent;

        self.drop_subtree(id);

        if let Some(parent) = parent {
            {
                let p = self.win_mut(parent);
                p.children.retain(|&c| c != id);
                if p.active_child == Some(id) {
                    p.active_child = p.children.last().copied();
                }
                if p.drag_child == Some(id) {
                    p.drag_child = None;
                    p.dragging = false;
                    p.resizing = false;
                }
            }

            // Renormalize sibling z indices to 0..n.
            let mut siblings = self.win(parent).children.clone();
            siblings.sort_by_key(|&c| self.win(c).index);
            for (i, sib) in siblings.iter().enumerate() {
                self.win_mut(*sib).index = i as u32;
            }

            self.paint(parent, Some(&[rect]), true);
        }
    }

    fn drop_subtree(&mut self, id: WindowId) {
        let children = self.win(id).children.clone();
        for child in children {
            self.drop_subtree(child);
        }
        self.slots[id.0 as usize] = None;
    }

    // -----------------------------------------------------------------
    // Titles
    // -----------------------------------------------------------------

    /// Replace the title and repaint the title bar.
    pub fn set_title(&mut self, id: WindowId, title: &str) {
        self.win_mut(id).title = title.to_string();
        if !self.win(id).flags.contains(WindowFlags::NODECORATION) {
            let w = self.win(id);
            let bar = Rect::from_xywh(0, 0, w.width, TITLE_HEIGHT);
            self.invalidate(id, bar);
        }
    }

    /// Append to the title (shells building a prompt string).
    pub fn append_title(&mut self, id: WindowId, suffix: &str) {
        let mut title = self.win(id).title.clone();
        title.push_str(suffix);
        self.set_title(id, &title);
    }

    /// Count live windows (diagnostics and tests).
    pub fn window_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, vec};

    use super::*;

    fn test_system(w: i32, h: i32) -> WindowSystem {
        let buf = Box::leak(vec![0u32; (w * h) as usize].into_boxed_slice());
        let ctx = unsafe { Context::new(buf.as_mut_ptr(), w, h) };
        WindowSystem::new(ctx)
    }

    fn plain_window(ws: &mut WindowSystem, x: i32, y: i32, w: i32, h: i32) -> WindowId {
        let root = ws.root();
        ws.create_window(root, x, y, w, h, WindowFlags::NODECORATION, "w")
    }

    #[test]
    fn screen_position_accumulates_ancestors() {
        let mut ws = test_system(200, 200);
        let a = plain_window(&mut ws, 10, 20, 100, 100);
        let b = ws.create_window(a, 5, 6, 50, 50, WindowFlags::NODECORATION, "inner");
        assert_eq!(ws.screen_pos(b), (15, 26));
        assert_eq!(ws.screen_rect(b), Rect::from_xywh(15, 26, 50, 50));
    }

    #[test]
    fn paint_clip_rects_stay_inside_window_and_disjoint() {
        let mut ws = test_system(300, 300);
        let under = plain_window(&mut ws, 0, 0, 200, 200);
        let _over = plain_window(&mut ws, 50, 50, 100, 100);

        // Compute `under`'s clip with `over` stacked above it.
        ws.apply_bound_clipping(under, false, None);
        let rects = ws.context.clip_rects().to_vec();
        let bounds = ws.screen_rect(under);

        assert!(!rects.is_empty());
        for (i, r) in rects.iter().enumerate() {
            assert!(r.intersect(&bounds).map(|x| x == *r).unwrap_or(false),
                "clip rect {:?} escapes window bounds {:?}", r, bounds);
            for other in rects.iter().skip(i + 1) {
                assert!(!r.overlaps(other), "clip rects overlap: {:?} {:?}", r, other);
            }
        }
        // The covered area is the window minus the overlap with `over`.
        let total: i64 = rects.iter().map(Rect::area).sum();
        assert_eq!(total, 200 * 200 - 100 * 100);
        ws.context.clear_clip();
    }

    #[test]
    fn windows_above_respects_layers() {
        let mut ws = test_system(100, 100);
        let bottom = plain_window(&mut ws, 0, 0, 10, 10);
        let top = plain_window(&mut ws, 0, 0, 10, 10);
        let root = ws.root();
        let float = ws.create_window(
            root,
            0,
            0,
            10,
            10,
            WindowFlags::NODECORATION | WindowFlags::FLOATING,
            "f",
        );

        let above_bottom = ws.windows_above(bottom);
        assert!(above_bottom.contains(&top));
        assert!(above_bottom.contains(&float));
        let above_top = ws.windows_above(top);
        assert!(!above_top.contains(&bottom));
        assert!(above_top.contains(&float));
        // A floating window only sees higher floating siblings.
        assert!(ws.windows_above(float).is_empty());

        // Below is the complement among visible siblings.
        let below_top = ws.windows_below(top);
        assert!(below_top.contains(&bottom));
        assert!(!below_top.contains(&float));
        assert_eq!(ws.windows_below(float).len(), 2);
    }

    #[test]
    fn raise_reorders_z_indices() {
        let mut ws = test_system(100, 100);
        let a = plain_window(&mut ws, 0, 0, 10, 10);
        let b = plain_window(&mut ws, 0, 0, 10, 10);
        let c = plain_window(&mut ws, 0, 0, 10, 10);

        ws.raise(a);
        assert!(ws.win(a).index > ws.win(b).index);
        assert!(ws.win(a).index > ws.win(c).index);
        assert_eq!(ws.win(ws.root()).active_child, Some(a));
    }

    #[test]
    fn resize_clamps_to_min_and_max() {
        let mut ws = test_system(200, 200);
        let w = plain_window(&mut ws, 0, 0, 100, 100);
        ws.resize(w, 1, 1);
        assert_eq!(ws.win(w).width, DEFAULT_MIN_WIDTH);
        assert_eq!(ws.win(w).height, DEFAULT_MIN_HEIGHT);
        ws.resize(w, 100000, 100000);
        assert_eq!(ws.win(w).width, DEFAULT_MAX_WIDTH);
        assert_eq!(ws.win(w).height, DEFAULT_MAX_HEIGHT);
    }

    #[test]
    fn maximize_and_unmaximize_round_trip() {
        let mut ws = test_system(400, 300);
        let w = plain_window(&mut ws, 30, 40, 100, 80);
        ws.maximize(w);
        assert!(ws.win(w).flags.contains(WindowFlags::MAXIMIZED));
        assert_eq!(ws.win(w).x, 0);
        assert_eq!((ws.win(w).width, ws.win(w).height), (400, 300));
        ws.unmaximize(w);
        assert_eq!(
            (ws.win(w).x, ws.win(w).y, ws.win(w).width, ws.win(w).height),
            (30, 40, 100, 80)
        );
    }

    #[test]
    fn request_close_defers_until_collection() {
        let mut ws = test_system(100, 100);
        let w = plain_window(&mut ws, 0, 0, 50, 50);
        let child = ws.create_window(w, 0, 0, 10, 10, WindowFlags::NODECORATION, "c");
        ws.request_close(w);
        assert!(ws.is_live(w));

        let removed = ws.collect_closed();
        assert_eq!(removed, 1);
        assert!(!ws.is_live(w));
        assert!(!ws.is_live(child)); // subtree went with it
        assert!(!ws.win(ws.root()).children.contains(&w));
    }

    #[test]
    fn mouse_press_raises_topmost_hit() {
        let mut ws = test_system(200, 200);
        let bottom = plain_window(&mut ws, 0, 0, 100, 100);
        let top = plain_window(&mut ws, 50, 50, 100, 100);

        // Click in the overlap: the topmost window wins.
        let root = ws.root();
        ws.process_mouse(root, 75, 75, 1);
        assert_eq!(ws.win(root).active_child, Some(top));
        ws.process_mouse(root, 75, 75, 0);

        // Click where only the bottom window is.
        ws.process_mouse(root, 10, 10, 1);
        assert_eq!(ws.win(root).active_child, Some(bottom));
        ws.process_mouse(root, 10, 10, 0);
    }

    #[test]
    fn decorated_drag_moves_window() {
        let mut ws = test_system(400, 400);
        let root = ws.root();
        let w = ws.create_window(root, 100, 100, 120, 90, WindowFlags::empty(), "drag me");

        // Press on the title bar (away from the widget bands), drag, release.
        ws.process_mouse(root, 110, 110, 1);
        ws.process_mouse(root, 160, 140, 1);
        ws.process_mouse(root, 160, 140, 0);

        assert_eq!(ws.win(w).x, 150);
        assert_eq!(ws.win(w).y, 130);
    }

    #[test]
    fn close_widget_marks_should_close() {
        let mut ws = test_system(400, 400);
        let root = ws.root();
        let w = ws.create_window(root, 100, 100, 120, 90, WindowFlags::empty(), "x");

        // Click in the close band: x in [w-24, w-8), y in [8, 24).
        ws.process_mouse(root, 100 + 120 - 16, 100 + 12, 1);
        assert!(ws.win(w).flags.contains(WindowFlags::SHOULD_CLOSE));
    }

    #[test]
    fn keyboard_routes_through_active_chain() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static SEEN: AtomicU32 = AtomicU32::new(0);

        fn leaf_key(_ws: &mut WindowSystem, _id: WindowId, key: u8, _m: u8, _a: u8) {
            SEEN.fetch_add(key as u32, Ordering::Relaxed);
        }

        let mut ws = test_system(100, 100);
        let a = plain_window(&mut ws, 0, 0, 50, 50);
        let b = ws.create_window(a, 0, 0, 10, 10, WindowFlags::NODECORATION, "leaf");
        ws.win_mut(b).key_fn = Some(leaf_key);

        SEEN.store(0, Ordering::Relaxed);
        let root = ws.root();
        ws.process_keyboard(root, 7, 0, 1);
        assert_eq!(SEEN.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn tick_fans_out_to_descendants() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static TICKS: AtomicU32 = AtomicU32::new(0);

        fn on_tick(_ws: &mut WindowSystem, _id: WindowId, _t: u64) {
            TICKS.fetch_add(1, Ordering::Relaxed);
        }

        let mut ws = test_system(100, 100);
        let a = plain_window(&mut ws, 0, 0, 50, 50);
        let b = ws.create_window(a, 0, 0, 10, 10, WindowFlags::NODECORATION, "t");
        ws.win_mut(a).tick_fn = Some(on_tick);
        ws.win_mut(b).tick_fn = Some(on_tick);

        TICKS.store(0, Ordering::Relaxed);
        let root = ws.root();
        ws.process_tick(root, 1);
        assert_eq!(TICKS.load(Ordering::Relaxed), 2);
    }
}
