//! Window compositor.
//!
//! Multiplexes per-process window back-buffers, z-order, pointer input
//! and the per-window terminal emulators into a single front-buffer,
//! which is pushed to the GPU scanout on every render.
//!
//! All state sits behind one coarse lock taken with IRQs masked: every
//! mutator (create, destroy, draw, write, move, close) and every
//! z-order reader goes through it.

#![allow(dead_code)]

pub mod window;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::graphics::{blend_pixel, font};
use crate::lib::error::Errno;
use crate::sync::IrqSpinLock;
use window::{Window, WindowId, TITLE_BAR_HEIGHT};

/// Window table capacity.
pub const MAX_WINDOWS: usize = 16;

/// The root process may draw into any window.
pub const ROOT_PID: u32 = 1;

/// Desktop gradient endpoints (see `render`).
const TITLE_BAR_COLOR: u32 = 0xFF18_181B;
const BORDER_COLOR: u32 = 0xFF27_272A;
const CLOSE_BUTTON_COLOR: u32 = 0xFFC4_3C3C;

/// Pointer cursor: 12x16, three pixel classes.
/// 'X' = outline, '.' = fill, ' ' = transparent.
#[rustfmt::skip]
const CURSOR_SHAPE: [&[u8; 12]; 16] = [
    b"X           ",
    b"XX          ",
    b"X.X         ",
    b"X..X        ",
    b"X...X       ",
    b"X....X      ",
    b"X.....X     ",
    b"X......X    ",
    b"X.......X   ",
    b"X........X  ",
    b"X.....XXXXX ",
    b"X..X..X     ",
    b"X.X X..X    ",
    b"XX  X..X    ",
    b"X    XX     ",
    b"     XX     ",
];

const CURSOR_OUTLINE: u32 = 0xFFFF_FFFF;
const CURSOR_FILL: u32 = 0xFF00_0000;

/// Pointer movement from the input pipeline. Absolute events may
/// update a single axis.
#[derive(Debug, Clone, Copy)]
pub enum PointerMove {
    Relative { dx: i32, dy: i32 },
    Absolute { x: Option<i32>, y: Option<i32> },
}

struct DragState {
    window_id: WindowId,
    off_x: i32,
    off_y: i32,
}

/// Compositor state. Kept as a plain struct so tests can drive an
/// instance directly; the kernel uses the global behind the lock.
pub struct Compositor {
    windows: Vec<Window>,
    next_id: WindowId,
    pointer_x: i32,
    pointer_y: i32,
    drag: Option<DragState>,
    screen_w: u32,
    screen_h: u32,
    front: Vec<u32>,
}

impl Compositor {
    pub fn new(screen_w: u32, screen_h: u32) -> Self {
        Self {
            windows: Vec::new(),
            next_id: 1,
            pointer_x: (screen_w / 2) as i32,
            pointer_y: (screen_h / 2) as i32,
            drag: None,
            screen_w,
            screen_h,
            front: vec![0; (screen_w * screen_h) as usize],
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn pointer(&self) -> (i32, i32) {
        (self.pointer_x, self.pointer_y)
    }

    fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.iter().find(|w| w.id == id)
    }

    fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// Create a window owned by `pid`. The z-order of a new window is
    /// the current window count (on top).
    pub fn create_window(
        &mut self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        title: &str,
        pid: u32,
        protected: bool,
    ) -> Result<WindowId, Errno> {
        if self.windows.len() >= MAX_WINDOWS {
            warn!("compositor: window table full");
            return Err(Errno::ENOSPC);
        }
        if width == 0 || height == 0 {
            return Err(Errno::EINVAL);
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut win = Window::new(id, x, y, width, height, title, pid, protected);
        win.z_order = self.windows.len() as u32;
        self.windows.push(win);

        info!(
            "compositor: created window '{}' ({}x{}) at ({},{}) for pid {}",
            title, width, height, x, y, pid
        );
        Ok(id)
    }

    pub fn destroy_window(&mut self, id: WindowId) {
        if let Some(pos) = self.windows.iter().position(|w| w.id == id) {
            self.windows.remove(pos);
        }
        if self
            .drag
            .as_ref()
            .is_some_and(|d| d.window_id == id)
        {
            self.drag = None;
        }
    }

    /// First window owned by `pid`.
    pub fn window_by_pid(&self, pid: u32) -> Option<WindowId> {
        self.windows.iter().find(|w| w.owner_pid == pid).map(|w| w.id)
    }

    /// Validated rectangle draw into a window back-buffer. The caller
    /// must own the window; the root process is privileged.
    /// Unauthorised draws are dropped and logged.
    pub fn draw_rect(
        &mut self,
        id: WindowId,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        color: u32,
        caller_pid: u32,
    ) -> Result<(), Errno> {
        let Some(win) = self.window_mut(id) else {
            return Err(Errno::ENOENT);
        };

        if win.owner_pid != caller_pid && caller_pid != ROOT_PID {
            warn!(
                "compositor: pid {} denied draw on window {} (owner {})",
                caller_pid, id, win.owner_pid
            );
            return Err(Errno::EPERM);
        }

        win.fill_rect(x, y, w, h, color);
        Ok(())
    }

    /// Forward bytes to a window's terminal emulator.
    pub fn window_write(&mut self, id: WindowId, bytes: &[u8]) {
        if let Some(win) = self.window_mut(id) {
            win.write_bytes(bytes);
        }
    }

    /// Pointer motion: clamp to the screen and, mid-drag, reposition
    /// the dragged window.
    pub fn pointer_update(&mut self, movement: PointerMove) {
        match movement {
            PointerMove::Relative { dx, dy } => {
                self.pointer_x += dx;
                self.pointer_y += dy;
            }
            PointerMove::Absolute { x, y } => {
                if let Some(x) = x {
                    self.pointer_x = x;
                }
                if let Some(y) = y {
                    self.pointer_y = y;
                }
            }
        }

        self.pointer_x = self.pointer_x.clamp(0, self.screen_w as i32 - 1);
        self.pointer_y = self.pointer_y.clamp(0, self.screen_h as i32 - 1);

        if let Some(drag) = &self.drag {
            let id = drag.window_id;
            let nx = self.pointer_x - drag.off_x;
            let mut ny = self.pointer_y - drag.off_y;
            // Keep the title bar reachable
            if ny < 0 {
                ny = 0;
            }
            if let Some(win) = self.window_mut(id) {
                win.x = nx;
                win.y = ny;
            }
        }
    }

    /// Button handling: press finds the top-most hit window (title bar
    /// included), raises it, then either closes it (close-button hit
    /// on an unprotected window) or starts a drag from the title band.
    /// Release ends any drag.
    pub fn handle_click(&mut self, pressed: bool) {
        if !pressed {
            self.drag = None;
            return;
        }

        let (px, py) = (self.pointer_x, self.pointer_y);

        let hit_id = self
            .windows
            .iter()
            .filter(|w| w.visible && w.hit(px, py))
            .max_by_key(|w| w.z_order)
            .map(|w| w.id);

        let Some(id) = hit_id else {
            return;
        };

        self.raise_window(id);

        let (close_hit, drag_band, wx, wy) = {
            let win = self.window(id).unwrap();
            (
                win.close_button_hit(px, py),
                win.in_drag_band(py),
                win.x,
                win.y,
            )
        };

        if close_hit {
            info!("compositor: window {} closed", id);
            self.destroy_window(id);
            return;
        }

        if drag_band {
            self.drag = Some(DragState {
                window_id: id,
                off_x: px - wx,
                off_y: py - wy,
            });
        }
    }

    /// Raise a window above all others.
    fn raise_window(&mut self, id: WindowId) {
        let top = self.windows.iter().map(|w| w.z_order).max().unwrap_or(0);
        if let Some(win) = self.window_mut(id) {
            win.z_order = top + 1;
        }
    }

    /// Owner of the top-most visible window, if any.
    pub fn focus_pid(&self) -> Option<u32> {
        self.windows
            .iter()
            .filter(|w| w.visible)
            .max_by_key(|w| w.z_order)
            .map(|w| w.owner_pid)
    }

    /// Composite everything into the front-buffer: gradient desktop,
    /// windows in ascending z-order (decorations, then alpha-blended
    /// content), pointer cursor on top.
    pub fn compose(&mut self) {
        let (sw, sh) = (self.screen_w, self.screen_h);

        // Desktop background: vertical blue gradient
        for y in 0..sh {
            let g = 40 + y * 40 / sh;
            let b = 80 + y * 80 / sh;
            let color = 0xFF00_0000 | (20 << 16) | (g << 8) | b;
            let row = (y * sw) as usize;
            self.front[row..row + sw as usize].fill(color);
        }

        let mut order: Vec<usize> = (0..self.windows.len())
            .filter(|&i| self.windows[i].visible)
            .collect();
        order.sort_by_key(|&i| self.windows[i].z_order);

        for i in order {
            self.compose_window(i);
        }

        self.draw_cursor();
    }

    fn compose_window(&mut self, index: usize) {
        let (sw, sh) = (self.screen_w as i32, self.screen_h as i32);

        // Decorations first: title bar, border, close button, title
        {
            let win = &self.windows[index];
            let (wx, wy, ww, wh) = (win.x, win.y, win.width as i32, win.height as i32);
            let protected = win.protected;

            crate::graphics::fill_rect(
                &mut self.front,
                self.screen_w,
                self.screen_h,
                wx - 1,
                wy - TITLE_BAR_HEIGHT,
                (ww + 2) as u32,
                TITLE_BAR_HEIGHT as u32,
                TITLE_BAR_COLOR,
            );

            // Border: one pixel around content and title bar
            for y in (wy - TITLE_BAR_HEIGHT - 1)..=(wy + wh) {
                if y < 0 || y >= sh {
                    continue;
                }
                for x in [wx - 1, wx + ww] {
                    if x >= 0 && x < sw {
                        self.front[(y as u32 * self.screen_w + x as u32) as usize] = BORDER_COLOR;
                    }
                }
            }
            for x in (wx - 1)..=(wx + ww) {
                if x < 0 || x >= sw {
                    continue;
                }
                for y in [wy - TITLE_BAR_HEIGHT - 1, wy + wh] {
                    if y >= 0 && y < sh {
                        self.front[(y as u32 * self.screen_w + x as u32) as usize] = BORDER_COLOR;
                    }
                }
            }

            // Centred title
            let title_px = (win.title.len() as i32) * font::CHAR_WIDTH as i32;
            let tx = wx + (ww - title_px) / 2;
            let ty = wy - TITLE_BAR_HEIGHT + 2;
            font::draw_text(
                &mut self.front,
                self.screen_w,
                self.screen_h,
                tx,
                ty,
                &self.windows[index].title,
                0xFFFF_FFFF,
            );

            if !protected {
                let (bx, by, bw, bh) = self.windows[index].close_button_rect();
                crate::graphics::fill_rect(
                    &mut self.front,
                    self.screen_w,
                    self.screen_h,
                    bx,
                    by,
                    bw,
                    bh,
                    CLOSE_BUTTON_COLOR,
                );
                font::draw_char(
                    &mut self.front,
                    self.screen_w,
                    self.screen_h,
                    bx + (bw as i32 - font::CHAR_WIDTH as i32) / 2,
                    by - 1,
                    b'x',
                    0xFFFF_FFFF,
                );
            }
        }

        // Alpha-blend the back-buffer onto the front-buffer
        let win = &self.windows[index];
        for wy_off in 0..win.height as i32 {
            let py = win.y + wy_off;
            if py < 0 || py >= sh {
                continue;
            }
            for wx_off in 0..win.width as i32 {
                let px = win.x + wx_off;
                if px < 0 || px >= sw {
                    continue;
                }
                let src = win.buffer[(wy_off as u32 * win.width + wx_off as u32) as usize];
                let dst_idx = (py as u32 * self.screen_w + px as u32) as usize;
                self.front[dst_idx] = blend_pixel(src, self.front[dst_idx]);
            }
        }
    }

    fn draw_cursor(&mut self) {
        let (sw, sh) = (self.screen_w as i32, self.screen_h as i32);

        for (dy, row) in CURSOR_SHAPE.iter().enumerate() {
            let py = self.pointer_y + dy as i32;
            if py < 0 || py >= sh {
                continue;
            }
            for (dx, &class) in row.iter().enumerate() {
                let px = self.pointer_x + dx as i32;
                if px < 0 || px >= sw {
                    continue;
                }
                let color = match class {
                    b'X' => CURSOR_OUTLINE,
                    b'.' => CURSOR_FILL,
                    _ => continue,
                };
                self.front[(py as u32 * self.screen_w + px as u32) as usize] = color;
            }
        }
    }

    /// Read access to a window's back-buffer (test instrumentation and
    /// the focus-follows diagnostics).
    pub fn with_window<R>(&self, id: WindowId, f: impl FnOnce(&Window) -> R) -> Option<R> {
        self.window(id).map(f)
    }
}

lazy_static::lazy_static! {
    static ref COMPOSITOR: IrqSpinLock<Compositor> = IrqSpinLock::new(Compositor::new(
        crate::drivers::virtio_gpu::DEFAULT_WIDTH,
        crate::drivers::virtio_gpu::DEFAULT_HEIGHT,
    ));
}

/// Renders completed since boot; input batches use this to coalesce.
static RENDER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Initialize the compositor against the active GPU mode.
pub fn init() {
    let (w, h) = crate::drivers::virtio_gpu::resolution();
    let mut comp = COMPOSITOR.lock();
    *comp = Compositor::new(w, h);
    drop(comp);
    info!("compositor: initialized {}x{}", w, h);
}

pub fn create_window(
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    title: &str,
    pid: u32,
) -> Result<WindowId, Errno> {
    COMPOSITOR
        .lock()
        .create_window(x, y, width, height, title, pid, false)
}

/// Create a window that draws no close button and cannot be closed
/// from the pointer (e.g. the root splash surface).
pub fn create_protected_window(
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    title: &str,
    pid: u32,
) -> Result<WindowId, Errno> {
    COMPOSITOR
        .lock()
        .create_window(x, y, width, height, title, pid, true)
}

pub fn destroy_window(id: WindowId) {
    COMPOSITOR.lock().destroy_window(id);
}

pub fn window_by_pid(pid: u32) -> Option<WindowId> {
    COMPOSITOR.lock().window_by_pid(pid)
}

pub fn draw_rect(
    id: WindowId,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    color: u32,
    caller_pid: u32,
) -> Result<(), Errno> {
    COMPOSITOR.lock().draw_rect(id, x, y, w, h, color, caller_pid)
}

pub fn window_write(id: WindowId, bytes: &[u8]) {
    COMPOSITOR.lock().window_write(id, bytes);
    render();
}

pub fn pointer_update(movement: PointerMove) {
    COMPOSITOR.lock().pointer_update(movement);
}

pub fn handle_click(pressed: bool) {
    COMPOSITOR.lock().handle_click(pressed);
}

pub fn focus_pid() -> Option<u32> {
    COMPOSITOR.lock().focus_pid()
}

/// Composite and push the frame to the GPU.
pub fn render() {
    let mut comp = COMPOSITOR.lock();
    comp.compose();
    // Present failures (e.g. GPU gone) are logged by the driver layer;
    // the compositor state remains consistent regardless.
    let _ = crate::drivers::virtio_gpu::present(&comp.front);
    RENDER_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn render_count() -> u64 {
    RENDER_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::window::DEFAULT_BG;
    use super::*;

    fn comp() -> Compositor {
        Compositor::new(800, 600)
    }

    #[test]
    fn created_window_is_registered_and_findable_by_pid() {
        let mut c = comp();
        let id = c.create_window(10, 20, 80, 40, "T", 2, false).unwrap();

        assert_eq!(c.window_count(), 1);
        assert_eq!(c.window_by_pid(2), Some(id));
        c.with_window(id, |w| {
            assert_eq!((w.x, w.y), (10, 20));
            assert_eq!((w.width, w.height), (80, 40));
            assert_eq!(w.title, "T");
            assert_eq!(w.owner_pid, 2);
        })
        .unwrap();
    }

    #[test]
    fn window_table_capacity_is_enforced() {
        let mut c = comp();
        for i in 0..MAX_WINDOWS {
            c.create_window(0, 0, 16, 16, "w", i as u32 + 2, false)
                .unwrap();
        }
        assert_eq!(
            c.create_window(0, 0, 16, 16, "overflow", 99, false),
            Err(Errno::ENOSPC)
        );
    }

    #[test]
    fn ids_stay_stable_as_slots_are_reused() {
        let mut c = comp();
        let a = c.create_window(0, 0, 16, 16, "a", 2, false).unwrap();
        let b = c.create_window(0, 0, 16, 16, "b", 3, false).unwrap();
        c.destroy_window(a);
        let d = c.create_window(0, 0, 16, 16, "d", 4, false).unwrap();

        assert_ne!(d, a);
        assert_ne!(d, b);
        assert_eq!(c.window_by_pid(3), Some(b));
    }

    #[test]
    fn unauthorized_draw_leaves_buffer_unchanged() {
        let mut c = comp();
        let w1 = c.create_window(0, 0, 32, 32, "p2", 2, false).unwrap();
        let w2 = c.create_window(0, 0, 32, 32, "p3", 3, false).unwrap();

        let before = c.with_window(w2, |w| w.buffer.clone()).unwrap();

        // pid 2 may not draw into pid 3's window
        assert_eq!(
            c.draw_rect(w2, 0, 0, 8, 8, 0xFFFF0000, 2),
            Err(Errno::EPERM)
        );
        let after = c.with_window(w2, |w| w.buffer.clone()).unwrap();
        assert_eq!(before, after);

        // The owner may
        c.draw_rect(w1, 0, 0, 8, 8, 0xFFFF0000, 2).unwrap();
        let own = c.with_window(w1, |w| w.buffer[0]).unwrap();
        assert_eq!(own, 0xFFFF0000);
    }

    #[test]
    fn root_pid_is_privileged() {
        let mut c = comp();
        let w = c.create_window(0, 0, 16, 16, "w", 5, false).unwrap();
        c.draw_rect(w, 0, 0, 4, 4, 0xFF00FF00, ROOT_PID).unwrap();
        assert_eq!(c.with_window(w, |w| w.buffer[0]).unwrap(), 0xFF00FF00);
    }

    #[test]
    fn click_raises_topmost_hit_window() {
        let mut c = comp();
        let a = c.create_window(50, 50, 100, 100, "a", 2, false).unwrap();
        let b = c.create_window(80, 80, 100, 100, "b", 3, false).unwrap();

        // Click in the overlap: b is on top, stays on top
        c.pointer_update(PointerMove::Absolute {
            x: Some(90),
            y: Some(120),
        });
        c.handle_click(true);
        c.handle_click(false);
        assert_eq!(c.focus_pid(), Some(3));

        // Click where only a is: a is raised
        c.pointer_update(PointerMove::Absolute {
            x: Some(55),
            y: Some(140),
        });
        c.handle_click(true);
        c.handle_click(false);
        assert_eq!(c.focus_pid(), Some(2));
        let za = c.with_window(a, |w| w.z_order).unwrap();
        let zb = c.with_window(b, |w| w.z_order).unwrap();
        assert!(za > zb);
    }

    #[test]
    fn title_bar_drag_moves_the_window() {
        let mut c = comp();
        let id = c.create_window(200, 200, 120, 80, "drag", 2, false).unwrap();

        // Press 5 pixels into the drag band, move, release
        c.pointer_update(PointerMove::Absolute {
            x: Some(205),
            y: Some(205),
        });
        c.handle_click(true);
        c.pointer_update(PointerMove::Absolute {
            x: Some(100),
            y: Some(200),
        });
        c.handle_click(false);

        c.with_window(id, |w| {
            assert_eq!((w.x, w.y), (95, 195));
        })
        .unwrap();
    }

    #[test]
    fn drag_stops_at_release() {
        let mut c = comp();
        let id = c.create_window(200, 200, 120, 80, "drag", 2, false).unwrap();

        c.pointer_update(PointerMove::Absolute {
            x: Some(205),
            y: Some(205),
        });
        c.handle_click(true);
        c.handle_click(false);

        // Motion after release must not move the window
        c.pointer_update(PointerMove::Relative { dx: 50, dy: 50 });
        c.with_window(id, |w| assert_eq!((w.x, w.y), (200, 200)))
            .unwrap();
    }

    #[test]
    fn close_button_destroys_unprotected_window() {
        let mut c = comp();
        let id = c.create_window(100, 100, 120, 80, "doomed", 2, false).unwrap();

        let (bx, by, ..) = c.with_window(id, |w| w.close_button_rect()).unwrap();
        c.pointer_update(PointerMove::Absolute {
            x: Some(bx + 2),
            y: Some(by + 2),
        });
        c.handle_click(true);

        assert_eq!(c.window_count(), 0);
        assert_eq!(c.window_by_pid(2), None);
    }

    #[test]
    fn protected_window_survives_close_click() {
        let mut c = comp();
        let id = c
            .create_window(100, 100, 120, 80, "splash", 1, true)
            .unwrap();

        // Click where the close button would be
        c.pointer_update(PointerMove::Absolute {
            x: Some(100 + 120 - 8),
            y: Some(100 - TITLE_BAR_HEIGHT + 8),
        });
        c.handle_click(true);

        assert_eq!(c.window_count(), 1);
        assert_eq!(c.window_by_pid(1), Some(id));
    }

    #[test]
    fn pointer_clamps_to_screen() {
        let mut c = comp();
        c.pointer_update(PointerMove::Relative { dx: -5000, dy: -5000 });
        assert_eq!(c.pointer(), (0, 0));
        c.pointer_update(PointerMove::Absolute {
            x: Some(10_000),
            y: Some(10_000),
        });
        assert_eq!(c.pointer(), (799, 599));
    }

    #[test]
    fn focus_is_topmost_visible_window() {
        let mut c = comp();
        assert_eq!(c.focus_pid(), None);

        c.create_window(0, 40, 50, 50, "a", 2, false).unwrap();
        let b = c.create_window(10, 50, 50, 50, "b", 3, false).unwrap();
        assert_eq!(c.focus_pid(), Some(3));

        c.destroy_window(b);
        assert_eq!(c.focus_pid(), Some(2));
    }

    #[test]
    fn compose_blends_window_over_gradient() {
        let mut c = comp();
        let id = c.create_window(100, 100, 32, 32, "w", 2, false).unwrap();
        c.draw_rect(id, 0, 0, 32, 32, 0xFFAB_CDEF, 2).unwrap();
        c.compose();

        // Window content is opaque: the front-buffer carries it verbatim
        let idx = (100u32 * 800 + 100) as usize;
        assert_eq!(c.front[idx], 0xFFAB_CDEF);

        // Far corner is still desktop gradient (blue-ish, opaque)
        let corner = c.front[(599u32 * 800 + 780) as usize];
        assert_eq!(corner >> 24, 0xFF);
        assert_ne!(corner, 0xFFAB_CDEF);
    }

    #[test]
    fn new_window_back_buffer_is_background_filled() {
        let mut c = comp();
        let id = c.create_window(0, 0, 16, 16, "w", 2, false).unwrap();
        c.with_window(id, |w| {
            assert!(w.buffer.iter().all(|&p| p == DEFAULT_BG));
        })
        .unwrap();
    }
}
