//! Window state and the per-window terminal emulator.

#![allow(dead_code)]

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::graphics::font::{self, CHAR_HEIGHT, CHAR_WIDTH};

pub type WindowId = u32;

/// Height of the title bar drawn above the window content.
pub const TITLE_BAR_HEIGHT: i32 = 20;

/// Close button geometry inside the title bar.
pub const CLOSE_BUTTON_SIZE: u32 = 14;

/// Default window background.
pub const DEFAULT_BG: u32 = 0xFF17_171A;

/// Default terminal foreground.
const DEFAULT_FG: u32 = 0xFFFF_FFFF;

/// Standard SGR palette (30-37).
const SGR_COLORS: [u32; 8] = [
    0xFF00_0000, 0xFFBB_0000, 0xFF00_BB00, 0xFFBB_BB00,
    0xFF00_00BB, 0xFFBB_00BB, 0xFF00_BBBB, 0xFFBB_BBBB,
];

/// Bright SGR palette (90-97).
const SGR_BRIGHT_COLORS: [u32; 8] = [
    0xFF55_5555, 0xFFFF_5555, 0xFF55_FF55, 0xFFFF_FF55,
    0xFF55_55FF, 0xFFFF_55FF, 0xFF55_FFFF, 0xFFFF_FFFF,
];

/// Escape-sequence parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Ground,
    Escape,
    Csi,
}

/// Terminal emulator state embedded in each window.
pub struct Terminal {
    cursor_x: u32,
    cursor_y: u32,
    fg_color: u32,
    esc_state: EscState,
    esc_buf: [u8; 32],
    esc_len: usize,
}

impl Terminal {
    fn new() -> Self {
        Self {
            cursor_x: 0,
            cursor_y: 0,
            fg_color: DEFAULT_FG,
            esc_state: EscState::Ground,
            esc_buf: [0; 32],
            esc_len: 0,
        }
    }

    pub fn cursor(&self) -> (u32, u32) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn fg_color(&self) -> u32 {
        self.fg_color
    }

    /// SGR: accumulate the digits in the parameter buffer and map to
    /// the palette. 0 (or no parameters) resets to white; 30-37 and
    /// 90-97 select colors; everything else is ignored.
    fn handle_sgr(&mut self) {
        if self.esc_len == 0 {
            self.fg_color = DEFAULT_FG;
            return;
        }

        let mut val: u32 = 0;
        for &b in &self.esc_buf[..self.esc_len] {
            if b.is_ascii_digit() {
                val = val * 10 + (b - b'0') as u32;
            }
        }

        if val == 0 {
            self.fg_color = DEFAULT_FG;
        } else if (30..=37).contains(&val) {
            self.fg_color = SGR_COLORS[(val - 30) as usize];
        } else if (90..=97).contains(&val) {
            self.fg_color = SGR_BRIGHT_COLORS[(val - 90) as usize];
        }
    }
}

/// A compositor window: back-buffer, decorations metadata and the
/// embedded terminal. The back-buffer is exclusively owned by the
/// compositor; user rendering goes through compositor calls.
pub struct Window {
    pub id: WindowId,
    pub owner_pid: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub z_order: u32,
    pub visible: bool,
    /// Protected windows draw no close button and cannot be closed
    pub protected: bool,
    pub buffer: Vec<u32>,
    pub bg_color: u32,
    pub title: String,
    pub term: Terminal,
}

impl Window {
    pub fn new(
        id: WindowId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        title: &str,
        owner_pid: u32,
        protected: bool,
    ) -> Self {
        // Titles are truncated at 63 bytes; non-ASCII bytes render as '?'
        let mut title_owned = String::new();
        for &b in title.as_bytes().iter().take(63) {
            title_owned.push(if b.is_ascii() { b as char } else { '?' });
        }

        Self {
            id,
            owner_pid,
            x,
            y,
            width,
            height,
            z_order: 0,
            visible: true,
            protected,
            buffer: vec![DEFAULT_BG; (width * height) as usize],
            bg_color: DEFAULT_BG,
            title: title_owned,
            term: Terminal::new(),
        }
    }

    /// Columns and rows of the embedded terminal.
    pub fn text_cols(&self) -> u32 {
        self.width / CHAR_WIDTH
    }

    pub fn text_rows(&self) -> u32 {
        self.height / CHAR_HEIGHT
    }

    /// Clipped solid rectangle into the back-buffer.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, color: u32) {
        crate::graphics::fill_rect(&mut self.buffer, self.width, self.height, x, y, w, h, color);
    }

    pub fn clear(&mut self) {
        let bg = self.bg_color;
        self.buffer.fill(bg);
    }

    /// Pointer hit test covering content plus the title bar band.
    pub fn hit(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && px < self.x + self.width as i32
            && py >= self.y - TITLE_BAR_HEIGHT
            && py < self.y + self.height as i32
    }

    /// Drag band: the title bar plus the top strip of the content.
    pub fn in_drag_band(&self, py: i32) -> bool {
        py < self.y + TITLE_BAR_HEIGHT
    }

    /// Close button rectangle in screen coordinates (top-right of the
    /// title bar). Meaningless for protected windows.
    pub fn close_button_rect(&self) -> (i32, i32, u32, u32) {
        (
            self.x + self.width as i32 - CLOSE_BUTTON_SIZE as i32 - 3,
            self.y - TITLE_BAR_HEIGHT + 3,
            CLOSE_BUTTON_SIZE,
            CLOSE_BUTTON_SIZE,
        )
    }

    pub fn close_button_hit(&self, px: i32, py: i32) -> bool {
        if self.protected {
            return false;
        }
        let (bx, by, bw, bh) = self.close_button_rect();
        px >= bx && px < bx + bw as i32 && py >= by && py < by + bh as i32
    }

    /// Feed a byte stream through the terminal emulator: printables
    /// fill character cells, control bytes move the cursor, and the
    /// CSI subset (`m`, `J`, `H`) is recognised. Reaching the bottom
    /// row scrolls the back-buffer up one text line.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let cols = self.text_cols();
        let rows = self.text_rows();
        if cols == 0 || rows == 0 {
            return;
        }

        for &c in bytes {
            match self.term.esc_state {
                EscState::Ground => match c {
                    0x1B => {
                        self.term.esc_state = EscState::Escape;
                        self.term.esc_len = 0;
                    }
                    b'\n' => {
                        self.term.cursor_x = 0;
                        self.term.cursor_y += 1;
                        if self.term.cursor_y >= rows {
                            self.scroll_up();
                            self.term.cursor_y = rows - 1;
                        }
                    }
                    b'\r' => {
                        self.term.cursor_x = 0;
                    }
                    0x08 | 0x7F => {
                        if self.term.cursor_x > 0 {
                            self.term.cursor_x -= 1;
                        }
                    }
                    32..=126 => {
                        // Wrap and scroll lazily, so the freshly
                        // written row stays the bottom row
                        if self.term.cursor_x >= cols {
                            self.term.cursor_x = 0;
                            self.term.cursor_y += 1;
                        }
                        if self.term.cursor_y >= rows {
                            self.scroll_up();
                            self.term.cursor_y = rows - 1;
                        }
                        self.draw_cell(c);
                        self.term.cursor_x += 1;
                    }
                    _ => {}
                },
                EscState::Escape => {
                    self.term.esc_state = if c == b'[' { EscState::Csi } else { EscState::Ground };
                }
                EscState::Csi => {
                    if c.is_ascii_alphabetic() {
                        match c {
                            b'm' => self.term.handle_sgr(),
                            b'J' => {
                                self.clear();
                                self.term.cursor_x = 0;
                                self.term.cursor_y = 0;
                            }
                            b'H' => {
                                self.term.cursor_x = 0;
                                self.term.cursor_y = 0;
                            }
                            _ => {}
                        }
                        self.term.esc_state = EscState::Ground;
                    } else if self.term.esc_len < self.term.esc_buf.len() - 1 {
                        let len = self.term.esc_len;
                        self.term.esc_buf[len] = c;
                        self.term.esc_len += 1;
                    } else {
                        self.term.esc_state = EscState::Ground;
                    }
                }
            }
        }
    }

    /// Paint the character cell under the cursor: background first,
    /// then the glyph in the current foreground.
    fn draw_cell(&mut self, c: u8) {
        let cx = (self.term.cursor_x * CHAR_WIDTH) as i32;
        let cy = (self.term.cursor_y * CHAR_HEIGHT) as i32;
        let bg = self.bg_color;
        let fg = self.term.fg_color;

        self.fill_rect(cx, cy, CHAR_WIDTH, CHAR_HEIGHT, bg);
        font::draw_char(&mut self.buffer, self.width, self.height, cx, cy, c, fg);
    }

    /// Scroll the back-buffer up by one text line, clearing the
    /// freed bottom line.
    fn scroll_up(&mut self) {
        let line_pixels = (self.width * CHAR_HEIGHT) as usize;
        let total = self.buffer.len();
        if line_pixels >= total {
            return;
        }

        self.buffer.copy_within(line_pixels.., 0);

        let bg = self.bg_color;
        for p in &mut self.buffer[total - line_pixels..] {
            *p = bg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_window() -> Window {
        // 10 columns x 4 rows
        Window::new(1, 0, 0, 80, 64, "term", 2, false)
    }

    /// Reference render of one character cell.
    fn reference_cell(c: u8, fg: u32, bg: u32) -> Vec<u32> {
        let mut cell = vec![bg; (CHAR_WIDTH * CHAR_HEIGHT) as usize];
        font::draw_char(&mut cell, CHAR_WIDTH, CHAR_HEIGHT, 0, 0, c, fg);
        cell
    }

    /// Extract one character cell from the window back-buffer.
    fn window_cell(win: &Window, col: u32, row: u32) -> Vec<u32> {
        let mut cell = Vec::new();
        for dy in 0..CHAR_HEIGHT {
            let y = row * CHAR_HEIGHT + dy;
            let x = col * CHAR_WIDTH;
            let start = (y * win.width + x) as usize;
            cell.extend_from_slice(&win.buffer[start..start + CHAR_WIDTH as usize]);
        }
        cell
    }

    #[test]
    fn printables_advance_cursor_and_fill_cells() {
        let mut win = test_window();
        win.write_bytes(b"A\nB");

        assert_eq!(win.term.cursor(), (1, 1));
        assert_eq!(window_cell(&win, 0, 0), reference_cell(b'A', 0xFFFFFFFF, DEFAULT_BG));
        assert_eq!(window_cell(&win, 0, 1), reference_cell(b'B', 0xFFFFFFFF, DEFAULT_BG));
    }

    #[test]
    fn carriage_return_and_backspace_move_the_column() {
        let mut win = test_window();
        win.write_bytes(b"abc\r");
        assert_eq!(win.term.cursor(), (0, 0));

        win.write_bytes(b"xy\x08");
        assert_eq!(win.term.cursor(), (1, 0));
    }

    #[test]
    fn line_wrap_at_column_limit() {
        let mut win = test_window();
        win.write_bytes(b"0123456789X");
        assert_eq!(win.term.cursor(), (1, 1));
    }

    #[test]
    fn sgr_selects_palette_colors() {
        let mut win = test_window();

        win.write_bytes(b"\x1b[31m");
        assert_eq!(win.term.fg_color(), 0xFFBB0000);

        win.write_bytes(b"\x1b[92m");
        assert_eq!(win.term.fg_color(), 0xFF55FF55);

        win.write_bytes(b"\x1b[0m");
        assert_eq!(win.term.fg_color(), 0xFFFFFFFF);

        win.write_bytes(b"\x1b[m");
        assert_eq!(win.term.fg_color(), 0xFFFFFFFF);
    }

    #[test]
    fn csi_j_clears_and_homes() {
        let mut win = test_window();
        win.write_bytes(b"hello\x1b[J");

        assert_eq!(win.term.cursor(), (0, 0));
        assert!(win.buffer.iter().all(|&p| p == DEFAULT_BG));
    }

    #[test]
    fn csi_h_homes_without_clearing() {
        let mut win = test_window();
        win.write_bytes(b"Q\x1b[H");

        assert_eq!(win.term.cursor(), (0, 0));
        assert_eq!(window_cell(&win, 0, 0), reference_cell(b'Q', 0xFFFFFFFF, DEFAULT_BG));
    }

    #[test]
    fn unknown_escape_returns_to_ground() {
        let mut win = test_window();
        win.write_bytes(b"\x1bZA");
        // 'Z' cancels the sequence; 'A' prints normally
        assert_eq!(win.term.cursor(), (1, 0));
        assert_eq!(window_cell(&win, 0, 0), reference_cell(b'A', 0xFFFFFFFF, DEFAULT_BG));
    }

    #[test]
    fn overflow_scrolls_one_text_line() {
        let mut win = test_window();
        let cols = win.text_cols();
        let rows = win.text_rows();

        // 50 distinct printable characters through a 10x4 grid
        let chars: Vec<u8> = (0..cols * rows + cols).map(|i| 33 + (i % 90) as u8).collect();
        win.write_bytes(&chars);

        // Last row holds the most recent `cols` characters
        for col in 0..cols {
            let expected = chars[(cols * rows + col) as usize];
            assert_eq!(
                window_cell(&win, col, rows - 1),
                reference_cell(expected, 0xFFFFFFFF, DEFAULT_BG),
                "column {} of the last row",
                col
            );
        }

        // The first `cols` characters written have scrolled off: no
        // row renders that sequence any more
        for row in 0..rows {
            let mut matches_first_line = true;
            for col in 0..cols {
                if window_cell(&win, col, row) != reference_cell(chars[col as usize], 0xFFFFFFFF, DEFAULT_BG)
                {
                    matches_first_line = false;
                    break;
                }
            }
            assert!(!matches_first_line, "row {} still shows the first line", row);
        }

        assert_eq!(win.term.cursor(), (cols, rows - 1));
    }

    #[test]
    fn titles_truncate_at_63_bytes() {
        let long = "x".repeat(100);
        let win = Window::new(1, 0, 0, 64, 64, &long, 1, false);
        assert_eq!(win.title.len(), 63);
    }

    #[test]
    fn protected_windows_have_no_close_button() {
        let win = Window::new(1, 100, 100, 80, 64, "w", 1, true);
        let (bx, by, ..) = win.close_button_rect();
        assert!(!win.close_button_hit(bx + 1, by + 1));
    }
}
