//! Keyboard input subsystem.
//!
//! Translates evdev scancodes from the virtio-input FIFO to ASCII (US
//! layout) with shift/ctrl/caps-lock state, and buffers the result in
//! a bounded FIFO with overwrite-oldest overflow.

#![allow(dead_code)]

use crate::drivers::virtio_input::{self, EV_KEY};
use crate::lib::ringbuf::RingBuffer;
use crate::sync::IrqSpinLock;

// Modifier and special key codes (evdev, US layout)
const KEY_LEFTCTRL: u16 = 29;
const KEY_LEFTSHIFT: u16 = 42;
const KEY_RIGHTSHIFT: u16 = 54;
const KEY_CAPSLOCK: u16 = 58;
const KEY_C: u16 = 46;

// Letter rows, for caps-lock handling
const KEY_Q: u16 = 16;
const KEY_P: u16 = 25;
const KEY_A: u16 = 30;
const KEY_L: u16 = 38;
const KEY_Z: u16 = 44;
const KEY_M: u16 = 50;

/// Scancode to ASCII (US layout, unshifted)
#[rustfmt::skip]
const SCANCODE_TO_ASCII: [u8; 128] = [
    0,    0,   b'1', b'2',  b'3',  b'4', b'5',  b'6',  // 0-7
    b'7', b'8', b'9', b'0', b'-',  b'=', 0x08,  b'\t', // 8-15
    b'q', b'w', b'e', b'r', b't',  b'y', b'u',  b'i',  // 16-23
    b'o', b'p', b'[', b']', b'\n', 0,    b'a',  b's',  // 24-31
    b'd', b'f', b'g', b'h', b'j',  b'k', b'l',  b';',  // 32-39
    b'\'', b'`', 0,  b'\\', b'z',  b'x', b'c',  b'v',  // 40-47
    b'b', b'n', b'm', b',', b'.',  b'/', 0,     b'*',  // 48-55
    0,    b' ', 0,   0,     0,     0,    0,     0,     // 56-63 (space at 57)
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 64-79
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 80-95
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 96-111
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 112-127
];

/// Scancode to ASCII (US layout, shifted)
#[rustfmt::skip]
const SCANCODE_TO_ASCII_SHIFT: [u8; 128] = [
    0,    0,   b'!', b'@',  b'#',  b'$', b'%',  b'^',  // 0-7
    b'&', b'*', b'(', b')', b'_',  b'+', 0x08,  b'\t', // 8-15
    b'Q', b'W', b'E', b'R', b'T',  b'Y', b'U',  b'I',  // 16-23
    b'O', b'P', b'{', b'}', b'\n', 0,    b'A',  b'S',  // 24-31
    b'D', b'F', b'G', b'H', b'J',  b'K', b'L',  b':',  // 32-39
    b'"', b'~', 0,   b'|',  b'Z',  b'X', b'C',  b'V',  // 40-47
    b'B', b'N', b'M', b'<', b'>',  b'?', 0,     b'*',  // 48-55
    0,    b' ', 0,   0,     0,     0,    0,     0,     // 56-63
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 64-79
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 80-95
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 96-111
    0, 0, 0, 0, 0, 0, 0, 0,  0, 0, 0, 0, 0, 0, 0, 0,  // 112-127
];

/// Modifier state plus the translated-character FIFO.
struct KeyboardState {
    shift_pressed: bool,
    ctrl_pressed: bool,
    caps_lock: bool,
    buffer: RingBuffer<u8, 256>,
}

impl KeyboardState {
    const fn new() -> Self {
        Self {
            shift_pressed: false,
            ctrl_pressed: false,
            caps_lock: false,
            buffer: RingBuffer::new(),
        }
    }

    /// Feed one key event (value: 0 = release, 1 = press, 2 = repeat).
    fn process_key(&mut self, code: u16, value: i32) {
        match code {
            KEY_LEFTSHIFT | KEY_RIGHTSHIFT => {
                self.shift_pressed = value != 0;
                return;
            }
            KEY_LEFTCTRL => {
                self.ctrl_pressed = value != 0;
                return;
            }
            KEY_CAPSLOCK => {
                if value == 1 {
                    self.caps_lock = !self.caps_lock;
                }
                return;
            }
            _ => {}
        }

        // Releases produce nothing
        if value == 0 {
            return;
        }

        // Ctrl-C becomes ETX
        if self.ctrl_pressed && code == KEY_C {
            self.buffer.push(0x03);
            return;
        }

        if code >= 128 {
            return;
        }

        // Caps lock applies to the letter rows only
        let mut use_shift = self.shift_pressed;
        if (KEY_Q..=KEY_P).contains(&code)
            || (KEY_A..=KEY_L).contains(&code)
            || (KEY_Z..=KEY_M).contains(&code)
        {
            use_shift ^= self.caps_lock;
        }

        let c = if use_shift {
            SCANCODE_TO_ASCII_SHIFT[code as usize]
        } else {
            SCANCODE_TO_ASCII[code as usize]
        };

        if c != 0 {
            self.buffer.push(c);
        }
    }
}

static KEYBOARD: IrqSpinLock<KeyboardState> = IrqSpinLock::new(KeyboardState::new());

pub fn init() {
    let mut kb = KEYBOARD.lock();
    *kb = KeyboardState::new();
    drop(kb);
    info!("Keyboard: initialized");
}

/// Drain pending raw input events through the translator.
fn poll() {
    let mut kb = KEYBOARD.lock();
    while let Some(event) = virtio_input::poll_event() {
        if event.ev_type == EV_KEY {
            kb.process_key(event.code, event.value);
        }
    }
}

/// True when a translated character is waiting.
pub fn has_input() -> bool {
    poll();
    !KEYBOARD.lock().buffer.is_empty()
}

/// Non-blocking read of one translated character.
pub fn read_char_nonblock() -> Option<u8> {
    poll();
    KEYBOARD.lock().buffer.pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(kb: &mut KeyboardState, code: u16) {
        kb.process_key(code, 1);
        kb.process_key(code, 0);
    }

    #[test]
    fn plain_letters_and_digits() {
        let mut kb = KeyboardState::new();
        press(&mut kb, 30); // a
        press(&mut kb, 2); // 1
        press(&mut kb, 57); // space

        assert_eq!(kb.buffer.pop(), Some(b'a'));
        assert_eq!(kb.buffer.pop(), Some(b'1'));
        assert_eq!(kb.buffer.pop(), Some(b' '));
        assert_eq!(kb.buffer.pop(), None);
    }

    #[test]
    fn shift_selects_upper_table() {
        let mut kb = KeyboardState::new();
        kb.process_key(KEY_LEFTSHIFT, 1);
        press(&mut kb, 30); // A
        press(&mut kb, 2); // !
        kb.process_key(KEY_LEFTSHIFT, 0);
        press(&mut kb, 30); // a

        assert_eq!(kb.buffer.pop(), Some(b'A'));
        assert_eq!(kb.buffer.pop(), Some(b'!'));
        assert_eq!(kb.buffer.pop(), Some(b'a'));
    }

    #[test]
    fn caps_lock_applies_only_to_letters() {
        let mut kb = KeyboardState::new();
        kb.process_key(KEY_CAPSLOCK, 1);
        kb.process_key(KEY_CAPSLOCK, 0);

        press(&mut kb, 30); // A (caps)
        press(&mut kb, 2); // 1, not !

        assert_eq!(kb.buffer.pop(), Some(b'A'));
        assert_eq!(kb.buffer.pop(), Some(b'1'));
    }

    #[test]
    fn caps_lock_plus_shift_lowers_letters() {
        let mut kb = KeyboardState::new();
        kb.process_key(KEY_CAPSLOCK, 1);
        kb.process_key(KEY_CAPSLOCK, 0);
        kb.process_key(KEY_LEFTSHIFT, 1);
        press(&mut kb, 30);

        assert_eq!(kb.buffer.pop(), Some(b'a'));
    }

    #[test]
    fn ctrl_c_produces_etx() {
        let mut kb = KeyboardState::new();
        kb.process_key(KEY_LEFTCTRL, 1);
        press(&mut kb, KEY_C);
        kb.process_key(KEY_LEFTCTRL, 0);

        assert_eq!(kb.buffer.pop(), Some(0x03));
    }

    #[test]
    fn releases_do_not_emit_characters() {
        let mut kb = KeyboardState::new();
        kb.process_key(30, 0);
        assert_eq!(kb.buffer.pop(), None);
    }

    #[test]
    fn fifo_overflow_drops_oldest() {
        let mut kb = KeyboardState::new();
        // The ring holds 255 characters; push 300 'a's then one 'b'
        for _ in 0..300 {
            kb.process_key(30, 1);
        }
        kb.process_key(48, 1); // b

        // The oldest entries fell off; the newest survives at the tail
        let mut last = 0;
        let mut count = 0;
        while let Some(c) = kb.buffer.pop() {
            last = c;
            count += 1;
        }
        assert_eq!(last, b'b');
        assert_eq!(count, 255);
    }
}
