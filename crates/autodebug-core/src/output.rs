//! Capture of debugger engine text output.
//!
//! The engine reports every chunk of text together with a mask describing what
//! kind of output it is. [`OutputCapture`] keeps the chunks whose mask matches
//! the session's accepted mask until the command that produced them finishes.

use std::ops::{BitOr, BitOrAssign};
use std::sync::{Mutex, PoisonError};

/// Output categories, bit-compatible with DbgEng's `DEBUG_OUTPUT_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputMask(u32);

impl OutputMask {
    pub const NONE: OutputMask = OutputMask(0);
    pub const NORMAL: OutputMask = OutputMask(0x1);
    pub const ERROR: OutputMask = OutputMask(0x2);
    pub const WARNING: OutputMask = OutputMask(0x4);
    pub const VERBOSE: OutputMask = OutputMask(0x8);
    pub const PROMPT: OutputMask = OutputMask(0x10);
    pub const PROMPT_REGISTERS: OutputMask = OutputMask(0x20);
    pub const EXTENSION_WARNING: OutputMask = OutputMask(0x40);
    pub const DEBUGGEE: OutputMask = OutputMask(0x80);
    pub const DEBUGGEE_PROMPT: OutputMask = OutputMask(0x100);
    pub const SYMBOLS: OutputMask = OutputMask(0x200);
    pub const STATUS: OutputMask = OutputMask(0x400);

    pub const fn from_bits(bits: u32) -> Self {
        OutputMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn intersects(self, other: OutputMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for OutputMask {
    /// Normal text plus symbol, error, warning and debuggee output.
    fn default() -> Self {
        OutputMask::NORMAL
            | OutputMask::SYMBOLS
            | OutputMask::ERROR
            | OutputMask::WARNING
            | OutputMask::DEBUGGEE
    }
}

impl BitOr for OutputMask {
    type Output = OutputMask;

    fn bitor(self, rhs: OutputMask) -> OutputMask {
        OutputMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for OutputMask {
    fn bitor_assign(&mut self, rhs: OutputMask) {
        self.0 |= rhs.0;
    }
}

/// Buffer collecting accepted engine output.
///
/// The engine may call back from any thread, so the buffer is guarded by a
/// mutex rather than borrowed mutably.
#[derive(Debug)]
pub struct OutputCapture {
    mask: OutputMask,
    buffer: Mutex<String>,
}

impl OutputCapture {
    pub fn new(mask: OutputMask) -> Self {
        Self {
            mask,
            buffer: Mutex::new(String::with_capacity(1024)),
        }
    }

    /// Append `text` if `mask` is one of the accepted categories.
    /// Returns whether the text was kept.
    pub fn accept(&self, mask: OutputMask, text: &str) -> bool {
        if !self.mask.intersects(mask) {
            return false;
        }
        self.push_str(text);
        true
    }

    /// Append text unconditionally.
    pub fn push_str(&self, text: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    /// Return everything captured so far and clear the buffer.
    pub fn take(&self) -> String {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new(OutputMask::default())
    }
}
