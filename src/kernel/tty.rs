//! TTY (pseudo-terminal) subsystem
//!
//! One pty with two bounded ring buffers:
//! - input: cooked bytes waiting for programs to read
//! - output: what the terminal displays (program output plus echo)
//!
//! Keystrokes written to the input side pass through a small line
//! discipline. In canonical mode they are collected into a line buffer and
//! only reach the input ring when the line is completed.

use super::errno::{SyscallError, SyscallResult};
use std::collections::VecDeque;

/// Longest line the canonical line buffer holds
pub const MAX_LINE: usize = 1024;

const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;
const KILL_LINE: u8 = 0x15; // Ctrl-U
const TAB: u8 = b'\t';
const ERASE_ECHO: &[u8] = b"\x08 \x08";
const TAB_ECHO: &[u8] = b"    ";

/// Bounded byte FIFO
#[derive(Debug)]
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append as much of `bytes` as fits; returns the count accepted
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend(&bytes[..n]);
        n
    }

    /// Remove up to `count` bytes from the front
    pub fn drain(&mut self, count: usize) -> Vec<u8> {
        let n = count.min(self.data.len());
        self.data.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Terminal mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtyMode(pub u32);

impl TtyMode {
    pub const RAW: u32 = 0x1;
    pub const ECHO: u32 = 0x2;
    pub const CANON: u32 = 0x4;

    const KNOWN: u32 = Self::RAW | Self::ECHO | Self::CANON;

    pub fn from_bits(bits: u32) -> SyscallResult<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(TtyMode(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Line editing is active; raw overrides canonical
    pub fn canonical(self) -> bool {
        self.0 & Self::CANON != 0 && self.0 & Self::RAW == 0
    }

    pub fn echo(self) -> bool {
        self.0 & Self::ECHO != 0
    }
}

impl Default for TtyMode {
    fn default() -> Self {
        TtyMode(Self::CANON | Self::ECHO)
    }
}

/// Which ring buffer a read or write addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtySide {
    Input,
    Output,
}

/// Supported ioctl requests, Linux numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Get the mode bits
    Tcgets,
    /// Set the mode bits
    Tcsets,
    /// Flush queued data
    Tcflsh,
    /// Get the window size
    Tiocgwinsz,
    /// Set the window size
    Tiocswinsz,
    /// Bytes readable on the input side
    Fionread,
}

impl IoctlRequest {
    pub const TCGETS: u32 = 0x5401;
    pub const TCSETS: u32 = 0x5402;
    pub const TCFLSH: u32 = 0x540B;
    pub const TIOCGWINSZ: u32 = 0x5413;
    pub const TIOCSWINSZ: u32 = 0x5414;
    pub const FIONREAD: u32 = 0x541B;

    pub fn from_u32(n: u32) -> Option<Self> {
        match n {
            Self::TCGETS => Some(IoctlRequest::Tcgets),
            Self::TCSETS => Some(IoctlRequest::Tcsets),
            Self::TCFLSH => Some(IoctlRequest::Tcflsh),
            Self::TIOCGWINSZ => Some(IoctlRequest::Tiocgwinsz),
            Self::TIOCSWINSZ => Some(IoctlRequest::Tiocswinsz),
            Self::FIONREAD => Some(IoctlRequest::Fionread),
            _ => None,
        }
    }

    pub fn num(self) -> u32 {
        match self {
            IoctlRequest::Tcgets => Self::TCGETS,
            IoctlRequest::Tcsets => Self::TCSETS,
            IoctlRequest::Tcflsh => Self::TCFLSH,
            IoctlRequest::Tiocgwinsz => Self::TIOCGWINSZ,
            IoctlRequest::Tiocswinsz => Self::TIOCSWINSZ,
            IoctlRequest::Fionread => Self::FIONREAD,
        }
    }
}

/// Terminal window size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Winsize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

#[derive(Debug)]
pub struct Pty {
    input: RingBuffer,
    output: RingBuffer,
    mode: TtyMode,
    line: Vec<u8>,
    winsize: Winsize,
}

impl Pty {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            input: RingBuffer::new(buffer_size),
            output: RingBuffer::new(buffer_size),
            mode: TtyMode::default(),
            line: Vec::new(),
            winsize: Winsize::default(),
        }
    }

    pub fn mode(&self) -> TtyMode {
        self.mode
    }

    pub fn winsize(&self) -> Winsize {
        self.winsize
    }

    /// Bytes of the line being edited
    pub fn pending_line(&self) -> &[u8] {
        &self.line
    }

    pub fn write(&mut self, side: TtySide, bytes: &[u8]) -> SyscallResult<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let written = match side {
            TtySide::Input if self.mode.canonical() => self.write_canonical(bytes),
            TtySide::Input => {
                let n = self.input.push(bytes);
                if self.mode.echo() {
                    self.output.push(&bytes[..n]);
                }
                n
            }
            TtySide::Output => self.output.push(bytes),
        };
        if written == 0 {
            return Err(SyscallError::WouldBlock);
        }
        Ok(written)
    }

    fn write_canonical(&mut self, bytes: &[u8]) -> usize {
        let mut consumed = 0;
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    if self.input.free() < self.line.len() + 1 {
                        break;
                    }
                    self.input.push(&self.line);
                    self.input.push(b"\n");
                    self.line.clear();
                    self.echo(b"\n");
                }
                BACKSPACE | DEL => {
                    if self.line.pop().is_some() {
                        self.echo(ERASE_ECHO);
                    }
                }
                KILL_LINE => {
                    for _ in 0..self.line.len() {
                        self.echo(ERASE_ECHO);
                    }
                    self.line.clear();
                }
                TAB => self.echo(TAB_ECHO),
                0x20..=0x7e | 0x80..=0xff => {
                    if self.line.len() < MAX_LINE {
                        self.line.push(byte);
                        self.echo(&[byte]);
                    }
                }
                // escape sequences and other control bytes
                _ => {}
            }
            consumed += 1;
        }
        consumed
    }

    fn echo(&mut self, bytes: &[u8]) {
        if self.mode.echo() {
            self.output.push(bytes);
        }
    }

    /// Drain up to `count` bytes; `WouldBlock` when nothing is queued
    pub fn read(&mut self, side: TtySide, count: usize) -> SyscallResult<Vec<u8>> {
        let ring = match side {
            TtySide::Input => &mut self.input,
            TtySide::Output => &mut self.output,
        };
        if count == 0 {
            return Ok(Vec::new());
        }
        if ring.is_empty() {
            return Err(SyscallError::WouldBlock);
        }
        Ok(ring.drain(count))
    }

    pub fn ioctl(&mut self, request: u32, arg: &[u8]) -> SyscallResult<Vec<u8>> {
        let request = IoctlRequest::from_u32(request).ok_or(SyscallError::InvalidArgument)?;
        match request {
            IoctlRequest::Tcgets => Ok(self.mode.bits().to_le_bytes().to_vec()),
            IoctlRequest::Tcsets => {
                let mode = TtyMode::from_bits(u32_arg(arg)?)?;
                self.set_mode(mode);
                Ok(Vec::new())
            }
            IoctlRequest::Tcflsh => {
                match u32_arg(arg)? {
                    0 => self.flush_input(),
                    1 => self.output.clear(),
                    2 => {
                        self.flush_input();
                        self.output.clear();
                    }
                    _ => return Err(SyscallError::InvalidArgument),
                }
                Ok(Vec::new())
            }
            IoctlRequest::Tiocgwinsz => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&self.winsize.rows.to_le_bytes());
                out.extend_from_slice(&self.winsize.cols.to_le_bytes());
                Ok(out)
            }
            IoctlRequest::Tiocswinsz => {
                let [r0, r1, c0, c1] = <[u8; 4]>::try_from(arg)
                    .map_err(|_| SyscallError::InvalidArgument)?;
                let rows = u16::from_le_bytes([r0, r1]);
                let cols = u16::from_le_bytes([c0, c1]);
                if rows == 0 || cols == 0 {
                    return Err(SyscallError::InvalidArgument);
                }
                self.winsize = Winsize { rows, cols };
                Ok(Vec::new())
            }
            IoctlRequest::Fionread => Ok((self.input.len() as u32).to_le_bytes().to_vec()),
        }
    }

    fn set_mode(&mut self, mode: TtyMode) {
        if self.mode.canonical() && !mode.canonical() && !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            let kept = self.input.push(&line);
            if kept < line.len() {
                log::debug!("tty: dropped {} pending bytes on mode change", line.len() - kept);
            }
        }
        log::debug!("tty mode {:#x} -> {:#x}", self.mode.bits(), mode.bits());
        self.mode = mode;
    }

    fn flush_input(&mut self) {
        self.input.clear();
        self.line.clear();
    }
}

fn u32_arg(arg: &[u8]) -> SyscallResult<u32> {
    <[u8; 4]>::try_from(arg)
        .map(u32::from_le_bytes)
        .map_err(|_| SyscallError::InvalidArgument)
}
