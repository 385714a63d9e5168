//! Binary frames written to a PTY bridge helper's stdin.
//!
//! `DATA` is `0x01`, a big-endian `u32` length and the payload; `RESIZE` is
//! `0x02` followed by big-endian `u16` cols and rows; `CLOSE` is the single
//! byte `0x03` and makes the bridge hang up its child.

use crate::envelope::PtySignal;

pub const OPCODE_DATA: u8 = 0x01;
pub const OPCODE_RESIZE: u8 = 0x02;
pub const OPCODE_CLOSE: u8 = 0x03;

const ETX: u8 = 0x03;
const EOT: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeFrame {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

impl BridgeFrame {
    /// Terminal-level effect of a `pty.signal` request.
    pub fn for_signal(signal: PtySignal) -> Self {
        match signal {
            PtySignal::Interrupt => BridgeFrame::Data(vec![ETX]),
            PtySignal::Eof => BridgeFrame::Data(vec![EOT]),
            PtySignal::Terminate => BridgeFrame::Close,
        }
    }

    /// Encodes the frame. Payloads longer than `u32::MAX` are split into
    /// several consecutive `DATA` frames.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BridgeFrame::Data(payload) => {
                let mut out = Vec::with_capacity(payload.len() + 5);
                let mut chunks = payload.chunks(u32::MAX as usize).peekable();
                if chunks.peek().is_none() {
                    out.push(OPCODE_DATA);
                    out.extend_from_slice(&0u32.to_be_bytes());
                }
                for chunk in chunks {
                    out.push(OPCODE_DATA);
                    out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
                    out.extend_from_slice(chunk);
                }
                out
            }
            BridgeFrame::Resize { cols, rows } => {
                let mut out = Vec::with_capacity(5);
                out.push(OPCODE_RESIZE);
                out.extend_from_slice(&cols.to_be_bytes());
                out.extend_from_slice(&rows.to_be_bytes());
                out
            }
            BridgeFrame::Close => vec![OPCODE_CLOSE],
        }
    }
}

/// Maps a bridge exit code back onto the child's fate: the bridge reports a
/// child killed by signal `n` as `128 + n`.
pub fn signal_from_exit_code(code: i32) -> Option<i32> {
    if (129..=128 + 64).contains(&code) {
        Some(code - 128)
    } else {
        None
    }
}

pub fn signal_name(signo: i32) -> String {
    let name = match signo {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => return format!("SIG{signo}"),
    };
    name.to_string()
}
