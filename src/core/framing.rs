//! Line framing for serial byte streams
//!
//! Boards write unstructured bytes; the session read loop reassembles them
//! into terminator-delimited lines with [`LineFramer`]. The outbound side
//! turns command text into bytes with [`parse_payload`].

use crate::core::error::{EngineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default maximum line length before a partial line is flushed
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// Inbound line terminator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    /// Any of CR, LF or CRLF
    #[default]
    Auto,
    /// Line feed, a trailing CR is stripped
    Lf,
    /// CR followed by LF
    CrLf,
    /// Carriage return
    Cr,
    /// Arbitrary byte sequence
    Custom(String),
}

impl Terminator {
    /// Get all fixed terminators
    pub fn all() -> &'static [Terminator] {
        &[Terminator::Auto, Terminator::Lf, Terminator::CrLf, Terminator::Cr]
    }

    /// Get name of terminator
    pub fn name(&self) -> &'static str {
        match self {
            Terminator::Auto => "Auto (CR/LF/CRLF)",
            Terminator::Lf => "LF",
            Terminator::CrLf => "CRLF",
            Terminator::Cr => "CR",
            Terminator::Custom(_) => "Custom",
        }
    }
}

/// Outbound line ending appended to text commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Nothing appended
    None,
    /// Carriage Return only
    Cr,
    /// Line Feed only
    #[default]
    Lf,
    /// Both CR and LF
    CrLf,
}

impl LineEnding {
    /// Get the byte sequence for this line ending
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }
}

impl std::str::FromStr for LineEnding {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "cr" => Ok(Self::Cr),
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::CrLf),
            other => Err(EngineError::InvalidPayload(format!("unknown line ending '{other}'"))),
        }
    }
}

/// Streaming line reassembler
///
/// Bytes are pushed as they arrive; every completed line is returned with
/// its terminator stripped. A line that grows past `max_line_len` without
/// a terminator is emitted as-is so a noisy board cannot grow the buffer
/// without bound. A forced flush never splits a terminator, and the
/// terminator that finally ends a flushed line does not produce an extra
/// empty line.
#[derive(Debug)]
pub struct LineFramer {
    terminator: Terminator,
    max_line_len: usize,
    buffer: Vec<u8>,
    last_was_cr: bool,
    forced: bool,
}

impl LineFramer {
    /// Create new framer
    pub fn new(terminator: Terminator, max_line_len: usize) -> Self {
        Self {
            terminator,
            max_line_len: max_line_len.max(1),
            buffer: Vec::with_capacity(256),
            last_was_cr: false,
            forced: false,
        }
    }

    /// Add data and return complete lines
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut lines = Vec::new();

        for &byte in data {
            match &self.terminator {
                Terminator::Auto => {
                    let skip = byte == b'\n' && self.last_was_cr;
                    self.last_was_cr = byte == b'\r';
                    if skip {
                        continue;
                    }
                    if byte == b'\r' || byte == b'\n' {
                        self.complete(&mut lines);
                        continue;
                    }
                    self.buffer.push(byte);
                }
                Terminator::Lf => {
                    if byte == b'\n' {
                        if self.buffer.last() == Some(&b'\r') {
                            self.buffer.pop();
                        }
                        self.complete(&mut lines);
                        continue;
                    }
                    self.buffer.push(byte);
                }
                Terminator::Cr => {
                    if byte == b'\r' {
                        self.complete(&mut lines);
                        continue;
                    }
                    self.buffer.push(byte);
                }
                Terminator::CrLf => {
                    self.buffer.push(byte);
                    if self.buffer.ends_with(b"\r\n") {
                        self.buffer.truncate(self.buffer.len() - 2);
                        self.complete(&mut lines);
                        continue;
                    }
                }
                Terminator::Custom(seq) => {
                    self.buffer.push(byte);
                    let seq = seq.as_bytes();
                    if !seq.is_empty() && self.buffer.ends_with(seq) {
                        self.buffer.truncate(self.buffer.len() - seq.len());
                        self.complete(&mut lines);
                        continue;
                    }
                }
            }

            // Bytes that may start the terminator stay behind
            let held = self.terminator_prefix_len();
            if self.buffer.len() - held >= self.max_line_len {
                let tail = self.buffer.split_off(self.buffer.len() - held);
                lines.push(self.take());
                self.buffer = tail;
                self.forced = true;
            }
        }

        lines
    }

    /// Flush a trailing partial line, e.g. at end of stream
    pub fn flush(&mut self) -> Option<Bytes> {
        self.last_was_cr = false;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Clear buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_was_cr = false;
        self.forced = false;
    }

    fn complete(&mut self, lines: &mut Vec<Bytes>) {
        let after_forced = std::mem::take(&mut self.forced);
        if after_forced && self.buffer.is_empty() {
            return;
        }
        lines.push(self.take());
    }

    /// Length of the longest buffer suffix that is a proper prefix of the
    /// terminator
    fn terminator_prefix_len(&self) -> usize {
        let seq: &[u8] = match &self.terminator {
            Terminator::CrLf | Terminator::Lf => b"\r\n",
            Terminator::Custom(seq) => seq.as_bytes(),
            Terminator::Auto | Terminator::Cr => return 0,
        };
        (1..seq.len())
            .rev()
            .find(|&n| self.buffer.ends_with(&seq[..n]))
            .unwrap_or(0)
    }

    fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buffer))
    }
}

/// Turn command text into the bytes written to the port.
///
/// - `\x48 65 6C` sends raw hex bytes
/// - `\b01000001` sends a big-endian binary number
/// - anything else is sent as text followed by `line_ending`
pub fn parse_payload(command: &str, line_ending: LineEnding) -> Result<Bytes> {
    if let Some(rest) = command.strip_prefix("\\x") {
        let hex_text: String = rest
            .replace("\\x", "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let data = hex::decode(&hex_text)
            .map_err(|e| EngineError::InvalidPayload(format!("bad hex '{hex_text}': {e}")))?;
        return Ok(Bytes::from(data));
    }

    if let Some(rest) = command.strip_prefix("\\b") {
        let bits: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
        return parse_binary(&bits).map(Bytes::from);
    }

    let mut data = Vec::with_capacity(command.len() + 2);
    data.extend_from_slice(command.as_bytes());
    data.extend_from_slice(line_ending.bytes());
    Ok(Bytes::from(data))
}

fn parse_binary(bits: &str) -> Result<Vec<u8>> {
    if bits.is_empty() || !bits.chars().all(|c| c == '0' || c == '1') {
        return Err(EngineError::InvalidPayload(format!("bad binary '{bits}'")));
    }

    // Left-pad to a whole number of bytes
    let width = bits.len().div_ceil(8) * 8;
    let padded = format!("{bits:0>width$}");
    padded
        .as_bytes()
        .chunks(8)
        .map(|chunk| {
            let text = std::str::from_utf8(chunk)
                .map_err(|e| EngineError::InvalidPayload(e.to_string()))?;
            u8::from_str_radix(text, 2).map_err(|e| EngineError::InvalidPayload(e.to_string()))
        })
        .collect()
}
