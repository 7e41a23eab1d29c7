//! Incremental instruction-stream parser.
//!
//! The parser accepts arbitrary byte chunks (transports deliver whatever the
//! network hands them, including splits inside a length prefix or inside a
//! multi-byte UTF-8 sequence) and yields complete instructions in wire
//! order. Feeding a stream one byte at a time produces exactly the same
//! instruction sequence as feeding it whole.

use bytes::{Buf, BytesMut};

use crate::error::GuacError;
use crate::instruction::Instruction;

/// Once the consumed prefix passes this size it is dropped from the buffer
/// and the parse indices are rebased.
const TRUNCATE_THRESHOLD: usize = 4096;

/// Upper bound for a single element's declared byte length.
///
/// Far above anything the protocol produces (blob elements top out around
/// 10 752 bytes); purely a guard against absurd length prefixes.
const MAX_ELEMENT_LENGTH: usize = 64 * 1024 * 1024;

// ── Parser ───────────────────────────────────────────────────────

/// Incremental framing consumer.
///
/// `feed` appends raw bytes; `next_instruction` is then polled until it
/// returns `Ok(None)` (more bytes needed). A framing violation poisons the
/// stream: the caller must treat it as fatal to the transport.
pub struct Parser {
    buffer: BytesMut,
    /// Where the next length prefix, or the current element body, begins.
    start: usize,
    /// Terminator position of the element currently being parsed, once its
    /// length prefix is known.
    element_end: Option<usize>,
    /// Completed elements of the instruction in progress.
    elements: Vec<String>,
}

impl Parser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            start: 0,
            element_end: None,
            elements: Vec::new(),
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered (consumed prefix included until
    /// the next truncation).
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete instruction out of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet form a whole
    /// instruction.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>, GuacError> {
        loop {
            match self.element_end {
                Some(end) => {
                    // The consumed prefix is dead weight once an element
                    // body is in flight; drop it and rebase.
                    if self.start > TRUNCATE_THRESHOLD {
                        self.buffer.advance(self.start);
                        self.element_end = Some(end - self.start);
                        self.start = 0;
                        continue;
                    }

                    // Wait until the body and its terminator byte arrived.
                    if end >= self.buffer.len() {
                        return Ok(None);
                    }

                    let body = &self.buffer[self.start..end];
                    let element = std::str::from_utf8(body)
                        .map_err(|_| GuacError::InvalidElementText)?
                        .to_owned();
                    let terminator = self.buffer[end];

                    self.elements.push(element);
                    self.start = end + 1;
                    self.element_end = None;

                    match terminator {
                        b',' => {}
                        b';' => {
                            let mut elements = std::mem::take(&mut self.elements);
                            let opcode = elements.remove(0);
                            return Ok(Some(Instruction::new(opcode, elements)));
                        }
                        other => {
                            return Err(GuacError::Protocol(format!(
                                "invalid element terminator {:?}",
                                other as char
                            )));
                        }
                    }
                }

                None => {
                    // Scan for the `.` ending the decimal length prefix.
                    let Some(offset) = self.buffer[self.start..].iter().position(|&b| b == b'.')
                    else {
                        return Ok(None);
                    };
                    let dot = self.start + offset;

                    let digits = &self.buffer[self.start..dot];
                    if digits.is_empty() {
                        return Err(GuacError::Protocol("empty element length".into()));
                    }

                    let mut length: usize = 0;
                    for &byte in digits {
                        if !byte.is_ascii_digit() {
                            return Err(GuacError::Protocol(format!(
                                "non-digit {:?} in element length",
                                byte as char
                            )));
                        }
                        length = length
                            .checked_mul(10)
                            .and_then(|l| l.checked_add((byte - b'0') as usize))
                            .filter(|&l| l <= MAX_ELEMENT_LENGTH)
                            .ok_or_else(|| {
                                GuacError::Protocol("element length out of range".into())
                            })?;
                    }

                    self.start = dot + 1;
                    self.element_end = Some(self.start + length);
                }
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut Parser) -> Vec<Instruction> {
        let mut out = Vec::new();
        while let Some(ins) = parser.next_instruction().unwrap() {
            out.push(ins);
        }
        out
    }

    #[test]
    fn single_instruction() {
        let mut parser = Parser::new();
        parser.feed(b"4.size,1.0,4.1024,3.768;");
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].opcode(), "size");
        assert_eq!(instructions[0].args(), ["0", "1024", "768"]);
    }

    #[test]
    fn opcode_only() {
        let mut parser = Parser::new();
        parser.feed(b"10.disconnect;");
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].opcode(), "disconnect");
        assert!(instructions[0].args().is_empty());
    }

    #[test]
    fn several_instructions_in_one_chunk() {
        let mut parser = Parser::new();
        parser.feed(b"4.sync,1.0;4.sync,1.1;4.sync,1.2;");
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions.len(), 3);
        for (i, ins) in instructions.iter().enumerate() {
            assert_eq!(ins.opcode(), "sync");
            assert_eq!(ins.args()[0], i.to_string());
        }
    }

    #[test]
    fn roundtrip_preserves_elements() {
        let ins = Instruction::of("clipboard", &["7", "text/plain; charset=utf-8", ""]);
        let mut parser = Parser::new();
        parser.feed(ins.encode().as_bytes());
        let parsed = parse_all(&mut parser);
        assert_eq!(parsed, vec![ins]);
    }

    #[test]
    fn byte_at_a_time_matches_whole_feed() {
        let wire = "4.size,1.0,4.1024,3.768;3.img,1.2,2.12,1.0,9.image/png,2.10,2.20;";

        let mut whole = Parser::new();
        whole.feed(wire.as_bytes());
        let expected = parse_all(&mut whole);

        let mut incremental = Parser::new();
        let mut actual = Vec::new();
        for byte in wire.as_bytes() {
            incremental.feed(&[*byte]);
            actual.extend(parse_all(&mut incremental));
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn length_counts_utf8_bytes() {
        let mut parser = Parser::new();
        parser.feed("4.name,3.世;".as_bytes());
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions[0].args(), ["世"]);
    }

    #[test]
    fn multibyte_split_across_chunks() {
        let wire = "4.name,3.世;".as_bytes();
        let mut parser = Parser::new();
        // Split inside the three-byte sequence.
        parser.feed(&wire[..9]);
        assert!(parser.next_instruction().unwrap().is_none());
        parser.feed(&wire[9..]);
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions[0].args(), ["世"]);
    }

    #[test]
    fn non_digit_length_fails() {
        let mut parser = Parser::new();
        parser.feed(b"4a.size;");
        assert!(matches!(
            parser.next_instruction(),
            Err(GuacError::Protocol(_))
        ));
    }

    #[test]
    fn bad_terminator_fails() {
        let mut parser = Parser::new();
        parser.feed(b"4.sync|1.0;");
        assert!(matches!(
            parser.next_instruction(),
            Err(GuacError::Protocol(_))
        ));
    }

    #[test]
    fn element_containing_separators() {
        // Separator characters inside a body are data, not framing.
        let mut parser = Parser::new();
        parser.feed(b"4.name,5.a,b;c;");
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions[0].args(), ["a,b;c"]);
    }

    #[test]
    fn consumed_prefix_is_truncated() {
        let mut parser = Parser::new();
        let wire = b"4.sync,1.0;";
        for _ in 0..10_000 {
            for byte in wire {
                parser.feed(&[*byte]);
            }
        }
        let instructions = parse_all(&mut parser);
        assert_eq!(instructions.len(), 10_000);
        assert!(parser.buffered_len() <= TRUNCATE_THRESHOLD + wire.len() + 1);
    }
}
