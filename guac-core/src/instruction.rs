//! Instruction framing — the length-prefixed element encoding.
//!
//! An instruction is an opcode plus an ordered list of element strings.
//! On the wire each element is `<byte-length>.<utf8-bytes>`; elements are
//! separated by `,` and the final element is followed by `;`:
//!
//! ```text
//! 4.size,1.0,4.1024,3.768;
//! ```
//!
//! Lengths count UTF-8 **bytes**, not codepoints.

use std::fmt;

use crate::error::GuacError;

/// A single decoded instruction: opcode plus argument elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
}

impl Instruction {
    /// Create an instruction from an opcode and owned arguments.
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Create an instruction from borrowed elements (convenience).
    pub fn of(opcode: &str, args: &[&str]) -> Self {
        Self {
            opcode: opcode.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// The instruction opcode.
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// The argument elements, in order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Consume the instruction, yielding opcode and arguments.
    pub fn into_parts(self) -> (String, Vec<String>) {
        (self.opcode, self.args)
    }

    // ── Typed element access ─────────────────────────────────────

    /// The argument at `index`, or a [`GuacError::MissingElement`].
    pub fn arg(&self, index: usize) -> Result<&str, GuacError> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| GuacError::MissingElement {
                opcode: self.opcode.clone(),
                index,
            })
    }

    /// The argument at `index` parsed as a signed integer.
    pub fn int_arg(&self, index: usize) -> Result<i64, GuacError> {
        let raw = self.arg(index)?;
        raw.parse().map_err(|_| {
            GuacError::Protocol(format!(
                "element {index} of {:?} is not an integer: {raw:?}",
                self.opcode
            ))
        })
    }

    /// The argument at `index` parsed as a layer index (`i32`).
    pub fn layer_arg(&self, index: usize) -> Result<i32, GuacError> {
        Ok(self.int_arg(index)? as i32)
    }

    /// The argument at `index` parsed as a float.
    pub fn float_arg(&self, index: usize) -> Result<f64, GuacError> {
        let raw = self.arg(index)?;
        raw.parse().map_err(|_| {
            GuacError::Protocol(format!(
                "element {index} of {:?} is not a number: {raw:?}",
                self.opcode
            ))
        })
    }

    // ── Encoding ─────────────────────────────────────────────────

    /// Encode this instruction into its wire form.
    pub fn encode(&self) -> String {
        let elements = std::iter::once(self.opcode.as_str()).chain(self.args.iter().map(String::as_str));
        encode_elements(elements)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encode a sequence of elements (opcode first) into wire form.
pub fn encode_elements<'a>(elements: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    let mut first = true;
    for element in elements {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&element.len().to_string());
        out.push('.');
        out.push_str(element);
    }
    out.push(';');
    out
}

// ── Tests ────────────────────────────────────────────────────────
