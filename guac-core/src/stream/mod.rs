//! Numbered in-band byte channels multiplexed over the instruction stream.
//!
//! Streams carry their payload as base64 text inside `blob` instructions
//! and end with an `end` instruction. Flow control is ack-based: the
//! receiving side acknowledges every blob, and an error-class ack kills
//! the stream.
//!
//! Both stream types are cheap clones around shared handler slots, so the
//! dispatcher's table and user code can hold the same stream.

pub mod readers;
pub mod writers;

pub use readers::{ArrayBufferReader, BlobReader, DataUriReader, JsonReader, StringReader};
pub use writers::{ArrayBufferWriter, BlobWriter, StringWriter, MAX_BLOB_BYTES};

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::status::Status;
use crate::tunnel::InstructionSender;

/// Handler for each received blob (base64 text).
pub type BlobHandler = Box<dyn FnMut(&str) + Send>;
/// Handler for the end-of-stream signal. Fires at most once.
pub type EndHandler = Box<dyn FnOnce() + Send>;
/// Handler for acknowledgements of sent blobs.
pub type AckHandler = Box<dyn FnMut(&Status) + Send>;

// ── InputStream ──────────────────────────────────────────────────

#[derive(Default)]
struct InputHandlers {
    on_blob: Option<BlobHandler>,
    on_end: Option<EndHandler>,
}

/// A server→client stream.
///
/// The holder acknowledges each blob via [`ack`](InputStream::ack); an ack
/// code of 0x0100 or above tells the server to destroy the stream.
#[derive(Clone)]
pub struct InputStream {
    index: i32,
    sender: InstructionSender,
    handlers: Arc<Mutex<InputHandlers>>,
}

impl InputStream {
    /// Create a stream for the given wire index.
    pub fn new(index: i32, sender: InstructionSender) -> Self {
        Self {
            index,
            sender,
            handlers: Arc::new(Mutex::new(InputHandlers::default())),
        }
    }

    /// The stream's wire index.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Acknowledge the most recent blob (or the stream itself) with the
    /// given message and status code.
    pub fn ack(&self, message: &str, code: i32) {
        self.sender
            .send_elements(["ack", &self.index.to_string(), message, &code.to_string()]);
    }

    /// Install the blob handler, replacing any previous one.
    pub fn set_on_blob(&self, f: impl FnMut(&str) + Send + 'static) {
        self.handlers.lock().expect("stream handlers poisoned").on_blob = Some(Box::new(f));
    }

    /// Install the end handler, replacing any previous one.
    pub fn set_on_end(&self, f: impl FnOnce() + Send + 'static) {
        self.handlers.lock().expect("stream handlers poisoned").on_end = Some(Box::new(f));
    }

    /// Route a received blob to the handler. Called by the dispatcher.
    pub fn deliver_blob(&self, data: &str) {
        let mut handlers = self.handlers.lock().expect("stream handlers poisoned");
        match handlers.on_blob.as_mut() {
            Some(on_blob) => on_blob(data),
            None => trace!(stream = self.index, "blob with no handler dropped"),
        }
    }

    /// Route the end signal to the handler. Called by the dispatcher.
    pub fn deliver_end(&self) {
        let on_end = self
            .handlers
            .lock()
            .expect("stream handlers poisoned")
            .on_end
            .take();
        if let Some(on_end) = on_end {
            on_end();
        }
    }
}

// ── OutputStream ─────────────────────────────────────────────────

#[derive(Default)]
struct OutputHandlers {
    on_ack: Option<AckHandler>,
}

/// A client→server stream.
///
/// Writers push base64 blobs with [`send_blob`](OutputStream::send_blob)
/// and finish with [`send_end`](OutputStream::send_end). Acks from the
/// server arrive through the installed handler; an error-class ack means
/// the server destroyed the stream.
#[derive(Clone)]
pub struct OutputStream {
    index: i32,
    sender: InstructionSender,
    handlers: Arc<Mutex<OutputHandlers>>,
}

impl OutputStream {
    /// Create a stream for the given wire index.
    pub fn new(index: i32, sender: InstructionSender) -> Self {
        Self {
            index,
            sender,
            handlers: Arc::new(Mutex::new(OutputHandlers::default())),
        }
    }

    /// The stream's wire index.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Send one blob of base64 text.
    pub fn send_blob(&self, data64: &str) {
        self.sender
            .send_elements(["blob", &self.index.to_string(), data64]);
    }

    /// Signal the end of the stream.
    pub fn send_end(&self) {
        self.sender.send_elements(["end", &self.index.to_string()]);
    }

    /// Install the ack handler, replacing any previous one.
    pub fn set_on_ack(&self, f: impl FnMut(&Status) + Send + 'static) {
        self.handlers.lock().expect("stream handlers poisoned").on_ack = Some(Box::new(f));
    }

    /// Route a received ack to the handler. Called by the dispatcher.
    pub fn deliver_ack(&self, status: &Status) {
        let mut handlers = self.handlers.lock().expect("stream handlers poisoned");
        if let Some(on_ack) = handlers.on_ack.as_mut() {
            on_ack(status);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
