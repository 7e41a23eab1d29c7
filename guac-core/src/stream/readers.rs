//! Typed readers over input streams.
//!
//! A reader attaches to an [`InputStream`] by installing blob/end handlers
//! that feed its own accumulation state; the application then consumes the
//! reader's typed callbacks (bytes, text, JSON, a data URI) instead of raw
//! base64.

use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

use crate::error::GuacError;
use crate::status::StatusCode;
use crate::utf8::Utf8Decoder;

use super::InputStream;

// ── ArrayBufferReader ────────────────────────────────────────────

#[derive(Default)]
struct ArrayBufferState {
    on_data: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

/// Decodes each base64 blob into raw bytes.
pub struct ArrayBufferReader {
    state: Arc<Mutex<ArrayBufferState>>,
}

impl ArrayBufferReader {
    /// Attach to a stream, replacing its blob and end handlers.
    pub fn attach(stream: &InputStream) -> Self {
        let state = Arc::new(Mutex::new(ArrayBufferState::default()));

        let blob_state = Arc::clone(&state);
        let index = stream.index();
        stream.set_on_blob(move |data64| match BASE64.decode(data64) {
            Ok(bytes) => {
                let mut state = blob_state.lock().expect("reader state poisoned");
                if let Some(on_data) = state.on_data.as_mut() {
                    on_data(bytes);
                }
            }
            Err(e) => warn!(stream = index, "undecodable blob dropped: {e}"),
        });

        let end_state = Arc::clone(&state);
        stream.set_on_end(move || {
            let on_end = end_state
                .lock()
                .expect("reader state poisoned")
                .on_end
                .take();
            if let Some(on_end) = on_end {
                on_end();
            }
        });

        Self { state }
    }

    /// Receive the decoded bytes of each blob.
    pub fn on_data(&self, f: impl FnMut(Vec<u8>) + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_data = Some(Box::new(f));
    }

    /// Notified once when the stream ends.
    pub fn on_end(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_end = Some(Box::new(f));
    }
}

// ── StringReader ─────────────────────────────────────────────────

struct StringState {
    decoder: Utf8Decoder,
    on_text: Option<Box<dyn FnMut(String) + Send>>,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

/// Decodes blobs into text with a rolling UTF-8 accumulator, so multi-byte
/// sequences split across blob boundaries decode correctly.
pub struct StringReader {
    state: Arc<Mutex<StringState>>,
}

impl StringReader {
    /// Attach to a stream, replacing its blob and end handlers.
    pub fn attach(stream: &InputStream) -> Self {
        let state = Arc::new(Mutex::new(StringState {
            decoder: Utf8Decoder::new(),
            on_text: None,
            on_end: None,
        }));
        let inner = ArrayBufferReader::attach(stream);

        let text_state = Arc::clone(&state);
        inner.on_data(move |bytes| {
            let mut state = text_state.lock().expect("reader state poisoned");
            let text = state.decoder.decode(&bytes);
            if text.is_empty() {
                return;
            }
            if let Some(on_text) = state.on_text.as_mut() {
                on_text(text);
            }
        });

        let end_state = Arc::clone(&state);
        inner.on_end(move || {
            let on_end = end_state
                .lock()
                .expect("reader state poisoned")
                .on_end
                .take();
            if let Some(on_end) = on_end {
                on_end();
            }
        });

        Self { state }
    }

    /// Receive each decoded text chunk.
    pub fn on_text(&self, f: impl FnMut(String) + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_text = Some(Box::new(f));
    }

    /// Notified once when the stream ends.
    pub fn on_end(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_end = Some(Box::new(f));
    }
}

// ── BlobReader ───────────────────────────────────────────────────

struct BlobState {
    mimetype: String,
    data: Vec<u8>,
    on_progress: Option<Box<dyn FnMut(usize) + Send>>,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

/// Accumulates the whole stream into one typed binary blob, acknowledging
/// every received blob with `"OK"`.
pub struct BlobReader {
    state: Arc<Mutex<BlobState>>,
}

impl BlobReader {
    /// Attach to a stream, replacing its blob and end handlers.
    pub fn attach(stream: &InputStream, mimetype: impl Into<String>) -> Self {
        let state = Arc::new(Mutex::new(BlobState {
            mimetype: mimetype.into(),
            data: Vec::new(),
            on_progress: None,
            on_end: None,
        }));

        let blob_state = Arc::clone(&state);
        let ack_stream = stream.clone();
        stream.set_on_blob(move |data64| {
            match BASE64.decode(data64) {
                Ok(bytes) => {
                    let mut state = blob_state.lock().expect("reader state poisoned");
                    let received = bytes.len();
                    state.data.extend_from_slice(&bytes);
                    if let Some(on_progress) = state.on_progress.as_mut() {
                        on_progress(received);
                    }
                }
                Err(e) => warn!(stream = ack_stream.index(), "undecodable blob dropped: {e}"),
            }
            ack_stream.ack("OK", StatusCode::Success as i32);
        });

        let end_state = Arc::clone(&state);
        stream.set_on_end(move || {
            let on_end = end_state
                .lock()
                .expect("reader state poisoned")
                .on_end
                .take();
            if let Some(on_end) = on_end {
                on_end();
            }
        });

        Self { state }
    }

    /// The declared mimetype of the assembled blob.
    pub fn mimetype(&self) -> String {
        self.state
            .lock()
            .expect("reader state poisoned")
            .mimetype
            .clone()
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.state.lock().expect("reader state poisoned").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notified with the byte count of each received blob.
    pub fn on_progress(&self, f: impl FnMut(usize) + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_progress = Some(Box::new(f));
    }

    /// Notified once when the stream ends.
    pub fn on_end(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_end = Some(Box::new(f));
    }

    /// Take the assembled blob, leaving the reader empty.
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().expect("reader state poisoned").data)
    }
}

// ── DataUriReader ────────────────────────────────────────────────

struct DataUriState {
    uri: String,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

/// Accumulates the stream's base64 text verbatim onto a
/// `data:<mimetype>;base64,` prefix.
///
/// Senders must emit whole 3-byte groups per blob (except possibly the
/// last) for the concatenated base64 to stay valid.
pub struct DataUriReader {
    state: Arc<Mutex<DataUriState>>,
}

impl DataUriReader {
    /// Attach to a stream, replacing its blob and end handlers.
    pub fn attach(stream: &InputStream, mimetype: &str) -> Self {
        let state = Arc::new(Mutex::new(DataUriState {
            uri: format!("data:{mimetype};base64,"),
            on_end: None,
        }));

        let blob_state = Arc::clone(&state);
        stream.set_on_blob(move |data64| {
            blob_state
                .lock()
                .expect("reader state poisoned")
                .uri
                .push_str(data64);
        });

        let end_state = Arc::clone(&state);
        stream.set_on_end(move || {
            let on_end = end_state
                .lock()
                .expect("reader state poisoned")
                .on_end
                .take();
            if let Some(on_end) = on_end {
                on_end();
            }
        });

        Self { state }
    }

    /// The URI assembled so far.
    pub fn uri(&self) -> String {
        self.state.lock().expect("reader state poisoned").uri.clone()
    }

    /// The base64 payload (the part after the comma).
    pub fn payload_base64(&self) -> String {
        let state = self.state.lock().expect("reader state poisoned");
        match state.uri.split_once(',') {
            Some((_, payload)) => payload.to_string(),
            None => String::new(),
        }
    }

    /// Decode the accumulated payload into raw bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, GuacError> {
        BASE64
            .decode(self.payload_base64())
            .map_err(|e| GuacError::Protocol(format!("invalid base64 in data stream: {e}")))
    }

    /// Notified once when the stream ends.
    pub fn on_end(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_end = Some(Box::new(f));
    }
}

// ── JsonReader ───────────────────────────────────────────────────

struct JsonState {
    text: String,
    value: Option<serde_json::Value>,
    on_end: Option<Box<dyn FnOnce(Result<serde_json::Value, GuacError>) + Send>>,
}

/// Accumulates the stream as UTF-8 text and parses it as JSON at end.
pub struct JsonReader {
    state: Arc<Mutex<JsonState>>,
}

impl JsonReader {
    /// Attach to a stream, replacing its blob and end handlers.
    pub fn attach(stream: &InputStream) -> Self {
        let state = Arc::new(Mutex::new(JsonState {
            text: String::new(),
            value: None,
            on_end: None,
        }));
        let inner = StringReader::attach(stream);

        let text_state = Arc::clone(&state);
        inner.on_text(move |text| {
            text_state
                .lock()
                .expect("reader state poisoned")
                .text
                .push_str(&text);
        });

        let end_state = Arc::clone(&state);
        inner.on_end(move || {
            let mut state = end_state.lock().expect("reader state poisoned");
            let parsed: Result<serde_json::Value, GuacError> =
                serde_json::from_str(&state.text).map_err(GuacError::from);
            if let Ok(value) = &parsed {
                state.value = Some(value.clone());
            }
            if let Some(on_end) = state.on_end.take() {
                on_end(parsed);
            }
        });

        Self { state }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> String {
        self.state.lock().expect("reader state poisoned").text.clone()
    }

    /// The parsed value, available once the stream ended with valid JSON.
    pub fn value(&self) -> Option<serde_json::Value> {
        self.state.lock().expect("reader state poisoned").value.clone()
    }

    /// Notified once with the parse result when the stream ends.
    pub fn on_end(&self, f: impl FnOnce(Result<serde_json::Value, GuacError>) + Send + 'static) {
        self.state.lock().expect("reader state poisoned").on_end = Some(Box::new(f));
    }
}

// ── Tests ────────────────────────────────────────────────────────
