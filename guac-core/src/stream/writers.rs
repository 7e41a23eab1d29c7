//! Typed writers over output streams.
//!
//! Writers take application data (bytes, text, whole blobs), base64-encode
//! it, and split it into blob instructions that respect the protocol's
//! payload ceiling.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

use crate::status::Status;
use crate::utf8::Utf8Encoder;

use super::OutputStream;

/// Maximum binary payload of a single `blob` instruction. The encoded
/// element is a third longer (10 752 base64 characters).
pub const MAX_BLOB_BYTES: usize = 8064;

// ── ArrayBufferWriter ────────────────────────────────────────────

/// Writes raw byte buffers, splitting anything larger than
/// [`MAX_BLOB_BYTES`] into successive blobs.
pub struct ArrayBufferWriter {
    stream: OutputStream,
}

impl ArrayBufferWriter {
    pub fn new(stream: OutputStream) -> Self {
        // Default ack handling, replaced via `on_ack`.
        let index = stream.index();
        stream.set_on_ack(move |status| {
            if status.is_error() {
                warn!(stream = index, %status, "stream rejected by peer");
            }
        });
        Self { stream }
    }

    /// Replace the default ack handling.
    pub fn on_ack(&self, f: impl FnMut(&Status) + Send + 'static) {
        self.stream.set_on_ack(f);
    }

    /// Send a buffer as one or more blob instructions.
    pub fn send(&self, data: &[u8]) {
        for chunk in data.chunks(MAX_BLOB_BYTES) {
            self.stream.send_blob(&BASE64.encode(chunk));
        }
    }

    /// Signal the end of the stream.
    pub fn end(&self) {
        self.stream.send_end();
    }

    /// The underlying stream (for installing an ack handler).
    pub fn stream(&self) -> &OutputStream {
        &self.stream
    }
}

// ── StringWriter ─────────────────────────────────────────────────

/// Writes text, encoding it to UTF-8 before the byte path.
pub struct StringWriter {
    inner: ArrayBufferWriter,
    encoder: Utf8Encoder,
}

impl StringWriter {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            inner: ArrayBufferWriter::new(stream),
            encoder: Utf8Encoder::new(),
        }
    }

    /// Send a chunk of text.
    pub fn send_text(&mut self, text: &str) {
        self.encoder.write_str(text);
        let bytes = self.encoder.flush();
        self.inner.send(&bytes);
    }

    /// Signal the end of the stream.
    pub fn end(&self) {
        self.inner.end();
    }

    pub fn stream(&self) -> &OutputStream {
        self.inner.stream()
    }
}

// ── BlobWriter ───────────────────────────────────────────────────

/// Writes whole binary blobs with per-chunk progress reporting.
pub struct BlobWriter {
    inner: ArrayBufferWriter,
    on_progress: Option<Box<dyn FnMut(usize) + Send>>,
}

impl BlobWriter {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            inner: ArrayBufferWriter::new(stream),
            on_progress: None,
        }
    }

    /// Notified with the cumulative byte count after each sent chunk.
    pub fn on_progress(&mut self, f: impl FnMut(usize) + Send + 'static) {
        self.on_progress = Some(Box::new(f));
    }

    /// Send an entire blob, reporting progress per chunk.
    pub fn send_blob_data(&mut self, data: &[u8]) {
        let mut sent = 0;
        for chunk in data.chunks(MAX_BLOB_BYTES) {
            self.inner.stream().send_blob(&BASE64.encode(chunk));
            sent += chunk.len();
            if let Some(on_progress) = self.on_progress.as_mut() {
                on_progress(sent);
            }
        }
    }

    /// Signal the end of the stream.
    pub fn end(&self) {
        self.inner.end();
    }

    pub fn stream(&self) -> &OutputStream {
        self.inner.stream()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::InstructionSender;
    use tokio::sync::mpsc;

    fn writer_stream() -> (OutputStream, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputStream::new(0, InstructionSender::new(tx)), rx)
    }

    fn blob_payload(instruction: &str) -> String {
        // "4.blob,1.0,<len>.<data>;"
        let data = instruction.split(',').nth(2).unwrap();
        let (_, payload) = data.split_once('.').unwrap();
        payload.trim_end_matches(';').to_string()
    }

    #[test]
    fn small_buffer_is_one_blob() {
        let (stream, mut rx) = writer_stream();
        let writer = ArrayBufferWriter::new(stream);
        writer.send(b"Hello");
        writer.end();

        let blob = rx.try_recv().unwrap();
        assert_eq!(blob_payload(&blob), "SGVsbG8=");
        assert_eq!(rx.try_recv().unwrap(), "3.end,1.0;");
    }

    #[test]
    fn large_buffer_splits_at_payload_ceiling() {
        let (stream, mut rx) = writer_stream();
        let writer = ArrayBufferWriter::new(stream);
        writer.send(&vec![0xAB; 20_000]);

        let mut sizes = Vec::new();
        while let Ok(blob) = rx.try_recv() {
            let payload = blob_payload(&blob);
            sizes.push(BASE64.decode(payload).unwrap().len());
        }
        assert_eq!(sizes, [8064, 8064, 3872]);
    }

    #[test]
    fn max_chunk_encodes_to_expected_element_length() {
        let (stream, mut rx) = writer_stream();
        let writer = ArrayBufferWriter::new(stream);
        writer.send(&vec![0; MAX_BLOB_BYTES]);
        let payload = blob_payload(&rx.try_recv().unwrap());
        assert_eq!(payload.len(), 10_752);
    }

    #[test]
    fn string_writer_encodes_utf8() {
        let (stream, mut rx) = writer_stream();
        let mut writer = StringWriter::new(stream);
        writer.send_text("héllo");
        let payload = blob_payload(&rx.try_recv().unwrap());
        assert_eq!(BASE64.decode(payload).unwrap(), "héllo".as_bytes());
    }

    #[test]
    fn blob_writer_reports_progress() {
        let (stream, mut rx) = writer_stream();
        let mut writer = BlobWriter::new(stream);
        let progress = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let progress = std::sync::Arc::clone(&progress);
            writer.on_progress(move |sent| progress.lock().unwrap().push(sent));
        }
        writer.send_blob_data(&vec![1; 10_000]);
        writer.end();

        assert_eq!(*progress.lock().unwrap(), [8064, 10_000]);
        // Two blobs then the end.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap(), "3.end,1.0;");
    }
}
