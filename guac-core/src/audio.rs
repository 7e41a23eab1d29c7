//! Audio playback: PCM format negotiation, the packet queue, and the sync
//! contract.
//!
//! Actual audio output is a platform concern injected through [`PcmSink`].
//! This module owns everything up to that boundary: parsing `audio/L8` /
//! `audio/L16` mimetypes, reassembling sample frames split across blob
//! boundaries, and splitting the byte stream into bounded packets so a
//! backend can schedule them with low latency.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::GuacError;
use crate::stream::{ArrayBufferReader, InputStream};

/// Largest packet handed to a sink, expressed as milliseconds of audio.
const MAX_PACKET_MILLIS: u32 = 250;

// ── AudioFormat ──────────────────────────────────────────────────

/// A raw PCM format negotiated via mimetype.
///
/// Wire form: `audio/L16;rate=44100,channels=2` — the sample width is part
/// of the type, `rate` is mandatory, `channels` defaults to 1. Samples are
/// signed PCM in native endianness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Bytes per single-channel sample: 1 for L8, 2 for L16.
    pub bytes_per_sample: u32,
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count.
    pub channels: u32,
}

impl AudioFormat {
    /// Parse a raw-audio mimetype.
    pub fn parse(mimetype: &str) -> Result<Self, GuacError> {
        let (kind, params) = match mimetype.split_once(';') {
            Some((kind, params)) => (kind.trim(), params),
            None => (mimetype.trim(), ""),
        };

        let bytes_per_sample = match kind {
            "audio/L8" => 1,
            "audio/L16" => 2,
            _ => return Err(GuacError::UnsupportedMediaType(mimetype.to_string())),
        };

        let mut rate = None;
        let mut channels = 1;
        for param in params.split(',').filter(|p| !p.is_empty()) {
            let Some((name, value)) = param.split_once('=') else {
                return Err(GuacError::UnsupportedMediaType(mimetype.to_string()));
            };
            match name.trim() {
                "rate" => {
                    rate = value.trim().parse::<u32>().ok().filter(|&r| r > 0);
                    if rate.is_none() {
                        return Err(GuacError::UnsupportedMediaType(mimetype.to_string()));
                    }
                }
                "channels" => {
                    channels = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|&c| c > 0)
                        .ok_or_else(|| GuacError::UnsupportedMediaType(mimetype.to_string()))?;
                }
                // Unknown parameters make the format unplayable.
                _ => return Err(GuacError::UnsupportedMediaType(mimetype.to_string())),
            }
        }

        let rate = rate.ok_or_else(|| GuacError::UnsupportedMediaType(mimetype.to_string()))?;
        Ok(Self {
            bytes_per_sample,
            rate,
            channels,
        })
    }

    /// Bytes of one interleaved sample frame (all channels).
    pub fn frame_bytes(&self) -> usize {
        (self.bytes_per_sample * self.channels) as usize
    }

    /// Bytes of audio per second.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.rate as usize
    }

    /// Largest packet size in bytes, aligned down to a whole frame.
    fn max_packet_bytes(&self) -> usize {
        let raw = self.bytes_per_second() * MAX_PACKET_MILLIS as usize / 1000;
        let frame = self.frame_bytes();
        (raw / frame).max(1) * frame
    }
}

// ── Sink / player seams ──────────────────────────────────────────

/// Platform audio output. Receives whole-frame PCM packets in order.
pub trait PcmSink: Send {
    fn play(&mut self, format: &AudioFormat, pcm: &[u8]);
}

/// Creates a sink for a negotiated format. Registered on the client to
/// enable the built-in raw player.
pub type PcmSinkFactory = Box<dyn FnMut(&AudioFormat) -> Box<dyn PcmSink> + Send>;

/// An active audio player bound to one stream.
///
/// `sync` is the protocol's frame boundary: the server guarantees all
/// audio up to the sync point has been sent, and the player must hand
/// everything queued to its backend.
pub trait AudioPlayer: Send {
    fn sync(&mut self);
}

// ── RawAudioPlayer ───────────────────────────────────────────────

struct PacketQueue {
    /// Partial sample frame carried between blobs.
    carry: Vec<u8>,
    packets: VecDeque<Vec<u8>>,
    ended: bool,
}

/// Built-in player for `audio/L8` and `audio/L16` streams.
pub struct RawAudioPlayer {
    format: AudioFormat,
    queue: Arc<Mutex<PacketQueue>>,
    sink: Box<dyn PcmSink>,
}

impl RawAudioPlayer {
    /// Attach to an audio stream, or fail if the mimetype is not a raw PCM
    /// format this player understands.
    pub fn attach(
        stream: &InputStream,
        mimetype: &str,
        sink: Box<dyn PcmSink>,
    ) -> Result<Self, GuacError> {
        let format = AudioFormat::parse(mimetype)?;
        debug!(?format, stream = stream.index(), "raw audio player attached");

        let queue = Arc::new(Mutex::new(PacketQueue {
            carry: Vec::new(),
            packets: VecDeque::new(),
            ended: false,
        }));

        let reader = ArrayBufferReader::attach(stream);
        {
            let queue = Arc::clone(&queue);
            let format = format.clone();
            reader.on_data(move |bytes| {
                let mut queue = queue.lock().expect("audio queue poisoned");
                push_pcm(&mut queue, &format, &bytes);
            });
        }
        {
            let queue = Arc::clone(&queue);
            reader.on_end(move || {
                let mut queue = queue.lock().expect("audio queue poisoned");
                // A trailing partial frame can never complete; drop it.
                queue.carry.clear();
                queue.ended = true;
            });
        }

        Ok(Self {
            format,
            queue,
            sink,
        })
    }

    /// The negotiated format.
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Whether the underlying stream has ended.
    pub fn ended(&self) -> bool {
        self.queue.lock().expect("audio queue poisoned").ended
    }
}

impl AudioPlayer for RawAudioPlayer {
    fn sync(&mut self) {
        let packets: Vec<Vec<u8>> = {
            let mut queue = self.queue.lock().expect("audio queue poisoned");
            queue.packets.drain(..).collect()
        };
        for packet in packets {
            self.sink.play(&self.format, &packet);
        }
    }
}

/// Append PCM bytes, splitting whole-frame data into bounded packets and
/// carrying any trailing partial frame to the next push.
fn push_pcm(queue: &mut PacketQueue, format: &AudioFormat, bytes: &[u8]) {
    queue.carry.extend_from_slice(bytes);

    let frame = format.frame_bytes();
    let usable = queue.carry.len() - queue.carry.len() % frame;
    if usable == 0 {
        return;
    }

    let rest = queue.carry.split_off(usable);
    let whole = std::mem::replace(&mut queue.carry, rest);

    for packet in whole.chunks(format.max_packet_bytes()) {
        queue.packets.push_back(packet.to_vec());
    }
}

// ── Tests ────────────────────────────────────────────────────────
