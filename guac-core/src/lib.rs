//! Client-side implementation of the Guacamole remote-desktop streaming
//! protocol.
//!
//! The crate is organized around three load-bearing subsystems:
//!
//! - **Framing and transport** — [`instruction`], [`parser`], and the
//!   [`tunnel`] variants (websocket, HTTP long-poll, chained failover)
//!   carry a length-prefixed textual instruction stream in both
//!   directions.
//! - **Rendering** — [`surface`] defines the opaque raster target and
//!   pixel semantics; [`display`] keeps the scene graph of compositable
//!   layers and the ordered frame queue with frame-level atomicity.
//! - **Stream multiplexing** — [`stream`] carries clipboard, file, audio,
//!   video, and named-object payloads in-band, with ack-based flow
//!   control and base64/UTF-8 codec layers.
//!
//! [`client::Client`] ties them together behind a single event loop.

pub mod audio;
pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod instruction;
pub mod parser;
pub mod pool;
pub mod status;
pub mod stream;
pub mod surface;
pub mod tunnel;
pub mod utf8;
pub mod video;

pub use audio::{AudioFormat, AudioPlayer, PcmSink, PcmSinkFactory, RawAudioPlayer};
pub use client::{Client, ClientHandle, ClientHandlers, ClientState, GuacObject, MouseState};
pub use config::{ClientConfig, TunnelConfig};
pub use display::Display;
pub use error::GuacError;
pub use instruction::Instruction;
pub use parser::Parser;
pub use pool::IndexPool;
pub use status::{Status, StatusCode};
pub use stream::{InputStream, OutputStream};
pub use surface::{Bitmap, Layer, Surface, SurfaceFactory};
pub use tunnel::{
    ChainedTunnel, HttpTunnel, InstructionSender, Tunnel, TunnelEvent, TunnelState,
    WebSocketTunnel,
};
pub use video::VideoPlayer;
