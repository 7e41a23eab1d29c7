//! Video playback seam.
//!
//! No decoder ships with the client; embedders supply players through the
//! client's video hook. The trait exists so the client can keep per-stream
//! players alive and include them in lifecycle handling.

/// An active video player bound to one stream and one display layer.
pub trait VideoPlayer: Send {
    /// Called at each server frame boundary.
    fn sync(&mut self) {}
}
