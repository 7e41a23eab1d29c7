//! Named objects: containers addressing multiple streams by name.
//!
//! An object is announced by the server (`filesystem`), after which the
//! client pulls named streams out of it with `get` and pushes into it with
//! `put`. The distinguished root stream `"/"` carries a JSON index mapping
//! stream names to mimetypes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::stream::InputStream;
use crate::tunnel::InstructionSender;

/// Name of an object's root stream.
pub const ROOT_STREAM: &str = "/";

/// Mimetype of the stream-index JSON carried by the root stream.
pub const STREAM_INDEX_MIMETYPE: &str =
    "application/vnd.glyptodon.guacamole.stream-index+json";

/// Callback receiving a requested body stream and its mimetype.
pub type BodyCallback = Box<dyn FnOnce(InputStream, String) + Send>;

#[derive(Default)]
struct ObjectState {
    /// Queued callbacks per requested stream name.
    pending: HashMap<String, VecDeque<BodyCallback>>,
    /// Overrides the default dequeue behavior when set.
    on_body: Option<Box<dyn FnMut(InputStream, String, String) + Send>>,
    on_undefine: Option<Box<dyn FnOnce() + Send>>,
}

/// A named object announced by the server.
///
/// Cheap to clone; the dispatcher's table and user code share one state.
#[derive(Clone)]
pub struct GuacObject {
    index: i32,
    sender: InstructionSender,
    state: Arc<Mutex<ObjectState>>,
}

impl GuacObject {
    /// Create an object with the given wire index.
    pub fn new(index: i32, sender: InstructionSender) -> Self {
        Self {
            index,
            sender,
            state: Arc::new(Mutex::new(ObjectState::default())),
        }
    }

    /// The object's wire index.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Request the named stream, queuing `callback` for the matching
    /// `body` response.
    ///
    /// Responses for the same name resolve queued requests in order.
    pub fn request_input_stream(
        &self,
        name: &str,
        callback: impl FnOnce(InputStream, String) + Send + 'static,
    ) {
        self.state
            .lock()
            .expect("object state poisoned")
            .pending
            .entry(name.to_string())
            .or_default()
            .push_back(Box::new(callback));
        self.sender
            .send_elements(["get", &self.index.to_string(), name]);
    }

    /// Replace the default body routing with a custom handler.
    pub fn set_on_body(&self, f: impl FnMut(InputStream, String, String) + Send + 'static) {
        self.state.lock().expect("object state poisoned").on_body = Some(Box::new(f));
    }

    /// Notified once when the server undefines this object.
    pub fn set_on_undefine(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().expect("object state poisoned").on_undefine = Some(Box::new(f));
    }

    /// Route an incoming body stream. Called by the dispatcher.
    ///
    /// With no custom handler installed, the default behavior dequeues the
    /// callback queued for `name`.
    pub fn handle_body(&self, stream: InputStream, mimetype: String, name: String) {
        // Invoke handlers outside the lock so they may call back into
        // this object.
        let custom = self
            .state
            .lock()
            .expect("object state poisoned")
            .on_body
            .take();
        if let Some(mut on_body) = custom {
            on_body(stream, mimetype, name);
            let mut state = self.state.lock().expect("object state poisoned");
            if state.on_body.is_none() {
                state.on_body = Some(on_body);
            }
            return;
        }

        let queued = self
            .state
            .lock()
            .expect("object state poisoned")
            .pending
            .get_mut(&name)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(callback) => callback(stream, mimetype),
            None => debug!(object = self.index, name, "unrequested body dropped"),
        }
    }

    /// Route the undefine notification. Called by the dispatcher.
    pub fn handle_undefine(&self) {
        let on_undefine = self
            .state
            .lock()
            .expect("object state poisoned")
            .on_undefine
            .take();
        if let Some(on_undefine) = on_undefine {
            on_undefine();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
