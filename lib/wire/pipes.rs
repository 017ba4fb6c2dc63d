use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{io::DuplexStream, sync::Mutex as AsyncMutex};

use crate::{VirtlingError, VirtlingResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The tag the stdio serial attachment registers its guest-input pipe under.
pub const STDIN_TAG: &str = "stdin";

/// Buffer capacity of each in-memory pipe half.
pub(crate) const PIPE_CAPACITY: usize = 8192;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The engine-facing endpoints of a tracked pipe.
///
/// The engine reads guest input from `input` and writes guest output to
/// `output`; the host-facing halves stay inside the registry, where the
/// controller writes forwarded bytes and the emitter re-emits guest output
/// as `data` events.
#[derive(Debug)]
pub struct GuestEndpoint {
    /// Stream the engine reads guest-bound bytes from.
    pub input: DuplexStream,

    /// Stream the engine writes guest output to.
    pub output: DuplexStream,
}

/// The registry of named bidirectional pipes, keyed by tag.
///
/// Written by the device-graph builder during construction and read by the
/// lifecycle controller afterwards; registration is append-only, so
/// post-build access never contends with writers.
#[derive(Debug, Default)]
pub struct PipeRegistry {
    /// Host-side writers toward the guest, used for signal forwarding.
    host_writers: Mutex<HashMap<String, Arc<AsyncMutex<DuplexStream>>>>,

    /// Engine-side endpoints, handed out once per tag.
    guest_endpoints: Mutex<HashMap<String, GuestEndpoint>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PipeRegistry {
    /// Registers a pipe pair under `tag`.
    pub(crate) fn insert(
        &self,
        tag: &str,
        host_writer: DuplexStream,
        guest: GuestEndpoint,
    ) -> VirtlingResult<()> {
        let mut writers = self.host_writers.lock().unwrap();
        if writers.contains_key(tag) {
            return Err(VirtlingError::DuplicatePipeTag(tag.to_string()));
        }
        writers.insert(tag.to_string(), Arc::new(AsyncMutex::new(host_writer)));
        self.guest_endpoints
            .lock()
            .unwrap()
            .insert(tag.to_string(), guest);
        Ok(())
    }

    /// Whether a pipe is registered under `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.host_writers.lock().unwrap().contains_key(tag)
    }

    /// The registered tags, in no particular order.
    pub fn tags(&self) -> Vec<String> {
        self.host_writers.lock().unwrap().keys().cloned().collect()
    }

    /// Removes and returns the engine-facing endpoints for `tag`.
    ///
    /// The engine claims each endpoint exactly once while instantiating
    /// the machine from the device graph.
    pub fn take_guest_endpoint(&self, tag: &str) -> Option<GuestEndpoint> {
        self.guest_endpoints.lock().unwrap().remove(tag)
    }

    /// The host-side writer toward the guest for `tag`.
    pub(crate) fn host_writer(&self, tag: &str) -> Option<Arc<AsyncMutex<DuplexStream>>> {
        self.host_writers.lock().unwrap().get(tag).cloned()
    }
}
