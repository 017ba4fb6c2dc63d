//! The wire protocol: the structured/human-readable event stream emitted
//! for observability of lifecycle, progress, data and error conditions,
//! plus the two registries the device-graph builder writes and the
//! lifecycle controller reads back: the named-pipe tracker and the
//! disk-allocation ledger.

mod emitter;
mod event;
mod pipes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use emitter::*;
pub use event::*;
pub use pipes::*;

//--------------------------------------------------------------------------------------------------
// Functions: Test Support
//--------------------------------------------------------------------------------------------------

/// An emitter whose output lines can be read back from the returned tap.
#[cfg(test)]
pub(crate) fn test_emitter(
    mode: EmitMode,
) -> (std::sync::Arc<WireEmitter>, tokio::io::DuplexStream) {
    let (sink, tap) = tokio::io::duplex(PIPE_CAPACITY);
    (WireEmitter::with_writer(mode, sink), tap)
}
