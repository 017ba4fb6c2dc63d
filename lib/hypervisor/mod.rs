//! The abstract hypervisor port.
//!
//! The execution engine (CPU/memory virtualization, device emulation) is
//! an external system this crate orchestrates. Embedders implement
//! [`Hypervisor`] and [`Machine`]; the crate hands them a fully resolved
//! [`DeviceGraph`] and observes the machine through an awaitable API and a
//! watchable state stream. Undocumented platform surfaces are reachable
//! only through the optional [`ExtendedCapability`] port.

mod engine;
mod extended;
mod graph;

#[cfg(test)]
pub(crate) mod mock;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use engine::*;
pub use extended::*;
pub use graph::*;
