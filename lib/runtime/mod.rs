//! The machine lifecycle runtime.
//!
//! The [`VmController`] owns a machine end to end: it runs preflight,
//! compiles the device graph, instantiates the machine through the
//! hypervisor port and then supervises it, forwarding state changes onto
//! the wire, detouring through the OS installer when asked (or when every
//! disk was freshly allocated) and translating host signals into guest
//! console bytes.

mod controller;
mod signals;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use controller::*;
pub use signals::*;
