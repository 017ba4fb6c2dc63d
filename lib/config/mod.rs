//! Configuration types for the machine document.
//!
//! The configuration model is pure data: a versioned tree of device
//! descriptors decoded from JSON. Every composite descriptor slot is a
//! tagged union, so "zero or multiple populated variants" is a decode
//! error, not something the builder has to police later.

mod mac_address;
mod machine;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use mac_address::*;
pub use machine::*;
