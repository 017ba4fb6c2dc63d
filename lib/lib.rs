//! `virtling` turns a declarative machine configuration into a hypervisor
//! device graph and supervises the resulting virtual machine.
//!
//! # Overview
//!
//! virtling is the core of a VM launcher: given a JSON configuration
//! document describing boot loader, platform identity, storage, serial
//! ports, networking and the other guest devices, it
//! - resolves asynchronous preflight dependencies (restore-image download
//!   or lookup, persistent machine identity),
//! - compiles the configuration tree into a fully resolved [`DeviceGraph`],
//! - and drives the machine through its lifecycle (build → configure →
//!   start → optional install detour → stop), streaming structured events
//!   over the wire protocol.
//!
//! The hypervisor execution engine is an external collaborator: embedders
//! implement the [`Hypervisor`] and [`Machine`] traits and hand the engine
//! to a [`VmController`]. Command-line parsing, framebuffer display and
//! terminal modes likewise live in the embedding process.
//!
//! # Modules
//!
//! - [`config`] - the serializable configuration model
//! - [`wire`] - the event stream, pipe tracker and disk-allocation ledger
//! - [`hypervisor`] - the abstract engine port and device-graph types
//! - [`preflight`] - asynchronous restore-image resolution
//! - [`build`] - the configuration → device-graph compiler
//! - [`runtime`] - the VM lifecycle controller and signal forwarding
//! - [`utils`] - common helpers
//!
//! [`DeviceGraph`]: hypervisor::DeviceGraph
//! [`Hypervisor`]: hypervisor::Hypervisor
//! [`Machine`]: hypervisor::Machine
//! [`VmController`]: runtime::VmController

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod build;
pub mod config;
pub mod hypervisor;
pub mod preflight;
pub mod runtime;
pub mod utils;
pub mod wire;

pub use error::*;
