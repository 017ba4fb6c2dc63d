use std::{fmt, path::Path};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::{config::StartOptions, wire::PipeRegistry, VirtlingResult};

use super::{DeviceGraph, ExtendedCapability};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The states a machine reports through its state stream.
///
/// These mirror the engine's own state enumeration; the lifecycle
/// controller adds its bracketing phase events on top but never invents
/// machine states of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    /// The machine is starting.
    Starting,

    /// The machine is running guest code.
    Running,

    /// The machine is pausing.
    Pausing,

    /// The machine is paused.
    Paused,

    /// The machine is resuming from pause.
    Resuming,

    /// The machine is stopping.
    Stopping,

    /// The machine has stopped. Terminal unless an install just finished.
    Stopped,

    /// The machine is saving its state.
    Saving,

    /// The machine is restoring saved state.
    Restoring,

    /// The machine failed. Terminal.
    Error,
}

/// The newest compatible restore image advertised by the engine's
/// upstream catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    /// Download URL of the image payload.
    pub url: String,

    /// Build/version label of the image.
    pub build_version: String,
}

/// A validated, locally available restore image.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreImage {
    /// Absolute path to the local image file.
    pub path: std::path::PathBuf,

    /// Build/version label of the image.
    pub build_version: String,

    /// The most capable hardware model the image supports.
    pub hardware_model: HardwareModel,
}

/// A hardware model descriptor taken from a restore image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareModel {
    /// Opaque engine-defined model identifier.
    pub identifier: String,

    /// Required size of the auxiliary storage file in bytes.
    pub auxiliary_storage_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The host hypervisor engine.
///
/// Implemented by the embedding process; the crate only ever talks to the
/// engine through this trait and through [`Machine`].
#[async_trait]
pub trait Hypervisor: Send + Sync + 'static {
    /// The machine handle type this engine produces.
    type Machine: Machine;

    /// Queries the upstream catalog for the newest compatible restore
    /// image descriptor.
    async fn latest_restore_image(&self) -> VirtlingResult<CatalogImage>;

    /// Loads a restore image from a local file into a validated handle.
    ///
    /// Fails on corrupt images and on images whose hardware model the
    /// engine cannot run.
    async fn load_restore_image(&self, path: &Path) -> VirtlingResult<RestoreImage>;

    /// Instantiates a machine from a finalized device graph.
    ///
    /// Pipe-backed serial endpoints are claimed from `pipes` by tag via
    /// [`PipeRegistry::take_guest_endpoint`].
    fn create_machine(
        &self,
        graph: DeviceGraph,
        pipes: &PipeRegistry,
    ) -> VirtlingResult<Self::Machine>;

    /// The extended-capability port, if this engine build exposes one.
    fn extended(&self) -> Option<&dyn ExtendedCapability> {
        None
    }
}

/// A running (or runnable) machine owned by the lifecycle controller.
#[async_trait]
pub trait Machine: Send + Sync + 'static {
    /// The machine's state stream. The receiver yields every reported
    /// state change; the current value is always the latest state.
    fn state(&self) -> watch::Receiver<MachineState>;

    /// Starts the machine, optionally with start options.
    async fn start(&self, options: Option<&StartOptions>) -> VirtlingResult<()>;

    /// Runs the OS installation routine against a restore image,
    /// reporting fraction-complete percentages (0-100) on `progress`.
    async fn install(
        &self,
        image: &RestoreImage,
        progress: mpsc::UnboundedSender<f64>,
    ) -> VirtlingResult<()>;

    /// Requests a graceful stop. Completion is observed on the state
    /// stream, not awaited here.
    async fn request_stop(&self) -> VirtlingResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineState {
    /// The wire-protocol name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Saving => "saving",
            Self::Restoring => "restoring",
            Self::Error => "error",
        }
    }

    /// Whether the state ends the machine's life.
    ///
    /// The embedding process maps `Stopped` to a success exit and `Error`
    /// to a failure exit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_state_names_match_the_wire_protocol() {
        assert_eq!(MachineState::Starting.to_string(), "starting");
        assert_eq!(MachineState::Stopped.to_string(), "stopped");
        assert_eq!(MachineState::Error.to_string(), "error");
    }

    #[test]
    fn test_only_stopped_and_error_are_terminal() {
        assert!(MachineState::Stopped.is_terminal());
        assert!(MachineState::Error.is_terminal());
        assert!(!MachineState::Running.is_terminal());
        assert!(!MachineState::Stopping.is_terminal());
    }
}
