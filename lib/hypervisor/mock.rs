//! In-process engine doubles used by the crate's own tests.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::{
    config::StartOptions,
    wire::PipeRegistry,
    VirtlingError, VirtlingResult,
};

use super::{
    CatalogImage, DeviceGraph, ExtendedCapability, HardwareModel, Hypervisor, Machine,
    MachineState, RestoreImage, UartKind,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A scriptable [`Hypervisor`] double.
#[derive(Clone)]
pub(crate) struct MockEngine {
    machine: MockMachine,
    catalog: CatalogImage,
    fail_image_load: bool,
    capabilities: Option<MockCapabilities>,
    last_graph: Arc<Mutex<Option<DeviceGraph>>>,
}

/// A scriptable [`Machine`] double. Clones share state so a test can keep
/// a handle while the controller drives the other.
#[derive(Clone)]
pub(crate) struct MockMachine {
    inner: Arc<MockMachineInner>,
}

struct MockMachineInner {
    state_tx: watch::Sender<MachineState>,
    starts: AtomicUsize,
    installs: AtomicUsize,
    stop_requests: AtomicUsize,
    fail_start: AtomicBool,
    fail_install: AtomicBool,
    install_progress: Vec<f64>,
    last_start_options: Mutex<Option<StartOptions>>,
}

/// A fixed answer set for the extended-capability port.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MockCapabilities {
    pub uarts: bool,
    pub recovery_boot: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockEngine {
    /// Makes `load_restore_image` fail.
    pub(crate) fn with_failing_image_load(mut self) -> Self {
        self.fail_image_load = true;
        self
    }

    /// Exposes the extended-capability port with the given answers.
    pub(crate) fn with_capabilities(mut self, capabilities: MockCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// The shared machine double handed out by `create_machine`.
    pub(crate) fn machine(&self) -> &MockMachine {
        &self.machine
    }

    /// The device graph most recently passed to `create_machine`.
    pub(crate) fn last_graph(&self) -> Option<DeviceGraph> {
        self.last_graph.lock().unwrap().clone()
    }
}

impl MockMachine {
    /// Pushes a state onto the machine's state stream.
    pub(crate) fn set_state(&self, state: MachineState) {
        let _ = self.inner.state_tx.send(state);
    }

    /// Makes `start` fail.
    pub(crate) fn fail_next_start(&self) {
        self.inner.fail_start.store(true, Ordering::SeqCst);
    }

    /// Makes `install` fail.
    pub(crate) fn fail_next_install(&self) {
        self.inner.fail_install.store(true, Ordering::SeqCst);
    }

    /// How many times `start` was called.
    pub(crate) fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// How many times `install` was called.
    pub(crate) fn install_count(&self) -> usize {
        self.inner.installs.load(Ordering::SeqCst)
    }

    /// How many times `request_stop` was called.
    pub(crate) fn stop_request_count(&self) -> usize {
        self.inner.stop_requests.load(Ordering::SeqCst)
    }

    /// The options passed to the most recent `start` call.
    pub(crate) fn last_start_options(&self) -> Option<StartOptions> {
        self.inner.last_start_options.lock().unwrap().clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            machine: MockMachine::default(),
            catalog: CatalogImage {
                url: "http://localhost/restore.img".to_string(),
                build_version: "23A344".to_string(),
            },
            fail_image_load: false,
            capabilities: None,
            last_graph: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for MockMachine {
    fn default() -> Self {
        let (state_tx, _) = watch::channel(MachineState::Stopped);
        Self {
            inner: Arc::new(MockMachineInner {
                state_tx,
                starts: AtomicUsize::new(0),
                installs: AtomicUsize::new(0),
                stop_requests: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
                fail_install: AtomicBool::new(false),
                install_progress: vec![5.0, 50.0, 100.0],
                last_start_options: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Hypervisor for MockEngine {
    type Machine = MockMachine;

    async fn latest_restore_image(&self) -> VirtlingResult<CatalogImage> {
        Ok(self.catalog.clone())
    }

    async fn load_restore_image(&self, path: &Path) -> VirtlingResult<RestoreImage> {
        if self.fail_image_load {
            return Err(VirtlingError::custom(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unreadable restore image",
            )));
        }
        Ok(RestoreImage {
            path: path.to_path_buf(),
            build_version: self.catalog.build_version.clone(),
            hardware_model: HardwareModel {
                identifier: "mock-model".to_string(),
                auxiliary_storage_size: 1 << 20,
            },
        })
    }

    fn create_machine(
        &self,
        graph: DeviceGraph,
        _pipes: &PipeRegistry,
    ) -> VirtlingResult<Self::Machine> {
        *self.last_graph.lock().unwrap() = Some(graph);
        Ok(self.machine.clone())
    }

    fn extended(&self) -> Option<&dyn ExtendedCapability> {
        self.capabilities
            .as_ref()
            .map(|c| c as &dyn ExtendedCapability)
    }
}

#[async_trait]
impl Machine for MockMachine {
    fn state(&self) -> watch::Receiver<MachineState> {
        self.inner.state_tx.subscribe()
    }

    async fn start(&self, options: Option<&StartOptions>) -> VirtlingResult<()> {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_start_options.lock().unwrap() = options.cloned();

        if self.inner.fail_start.swap(false, Ordering::SeqCst) {
            return Err(VirtlingError::custom(std::io::Error::other(
                "start refused",
            )));
        }
        let _ = self.inner.state_tx.send(MachineState::Starting);
        Ok(())
    }

    async fn install(
        &self,
        _image: &RestoreImage,
        progress: mpsc::UnboundedSender<f64>,
    ) -> VirtlingResult<()> {
        self.inner.installs.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_install.swap(false, Ordering::SeqCst) {
            return Err(VirtlingError::custom(std::io::Error::other(
                "install refused",
            )));
        }
        for percent in &self.inner.install_progress {
            let _ = progress.send(*percent);
        }
        Ok(())
    }

    async fn request_stop(&self) -> VirtlingResult<()> {
        self.inner.stop_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ExtendedCapability for MockCapabilities {
    fn supports_uart(&self, _kind: UartKind) -> bool {
        self.uarts
    }

    fn supports_recovery_boot(&self) -> bool {
        self.recovery_boot
    }
}
