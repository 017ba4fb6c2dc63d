use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, OnceLock,
};

use getset::Getters;
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

use crate::{
    build,
    config::MachineConfig,
    hypervisor::{Hypervisor, Machine, MachineState, RestoreImage},
    preflight::preflight,
    wire::{WireEmitter, WireEvent, STDIN_TAG},
    VirtlingError, VirtlingResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runtime behavior switches, passed explicitly to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RuntimeOptions {
    /// Always run the OS installer before booting.
    #[builder(default)]
    installer_mode: bool,

    /// Run the installer automatically when every disk-image attachment
    /// was freshly allocated during build.
    #[builder(default = true)]
    auto_installer_mode: bool,

    /// Forward host interrupt/suspend signals to the guest console instead
    /// of acting on them.
    #[builder(default)]
    signal_passing: bool,
}

/// The machine lifecycle controller.
///
/// Drives one machine through creation, optional installation, boot and
/// supervision. All collaboration state lives here or in the injected
/// wire emitter; nothing is global, so several controllers can coexist in
/// one process.
pub struct VmController<H: Hypervisor> {
    /// The hypervisor engine.
    engine: Arc<H>,

    /// The validated machine configuration.
    config: MachineConfig,

    /// The wire-protocol emitter, shared with preflight and build.
    wire: Arc<WireEmitter>,

    /// The behavior switches.
    options: RuntimeOptions,

    /// The machine handle, set once by [`create`](Self::create).
    machine: OnceLock<Arc<H::Machine>>,

    /// The restore image resolved during preflight, kept for the
    /// installer detour.
    restore_image: Mutex<Option<RestoreImage>>,

    /// One-shot flag: the next `Stopped` state restarts the machine
    /// instead of ending supervision. Set when installation succeeds.
    inhibit_stop: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<H: Hypervisor> VmController<H> {
    /// Creates a controller for one machine run.
    pub fn new(
        engine: Arc<H>,
        config: MachineConfig,
        wire: Arc<WireEmitter>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            engine,
            config,
            wire,
            options,
            machine: OnceLock::new(),
            restore_image: Mutex::new(None),
            inhibit_stop: AtomicBool::new(false),
        }
    }

    /// The behavior switches.
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// The wire-protocol emitter.
    pub fn wire(&self) -> &Arc<WireEmitter> {
        &self.wire
    }

    /// Runs preflight, compiles the device graph and instantiates the
    /// machine. Idempotent once it has succeeded.
    pub async fn create(&self) -> VirtlingResult<()> {
        if self.machine.get().is_some() {
            return Ok(());
        }

        self.wire.emit(WireEvent::state("create.start"));

        self.wire.emit(WireEvent::state("preflight.start"));
        let state = match preflight(&self.config, &*self.engine, &self.wire).await {
            Ok(state) => state,
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                return Err(e);
            }
        };
        self.wire.emit(WireEvent::state("preflight.end"));

        *self.restore_image.lock().unwrap() = state.restore_image.clone();

        self.wire.emit(WireEvent::state("configure.start"));
        let graph = match build::build(&self.config, &state, &self.wire, self.engine.extended()) {
            Ok(graph) => graph,
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                return Err(e);
            }
        };
        self.wire.emit(WireEvent::state("configure.end"));

        let machine = match self.engine.create_machine(graph, self.wire.pipes()) {
            Ok(machine) => machine,
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                return Err(e);
            }
        };
        let _ = self.machine.set(Arc::new(machine));

        self.wire.emit(WireEvent::state("create.end"));
        Ok(())
    }

    /// Boots the machine, detouring through the OS installer when
    /// installer mode is forced or every disk was freshly allocated.
    pub async fn start(&self) -> VirtlingResult<()> {
        self.wire.emit(WireEvent::state("runtime.starting"));

        if self.should_install() {
            self.run_installer().await
        } else {
            self.start_machine().await
        }
    }

    /// Spawns the supervision task over the machine's state stream.
    ///
    /// Every state change is forwarded onto the wire as a `state` event.
    /// A `Stopped` state arriving while the inhibit-stop flag is set
    /// restarts the machine once instead of ending supervision;
    /// `on_terminal` fires for the state that actually ends the run.
    pub fn watch_state<F>(self: &Arc<Self>, mut on_terminal: F) -> VirtlingResult<()>
    where
        F: FnMut(MachineState) + Send + 'static,
    {
        let machine = Arc::clone(self.machine()?);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut rx = machine.state();
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                this.wire.emit(WireEvent::state(state.as_str()));

                if state == MachineState::Stopped
                    && this.inhibit_stop.swap(false, Ordering::SeqCst)
                {
                    if let Err(e) = this.start_machine().await {
                        tracing::warn!("restart after installation failed: {}", e);
                    }
                    continue;
                }

                if state.is_terminal() {
                    on_terminal(state);
                    break;
                }
            }
        });

        Ok(())
    }

    /// Requests a graceful stop; completion arrives on the state stream.
    pub async fn stop(&self) -> VirtlingResult<()> {
        match self.machine()?.request_stop().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                Err(e)
            }
        }
    }

    /// Reacts to a host interrupt: forwarded to the guest console in
    /// signal-passing mode, otherwise announced and turned into a stop
    /// request.
    pub async fn handle_interrupt(&self) {
        if *self.options.get_signal_passing() {
            self.forward_interrupt().await;
        } else {
            self.wire.emit(WireEvent::notify("killed"));
            let _ = self.stop().await;
        }
    }

    /// Reacts to a host suspend request: forwarded to the guest console in
    /// signal-passing mode, otherwise ignored.
    pub async fn handle_suspend(&self) {
        if *self.options.get_signal_passing() {
            self.forward_suspend().await;
        }
    }

    /// Writes an interrupt byte (ETX, 0x03) to the guest console.
    pub async fn forward_interrupt(&self) {
        self.write_stdin(&[0x03]).await;
    }

    /// Writes a suspend byte (SUB, 0x1a) to the guest console.
    pub async fn forward_suspend(&self) {
        self.write_stdin(&[0x1a]).await;
    }

    /// Best-effort write into the guest's `stdin` pipe. Failures surface
    /// as wire error events, never as machine faults.
    pub async fn write_stdin(&self, data: &[u8]) {
        if let Err(e) = self.wire.write_host(STDIN_TAG, data).await {
            self.wire.emit(WireEvent::error(e));
        }
    }

    fn machine(&self) -> VirtlingResult<&Arc<H::Machine>> {
        self.machine.get().ok_or(VirtlingError::MachineNotCreated)
    }

    /// Whether this boot goes through the installer. Forced installer mode
    /// always wins; otherwise install automatically when the build
    /// allocated every disk-image attachment fresh.
    fn should_install(&self) -> bool {
        if *self.options.get_installer_mode() {
            return true;
        }
        if !*self.options.get_auto_installer_mode() {
            return false;
        }

        let allocations = self.wire.disk_allocations();
        let auto = !allocations.is_empty() && allocations.iter().all(|fresh| *fresh);
        if auto {
            self.wire.emit(WireEvent::notify("runtime.installer.auto"));
        }
        auto
    }

    async fn run_installer(&self) -> VirtlingResult<()> {
        let image = {
            let guard = self.restore_image.lock().unwrap();
            guard.clone()
        };
        let Some(image) = image else {
            let e = VirtlingError::MissingRestoreImage;
            self.wire.emit(WireEvent::error(&e));
            return Err(e);
        };
        let machine = self.machine()?;

        self.wire.emit(WireEvent::state("runtime.installer.start"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let wire = Arc::clone(&self.wire);
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                wire.emit(WireEvent::InstallationProgress { progress });
            }
        });

        // The start/end bracket closes regardless of the outcome.
        let result = machine.install(&image, tx).await;
        self.wire.emit(WireEvent::state("runtime.installer.end"));

        match result {
            Ok(()) => {
                self.inhibit_stop.store(true, Ordering::SeqCst);
                self.wire.emit(WireEvent::state("runtime.started"));
                Ok(())
            }
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                Err(e)
            }
        }
    }

    /// Boots the machine directly, validating recovery-boot support
    /// against the extended-capability port first.
    async fn start_machine(&self) -> VirtlingResult<()> {
        let options = self.config.get_start_options();
        if options.map(|o| o.recovery_boot).unwrap_or(false) {
            let supported = self
                .engine
                .extended()
                .map(|port| port.supports_recovery_boot())
                .unwrap_or(false);
            if !supported {
                let e = VirtlingError::UnsupportedCapability("recovery boot".to_string());
                self.wire.emit(WireEvent::error(&e));
                return Err(e);
            }
        }

        match self.machine()?.start(options.as_ref()).await {
            Ok(()) => {
                self.wire.emit(WireEvent::notify("started"));
                Ok(())
            }
            Err(e) => {
                self.wire.emit(WireEvent::error(&e));
                Err(e)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
