use std::sync::Arc;

use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};

use crate::{hypervisor::Hypervisor, VirtlingResult};

use super::VmController;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns the task that turns host signals into controller actions.
///
/// SIGINT and SIGTSTP are handed to [`VmController::handle_interrupt`] and
/// [`VmController::handle_suspend`] respectively; in signal-passing mode
/// they reach the guest console as their control bytes, otherwise SIGINT
/// announces `killed` and requests a graceful stop. SIGSTOP cannot be
/// caught, so SIGTSTP stands in for suspend.
pub fn spawn_signal_forwarder<H: Hypervisor>(
    controller: Arc<VmController<H>>,
) -> VirtlingResult<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut suspend = signal(SignalKind::from_raw(libc::SIGTSTP))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = interrupt.recv() => {
                    if received.is_none() {
                        break;
                    }
                    controller.handle_interrupt().await;
                }
                received = suspend.recv() => {
                    if received.is_none() {
                        break;
                    }
                    controller.handle_suspend().await;
                }
            }
        }
    }))
}
