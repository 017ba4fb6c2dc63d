use super::UartKind;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The optional extended-capability port.
///
/// Some engine builds expose surfaces beyond the documented API: hardware
/// UART emulations and recovery-boot start options. The core never touches
/// those mechanisms directly; it only asks this port whether a requested
/// capability exists and fails the build (or the start) when it does not.
/// The port is versioned independently of the core.
pub trait ExtendedCapability: Send + Sync {
    /// Whether the engine can emulate the given hardware UART.
    fn supports_uart(&self, kind: UartKind) -> bool;

    /// Whether the engine can boot into the platform recovery environment.
    fn supports_recovery_boot(&self) -> bool;
}
