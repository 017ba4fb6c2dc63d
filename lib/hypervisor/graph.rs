use std::{collections::BTreeMap, path::PathBuf};

use crate::config::MacAddress;

use super::HardwareModel;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The fully resolved set of virtual hardware attached to a machine.
///
/// Produced by the device-graph builder from a validated configuration and
/// the preflight build-state, and consumed once by
/// [`Hypervisor::create_machine`]. All paths are absolute and every device
/// list mirrors the configuration order exactly, which the engine relies
/// on for deterministic bus addressing.
///
/// [`Hypervisor::create_machine`]: super::Hypervisor::create_machine
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceGraph {
    /// The number of virtual CPU cores.
    pub cpu_count: u32,

    /// The guest memory size in bytes.
    pub memory_size: u64,

    /// The boot device.
    pub boot: BootDevice,

    /// The platform identity.
    pub platform: PlatformDevice,

    /// Storage devices, in bus order.
    pub storage: Vec<StorageNode>,

    /// Serial ports, in bus order.
    pub serial: Vec<SerialNode>,

    /// Entropy devices.
    pub entropy: Vec<EntropyNode>,

    /// Memory balloon devices.
    pub balloons: Vec<BalloonNode>,

    /// Network devices, in bus order.
    pub network: Vec<NetworkNode>,

    /// Graphics devices.
    pub graphics: Vec<GraphicsNode>,

    /// Directory shares.
    pub shares: Vec<ShareNode>,

    /// Socket devices.
    pub sockets: Vec<SocketNode>,

    /// Keyboard devices.
    pub keyboards: Vec<KeyboardNode>,

    /// Pointing devices.
    pub pointing: Vec<PointingNode>,
}

/// The resolved boot device.
#[derive(Debug, Clone, PartialEq)]
pub enum BootDevice {
    /// Direct kernel boot with absolute paths.
    DirectKernel {
        /// Absolute path to the kernel image.
        kernel: PathBuf,

        /// Absolute path to the initial ramdisk, if any.
        initial_ramdisk: Option<PathBuf>,

        /// Kernel command line, if any.
        command_line: Option<String>,
    },

    /// The host platform's native OS boot loader.
    HostNative,

    /// Firmware boot backed by an on-disk variable store.
    Efi {
        /// Absolute path to the variable store file.
        variable_store: PathBuf,
    },
}

/// The resolved platform identity.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformDevice {
    /// The generic platform.
    Generic,

    /// A platform bound to a concrete hardware model with persistent
    /// identity artifacts. Both paths are stable across restarts of the
    /// same configuration.
    HardwareModel {
        /// The hardware model from the resolved restore image.
        hardware_model: HardwareModel,

        /// Absolute path to the auxiliary storage file.
        auxiliary_storage: PathBuf,

        /// The persisted machine-identity token.
        machine_identifier: MachineIdentifier,
    },
}

/// An opaque persistent machine-identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentifier(pub Vec<u8>);

/// A resolved storage device.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageNode {
    /// The backing store.
    pub attachment: StorageBacking,

    /// The bus the device is exposed on.
    pub bus: StorageBusKind,
}

/// The resolved backing store of a storage device.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBacking {
    /// A disk image file, guaranteed to exist once the graph is built.
    DiskImage {
        /// Absolute path to the image file.
        path: PathBuf,

        /// Whether the guest sees the disk read-only.
        read_only: bool,
    },

    /// A remote block device.
    NetworkBlock {
        /// URL of the remote device.
        url: String,

        /// Whether the guest sees the device read-only.
        read_only: bool,
    },
}

/// The bus a storage device is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBusKind {
    /// Paravirtualized block device.
    VirtioBlock,

    /// USB mass storage.
    UsbMassStorage,
}

/// A resolved serial port.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialNode {
    /// Where the port's bytes flow. Pipe endpoints are claimed from the
    /// wire pipe registry by tag.
    pub endpoint: SerialEndpoint,

    /// The emulated port hardware.
    pub port: SerialPortDevice,
}

/// The host-side endpoint of a serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEndpoint {
    /// Process stdin/stdout passthrough, tracked under the `stdin` tag.
    Stdio,

    /// A tracked pipe pair.
    Pipe {
        /// The registry tag.
        tag: String,
    },
}

/// The emulated serial port hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortDevice {
    /// A paravirtualized console.
    VirtioConsole,

    /// A hardware UART, available only through the extended-capability
    /// port.
    Uart(UartKind),
}

/// The supported hardware UART emulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartKind {
    /// ARM PL011.
    Pl011,

    /// NS 16550.
    Ns16550,
}

/// An entropy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyNode {
    /// Paravirtualized entropy source.
    VirtioEntropy,
}

/// A memory balloon device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalloonNode {
    /// Traditional paravirtualized balloon.
    VirtioBalloon,
}

/// A resolved network device: NAT attachment behind a paravirtualized NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkNode {
    /// Optional pinned MAC address.
    pub mac_address: Option<MacAddress>,
}

/// A resolved graphics device.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphicsNode {
    /// The host's native display-list device.
    NativeDisplay {
        /// Displays, in order.
        displays: Vec<DisplayGeometry>,
    },

    /// A paravirtualized scanout device.
    VirtioScanout {
        /// Scanouts, in order.
        scanouts: Vec<ScanoutGeometry>,
    },
}

/// A display geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayGeometry {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Pixel density.
    pub pixels_per_inch: u32,
}

/// A scanout geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutGeometry {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

/// A resolved directory share.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareNode {
    /// The guest mount tag.
    pub tag: String,

    /// The shared directory tree.
    pub share: ResolvedShare,
}

/// The resolved shape of a directory share.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedShare {
    /// A single shared directory.
    Single(SharedFolder),

    /// Multiple shared directories keyed by share name.
    Multiple(BTreeMap<String, SharedFolder>),
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFolder {
    /// Absolute path to the host directory.
    pub path: PathBuf,

    /// Whether the guest sees the directory read-only.
    pub read_only: bool,
}

/// A socket device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketNode {
    /// Paravirtualized socket device.
    VirtioSocket,
}

/// A keyboard device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardNode {
    /// USB keyboard.
    UsbKeyboard,
}

/// A pointing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingNode {
    /// USB screen-coordinate pointing device.
    UsbScreenCoordinatePointer,
}
