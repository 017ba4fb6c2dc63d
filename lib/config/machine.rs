use std::{collections::BTreeMap, path::PathBuf};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{InvalidMachineConfigError, VirtlingError, VirtlingResult};

use super::MacAddress;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The root machine configuration.
///
/// Decoded once per process run from the configuration document and
/// immutable afterwards. Device lists are ordered; the compiled device
/// graph mirrors that order exactly, which keeps bus addressing
/// deterministic across runs.
///
/// ## Examples
///
/// ```
/// use virtling::config::{BootLoader, MachineConfig, Platform};
///
/// let config = MachineConfig::builder()
///     .cpu_core_count(2)
///     .memory_size_in_bytes(1 << 30)
///     .boot_loader(BootLoader::DirectKernel {
///         kernel_path: "vmlinuz".into(),
///         initial_ramdisk_path: None,
///         command_line: Some("console=hvc0".into()),
///     })
///     .platform(Platform::Generic {})
///     .build();
///
/// assert_eq!(*config.get_cpu_core_count(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct MachineConfig {
    /// The number of virtual CPU cores. Must be positive.
    pub(crate) cpu_core_count: u32,

    /// The guest memory size in bytes. Must be positive.
    pub(crate) memory_size_in_bytes: u64,

    /// The boot loader descriptor.
    pub(crate) boot_loader: BootLoader,

    /// The platform identity descriptor.
    pub(crate) platform: Platform,

    /// The storage devices, in bus order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) storage_devices: Vec<StorageDevice>,

    /// The serial ports, in bus order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) serial_ports: Vec<SerialPort>,

    /// The entropy devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) entropy_devices: Vec<EntropyDevice>,

    /// The memory balloon devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) memory_balloon_devices: Vec<MemoryBalloonDevice>,

    /// The network devices, in bus order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) network_devices: Vec<NetworkDevice>,

    /// The graphics devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) graphics_devices: Vec<GraphicsDevice>,

    /// The directory-sharing devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) directory_sharing_devices: Vec<DirectorySharingDevice>,

    /// The socket devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) socket_devices: Vec<SocketDevice>,

    /// The keyboard devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) keyboard_devices: Vec<KeyboardDevice>,

    /// The pointing devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) pointing_devices: Vec<PointingDevice>,

    /// The OS restore-image source, required for install mode and for the
    /// hardware-model platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub(crate) restore_image: Option<RestoreImageSource>,

    /// Optional start options passed to the engine start routine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub(crate) start_options: Option<StartOptions>,
}

/// The boot loader descriptor. Exactly one variant per machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum BootLoader {
    /// Boot a kernel image directly.
    #[serde(rename = "direct_kernel")]
    DirectKernel {
        /// Path to the kernel image.
        kernel_path: PathBuf,

        /// Optional path to an initial ramdisk.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_ramdisk_path: Option<PathBuf>,

        /// Optional kernel command line.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_line: Option<String>,
    },

    /// The host platform's native OS boot loader.
    #[serde(rename = "host_native")]
    HostNative {},

    /// Firmware boot with a persistent variable store.
    #[serde(rename = "efi")]
    Efi {
        /// Path to the firmware variable store, created on first build.
        variable_store_path: PathBuf,
    },
}

/// The platform identity descriptor. Exactly one variant per machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Platform {
    /// The generic platform with no persistent identity.
    #[serde(rename = "generic")]
    Generic {},

    /// A platform bound to the hardware model of the resolved restore
    /// image. Requires a restore image during preflight and provisions two
    /// persistent artifacts that stay stable across restarts.
    #[serde(rename = "hardware_model")]
    HardwareModel {
        /// Path to the auxiliary storage file.
        auxiliary_storage_path: PathBuf,

        /// Path to the machine-identity file.
        machine_identifier_path: PathBuf,
    },
}

/// A storage device: an attachment paired with a bus variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct StorageDevice {
    /// The backing attachment.
    pub attachment: StorageAttachment,

    /// The bus/controller the attachment is exposed on.
    pub device: StorageBus,
}

/// The backing store of a storage device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum StorageAttachment {
    /// A disk-image file on the host.
    #[serde(rename = "disk_image")]
    DiskImage {
        /// Path to the disk image.
        path: PathBuf,

        /// Whether the guest sees the disk read-only.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        read_only: bool,

        /// If set and the file does not exist at build time, a zero-filled
        /// file of exactly this size is allocated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_create_size: Option<u64>,
    },

    /// A remote block device.
    #[serde(rename = "network_block")]
    NetworkBlock {
        /// URL of the remote block device.
        url: String,

        /// Whether the guest sees the device read-only.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        read_only: bool,
    },
}

/// The bus/controller variant of a storage device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum StorageBus {
    /// A paravirtualized block device.
    #[serde(rename = "virtio_block")]
    VirtioBlock {},

    /// A USB mass-storage device.
    #[serde(rename = "usb_mass_storage")]
    UsbMassStorage {},
}

/// A serial port: an attachment paired with a port variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct SerialPort {
    /// Where the port's bytes come from and go to.
    pub attachment: SerialAttachment,

    /// The emulated port hardware.
    pub device: SerialPortKind,
}

/// The host-side attachment of a serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SerialAttachment {
    /// Pass the process's stdin/stdout through to the guest. Registers the
    /// `stdin` pipe with the wire pipe tracker.
    #[serde(rename = "stdio")]
    Stdio {},

    /// A pair of named data pipes tracked by the wire protocol under `tag`.
    #[serde(rename = "pipe")]
    Pipe {
        /// The tag the pipes are registered under.
        tag: String,
    },
}

/// The emulated serial port hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SerialPortKind {
    /// A paravirtualized console.
    #[serde(rename = "virtio_console")]
    VirtioConsole {},

    /// A PL011 UART. Requires the extended-capability port.
    #[serde(rename = "pl011")]
    Pl011 {},

    /// A 16550 UART. Requires the extended-capability port.
    #[serde(rename = "uart_16550")]
    Uart16550 {},
}

/// An entropy device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum EntropyDevice {
    /// A paravirtualized entropy source.
    #[serde(rename = "virtio_entropy")]
    VirtioEntropy {},
}

/// A memory balloon device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum MemoryBalloonDevice {
    /// A traditional paravirtualized memory balloon.
    #[serde(rename = "virtio_balloon")]
    VirtioBalloon {},
}

/// A network device: an attachment paired with an interface variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct NetworkDevice {
    /// The host-side network attachment.
    pub attachment: NetworkAttachment,

    /// The guest-facing interface.
    pub device: NetworkInterface,
}

/// The host-side attachment of a network device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NetworkAttachment {
    /// NAT attachment through the host.
    #[serde(rename = "nat")]
    Nat {},
}

/// The guest-facing network interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NetworkInterface {
    /// A paravirtualized NIC, optionally pinned to a MAC address.
    #[serde(rename = "virtio_net")]
    VirtioNet {
        /// Optional explicit MAC address.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac_address: Option<MacAddress>,
    },
}

/// A graphics device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum GraphicsDevice {
    /// The host's native display-list device.
    #[serde(rename = "native_display")]
    NativeDisplay {
        /// The attached displays, in order.
        displays: Vec<DisplayMode>,
    },

    /// A paravirtualized scanout device.
    #[serde(rename = "virtio_graphics")]
    VirtioGraphics {
        /// The attached scanouts, in order.
        scanouts: Vec<ScanoutMode>,
    },
}

/// A display geometry for the native display-list device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayMode {
    /// Width in pixels.
    pub width_in_pixels: u32,

    /// Height in pixels.
    pub height_in_pixels: u32,

    /// Pixel density.
    pub pixels_per_inch: u32,
}

/// A scanout geometry for the paravirtualized graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanoutMode {
    /// Width in pixels.
    pub width_in_pixels: u32,

    /// Height in pixels.
    pub height_in_pixels: u32,
}

/// A directory-sharing device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct DirectorySharingDevice {
    /// The guest-facing filesystem device.
    pub device: FileSystemDevice,

    /// The shared directory tree.
    pub share: DirectoryShare,
}

/// The guest-facing filesystem device of a directory share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum FileSystemDevice {
    /// A paravirtualized filesystem device mounted by tag in the guest.
    #[serde(rename = "virtio_fs")]
    VirtioFs {
        /// The mount tag visible to the guest.
        tag: String,
    },
}

/// The shape of a directory share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum DirectoryShare {
    /// A single shared directory.
    #[serde(rename = "single")]
    Single {
        /// The shared directory.
        directory: SharedDirectory,
    },

    /// Multiple shared directories keyed by share name.
    #[serde(rename = "multiple")]
    Multiple {
        /// The shared directories, keyed by unique share name.
        directories: BTreeMap<String, SharedDirectory>,
    },
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct SharedDirectory {
    /// Path to the host directory.
    pub path: PathBuf,

    /// Whether the guest sees the directory read-only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub read_only: bool,
}

/// A socket device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SocketDevice {
    /// A paravirtualized socket device.
    #[serde(rename = "virtio_socket")]
    VirtioSocket {},
}

/// A keyboard device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum KeyboardDevice {
    /// A USB keyboard.
    #[serde(rename = "usb_keyboard")]
    UsbKeyboard {},
}

/// A pointing device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum PointingDevice {
    /// A USB screen-coordinate pointing device.
    #[serde(rename = "usb_screen_coordinate_pointer")]
    UsbScreenCoordinatePointer {},
}

/// The source of the OS restore image resolved during preflight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum RestoreImageSource {
    /// Query the engine's upstream catalog for the newest compatible image
    /// and download it to the fixed local path.
    #[serde(rename = "latest_supported")]
    LatestSupported {},

    /// Load a restore image from a local file.
    #[serde(rename = "file")]
    File {
        /// Path to the local restore image.
        path: PathBuf,
    },
}

/// Options passed to the engine start routine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct StartOptions {
    /// Boot into the platform recovery environment. Requires the
    /// extended-capability port.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub recovery_boot: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineConfig {
    /// Decodes a machine configuration from JSON bytes and validates it.
    ///
    /// Performs no network or filesystem access. Missing required fields,
    /// unknown fields and invalid variant shapes are all decode errors.
    pub fn load(bytes: &[u8]) -> VirtlingResult<Self> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the invariants serde cannot express.
    pub fn validate(&self) -> VirtlingResult<()> {
        if self.cpu_core_count == 0 {
            return Err(VirtlingError::InvalidMachineConfig(
                InvalidMachineConfigError::CpuCountIsZero,
            ));
        }

        if self.memory_size_in_bytes == 0 {
            return Err(VirtlingError::InvalidMachineConfig(
                InvalidMachineConfigError::MemorySizeIsZero,
            ));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
