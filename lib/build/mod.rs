//! The device-graph builder.
//!
//! Compiles a validated configuration plus the preflight build-state into
//! the resolved [`DeviceGraph`] the engine instantiates machines from.
//! Building is synchronous and performs local filesystem side effects
//! only: allocating missing disk images, provisioning platform identity
//! artifacts and creating the firmware variable store. Network work
//! belongs to preflight, never here.
//!
//! Each device list in the graph mirrors its configuration list exactly,
//! entry for entry, in order.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::Path,
    sync::Arc,
};

use crate::{
    config::{
        BootLoader, DirectoryShare, DirectorySharingDevice, EntropyDevice, FileSystemDevice,
        GraphicsDevice, KeyboardDevice, MachineConfig, MemoryBalloonDevice, NetworkDevice,
        NetworkInterface, Platform, PointingDevice, SerialAttachment, SerialPort, SerialPortKind,
        SocketDevice, StorageAttachment, StorageBus, StorageDevice,
    },
    hypervisor::{
        BalloonNode, BootDevice, DeviceGraph, DisplayGeometry, EntropyNode, ExtendedCapability,
        GraphicsNode, KeyboardNode, MachineIdentifier, NetworkNode, PlatformDevice, PointingNode,
        ResolvedShare, ScanoutGeometry, SerialEndpoint, SerialNode, SerialPortDevice, ShareNode,
        SharedFolder, SocketNode, StorageBacking, StorageBusKind, StorageNode, UartKind,
    },
    preflight::BuildState,
    utils,
    wire::{WireEmitter, WireEvent},
    VirtlingError, VirtlingResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Compiles the configuration into a device graph.
///
/// Registers pipe-backed serial endpoints with the wire emitter's pipe
/// registry and records one entry per disk-image attachment in its
/// allocation ledger. Fails fast: the first device that cannot be built
/// aborts the whole build.
pub fn build(
    config: &MachineConfig,
    state: &BuildState,
    wire: &Arc<WireEmitter>,
    extended: Option<&dyn ExtendedCapability>,
) -> VirtlingResult<DeviceGraph> {
    let boot = build_boot_device(&config.boot_loader)?;
    let platform = build_platform_device(&config.platform, state)?;

    let storage = config
        .storage_devices
        .iter()
        .map(|device| build_storage_node(device, wire))
        .collect::<VirtlingResult<Vec<_>>>()?;

    let serial = config
        .serial_ports
        .iter()
        .map(|port| build_serial_node(port, wire, extended))
        .collect::<VirtlingResult<Vec<_>>>()?;

    let entropy = config
        .entropy_devices
        .iter()
        .map(|EntropyDevice::VirtioEntropy {}| EntropyNode::VirtioEntropy)
        .collect();

    let balloons = config
        .memory_balloon_devices
        .iter()
        .map(|MemoryBalloonDevice::VirtioBalloon {}| BalloonNode::VirtioBalloon)
        .collect();

    let network = config
        .network_devices
        .iter()
        .map(build_network_node)
        .collect();

    let graphics = config
        .graphics_devices
        .iter()
        .map(build_graphics_node)
        .collect();

    let shares = config
        .directory_sharing_devices
        .iter()
        .map(build_share_node)
        .collect::<VirtlingResult<Vec<_>>>()?;

    let sockets = config
        .socket_devices
        .iter()
        .map(|SocketDevice::VirtioSocket {}| SocketNode::VirtioSocket)
        .collect();

    let keyboards = config
        .keyboard_devices
        .iter()
        .map(|KeyboardDevice::UsbKeyboard {}| KeyboardNode::UsbKeyboard)
        .collect();

    let pointing = config
        .pointing_devices
        .iter()
        .map(|PointingDevice::UsbScreenCoordinatePointer {}| {
            PointingNode::UsbScreenCoordinatePointer
        })
        .collect();

    Ok(DeviceGraph {
        cpu_count: config.cpu_core_count,
        memory_size: config.memory_size_in_bytes,
        boot,
        platform,
        storage,
        serial,
        entropy,
        balloons,
        network,
        graphics,
        shares,
        sockets,
        keyboards,
        pointing,
    })
}

fn build_boot_device(boot_loader: &BootLoader) -> VirtlingResult<BootDevice> {
    match boot_loader {
        BootLoader::DirectKernel {
            kernel_path,
            initial_ramdisk_path,
            command_line,
        } => Ok(BootDevice::DirectKernel {
            kernel: utils::absolutize(kernel_path)?,
            initial_ramdisk: initial_ramdisk_path
                .as_ref()
                .map(utils::absolutize)
                .transpose()?,
            command_line: command_line.clone(),
        }),
        BootLoader::HostNative {} => Ok(BootDevice::HostNative),
        BootLoader::Efi {
            variable_store_path,
        } => {
            let variable_store = utils::absolutize(variable_store_path)?;
            if !variable_store.exists() {
                create_parent_dirs(&variable_store)?;
                File::create(&variable_store)?;
            }
            Ok(BootDevice::Efi { variable_store })
        }
    }
}

fn build_platform_device(
    platform: &Platform,
    state: &BuildState,
) -> VirtlingResult<PlatformDevice> {
    match platform {
        Platform::Generic {} => Ok(PlatformDevice::Generic),
        Platform::HardwareModel {
            auxiliary_storage_path,
            machine_identifier_path,
        } => {
            let image = state
                .restore_image
                .as_ref()
                .ok_or(VirtlingError::MissingRestoreImage)?;

            let auxiliary_storage = utils::absolutize(auxiliary_storage_path)?;
            provision_auxiliary_storage(
                &auxiliary_storage,
                image.hardware_model.auxiliary_storage_size,
            )?;

            let machine_identifier =
                provision_machine_identifier(&utils::absolutize(machine_identifier_path)?)?;

            Ok(PlatformDevice::HardwareModel {
                hardware_model: image.hardware_model.clone(),
                auxiliary_storage,
                machine_identifier,
            })
        }
    }
}

/// Creates the auxiliary storage file at the model's required size on
/// first build; later builds reuse the existing file untouched.
fn provision_auxiliary_storage(path: &Path, size: u64) -> VirtlingResult<()> {
    if path.exists() {
        OpenOptions::new().read(true).write(true).open(path)?;
        return Ok(());
    }

    create_parent_dirs(path)?;
    let file = File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

/// Reads the persisted machine-identity token, minting and persisting a
/// fresh one when the file does not exist yet.
fn provision_machine_identifier(path: &Path) -> VirtlingResult<MachineIdentifier> {
    if path.exists() {
        return Ok(MachineIdentifier(fs::read(path)?));
    }

    create_parent_dirs(path)?;
    let token = uuid::Uuid::new_v4();
    fs::write(path, token.as_bytes())?;
    Ok(MachineIdentifier(token.as_bytes().to_vec()))
}

fn build_storage_node(
    device: &StorageDevice,
    wire: &Arc<WireEmitter>,
) -> VirtlingResult<StorageNode> {
    let attachment = match &device.attachment {
        StorageAttachment::DiskImage {
            path,
            read_only,
            auto_create_size,
        } => {
            let path = utils::absolutize(path)?;
            let allocated = allocate_disk_image(&path, *auto_create_size, wire)?;
            wire.record_disk_allocation(allocated);
            StorageBacking::DiskImage {
                path,
                read_only: *read_only,
            }
        }
        StorageAttachment::NetworkBlock { url, read_only } => StorageBacking::NetworkBlock {
            url: url.clone(),
            read_only: *read_only,
        },
    };

    let bus = match &device.device {
        StorageBus::VirtioBlock {} => StorageBusKind::VirtioBlock,
        StorageBus::UsbMassStorage {} => StorageBusKind::UsbMassStorage,
    };

    Ok(StorageNode { attachment, bus })
}

/// Ensures the disk image at `path` exists, allocating a zero-filled file
/// of exactly the configured size when permitted. Returns whether a fresh
/// allocation happened.
fn allocate_disk_image(
    path: &Path,
    auto_create_size: Option<u64>,
    wire: &Arc<WireEmitter>,
) -> VirtlingResult<bool> {
    if path.exists() {
        return Ok(false);
    }

    let Some(size) = auto_create_size else {
        return Err(VirtlingError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("disk image not found: {}", path.display()),
        )));
    };

    create_parent_dirs(path)?;
    let file = File::create(path)?;
    file.set_len(size)?;
    wire.emit(WireEvent::notify("disk.allocated"));
    Ok(true)
}

fn build_serial_node(
    port: &SerialPort,
    wire: &Arc<WireEmitter>,
    extended: Option<&dyn ExtendedCapability>,
) -> VirtlingResult<SerialNode> {
    let endpoint = match &port.attachment {
        SerialAttachment::Stdio {} => {
            wire.register_stdio()?;
            SerialEndpoint::Stdio
        }
        SerialAttachment::Pipe { tag } => {
            wire.register_pipe(tag)?;
            SerialEndpoint::Pipe { tag: tag.clone() }
        }
    };

    let device = match &port.device {
        SerialPortKind::VirtioConsole {} => SerialPortDevice::VirtioConsole,
        SerialPortKind::Pl011 {} => require_uart(UartKind::Pl011, extended)?,
        SerialPortKind::Uart16550 {} => require_uart(UartKind::Ns16550, extended)?,
    };

    Ok(SerialNode {
        endpoint,
        port: device,
    })
}

fn require_uart(
    kind: UartKind,
    extended: Option<&dyn ExtendedCapability>,
) -> VirtlingResult<SerialPortDevice> {
    let supported = extended.map(|port| port.supports_uart(kind)).unwrap_or(false);
    if !supported {
        let name = match kind {
            UartKind::Pl011 => "pl011 uart",
            UartKind::Ns16550 => "16550 uart",
        };
        return Err(VirtlingError::UnsupportedCapability(name.to_string()));
    }
    Ok(SerialPortDevice::Uart(kind))
}

fn build_network_node(device: &NetworkDevice) -> NetworkNode {
    let NetworkInterface::VirtioNet { mac_address } = &device.device;
    NetworkNode {
        mac_address: *mac_address,
    }
}

fn build_graphics_node(device: &GraphicsDevice) -> GraphicsNode {
    match device {
        GraphicsDevice::NativeDisplay { displays } => GraphicsNode::NativeDisplay {
            displays: displays
                .iter()
                .map(|mode| DisplayGeometry {
                    width: mode.width_in_pixels,
                    height: mode.height_in_pixels,
                    pixels_per_inch: mode.pixels_per_inch,
                })
                .collect(),
        },
        GraphicsDevice::VirtioGraphics { scanouts } => GraphicsNode::VirtioScanout {
            scanouts: scanouts
                .iter()
                .map(|mode| ScanoutGeometry {
                    width: mode.width_in_pixels,
                    height: mode.height_in_pixels,
                })
                .collect(),
        },
    }
}

fn build_share_node(device: &DirectorySharingDevice) -> VirtlingResult<ShareNode> {
    let FileSystemDevice::VirtioFs { tag } = &device.device;

    let share = match &device.share {
        DirectoryShare::Single { directory } => ResolvedShare::Single(SharedFolder {
            path: utils::absolutize(&directory.path)?,
            read_only: directory.read_only,
        }),
        DirectoryShare::Multiple { directories } => {
            let mut resolved = BTreeMap::new();
            for (name, directory) in directories {
                resolved.insert(
                    name.clone(),
                    SharedFolder {
                        path: utils::absolutize(&directory.path)?,
                        read_only: directory.read_only,
                    },
                );
            }
            ResolvedShare::Multiple(resolved)
        }
    };

    Ok(ShareNode {
        tag: tag.clone(),
        share,
    })
}

fn create_parent_dirs(path: &Path) -> VirtlingResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::{
        hypervisor::{HardwareModel, RestoreImage},
        wire::{EmitMode, STDIN_TAG},
    };
    use tempfile::TempDir;

    fn state_with_image(temp: &TempDir) -> BuildState {
        BuildState {
            restore_image: Some(RestoreImage {
                path: temp.path().join("restore.img"),
                build_version: "23A344".to_string(),
                hardware_model: HardwareModel {
                    identifier: "test-model".to_string(),
                    auxiliary_storage_size: 1 << 20,
                },
            }),
        }
    }

    fn disk_config(path: PathBuf, auto_create_size: Option<u64>) -> MachineConfig {
        MachineConfig::builder()
            .cpu_core_count(1)
            .memory_size_in_bytes(1 << 28)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::Generic {})
            .storage_devices(vec![StorageDevice {
                attachment: StorageAttachment::DiskImage {
                    path,
                    read_only: false,
                    auto_create_size,
                },
                device: StorageBus::VirtioBlock {},
            }])
            .build()
    }

    #[tokio::test]
    async fn test_disk_allocation_happens_once_across_builds() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("root.img");
        let config = disk_config(path.clone(), Some(1_048_576));

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        build(&config, &BuildState::default(), &wire, None).unwrap();
        assert_eq!(path.metadata().unwrap().len(), 1_048_576);
        assert_eq!(wire.disk_allocations(), vec![true]);

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        build(&config, &BuildState::default(), &wire, None).unwrap();
        assert_eq!(path.metadata().unwrap().len(), 1_048_576);
        assert_eq!(wire.disk_allocations(), vec![false]);
    }

    #[tokio::test]
    async fn test_missing_disk_without_auto_create_fails() {
        let temp = TempDir::new().unwrap();
        let config = disk_config(temp.path().join("absent.img"), None);

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        assert!(build(&config, &BuildState::default(), &wire, None).is_err());
    }

    #[tokio::test]
    async fn test_platform_identity_is_stable_across_builds() {
        let temp = TempDir::new().unwrap();
        let config = MachineConfig::builder()
            .cpu_core_count(2)
            .memory_size_in_bytes(1 << 30)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::HardwareModel {
                auxiliary_storage_path: temp.path().join("aux.img"),
                machine_identifier_path: temp.path().join("identity.bin"),
            })
            .build();
        let state = state_with_image(&temp);

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        let first = build(&config, &state, &wire, None).unwrap();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        let second = build(&config, &state, &wire, None).unwrap();

        assert_eq!(first.platform, second.platform);
        match &first.platform {
            PlatformDevice::HardwareModel {
                auxiliary_storage,
                machine_identifier,
                ..
            } => {
                assert_eq!(auxiliary_storage.metadata().unwrap().len(), 1 << 20);
                assert_eq!(machine_identifier.0.len(), 16);
            }
            _ => panic!("expected hardware-model platform"),
        }
    }

    #[tokio::test]
    async fn test_hardware_model_platform_requires_restore_image() {
        let temp = TempDir::new().unwrap();
        let config = MachineConfig::builder()
            .cpu_core_count(2)
            .memory_size_in_bytes(1 << 30)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::HardwareModel {
                auxiliary_storage_path: temp.path().join("aux.img"),
                machine_identifier_path: temp.path().join("identity.bin"),
            })
            .build();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        assert!(matches!(
            build(&config, &BuildState::default(), &wire, None),
            Err(VirtlingError::MissingRestoreImage)
        ));
    }

    #[tokio::test]
    async fn test_efi_variable_store_is_created_on_first_build() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("efivars.bin");
        let config = MachineConfig::builder()
            .cpu_core_count(1)
            .memory_size_in_bytes(1 << 28)
            .boot_loader(BootLoader::Efi {
                variable_store_path: store.clone(),
            })
            .platform(Platform::Generic {})
            .build();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        let graph = build(&config, &BuildState::default(), &wire, None).unwrap();

        assert!(store.exists());
        assert!(matches!(graph.boot, BootDevice::Efi { .. }));
    }

    #[tokio::test]
    async fn test_serial_pipes_are_registered_with_the_wire() {
        let config = MachineConfig::builder()
            .cpu_core_count(1)
            .memory_size_in_bytes(1 << 28)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::Generic {})
            .serial_ports(vec![
                SerialPort {
                    attachment: SerialAttachment::Pipe {
                        tag: "console0".to_string(),
                    },
                    device: SerialPortKind::VirtioConsole {},
                },
                SerialPort {
                    attachment: SerialAttachment::Stdio {},
                    device: SerialPortKind::VirtioConsole {},
                },
            ])
            .build();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        let graph = build(&config, &BuildState::default(), &wire, None).unwrap();

        assert_eq!(graph.serial.len(), 2);
        assert!(wire.pipes().contains("console0"));
        assert!(wire.pipes().contains(STDIN_TAG));
    }

    #[tokio::test]
    async fn test_uart_requires_the_extended_capability_port() {
        let config = MachineConfig::builder()
            .cpu_core_count(1)
            .memory_size_in_bytes(1 << 28)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::Generic {})
            .serial_ports(vec![SerialPort {
                attachment: SerialAttachment::Pipe {
                    tag: "uart0".to_string(),
                },
                device: SerialPortKind::Pl011 {},
            }])
            .build();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        assert!(matches!(
            build(&config, &BuildState::default(), &wire, None),
            Err(VirtlingError::UnsupportedCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_device_order_is_preserved() {
        let temp = TempDir::new().unwrap();
        let config = MachineConfig::builder()
            .cpu_core_count(1)
            .memory_size_in_bytes(1 << 28)
            .boot_loader(BootLoader::HostNative {})
            .platform(Platform::Generic {})
            .storage_devices(vec![
                StorageDevice {
                    attachment: StorageAttachment::DiskImage {
                        path: temp.path().join("a.img"),
                        read_only: false,
                        auto_create_size: Some(4096),
                    },
                    device: StorageBus::VirtioBlock {},
                },
                StorageDevice {
                    attachment: StorageAttachment::NetworkBlock {
                        url: "nbd://host/disk".to_string(),
                        read_only: true,
                    },
                    device: StorageBus::UsbMassStorage {},
                },
            ])
            .build();

        let (wire, _tap) = crate::wire::test_emitter(EmitMode::Structured);
        let graph = build(&config, &BuildState::default(), &wire, None).unwrap();

        assert!(matches!(
            graph.storage[0],
            StorageNode {
                attachment: StorageBacking::DiskImage { .. },
                bus: StorageBusKind::VirtioBlock,
            }
        ));
        assert!(matches!(
            graph.storage[1],
            StorageNode {
                attachment: StorageBacking::NetworkBlock { .. },
                bus: StorageBusKind::UsbMassStorage,
            }
        ));
        assert_eq!(wire.disk_allocations(), vec![true]);
    }
}
