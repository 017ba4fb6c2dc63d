//! Asynchronous preflight resolution.
//!
//! Preflight resolves the configuration entries that need external work
//! before the device graph can be built: locating or downloading the OS
//! restore image. The output is a transient [`BuildState`] consumed only
//! by the device-graph builder; on any failure the whole VM creation
//! sequence aborts and no partial state is carried forward.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::StreamExt;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    config::{MachineConfig, RestoreImageSource},
    hypervisor::{Hypervisor, RestoreImage},
    utils,
    wire::{WireEmitter, WireEvent},
    VirtlingError, VirtlingResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed local path the catalog restore image is downloaded to.
pub const RESTORE_IMAGE_FILE: &str = "restore.img";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Transient state produced by preflight and consumed by the builder.
///
/// Created fresh per VM instantiation and discarded once the device graph
/// exists.
#[derive(Debug, Default)]
pub struct BuildState {
    /// The resolved restore image, if the configuration names one.
    pub restore_image: Option<RestoreImage>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the configuration's restore-image source, if any.
///
/// Emits a start/end pair of `state` events bracketing the resolution and
/// monotonic `installation.download.progress` events while a catalog image
/// downloads. Suspends the caller until resolution completes.
pub async fn preflight<H: Hypervisor>(
    config: &MachineConfig,
    engine: &H,
    wire: &Arc<WireEmitter>,
) -> VirtlingResult<BuildState> {
    let Some(source) = config.get_restore_image() else {
        return Ok(BuildState::default());
    };

    wire.emit(WireEvent::state("preflight.restore_image.start"));

    let image = match source {
        RestoreImageSource::LatestSupported {} => {
            let catalog = engine.latest_restore_image().await?;
            wire.emit(WireEvent::state("installation.download.start"));
            let path = download_restore_image(&catalog.url, RESTORE_IMAGE_FILE, wire).await?;
            wire.emit(WireEvent::state("installation.download.end"));
            engine.load_restore_image(&path).await?
        }
        RestoreImageSource::File { path } => {
            engine
                .load_restore_image(&utils::absolutize(path)?)
                .await?
        }
    };

    wire.emit(WireEvent::state("preflight.restore_image.end"));

    Ok(BuildState {
        restore_image: Some(image),
    })
}

/// Streams the image payload at `url` to `dest`, emitting a progress event
/// at each observed fraction-complete advance.
async fn download_restore_image(
    url: &str,
    dest: impl AsRef<Path>,
    wire: &Arc<WireEmitter>,
) -> VirtlingResult<PathBuf> {
    let dest = utils::absolutize(dest)?;

    let response = reqwest::get(url).await?.error_for_status()?;
    let total = response.content_length().filter(|len| *len > 0);

    let mut file = File::create(&dest).await?;
    let mut stream = response.bytes_stream();

    let mut received: u64 = 0;
    let mut last_percent = -1.0_f64;
    wire.emit(WireEvent::InstallationDownloadProgress { progress: 0.0 });

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| VirtlingError::RestoreImageDownloadFailed(e.to_string()))?;
        file.write_all(&bytes).await?;
        received += bytes.len() as u64;

        if let Some(total) = total {
            let percent = (received as f64 / total as f64) * 100.0;
            if percent > last_percent {
                last_percent = percent;
                wire.emit(WireEvent::InstallationDownloadProgress { progress: percent });
            }
        }
    }

    file.flush().await?;
    Ok(dest)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
