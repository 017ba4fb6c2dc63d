use std::sync::{Arc, Mutex};

use tokio::{
    io::{self, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{VirtlingError, VirtlingResult};

use super::{GuestEndpoint, PipeRegistry, WireEvent, PIPE_CAPACITY, STDIN_TAG};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How events are rendered on the diagnostic output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// One newline-terminated JSON record per event.
    Structured,

    /// Only events with a natural-language rendering are printed.
    HumanReadable,
}

/// The wire-protocol emitter.
///
/// Owned by the lifecycle controller and injected into the preflight
/// resolver and the device-graph builder. Emission is fire-and-forget: the
/// event is queued on an unbounded channel and written out by a background
/// task, so emitting never blocks machine progress. Write failures are
/// best-effort and logged, never surfaced to the emitting caller.
///
/// Besides the event stream the emitter tracks the two pieces of build
/// output the controller reads back later: the named-pipe registry and the
/// ordered disk-allocation ledger.
#[derive(Debug)]
pub struct WireEmitter {
    /// The emission mode.
    mode: EmitMode,

    /// The channel into the background writer task.
    tx: mpsc::UnboundedSender<WireEvent>,

    /// The named bidirectional pipes registered during build.
    pipes: PipeRegistry,

    /// One flag per built disk-image attachment, in device order.
    disk_allocations: Mutex<Vec<bool>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WireEmitter {
    /// Creates an emitter writing to the process's standard error stream.
    pub fn stderr(mode: EmitMode) -> Arc<Self> {
        Self::with_writer(mode, io::stderr())
    }

    /// Creates an emitter writing to an arbitrary sink.
    pub fn with_writer<W>(mode: EmitMode, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_writer(mode, writer, rx);

        Arc::new(Self {
            mode,
            tx,
            pipes: PipeRegistry::default(),
            disk_allocations: Mutex::new(Vec::new()),
        })
    }

    /// Queues an event for emission. Never blocks.
    pub fn emit(&self, event: WireEvent) {
        let _ = self.tx.send(event);
    }

    /// The emission mode.
    pub fn mode(&self) -> EmitMode {
        self.mode
    }

    /// The named-pipe registry.
    pub fn pipes(&self) -> &PipeRegistry {
        &self.pipes
    }

    /// Records whether a disk-image attachment was freshly allocated.
    ///
    /// Called once per disk-image attachment during build, in device
    /// order; the lifecycle controller reads the ledger back to decide
    /// automatic install-mode.
    pub fn record_disk_allocation(&self, allocated: bool) {
        self.disk_allocations.lock().unwrap().push(allocated);
    }

    /// The recorded disk-allocation flags, in device order.
    pub fn disk_allocations(&self) -> Vec<bool> {
        self.disk_allocations.lock().unwrap().clone()
    }

    /// Registers a bidirectional pipe pair under `tag`.
    ///
    /// The host-facing output half is pumped by a background task that
    /// re-emits everything the guest writes as `data` events carrying the
    /// tag.
    pub fn register_pipe(self: &Arc<Self>, tag: &str) -> VirtlingResult<()> {
        let (host_writer, guest_input) = io::duplex(PIPE_CAPACITY);
        let (guest_output, host_reader) = io::duplex(PIPE_CAPACITY);

        self.pipes.insert(
            tag,
            host_writer,
            GuestEndpoint {
                input: guest_input,
                output: guest_output,
            },
        )?;

        let wire = Arc::clone(self);
        let tag = tag.to_string();
        tokio::spawn(async move {
            let mut reader = host_reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => wire.emit(WireEvent::data(tag.clone(), &buf[..n])),
                    Err(e) => {
                        wire.emit(WireEvent::error(e));
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Registers the stdio passthrough pipes under the `stdin` tag.
    ///
    /// Process stdin is pumped into the guest-input pipe (sharing the tag
    /// the signal forwarder writes to) and guest output is pumped to
    /// process stdout verbatim.
    pub fn register_stdio(self: &Arc<Self>) -> VirtlingResult<()> {
        let (host_writer, guest_input) = io::duplex(PIPE_CAPACITY);
        let (guest_output, host_reader) = io::duplex(PIPE_CAPACITY);

        self.pipes.insert(
            STDIN_TAG,
            host_writer,
            GuestEndpoint {
                input: guest_input,
                output: guest_output,
            },
        )?;

        let wire = Arc::clone(self);
        tokio::spawn(async move {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = wire.write_host(STDIN_TAG, &buf[..n]).await {
                            wire.emit(WireEvent::error(e));
                            break;
                        }
                    }
                    Err(e) => {
                        wire.emit(WireEvent::error(e));
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut reader = host_reader;
            let mut stdout = io::stdout();
            if let Err(e) = io::copy(&mut reader, &mut stdout).await {
                tracing::warn!("stdio passthrough ended: {}", e);
            }
        });

        Ok(())
    }

    /// Writes bytes into the guest-input side of the pipe under `tag`.
    pub async fn write_host(&self, tag: &str, data: &[u8]) -> VirtlingResult<()> {
        let writer = self
            .pipes
            .host_writer(tag)
            .ok_or_else(|| VirtlingError::UnknownPipeTag(tag.to_string()))?;

        let mut writer = writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn spawn_writer<W>(mode: EmitMode, mut writer: W, mut rx: mpsc::UnboundedReceiver<WireEvent>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match mode {
                EmitMode::Structured => match serde_json::to_vec(&event) {
                    Ok(mut bytes) => {
                        bytes.push(b'\n');
                        bytes
                    }
                    Err(e) => {
                        tracing::warn!("failed to encode wire event: {}", e);
                        continue;
                    }
                },
                EmitMode::HumanReadable => match event.user_message() {
                    Some(message) => {
                        let mut bytes = message.into_bytes();
                        bytes.push(b'\n');
                        bytes
                    }
                    None => continue,
                },
            };

            if let Err(e) = writer.write_all(&line).await {
                tracing::warn!("failed to write wire event: {}", e);
                continue;
            }
            let _ = writer.flush().await;
        }
    });
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn emitter_with_sink(mode: EmitMode) -> (Arc<WireEmitter>, BufReader<io::DuplexStream>) {
        let (sink, tap) = io::duplex(PIPE_CAPACITY);
        (WireEmitter::with_writer(mode, sink), BufReader::new(tap))
    }

    #[tokio::test]
    async fn test_structured_mode_emits_one_record_per_line() {
        let (wire, mut tap) = emitter_with_sink(EmitMode::Structured);

        wire.emit(WireEvent::state("preflight.start"));
        wire.emit(WireEvent::notify("disk.allocated"));

        let mut line = String::new();
        tap.read_line(&mut line).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["type"], "state");
        assert_eq!(record["state"], "preflight.start");

        line.clear();
        tap.read_line(&mut line).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["type"], "notify");
        assert_eq!(record["event"], "disk.allocated");
    }

    #[tokio::test]
    async fn test_human_mode_suppresses_structural_events() {
        let (wire, mut tap) = emitter_with_sink(EmitMode::HumanReadable);

        wire.emit(WireEvent::state("configure.start"));
        wire.emit(WireEvent::notify("started"));
        wire.emit(WireEvent::error("it broke"));

        let mut line = String::new();
        tap.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ERROR: it broke\n");
    }

    #[tokio::test]
    async fn test_registered_pipe_reemits_guest_output_as_data_events() {
        let (wire, mut tap) = emitter_with_sink(EmitMode::Structured);

        wire.register_pipe("console0").unwrap();
        assert!(wire.pipes().contains("console0"));

        let mut endpoint = wire.pipes().take_guest_endpoint("console0").unwrap();
        endpoint.output.write_all(b"hello").await.unwrap();

        let mut line = String::new();
        tap.read_line(&mut line).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["type"], "data");
        assert_eq!(record["tag"], "console0");
        assert_eq!(record["data"], "aGVsbG8=");
    }

    #[tokio::test]
    async fn test_write_host_reaches_guest_input() {
        let (wire, _tap) = emitter_with_sink(EmitMode::Structured);

        wire.register_pipe(STDIN_TAG).unwrap();
        let mut endpoint = wire.pipes().take_guest_endpoint(STDIN_TAG).unwrap();

        wire.write_host(STDIN_TAG, &[0x03]).await.unwrap();

        let mut buf = [0u8; 1];
        endpoint.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x03]);
    }

    #[tokio::test]
    async fn test_duplicate_pipe_tag_is_rejected() {
        let (wire, _tap) = emitter_with_sink(EmitMode::Structured);

        wire.register_pipe("console0").unwrap();
        assert!(matches!(
            wire.register_pipe("console0"),
            Err(VirtlingError::DuplicatePipeTag(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_allocation_ledger_preserves_order() {
        let (wire, _tap) = emitter_with_sink(EmitMode::Structured);

        wire.record_disk_allocation(true);
        wire.record_disk_allocation(false);
        wire.record_disk_allocation(true);

        assert_eq!(wire.disk_allocations(), vec![true, false, true]);
    }
}
