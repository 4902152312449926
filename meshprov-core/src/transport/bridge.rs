//! TCP link to the device bridge.
//!
//! The bridge owns the serial port and the binary ACI encoding. Both directions
//! carry one JSON object per line: commands out, decoded events in.

use crate::aci::command::opcode_name;
use crate::aci::{Command, Event};
use crate::error::{MeshError, Result};
use crate::transport::Transport;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inbound events buffered between the bridge reader and the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 256;

/// How long the writer gets to flush queued commands on shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct BridgeTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport for BridgeTransport {
    fn send(&self, command: Command) -> Result<()> {
        debug!("-> {command} ({name})", name = opcode_name(command.opcode()));
        self.commands
            .send(command)
            .map_err(|_| MeshError::Transport("device bridge writer has stopped".to_string()))
    }
}

/// The reader and writer tasks of one bridge connection.
pub struct BridgeTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stop: Arc<Notify>,
}

impl BridgeTasks {
    /// Stop reading, let the writer flush what is queued, and drop the socket.
    pub async fn shutdown(mut self) {
        self.reader.abort();
        self.stop.notify_one();
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            warn!("Bridge writer did not finish flushing");
            self.writer.abort();
        }
        debug!("Bridge I/O stopped");
    }
}

/// A connected bridge: the command sender, the event stream and the two I/O tasks.
pub struct Bridge {
    pub transport: BridgeTransport,
    pub events: mpsc::Receiver<Event>,
    tasks: BridgeTasks,
}

impl Bridge {
    pub async fn connect(address: &str) -> Result<Self> {
        info!("Connecting to device bridge at {address}");
        let stream = TcpStream::connect(address).await.map_err(|e| {
            MeshError::Transport(format!("failed to connect to device bridge at {address}: {e}"))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| MeshError::Transport(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self::spawn(BufReader::new(read_half), write_half))
    }

    /// Wire the reader and writer tasks onto arbitrary byte streams.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let stop = Arc::new(Notify::new());

        Self {
            transport: BridgeTransport {
                commands: command_tx,
            },
            events: event_rx,
            tasks: BridgeTasks {
                reader: tokio::spawn(read_events(reader, event_tx)),
                writer: tokio::spawn(write_commands(writer, command_rx, stop.clone())),
                stop,
            },
        }
    }

    pub fn into_parts(self) -> (BridgeTransport, mpsc::Receiver<Event>, BridgeTasks) {
        (self.transport, self.events, self.tasks)
    }
}

async fn read_events<R>(reader: R, events: mpsc::Sender<Event>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            debug!("Event consumer gone, stopping bridge reader");
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable event line: {e}"),
                }
            }
            Ok(None) => {
                info!("Device bridge closed the connection");
                break;
            }
            Err(e) => {
                warn!("Device bridge read failed: {e}");
                break;
            }
        }
    }
}

async fn write_commands<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stop: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if write_command(&mut writer, &command).await.is_err() {
                    break;
                }
            }
            _ = stop.notified() => {
                while let Ok(command) = commands.try_recv() {
                    if write_command(&mut writer, &command).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    debug!("Bridge writer stopped");
}

async fn write_command<W>(writer: &mut W, command: &Command) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = match serde_json::to_vec(command) {
        Ok(line) => line,
        Err(e) => {
            warn!("Failed to encode {command}: {e}");
            return Ok(());
        }
    };
    line.push(b'\n');
    if let Err(e) = writer.write_all(&line).await {
        warn!("Device bridge write failed: {e}");
        return Err(e);
    }
    writer.flush().await.inspect_err(|e| warn!("Device bridge flush failed: {e}"))
}
