//! Channel multiplexor: many virtual duplex byte streams over one connection.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::error::{TransportError, TransportResult};

pub mod channel;
pub mod frame;

pub use channel::{ChannelReader, ChannelWriter};
pub use frame::MAX_PACKET_SIZE;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for a [`Multiplexor`]
#[derive(Debug, Clone)]
pub struct MultiplexorConfig {
    /// Largest payload carried by a single frame
    pub max_packet_size: usize,
    /// Name used in log records
    pub name: String,
}

impl Default for MultiplexorConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            name: "mux".to_string(),
        }
    }
}

impl MultiplexorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum frame payload size
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.max(1);
        self
    }

    /// Set the name used in log records
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Frame counters collected by a multiplexor
#[derive(Debug, Clone, Default)]
pub struct MultiplexorStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Frames received for a channel nobody claimed
    pub dropped_frames: u64,
}

impl std::fmt::Display for MultiplexorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Multiplexor Statistics:")?;
        writeln!(f, "  Frames sent:       {}", self.frames_sent)?;
        writeln!(f, "  Frames received:   {}", self.frames_received)?;
        writeln!(f, "  Bytes sent:        {}", self.bytes_sent)?;
        writeln!(f, "  Bytes received:    {}", self.bytes_received)?;
        writeln!(f, "  Dropped frames:    {}", self.dropped_frames)?;
        Ok(())
    }
}

#[derive(Default)]
struct ChannelTable {
    inputs: HashMap<u32, mpsc::UnboundedSender<Bytes>>,
    claimed: HashSet<u32>,
    closed: bool,
}

pub(crate) struct Shared {
    config: MultiplexorConfig,
    /// Encoded frames waiting for the writer task; `None` once closed
    outgoing: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    channels: Mutex<ChannelTable>,
    closed: watch::Sender<bool>,
    stats: Mutex<MultiplexorStats>,
    reader_task: Mutex<Option<AbortHandle>>,
}

impl Shared {
    /// Queue `data` for `channel_id` as whole frames, splitting at the
    /// packet size. Frames of one call are queued back to back.
    pub(crate) fn send(&self, channel_id: u32, data: &[u8]) -> TransportResult<()> {
        let outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            return Err(TransportError::Closed);
        };

        let mut frames = 0;
        let mut bytes = 0;
        for chunk in data.chunks(self.config.max_packet_size) {
            let frame = frame::encode_frame(channel_id, chunk);
            bytes += frame.len() as u64;
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            frames += 1;
        }
        drop(outgoing);

        let mut stats = self.stats.lock();
        stats.frames_sent += frames;
        stats.bytes_sent += bytes;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn deliver(&self, channel_id: u32, payload: Bytes) {
        let len = payload.len() as u64;
        let channels = self.channels.lock();
        let Some(input) = channels.inputs.get(&channel_id) else {
            drop(channels);
            self.stats.lock().dropped_frames += 1;
            tracing::warn!(
                mux = %self.config.name,
                channel_id,
                len,
                "frame for unclaimed channel dropped"
            );
            return;
        };

        {
            let mut stats = self.stats.lock();
            stats.frames_received += 1;
            stats.bytes_received += len + frame::FRAME_HEADER_SIZE as u64;
        }

        if input.send(payload).is_err() {
            tracing::debug!(
                mux = %self.config.name,
                channel_id,
                "channel reader dropped, discarding frame"
            );
        }
    }

    /// Mark the connection closed and end every channel's input queue.
    fn close(&self) {
        {
            let mut channels = self.channels.lock();
            channels.closed = true;
            channels.inputs.clear();
        }
        // The writer task drains what is queued, then stops.
        self.outgoing.lock().take();
        self.closed.send_replace(true);
    }
}

/// Splits one duplex byte connection into independent channels.
///
/// Cloning is cheap; all clones share the same connection and reader task.
#[derive(Clone)]
pub struct Multiplexor {
    shared: Arc<Shared>,
}

impl Multiplexor {
    /// Wrap a duplex connection. Must be called within a tokio runtime.
    pub fn new<S>(connection: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(connection, MultiplexorConfig::default())
    }

    pub fn with_config<S>(connection: S, config: MultiplexorConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(connection);
        Self::from_split_with_config(reader, writer, config)
    }

    /// Wrap separate read and write halves, e.g. a child's stdout and stdin.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_split_with_config(reader, writer, MultiplexorConfig::default())
    }

    pub fn from_split_with_config<R, W>(reader: R, writer: W, config: MultiplexorConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        let (outgoing, frames) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            outgoing: Mutex::new(Some(outgoing)),
            channels: Mutex::new(ChannelTable::default()),
            closed,
            stats: Mutex::new(MultiplexorStats::default()),
            reader_task: Mutex::new(None),
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&shared),
            shared.config.name.clone(),
            Box::new(writer),
            frames,
        ));
        let handle = tokio::spawn(read_loop(shared.clone(), reader));
        *shared.reader_task.lock() = Some(handle.abort_handle());

        Self { shared }
    }

    /// Register channel `channel_id` and return its read and write halves.
    ///
    /// Each id may be claimed once per multiplexor. Frames that arrived for
    /// the id before it was claimed were dropped.
    pub fn claim_channel(&self, channel_id: u32) -> TransportResult<(ChannelReader, ChannelWriter)> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut channels = self.shared.channels.lock();
            if !channels.claimed.insert(channel_id) {
                return Err(TransportError::ChannelAlreadyClaimed(channel_id));
            }
            // On a closed connection the sender is dropped here, so the
            // reader sees end-of-stream straight away.
            if !channels.closed {
                channels.inputs.insert(channel_id, tx);
            }
        }

        tracing::debug!(mux = %self.shared.config.name, channel_id, "channel claimed");

        Ok((
            ChannelReader::new(channel_id, rx),
            ChannelWriter::new(channel_id, self.shared.clone()),
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the underlying connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        // The sender lives in `shared`, so this only errors if it was dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stop the reader task and end every channel.
    pub fn shutdown(&self) {
        if let Some(task) = self.shared.reader_task.lock().take() {
            task.abort();
        }
        self.shared.close();
    }

    pub fn config(&self) -> &MultiplexorConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> MultiplexorStats {
        self.shared.stats.lock().clone()
    }
}

impl std::fmt::Debug for Multiplexor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexor")
            .field("name", &self.shared.config.name)
            .field("closed", &self.is_closed())
            .field("channels", &self.shared.channels.lock().claimed.len())
            .finish()
    }
}

/// Sole writer of the connection. Frames arrive whole, so a cancelled
/// channel write can never leave a partial frame behind.
async fn write_loop(
    shared: Weak<Shared>,
    name: String,
    mut writer: BoxedWriter,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::warn!(mux = %name, error = %e, "multiplexor writer failed");
            if let Some(shared) = shared.upgrade() {
                shared.close();
            }
            return;
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!(mux = %name, "multiplexor writer stopped");
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let name = shared.config.name.clone();
    let max = shared.config.max_packet_size;
    tracing::debug!(mux = %name, "multiplexor reader started");

    loop {
        match frame::read_frame(&mut reader, max).await {
            Ok(Some((channel_id, payload))) => shared.deliver(channel_id, payload),
            Ok(None) => {
                tracing::debug!(mux = %name, "connection reached end of stream");
                break;
            }
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(mux = %name, "connection closed mid-frame");
                break;
            }
            Err(e) => {
                tracing::warn!(mux = %name, error = %e, "multiplexor reader failed");
                break;
            }
        }
    }

    shared.close();
    tracing::debug!(mux = %name, "multiplexor reader stopped");
}
