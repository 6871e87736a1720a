//! Agent transport: one inbound TCP listener per agent, one short-lived
//! outbound connection per envelope, all on a dedicated network thread
//! running a single-threaded tokio runtime.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::identity::{Identity, NodeId};
use crate::protocol::{Envelope, PROTOCOL_VERSION};
use crate::wire::{self, Frame, LEN_SIZE};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback for each decoded inbound envelope. Runs on a blocking worker.
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// What a protocol needs from its transport.
pub trait Link: Send + 'static {
    /// Fire-and-forget. Never blocks the caller; failures are logged.
    fn send(&self, envelope: Envelope, remote: &NodeId);

    /// Idempotent.
    fn stop(&mut self);

    fn is_stopped(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Upper bound on concurrently running inbound callbacks.
    pub workers: usize,
    pub connect_timeout: Duration,
    /// How long `stop` waits for in-flight sends and receives.
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start network thread: {0}")]
    Spawn(#[from] io::Error),
}

enum Command {
    Send { envelope: Envelope, remote: NodeId },
    Shutdown,
}

/// A bound transport. Dropping it stops it.
pub struct Transport {
    local_addr: SocketAddr,
    identity: Option<NodeId>,
    commands: mpsc::UnboundedSender<Command>,
    stopped: bool,
    thread: Option<JoinHandle<()>>,
}

impl Transport {
    /// Bind `local` (`host:port`, `*` for all interfaces, port 0 for
    /// ephemeral) and start the network thread.
    pub fn bind(
        local: &str,
        identity: Identity,
        config: TransportConfig,
        handler: InboundHandler,
    ) -> Result<Self, TransportError> {
        let bind_err = |source: io::Error| TransportError::Bind {
            addr: local.to_string(),
            source,
        };
        let addr = resolve(local).map_err(bind_err)?;
        let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let identity = identity.resolve(local_addr);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(config.workers.max(1))
            .thread_name("sins-worker")
            .build()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let loop_identity = identity.clone();
        let thread = std::thread::Builder::new()
            .name(format!("sins-net-{}", local_addr.port()))
            .spawn(move || {
                runtime.block_on(network_loop(listener, command_rx, loop_identity, handler, config));
            })?;

        info!(%local_addr, identity = ?identity, "transport bound");
        Ok(Self {
            local_addr,
            identity,
            commands,
            stopped: false,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fixed identity attached to outbound connections, if any.
    pub fn identity(&self) -> Option<&NodeId> {
        self.identity.as_ref()
    }

    /// The id peers should address this agent by: the fixed identity, or
    /// the bound address.
    pub fn local_id(&self) -> NodeId {
        self.identity
            .clone()
            .unwrap_or_else(|| NodeId::from(self.local_addr))
    }
}

impl Link for Transport {
    fn send(&self, envelope: Envelope, remote: &NodeId) {
        if self.stopped {
            warn!(%envelope, "transport stopped; send dropped");
            return;
        }
        debug!(%envelope, "queueing send");
        let command = Command::Send {
            envelope,
            remote: remote.clone(),
        };
        if self.commands.send(command).is_err() {
            warn!(%remote, "network loop gone; send dropped");
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        debug!(local_addr = %self.local_addr, "stopping transport");
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(local_addr = %self.local_addr, "network thread panicked");
            }
        }
        info!(local_addr = %self.local_addr, "transport stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    let addr = match addr.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {}", addr))
    })
}

async fn network_loop(
    std_listener: std::net::TcpListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    identity: Option<NodeId>,
    handler: InboundHandler,
    config: TransportConfig,
) {
    let listener = match TcpListener::from_std(std_listener) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "cannot register listener");
            return;
        }
    };
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tasks.spawn(receive(stream, peer, handler.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            command = commands.recv() => match command {
                Some(Command::Send { envelope, remote }) => {
                    tasks.spawn(deliver(envelope, remote, identity.clone(), config.connect_timeout));
                }
                Some(Command::Shutdown) | None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "network task failed");
                }
            }
        }
    }

    drop(listener);
    // Pick up sends queued just before the shutdown command.
    while let Ok(Command::Send { envelope, remote }) = commands.try_recv() {
        tasks.spawn(deliver(envelope, remote, identity.clone(), config.connect_timeout));
    }
    debug!(in_flight = tasks.len(), "listener closed; draining");
    let drained = tokio::time::timeout(config.drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(aborted = tasks.len(), "drain timed out; aborting remaining tasks");
        tasks.shutdown().await;
    }
}

async fn deliver(envelope: Envelope, remote: NodeId, identity: Option<NodeId>, connect_timeout: Duration) {
    let kind = envelope.kind;
    match send_once(envelope, &remote, identity, connect_timeout).await {
        Ok(()) => debug!(%kind, %remote, "sent"),
        Err(e) => warn!(%kind, %remote, error = %e, "send failed"),
    }
}

async fn send_once(
    envelope: Envelope,
    remote: &NodeId,
    identity: Option<NodeId>,
    connect_timeout: Duration,
) -> io::Result<()> {
    let mut bytes = wire::encode_frame(&Frame::hello(identity)).map_err(invalid_data)?;
    bytes.extend(wire::encode_frame(&Frame::Envelope(envelope)).map_err(invalid_data)?);
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(remote.as_str()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

async fn receive(mut stream: TcpStream, peer: SocketAddr, handler: InboundHandler) {
    let identity = match read_frame(&mut stream).await {
        Ok(Some(Frame::Hello {
            protocol_version,
            identity,
        })) if protocol_version == PROTOCOL_VERSION => identity,
        Ok(Some(Frame::Hello {
            protocol_version, ..
        })) => {
            warn!(%peer, protocol_version, "unsupported protocol version; dropping connection");
            return;
        }
        Ok(Some(Frame::Envelope(_))) => {
            warn!(%peer, "envelope before preamble; dropping connection");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            warn!(%peer, error = %e, "malformed preamble; dropping connection");
            return;
        }
    };
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(Frame::Envelope(envelope))) => {
                // A sender with a fixed identity may only speak for itself.
                if let Some(id) = identity.as_ref().filter(|id| **id != envelope.src) {
                    warn!(%peer, identity = %id, src = %envelope.src, "source contradicts preamble identity; envelope dropped");
                    continue;
                }
                debug!(%peer, %envelope, "received");
                let handler = handler.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || handler(envelope)).await {
                    warn!(%peer, error = %e, "inbound handler failed");
                }
            }
            Ok(Some(Frame::Hello { .. })) => {
                warn!(%peer, "repeated preamble; dropping connection");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(%peer, error = %e, "malformed frame; dropping connection");
                return;
            }
        }
    }
}

/// Read one frame. `Ok(None)` on a clean close at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut prefix = [0u8; LEN_SIZE];
    let n = reader.read(&mut prefix).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[n..]).await?;
    let len = wire::frame_len(prefix).map_err(invalid_data)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    wire::decode_body(&body).map(Some).map_err(invalid_data)
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}
