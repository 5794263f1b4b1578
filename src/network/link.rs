//! TCP endpoint owning the connection to one hardware device.
//!
//! Each device role listens on its own port and serves exactly one client at a
//! time. One tokio task per running link accepts a client and runs its receive
//! loop; frames are decoded and dispatched synchronously to the registered
//! listeners on that task. Outgoing requests are queued on a channel drained by
//! a per-connection writer task, so request calls never block.
//!
//! ```text
//! start() ─> [accept] ─> [read frame ─> decode ─> dispatch]* ─> closed ─> [accept] ...
//!                               ▲
//! move_to()/capture() ─> mpsc ─> writer task ─> socket
//! ```

use crate::config::DevicesConfig;
use crate::error::{AppResult, ScanError};
use crate::hardware::DeviceRole;
use crate::network::listeners::ListenerRegistry;
use crate::network::protocol::{self, Frame, FRAME_SIZE};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Default upper bound for a raw payload following a frame (128 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 128 * 1024 * 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Role-specific half of a device link: which frames carry a payload and how
/// decoded frames reach the listeners.
pub trait LinkProtocol: Send + Sync + 'static {
    /// Listener interface notified by this link.
    type Listener: ?Sized + Send + Sync + 'static;

    /// Device role served by this link.
    const ROLE: DeviceRole;

    /// Number of raw bytes following `frame` on the wire.
    fn trailing_len(frame: &Frame) -> usize;

    /// Delivers one received message to every listener, in order.
    fn dispatch(frame: &Frame, payload: Option<Bytes>, listeners: &ListenerRegistry<Self::Listener>);

    /// Tells every listener that the connection went away.
    fn link_lost(listeners: &ListenerRegistry<Self::Listener>);

    /// Listener installed when the link is created; it only logs.
    fn default_listener() -> Arc<Self::Listener>;
}

/// Connection state of a device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not started, or stopped.
    Stopped,
    /// Waiting for the device to connect.
    Listening,
    /// A device is connected from this address.
    Connected(SocketAddr),
}

impl LinkState {
    /// True if a device is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected(_))
    }
}

/// Callback invoked on every connectivity change.
pub type ConnectivityCallback = Arc<dyn Fn(DeviceRole, LinkState) + Send + Sync>;

struct Shared<P: LinkProtocol> {
    listeners: ListenerRegistry<P::Listener>,
    default_listener: Arc<P::Listener>,
    state: watch::Sender<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    bound: Mutex<Option<SocketAddr>>,
    on_connectivity: Mutex<Option<ConnectivityCallback>>,
    max_payload: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Exit {
    Shutdown,
    Closed,
}

impl<P: LinkProtocol> Shared<P> {
    fn publish(&self, state: LinkState) {
        self.state.send_replace(state);
        let callback = lock(&self.on_connectivity).clone();
        if let Some(callback) = callback {
            callback(P::ROLE, state);
        }
    }

    async fn run_server(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Exit::Shutdown = self.serve(stream, peer, &mut shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
        debug!("Server loop exited");
    }

    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx).in_current_span());

        *lock(&self.outbound) = Some(tx);
        info!(%peer, "Device connected");
        self.publish(LinkState::Connected(peer));

        let exit = loop {
            tokio::select! {
                _ = shutdown.changed() => break Exit::Shutdown,
                message = read_message::<P, _>(&mut reader, self.max_payload) => match message {
                    Ok(Some((frame, payload))) => P::dispatch(&frame, payload, &self.listeners),
                    Ok(None) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        info!(%peer, "Device closed the connection");
                        break Exit::Closed;
                    }
                    Err(e) => {
                        error!(%peer, error = %e, "Error while receiving. Connection closed");
                        break Exit::Closed;
                    }
                }
            }
        };

        *lock(&self.outbound) = None;
        writer_task.abort();
        info!(%peer, "Device disconnected");

        if let Exit::Closed = exit {
            self.publish(LinkState::Listening);
        }
        P::link_lost(&self.listeners);
        exit
    }
}

/// Reads one whole frame plus its trailing payload.
///
/// Returns `Ok(None)` for frames that could not be decoded; those are logged
/// and skipped without closing the connection.
async fn read_message<P, R>(
    reader: &mut R,
    max_payload: usize,
) -> io::Result<Option<(Frame, Option<Bytes>)>>
where
    P: LinkProtocol,
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_SIZE];
    reader.read_exact(&mut buf).await?;

    let frame = match protocol::decode(&buf) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable frame");
            return Ok(None);
        }
    };

    let trailing = P::trailing_len(&frame);
    if trailing > max_payload {
        let err = ScanError::PayloadTooLarge {
            len: trailing,
            max: max_payload,
        };
        return Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
    }

    let payload = if trailing > 0 {
        let mut data = vec![0u8; trailing];
        reader.read_exact(&mut data).await?;
        debug!(bytes = trailing, "Payload received");
        Some(Bytes::from(data))
    } else {
        None
    };

    Ok(Some((frame, payload)))
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "Send failed");
            break;
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Server endpoint for one device role.
///
/// Use the role aliases [`crate::hardware::PositionerLink`] and
/// [`crate::hardware::CaptureLink`] rather than naming the protocol type.
pub struct DeviceLink<P: LinkProtocol> {
    bind_addr: SocketAddr,
    shared: Arc<Shared<P>>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl<P: LinkProtocol> DeviceLink<P> {
    /// Creates a stopped link that will listen on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_max_payload(bind_addr, DEFAULT_MAX_PAYLOAD_BYTES)
    }

    /// Creates a stopped link with a custom payload size limit.
    pub fn with_max_payload(bind_addr: SocketAddr, max_payload: usize) -> Self {
        let default_listener = P::default_listener();
        let (state, _) = watch::channel(LinkState::Stopped);
        Self {
            bind_addr,
            shared: Arc::new(Shared {
                listeners: ListenerRegistry::with_default(P::ROLE.as_str(), default_listener.clone()),
                default_listener,
                state,
                outbound: Mutex::new(None),
                bound: Mutex::new(None),
                on_connectivity: Mutex::new(None),
                max_payload,
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Creates a stopped link on the configured address for this role.
    pub fn from_config(devices: &DevicesConfig) -> AppResult<Self> {
        Ok(Self::with_max_payload(
            devices.bind_addr(P::ROLE)?,
            devices.max_payload_bytes,
        ))
    }

    /// Device role of this link.
    pub fn role(&self) -> DeviceRole {
        P::ROLE
    }

    /// Opens the listening socket and launches the accept/receive task.
    ///
    /// Calling `start` on a running link logs a warning and does nothing.
    pub async fn start(&self) -> AppResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!(role = %P::ROLE, "Link already running");
            return Ok(());
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *lock(&self.shared.bound) = Some(local_addr);
        self.shared.publish(LinkState::Listening);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task = tokio::spawn(
            async move { shared.run_server(listener, shutdown_rx).await }
                .instrument(info_span!("device_link", role = %P::ROLE)),
        );
        *worker = Some(Worker { shutdown, task });

        info!(role = %P::ROLE, %local_addr, "Link started");
        Ok(())
    }

    /// Closes the connection and listening socket and waits for the task to exit.
    ///
    /// Calling `stop` on a stopped link logs a warning and does nothing.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            warn!(role = %P::ROLE, "Link not running");
            return;
        };

        let _ = worker.shutdown.send(true);
        if let Err(e) = worker.task.await {
            error!(role = %P::ROLE, error = %e, "Link task failed");
        }

        *lock(&self.shared.outbound) = None;
        *lock(&self.shared.bound) = None;
        self.shared.publish(LinkState::Stopped);
        info!(role = %P::ROLE, "Link stopped");
    }

    /// True iff a device is currently connected.
    pub fn is_ready(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.bound).is_some()
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Address the listening socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.bound)
    }

    /// Receiver that observes every connection state change.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Waits until a device is connected, up to `timeout`. Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(LinkState::is_connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Installs the callback invoked on every connectivity change.
    pub fn set_connectivity_callback(&self, callback: ConnectivityCallback) {
        *lock(&self.shared.on_connectivity) = Some(callback);
    }

    /// Registry of listeners notified by this link.
    pub fn listeners(&self) -> &ListenerRegistry<P::Listener> {
        &self.shared.listeners
    }

    /// The logging listener installed at creation, e.g. to remove it.
    pub fn default_listener(&self) -> Arc<P::Listener> {
        self.shared.default_listener.clone()
    }

    /// Queues raw frame bytes for the connected device.
    ///
    /// Returns false when no device is connected; the bytes are dropped.
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        match lock(&self.shared.outbound).as_ref() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Encodes and queues one request, warning if no device is connected.
    pub(crate) fn send_request(&self, bytes: Bytes, what: &str) {
        if self.send_bytes(bytes) {
            debug!(role = %P::ROLE, request = what, "Request queued");
        } else {
            warn!(role = %P::ROLE, request = what, "Device not connected, request dropped");
        }
    }
}

impl<P: LinkProtocol> std::fmt::Debug for DeviceLink<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("role", &P::ROLE)
            .field("bind_addr", &self.bind_addr)
            .field("state", &self.state())
            .finish()
    }
}
