use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::network::connection::{AtomicConnectionState, Connection, ConnectionState};
use crate::network::endpoint::{Endpoint, EndpointMessage};
use crate::network::framing::{encode_frame, FrameDecoder};
use crate::network::inbox::{deliver, InboundSender};
use crate::network::retry::RetryPolicy;
use crate::network::transport_config::TransportConfig;
use crate::util::sync::locked;


const READ_BUFFER_SIZE: usize = 64*1024;

enum Command {
    /// a socket bound to a local port, reserving the port for a later outgoing connect
    Reserve(TcpSocket, u16),
    Connect(Endpoint),
    Accepted(TcpStream),
    Send(Bytes),
    ReadClosed { generation: u64, reason: String },
    Close,
}

struct Shared {
    state: AtomicConnectionState,
    /// number of payloads accepted by `send` that were neither written nor dropped yet
    pending: AtomicUsize,
    connect_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, error: String) {
        *locked(&self.last_error) = Some(error);
    }
}

/// A TCP connection to a single peer: `disconnected -> connecting -> connected`, and back to
///  `disconnected` on any I/O error or explicit close.
///
/// The socket is owned by a task on the owning queue's event loop; this handle talks to it
///  through a channel. Sends are always queued, so data sent before the connection is
///  established goes out once it is.
pub struct TcpConnection {
    endpoint: Mutex<Endpoint>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    block_poll_interval: Duration,
}

impl TcpConnection {
    /// a disconnected connection that is connected later with [TcpConnection::connect]
    pub fn outgoing(endpoint: Endpoint, config: Arc<TransportConfig>, inbound: InboundSender, runtime: &Handle) -> TcpConnection {
        Self::spawn(endpoint, ConnectionState::Disconnected, true, config, inbound, runtime)
    }

    /// wraps a socket accepted by a listener; must be called on the event loop that owns it
    pub fn incoming(stream: TcpStream, peer_addr: SocketAddr, config: Arc<TransportConfig>, inbound: InboundSender) -> TcpConnection {
        let connection = Self::spawn(Endpoint::tcp(peer_addr), ConnectionState::Connecting, false, config, inbound, &Handle::current());
        let _ = connection.commands.send(Command::Accepted(stream));
        connection
    }

    fn spawn(endpoint: Endpoint, state: ConnectionState, reconnectable: bool, config: Arc<TransportConfig>, inbound: InboundSender, runtime: &Handle) -> TcpConnection {
        let shared = Arc::new(Shared {
            state: AtomicConnectionState::new(state),
            pending: AtomicUsize::new(0),
            connect_attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
        });
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            endpoint: endpoint.clone(),
            shared: shared.clone(),
            config: config.clone(),
            inbound,
            commands: command_receiver,
            notify: commands.downgrade(),
            reconnectable,
            outgoing: VecDeque::new(),
            writer: None,
            reader: None,
            generation: 0,
            reserved: None,
        };
        runtime.spawn(task.run());

        TcpConnection {
            endpoint: Mutex::new(endpoint),
            shared,
            commands,
            block_poll_interval: config.block_poll_interval,
        }
    }

    /// Opens a socket with `SO_REUSEADDR` and keep-alive and binds it to a local port, which an
    ///  outgoing connect will then use. Port 0 picks an ephemeral port.
    pub fn bind(&self, port: u16) -> bool {
        match Self::reserve_port(port) {
            Ok((socket, port)) => {
                debug!("bound local port {}", port);
                self.commands.send(Command::Reserve(socket, port)).is_ok()
            }
            Err(e) => {
                warn!("binding local port {} failed: {}", port, e);
                self.shared.record_error(e.to_string());
                false
            }
        }
    }

    fn reserve_port(port: u16) -> anyhow::Result<(TcpSocket, u16)> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let port = socket.local_addr()?.port();
        Ok((socket, port))
    }

    /// Starts connecting to `endpoint`, retrying with a fixed backoff. Only valid while
    ///  disconnected; returns `false` otherwise.
    pub fn connect(&self, endpoint: Endpoint) -> bool {
        if !self.shared.state.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return false;
        }
        *locked(&self.endpoint) = endpoint.clone();
        if self.commands.send(Command::Connect(endpoint)).is_err() {
            self.shared.state.set(ConnectionState::Disconnected);
            return false;
        }
        true
    }

    /// idempotent
    pub fn close(&self) {
        self.shared.state.set(ConnectionState::Disconnected);
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn last_error(&self) -> Option<String> {
        locked(&self.shared.last_error).clone()
    }

    /// total number of connect attempts made so far, including retries
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::Acquire)
    }

    /// `false` if the connection is disconnected before everything queued was written
    fn wait_until_sent(&self) -> bool {
        loop {
            if self.state() == ConnectionState::Disconnected {
                return false;
            }
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return true;
            }
            std::thread::sleep(self.block_poll_interval);
        }
    }
}

impl Connection for TcpConnection {
    /// A blocking send returns `false` if the connection is or becomes disconnected before the
    ///  payload was written. An outgoing connection keeps it queued for the next connect.
    ///
    /// NB: a blocking send must not be called from the event loop that owns the connection
    fn send(&self, data: Bytes, block: bool) -> bool {
        if data.is_empty() {
            debug!("ignoring empty payload");
            return false;
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(Command::Send(data)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        if block {
            return self.wait_until_sent();
        }
        true
    }

    fn endpoint(&self) -> Endpoint {
        locked(&self.endpoint).clone()
    }

    fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}


struct ConnectionTask {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    config: Arc<TransportConfig>,
    inbound: InboundSender,
    commands: mpsc::UnboundedReceiver<Command>,
    notify: mpsc::WeakUnboundedSender<Command>,
    /// accepted connections can not be re-established from this side
    reconnectable: bool,

    outgoing: VecDeque<Bytes>,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    /// distinguishes notifications from a previous socket's read pump
    generation: u64,
    reserved: Option<(TcpSocket, u16)>,
}

impl ConnectionTask {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Reserve(socket, port) => {
                    self.reserved = Some((socket, port));
                }
                Command::Connect(endpoint) => {
                    self.endpoint = endpoint;
                    self.connect().await;
                    self.flush().await;
                }
                Command::Accepted(stream) => {
                    self.established(stream);
                    self.flush().await;
                }
                Command::Send(data) => {
                    self.outgoing.push_back(data);
                    self.flush().await;
                }
                Command::ReadClosed { generation, reason } => {
                    if generation == self.generation {
                        debug!(endpoint = %self.endpoint, "connection closed: {}", reason);
                        self.close(Some(reason));
                    }
                }
                Command::Close => {
                    self.close(None);
                }
            }
        }
        self.close(None);
    }

    async fn connect(&mut self) {
        if self.writer.is_some() {
            self.close(None);
        }
        self.shared.state.set(ConnectionState::Connecting);

        // the reservation only holds the port - every attempt binds a fresh socket to it
        let local_port = self.reserved.take().map(|(_, port)| port);
        let policy = RetryPolicy {
            retries: self.config.connect_retries,
            backoff: self.config.connect_retry_backoff,
        };
        let target = self.endpoint.host_and_port();
        let shared = self.shared.clone();

        let result = policy.run(&format!("connecting to {}", self.endpoint), |_| {
            shared.connect_attempts.fetch_add(1, Ordering::AcqRel);
            open_stream(target.clone(), local_port)
        }).await;

        match result {
            Ok(stream) => {
                info!(endpoint = %self.endpoint, "connected");
                self.established(stream);
            }
            Err(e) => {
                self.shared.record_error(e.to_string());
                self.shared.state.set(ConnectionState::Disconnected);
            }
        }
    }

    fn established(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %self.endpoint, "could not set TCP_NODELAY: {}", e);
        }

        self.generation += 1;
        let (reader, writer) = stream.into_split();
        self.writer = Some(writer);
        self.reader = Some(tokio::spawn(read_loop(
            reader,
            self.endpoint.clone(),
            self.inbound.clone(),
            self.notify.clone(),
            self.generation,
            self.config.max_frame_len,
        )));
        self.shared.state.set(ConnectionState::Connected);
    }

    /// writes queued payloads one at a time
    async fn flush(&mut self) {
        if self.shared.state.get() != ConnectionState::Connected {
            return;
        }

        while let Some(data) = self.outgoing.front() {
            let Some(writer) = self.writer.as_mut() else {
                return;
            };

            let mut frame = BytesMut::new();
            encode_frame(data, &mut frame);
            match writer.write_all(&frame).await {
                Ok(()) => {
                    trace!(endpoint = %self.endpoint, "sent {} bytes", data.len());
                    self.outgoing.pop_front();
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, "write failed, dropping {} queued payloads: {}", self.outgoing.len(), e);
                    self.close(Some(e.to_string()));
                    self.drop_outgoing();
                    return;
                }
            }
        }
    }

    fn close(&mut self, reason: Option<String>) {
        if let Some(reason) = reason {
            self.shared.record_error(reason);
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.shared.state.set(ConnectionState::Disconnected);

        if !self.reconnectable {
            self.drop_outgoing();
        }
    }

    fn drop_outgoing(&mut self) {
        let num_dropped = self.outgoing.len();
        self.outgoing.clear();
        self.shared.pending.fetch_sub(num_dropped, Ordering::AcqRel);
    }
}

async fn open_stream(target: String, local_port: Option<u16>) -> anyhow::Result<TcpStream> {
    let addr = tokio::net::lookup_host(&target).await?
        .next()
        .ok_or_else(|| anyhow!("{} does not resolve to an address", target))?;

    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    if let Some(port) = local_port {
        let local = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], port))
        }
        else {
            SocketAddr::from(([0u16; 8], port))
        };
        socket.bind(local)?;
    }
    Ok(socket.connect(addr).await?)
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    endpoint: Endpoint,
    inbound: InboundSender,
    notify: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
    max_frame_len: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "closed by peer".to_string(),
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(data)) => {
                            trace!(endpoint = %endpoint, "received {} bytes", data.len());
                            deliver(&inbound, EndpointMessage { endpoint: endpoint.clone(), data });
                        }
                        Ok(None) => break,
                        Err(e) => warn!(endpoint = %endpoint, "malformed frame: {}", e),
                    }
                }
            }
            Err(e) => break e.to_string(),
        }
    };

    if let Some(commands) = notify.upgrade() {
        let _ = commands.send(Command::ReadClosed { generation, reason });
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use crate::network::event_loop::EventLoop;
    use crate::network::inbox::Inbox;
    use crate::test_util::wait_for;
    use super::*;

    fn config() -> Arc<TransportConfig> {
        let mut config = TransportConfig::new();
        config.connect_retries = 2;
        config.connect_retry_backoff = Duration::from_millis(10);
        config.block_poll_interval = Duration::from_millis(1);
        Arc::new(config)
    }

    fn local_endpoint(listener: &TcpListener) -> Endpoint {
        Endpoint::tcp(listener.local_addr().unwrap())
    }

    #[test]
    fn test_send_after_connect() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let connection = TcpConnection::outgoing(local_endpoint(&listener), config(), inbound, event_loop.handle());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.connect(local_endpoint(&listener)));
        assert!(!connection.connect(local_endpoint(&listener)));

        let (mut peer, _) = listener.accept().unwrap();
        wait_for("connected", || connection.state() == ConnectionState::Connected);

        assert!(connection.send(Bytes::from_static(b"hello"), true));
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"!5:hello");
    }

    #[test]
    fn test_sends_before_connect_are_flushed() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let connection = TcpConnection::outgoing(local_endpoint(&listener), config(), inbound, event_loop.handle());
        assert!(connection.send(Bytes::from_static(b"a"), false));
        assert!(connection.send(Bytes::from_static(b"bc"), false));
        assert!(connection.connect(local_endpoint(&listener)));

        let (mut peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"!1:a!2:bc");
    }

    #[test]
    fn test_received_frames_are_delivered() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, inbox) = Inbox::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let connection = TcpConnection::outgoing(local_endpoint(&listener), config(), inbound, event_loop.handle());
        assert!(connection.connect(local_endpoint(&listener)));
        let (mut peer, _) = listener.accept().unwrap();

        peer.write_all(b"x!3:abc!2:").unwrap();
        peer.flush().unwrap();
        let received = inbox.receive_timeout(Duration::from_secs(5), Duration::from_millis(1)).unwrap();
        assert_eq!(received.data, Bytes::from_static(b"abc"));
        assert_eq!(received.endpoint, local_endpoint(&listener));

        peer.write_all(b"de").unwrap();
        let received = inbox.receive_timeout(Duration::from_secs(5), Duration::from_millis(1)).unwrap();
        assert_eq!(received.data, Bytes::from_static(b"de"));
    }

    #[test]
    fn test_connect_gives_up_after_retries() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let endpoint = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            local_endpoint(&listener)
        };

        let connection = TcpConnection::outgoing(endpoint.clone(), config(), inbound, event_loop.handle());
        assert!(connection.connect(endpoint));
        wait_for("retries exhausted", || connection.connect_attempts() == 3 && connection.is_disconnected());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connection.connect_attempts(), 3);
        assert!(connection.last_error().is_some());
    }

    #[test]
    fn test_peer_close_disconnects() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let connection = TcpConnection::outgoing(local_endpoint(&listener), config(), inbound, event_loop.handle());
        assert!(connection.connect(local_endpoint(&listener)));
        let (peer, _) = listener.accept().unwrap();
        wait_for("connected", || connection.state() == ConnectionState::Connected);

        drop(peer);
        wait_for("disconnected", || connection.is_disconnected());
        assert_eq!(connection.last_error().as_deref(), Some("closed by peer"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let connection = TcpConnection::outgoing(local_endpoint(&listener), config(), inbound, event_loop.handle());
        assert!(connection.connect(local_endpoint(&listener)));
        let _peer = listener.accept().unwrap();

        connection.close();
        connection.close();
        assert!(connection.is_disconnected());
    }

    #[test]
    fn test_blocking_send_reports_undelivered_payload() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let endpoint = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            local_endpoint(&listener)
        };

        let connection = TcpConnection::outgoing(endpoint.clone(), config(), inbound, event_loop.handle());
        assert!(!connection.send(Bytes::from_static(b"never connected"), true));

        assert!(connection.connect(endpoint));
        assert!(!connection.send(Bytes::from_static(b"connect fails"), true));
        assert_eq!(connection.connect_attempts(), 3);
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let event_loop = EventLoop::new("tcp-test").unwrap();
        let (inbound, _inbox) = Inbox::new(16);
        let connection = TcpConnection::outgoing(Endpoint::new("tcp", "127.0.0.1", "1"), config(), inbound, event_loop.handle());
        assert!(!connection.send(Bytes::new(), false));
    }
}
