use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::connection::{Connection, ConnectionState};
use crate::network::endpoint::{Endpoint, EndpointMessage};
use crate::network::event_loop::EventLoop;
use crate::network::inbox::{InboundSender, Inbox};
use crate::network::queue::{MessageQueue, QueueKind, QueueMode, QueueParams};
use crate::network::tcp_connection::TcpConnection;
use crate::network::transport_config::TransportConfig;
use crate::util::sync::locked;


const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct IncomingConnections {
    connections: Vec<Arc<TcpConnection>>,
    /// the most recently accepted connection, only kept with `track_incoming`
    latest: Option<Arc<TcpConnection>>,
}

impl IncomingConnections {
    fn prune(&mut self) {
        self.connections.retain(|c| !c.is_disconnected());
    }
}

/// A queue of TCP connections, running on its own event loop thread.
///
/// In `bind` mode, it listens on a local port and accepts any number of incoming connections.
///  In `connect` mode, it has a single outgoing connection that is re-established on the next
///  `send` after it was lost. In `delayed_connect` mode, the outgoing connection's local port is
///  bound right away, and the connection is established once [TcpQueue::connect] is called.
pub struct TcpQueue {
    params: Mutex<QueueParams>,
    inbox: Inbox,
    outgoing: Option<TcpConnection>,
    incoming: Arc<Mutex<IncomingConnections>>,
    listener: Option<(SocketAddr, JoinHandle<()>)>,
    is_shut_down: AtomicBool,
    event_loop: Mutex<EventLoop>,
}

impl TcpQueue {
    pub fn new(params: QueueParams, config: Arc<TransportConfig>) -> anyhow::Result<TcpQueue> {
        if params.kind != QueueKind::Tcp {
            bail!("{} is not a TCP address", params.uri);
        }

        let event_loop = EventLoop::new(&format!("tcp-{}", params.port))?;
        let (inbound, inbox) = Inbox::new(config.inbound_queue_capacity);
        let incoming = Arc::new(Mutex::new(IncomingConnections::default()));

        let mut outgoing = None;
        let mut listener = None;
        match params.mode {
            QueueMode::Bind => {
                let tcp_listener = {
                    let _guard = event_loop.handle().enter();
                    Self::listen(params.port)?
                };
                let local_addr = tcp_listener.local_addr()?;
                info!("listening on {:?}", local_addr);

                let accept_task = event_loop.spawn(accept_loop(tcp_listener, incoming.clone(), params.track_incoming, config, inbound));
                listener = Some((local_addr, accept_task));
            }
            QueueMode::Connect => {
                let connection = TcpConnection::outgoing(params.endpoint(), config, inbound, event_loop.handle());
                if let Some(local_port) = params.local_port {
                    connection.bind(local_port);
                }
                connection.connect(params.endpoint());
                outgoing = Some(connection);
            }
            QueueMode::DelayedConnect => {
                let connection = TcpConnection::outgoing(params.endpoint(), config, inbound, event_loop.handle());
                if !connection.bind(params.local_port.unwrap_or(0)) {
                    bail!("reserving local port for {} failed: {:?}", params.uri, connection.last_error());
                }
                outgoing = Some(connection);
            }
        }

        Ok(TcpQueue {
            params: Mutex::new(params),
            inbox,
            outgoing,
            incoming,
            listener,
            is_shut_down: AtomicBool::new(false),
            event_loop: Mutex::new(event_loop),
        })
    }

    fn listen(port: u16) -> anyhow::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        Ok(socket.listen(1024)?)
    }

    /// Connects a `delayed_connect` queue to its peer, turning it into a `connect` queue. Data
    ///  sent before is flushed once the connection is established.
    pub fn connect(&self, host: &str, port: u16) -> anyhow::Result<bool> {
        let mut params = locked(&self.params);
        if params.mode != QueueMode::DelayedConnect {
            bail!("{} is not in delayed connect mode", params.uri);
        }
        let Some(outgoing) = &self.outgoing else {
            bail!("{} has no outgoing connection", params.uri);
        };

        params.mode = QueueMode::Connect;
        params.host = host.to_string();
        params.port = port;
        let endpoint = params.endpoint();
        params.uri = endpoint.to_string();
        debug!("connecting delayed queue to {}", endpoint);
        Ok(outgoing.connect(endpoint))
    }

    /// the address a `bind` queue listens on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()
            .map(|(addr, _)| *addr)
    }

    /// the state of the outgoing connection, if this queue has one
    pub fn outgoing_state(&self) -> Option<ConnectionState> {
        self.outgoing.as_ref()
            .map(|c| c.state())
    }

    /// An outgoing queue whose connection is disconnected, e.g. after connect retries were
    ///  exhausted, with no received data left to pick up
    pub fn is_dormant(&self) -> bool {
        self.outgoing_state() == Some(ConnectionState::Disconnected) && self.inbox.is_empty()
    }

    /// number of live incoming connections
    pub fn num_incoming(&self) -> usize {
        let mut incoming = locked(&self.incoming);
        incoming.prune();
        incoming.connections.len()
    }

    fn send_incoming(&self, data: Bytes, block: bool) -> bool {
        let latest = locked(&self.incoming).latest.clone();
        match latest {
            Some(connection) if !connection.is_disconnected() => connection.send(data, block),
            Some(_) => {
                debug!("latest incoming connection is closed - dropping {} bytes", data.len());
                false
            }
            None => {
                debug!("no incoming connection to send to - dropping {} bytes", data.len());
                false
            }
        }
    }
}

impl MessageQueue for TcpQueue {
    fn send(&self, data: Bytes) -> bool {
        if self.is_shut_down.load(Ordering::Acquire) {
            return false;
        }

        let params = locked(&self.params).clone();
        match params.mode {
            QueueMode::Bind => self.send_incoming(data, params.block),
            QueueMode::Connect | QueueMode::DelayedConnect => {
                let Some(outgoing) = &self.outgoing else {
                    return false;
                };
                if params.mode == QueueMode::Connect && outgoing.is_disconnected() {
                    debug!("reconnecting to {}", params.uri);
                    outgoing.connect(params.endpoint());
                }
                outgoing.send(data, params.block)
            }
        }
    }

    fn receive(&self) -> Option<EndpointMessage> {
        self.inbox.try_receive()
    }

    fn params(&self) -> QueueParams {
        locked(&self.params).clone()
    }

    fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let params = self.params();
        debug!("shutting down queue {}", params.uri);

        if !params.wait.is_zero() {
            std::thread::sleep(params.wait);
        }

        if let Some((_, accept_task)) = &self.listener {
            accept_task.abort();
        }
        if let Some(outgoing) = &self.outgoing {
            outgoing.close();
        }
        {
            let mut incoming = locked(&self.incoming);
            for connection in incoming.connections.drain(..) {
                connection.close();
            }
            incoming.latest = None;
        }

        locked(&self.event_loop).stop();
    }
}

impl Drop for TcpQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, incoming: Arc<Mutex<IncomingConnections>>, track_incoming: bool, config: Arc<TransportConfig>, inbound: InboundSender) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(endpoint = %Endpoint::tcp(peer_addr), "accepted connection");
                let connection = Arc::new(TcpConnection::incoming(stream, peer_addr, config.clone(), inbound.clone()));

                let mut incoming = locked(&incoming);
                incoming.prune();
                if track_incoming {
                    incoming.latest = Some(connection.clone());
                }
                incoming.connections.push(connection);
            }
            Err(e) => {
                warn!("error accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
