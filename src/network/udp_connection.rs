use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::network::endpoint::{Endpoint, EndpointMessage};
use crate::network::inbox::{deliver, InboundSender};
use crate::network::reassembly::ReassemblyTable;
use crate::network::transport_config::TransportConfig;
use crate::network::udp_chunk::{fragment, UdpChunk};


/// the largest possible UDP payload - chunks from peers with a bigger chunk size are accepted
const MAX_DATAGRAM_SIZE: usize = 65536;

/// A single bound UDP socket serving all peers. Outgoing messages are split into chunks,
///  incoming chunks are reassembled per sender and sequence number.
///
/// There is no acknowledgement: a lost chunk means its message never completes on the
///  receiving side.
pub struct UdpConnection {
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<EndpointMessage>,
    /// number of messages accepted by `send` that were not sent (or given up on) yet
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    block_poll_interval: Duration,
    send_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl UdpConnection {
    /// Binds a UDP socket to the given local port on all interfaces, and starts sending and
    ///  receiving on the event loop behind `runtime`. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, config: Arc<TransportConfig>, inbound: InboundSender, runtime: &Handle) -> anyhow::Result<UdpConnection> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = runtime.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        let pending = Arc::new(AtomicUsize::new(0));
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();

        let send_task = runtime.spawn(send_loop(
            socket.clone(),
            outgoing_receiver,
            pending.clone(),
            config.udp_chunk_size,
            // a restarted peer must not continue stale reassemblies on the receiving side
            rand::random(),
        ));
        let receive_task = runtime.spawn(receive_loop(
            socket,
            inbound,
            ReassemblyTable::new(config.reassembly_ttl, config.max_pending_reassemblies, config.max_chunks_per_message),
        ));

        Ok(UdpConnection {
            local_addr,
            outgoing,
            pending,
            closed: AtomicBool::new(false),
            block_poll_interval: config.block_poll_interval,
            send_task,
            receive_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a message for sending to its endpoint. An empty payload is not sent. With `block`,
    ///  this waits until all chunks of all queued messages went out, returning `false` if the
    ///  connection was closed first.
    pub fn send(&self, message: EndpointMessage, block: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        if message.data.is_empty() {
            debug!(endpoint = %message.endpoint, "ignoring empty payload");
            return false;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.outgoing.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        if block {
            return self.wait_until_sent();
        }
        true
    }

    /// `false` if the connection is closed before all queued messages went out
    fn wait_until_sent(&self) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            if self.pending.load(Ordering::Acquire) == 0 {
                return true;
            }
            std::thread::sleep(self.block_poll_interval);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing UDP socket {:?}", self.local_addr);
            self.send_task.abort();
            self.receive_task.abort();
        }
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outgoing: mpsc::UnboundedReceiver<EndpointMessage>,
    pending: Arc<AtomicUsize>,
    chunk_size: usize,
    initial_sequence: u64,
) {
    let mut sequence = initial_sequence;
    while let Some(message) = outgoing.recv().await {
        sequence = sequence.wrapping_add(1);
        if let Err(e) = send_message(&socket, &message, sequence, chunk_size).await {
            warn!(endpoint = %message.endpoint, "error sending UDP message: {}", e);
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// sends the chunks of one message one datagram at a time
async fn send_message(socket: &UdpSocket, message: &EndpointMessage, sequence: u64, chunk_size: usize) -> anyhow::Result<()> {
    let to = resolve(&message.endpoint).await?;
    let chunks = fragment(sequence, &message.data, chunk_size)?;
    trace!(endpoint = %message.endpoint, sequence, "sending {} bytes in {} chunks", message.data.len(), chunks.len());

    for chunk in chunks {
        socket.send_to(&chunk.encode(), to).await?;
    }
    Ok(())
}

async fn resolve(endpoint: &Endpoint) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(endpoint.host_and_port()).await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("{} does not resolve to an IPv4 address", endpoint))
}

async fn receive_loop(socket: Arc<UdpSocket>, inbound: InboundSender, mut reassembly: ReassemblyTable) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                // e.g. ICMP port unreachable for an earlier send on some platforms
                debug!("error receiving from UDP socket: {}", e);
                continue;
            }
        };

        let endpoint = Endpoint::udp(from);
        let Some(chunk) = UdpChunk::decode(&buf[..len]) else {
            debug!(endpoint = %endpoint, "dropping invalid {} byte datagram", len);
            continue;
        };
        if let Some(data) = reassembly.insert(&endpoint, chunk, Instant::now()) {
            trace!(endpoint = %endpoint, "received message of {} bytes", data.len());
            deliver(&inbound, EndpointMessage { endpoint, data });
        }
    }
}
