use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info};

use crate::network::endpoint::EndpointMessage;
use crate::network::queue::{MessageQueue, QueueKind, QueueMode, QueueParams};
use crate::network::tcp_queue::TcpQueue;
use crate::network::transport_config::TransportConfig;
use crate::network::udp_queue::UdpQueue;
use crate::util::sync::locked;


/// The set of transport queues a master post office sends through and receives from
#[cfg_attr(test, automock)]
pub trait ConnectionPool: Send + Sync {
    /// non-blocking: the next payload received by any of the pool's queues
    fn receive(&self) -> Option<EndpointMessage>;

    /// Sends a payload to an address string like `tcp://10.0.0.1:6060`. `Ok(false)` means the
    ///  queue rejected the payload, errors are for addresses that can not be served at all.
    fn send(&self, address: &str, data: Bytes) -> anyhow::Result<bool>;
}

/// A [ConnectionPool] with an optional listening TCP queue, an optional UDP queue and outgoing
///  TCP queues that are created on first use for each destination.
pub struct ConnectionManager {
    config: Arc<TransportConfig>,
    listener: Option<Arc<TcpQueue>>,
    udp: Option<Arc<UdpQueue>>,
    outgoing: Mutex<BTreeMap<String, Arc<TcpQueue>>>,
    next_receive: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> anyhow::Result<ConnectionManager> {
        config.validate()?;
        Ok(ConnectionManager {
            config: Arc::new(config),
            listener: None,
            udp: None,
            outgoing: Default::default(),
            next_receive: AtomicUsize::new(0),
        })
    }

    /// listens for incoming TCP connections on a `bnd` address, e.g. `tcp://0.0.0.0:6060,bnd`
    pub fn with_listener(mut self, address: &str) -> anyhow::Result<ConnectionManager> {
        let params = QueueParams::parse(address)?;
        if params.kind != QueueKind::Tcp || params.mode != QueueMode::Bind {
            bail!("{} is not a TCP bind address", address);
        }
        info!("adding TCP listener {}", params.uri);
        self.listener = Some(Arc::new(TcpQueue::new(params, self.config.clone())?));
        Ok(self)
    }

    /// binds the UDP port all UDP traffic goes through, e.g. `udp://0.0.0.0:6061`
    pub fn with_udp(mut self, address: &str) -> anyhow::Result<ConnectionManager> {
        let params = QueueParams::parse(address)?;
        if params.kind != QueueKind::Udp {
            bail!("{} is not a UDP address", address);
        }
        info!("adding UDP queue {}", params.uri);
        self.udp = Some(Arc::new(UdpQueue::new(params, self.config.clone())?));
        Ok(self)
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()
            .and_then(|l| l.local_addr())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref()
            .map(|u| u.local_addr())
    }

    pub fn num_outgoing(&self) -> usize {
        locked(&self.outgoing).len()
    }

    fn outgoing_queue(&self, params: QueueParams) -> anyhow::Result<Arc<TcpQueue>> {
        let dormant = self.remove_dormant(&params.uri);
        // shut down outside the lock, shutdown may wait for the queue's grace period
        drop(dormant);

        let mut outgoing = locked(&self.outgoing);
        if let Some(queue) = outgoing.get(&params.uri) {
            return Ok(queue.clone());
        }

        debug!("creating outgoing queue for {}", params.uri);
        let key = params.uri.clone();
        let queue = Arc::new(TcpQueue::new(params, self.config.clone())?);
        outgoing.insert(key, queue.clone());
        Ok(queue)
    }

    /// Removes outgoing queues other than `keep` that are disconnected and were fully read, so
    ///  that every destination ever sent to does not keep a queue and its thread forever
    fn remove_dormant(&self, keep: &str) -> Vec<Arc<TcpQueue>> {
        let mut outgoing = locked(&self.outgoing);
        let uris = outgoing.iter()
            .filter(|(uri, queue)| uri.as_str() != keep && queue.is_dormant())
            .map(|(uri, _)| uri.clone())
            .collect::<Vec<_>>();

        uris.into_iter()
            .filter_map(|uri| {
                debug!("removing disconnected outgoing queue for {}", uri);
                outgoing.remove(&uri)
            })
            .collect()
    }

    fn queues(&self) -> Vec<Arc<dyn MessageQueue>> {
        let mut result: Vec<Arc<dyn MessageQueue>> = Vec::new();
        if let Some(listener) = &self.listener {
            result.push(listener.clone());
        }
        if let Some(udp) = &self.udp {
            result.push(udp.clone());
        }
        for queue in locked(&self.outgoing).values() {
            result.push(queue.clone());
        }
        result
    }

    /// shuts down all queues, closing their connections
    pub fn shutdown(&self) {
        for queue in self.queues() {
            queue.shutdown();
        }
    }
}

impl ConnectionPool for ConnectionManager {
    fn receive(&self) -> Option<EndpointMessage> {
        let start = self.next_receive.fetch_add(1, Ordering::Relaxed);
        receive_round_robin(&self.queues(), start)
    }

    fn send(&self, address: &str, data: Bytes) -> anyhow::Result<bool> {
        let params = QueueParams::parse(address)?;
        match (params.kind, params.mode) {
            (QueueKind::Udp, _) => {
                let udp = self.udp.as_ref()
                    .ok_or_else(|| anyhow!("no UDP queue to send to {}", address))?;
                Ok(udp.send_to(params.endpoint(), data))
            }
            (QueueKind::Tcp, QueueMode::Bind) => {
                let listener = self.listener.as_ref()
                    .ok_or_else(|| anyhow!("no TCP listener to answer {}", address))?;
                Ok(listener.send(data))
            }
            (QueueKind::Tcp, _) => {
                let queue = self.outgoing_queue(params)?;
                Ok(queue.send(data))
            }
        }
    }
}

/// polls the queues starting at `start`, so that a busy queue can not starve the others
fn receive_round_robin(queues: &[Arc<dyn MessageQueue>], start: usize) -> Option<EndpointMessage> {
    if queues.is_empty() {
        return None;
    }
    (0..queues.len())
        .map(|i| &queues[(start + i) % queues.len()])
        .find_map(|queue| queue.receive())
}
