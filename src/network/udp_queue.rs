use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use bytes::Bytes;
use tracing::debug;

use crate::network::endpoint::{Endpoint, EndpointMessage};
use crate::network::event_loop::EventLoop;
use crate::network::inbox::Inbox;
use crate::network::queue::{MessageQueue, QueueKind, QueueParams};
use crate::network::transport_config::TransportConfig;
use crate::network::udp_connection::UdpConnection;
use crate::util::sync::locked;


/// A bound UDP port with its own event loop thread, exchanging messages with any number of peers
pub struct UdpQueue {
    params: QueueParams,
    inbox: Inbox,
    connection: UdpConnection,
    is_shut_down: AtomicBool,
    event_loop: Mutex<EventLoop>,
}

impl UdpQueue {
    pub fn new(params: QueueParams, config: Arc<TransportConfig>) -> anyhow::Result<UdpQueue> {
        if params.kind != QueueKind::Udp {
            bail!("{} is not a UDP address", params.uri);
        }
        let Some(local_port) = params.local_port else {
            bail!("{} requires a local port", params.uri);
        };

        let event_loop = EventLoop::new(&format!("udp-{}", local_port))?;
        let (inbound, inbox) = Inbox::new(config.inbound_queue_capacity);
        let connection = UdpConnection::bind(local_port, config, inbound, event_loop.handle())?;

        Ok(UdpQueue {
            params,
            inbox,
            connection,
            is_shut_down: AtomicBool::new(false),
            event_loop: Mutex::new(event_loop),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local_addr()
    }

    pub fn send_to(&self, endpoint: Endpoint, data: Bytes) -> bool {
        if self.is_shut_down.load(Ordering::Acquire) {
            return false;
        }
        self.connection.send(EndpointMessage { endpoint, data }, self.params.block)
    }
}

impl MessageQueue for UdpQueue {
    fn send(&self, data: Bytes) -> bool {
        self.send_to(self.params.endpoint(), data)
    }

    fn receive(&self) -> Option<EndpointMessage> {
        self.inbox.try_receive()
    }

    fn params(&self) -> QueueParams {
        self.params.clone()
    }

    fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down queue {}", self.params.uri);

        if !self.params.wait.is_zero() {
            std::thread::sleep(self.params.wait);
        }
        self.connection.close();
        locked(&self.event_loop).stop();
    }
}

impl Drop for UdpQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
