use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::network::address::ParsedAddress;
use crate::network::endpoint::{Endpoint, EndpointMessage, TCP, UDP};


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueMode {
    /// listen on the local port and accept incoming connections
    Bind,
    /// a single outgoing connection
    Connect,
    /// reserve a local port now, connect to a peer that becomes known later
    DelayedConnect,
}

/// Everything a queue needs to know to set itself up, derived from an address string
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueueParams {
    pub kind: QueueKind,
    pub mode: QueueMode,
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub local_port: Option<u16>,
    /// sends wait until the data was handed to the socket
    pub block: bool,
    /// grace period before the queue's sockets are closed on shutdown
    pub wait: Duration,
    /// a listening TCP queue remembers its latest incoming connection and sends to it
    pub track_incoming: bool,
}

impl QueueParams {
    pub fn from_address(address: &ParsedAddress) -> anyhow::Result<QueueParams> {
        let kind = match address.transport.as_str() {
            TCP => QueueKind::Tcp,
            UDP => QueueKind::Udp,
            other => bail!("unsupported transport {:?}", other),
        };

        let mut mode = QueueMode::Connect;
        for option in &address.options {
            match option.name.as_str() {
                "bnd" => mode = QueueMode::Bind,
                "con" => mode = QueueMode::Connect,
                "dcon" => mode = QueueMode::DelayedConnect,
                "block" | "wait" | "track_incoming" | "local_port" => {}
                other => debug!("ignoring unknown option {:?} in address {}", other, address),
            }
        }
        if kind == QueueKind::Udp {
            // one socket serves all peers, so UDP always binds
            mode = QueueMode::Bind;
        }

        let port: u16 = address.port.parse()?;
        let mut local_port = address.numeric_option("local_port")?;
        if kind == QueueKind::Udp && local_port.is_none() {
            local_port = Some(port);
        }

        Ok(QueueParams {
            kind,
            mode,
            uri: Endpoint::new(address.transport.clone(), address.host.clone(), address.port.clone()).to_string(),
            host: address.host.clone(),
            port,
            local_port,
            block: address.flag("block"),
            wait: Duration::from_millis(address.numeric_option("wait")?.unwrap_or(0)),
            track_incoming: address.flag("track_incoming"),
        })
    }

    pub fn parse(address: &str) -> anyhow::Result<QueueParams> {
        QueueParams::from_address(&ParsedAddress::parse(address)?)
    }

    /// the peer this queue's `host` and `port` refer to
    pub fn endpoint(&self) -> Endpoint {
        let protocol = match self.kind {
            QueueKind::Tcp => TCP,
            QueueKind::Udp => UDP,
        };
        Endpoint::new(protocol, self.host.clone(), self.port.to_string())
    }
}

/// A transport queue moving opaque payloads. Each queue runs its sockets on its own event loop,
///  received payloads are buffered until they are picked up through `receive`.
#[cfg_attr(test, automock)]
pub trait MessageQueue: Send + Sync {
    /// sends to the queue's own peer, see [QueueParams::endpoint]
    fn send(&self, data: Bytes) -> bool;

    /// non-blocking
    fn receive(&self) -> Option<EndpointMessage>;

    fn params(&self) -> QueueParams;

    /// idempotent
    fn shutdown(&self);
}
