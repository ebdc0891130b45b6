use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::network::endpoint::Endpoint;


#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Connection state that is shared between a connection's handle and the task doing its I/O
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> AtomicConnectionState {
        AtomicConnectionState(AtomicU8::new(state.into()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::try_from(self.0.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.into(), Ordering::Release);
    }

    /// atomically changes the state if it is `current`, returning whether it was changed
    pub fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.0.compare_exchange(current.into(), new.into(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

/// A byte-level connection to a single peer.
#[cfg_attr(test, automock)]
pub trait Connection: Send + Sync {
    /// Queues `data` for sending, returning `false` if it was not accepted. With `block`, this
    ///  waits until the write queue is drained or the connection is found disconnected.
    fn send(&self, data: Bytes, block: bool) -> bool;

    fn endpoint(&self) -> Endpoint;

    fn is_disconnected(&self) -> bool;
}
