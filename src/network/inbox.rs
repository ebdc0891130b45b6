use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::network::endpoint::EndpointMessage;


pub type InboundSender = mpsc::Sender<EndpointMessage>;

/// hands a received message to the owning queue without ever blocking the socket's task
pub fn deliver(inbound: &InboundSender, message: EndpointMessage) {
    match inbound.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            warn!(endpoint = %message.endpoint, "inbound queue is full - dropping {} bytes", message.data.len());
        }
        Err(TrySendError::Closed(message)) => {
            debug!(endpoint = %message.endpoint, "inbound queue is closed - dropping {} bytes", message.data.len());
        }
    }
}

/// The receiving end of a queue's bounded inbound channel
pub struct Inbox {
    receiver: Mutex<mpsc::Receiver<EndpointMessage>>,
}

impl Inbox {
    pub fn new(capacity: usize) -> (InboundSender, Inbox) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Inbox { receiver: Mutex::new(receiver) })
    }

    /// non-blocking, callable from any thread
    pub fn try_receive(&self) -> Option<EndpointMessage> {
        self.receiver.try_lock().ok()?
            .try_recv().ok()
    }

    /// `false` while another thread is receiving
    pub fn is_empty(&self) -> bool {
        self.receiver.try_lock()
            .is_ok_and(|receiver| receiver.is_empty())
    }

    /// polls until a message arrives or the timeout expires; for callers outside a runtime
    pub fn receive_timeout(&self, timeout: Duration, poll_interval: Duration) -> Option<EndpointMessage> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_receive() {
                return Some(message);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(poll_interval);
        }
    }
}
