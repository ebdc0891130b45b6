#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::post::message::Message;


/// The process-internal address table that received messages are routed into, based on
///  the hops that remain in their `to` address
#[cfg_attr(test, automock)]
pub trait PostOffice: Send + Sync {
    fn dispatch(&self, message: Message);
}

/// hands messages to a single consumer, e.g. the task serving the local mailboxes
impl PostOffice for mpsc::UnboundedSender<Message> {
    fn dispatch(&self, message: Message) {
        if let Err(e) = self.send(message) {
            warn!(to = ?e.0.meta.to, "post office receiver is closed - dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crate::post::message::address;
    use super::*;

    #[test]
    fn test_channel_post_office() {
        let (post_office, mut receiver) = mpsc::unbounded_channel();
        let message = Message::new("x", address(["app"]), address(["peer"]), Bytes::from_static(b"1"));

        post_office.dispatch(message.clone());
        assert_eq!(receiver.try_recv().unwrap(), message);

        drop(receiver);
        post_office.dispatch(message);
    }
}
