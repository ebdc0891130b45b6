use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::network::connection_manager::ConnectionPool;
use crate::network::endpoint::EndpointMessage;
use crate::network::transport_config::TransportConfig;
use crate::post::codec::MessageCodec;
use crate::post::message::{EncryptionType, Message, Source, EXTRA_FROM_IP, EXTRA_FROM_PORT, EXTRA_FROM_PROTOCOL};
use crate::post::post_office::PostOffice;
use crate::post::session::SessionLibrary;
use crate::util::sync::locked;


enum Outbound {
    Message(Message),
    /// unblocks the outbound thread at shutdown
    Done,
}

/// the collaborators both pipeline threads work with
struct Pipeline {
    pool: Arc<dyn ConnectionPool>,
    codec: Arc<dyn MessageCodec>,
    sessions: Arc<dyn SessionLibrary>,
    post_office: Arc<dyn PostOffice>,
}

impl Pipeline {
    fn handle_inbound(&self, received: EndpointMessage) -> anyhow::Result<()> {
        let endpoint = received.endpoint;
        let (plaintext, encryption) = self.sessions.decrypt(&endpoint.to_string(), &received.data)?;
        if plaintext.is_empty() {
            debug!(endpoint = %endpoint, "decryption yielded no data - discarding message");
            return Ok(());
        }

        let mut message = self.codec.decode(&plaintext)?;
        if message.meta.to.is_empty() {
            debug!(endpoint = %endpoint, "message has no recipient - discarding");
            return Ok(());
        }

        message.meta.extra.insert(EXTRA_FROM_PROTOCOL.to_string(), endpoint.protocol);
        message.meta.extra.insert(EXTRA_FROM_IP.to_string(), endpoint.address);
        message.meta.extra.insert(EXTRA_FROM_PORT.to_string(), endpoint.port);
        message.meta.encryption = encryption;
        message.meta.source = Source::Remote;

        // the first hop addressed the master post office itself
        message.meta.to.pop_front();

        trace!(to = ?message.meta.to, "dispatching inbound message");
        self.post_office.dispatch(message);
        Ok(())
    }

    fn handle_outbound(&self, message: Message) -> anyhow::Result<()> {
        let address = message.meta.to.front()
            .ok_or_else(|| anyhow!("message has no recipient"))?;
        if message.meta.from.is_empty() {
            bail!("message has no sender");
        }

        let encoded = self.codec.encode(&message);
        let encrypted = match message.meta.encryption {
            EncryptionType::Plaintext => self.sessions.encrypt_plaintext(address, &encoded)?,
            EncryptionType::Symmetric => self.sessions.encrypt_symmetric(address, &encoded)?,
            EncryptionType::Asymmetric => self.sessions.encrypt_asymmetric(address, &encoded)?,
            EncryptionType::Session => self.sessions.encrypt(address, &encoded)?,
        };

        if !self.pool.send(address, encrypted)? {
            warn!(address = %address, "transport did not accept message");
        }
        Ok(())
    }
}

/// Bridges the transport and the process-internal post office with two threads.
///
/// The inbound thread polls the connection pool, decrypts and decodes what it receives, stamps
///  it with its origin and dispatches it. The outbound thread takes messages passed to
///  [MasterPostOffice::send_outside], encodes and encrypts them and sends them to their first
///  `to` hop. A failing or panicking message is logged and skipped, it never stops a thread.
pub struct MasterPostOffice {
    outbound: mpsc::UnboundedSender<Outbound>,
    done: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterPostOffice {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        codec: Arc<dyn MessageCodec>,
        sessions: Arc<dyn SessionLibrary>,
        post_office: Arc<dyn PostOffice>,
        config: &TransportConfig,
    ) -> anyhow::Result<MasterPostOffice> {
        let pipeline = Arc::new(Pipeline {
            pool,
            codec,
            sessions,
            post_office,
        });
        let done = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();

        let inbound_thread = {
            let pipeline = pipeline.clone();
            let done = done.clone();
            let poll_interval = config.receive_poll_interval;
            std::thread::Builder::new()
                .name("mpo-in".to_string())
                .spawn(move || run_inbound(&pipeline, &done, poll_interval))?
        };

        let outbound_thread = match std::thread::Builder::new()
            .name("mpo-out".to_string())
            .spawn(move || run_outbound(&pipeline, outbound_receiver))
        {
            Ok(thread) => thread,
            Err(e) => {
                done.store(true, Ordering::Release);
                let _ = inbound_thread.join();
                return Err(e.into());
            }
        };

        info!("master post office started");
        Ok(MasterPostOffice {
            outbound,
            done,
            threads: Mutex::new(vec![inbound_thread, outbound_thread]),
        })
    }

    /// Queues a message for sending to the peer named by its first `to` hop. Returns `false`
    ///  after shutdown.
    pub fn send_outside(&self, message: Message) -> bool {
        if self.done.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.send(Outbound::Message(message)).is_ok()
    }

    /// Stops both threads and waits for them to finish. Messages queued for sending before are
    ///  still sent. Idempotent.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down master post office");
        let _ = self.outbound.send(Outbound::Done);

        for thread in locked(&self.threads).drain(..) {
            if thread.join().is_err() {
                error!("master post office thread panicked");
            }
        }
    }
}

impl Drop for MasterPostOffice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_inbound(pipeline: &Pipeline, done: &AtomicBool, poll_interval: Duration) {
    while !done.load(Ordering::Acquire) {
        let Some(received) = pipeline.pool.receive() else {
            std::thread::sleep(poll_interval);
            continue;
        };

        let endpoint = received.endpoint.clone();
        match catch_unwind(AssertUnwindSafe(|| pipeline.handle_inbound(received))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(endpoint = %endpoint, "discarding inbound message: {}", e),
            Err(_) => error!(endpoint = %endpoint, "panic handling inbound message"),
        }
    }
    debug!("inbound thread stopped");
}

fn run_outbound(pipeline: &Pipeline, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound::Message(message)) = outbound.blocking_recv() {
        let address = message.meta.to.front().cloned().unwrap_or_default();
        match catch_unwind(AssertUnwindSafe(|| pipeline.handle_outbound(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(address = %address, "discarding outbound message: {}", e),
            Err(_) => error!(address = %address, "panic handling outbound message"),
        }
    }
    debug!("outbound thread stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use rstest::rstest;

    use crate::network::connection_manager::MockConnectionPool;
    use crate::network::endpoint::Endpoint;
    use crate::post::codec::BinaryCodec;
    use crate::post::message::{address, Address};
    use crate::post::post_office::MockPostOffice;
    use crate::post::session::{MockSessionLibrary, NoEncryption};
    use crate::test_util::wait_for;
    use super::*;

    const PEER: &str = "tcp://10.0.0.7:6060";

    fn config() -> TransportConfig {
        let mut config = TransportConfig::new();
        config.receive_poll_interval = Duration::from_millis(1);
        config
    }

    fn peer_endpoint() -> Endpoint {
        Endpoint::new("tcp", "10.0.0.7", "6060")
    }

    fn encrypted(message: &Message) -> Bytes {
        NoEncryption.encrypt_symmetric(PEER, &BinaryCodec.encode(message)).unwrap()
    }

    /// a pool that hands out the given packets once, then stays empty
    fn inbound_pool(packets: Vec<Bytes>) -> MockConnectionPool {
        let packets = Mutex::new(packets.into_iter().collect::<VecDeque<_>>());
        let mut pool = MockConnectionPool::new();
        pool.expect_receive()
            .returning(move || locked(&packets).pop_front()
                .map(|data| EndpointMessage { endpoint: peer_endpoint(), data }));
        pool
    }

    fn start(pool: MockConnectionPool, sessions: Arc<dyn SessionLibrary>) -> (MasterPostOffice, mpsc::UnboundedReceiver<Message>) {
        let (post_office, dispatched) = mpsc::unbounded_channel();
        let master = MasterPostOffice::new(Arc::new(pool), Arc::new(BinaryCodec), sessions, Arc::new(post_office), &config()).unwrap();
        (master, dispatched)
    }

    fn next_dispatched(dispatched: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        let mut result = None;
        wait_for("dispatch", || {
            result = dispatched.try_recv().ok();
            result.is_some()
        });
        result.unwrap()
    }

    #[test]
    fn test_inbound_pops_hop_and_stamps_origin() {
        let message = Message::new("chat", address(["master", "app", "42"]), address([PEER, "user"]), Bytes::from_static(b"hello"));
        let (master, mut dispatched) = start(inbound_pool(vec![encrypted(&message)]), Arc::new(NoEncryption));

        let received = next_dispatched(&mut dispatched);
        assert_eq!(received.meta.to, address(["app", "42"]));
        assert_eq!(received.meta.from, message.meta.from);
        assert_eq!(received.meta.extra.get(EXTRA_FROM_PROTOCOL).map(String::as_str), Some("tcp"));
        assert_eq!(received.meta.extra.get(EXTRA_FROM_IP).map(String::as_str), Some("10.0.0.7"));
        assert_eq!(received.meta.extra.get(EXTRA_FROM_PORT).map(String::as_str), Some("6060"));
        assert_eq!(received.meta.encryption, EncryptionType::Symmetric);
        assert_eq!(received.meta.source, Source::Remote);
        assert_eq!(received.data, Bytes::from_static(b"hello"));

        master.shutdown();
    }

    #[test]
    fn test_inbound_survives_malformed_packets() {
        let good = Message::new("chat", address(["master", "app"]), address([PEER]), Bytes::from_static(b"ok"));
        let no_recipient = Message::new("chat", Address::new(), address([PEER]), Bytes::from_static(b"lost"));
        let packets = vec![
            Bytes::from_static(b"\x01garbage"),
            Bytes::from_static(b"\x07"),
            encrypted(&no_recipient),
            encrypted(&good),
        ];
        let (master, mut dispatched) = start(inbound_pool(packets), Arc::new(NoEncryption));

        assert_eq!(next_dispatched(&mut dispatched).data, Bytes::from_static(b"ok"));
        master.shutdown();
        assert!(dispatched.try_recv().is_err());
    }

    /// panics on the first packet, yields nothing for the second and decrypts from then on
    struct FlakySessions {
        num_calls: AtomicUsize,
    }

    impl SessionLibrary for FlakySessions {
        fn decrypt(&self, session_id: &str, data: &[u8]) -> anyhow::Result<(Bytes, EncryptionType)> {
            match self.num_calls.fetch_add(1, Ordering::AcqRel) {
                0 => panic!("session library failure"),
                1 => Ok((Bytes::new(), EncryptionType::Session)),
                _ => NoEncryption.decrypt(session_id, data),
            }
        }

        fn encrypt_plaintext(&self, _: &str, _: &[u8]) -> anyhow::Result<Bytes> { unreachable!() }
        fn encrypt_symmetric(&self, _: &str, _: &[u8]) -> anyhow::Result<Bytes> { unreachable!() }
        fn encrypt_asymmetric(&self, _: &str, _: &[u8]) -> anyhow::Result<Bytes> { unreachable!() }
        fn encrypt(&self, _: &str, _: &[u8]) -> anyhow::Result<Bytes> { unreachable!() }
    }

    #[test]
    fn test_inbound_survives_panics_and_empty_decryption() {
        let good = Message::new("chat", address(["master", "app"]), address([PEER]), Bytes::from_static(b"ok"));
        let packets = vec![encrypted(&good), encrypted(&good), encrypted(&good)];
        let sessions = Arc::new(FlakySessions { num_calls: AtomicUsize::new(0) });
        let (master, mut dispatched) = start(inbound_pool(packets), sessions.clone());

        assert_eq!(next_dispatched(&mut dispatched).data, Bytes::from_static(b"ok"));
        master.shutdown();
        assert!(dispatched.try_recv().is_err());
        assert_eq!(sessions.num_calls.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_inbound_dispatches_through_post_office() {
        let message = Message::new("chat", address(["master", "app", "42"]), address([PEER]), Bytes::from_static(b"x"));
        let num_dispatched = Arc::new(AtomicUsize::new(0));

        let mut post_office = MockPostOffice::new();
        let counter = num_dispatched.clone();
        post_office.expect_dispatch()
            .withf(|m| m.meta.to == address(["app", "42"]))
            .times(1)
            .returning(move |_| { counter.fetch_add(1, Ordering::AcqRel); });
        let post_office = Arc::new(post_office);

        let master = MasterPostOffice::new(
            Arc::new(inbound_pool(vec![encrypted(&message)])),
            Arc::new(BinaryCodec),
            Arc::new(NoEncryption),
            post_office.clone(),
            &config(),
        ).unwrap();

        wait_for("dispatch", || num_dispatched.load(Ordering::Acquire) == 1);
        master.shutdown();
        drop(master);
        drop(post_office);
    }

    #[rstest]
    #[case::plaintext(EncryptionType::Plaintext)]
    #[case::symmetric(EncryptionType::Symmetric)]
    #[case::asymmetric(EncryptionType::Asymmetric)]
    #[case::session(EncryptionType::Session)]
    fn test_outbound_encrypts_per_type(#[case] encryption: EncryptionType) {
        let message = Message::new("chat", address([PEER, "app"]), address(["me"]), Bytes::from_static(b"payload"))
            .with_encryption(encryption);
        let plaintext = BinaryCodec.encode(&message);

        let mut sessions = MockSessionLibrary::new();
        let expected_plaintext = plaintext.clone();
        let matches = move |session_id: &str, data: &[u8]| session_id == PEER && data == &expected_plaintext[..];
        let encrypted = Bytes::from_static(b"secret");
        match encryption {
            EncryptionType::Plaintext => { sessions.expect_encrypt_plaintext().withf(move |s, d| matches(s, d)).times(1).returning(move |_, _| Ok(encrypted.clone())); }
            EncryptionType::Symmetric => { sessions.expect_encrypt_symmetric().withf(move |s, d| matches(s, d)).times(1).returning(move |_, _| Ok(encrypted.clone())); }
            EncryptionType::Asymmetric => { sessions.expect_encrypt_asymmetric().withf(move |s, d| matches(s, d)).times(1).returning(move |_, _| Ok(encrypted.clone())); }
            EncryptionType::Session => { sessions.expect_encrypt().withf(move |s, d| matches(s, d)).times(1).returning(move |_, _| Ok(encrypted.clone())); }
        }
        let sessions = Arc::new(sessions);

        let num_sent = Arc::new(AtomicUsize::new(0));
        let counter = num_sent.clone();
        let mut pool = MockConnectionPool::new();
        pool.expect_receive()
            .returning(|| None);
        pool.expect_send()
            .withf(|address, data| address == PEER && data == &Bytes::from_static(b"secret"))
            .times(1)
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            });
        let pool = Arc::new(pool);

        let (post_office, _dispatched) = mpsc::unbounded_channel();
        let master = MasterPostOffice::new(pool.clone(), Arc::new(BinaryCodec), sessions.clone(), Arc::new(post_office), &config()).unwrap();

        assert!(master.send_outside(message));
        wait_for("send", || num_sent.load(Ordering::Acquire) == 1);

        master.shutdown();
        drop(master);
        drop(sessions);
        drop(pool);
    }

    #[test]
    fn test_outbound_skips_invalid_messages() {
        let mut pool = MockConnectionPool::new();
        pool.expect_receive()
            .returning(|| None);
        pool.expect_send()
            .withf(|address, _| address == PEER)
            .times(1)
            .returning(|_, _| Ok(true));
        pool.expect_send()
            .withf(|address, _| address == "udp://10.0.0.9:1")
            .times(1)
            .returning(|_, _| Err(anyhow!("no UDP queue")));
        let pool = Arc::new(pool);

        let (post_office, _dispatched) = mpsc::unbounded_channel();
        let master = MasterPostOffice::new(pool.clone(), Arc::new(BinaryCodec), Arc::new(NoEncryption), Arc::new(post_office), &config()).unwrap();

        assert!(master.send_outside(Message::new("x", Address::new(), address(["me"]), Bytes::from_static(b"1"))));
        assert!(master.send_outside(Message::new("x", address([PEER]), Address::new(), Bytes::from_static(b"2"))));
        assert!(master.send_outside(Message::new("x", address(["udp://10.0.0.9:1"]), address(["me"]), Bytes::from_static(b"3"))));
        assert!(master.send_outside(Message::new("x", address([PEER]), address(["me"]), Bytes::from_static(b"4"))));

        // messages queued before shutdown are still sent
        master.shutdown();
        assert!(!master.send_outside(Message::new("x", address([PEER]), address(["me"]), Bytes::from_static(b"5"))));
        drop(master);
        drop(pool);
    }
}
