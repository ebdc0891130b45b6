pub mod address;
pub mod connection;
pub mod connection_manager;
pub mod endpoint;
pub mod event_loop;
pub mod framing;
pub mod inbox;
pub mod queue;
pub mod reassembly;
pub mod retry;
pub mod tcp_connection;
pub mod tcp_queue;
pub mod transport_config;
pub mod udp_chunk;
pub mod udp_connection;
pub mod udp_queue;
