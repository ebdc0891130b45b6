use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::network::endpoint::Endpoint;
use crate::network::udp_chunk::UdpChunk;
use crate::util::safe_converter::PrecheckedCast;


/// Partial reassembly state for one (sender, sequence) pair. Memory grows with the chunks that
///  actually arrived, not with the total a peer declares.
struct WorkingChunks {
    total_chunks: usize,
    chunks: FxHashMap<usize, Bytes>,
    received: BitSet,
    started: Instant,
}

impl WorkingChunks {
    fn new(total_chunks: usize, now: Instant) -> WorkingChunks {
        WorkingChunks {
            total_chunks,
            chunks: Default::default(),
            received: BitSet::new(),
            started: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks
    }

    fn assemble(mut self) -> Bytes {
        let len = self.chunks.values().map(|c| c.len()).sum();
        let mut buf = BytesMut::with_capacity(len);
        for index in 0..self.total_chunks {
            if let Some(chunk) = self.chunks.remove(&index) {
                buf.extend_from_slice(&chunk);
            }
        }
        buf.freeze()
    }
}

/// Collects UDP chunks per sender and sequence number until a message is complete. Invalid
///  chunks are dropped without affecting reassemblies in progress.
///
/// Chunks of a lost datagram never complete their message, so partial reassemblies are evicted
///  after a TTL, and the total number of partial reassemblies is capped. Chunks declaring more
///  than `max_chunks` chunks per message are dropped.
pub struct ReassemblyTable {
    working: FxHashMap<Endpoint, FxHashMap<u64, WorkingChunks>>,
    num_pending: usize,
    ttl: Duration,
    max_pending: usize,
    max_chunks: usize,
    last_sweep: Option<Instant>,
}

impl ReassemblyTable {
    pub fn new(ttl: Duration, max_pending: usize, max_chunks: usize) -> ReassemblyTable {
        ReassemblyTable {
            working: Default::default(),
            num_pending: 0,
            ttl,
            max_pending,
            max_chunks,
            last_sweep: None,
        }
    }

    /// number of messages that are partially received
    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    /// Adds a chunk, returning the reassembled message if this chunk completed it
    pub fn insert(&mut self, from: &Endpoint, chunk: UdpChunk, now: Instant) -> Option<Bytes> {
        self.evict_expired(now);

        let header = chunk.header;
        if header.total_chunks <= 0 {
            debug!(endpoint = %from, sequence = header.sequence, "dropping chunk declaring {} total chunks", header.total_chunks);
            return None;
        }
        if header.chunk < 0 || header.chunk >= header.total_chunks {
            debug!(endpoint = %from, sequence = header.sequence, "dropping chunk {} of {}", header.chunk, header.total_chunks);
            return None;
        }
        let total: usize = header.total_chunks.prechecked_cast();
        let index: usize = header.chunk.prechecked_cast();
        if total > self.max_chunks {
            debug!(endpoint = %from, sequence = header.sequence, "dropping chunk declaring {} total chunks, the maximum is {}", total, self.max_chunks);
            return None;
        }

        if total == 1 && !self.is_in_progress(from, header.sequence) {
            return Some(chunk.data);
        }

        let per_sender = self.working.entry(from.clone()).or_default();
        let working = match per_sender.entry(header.sequence) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.num_pending += 1;
                e.insert(WorkingChunks::new(total, now))
            }
        };

        if working.total_chunks != total {
            debug!(endpoint = %from, sequence = header.sequence, "dropping chunk declaring {} total chunks, sequence has {}", total, working.total_chunks);
            return None;
        }
        if !working.received.insert(index) {
            trace!(endpoint = %from, sequence = header.sequence, "duplicate chunk {}", index);
            return None;
        }
        working.chunks.insert(index, chunk.data);

        if !working.is_complete() {
            self.enforce_capacity();
            return None;
        }

        let complete = per_sender.remove(&header.sequence)?;
        if per_sender.is_empty() {
            self.working.remove(from);
        }
        self.num_pending -= 1;
        Some(complete.assemble())
    }

    fn is_in_progress(&self, from: &Endpoint, sequence: u64) -> bool {
        self.working.get(from)
            .is_some_and(|per_sender| per_sender.contains_key(&sequence))
    }

    fn evict_expired(&mut self, now: Instant) {
        if let Some(last) = self.last_sweep {
            if now.saturating_duration_since(last) < self.ttl / 2 {
                return;
            }
        }
        self.last_sweep = Some(now);

        let ttl = self.ttl;
        let mut evicted = 0;
        self.working.retain(|from, per_sender| {
            per_sender.retain(|sequence, working| {
                let keep = now.saturating_duration_since(working.started) < ttl;
                if !keep {
                    debug!(endpoint = %from, sequence, "evicting incomplete message with {} of {} chunks", working.received.len(), working.total_chunks);
                    evicted += 1;
                }
                keep
            });
            !per_sender.is_empty()
        });
        self.num_pending -= evicted;
    }

    fn enforce_capacity(&mut self) {
        while self.num_pending > self.max_pending {
            let oldest = self.working.iter()
                .flat_map(|(from, per_sender)| per_sender.iter().map(move |(&seq, w)| (w.started, from, seq)))
                .min_by_key(|(started, _, _)| *started)
                .map(|(_, from, seq)| (from.clone(), seq));

            let Some((from, sequence)) = oldest else {
                return;
            };
            warn!(endpoint = %from, sequence, "too many incomplete messages - evicting the oldest");
            if let Some(per_sender) = self.working.get_mut(&from) {
                per_sender.remove(&sequence);
                if per_sender.is_empty() {
                    self.working.remove(&from);
                }
            }
            self.num_pending -= 1;
        }
    }
}
