use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transport::error::TransportError;
use crate::transport::fragmenter::reassemble;
use crate::transport::packet_header::PacketHeader;
use crate::transport::tag::Tag;
use crate::util::safe_converter::SafeCast;

/// How long a partially received message is kept after its most recent fragment arrived
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Partially received message for one (sender, tag)
#[derive(Debug)]
struct ReassemblyEntry {
    seq_total: u16,
    fragments: BTreeMap<u16, Bytes>,
    last_update: Instant,
}

impl ReassemblyEntry {
    fn new(seq_total: u16, now: Instant) -> ReassemblyEntry {
        ReassemblyEntry {
            seq_total,
            fragments: BTreeMap::new(),
            last_update: now,
        }
    }

    fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.duration_since(self.last_update) >= max_age
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() == self.seq_total.safe_cast() + 1
    }
}

/// Collects packet fragments per (sender address, tag) until all of a message's packets have
///  arrived. Packets may arrive in any order and duplicates overwrite earlier copies.
///
/// A packet whose `seq_total` differs from the one an open entry was started with invalidates
///  that entry: the fragments collected so far are discarded, and collection restarts for the new
///  total. This is how a sender reusing a tag for a differently sized message is handled.
///
/// Entries that have not received a fragment for `max_age` are discarded: an entry for the same
///  (sender, tag) starts over instead of merging with the stale fragments, and a sweep over all
///  entries runs at most once per `max_age`. So a message whose sender gave up is kept for less
///  than twice `max_age`.
#[derive(Debug)]
pub struct Reassembler {
    entries: FxHashMap<(IpAddr, Tag), ReassemblyEntry>,
    max_age: Duration,
    next_sweep: Option<Instant>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::with_timeout(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Default::default()
    }

    pub fn with_timeout(max_age: Duration) -> Reassembler {
        Reassembler {
            entries: Default::default(),
            max_age,
            next_sweep: None,
        }
    }

    /// Returns the tag and the full message if this packet completed it.
    pub fn on_packet(&mut self, from: IpAddr, packet: Bytes) -> Result<Option<(Tag, Bytes)>, TransportError> {
        let mut buf: &[u8] = &packet;
        let header = PacketHeader::deser(&mut buf)?;
        if header.seq_num > header.seq_total {
            debug!(?from, ?header, "sequence number beyond sequence total");
            return Err(TransportError::MalformedPacket(packet.len()));
        }
        let fragment = packet.slice(PacketHeader::SERIALIZED_LEN..);

        trace!(?from, ?header, "received packet, {} payload bytes", fragment.len());

        let now = Instant::now();
        self.evict_stale(now);

        let max_age = self.max_age;
        let entry = self.entries
            .entry((from, header.tag))
            .or_insert_with(|| ReassemblyEntry::new(header.seq_total, now));

        if entry.is_stale(now, max_age) {
            debug!(?from, tag = ?header.tag, "discarding {} stale fragments", entry.fragments.len());
            *entry = ReassemblyEntry::new(header.seq_total, now);
        }
        else if entry.seq_total != header.seq_total {
            debug!(?from, tag = ?header.tag, "sequence total changed from {} to {} - discarding {} collected fragments", entry.seq_total, header.seq_total, entry.fragments.len());
            *entry = ReassemblyEntry::new(header.seq_total, now);
        }

        entry.fragments.insert(header.seq_num, fragment);
        entry.last_update = now;

        if !entry.is_complete() {
            return Ok(None);
        }

        let complete = self.entries.remove(&(from, header.tag))
            .map(|entry| reassemble(entry.fragments.values().map(|f| f.as_ref())));

        Ok(complete.map(|message| (header.tag, message)))
    }

    pub fn num_pending(&self) -> usize {
        self.entries.len()
    }

    fn evict_stale(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|t| now < t) {
            return;
        }
        self.next_sweep = Some(now + self.max_age);

        let max_age = self.max_age;
        let num_before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now, max_age));
        if self.entries.len() < num_before {
            debug!("evicted {} incomplete messages", num_before - self.entries.len());
        }
    }
}
