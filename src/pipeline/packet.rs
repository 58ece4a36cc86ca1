//! Request packets: the unit of one pull cycle

use std::sync::Arc;

use crate::pipeline::topology::Topology;
use crate::pipeline::types::Timestamp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Data was skipped before this packet
    pub discontinuity: bool,
    /// No further packets follow on this sink
    pub last_packet: bool,
    /// Flush everything buffered up to `request_time`
    pub drain: bool,
}

/// One pull cycle issued by a sink
///
/// The session pins the topology that was current when the sink asked; every
/// later hop of this packet resolves edges against that pinned topology, so
/// in-flight packets are immune to concurrent topology swaps. The pinned
/// reference also keeps an outgoing topology alive until its last packet
/// drains.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub packet_number: u64,
    pub request_time: Timestamp,
    pub timestamp: Timestamp,
    pub flags: PacketFlags,
    topology: Option<Arc<Topology>>,
}

impl RequestPacket {
    pub fn new(request_time: Timestamp) -> Self {
        Self {
            packet_number: 0,
            request_time,
            timestamp: request_time,
            flags: PacketFlags::default(),
            topology: None,
        }
    }

    /// Packet asking every node to flush up to `until`
    pub fn drain(until: Timestamp) -> Self {
        let mut rp = Self::new(until);
        rp.flags.drain = true;
        rp
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.flags.discontinuity = discontinuity;
        self
    }

    pub fn with_last_packet(mut self, last: bool) -> Self {
        self.flags.last_packet = last;
        self
    }

    pub fn is_drain(&self) -> bool {
        self.flags.drain
    }

    /// Topology this packet was issued against
    pub fn topology(&self) -> Option<&Arc<Topology>> {
        self.topology.as_ref()
    }

    pub(crate) fn pin(&mut self, topology: Arc<Topology>, packet_number: u64) {
        self.packet_number = packet_number;
        self.topology = Some(topology);
    }
}
