//! Topology graph
//!
//! A topology is assembled with [`TopologyBuilder`] and frozen before it is
//! published to a session. Forward edges ("give") fan out freely; every node
//! has at most one reverse edge ("request"), and the first connection wins.
//! Duplicated worker branches rely on this: `S -> W1` and `S -> W2` both get
//! a reverse edge to `S`, while a second producer wired into an existing
//! consumer only adds a forward edge.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::clock::PresentationClock;
use crate::error::{PipelineError, Result};
use crate::pipeline::stream::{Component, ComponentId, Stream, StreamId};

static NEXT_TOPOLOGY_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of delivering a packet across an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The downstream node asked for this packet
    Requested,
    /// The downstream node did not ask (a sibling branch did); skip it
    Unrequested,
}

#[derive(Debug, Default)]
struct EdgeState {
    pending: Option<u64>,
    last_delivered: Option<u64>,
}

/// Per-edge request latch enforcing one outstanding request per edge
#[derive(Debug, Default)]
pub struct EdgeLatch {
    state: Mutex<EdgeState>,
}

impl EdgeLatch {
    /// Mark `packet` as requested on the edge `from -> to` (`to` asks `from`)
    pub fn begin(&self, from: StreamId, to: StreamId, packet: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending {
            return Err(PipelineError::DuplicateRequest {
                from,
                to,
                packet,
                pending,
            });
        }
        if let Some(last) = state.last_delivered {
            if packet <= last {
                return Err(PipelineError::OutOfOrderPacket {
                    from,
                    to,
                    packet,
                    last: Some(last),
                    pending: None,
                });
            }
        }
        state.pending = Some(packet);
        Ok(())
    }

    /// Roll back a request whose upstream call failed
    pub fn abort(&self, packet: u64) {
        let mut state = self.state.lock();
        if state.pending == Some(packet) {
            state.pending = None;
        }
    }

    /// Settle `packet` before handing it downstream
    pub fn complete(&self, packet: u64) -> Delivery {
        let mut state = self.state.lock();
        if state.pending == Some(packet) {
            state.pending = None;
            state.last_delivered = Some(packet);
            Delivery::Requested
        } else {
            Delivery::Unrequested
        }
    }

    pub fn pending(&self) -> Option<u64> {
        self.state.lock().pending
    }
}

/// Reverse edge: the node's single upstream plus the request latch
#[derive(Debug)]
pub struct Edge {
    pub upstream: StreamId,
    latch: EdgeLatch,
}

impl Edge {
    pub fn latch(&self) -> &EdgeLatch {
        &self.latch
    }
}

/// Builder for an immutable [`Topology`]
pub struct TopologyBuilder {
    clock: Arc<PresentationClock>,
    nodes: HashMap<StreamId, Arc<dyn Stream>>,
    order: Vec<StreamId>,
    forward: HashMap<StreamId, Vec<StreamId>>,
    reverse: HashMap<StreamId, StreamId>,
    components: Vec<Arc<dyn Component>>,
}

impl TopologyBuilder {
    pub fn new(clock: Arc<PresentationClock>) -> Self {
        Self {
            clock,
            nodes: HashMap::new(),
            order: Vec::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
            components: Vec::new(),
        }
    }

    pub fn clock(&self) -> &Arc<PresentationClock> {
        &self.clock
    }

    /// Add a stream as a node; adding the same stream twice is a no-op
    pub fn add_stream(&mut self, stream: Arc<dyn Stream>) -> StreamId {
        let id = stream.id();
        if !self.nodes.contains_key(&id) {
            self.order.push(id);
            self.nodes.insert(id, stream);
        }
        id
    }

    /// Create a stream from `component` on this topology's clock and add it
    pub fn instantiate(&mut self, component: Arc<dyn Component>) -> Result<StreamId> {
        let stream = component.create_stream(Some(&self.clock))?;
        debug!(
            "Component {} ({}) -> stream {}",
            component.name(),
            component.id(),
            stream.id()
        );
        if !self.components.iter().any(|c| c.id() == component.id()) {
            self.components.push(component);
        }
        Ok(self.add_stream(stream))
    }

    /// Connect `from -> to`.
    ///
    /// The forward edge is always recorded (once); the reverse edge only if
    /// `to` has none yet.
    pub fn connect(&mut self, from: StreamId, to: StreamId) -> Result<()> {
        for id in [from, to] {
            if !self.nodes.contains_key(&id) {
                return Err(PipelineError::UnknownStream(id));
            }
        }
        if from == to {
            return Err(PipelineError::contract(format!("self loop on {}", from)));
        }

        let successors = self.forward.entry(from).or_default();
        if !successors.contains(&to) {
            successors.push(to);
        }

        match self.reverse.get(&to) {
            Some(existing) if *existing != from => {
                trace!(
                    "{} already requests from {}, {} -> {} is give-only",
                    to, existing, from, to
                );
            }
            Some(_) => {}
            None => {
                self.reverse.insert(to, from);
            }
        }
        Ok(())
    }

    pub fn build(self) -> Topology {
        let reverse = self
            .reverse
            .into_iter()
            .map(|(to, upstream)| {
                (
                    to,
                    Edge {
                        upstream,
                        latch: EdgeLatch::default(),
                    },
                )
            })
            .collect();

        let topology = Topology {
            id: NEXT_TOPOLOGY_ID.fetch_add(1, Ordering::Relaxed),
            clock: self.clock,
            nodes: self.nodes,
            order: self.order,
            forward: self.forward,
            reverse,
            components: self.components,
            packet_number: AtomicU64::new(0),
            first_packet_number: AtomicU64::new(1),
        };
        debug!(
            "Built topology {} with {} streams",
            topology.id,
            topology.order.len()
        );
        topology
    }
}

/// Frozen graph of streams sharing one presentation clock
pub struct Topology {
    id: u64,
    clock: Arc<PresentationClock>,
    nodes: HashMap<StreamId, Arc<dyn Stream>>,
    order: Vec<StreamId>,
    forward: HashMap<StreamId, Vec<StreamId>>,
    reverse: HashMap<StreamId, Edge>,
    components: Vec<Arc<dyn Component>>,
    /// Last packet number issued on this topology
    packet_number: AtomicU64,
    first_packet_number: AtomicU64,
}

impl Topology {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn clock(&self) -> &Arc<PresentationClock> {
        &self.clock
    }

    pub fn stream(&self, id: StreamId) -> Option<&Arc<dyn Stream>> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Streams in insertion order
    pub fn streams(&self) -> impl Iterator<Item = &Arc<dyn Stream>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn successors(&self, id: StreamId) -> &[StreamId] {
        self.forward.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reverse_edge(&self, id: StreamId) -> Option<&Edge> {
        self.reverse.get(&id)
    }

    pub fn upstream_of(&self, id: StreamId) -> Option<StreamId> {
        self.reverse.get(&id).map(|edge| edge.upstream)
    }

    /// Components whose instances may be reused by the next activation
    pub fn shareable_components(&self) -> Vec<Arc<dyn Component>> {
        self.components
            .iter()
            .filter(|c| c.is_shareable())
            .cloned()
            .collect()
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.components.iter().any(|c| c.id() == id)
    }

    pub fn packet_number(&self) -> u64 {
        self.packet_number.load(Ordering::Acquire)
    }

    pub fn first_packet_number(&self) -> u64 {
        self.first_packet_number.load(Ordering::Acquire)
    }

    /// Issue the next packet number
    pub(crate) fn next_packet_number(&self) -> u64 {
        self.packet_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Continue numbering after `last`, the outgoing topology's last packet
    pub(crate) fn continue_from(&self, last: u64) {
        self.packet_number.store(last, Ordering::Release);
        self.first_packet_number.store(last + 1, Ordering::Release);
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("id", &self.id)
            .field("streams", &self.order.len())
            .field("packet_number", &self.packet_number())
            .finish()
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        debug!(
            "Topology {} drained after packets {}..={}",
            self.id,
            self.first_packet_number(),
            self.packet_number()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::RequestPacket;
    use crate::pipeline::session::Session;
    use crate::pipeline::types::Sample;
    use crate::testing::test_clock;
    use proptest::prelude::*;

    struct Node(StreamId);

    impl Stream for Node {
        fn id(&self) -> StreamId {
            self.0
        }

        fn request_sample(&self, _: &Session, _: &RequestPacket, _: Option<StreamId>) -> Result<()> {
            Ok(())
        }

        fn process_sample(
            &self,
            _: &Session,
            _: Option<Sample>,
            _: &RequestPacket,
            _: StreamId,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn builder_with(n: usize) -> (TopologyBuilder, Vec<StreamId>) {
        let mut builder = TopologyBuilder::new(test_clock());
        let ids = (0..n)
            .map(|_| builder.add_stream(Arc::new(Node(StreamId::next()))))
            .collect();
        (builder, ids)
    }

    #[test]
    fn test_first_connection_wins() {
        let (mut b, ids) = builder_with(3);
        b.connect(ids[0], ids[2]).unwrap();
        b.connect(ids[1], ids[2]).unwrap();
        b.connect(ids[0], ids[2]).unwrap();
        let t = b.build();
        assert_eq!(t.upstream_of(ids[2]), Some(ids[0]));
        assert_eq!(t.successors(ids[0]), &[ids[2]]);
        assert_eq!(t.successors(ids[1]), &[ids[2]]);
    }

    #[test]
    fn test_branch_duplication_keeps_both_reverse_edges() {
        let (mut b, ids) = builder_with(3);
        b.connect(ids[0], ids[1]).unwrap();
        b.connect(ids[0], ids[2]).unwrap();
        let t = b.build();
        assert_eq!(t.upstream_of(ids[1]), Some(ids[0]));
        assert_eq!(t.upstream_of(ids[2]), Some(ids[0]));
    }

    #[test]
    fn test_connect_unknown_stream_is_contract_violation() {
        let (mut b, ids) = builder_with(1);
        let stray = StreamId::next();
        let err = b.connect(ids[0], stray).unwrap_err();
        assert_eq!(err, PipelineError::UnknownStream(stray));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_edge_latch_rejects_second_request() {
        let latch = EdgeLatch::default();
        let (a, b) = (StreamId(1), StreamId(2));
        latch.begin(a, b, 5).unwrap();
        assert!(matches!(
            latch.begin(a, b, 6),
            Err(PipelineError::DuplicateRequest { pending: 5, .. })
        ));
        assert_eq!(latch.complete(6), Delivery::Unrequested);
        assert_eq!(latch.complete(5), Delivery::Requested);
        assert!(matches!(
            latch.begin(a, b, 5),
            Err(PipelineError::OutOfOrderPacket { .. })
        ));
        latch.begin(a, b, 7).unwrap();
        latch.abort(7);
        assert_eq!(latch.pending(), None);
    }

    #[test]
    fn test_packet_numbers_continue() {
        let (b, _) = builder_with(1);
        let t = b.build();
        t.continue_from(42);
        assert_eq!(t.first_packet_number(), 43);
        assert_eq!(t.next_packet_number(), 43);
        assert_eq!(t.packet_number(), 43);
    }

    proptest! {
        #[test]
        fn prop_at_most_one_reverse_edge(
            edges in proptest::collection::vec((0usize..6, 0usize..6), 0..40)
        ) {
            let (mut b, ids) = builder_with(6);
            let mut first: HashMap<StreamId, StreamId> = HashMap::new();
            for (from, to) in edges {
                if from == to {
                    continue;
                }
                b.connect(ids[from], ids[to]).unwrap();
                first.entry(ids[to]).or_insert(ids[from]);
            }
            let t = b.build();
            for id in &ids {
                prop_assert_eq!(t.upstream_of(*id), first.get(id).copied());
                let succ = t.successors(*id);
                let mut dedup = succ.to_vec();
                dedup.sort();
                dedup.dedup();
                prop_assert_eq!(dedup.len(), succ.len());
            }
        }
    }
}
