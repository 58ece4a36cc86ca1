//! Stream and component contracts
//!
//! Every pipeline node is a [`Stream`]. Data moves in two phases:
//!
//! - `request_sample` travels upstream (sink → source). It must never block
//!   and must never hold the stream's processing lock while it recurses back
//!   into the [`Session`], since the recursion can re-enter arbitrarily deep.
//! - `process_sample` travels downstream (source → sink) and may hold the
//!   processing lock for bookkeeping.
//!
//! Streams are created by a [`Component`]. Streams belong to exactly one
//! topology; components may be reused across activations when shareable.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::clock::PresentationClock;
use crate::error::Result;
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::types::Sample;

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_COMPONENT_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique stream identity, used as the node key in a topology.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Process-unique component identity; stable across activations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl ComponentId {
    pub fn next() -> Self {
        ComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a component instance may be reused by the next activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Shareable,
    NotShareable,
}

/// Factory for streams
pub trait Component: Send + Sync {
    fn id(&self) -> ComponentId;

    fn name(&self) -> &str;

    fn instance_type(&self) -> InstanceType;

    fn is_shareable(&self) -> bool {
        self.instance_type() == InstanceType::Shareable
    }

    /// Create a stream for a new topology. Clock-driven streams register
    /// themselves with `clock`.
    fn create_stream(&self, clock: Option<&Arc<PresentationClock>>) -> Result<Arc<dyn Stream>>;
}

/// A pull/push node within a topology
pub trait Stream: Send + Sync {
    fn id(&self) -> StreamId;

    /// Name of this stream for logging
    fn name(&self) -> &str {
        "stream"
    }

    /// Owning component, if any
    fn component(&self) -> Option<ComponentId> {
        None
    }

    /// The topology holding this stream was published to `session`.
    /// Clock-driven sinks keep a weak reference to issue their requests.
    fn attach(&self, _session: &Arc<Session>) {}

    /// Upstream phase. `prev` is the downstream stream that asked.
    fn request_sample(
        &self,
        session: &Session,
        rp: &RequestPacket,
        prev: Option<StreamId>,
    ) -> Result<()>;

    /// Downstream phase. `prev` is the upstream stream that produced `sample`;
    /// `None` means the upstream had nothing to deliver for this packet.
    fn process_sample(
        &self,
        session: &Session,
        sample: Option<Sample>,
        rp: &RequestPacket,
        prev: StreamId,
    ) -> Result<()>;
}

/// Bounded worker capacity with drop accounting.
///
/// Slots are permits of a tokio semaphore, taken without waiting. A stream
/// that cannot serve a unit of work takes no permit, counts the drop and arms
/// a discontinuity flag that the next served unit picks up.
#[derive(Debug)]
pub struct CapacityGate {
    slots: usize,
    permits: Arc<Semaphore>,
    dropped: AtomicU64,
    discontinuity: AtomicBool,
}

impl CapacityGate {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots,
            permits: Arc::new(Semaphore::new(slots)),
            dropped: AtomicU64::new(0),
            discontinuity: AtomicBool::new(false),
        }
    }

    /// Take a worker slot without waiting
    pub fn try_acquire(&self) -> Option<CapacityPermit> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(CapacityPermit { _permit: permit })
    }

    /// Count a dropped unit and flag the next served one
    pub fn record_drop(&self) -> u64 {
        self.discontinuity.store(true, Ordering::Release);
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Consume the pending discontinuity flag
    pub fn take_discontinuity(&self) -> bool {
        self.discontinuity.swap(false, Ordering::AcqRel)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> usize {
        self.slots - self.permits.available_permits()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// Worker slot held for the duration of one unit of work; dropping it frees
/// the slot on whichever thread the work ended
#[derive(Debug)]
pub struct CapacityPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_are_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", StreamId(7)), "StreamId(7)");
    }

    #[test]
    fn test_capacity_gate_drops_and_flags() {
        let gate = Arc::new(CapacityGate::new(1));
        let permit = gate.try_acquire().expect("first slot is free");
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.record_drop(), 1);
        drop(permit);

        let _permit = gate.try_acquire().expect("slot released");
        assert!(gate.take_discontinuity());
        assert!(!gate.take_discontinuity());
        assert_eq!(gate.dropped(), 1);
    }

    #[test]
    fn test_capacity_gate_concurrent_bound() {
        let gate = Arc::new(CapacityGate::new(3));
        let permits: Vec<_> = (0..10).filter_map(|_| gate.try_acquire()).collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(gate.busy(), 3);
        drop(permits);
        assert_eq!(gate.busy(), 0);
    }

    #[test]
    fn test_capacity_permit_released_on_worker_thread() {
        let gate = Arc::new(CapacityGate::new(0));
        assert_eq!(gate.slots(), 1);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    let mut served = 0u64;
                    for _ in 0..500 {
                        match gate.try_acquire() {
                            Some(permit) => {
                                assert_eq!(gate.busy(), 1);
                                served += 1;
                                drop(permit);
                            }
                            None => {
                                gate.record_drop();
                            }
                        }
                    }
                    served
                })
            })
            .collect();
        let served: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(served + gate.dropped(), 8 * 500);
        assert_eq!(gate.busy(), 0);
        assert!(gate.try_acquire().is_some());
    }
}
