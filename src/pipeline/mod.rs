//! Pull-based pipeline core
//!
//! The pipeline is a graph of [`Stream`]s held by an immutable [`Topology`]
//! and driven by a [`Session`]:
//! - Sinks pull: `request_sample` walks the reverse edges up to a source
//! - Sources push: `give_sample` walks the forward edges back down
//! - Every pull cycle is one numbered [`RequestPacket`] pinned to the topology
//!   it was issued against, so topologies can be swapped live
//! - Health counters and the supervisor observe one clock domain

pub mod health;
pub mod packet;
pub mod session;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod topology;
pub mod types;

pub use health::{HealthAlert, HealthMonitor, HealthSummary, PipelineHealth};
pub use packet::{PacketFlags, RequestPacket};
pub use session::Session;
pub use state::SessionState;
pub use stream::{CapacityGate, CapacityPermit, Component, ComponentId, InstanceType, Stream, StreamId};
pub use supervisor::{Decision, Supervisor};
pub use topology::{Delivery, Edge, EdgeLatch, Topology, TopologyBuilder};
pub use types::{FrameRate, MediaKind, Payload, Sample, SampleUnit, Timestamp};
