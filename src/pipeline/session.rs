//! Session: owner of the active topology
//!
//! The current topology is an atomically published pointer: readers never
//! lock, and a swap is a single store. Sinks enter through
//! [`Session::request_sample`] with `is_sink = true`; that is the only place
//! where packets are numbered and where a queued switch is performed. Every
//! later hop resolves its edges in the topology pinned into the packet.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::error::{ErrorKind, PipelineError, Result};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::state::SessionState;
use crate::pipeline::stream::StreamId;
use crate::pipeline::topology::{Delivery, Topology};
use crate::pipeline::types::{Sample, Timestamp};
use crate::work::WorkContext;

pub struct Session {
    this: Weak<Session>,
    current: ArcSwapOption<Topology>,
    /// Switch mutex; holds the swap queued for the next sink request
    switch: Mutex<Option<Arc<Topology>>>,
    state: Mutex<SessionState>,
    health: Arc<PipelineHealth>,
    context: WorkContext,
}

impl Session {
    pub fn new(context: WorkContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Session {
            this: this.clone(),
            current: ArcSwapOption::empty(),
            switch: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            health: Arc::new(PipelineHealth::new()),
            context,
        })
    }

    /// Strong handle to this session
    pub fn handle(&self) -> Option<Arc<Session>> {
        self.this.upgrade()
    }

    pub fn current(&self) -> Option<Arc<Topology>> {
        self.current.load_full()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn context(&self) -> &WorkContext {
        &self.context
    }

    /// Publish the first topology; the clock starts with [`Session::start`]
    pub fn install(&self, topology: Topology) -> Result<Arc<Topology>> {
        let topology = Arc::new(topology);
        self.switch_topology_immediate(Arc::clone(&topology), Timestamp::ZERO)?;
        Ok(topology)
    }

    /// Start the clock of the current topology at `t`
    pub fn start(&self, t: Timestamp) -> Result<()> {
        let topology = self
            .current()
            .ok_or_else(|| PipelineError::contract("session started without a topology"))?;
        self.state.lock().transition(SessionState::Initializing)?;

        match topology.clock().clock_start(t, None) {
            Ok(()) => {
                self.state
                    .lock()
                    .transition(SessionState::Running { since: t })?;
                info!("Session started at {} on topology {}", t, topology.id());
                Ok(())
            }
            Err(e) => {
                error!("Session start refused: {}", e);
                self.state.lock().transition(SessionState::Idle)?;
                Err(e)
            }
        }
    }

    pub fn pause(&self, t: Timestamp) -> Result<()> {
        self.state.lock().transition(SessionState::Paused { at: t })?;
        if let Some(topology) = self.current() {
            topology.clock().clock_pause(t);
        }
        info!("Session paused at {}", t);
        Ok(())
    }

    pub fn resume(&self, t: Timestamp) -> Result<()> {
        let Some(topology) = self.current() else {
            return Err(PipelineError::contract("session resumed without a topology"));
        };
        if !self.state().is_paused() {
            return Err(PipelineError::InvalidState {
                from: self.state().description().to_string(),
                to: "Running".to_string(),
            });
        }
        topology.clock().clock_start(t, None)?;
        self.state
            .lock()
            .transition(SessionState::Running { since: t })?;
        info!("Session resumed at {}", t);
        Ok(())
    }

    /// Stop the clock at `t`; sinks drain synchronously before this returns
    pub fn stop(&self, t: Timestamp) -> Result<()> {
        self.state.lock().transition(SessionState::Stopping)?;
        if let Some(dropped) = self.switch.lock().take() {
            debug!("Discarding queued switch to topology {}", dropped.id());
        }

        if let Some(topology) = self.current() {
            topology.clock().clock_stop(t);
        }
        self.current.store(None);
        self.state.lock().transition(SessionState::Stopped)?;
        info!("Session stopped at {}: {}", t, self.health.summary());
        Ok(())
    }

    /// Queue `topology` to replace the current one at the next sink request
    pub fn queue_switch(&self, topology: Arc<Topology>) {
        let mut pending = self.switch.lock();
        if let Some(replaced) = pending.replace(topology) {
            debug!("Queued switch to topology {} superseded", replaced.id());
        }
    }

    pub fn has_pending_switch(&self) -> bool {
        self.switch.lock().is_some()
    }

    /// Swap the current topology now.
    ///
    /// Numbering continues from the outgoing topology and, when the session is
    /// running, the incoming clock starts at `t` taking over the outgoing
    /// clock's pending callbacks. If the clock refuses, the outgoing topology
    /// is restored.
    pub fn switch_topology_immediate(&self, topology: Arc<Topology>, t: Timestamp) -> Result<()> {
        let _guard = self.switch.lock();
        self.swap_locked(topology, t)
    }

    fn swap_locked(&self, topology: Arc<Topology>, t: Timestamp) -> Result<()> {
        let old = self.current.load_full();
        if let Some(old) = &old {
            if Arc::ptr_eq(old, &topology) {
                return Ok(());
            }
            topology.continue_from(old.packet_number());
        }

        self.current.store(Some(Arc::clone(&topology)));
        if let Some(session) = self.handle() {
            for stream in topology.streams() {
                stream.attach(&session);
            }
        }

        if self.state().is_running() {
            let previous = old.as_ref().map(|o| Arc::clone(o.clock()));
            if let Err(e) = topology.clock().clock_start(t, previous.as_ref()) {
                error!(
                    "Clock of topology {} refused to start: {}; keeping the outgoing topology",
                    topology.id(),
                    e
                );
                self.current.store(old);
                return Err(e);
            }
        }

        match &old {
            Some(old) => {
                self.health.record_switch();
                info!(
                    "Switched topology {} -> {} after packet {}",
                    old.id(),
                    topology.id(),
                    old.packet_number()
                );
            }
            None => debug!("Installed topology {}", topology.id()),
        }
        Ok(())
    }

    /// Pull entry point.
    ///
    /// With `is_sink`, performs a queued switch, pins the current topology and
    /// numbers the packet; otherwise resolves in the topology already pinned
    /// into `rp`. Fails with `NotConnected` when `stream` is not part of the
    /// resolved topology. A queued switch whose clock refuses to start is
    /// reported to the supervisor and the request is served by the outgoing
    /// topology.
    pub fn request_sample(
        &self,
        stream: StreamId,
        rp: &mut RequestPacket,
        is_sink: bool,
    ) -> Result<()> {
        if !is_sink {
            return self.request_upstream(stream, rp);
        }

        {
            let mut pending = self.switch.lock();
            if let Some(next) = pending.take() {
                // a refused switch keeps the outgoing topology serving
                if let Err(e) = self.swap_locked(next, rp.request_time) {
                    self.handle_failure(stream, &e);
                }
            }
            let topology = self
                .current
                .load_full()
                .ok_or(PipelineError::NotConnected(stream))?;
            if !topology.contains(stream) {
                trace!("{} not in topology {}, drained", stream, topology.id());
                return Err(PipelineError::NotConnected(stream));
            }
            let number = topology.next_packet_number();
            rp.pin(topology, number);
        }
        self.health.record_packet();
        trace!("{} issues packet {}", stream, rp.packet_number);

        let result = self.request_upstream(stream, rp);
        if let Err(e) = &result {
            self.handle_failure(stream, e);
        }
        result
    }

    /// Non-sink pull path: ask `stream`'s single upstream for `rp`
    pub fn request_upstream(&self, stream: StreamId, rp: &RequestPacket) -> Result<()> {
        let topology = rp
            .topology()
            .ok_or(PipelineError::NotConnected(stream))?;
        if !topology.contains(stream) {
            return Err(PipelineError::NotConnected(stream));
        }
        let edge = topology
            .reverse_edge(stream)
            .ok_or(PipelineError::NotConnected(stream))?;
        let upstream = topology
            .stream(edge.upstream)
            .ok_or(PipelineError::UnknownStream(edge.upstream))?;

        edge.latch()
            .begin(edge.upstream, stream, rp.packet_number)?;
        match upstream.request_sample(self, rp, Some(stream)) {
            Ok(()) => Ok(()),
            Err(e) => {
                edge.latch().abort(rp.packet_number);
                Err(e)
            }
        }
    }

    /// Push `sample` from `stream` to its successors in `rp`'s topology.
    ///
    /// Successors that requested this packet over their reverse edge, or that
    /// are wired give-only, receive it; sibling branches that did not ask are
    /// skipped. The first fatal error aborts delivery and is returned.
    pub fn give_sample(
        &self,
        stream: StreamId,
        sample: Option<Sample>,
        rp: &RequestPacket,
        is_source: bool,
    ) -> Result<()> {
        let topology = rp
            .topology()
            .ok_or(PipelineError::NotConnected(stream))?;
        if !topology.contains(stream) {
            return Err(PipelineError::NotConnected(stream));
        }

        let sample = match sample {
            Some(s) if is_source => {
                let s = s.with_discontinuity(rp.flags.discontinuity);
                self.health.record_delivery(s.discontinuity);
                Some(s)
            }
            other => other,
        };

        for &next in topology.successors(stream) {
            if let Some(edge) = topology.reverse_edge(next) {
                if edge.upstream == stream
                    && edge.latch().complete(rp.packet_number) == Delivery::Unrequested
                {
                    trace!("{} did not request packet {}", next, rp.packet_number);
                    continue;
                }
            }
            let Some(successor) = topology.stream(next) else {
                continue;
            };
            if let Err(e) = successor.process_sample(self, sample.clone(), rp, stream) {
                if e.is_fatal() {
                    return Err(e);
                }
                match e.kind() {
                    ErrorKind::TransientOverload => {
                        self.health.record_drop();
                        debug!("{} dropped packet {}: {}", next, rp.packet_number, e);
                    }
                    _ => debug!("{} skipped packet {}: {}", next, rp.packet_number, e),
                }
            }
        }
        Ok(())
    }

    /// Report a failure raised outside a sink's call chain (async workers)
    pub fn report(&self, origin: &str, error: PipelineError) {
        if error.is_fatal() {
            self.health.record_fatal();
        }
        self.context.report(origin, error);
    }

    fn handle_failure(&self, stream: StreamId, e: &PipelineError) {
        match e.kind() {
            ErrorKind::NotConnected => trace!("packet from {} hit a drained topology", stream),
            ErrorKind::TransientOverload => {
                self.health.record_drop();
                debug!("{}: {}", stream, e);
            }
            ErrorKind::Cancelled => debug!("{}: cancelled", stream),
            _ => {
                warn!("Request from {} failed: {}", stream, e);
                self.report(&stream.to_string(), e.clone());
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("topology", &self.current().map(|t| t.id()))
            .finish()
    }
}
