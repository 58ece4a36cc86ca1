use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{MixKernel, MixerEngine};
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::stream::{Stream, StreamId};
use crate::pipeline::topology::TopologyBuilder;
use crate::pipeline::types::Sample;

/// Outstanding mixer request: one slot per input
struct MixerRequest {
    rp: RequestPacket,
    /// `None` until input `i` replied; the reply itself may be absent
    slots: Vec<Option<Option<Sample>>>,
    /// An input failed fatally; replies still due are absorbed, not mixed
    aborted: bool,
}

impl MixerRequest {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

struct MixerState<K: MixKernel> {
    engine: MixerEngine<K>,
    request: Option<MixerRequest>,
}

/// Output stream of a mixer
///
/// Each input is wired to its own [`MixerInlet`], so every input keeps a
/// private reverse edge and request latch. A request on the mixer fans out to
/// all inlets; the reply that fills the last slot commits the engine and
/// hands the output downstream with the original packet.
pub struct MixerStream<K: MixKernel> {
    id: StreamId,
    name: String,
    inlets: Vec<StreamId>,
    state: Mutex<MixerState<K>>,
    /// Mixer of the outgoing topology whose timeline this one continues
    predecessor: Mutex<Option<Arc<MixerStream<K>>>>,
}

impl<K: MixKernel> MixerStream<K> {
    pub fn new(name: &str, engine: MixerEngine<K>) -> (Arc<Self>, Vec<Arc<MixerInlet<K>>>) {
        let inputs = engine.inputs();
        let inlet_ids: Vec<StreamId> = (0..inputs).map(|_| StreamId::next()).collect();
        let mixer = Arc::new(Self {
            id: StreamId::next(),
            name: name.to_string(),
            inlets: inlet_ids.clone(),
            state: Mutex::new(MixerState {
                engine,
                request: None,
            }),
            predecessor: Mutex::new(None),
        });
        let inlets = inlet_ids
            .into_iter()
            .enumerate()
            .map(|(index, id)| {
                Arc::new(MixerInlet {
                    id,
                    index,
                    mixer: Arc::clone(&mixer),
                })
            })
            .collect();
        (mixer, inlets)
    }

    /// Add the mixer and its inlets to `builder`, wiring `sources[i]` to
    /// inlet `i`. Returns the mixer's stream id.
    pub fn wire(
        builder: &mut TopologyBuilder,
        mixer: Arc<Self>,
        inlets: Vec<Arc<MixerInlet<K>>>,
        sources: &[StreamId],
    ) -> Result<StreamId> {
        if sources.len() != inlets.len() {
            return Err(PipelineError::contract(format!(
                "mixer '{}' has {} inputs, {} sources given",
                mixer.name,
                inlets.len(),
                sources.len()
            )));
        }
        let id = builder.add_stream(mixer);
        for (inlet, source) in inlets.into_iter().zip(sources) {
            let inlet_id = builder.add_stream(inlet);
            builder.connect(*source, inlet_id)?;
        }
        Ok(id)
    }

    /// Continue `previous` once this mixer is first pulled: its cutoff and
    /// held-back input frames move over, so a switch leaves no gap.
    pub fn continue_from(&self, previous: &Arc<MixerStream<K>>) {
        if std::ptr::eq(Arc::as_ptr(previous), self) {
            return;
        }
        *self.predecessor.lock() = Some(Arc::clone(previous));
    }

    fn take_over_predecessor(&self) {
        let Some(previous) = self.predecessor.lock().take() else {
            return;
        };
        let mut theirs = previous.state.lock();
        if let Some(pending) = &theirs.request {
            debug!(
                "mixer '{}' starts fresh, '{}' still mixes packet {}",
                self.name, previous.name, pending.rp.packet_number
            );
            return;
        }
        let mut mine = self.state.lock();
        match mine.engine.take_over(&mut theirs.engine) {
            Ok(()) => debug!(
                "mixer '{}' continues '{}' at {:?}",
                self.name,
                previous.name,
                mine.engine.cutoff()
            ),
            Err(e) => warn!("mixer '{}' starts fresh: {}", self.name, e),
        }
    }

    /// Give up on `packet` after input `failed` could not be asked. Inputs
    /// after it were never asked; replies of those before it are absorbed.
    fn abort(&self, packet: u64, failed: usize) {
        let mut state = self.state.lock();
        let complete = match state.request.as_mut() {
            Some(request) if request.rp.packet_number == packet => {
                request.aborted = true;
                for slot in request.slots.iter_mut().skip(failed) {
                    slot.get_or_insert(None);
                }
                request.is_complete()
            }
            _ => return,
        };
        if complete {
            state.request = None;
        }
    }

    /// Run `f` on the engine under the processing lock
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut MixerEngine<K>) -> R) -> R {
        f(&mut self.state.lock().engine)
    }

    fn fill(
        &self,
        session: &Session,
        index: usize,
        sample: Option<Sample>,
        rp: &RequestPacket,
    ) -> Result<()> {
        let (rp, outcome) = {
            let mut state = self.state.lock();
            let Some(request) = state.request.as_mut() else {
                return Err(PipelineError::contract(format!(
                    "mixer '{}' input {} delivered packet {} without a request",
                    self.name, index, rp.packet_number
                )));
            };
            if request.rp.packet_number != rp.packet_number {
                return Err(PipelineError::OutOfOrderPacket {
                    from: self.inlets[index],
                    to: self.id,
                    packet: rp.packet_number,
                    last: None,
                    pending: Some(request.rp.packet_number),
                });
            }
            let Some(slot) = request.slots.get_mut(index) else {
                return Err(PipelineError::contract(format!(
                    "mixer '{}' has no input {}",
                    self.name, index
                )));
            };
            if slot.is_some() {
                return Err(PipelineError::contract(format!(
                    "mixer '{}' input {} answered packet {} twice",
                    self.name, index, rp.packet_number
                )));
            }
            *slot = Some(sample);
            if !request.is_complete() {
                return Ok(());
            }

            let Some(request) = state.request.take() else {
                return Ok(());
            };
            if request.aborted {
                trace!(
                    "mixer '{}' absorbed the last reply to aborted packet {}",
                    self.name, rp.packet_number
                );
                return Ok(());
            }
            let args = request.slots.into_iter().map(Option::flatten).collect();
            let outcome = state.engine.commit(&request.rp, args);
            (request.rp, outcome)
        };

        let outcome = outcome?;
        for _ in 0..outcome.late_inputs {
            session.health().record_late_drop();
        }
        trace!(
            "mixer '{}' committed {:?} for packet {}",
            self.name, outcome.window, rp.packet_number
        );
        session.give_sample(self.id, outcome.output, &rp, false)
    }
}

impl<K: MixKernel> Stream for MixerStream<K> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn request_sample(
        &self,
        session: &Session,
        rp: &RequestPacket,
        prev: Option<StreamId>,
    ) -> Result<()> {
        self.take_over_predecessor();
        {
            let mut state = self.state.lock();
            if let Some(pending) = &state.request {
                return Err(PipelineError::DuplicateRequest {
                    from: self.id,
                    to: prev.unwrap_or(self.id),
                    packet: rp.packet_number,
                    pending: pending.rp.packet_number,
                });
            }
            state.request = Some(MixerRequest {
                rp: rp.clone(),
                slots: vec![None; self.inlets.len()],
                aborted: false,
            });
        }

        if self.inlets.is_empty() {
            let (rp, outcome) = {
                let mut state = self.state.lock();
                state.request = None;
                (rp.clone(), state.engine.commit(rp, Vec::new()))
            };
            return session.give_sample(self.id, outcome?.output, &rp, false);
        }

        // the processing lock is released: replies may arrive re-entrantly
        for (index, inlet) in self.inlets.iter().enumerate() {
            if let Err(e) = session.request_upstream(*inlet, rp) {
                if e.is_fatal() {
                    self.abort(rp.packet_number, index);
                    return Err(e);
                }
                debug!("mixer '{}' input {} unavailable: {}", self.name, index, e);
                self.fill(session, index, None, rp)?;
            }
        }
        Ok(())
    }

    fn process_sample(
        &self,
        _session: &Session,
        _sample: Option<Sample>,
        _rp: &RequestPacket,
        prev: StreamId,
    ) -> Result<()> {
        Err(PipelineError::contract(format!(
            "mixer '{}' received a sample from {}; inputs go through its inlets",
            self.name, prev
        )))
    }
}

/// Input port of a mixer
pub struct MixerInlet<K: MixKernel> {
    id: StreamId,
    index: usize,
    mixer: Arc<MixerStream<K>>,
}

impl<K: MixKernel> MixerInlet<K> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K: MixKernel> Stream for MixerInlet<K> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn name(&self) -> &str {
        "mixer-inlet"
    }

    fn request_sample(
        &self,
        _session: &Session,
        _rp: &RequestPacket,
        _prev: Option<StreamId>,
    ) -> Result<()> {
        Err(PipelineError::contract(format!(
            "inlet {} of mixer '{}' is pulled by its mixer only",
            self.index, self.mixer.name
        )))
    }

    fn process_sample(
        &self,
        session: &Session,
        sample: Option<Sample>,
        rp: &RequestPacket,
        _prev: StreamId,
    ) -> Result<()> {
        self.mixer.fill(session, self.index, sample, rp)
    }
}
