use std::ops::Range;

use log::{debug, warn};

use super::MixKernel;
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::types::{FrameRate, Sample, SampleUnit, Timestamp};

/// Result of committing one mixer request
#[derive(Debug)]
pub struct MixOutcome {
    /// Mixed output for `window`; `None` when the cutoff did not move
    pub output: Option<Sample>,
    pub window: Range<i64>,
    /// Inputs whose data was entirely older than the cutoff
    pub late_inputs: usize,
    /// Packets discarded for lying below the cutoff
    pub discarded: usize,
}

/// Frame-synchronizing core of a mixer.
///
/// Keeps the committed cutoff and one leftover queue per input. Each commit
/// takes one (optional) sample per input and emits at most one output that
/// spans `[old_cutoff, new_cutoff)`.
pub struct MixerEngine<K: MixKernel> {
    kernel: K,
    rate: FrameRate,
    start_frame: Option<i64>,
    cutoff: Option<i64>,
    leftovers: Vec<Vec<K::Packet>>,
}

impl<K: MixKernel> MixerEngine<K> {
    pub fn new(kernel: K, rate: FrameRate, inputs: usize) -> Self {
        Self {
            kernel,
            rate,
            start_frame: None,
            cutoff: None,
            leftovers: (0..inputs).map(|_| Vec::new()).collect(),
        }
    }

    /// Pin the initial cutoff instead of taking the earliest input position
    pub fn with_start_frame(mut self, frame: i64) -> Self {
        self.start_frame = Some(frame);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn rate(&self) -> FrameRate {
        self.rate
    }

    pub fn inputs(&self) -> usize {
        self.leftovers.len()
    }

    pub fn cutoff(&self) -> Option<i64> {
        self.cutoff
    }

    /// Frame span held back for `input`, if any
    pub fn leftover_range(&self, input: usize) -> Option<Range<i64>> {
        let packets = self.leftovers.get(input)?;
        let start = packets
            .iter()
            .map(|p| self.kernel.frame_range(p).start)
            .min()?;
        let end = packets
            .iter()
            .map(|p| self.kernel.frame_range(p).end)
            .max()?;
        Some(start..end)
    }

    /// Continue the output timeline of `previous`.
    ///
    /// Its cutoff moves over, as do the leftovers of every input index both
    /// engines have; leftovers of inputs this engine lacks are dropped.
    pub fn take_over(&mut self, previous: &mut MixerEngine<K>) -> Result<()> {
        if previous.rate != self.rate {
            return Err(PipelineError::contract(format!(
                "mixer at {} cannot continue one at {}",
                self.rate, previous.rate
            )));
        }
        if let Some(cutoff) = previous.cutoff.take() {
            self.cutoff = Some(cutoff);
        }
        for (mine, theirs) in self.leftovers.iter_mut().zip(previous.leftovers.iter_mut()) {
            *mine = std::mem::take(theirs);
        }
        let dropped: usize = previous
            .leftovers
            .iter_mut()
            .map(|packets| std::mem::take(packets).len())
            .sum();
        if dropped > 0 {
            debug!("mixer takeover dropped {} leftovers of removed inputs", dropped);
        }
        Ok(())
    }

    /// Commit one request given every input's reply (`None` = absent)
    pub fn commit(&mut self, rp: &RequestPacket, args: Vec<Option<Sample>>) -> Result<MixOutcome> {
        if args.len() != self.leftovers.len() {
            return Err(PipelineError::contract(format!(
                "mixer expects {} inputs, got {}",
                self.leftovers.len(),
                args.len()
            )));
        }
        let drain = rp.is_drain();

        let mut fresh = Vec::with_capacity(args.len());
        let mut reach = Vec::with_capacity(args.len());
        let mut first: Option<i64> = None;
        for (i, arg) in args.into_iter().enumerate() {
            let leftover_end = self.leftovers[i]
                .iter()
                .map(|p| self.kernel.frame_range(p).end)
                .max();
            let (arg_end, packets) = match arg {
                Some(sample) => {
                    let sample = to_frames(sample, self.rate);
                    first = Some(first.map_or(sample.position, |f| f.min(sample.position)));
                    let end = sample.end();
                    (Some(end), self.kernel.unpack(i, sample)?)
                }
                None => (None, Vec::new()),
            };
            let r = match (arg_end, leftover_end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if r.is_none() && !drain {
                return Err(PipelineError::MixerInputMissing {
                    input: i,
                    packet: rp.packet_number,
                });
            }
            reach.push(r);
            fresh.push(packets);
        }

        let Some(old) = self.cutoff.or(self.start_frame).or(first) else {
            // drain before any input produced
            return Ok(MixOutcome {
                output: None,
                window: 0..0,
                late_inputs: 0,
                discarded: 0,
            });
        };

        let mut late_inputs = 0;
        let mut target: Option<i64> = None;
        for (i, r) in reach.iter().enumerate() {
            match *r {
                Some(r) if r < old => {
                    late_inputs += 1;
                    debug!(
                        "mixer input {} ends at {} behind cutoff {}, dropped",
                        i, r, old
                    );
                }
                Some(r) => target = Some(target.map_or(r, |t| t.min(r))),
                None => {}
            }
        }

        let mut new = old.max(target.unwrap_or(old));
        if drain {
            let forced = self.rate.frame_at(rp.request_time);
            for (i, r) in reach.iter().enumerate() {
                if r.is_none_or(|r| r < forced) {
                    warn!(
                        "mixer input {} produced up to {:?}, drain at frame {} leaves a gap",
                        i, r, forced
                    );
                }
            }
            new = old.max(forced);
        }

        let mut working: Vec<Vec<K::Packet>> = (0..fresh.len()).map(|_| Vec::new()).collect();
        let mut discarded = 0;
        for (i, packets) in fresh.into_iter().enumerate() {
            let carried = std::mem::take(&mut self.leftovers[i]);
            for piece in carried.into_iter().chain(packets) {
                let (late, keep) = self.kernel.move_frames(piece, old);
                if late.is_some() {
                    discarded += 1;
                }
                let Some(keep) = keep else {
                    continue;
                };
                let (now, later) = self.kernel.move_frames(keep, new);
                if let Some(p) = now {
                    working[i].push(p);
                }
                if let Some(p) = later {
                    self.leftovers[i].push(p);
                }
            }
        }
        if discarded > 0 {
            debug!("mixer discarded {} late packets below {}", discarded, old);
        }

        self.cutoff = Some(new);
        if new == old {
            return Ok(MixOutcome {
                output: None,
                window: old..old,
                late_inputs,
                discarded,
            });
        }

        let output = self.kernel.mix(old..new, &working, rp)?;
        Ok(MixOutcome {
            output: Some(output),
            window: old..new,
            late_inputs,
            discarded,
        })
    }
}

/// Express a clock-timed sample in frames of `rate`
fn to_frames(sample: Sample, rate: FrameRate) -> Sample {
    match sample.unit {
        SampleUnit::Frames => sample,
        SampleUnit::Micros => {
            let start = rate.frame_at(Timestamp::from_micros(sample.position));
            let end = rate.frame_at(Timestamp::from_micros(sample.end()));
            Sample {
                position: start,
                duration: end - start,
                unit: SampleUnit::Frames,
                ..sample
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{MediaKind, Payload};
    use proptest::prelude::*;

    /// Packet carrying one value per frame
    #[derive(Debug, Clone)]
    struct Run {
        start: i64,
        values: Vec<i64>,
    }

    /// Kernel summing per-frame values; inputs carry `value = input * 1000 + frame`
    #[derive(Default)]
    struct SumKernel {
        mixes: usize,
    }

    impl MixKernel for SumKernel {
        type Packet = Run;

        fn unpack(&mut self, input: usize, sample: Sample) -> Result<Vec<Run>> {
            if sample.duration == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![Run {
                start: sample.position,
                values: (sample.position..sample.end())
                    .map(|f| input as i64 * 1000 + f)
                    .collect(),
            }])
        }

        fn frame_range(&self, p: &Run) -> Range<i64> {
            p.start..p.start + p.values.len() as i64
        }

        fn move_frames(&self, p: Run, at: i64) -> (Option<Run>, Option<Run>) {
            let end = p.start + p.values.len() as i64;
            if at <= p.start {
                return (None, Some(p));
            }
            if at >= end {
                return (Some(p), None);
            }
            let split = (at - p.start) as usize;
            let (a, b) = p.values.split_at(split);
            (
                Some(Run {
                    start: p.start,
                    values: a.to_vec(),
                }),
                Some(Run {
                    start: at,
                    values: b.to_vec(),
                }),
            )
        }

        fn mix(&mut self, window: Range<i64>, inputs: &[Vec<Run>], _: &RequestPacket) -> Result<Sample> {
            self.mixes += 1;
            let mut out = vec![0_i64; (window.end - window.start) as usize];
            for packets in inputs {
                for p in packets {
                    for (k, v) in p.values.iter().enumerate() {
                        out[(p.start + k as i64 - window.start) as usize] += v;
                    }
                }
            }
            let len = out.len() as i64;
            Ok(Sample::frames(
                MediaKind::Audio,
                Payload::shared(std::sync::Arc::new(out)),
                window.start,
                len,
            ))
        }
    }

    fn chunk(start: i64, end: i64) -> Option<Sample> {
        Some(Sample::frames(MediaKind::Audio, Payload::Empty, start, end - start))
    }

    fn rp(n: u64) -> RequestPacket {
        let mut rp = RequestPacket::new(Timestamp::ZERO);
        rp.packet_number = n;
        rp
    }

    fn values(sample: &Sample) -> Vec<i64> {
        sample.payload.downcast_ref::<Vec<i64>>().cloned().unwrap()
    }

    #[test]
    fn test_cutoff_is_min_of_input_reach() {
        let mut engine = MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 3);
        let out = engine
            .commit(&rp(1), vec![chunk(0, 10), chunk(0, 7), chunk(0, 12)])
            .unwrap();

        assert_eq!(out.window, 0..7);
        assert_eq!(engine.cutoff(), Some(7));
        assert_eq!(engine.leftover_range(0), Some(7..10));
        assert_eq!(engine.leftover_range(1), None);
        assert_eq!(engine.leftover_range(2), Some(7..12));
        let mixed = values(&out.output.unwrap());
        assert_eq!(mixed[0], 1000 + 2000);
        assert_eq!(mixed[6], 6 + 1006 + 2006);
    }

    #[test]
    fn test_leftovers_reinjected_before_new_data() {
        let mut engine = MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 2);
        engine.commit(&rp(1), vec![chunk(0, 10), chunk(0, 4)]).unwrap();
        let out = engine.commit(&rp(2), vec![chunk(10, 10), chunk(4, 12)]).unwrap();
        assert_eq!(out.window, 4..10);
        assert_eq!(engine.leftover_range(1), Some(10..12));
        assert_eq!(values(&out.output.unwrap())[0], 4 + 1004);
    }

    #[test]
    fn test_drain_forces_cutoff() {
        let rate = FrameRate::per_second(100);
        let mut engine = MixerEngine::new(SumKernel::default(), rate, 2);
        engine.commit(&rp(1), vec![chunk(0, 5), chunk(0, 5)]).unwrap();

        let drain = RequestPacket::drain(rate.time_of(20));
        let out = engine
            .commit(&drain, vec![chunk(5, 15), chunk(5, 15)])
            .unwrap();
        assert_eq!(out.window, 5..20);
        let sample = out.output.unwrap();
        assert_eq!(sample.duration, 15);
        // frames 15..20 are a gap, not a hang
        assert_eq!(values(&sample)[14], 0);
        assert_eq!(engine.cutoff(), Some(20));
    }

    #[test]
    fn test_missing_input_is_contract_violation() {
        let mut engine = MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 2);
        let err = engine.commit(&rp(3), vec![chunk(0, 5), None]).unwrap_err();
        assert_eq!(err, PipelineError::MixerInputMissing { input: 1, packet: 3 });

        // a drain tolerates it
        let drain = RequestPacket::drain(Timestamp::ZERO);
        assert!(engine.commit(&drain, vec![chunk(0, 5), None]).is_ok());
    }

    #[test]
    fn test_unchanged_cutoff_skips_mix() {
        let mut engine = MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 2);
        engine.commit(&rp(1), vec![chunk(0, 5), chunk(0, 5)]).unwrap();
        let out = engine.commit(&rp(2), vec![chunk(5, 9), chunk(5, 5)]).unwrap();
        assert!(out.output.is_none());
        assert_eq!(engine.kernel().mixes, 1);
        assert_eq!(engine.leftover_range(0), Some(5..9));
    }

    #[test]
    fn test_late_input_dropped_not_stalling() {
        let mut engine = MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 2);
        engine.commit(&rp(1), vec![chunk(0, 8), chunk(0, 8)]).unwrap();
        let out = engine.commit(&rp(2), vec![chunk(8, 12), chunk(2, 6)]).unwrap();
        assert_eq!(out.late_inputs, 1);
        assert_eq!(out.discarded, 1);
        assert_eq!(out.window, 8..12);
    }

    #[test]
    fn test_start_frame_pins_initial_cutoff() {
        let mut engine =
            MixerEngine::new(SumKernel::default(), FrameRate::per_second(100), 1).with_start_frame(3);
        let out = engine.commit(&rp(1), vec![chunk(0, 6)]).unwrap();
        assert_eq!(out.window, 3..6);
        assert_eq!(out.discarded, 1);
    }

    #[test]
    fn test_timed_sample_converted_to_frames() {
        let rate = FrameRate::per_second(100);
        let mut engine = MixerEngine::new(SumKernel::default(), rate, 1);
        let sample = Sample::timed(
            MediaKind::Audio,
            Payload::Empty,
            Timestamp::from_micros(0),
            std::time::Duration::from_millis(50),
        );
        let out = engine.commit(&rp(1), vec![Some(sample)]).unwrap();
        assert_eq!(out.window, 0..5);
    }

    #[test]
    fn test_take_over_continues_timeline() {
        let rate = FrameRate::per_second(100);
        let mut old = MixerEngine::new(SumKernel::default(), rate, 2);
        old.commit(&rp(1), vec![chunk(0, 10), chunk(0, 6)]).unwrap();

        // the successor gains an input; input 0 keeps its held-back frames
        let mut new = MixerEngine::new(SumKernel::default(), rate, 3);
        new.take_over(&mut old).unwrap();
        assert_eq!(new.cutoff(), Some(6));
        assert_eq!(new.leftover_range(0), Some(6..10));
        assert_eq!(old.cutoff(), None);
        assert_eq!(old.leftover_range(0), None);

        let out = new
            .commit(&rp(2), vec![chunk(10, 12), chunk(6, 12), chunk(6, 12)])
            .unwrap();
        assert_eq!(out.window, 6..12);
        assert_eq!(out.discarded, 0);
        assert_eq!(values(&out.output.unwrap())[0], 6 + 1006 + 2006);

        let mut other_rate = MixerEngine::new(SumKernel::default(), FrameRate::per_second(50), 2);
        assert!(other_rate.take_over(&mut new).is_err());
    }

    /// Split `[0, n)` at `cuts` into consecutive chunks
    fn chunks(n: i64, mut cuts: Vec<i64>) -> Vec<(i64, i64)> {
        cuts.retain(|c| *c > 0 && *c < n);
        cuts.sort();
        cuts.dedup();
        let mut bounds = vec![0];
        bounds.extend(cuts);
        bounds.push(n);
        bounds.windows(2).map(|w| (w[0], w[1])).collect()
    }

    proptest! {
        /// Mixing K inputs delivered in arbitrary increments commits the same
        /// range and the same frames as mixing them in one shot.
        #[test]
        fn prop_incremental_equals_one_shot(
            n in 1i64..200,
            k in 1usize..4,
            cuts in proptest::collection::vec(proptest::collection::vec(0i64..200, 0..6), 4),
        ) {
            let rate = FrameRate::per_second(100);
            let mut one_shot = MixerEngine::new(SumKernel::default(), rate, k);
            let whole = one_shot
                .commit(&rp(1), (0..k).map(|_| chunk(0, n)).collect())
                .unwrap();
            let expected = values(whole.output.as_ref().unwrap());

            let per_input: Vec<Vec<(i64, i64)>> =
                (0..k).map(|i| chunks(n, cuts[i].clone())).collect();
            let rounds = per_input.iter().map(Vec::len).max().unwrap();

            let mut incremental = MixerEngine::new(SumKernel::default(), rate, k);
            let mut collected = Vec::new();
            let mut covered = None::<Range<i64>>;
            for round in 0..rounds {
                let args = per_input
                    .iter()
                    .map(|c| {
                        // inputs with fewer chunks report their end position
                        let (s, e) = c.get(round).copied().unwrap_or((n, n));
                        chunk(s, e)
                    })
                    .collect();
                let out = incremental.commit(&rp(round as u64 + 1), args).unwrap();
                if let Some(sample) = out.output {
                    collected.extend(values(&sample));
                    covered = Some(match covered {
                        Some(c) => c.start..out.window.end,
                        None => out.window.clone(),
                    });
                }
            }
            prop_assert_eq!(covered, Some(0..n));
            prop_assert_eq!(collected, expected);
        }
    }
}
