//! Diphone concatenation by pitch-synchronous overlap-add.
//!
//! Two units are live at any time: `prev`, the diphone being synthesized,
//! and `cur`, the next one, already bound so the boundary between them can
//! be smoothed. Each new phone shifts the pair by one.

use std::rc::Rc;

use super::audio::AudioSink;
use super::config::MbrolaInferenceParams;
use super::database::Database;
use super::model::{MbrolaError, MbrolaResult};
use super::parser::{PhoneEvent, PhoneSource};
use super::phone::Phone;
use super::pitch_marks::FrameType;
use super::unit::DiphoneUnit;

/// Most pulses one diphone may generate.
pub const MAX_PULSES: usize = 2000;

/// Output samples are clipped to this magnitude.
pub const CLIP_LEVEL: f32 = 32765.0;

/// Longest run of frames blended at a diphone boundary.
const MAX_SMOOTH_FRAMES: usize = 6;

/// Boundary smoothing width before the first concatenation.
const INITIAL_SMOOTH_END: usize = 1000;

/// Outcome of advancing to the next diphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiphoneState {
    Ok,
    Flush,
    Eof,
}

/// One synthesis pulse: the physical frame it plays and where it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Physical analysis frame, 1-based.
    pub frame: usize,
    /// Sample position from the start of the diphone.
    pub position: i32,
}

/// Running counters, reset only on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    pub diphones: u64,
    pub missing_diphones: u64,
    pub saturated_flushes: u64,
    pub samples: u64,
}

/// Hanning window of `size` points scaled by `volume`.
pub fn hanning(size: usize, volume: f32) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let phase = i as f64 * 2.0 * std::f64::consts::PI / size as f64;
            (volume as f64 * 0.5 * (1.0 - phase.cos())) as f32
        })
        .collect()
}

/// The synthesis engine bound to one database handle.
#[derive(Debug)]
pub struct Synthesizer<'a> {
    database: Database<'a>,
    period: usize,
    prev: DiphoneUnit<'a>,
    cur: DiphoneUnit<'a>,
    pulses: Vec<Pulse>,
    weight: Vec<f32>,
    /// Overlap-add accumulator, two periods wide.
    accumulator: Vec<f32>,
    /// Finalized samples of the last flush.
    flushed: Vec<i16>,
    flushed_len: usize,
    /// Flushed samples already handed to the caller.
    eaten: usize,
    /// Silence owed after the flushed samples.
    zero_padding: usize,
    silence: Vec<i16>,
    frame_counter: usize,
    first_call: bool,
    odd: bool,
    smooth_begin: usize,
    smooth_end: usize,
    /// Samples the previous diphone fell short of its target.
    time_crumb: i32,
    volume: f32,
    voice_freq: u32,
    voice_ratio: f32,
    smoothing: bool,
    tolerant: bool,
    stats: SynthesisStats,
}

impl<'a> Synthesizer<'a> {
    pub fn new(database: Database<'a>) -> Self {
        let period = database.period() as usize;
        let capacity = database.max_samples();
        let voice_freq = database.sample_rate();
        Self {
            period,
            prev: DiphoneUnit::new(capacity, period),
            cur: DiphoneUnit::new(capacity, period),
            pulses: Vec::with_capacity(MAX_PULSES),
            weight: hanning(2 * period, 1.0),
            accumulator: vec![0.0; 2 * period],
            flushed: vec![0; 2 * period],
            flushed_len: 0,
            eaten: 0,
            zero_padding: 0,
            silence: vec![0; 2 * period],
            frame_counter: 1,
            first_call: true,
            odd: false,
            smooth_begin: 0,
            smooth_end: INITIAL_SMOOTH_END,
            time_crumb: 0,
            volume: 1.0,
            voice_freq,
            voice_ratio: 1.0,
            smoothing: true,
            tolerant: false,
            stats: SynthesisStats::default(),
            database,
        }
    }

    pub fn database(&self) -> &Database<'a> {
        &self.database
    }

    pub fn stats(&self) -> SynthesisStats {
        self.stats
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.weight = hanning(2 * self.period, volume);
    }

    /// Output sample rate in Hz.
    pub fn voice_freq(&self) -> u32 {
        self.voice_freq
    }

    /// Play the voice at `freq` Hz. Durations and pitch stay in absolute
    /// terms, so the vocal tract appears scaled.
    pub fn set_voice_freq(&mut self, freq: u32) {
        self.voice_freq = freq;
        self.voice_ratio = freq as f32 / self.database.sample_rate() as f32;
    }

    pub fn smoothing(&self) -> bool {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: bool) {
        self.smoothing = smoothing;
    }

    pub fn tolerant(&self) -> bool {
        self.tolerant
    }

    /// Replace unknown diphones with silence instead of failing.
    pub fn set_tolerant(&mut self, tolerant: bool) {
        self.tolerant = tolerant;
    }

    pub fn apply_params(&mut self, params: &MbrolaInferenceParams) {
        self.set_volume(params.volume);
        self.set_voice_freq(params.voice_freq.unwrap_or(self.database.sample_rate()));
        self.set_smoothing(params.smoothing);
        self.set_tolerant(params.tolerant);
    }

    /// Pulses of the diphone last matched to its prosody, index 0 included.
    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses
    }

    /// Start a new utterance: silence on both sides, empty accumulator.
    pub fn reset(&mut self) -> MbrolaResult<()> {
        let silence_name = self.database.silence().to_string();
        let entry = self
            .database
            .find(&silence_name, &silence_name)
            .ok_or_else(|| MbrolaError::NoSilence(silence_name.clone()))?;
        let silence = Rc::new(Phone::new(&silence_name, 0.0));

        self.prev.left = None;
        self.prev.right = None;
        self.cur.bind(&mut self.database, entry)?;
        self.cur.set_phones(Rc::clone(&silence), silence);
        self.cur.length1 = 0;
        self.cur.length2 = 0;
        self.cur.smooth = false;
        // the leading silence-silence unit is never played
        self.cur.pulse_count = 1;

        self.accumulator.fill(0.0);
        self.flushed_len = 0;
        self.eaten = 0;
        self.zero_padding = 0;
        self.frame_counter = 1;
        self.first_call = true;
        self.odd = false;
        self.smooth_begin = 0;
        self.smooth_end = INITIAL_SMOOTH_END;
        self.time_crumb = 0;
        Ok(())
    }

    /// Make the next [`read`](Self::read) start a fresh utterance.
    pub fn restart(&mut self) {
        self.first_call = true;
    }

    /// Pull one phone and shift the unit pair.
    pub fn next_diphone(&mut self, source: &mut dyn PhoneSource) -> MbrolaResult<DiphoneState> {
        let mut phone = match source.next_phone()? {
            PhoneEvent::Phone(phone) => phone,
            PhoneEvent::Flush => return Ok(DiphoneState::Flush),
            PhoneEvent::Eof => return Ok(DiphoneState::Eof),
        };
        phone.apply_ratio(self.voice_ratio);

        self.prev.left = None;
        std::mem::swap(&mut self.prev, &mut self.cur);
        let left = match self.prev.right.clone() {
            Some(left) => left,
            None => Rc::new(Phone::new(self.database.silence(), 0.0)),
        };
        let right = Rc::new(phone);

        let entry = match self.database.find(&left.name, &right.name) {
            Some(entry) => entry,
            None if self.tolerant => {
                log::warn!("{}-{} unknown, replaced with silence", left.name, right.name);
                self.stats.missing_diphones += 1;
                let silence = self.database.silence();
                self.database
                    .find(silence, silence)
                    .ok_or_else(|| MbrolaError::NoSilence(silence.to_string()))?
            }
            None => {
                return Err(MbrolaError::UnknownDiphone {
                    left: left.name.clone(),
                    right: right.name.clone(),
                })
            }
        };
        log::debug!("Diphone {}-{}", left.name, right.name);

        let wanted = left.duration;
        self.cur.set_phones(left, right);
        self.cur.bind(&mut self.database, entry)?;
        self.cur.smooth = false;
        self.cur.pulse_count = 0;

        let rate = self.database.sample_rate() as f32;
        let len_anal = self.prev.frame_count() as i32 * self.period as i32;
        let len_left = len_anal - self.prev.halfseg();
        let len_right = self.cur.halfseg();
        let total = len_left + len_right;
        self.prev.length2 = if total != 0 {
            (wanted * len_left as f32 * rate / 1000.0 / total as f32) as i32
        } else {
            0
        };
        self.cur.length1 = (wanted * rate / 1000.0 - self.prev.length2 as f32) as i32;

        self.stats.diphones += 1;
        Ok(DiphoneState::Ok)
    }

    /// Time-warp `prev` onto its target lengths and place its pulses.
    pub fn match_prosody(&mut self) -> MbrolaResult<()> {
        let rate = self.database.sample_rate();
        let period = self.period as i32;
        let per_ms = (rate / 1000).max(1) as f32;
        let marks = self.database.pitch_marks();
        let unit = &mut self.prev;

        let old_len1 = unit.length1;
        if old_len1 > 0 {
            unit.length1 += self.time_crumb;
            let new_len1 = unit.length1;
            if let Some(left) = unit.left_phone_mut() {
                // start of the part of the left phone this diphone plays
                let start = (left.duration - old_len1 as f32 / per_ms) as i32 as f32;
                for point in left.pitch.iter_mut().filter(|p| p.position > start) {
                    point.position =
                        start + (point.position - start) * new_len1 as f32 / old_len1 as f32;
                }
            }
        }

        let frame_count = unit.frame_count();
        let halfseg = unit.halfseg();
        let len_anal = frame_count as i32 * period;
        let theta1 = if halfseg != 0 {
            unit.length1 as f32 / halfseg as f32
        } else {
            0.0
        };
        let (theta2, beta) = if len_anal - halfseg != 0 {
            let theta2 = unit.length2 as f32 / (len_anal - halfseg) as f32;
            (theta2, unit.length1 as f32 - theta2 * halfseg as f32)
        } else {
            (0.0, 0.0)
        };

        self.pulses.clear();
        self.pulses.push(Pulse {
            frame: 1,
            position: 0,
        });
        let step = |unit: &DiphoneUnit<'_>, frame: usize, at: i32| {
            if unit.frame_type(marks, frame).is_voiced() {
                unit.pitch_period(at, rate)
            } else {
                period
            }
        };

        let mut cur_sample = step(&*unit, 1, 0);
        let mut t = period;
        for frame in 1..=frame_count {
            let limit = if t <= halfseg {
                (t as f32 * theta1) as i32
            } else {
                (t as f32 * theta2 + beta) as i32
            };
            while cur_sample <= limit {
                self.pulses.push(Pulse {
                    frame,
                    position: cur_sample,
                });
                cur_sample += step(&*unit, frame, cur_sample);
                if self.pulses.len() >= MAX_PULSES {
                    let (left, right) = unit_names(&*unit);
                    return Err(MbrolaError::PitchDegenerate { left, right });
                }
            }
            t += period;
        }

        unit.pulse_count = self.pulses.len() - 1;
        let last = self.pulses.last().map_or(0, |p| p.position);
        self.time_crumb += old_len1 + unit.length2 - last;
        Ok(())
    }

    /// Decide how the boundary between `prev` and `cur` is smoothed.
    pub fn concat(&mut self) {
        let rate = self.database.sample_rate();
        let period = self.period;
        let marks = self.database.pitch_marks();
        let prev = &self.prev;
        let cur = &mut self.cur;
        let pulses = &self.pulses;
        let frame_at = |k: usize| pulses.get(k).map_or(0, |p| p.frame);

        let first = if cur.length1 != 0 && cur.halfseg() != 0 {
            let theta = cur.length1 as f64 / cur.halfseg() as f64;
            let first = (cur.pitch_period(0, rate) as f64 / period as f64 / theta).ceil();
            if first.is_finite() && first > 0.0 {
                first as usize
            } else {
                0
            }
        } else {
            0
        };
        let first = first.min(cur.frame_count());
        let last = frame_at(prev.pulse_count);

        if first != 0
            && prev.frame_type(marks, last).is_voiced()
            && cur.frame_type(marks, first).is_voiced()
        {
            cur.smooth = true;
            let left_start = prev.frame_start(last, period);
            let right_start = cur.frame_start(first, period);
            for i in 0..2 * period {
                let j = i % period;
                let difference = prev.sample(left_start + j) - cur.sample(right_start + j);
                cur.smoothing[i] = (difference * self.weight[i]).trunc();
            }
        } else {
            cur.smooth = false;
        }

        let limit_frame = (prev.halfseg() / period as i32).max(0) as usize;
        let max_concat =
            ((0.5 * prev.pulse_count as f32 + 1.0) as usize).min(MAX_SMOOTH_FRAMES);
        let type_at = |k: usize| prev.frame_type(marks, frame_at(k));

        let mut begin = 1;
        while type_at(begin) == FrameType::VoicedStable
            && frame_at(begin) <= limit_frame
            && begin < max_concat
        {
            begin += 1;
        }
        if begin > 1
            && type_at(begin) == FrameType::VoicedTransient
            && frame_at(begin) <= limit_frame
            && begin < max_concat
        {
            begin += 1;
        }
        self.smooth_begin = (begin - 1).min(self.smooth_end);

        let mut end = 1;
        let c = prev.pulse_count + 1;
        while type_at(c - end) == FrameType::VoicedStable
            && frame_at(c - end) > limit_frame
            && end < max_concat
        {
            end += 1;
        }
        if end > 1
            && type_at(c - end) == FrameType::VoicedTransient
            && frame_at(c - end) > limit_frame
            && end < max_concat
        {
            end += 1;
        }
        self.smooth_end = end - 1;
        if cur.frame_type(marks, 1) != FrameType::VoicedStable {
            self.smooth_end = 0;
        }
    }

    /// Finalize `shift` samples of the accumulator and schedule `shift_zero`
    /// samples of silence after them.
    fn flush(&mut self, shift: usize, shift_zero: usize) {
        let mut saturated = false;
        for (out, &value) in self.flushed[..shift].iter_mut().zip(&self.accumulator) {
            *out = if value > CLIP_LEVEL {
                saturated = true;
                CLIP_LEVEL as i16
            } else if value < -CLIP_LEVEL {
                saturated = true;
                -CLIP_LEVEL as i16
            } else {
                value as i16
            };
        }
        self.flushed_len = shift;
        self.eaten = 0;
        self.zero_padding = shift_zero;

        if saturated {
            let (left, right) = unit_names(&self.prev);
            log::warn!("Saturation on {left}-{right}");
            self.stats.saturated_flushes += 1;
        }
    }

    /// Flush the span before pulse `frame` and add its grain.
    pub fn overlap_add(&mut self, frame: usize) {
        let period = self.period;
        let window = 2 * period;
        let (Some(pulse), Some(before)) = (self.pulses.get(frame), self.pulses.get(frame - 1))
        else {
            return;
        };
        let (pulse, before) = (*pulse, *before);

        let mut shift = (pulse.position - before.position).max(0) as usize;
        let correction = (shift as f32 / period as f32).min(1.0);
        let mut shift_zero = 0;
        if shift > window {
            shift_zero = shift - window;
            shift = window;
        }
        let end_window = window - shift;
        let add_window = self.prev.frame_start(pulse.frame, period);
        let lim_smooth = self.prev.pulse_count as isize - self.smooth_end as isize;

        self.flush(shift, shift_zero);
        self.accumulator.copy_within(shift..window, 0);
        self.accumulator[end_window..].fill(0.0);

        let marks = self.database.pitch_marks();
        let unit = &self.prev;
        let frame_type = unit.frame_type(marks, pulse.frame);

        if !frame_type.is_voiced() {
            if frame <= self.smooth_begin || frame as isize > lim_smooth {
                log::warn!("Unvoiced frame inside a smoothing window");
            }
            let reverse = self.odd && pulse.frame == before.frame;
            for k in 0..window {
                let index = if reverse {
                    add_window + window - 1 - k
                } else {
                    add_window + k
                };
                self.accumulator[k] += self.weight[k] * unit.sample(index) * correction;
            }
        } else {
            let left_smooth = frame <= self.smooth_begin && unit.smooth && self.smoothing;
            let right_smooth = !left_smooth
                && frame as isize > lim_smooth
                && self.cur.smooth
                && self.smoothing;
            let smooth_left = if left_smooth {
                (self.smooth_begin - frame + 1) as f32 / (2.0 * self.smooth_begin as f32)
            } else {
                0.0
            };
            let smooth_right = if right_smooth {
                (self.smooth_end as isize - (unit.pulse_count as isize - frame as isize)) as f32
                    / (2.0 * self.smooth_end as f32)
            } else {
                0.0
            };

            for k in 0..window {
                let index = if k < period {
                    add_window + k
                } else {
                    add_window + k - period
                };
                let mut grain = self.weight[k] * unit.sample(index);
                if left_smooth {
                    grain += smooth_left * unit.smoothing[k];
                } else if right_smooth {
                    grain -= smooth_right * self.cur.smoothing[k];
                }
                self.accumulator[k] += correction * grain;
            }
        }
        self.odd = !self.odd;
    }

    /// Synthesize every pulse of `prev` into `sink`.
    fn oneshot(&mut self, sink: &mut dyn AudioSink) -> MbrolaResult<()> {
        self.match_prosody()?;
        self.concat();
        for frame in 1..=self.prev.pulse_count {
            self.overlap_add(frame);
            sink.write_samples(&self.flushed[..self.flushed_len])?;
            self.stats.samples += self.flushed_len as u64;
            while self.zero_padding > 0 {
                let chunk = self.zero_padding.min(self.silence.len());
                sink.write_samples(&self.silence[..chunk])?;
                self.stats.samples += chunk as u64;
                self.zero_padding -= chunk;
            }
            self.flushed_len = 0;
        }
        Ok(())
    }

    /// Push driver: synthesize one utterance, up to the next flush or end of
    /// input, into `sink`.
    pub fn synthesize(
        &mut self,
        source: &mut dyn PhoneSource,
        sink: &mut dyn AudioSink,
    ) -> MbrolaResult<DiphoneState> {
        self.reset()?;
        match self.next_diphone(source)? {
            DiphoneState::Ok => {}
            state => return Ok(state),
        }
        loop {
            match self.next_diphone(source)? {
                DiphoneState::Ok => self.oneshot(sink)?,
                state => return Ok(state),
            }
        }
    }

    /// Run the push driver over every utterance until end of input. Returns
    /// the number of samples written.
    pub fn synthesize_all(
        &mut self,
        source: &mut dyn PhoneSource,
        sink: &mut dyn AudioSink,
    ) -> MbrolaResult<u64> {
        let before = self.stats.samples;
        while self.synthesize(source, sink)? != DiphoneState::Eof {}
        Ok(self.stats.samples - before)
    }

    /// Pull driver: fill `out` with the next samples.
    ///
    /// Returns fewer samples than requested only at a flush or at the end of
    /// the input. After a flush the next call starts a new utterance; after
    /// end of input it resumes where it stopped once more phones arrive.
    pub fn read(&mut self, source: &mut dyn PhoneSource, out: &mut [i16]) -> MbrolaResult<usize> {
        if self.first_call {
            self.reset()?;
            match self.next_diphone(source)? {
                DiphoneState::Ok => {}
                DiphoneState::Flush | DiphoneState::Eof => return Ok(0),
            }
            self.first_call = false;
        }

        let mut written = 0;
        while written < out.len() {
            let available = (self.flushed_len - self.eaten).min(out.len() - written);
            out[written..written + available]
                .copy_from_slice(&self.flushed[self.eaten..self.eaten + available]);
            self.eaten += available;
            written += available;

            let zeros = self.zero_padding.min(out.len() - written);
            out[written..written + zeros].fill(0);
            self.zero_padding -= zeros;
            written += zeros;

            if written == out.len() {
                break;
            }

            if self.frame_counter < self.prev.pulse_count {
                self.frame_counter += 1;
            } else {
                match self.next_diphone(source)? {
                    DiphoneState::Ok => {}
                    DiphoneState::Flush => {
                        self.first_call = true;
                        break;
                    }
                    DiphoneState::Eof => break,
                }
                self.match_prosody()?;
                self.concat();
                self.frame_counter = 1;
            }

            self.eaten = 0;
            self.flushed_len = 0;
            if self.frame_counter <= self.prev.pulse_count {
                self.overlap_add(self.frame_counter);
            }
        }
        self.stats.samples += written as u64;
        Ok(written)
    }
}

fn unit_names(unit: &DiphoneUnit<'_>) -> (String, String) {
    let name = |phone: Option<&Phone>| phone.map(|p| p.name.clone()).unwrap_or_default();
    (name(unit.left_phone()), name(unit.right_phone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mbrola::builder::{DatabaseBuilder, Segment};
    use crate::engines::mbrola::parser::{PhoParser, PhoneSequence};
    use pretty_assertions::assert_eq;

    const UV: FrameType = FrameType::UnvoicedStable;
    const V: FrameType = FrameType::VoicedStable;
    const VT: FrameType = FrameType::VoicedTransient;

    fn voice() -> Database<'static> {
        DatabaseBuilder::new(16000, 80)
            .segment(Segment::tone("_", "a", &[UV, UV, VT, V, V, V], 200))
            .segment(Segment::tone("a", "a", &[V, V, V, V, V, V], 240))
            .segment(Segment::tone("a", "_", &[V, V, V, VT, UV, UV], 240))
            .segment(Segment::tone("_", "_", &[UV, UV, UV], 120))
            .build()
            .unwrap()
    }

    fn flat(name: &str, duration: f32, hz: f32) -> Phone {
        Phone::with_pitch(name, duration, &[(0.0, hz), (100.0, hz)])
    }

    fn push(text: &str) -> Vec<i16> {
        let mut synth = Synthesizer::new(voice());
        let mut parser = PhoParser::document(16000.0 / 80.0);
        parser.feed(text);
        let mut out = Vec::new();
        synth.synthesize_all(&mut parser, &mut out).unwrap();
        out
    }

    fn pull(text: &str, chunk: usize) -> Vec<i16> {
        let mut synth = Synthesizer::new(voice());
        let mut parser = PhoParser::document(16000.0 / 80.0);
        parser.feed(text);
        let mut out = Vec::new();
        let mut buffer = vec![0i16; chunk];
        loop {
            let n = synth.read(&mut parser, &mut buffer).unwrap();
            out.extend_from_slice(&buffer[..n]);
            if n < chunk {
                break;
            }
        }
        out
    }

    #[test]
    fn hanning_window_peaks_at_the_volume() {
        let window = hanning(160, 2.0);
        assert_eq!(window[0], 0.0);
        assert!((window[80] - 2.0).abs() < 1e-6);
        assert!((window[40] - window[120]).abs() < 1e-5);
    }

    #[test]
    fn zero_length_silence_yields_no_samples() {
        let database = DatabaseBuilder::new(16000, 80)
            .segment(Segment::tone("_", "_", &[UV, UV], 80))
            .build()
            .unwrap();
        let mut synth = Synthesizer::new(database);
        let mut source = PhoneSequence::new(vec![flat("_", 0.0, 200.0)]);
        let mut out = [0i16; 256];
        assert_eq!(synth.read(&mut source, &mut out).unwrap(), 0);
    }

    #[test]
    fn push_output_matches_the_requested_duration() {
        let samples = push("_ 50\na 100\n");
        let expected = (50 + 100) * 16;
        assert!(
            (samples.len() as i64 - expected).abs() <= 80,
            "{} samples",
            samples.len()
        );
        assert!(samples.iter().any(|&s| s != 0));
    }

    #[test]
    fn pull_in_any_chunk_size_equals_push() {
        let text = "_ 40\na 120 0 120 50 180 100 90\na 80\n_ 30\n";
        let pushed = push(text);
        assert!(!pushed.is_empty());
        for chunk in [1, 37, 160, 4096] {
            assert_eq!(pull(text, chunk), pushed, "chunk {chunk}");
        }
    }

    #[test]
    fn pulses_increase_and_respect_the_cap() {
        let mut synth = Synthesizer::new(voice());
        synth.reset().unwrap();
        let mut source = PhoneSequence::new(vec![
            flat("_", 0.0, 90.0),
            flat("a", 400.0, 90.0),
            flat("a", 400.0, 300.0),
            flat("_", 0.0, 300.0),
        ]);
        synth.next_diphone(&mut source).unwrap();
        for _ in 0..3 {
            assert_eq!(synth.next_diphone(&mut source).unwrap(), DiphoneState::Ok);
            synth.match_prosody().unwrap();
            let pulses = synth.pulses();
            assert!(pulses.len() <= MAX_PULSES);
            assert!(pulses.windows(2).all(|w| w[0].position < w[1].position));
            synth.concat();
        }
    }

    #[test]
    fn absurd_pitch_is_reported_as_degenerate() {
        let mut synth = Synthesizer::new(voice());
        let mut source = PhoneSequence::new(vec![
            flat("a", 0.0, 1e7),
            flat("a", 3000.0, 1e7),
            flat("a", 3000.0, 1e7),
        ]);
        let mut sink = Vec::new();
        let result = synth.synthesize(&mut source, &mut sink);
        assert!(matches!(result, Err(MbrolaError::PitchDegenerate { .. })));
    }

    #[test]
    fn unknown_diphone_fails_unless_tolerant() {
        let mut synth = Synthesizer::new(voice());
        let mut parser = PhoParser::document(200.0);
        parser.feed("_ 20\nz 50\n");
        let err = synth.synthesize_all(&mut parser, &mut Vec::new()).unwrap_err();
        assert_eq!(err.code(), -63);

        let mut synth = Synthesizer::new(voice());
        synth.set_tolerant(true);
        let mut parser = PhoParser::document(200.0);
        parser.feed("_ 20\nz 50\n");
        synth.synthesize_all(&mut parser, &mut Vec::new()).unwrap();
        assert!(synth.stats().missing_diphones >= 2);
    }

    #[test]
    fn zero_length_phones_do_not_read_out_of_bounds() {
        let samples = push("_ 0\na 0\na 0\n_ 0\n");
        assert!(samples.len() <= 2 * 80);
    }

    #[test]
    fn voice_frequency_scales_the_output_length() {
        let mut synth = Synthesizer::new(voice());
        synth.set_voice_freq(8000);
        let mut parser = PhoParser::document(200.0);
        parser.feed("_ 50\na 100\n");
        let mut out = Vec::new();
        synth.synthesize_all(&mut parser, &mut out).unwrap();
        let expected = 150 * 8;
        assert!((out.len() as i64 - expected).abs() <= 160, "{}", out.len());
    }

    #[test]
    fn loud_volume_saturates_without_wrapping() {
        let mut synth = Synthesizer::new(voice());
        synth.set_volume(50.0);
        let mut parser = PhoParser::document(200.0);
        parser.feed("_ 20\na 200\n_ 20\n");
        let mut out = Vec::new();
        synth.synthesize_all(&mut parser, &mut out).unwrap();
        assert!(synth.stats().saturated_flushes > 0);
        assert!(out.iter().all(|&s| (s as i32).abs() <= CLIP_LEVEL as i32));
    }

    #[test]
    fn missing_silence_is_fatal() {
        let database = DatabaseBuilder::new(16000, 80)
            .segment(Segment::tone("a", "b", &[V, V], 80))
            .build()
            .unwrap();
        let mut synth = Synthesizer::new(database);
        assert!(matches!(synth.reset(), Err(MbrolaError::NoSilence(_))));
    }
}
