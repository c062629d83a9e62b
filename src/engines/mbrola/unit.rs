use std::rc::Rc;

use super::database::{Buffer, Database};
use super::diphone_index::DiphoneEntry;
use super::model::MbrolaError;
use super::phone::{Phone, SharedPhone};
use super::pitch_marks::{frame_type, FrameType, PitchMarkCursor, PitchMarks};

/// Longest pitch period the synthesizer will step by, in samples.
pub const MAX_PITCH_PERIOD: f32 = u16::MAX as f32;

/// Map from physical analysis frame (1-based) to recorded frame (1-based).
///
/// An unvoiced-to-voiced transition consumes one extra recorded frame, and
/// an unvoiced tail keeps one trailing frame for time-reversed playback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMap {
    real: Vec<usize>,
    total: usize,
}

impl FrameMap {
    pub fn build<F>(frame_count: usize, frame_type: F) -> Self
    where
        F: Fn(usize) -> FrameType,
    {
        let mut real = vec![1; frame_count + 1];
        let mut total = 1;
        let mut previous = FrameType::VoicedStable;

        for (i, slot) in real.iter_mut().enumerate().skip(1) {
            let current = frame_type(i);
            if !previous.is_voiced() && current.is_voiced() {
                total += 1;
            }
            *slot = total;
            previous = current;
            total += 1;
        }
        total -= 1;
        if !previous.is_voiced() {
            total += 1;
        }
        Self { real, total }
    }

    /// Recorded frame holding physical frame `frame`.
    pub fn real(&self, frame: usize) -> usize {
        self.real.get(frame).copied().unwrap_or(self.total.max(1))
    }

    /// Number of recorded frames the diphone occupies.
    pub fn total_frames(&self) -> usize {
        self.total
    }
}

/// Synthesis state of one diphone.
#[derive(Debug, Default)]
pub struct DiphoneUnit<'a> {
    pub(crate) descriptor: Option<DiphoneEntry>,
    pub(crate) left: Option<SharedPhone>,
    pub(crate) right: Option<SharedPhone>,
    /// Target samples for the left half.
    pub(crate) length1: i32,
    /// Target samples for the right half.
    pub(crate) length2: i32,
    pub(crate) cursor: PitchMarkCursor,
    pub(crate) frames: FrameMap,
    pub(crate) buffer: Buffer<'a>,
    /// Difference vector blended over the boundary with the next unit.
    pub(crate) smoothing: Vec<f32>,
    pub(crate) smooth: bool,
    /// Pulses generated by prosody matching.
    pub(crate) pulse_count: usize,
}

impl<'a> DiphoneUnit<'a> {
    pub fn new(capacity: usize, period: usize) -> Self {
        Self {
            buffer: Buffer::Owned(Vec::with_capacity(capacity)),
            smoothing: vec![0.0; 2 * period],
            ..Self::default()
        }
    }

    /// Attach `entry` and read its samples from the database.
    pub fn bind(
        &mut self,
        database: &mut Database<'a>,
        entry: DiphoneEntry,
    ) -> Result<(), MbrolaError> {
        self.descriptor = Some(entry);
        self.cursor = PitchMarkCursor::new(entry.pitch_mark_start);
        let marks = database.pitch_marks();
        let cursor = self.cursor;
        self.frames = FrameMap::build(entry.frame_count as usize, |i| {
            frame_type(marks, cursor, i)
        });

        let count = self.frames.total_frames() * database.period() as usize;
        database.load_samples(entry.wave_offset, count, &mut self.buffer)
    }

    /// Set the phones without touching the bound diphone.
    pub fn set_phones(&mut self, left: SharedPhone, right: SharedPhone) {
        self.left = Some(left);
        self.right = Some(right);
    }

    pub fn left_phone(&self) -> Option<&Phone> {
        self.left.as_deref()
    }

    pub fn right_phone(&self) -> Option<&Phone> {
        self.right.as_deref()
    }

    /// Mutable access to the left phone, copying it if the neighbour shares it.
    pub fn left_phone_mut(&mut self) -> Option<&mut Phone> {
        self.left.as_mut().map(Rc::make_mut)
    }

    pub fn descriptor(&self) -> Option<&DiphoneEntry> {
        self.descriptor.as_ref()
    }

    pub fn frame_count(&self) -> usize {
        self.descriptor.map_or(0, |d| d.frame_count as usize)
    }

    pub fn halfseg(&self) -> i32 {
        self.descriptor.map_or(0, |d| d.halfseg)
    }

    pub fn lengths(&self) -> (i32, i32) {
        (self.length1, self.length2)
    }

    pub fn pulse_count(&self) -> usize {
        self.pulse_count
    }

    /// Type of physical frame `index` (1-based).
    pub fn frame_type(&self, marks: &PitchMarks<'_>, index: usize) -> FrameType {
        if index == 0 || index > self.frame_count() {
            return FrameType::UnvoicedStable;
        }
        frame_type(marks, self.cursor, index)
    }

    /// First sample of the recorded frame behind physical frame `frame`.
    pub fn frame_start(&self, frame: usize, period: usize) -> usize {
        period * self.frames.real(frame).saturating_sub(1)
    }

    pub fn sample(&self, index: usize) -> f32 {
        self.buffer.sample(index) as f32
    }

    /// Pitch period in samples at `sample` within this diphone.
    ///
    /// Offsets before `length1` read the left phone's contour, counted back
    /// from its end; later offsets read the right phone's contour from its
    /// start.
    pub fn pitch_period(&self, sample: i32, sample_rate: u32) -> i32 {
        let (Some(left), Some(right)) = (self.left.as_deref(), self.right.as_deref()) else {
            return 1;
        };
        let rate = sample_rate as f32;
        // whole samples per millisecond, whole milliseconds before the split
        let per_ms = (sample_rate / 1000).max(1) as i32;
        let time = sample as f32 * 1000.0 / rate;
        let split = (self.length1 / per_ms) as f32;

        let frequency = if sample < self.length1 {
            let phone_time = time + left.duration - split;
            if phone_time >= left.duration {
                left.tail_frequency()
            } else {
                left.frequency_at(phone_time.max(0.0))
            }
        } else {
            right.frequency_at((time - split).max(0.0))
        };
        period_for(rate, frequency)
    }
}

/// `rate / frequency` in whole samples, kept within `1..=MAX_PITCH_PERIOD`.
pub fn period_for(rate: f32, frequency: f32) -> i32 {
    if !(frequency > 0.0) {
        return MAX_PITCH_PERIOD as i32;
    }
    (rate / frequency).clamp(1.0, MAX_PITCH_PERIOD) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mbrola::builder::{DatabaseBuilder, Segment};
    use pretty_assertions::assert_eq;

    const UV: FrameType = FrameType::UnvoicedStable;
    const UT: FrameType = FrameType::UnvoicedTransient;
    const V: FrameType = FrameType::VoicedStable;
    const VT: FrameType = FrameType::VoicedTransient;

    fn map_of(types: &[FrameType]) -> FrameMap {
        FrameMap::build(types.len(), |i| types[i - 1])
    }

    #[test]
    fn voicing_onset_skips_one_recorded_frame() {
        let map = map_of(&[UV, UT, V, VT]);
        let real: Vec<usize> = (1..=4).map(|i| map.real(i)).collect();
        assert_eq!(real, vec![1, 2, 4, 5]);
        assert_eq!(map.total_frames(), 5);
    }

    #[test]
    fn unvoiced_tail_gets_a_bonus_frame() {
        let map = map_of(&[V, V, UV]);
        assert_eq!((1..=3).map(|i| map.real(i)).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(map.total_frames(), 4);
    }

    #[test]
    fn empty_diphone_has_no_frames() {
        let map = map_of(&[]);
        assert_eq!(map.total_frames(), 0);
        assert_eq!(map.real(0), 1);
    }

    fn unit_with_phones(left: Phone, right: Phone, length1: i32) -> DiphoneUnit<'static> {
        let mut unit = DiphoneUnit::new(0, 80);
        unit.set_phones(Rc::new(left), Rc::new(right));
        unit.length1 = length1;
        unit
    }

    #[test]
    fn pitch_period_reads_the_left_phone_before_the_split() {
        let left = Phone::with_pitch("a", 100.0, &[(0.0, 100.0), (100.0, 200.0)]);
        let right = Phone::with_pitch("b", 100.0, &[(0.0, 100.0), (100.0, 100.0)]);
        // 50 ms of the left phone fall inside the diphone
        let unit = unit_with_phones(left, right, 800);
        assert_eq!(unit.pitch_period(0, 16000), (16000.0f32 / 150.0) as i32);
        assert_eq!(unit.pitch_period(800, 16000), 160);
    }

    #[test]
    fn split_point_is_counted_in_whole_milliseconds() {
        let left = Phone::with_pitch("a", 100.0, &[(0.0, 100.0), (100.0, 100.0)]);
        let right = Phone::with_pitch("b", 100.0, &[(0.0, 100.0), (1.0, 300.0), (100.0, 300.0)]);
        // 808 samples are 50.5 ms, counted as 50
        let unit = unit_with_phones(left, right, 808);
        assert_eq!(unit.pitch_period(808, 16000), 80);
    }

    #[test]
    fn pitch_period_holds_the_tail_frequency() {
        let left = Phone::with_pitch("a", 10.0, &[(0.0, 200.0), (100.0, 200.0)]);
        let right = Phone::with_pitch("b", 10.0, &[(0.0, 100.0), (100.0, 80.0)]);
        let unit = unit_with_phones(left, right, 0);
        assert_eq!(unit.pitch_period(16000, 16000), 200);
    }

    #[test]
    fn zero_frequency_gives_the_longest_period() {
        assert_eq!(period_for(16000.0, 0.0), MAX_PITCH_PERIOD as i32);
        assert_eq!(period_for(16000.0, 1e9), 1);
    }

    #[test]
    fn bind_reads_every_recorded_frame() {
        let mut database = DatabaseBuilder::new(16000, 80)
            .segment(Segment::tone("_", "a", &[UV, UV, V, V], 160))
            .segment(Segment::tone("_", "_", &[UV, UV], 80))
            .build()
            .unwrap();
        let entry = database.find("_", "a").unwrap();
        let mut unit = DiphoneUnit::new(database.max_samples(), 80);
        unit.bind(&mut database, entry).unwrap();
        assert_eq!(unit.frames.total_frames(), 5);
        assert_eq!(unit.buffer.len(), 5 * 80);
        assert_eq!(unit.frame_type(database.pitch_marks(), 3), V);
        assert_eq!(unit.frame_start(3, 80), 3 * 80);
    }
}
