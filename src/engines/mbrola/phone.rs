use std::rc::Rc;

/// A pitch target inside a phone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchPoint {
    /// Milliseconds from the start of the phone.
    pub position: f32,
    /// Fundamental frequency in Hz.
    pub frequency: f32,
}

/// One phonetic unit with its duration and pitch contour.
///
/// Phones reaching the synthesizer carry a pitch point at 0% and at 100% of
/// their duration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Phone {
    pub name: String,
    /// Duration in milliseconds.
    pub duration: f32,
    pub pitch: Vec<PitchPoint>,
}

/// The boundary phone is referenced by two diphone units at once.
pub type SharedPhone = Rc<Phone>;

impl Phone {
    pub fn new(name: &str, duration: f32) -> Self {
        Self {
            name: name.to_string(),
            duration,
            pitch: Vec::new(),
        }
    }

    /// Build a phone from `(percent, hz)` pitch targets.
    pub fn with_pitch(name: &str, duration: f32, targets: &[(f32, f32)]) -> Self {
        let mut phone = Self::new(name, duration);
        for &(percent, frequency) in targets {
            phone.push_pitch_percent(percent, frequency);
        }
        phone
    }

    pub fn push_pitch(&mut self, position: f32, frequency: f32) {
        self.pitch.push(PitchPoint {
            position,
            frequency,
        });
    }

    /// Add a pitch point at `percent` of the duration.
    pub fn push_pitch_percent(&mut self, percent: f32, frequency: f32) {
        self.push_pitch(percent * self.duration / 100.0, frequency);
    }

    pub fn first_pitch(&self) -> Option<&PitchPoint> {
        self.pitch.first()
    }

    pub fn last_pitch(&self) -> Option<&PitchPoint> {
        self.pitch.last()
    }

    /// Frequency of the last pitch point, 0 when the contour is empty.
    pub fn tail_frequency(&self) -> f32 {
        self.last_pitch().map_or(0.0, |p| p.frequency)
    }

    /// Frequency at `time` ms, interpolated linearly between the bracketing
    /// points and held flat past the last one.
    pub fn frequency_at(&self, time: f32) -> f32 {
        let after = self.pitch.iter().position(|p| time < p.position);
        match after {
            None => self.tail_frequency(),
            Some(0) => self.pitch[0].frequency,
            Some(i) => {
                let a = self.pitch[i - 1];
                let b = self.pitch[i];
                let span = b.position - a.position;
                if span <= 0.0 {
                    return b.frequency;
                }
                a.frequency + (b.frequency - a.frequency) * (time - a.position) / span
            }
        }
    }

    /// Resample the phone for a voice running at `ratio` times the database rate.
    ///
    /// The output keeps its duration and pitch in absolute terms, so positions
    /// stretch by the ratio while frequencies shrink by it.
    pub fn apply_ratio(&mut self, ratio: f32) {
        if ratio == 1.0 {
            return;
        }
        self.duration *= ratio;
        for point in &mut self.pitch {
            point.position *= ratio;
            point.frequency /= ratio;
        }
    }
}
