//! Programmatic construction of diphone databases.
//!
//! Used to produce small synthetic voices, mostly for tests and tooling.
//! The builder writes the same binary layout [`Database`] reads.

use byteorder::{LittleEndian, WriteBytesExt};

use super::database::{fixed_bytes, to_i16, to_i32, write_zstring, Database, InfoString};
use super::model::MbrolaError;
use super::pitch_marks::{FrameType, PitchMarks};
use super::unit::FrameMap;

const TONE_AMPLITUDE: f32 = 8000.0;
const NOISE_AMPLITUDE: i32 = 2000;

/// One recorded diphone.
#[derive(Debug, Clone)]
pub struct Segment {
    pub left: String,
    pub right: String,
    pub frames: Vec<FrameType>,
    pub halfseg: i32,
    /// Recorded samples. Generated from the frame types when absent.
    pub samples: Option<Vec<i16>>,
}

impl Segment {
    pub fn new(
        left: &str,
        right: &str,
        frames: &[FrameType],
        halfseg: i32,
        samples: Vec<i16>,
    ) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
            frames: frames.to_vec(),
            halfseg,
            samples: Some(samples),
        }
    }

    /// Segment whose waveform is a tone on voiced frames and noise elsewhere.
    pub fn tone(left: &str, right: &str, frames: &[FrameType], halfseg: i32) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
            frames: frames.to_vec(),
            halfseg,
            samples: None,
        }
    }

    /// Frames of audio the synthesizer reads for this segment.
    pub fn wave_frames(&self) -> usize {
        FrameMap::build(self.frames.len(), |i| self.frames[i - 1]).total_frames()
    }

    fn render(&self, period: usize, seed: &mut u32) -> Vec<i16> {
        let len = self.wave_frames() * period;
        if let Some(samples) = &self.samples {
            let mut samples = samples.clone();
            samples.resize(len, 0);
            return samples;
        }

        (0..len)
            .map(|n| {
                let frame = (n / period).min(self.frames.len().saturating_sub(1));
                let voiced = self.frames.get(frame).is_some_and(|ty| ty.is_voiced());
                if voiced {
                    let phase = (n % period) as f32 / period as f32;
                    (TONE_AMPLITUDE * (std::f32::consts::TAU * phase).sin()) as i16
                } else {
                    *seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                    (((*seed >> 16) as i32 % (2 * NOISE_AMPLITUDE)) - NOISE_AMPLITUDE) as i16
                }
            })
            .collect()
    }
}

/// Builder for database images.
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    sample_rate: u32,
    period: u16,
    version: Option<String>,
    short_mark_field: bool,
    legacy: bool,
    segments: Vec<Segment>,
    replacements: Vec<((String, String), (String, String))>,
    info: Vec<InfoString>,
}

impl DatabaseBuilder {
    pub fn new(sample_rate: u32, period: u16) -> Self {
        Self {
            sample_rate,
            period,
            version: None,
            short_mark_field: false,
            legacy: false,
            segments: Vec::new(),
            replacements: Vec::new(),
            info: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Store the pitch-mark size in the 16-bit field instead of the 32-bit one.
    pub fn short_mark_field(mut self, short: bool) -> Self {
        self.short_mark_field = short;
        self
    }

    /// Emit the pre-2.05 fixed-record layout.
    pub fn legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    /// Append a recorded segment. The last segment should be silence-silence.
    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn replacement(mut self, source: (&str, &str), target: (&str, &str)) -> Self {
        self.replacements.push((
            (source.0.to_string(), source.1.to_string()),
            (target.0.to_string(), target.1.to_string()),
        ));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.info.push(InfoString::from(text));
        self
    }

    pub fn hidden_info(mut self, text: &str) -> Self {
        self.info.push(InfoString::hidden(text));
        self
    }

    /// Serialize to the binary database layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MbrolaError> {
        let period = self.period as usize;
        let mut seed = 0x5eed_u32;
        let mut frame_types = Vec::new();
        let mut waves = Vec::new();
        for segment in &self.segments {
            frame_types.extend_from_slice(&segment.frames);
            waves.extend(segment.render(period, &mut seed));
        }
        let marks = PitchMarks::pack(&frame_types);
        let version = match (&self.version, self.legacy) {
            (Some(version), _) => version.as_str(),
            (None, true) => "2.040",
            (None, false) => "2.060",
        };

        let mut out = Vec::new();
        out.extend_from_slice(b"MBROLA");
        out.extend_from_slice(&fixed_bytes(version, 5));
        out.write_i16::<LittleEndian>(to_i16(
            self.segments.len() + self.replacements.len(),
            "diphone count",
        )?)?;
        match u16::try_from(frame_types.len()) {
            Ok(size) if (self.short_mark_field || self.legacy) && size != 0 => {
                out.write_u16::<LittleEndian>(size)?;
            }
            _ => {
                out.write_u16::<LittleEndian>(0)?;
                out.write_i32::<LittleEndian>(to_i32(frame_types.len(), "mark size")?)?;
            }
        }
        out.write_i32::<LittleEndian>(to_i32(2 * waves.len(), "wave size")?)?;
        out.write_i16::<LittleEndian>(to_i16(self.sample_rate as usize, "sample rate")?)?;
        out.write_u8(self.period as u8)?;
        out.write_u8(if self.legacy { 0 } else { 1 })?;

        for segment in &self.segments {
            let wave_frames = u8::try_from(segment.wave_frames())
                .map_err(|_| MbrolaError::Format("segment too long".to_string()))?;
            if self.legacy {
                out.extend_from_slice(&short_field(&segment.left)?);
                out.extend_from_slice(&short_field(&segment.right)?);
            } else {
                write_zstring(&mut out, segment.left.as_bytes())?;
                write_zstring(&mut out, segment.right.as_bytes())?;
            }
            out.write_i16::<LittleEndian>(segment.halfseg as i16)?;
            out.write_u8(segment.frames.len() as u8)?;
            out.write_u8(wave_frames)?;
        }
        for (source, target) in &self.replacements {
            if self.legacy {
                for name in [&target.0, &target.1, &source.0, &source.1] {
                    out.extend_from_slice(&short_field(name)?);
                }
            } else {
                for name in [&source.0, &source.1, &target.0, &target.1] {
                    write_zstring(&mut out, name.as_bytes())?;
                }
            }
        }

        out.extend_from_slice(marks.as_bytes());
        for sample in waves {
            out.write_i16::<LittleEndian>(sample)?;
        }
        for info in &self.info {
            write_zstring(&mut out, info.as_bytes())?;
        }
        Ok(out)
    }

    /// Serialize and load the result with in-memory waves.
    pub fn build(&self) -> Result<Database<'static>, MbrolaError> {
        Database::from_bytes("synthetic", &self.to_bytes()?)
    }
}

fn short_field(name: &str) -> Result<[u8; 2], MbrolaError> {
    let bytes = name.as_bytes();
    if bytes.len() > 2 {
        return Err(MbrolaError::Format(format!(
            "phoneme {name} is too long for the legacy layout"
        )));
    }
    let mut field = [0u8; 2];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wave_frames_include_onset_and_tail_frames() {
        let uv = FrameType::UnvoicedStable;
        let v = FrameType::VoicedStable;
        assert_eq!(Segment::tone("a", "b", &[v, v, v], 0).wave_frames(), 3);
        assert_eq!(Segment::tone("a", "b", &[uv, uv], 0).wave_frames(), 3);
        assert_eq!(Segment::tone("a", "b", &[uv, v], 0).wave_frames(), 3);
        assert_eq!(Segment::tone("a", "b", &[], 0).wave_frames(), 0);
    }

    #[test]
    fn explicit_samples_are_padded_to_the_recorded_length() {
        let segment = Segment::new("a", "b", &[FrameType::VoicedStable; 2], 10, vec![1, 2, 3]);
        let samples = segment.render(10, &mut 0);
        assert_eq!(samples.len(), 20);
        assert_eq!(&samples[..4], &[1, 2, 3, 0]);
    }

    #[test]
    fn legacy_layout_refuses_long_names() {
        let result = DatabaseBuilder::new(16000, 80)
            .legacy(true)
            .segment(Segment::tone("long", "_", &[FrameType::UnvoicedStable], 40))
            .to_bytes();
        assert!(matches!(result, Err(MbrolaError::Format(_))));
    }
}
