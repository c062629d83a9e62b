//! Sample conversion and sound file writing.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use super::model::{MbrolaError, MbrolaResult};

/// Encoding of each output sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    Lin16,
    Lin8,
    Ulaw,
    Alaw,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Lin16 => 2,
            _ => 1,
        }
    }
}

/// Container written around the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    Raw,
    Wav,
    Au,
    Aiff,
}

impl FileType {
    /// Pick the container from the file extension; unknown means raw.
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("wav") => FileType::Wav,
            Some("au") => FileType::Au,
            Some("aif") | Some("aiff") => FileType::Aiff,
            _ => FileType::Raw,
        }
    }

    fn header_len(self) -> u64 {
        match self {
            FileType::Au => 28,
            FileType::Aiff => 54,
            FileType::Raw | FileType::Wav => 0,
        }
    }
}

/// Receiver of synthesized 16-bit samples.
pub trait AudioSink {
    fn write_samples(&mut self, samples: &[i16]) -> MbrolaResult<()>;
}

impl AudioSink for Vec<i16> {
    fn write_samples(&mut self, samples: &[i16]) -> MbrolaResult<()> {
        self.extend_from_slice(samples);
        Ok(())
    }
}

/// Unsigned 8-bit linear.
pub fn linear_to_lin8(sample: i16) -> u8 {
    (128 + (sample as i32 >> 8)) as u8
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
const ULAW_SEGMENTS: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];
const ALAW_SEGMENTS: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

fn segment(value: i32, ends: &[i32; 8]) -> usize {
    ends.iter().position(|&end| value <= end).unwrap_or(8)
}

/// G.711 µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let mask = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let seg = segment(pcm, &ULAW_SEGMENTS);
    let code = if seg >= 8 {
        0x7F
    } else {
        ((seg as i32) << 4) | ((pcm >> (seg + 3)) & 0xF)
    };
    (code ^ mask) as u8
}

/// G.711 A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = sample as i32 >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &ALAW_SEGMENTS);
    let code = if seg >= 8 {
        0x7F
    } else {
        let shift = if seg < 2 { 1 } else { seg };
        ((seg as i32) << 4) | ((pcm >> shift) & 0xF)
    };
    (code ^ mask) as u8
}

/// IEEE 754 80-bit extended encoding of an integer sample rate.
fn extended_rate(rate: u32) -> [u8; 10] {
    let mut bytes = [0u8; 10];
    if rate == 0 {
        return bytes;
    }
    let shift = 31 - rate.leading_zeros();
    let exponent = 16383 + shift as u16;
    let mantissa = (rate as u64) << (63 - shift);
    bytes[..2].copy_from_slice(&exponent.to_be_bytes());
    bytes[2..].copy_from_slice(&mantissa.to_be_bytes());
    bytes
}

enum Output<W: Write + Seek> {
    Wav(hound::WavWriter<W>),
    Plain(W),
}

/// Writes samples to a sound file, patching the header on finalize.
pub struct AudioWriter<W: Write + Seek> {
    output: Output<W>,
    format: SampleFormat,
    file_type: FileType,
    sample_rate: u32,
    samples: u64,
    scratch: Vec<u8>,
}

impl AudioWriter<BufWriter<File>> {
    /// Create `path`, choosing the container from its extension.
    pub fn create(path: &Path, format: SampleFormat, sample_rate: u32) -> MbrolaResult<Self> {
        let file = BufWriter::new(File::create(path)?);
        Self::new(file, FileType::from_path(path), format, sample_rate)
    }
}

impl<W: Write + Seek> AudioWriter<W> {
    pub fn new(
        mut writer: W,
        file_type: FileType,
        format: SampleFormat,
        sample_rate: u32,
    ) -> MbrolaResult<Self> {
        let unsupported = |what: &str| {
            MbrolaError::InvalidConfig(format!("{format:?} samples cannot be stored in {what}"))
        };
        let output = match file_type {
            FileType::Wav => {
                let bits_per_sample = match format {
                    SampleFormat::Lin16 => 16,
                    SampleFormat::Lin8 => 8,
                    _ => return Err(unsupported("WAV")),
                };
                let spec = hound::WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample,
                    sample_format: hound::SampleFormat::Int,
                };
                Output::Wav(hound::WavWriter::new(writer, spec)?)
            }
            FileType::Aiff if matches!(format, SampleFormat::Ulaw | SampleFormat::Alaw) => {
                return Err(unsupported("AIFF"));
            }
            FileType::Au | FileType::Aiff => {
                write_header(&mut writer, file_type, format, sample_rate, None)?;
                Output::Plain(writer)
            }
            FileType::Raw => Output::Plain(writer),
        };

        Ok(Self {
            output,
            format,
            file_type,
            sample_rate,
            samples: 0,
            scratch: Vec::new(),
        })
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    /// Complete the header with the final sample count.
    pub fn finalize(self) -> MbrolaResult<()> {
        match self.output {
            Output::Wav(writer) => writer.finalize()?,
            Output::Plain(mut writer) => {
                if self.file_type.header_len() > 0 {
                    writer.seek(SeekFrom::Start(0))?;
                    write_header(
                        &mut writer,
                        self.file_type,
                        self.format,
                        self.sample_rate,
                        Some(self.samples),
                    )?;
                    writer.seek(SeekFrom::End(0))?;
                }
                writer.flush()?;
            }
        }
        Ok(())
    }
}

impl<W: Write + Seek> AudioSink for AudioWriter<W> {
    fn write_samples(&mut self, samples: &[i16]) -> MbrolaResult<()> {
        self.samples += samples.len() as u64;
        let writer = match &mut self.output {
            Output::Wav(writer) => {
                for &sample in samples {
                    match self.format {
                        SampleFormat::Lin8 => writer.write_sample((sample >> 8) as i8)?,
                        _ => writer.write_sample(sample)?,
                    }
                }
                return Ok(());
            }
            Output::Plain(writer) => writer,
        };

        let big_endian = self.file_type != FileType::Raw;
        self.scratch.clear();
        for &sample in samples {
            match self.format {
                SampleFormat::Lin16 if big_endian => {
                    self.scratch.write_i16::<BigEndian>(sample)?
                }
                SampleFormat::Lin16 => self.scratch.write_i16::<LittleEndian>(sample)?,
                // AU and AIFF store signed 8-bit samples
                SampleFormat::Lin8 if big_endian => self.scratch.push((sample >> 8) as u8),
                SampleFormat::Lin8 => self.scratch.push(linear_to_lin8(sample)),
                SampleFormat::Ulaw => self.scratch.push(linear_to_ulaw(sample)),
                SampleFormat::Alaw => self.scratch.push(linear_to_alaw(sample)),
            }
        }
        writer.write_all(&self.scratch)?;
        Ok(())
    }
}

fn write_header<W: Write>(
    writer: &mut W,
    file_type: FileType,
    format: SampleFormat,
    sample_rate: u32,
    samples: Option<u64>,
) -> MbrolaResult<()> {
    let data_len = samples.map(|n| n * format.bytes_per_sample() as u64);
    match file_type {
        FileType::Au => {
            let encoding = match format {
                SampleFormat::Ulaw => 1,
                SampleFormat::Lin8 => 2,
                SampleFormat::Lin16 => 3,
                SampleFormat::Alaw => 27,
            };
            writer.write_all(b".snd")?;
            writer.write_u32::<BigEndian>(FileType::Au.header_len() as u32)?;
            // all ones means unknown size
            writer.write_u32::<BigEndian>(data_len.map_or(u32::MAX, |n| n as u32))?;
            writer.write_u32::<BigEndian>(encoding)?;
            writer.write_u32::<BigEndian>(sample_rate)?;
            writer.write_u32::<BigEndian>(1)?;
            writer.write_all(b"MBRP")?;
        }
        FileType::Aiff => {
            let data_len = data_len.unwrap_or(0) as u32;
            let bits = 8 * format.bytes_per_sample() as u16;
            writer.write_all(b"FORM")?;
            writer.write_u32::<BigEndian>(data_len + 46)?;
            writer.write_all(b"AIFF")?;
            writer.write_all(b"COMM")?;
            writer.write_u32::<BigEndian>(18)?;
            writer.write_u16::<BigEndian>(1)?;
            writer.write_u32::<BigEndian>(samples.unwrap_or(0) as u32)?;
            writer.write_u16::<BigEndian>(bits)?;
            writer.write_all(&extended_rate(sample_rate))?;
            writer.write_all(b"SSND")?;
            writer.write_u32::<BigEndian>(data_len + 8)?;
            writer.write_u32::<BigEndian>(0)?;
            writer.write_u32::<BigEndian>(0)?;
        }
        FileType::Raw | FileType::Wav => {}
    }
    Ok(())
}
