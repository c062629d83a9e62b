use std::borrow::Cow;

/// Voicing class of one analysis frame, stored on two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    UnvoicedStable = 0,
    UnvoicedTransient = 1,
    VoicedStable = 2,
    VoicedTransient = 3,
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => FrameType::UnvoicedStable,
            1 => FrameType::UnvoicedTransient,
            2 => FrameType::VoicedStable,
            _ => FrameType::VoicedTransient,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn is_voiced(self) -> bool {
        matches!(self, FrameType::VoicedStable | FrameType::VoicedTransient)
    }
}

/// Start of one diphone inside the packed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PitchMarkCursor {
    /// Byte holding the diphone's first frame.
    pub byte: usize,
    /// Frame position (0..4) inside that byte.
    pub offset: u8,
}

impl PitchMarkCursor {
    pub fn new(pitch_mark_start: i32) -> Self {
        let start = pitch_mark_start.max(0) as usize;
        Self {
            byte: start / 4,
            offset: (start % 4) as u8,
        }
    }
}

/// Packed 2-bit frame types for every diphone of a database.
///
/// Frames are never unpacked eagerly; [`frame_type`] decodes one on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PitchMarks<'a> {
    bytes: Cow<'a, [u8]>,
    count: usize,
}

/// Bytes needed to hold `count` packed frames.
pub fn packed_len(count: usize) -> usize {
    count.div_ceil(4)
}

impl<'a> PitchMarks<'a> {
    pub fn from_bytes(bytes: impl Into<Cow<'a, [u8]>>, count: usize) -> Self {
        Self {
            bytes: bytes.into(),
            count,
        }
    }

    /// Pack a sequence of frame types, four per byte, low bits first.
    pub fn pack(types: &[FrameType]) -> PitchMarks<'static> {
        let mut bytes = vec![0u8; packed_len(types.len())];
        for (i, ty) in types.iter().enumerate() {
            bytes[i / 4] |= ty.bits() << (2 * (i % 4));
        }
        PitchMarks {
            bytes: Cow::Owned(bytes),
            count: types.len(),
        }
    }

    /// Number of frames in the stream.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Frame type at an absolute position in the stream.
    ///
    /// Positions past the end read as unvoiced stable.
    pub fn get(&self, position: usize) -> FrameType {
        let byte = self.bytes.get(position / 4).copied().unwrap_or(0);
        FrameType::from_bits(byte >> (2 * (position % 4)))
    }

    pub fn unpack(&self) -> Vec<FrameType> {
        (0..self.count).map(|i| self.get(i)).collect()
    }

    pub fn into_owned(self) -> PitchMarks<'static> {
        PitchMarks {
            bytes: Cow::Owned(self.bytes.into_owned()),
            count: self.count,
        }
    }
}

/// Type of the `logical_index`-th frame (1-based) of the diphone at `cursor`.
///
/// Index 0 has no frame and reads as unvoiced stable.
pub fn frame_type(stream: &PitchMarks<'_>, cursor: PitchMarkCursor, logical_index: usize) -> FrameType {
    if logical_index == 0 {
        return FrameType::UnvoicedStable;
    }
    let position = cursor.offset as usize + logical_index - 1;
    let byte_index = cursor.byte + position / 4;
    let byte = stream.bytes.get(byte_index).copied().unwrap_or(0);
    FrameType::from_bits(byte >> (2 * (position % 4)))
}
