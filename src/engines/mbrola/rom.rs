//! Flat, pointer-free database images for zero-copy use from memory.
//!
//! ```text
//! name           zstring
//! align 4        magic [u8; 8], version [u8; 6], coding | 0x80, period u8
//! align 4        rate i16, diphone count i16, mark size i32, raw size i32, raw offset i32
//! align 4        slot count i32, first free i32, slots { wave_offset:i64
//!                pitch_mark_start:i32 halfseg:i32 left:u16 right:u16 next:i16
//!                frame_count:u8 hit:u8 }
//! align 2        phoneme count u16, zstrings
//! align 2        info count u16, zstrings
//!                pitch-mark bytes
//!                max_frame u8
//!                silence zstring
//! align 2        wave bytes
//! ```
//!
//! An empty slot has `hit == 255`. The raw offset is the position of the wave
//! bytes from the start of the image.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::database::{
    fixed_bytes, to_i16, to_i32, write_zstring, Coding, Database, DatabaseHeader, InfoString,
    Tables, WaveStore, MAGIC, ROM_MASK,
};
use super::diphone_index::{Cell, DiphoneEntry, DiphoneIndex, Slot};
use super::model::{MbrolaError, MbrolaResult};
use super::phoneme_table::PhonemeTable;
use super::pitch_marks::{packed_len, PitchMarks};

const EMPTY_SLOT: u8 = 255;
const SLOT_SIZE: usize = 24;

/// Serialize `database` as a ROM image.
pub fn to_rom(database: &mut Database<'_>) -> MbrolaResult<Vec<u8>> {
    let samples = database.read_all_samples()?;
    let header = database.header().clone();
    let index = database.index();
    let mut out = Vec::new();

    write_zstring(&mut out, database.name().as_bytes())?;

    align(&mut out, 4);
    let mut magic = MAGIC.to_vec();
    magic.resize(8, 0);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&fixed_bytes(&header.version, 6));
    out.write_u8(header.coding.id() | ROM_MASK)?;
    out.write_u8(u8::try_from(header.period).map_err(|_| {
        MbrolaError::Format(format!("period {} does not fit a ROM image", header.period))
    })?)?;

    align(&mut out, 4);
    out.write_i16::<LittleEndian>(to_i16(header.sample_rate as usize, "sample rate")?)?;
    out.write_i16::<LittleEndian>(to_i16(header.diphone_count, "diphone count")?)?;
    out.write_i32::<LittleEndian>(to_i32(header.mark_size, "mark size")?)?;
    out.write_i32::<LittleEndian>(to_i32(2 * samples.len(), "wave size")?)?;
    let raw_offset_at = out.len();
    out.write_i32::<LittleEndian>(0)?;

    align(&mut out, 4);
    out.write_i32::<LittleEndian>(to_i32(index.capacity(), "slot count")?)?;
    match index.first_free() {
        Some(slot) => out.write_i32::<LittleEndian>(to_i32(slot, "free slot")?)?,
        None => out.write_i32::<LittleEndian>(-1)?,
    }
    for slot in index.slots() {
        write_slot(&mut out, slot)?;
    }

    align(&mut out, 2);
    let phonemes = index.phonemes();
    out.write_u16::<LittleEndian>(count_u16(phonemes.len(), "phoneme count")?)?;
    for name in phonemes.iter() {
        write_zstring(&mut out, name.as_bytes())?;
    }

    align(&mut out, 2);
    out.write_u16::<LittleEndian>(count_u16(database.info().len(), "info count")?)?;
    for info in database.info() {
        write_zstring(&mut out, info.as_bytes())?;
    }

    out.extend_from_slice(database.pitch_marks().as_bytes());
    align(&mut out, 2);
    out.write_u16::<LittleEndian>(count_u16(database.max_frame(), "max frame")?)?;
    write_zstring(&mut out, database.silence().as_bytes())?;

    align(&mut out, 2);
    let raw_offset = to_i32(out.len(), "raw offset")?;
    LittleEndian::write_i32(&mut out[raw_offset_at..raw_offset_at + 4], raw_offset);
    for sample in samples {
        out.write_i16::<LittleEndian>(sample)?;
    }

    log::info!(
        "ROM image of {}: {} bytes, waves at {}",
        database.name(),
        out.len(),
        raw_offset
    );
    Ok(out)
}

/// Load a ROM image without copying. Pitch marks and waves borrow `image`.
pub fn load(image: &[u8]) -> MbrolaResult<Database<'_>> {
    let (name, tables, waves) = parse(image)?;
    Ok(Database::from_tables(name, tables, WaveStore::Borrowed(waves)))
}

/// Load a ROM image into owned storage.
pub fn load_owned(image: &[u8]) -> MbrolaResult<Database<'static>> {
    let (name, tables, waves) = parse(image)?;
    let mut samples = Vec::with_capacity(waves.len() / 2);
    tables.header.coding.decode(waves, &mut samples);
    let tables = Tables {
        header: tables.header,
        index: tables.index,
        manifest: tables.manifest,
        pitch_marks: tables.pitch_marks.into_owned(),
        info: tables.info,
        silence: tables.silence,
        max_frame: tables.max_frame,
    };
    Ok(Database::from_tables(
        name,
        tables,
        WaveStore::Owned(Arc::new(samples)),
    ))
}

fn parse(image: &[u8]) -> MbrolaResult<(String, Tables<'_>, &[u8])> {
    let mut reader = RomReader::new(image);
    let name = reader.string()?;

    reader.align(4);
    let magic = reader.take(8)?;
    if &magic[..MAGIC.len()] != MAGIC {
        return Err(MbrolaError::Format("not a ROM image".to_string()));
    }
    let version = fixed_string(reader.take(6)?);
    let coding_id = reader.u8()?;
    if coding_id & ROM_MASK == 0 {
        return Err(MbrolaError::Format(
            "coding byte lacks the ROM flag".to_string(),
        ));
    }
    let coding = Coding::from_id(coding_id)?;
    let period = reader.u8()?;

    reader.align(4);
    let sample_rate = reader.i16()?;
    let diphone_count = reader.i16()?;
    let mark_size = reader.i32()?;
    let raw_size = reader.i32()?;
    let raw_offset = reader.i32()?;
    if sample_rate <= 0 || diphone_count < 0 || mark_size < 0 || raw_size < 0 || raw_offset < 0 {
        return Err(MbrolaError::Format(
            "negative size or rate in ROM header".to_string(),
        ));
    }

    reader.align(4);
    let slot_count = reader.i32()?;
    let first_free = usize::try_from(reader.i32()?).ok();
    let slot_count = usize::try_from(slot_count)
        .map_err(|_| MbrolaError::Format("negative slot count".to_string()))?;
    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        slots.push(read_slot(&mut reader)?);
    }

    reader.align(2);
    let mut phonemes = PhonemeTable::new();
    for _ in 0..reader.u16()? {
        phonemes.intern(&reader.string()?)?;
    }

    reader.align(2);
    let info_count = reader.u16()?;
    let mut info = Vec::with_capacity(info_count as usize);
    for _ in 0..info_count {
        info.push(InfoString::new(reader.zstring()?.to_vec()));
    }

    let mark_size = mark_size as usize;
    let pitch_marks = PitchMarks::from_bytes(reader.take(packed_len(mark_size))?, mark_size);
    reader.align(2);
    let max_frame = reader.u16()? as usize;
    let silence = reader.string()?;

    reader.align(2);
    if reader.position() != raw_offset as usize {
        return Err(MbrolaError::Format(format!(
            "wave region expected at {raw_offset}, found at {}",
            reader.position()
        )));
    }
    let waves = reader.take(raw_size as usize)?;
    check_slots(&slots, first_free, phonemes.len())?;

    let header = DatabaseHeader {
        version,
        diphone_count: diphone_count as usize,
        mark_size,
        raw_size: raw_size as usize,
        sample_rate: sample_rate as u32,
        period: period as u16,
        coding,
        coding_id: coding_id & !ROM_MASK,
        short_mark_field: false,
    };
    let tables = Tables {
        header,
        index: DiphoneIndex::from_parts(phonemes, slots, first_free),
        manifest: Vec::new(),
        pitch_marks,
        info,
        silence,
        max_frame,
    };
    Ok((name, tables, waves))
}

/// Refuse an index whose links, free cursor or phoneme codes point outside
/// the image, or whose chains loop.
fn check_slots(slots: &[Slot], first_free: Option<usize>, phonemes: usize) -> MbrolaResult<()> {
    let corrupt = |what: String| MbrolaError::Format(format!("corrupt ROM index: {what}"));
    if let Some(free) = first_free.filter(|&free| free >= slots.len()) {
        return Err(corrupt(format!(
            "free cursor {free} beyond {} slots",
            slots.len()
        )));
    }
    for (id, slot) in slots.iter().enumerate() {
        let Slot::Occupied(cell) = slot else {
            continue;
        };
        let (left, right) = (cell.entry.left, cell.entry.right);
        if usize::from(left) >= phonemes || usize::from(right) >= phonemes {
            return Err(corrupt(format!(
                "slot {id} uses phoneme codes {left}-{right} of {phonemes}"
            )));
        }
        if let Some(next) = cell.next {
            if !matches!(slots.get(next), Some(Slot::Occupied(_))) {
                return Err(corrupt(format!("slot {id} links to slot {next}")));
            }
        }
    }

    // slots already known to reach the end of their chain
    let mut ends = vec![false; slots.len()];
    let mut walked = Vec::new();
    for start in 0..slots.len() {
        walked.clear();
        let mut current = Some(start);
        while let Some(id) = current.filter(|&id| !ends[id]) {
            if walked.len() == slots.len() {
                return Err(corrupt(format!("chain from slot {start} never ends")));
            }
            walked.push(id);
            current = match &slots[id] {
                Slot::Occupied(cell) => cell.next,
                Slot::Empty => None,
            };
        }
        for &id in &walked {
            ends[id] = true;
        }
    }
    Ok(())
}

fn write_slot(out: &mut Vec<u8>, slot: &Slot) -> MbrolaResult<()> {
    match slot {
        Slot::Empty => {
            out.extend_from_slice(&[0u8; SLOT_SIZE - 1]);
            out.write_u8(EMPTY_SLOT)?;
        }
        Slot::Occupied(cell) => {
            let entry = &cell.entry;
            out.write_i64::<LittleEndian>(entry.wave_offset)?;
            out.write_i32::<LittleEndian>(entry.pitch_mark_start)?;
            out.write_i32::<LittleEndian>(entry.halfseg)?;
            out.write_u16::<LittleEndian>(entry.left)?;
            out.write_u16::<LittleEndian>(entry.right)?;
            match cell.next {
                Some(next) => out.write_i16::<LittleEndian>(to_i16(next, "slot link")?)?,
                None => out.write_i16::<LittleEndian>(-1)?,
            }
            out.write_u8(entry.frame_count)?;
            out.write_u8(cell.hits.min(EMPTY_SLOT - 1))?;
        }
    }
    Ok(())
}

fn read_slot(reader: &mut RomReader<'_>) -> MbrolaResult<Slot> {
    let record = reader.take(SLOT_SIZE)?;
    let hits = record[23];
    if hits == EMPTY_SLOT {
        return Ok(Slot::Empty);
    }
    let next = LittleEndian::read_i16(&record[20..22]);
    Ok(Slot::Occupied(Cell {
        entry: DiphoneEntry {
            wave_offset: LittleEndian::read_i64(&record[0..8]),
            pitch_mark_start: LittleEndian::read_i32(&record[8..12]),
            halfseg: LittleEndian::read_i32(&record[12..16]),
            left: LittleEndian::read_u16(&record[16..18]),
            right: LittleEndian::read_u16(&record[18..20]),
            frame_count: record[22],
        },
        next: usize::try_from(next).ok(),
        hits,
    }))
}

fn align(out: &mut Vec<u8>, to: usize) {
    while out.len() % to != 0 {
        out.push(0);
    }
}

fn count_u16(value: usize, what: &str) -> MbrolaResult<u16> {
    u16::try_from(value).map_err(|_| MbrolaError::Format(format!("{what} {value} does not fit")))
}

fn fixed_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Bounds-checked cursor over an image.
struct RomReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> RomReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn align(&mut self, to: usize) {
        self.position = self.position.next_multiple_of(to);
    }

    fn take(&mut self, len: usize) -> MbrolaResult<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.position..self.position + len)
            .ok_or_else(|| MbrolaError::Format("ROM image is truncated".to_string()))?;
        self.position += len;
        Ok(slice)
    }

    fn u8(&mut self) -> MbrolaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> MbrolaResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn i16(&mut self) -> MbrolaResult<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    fn i32(&mut self) -> MbrolaResult<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn zstring(&mut self) -> MbrolaResult<&'a [u8]> {
        let rest = self.bytes.get(self.position..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MbrolaError::Format("unterminated string in ROM image".to_string()))?;
        let bytes = &rest[..len];
        self.position += len + 1;
        Ok(bytes)
    }

    fn string(&mut self) -> MbrolaResult<String> {
        Ok(String::from_utf8_lossy(self.zstring()?).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mbrola::builder::{DatabaseBuilder, Segment};
    use crate::engines::mbrola::database::Buffer;
    use crate::engines::mbrola::pitch_marks::FrameType;
    use pretty_assertions::assert_eq;

    const UV: FrameType = FrameType::UnvoicedStable;
    const V: FrameType = FrameType::VoicedStable;

    fn voice() -> Vec<u8> {
        DatabaseBuilder::new(16000, 80)
            .info("rom test")
            .hidden_info("private")
            .segment(Segment::tone("_", "a", &[UV, UV, V, V, V], 200))
            .segment(Segment::tone("a", "b", &[V, V, FrameType::VoicedTransient], 120))
            .segment(Segment::tone("b", "_", &[V, UV], 80))
            .segment(Segment::tone("_", "_", &[UV, UV], 80))
            .replacement(("a", "b"), ("a", "c"))
            .to_bytes()
            .unwrap()
    }

    fn named(database: &Database<'_>) -> Vec<(String, String, DiphoneEntry)> {
        let mut entries: Vec<_> = database
            .index()
            .named_entries()
            .map(|(l, r, e)| (l.to_string(), r.to_string(), *e))
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }

    #[test]
    fn rom_round_trip_matches_the_file_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), voice()).unwrap();
        let mut original = Database::open(file.path()).unwrap();
        let image = to_rom(&mut original).unwrap();

        let mut rom = load(&image).unwrap();
        assert!(rom.is_rom());
        assert_eq!(named(&rom), named(&original));
        assert_eq!(rom.pitch_marks().unpack(), original.pitch_marks().unpack());
        assert_eq!(rom.read_all_samples().unwrap(), original.read_all_samples().unwrap());
        assert_eq!(rom.silence(), "_");
        assert_eq!(rom.max_frame(), original.max_frame());
        assert_eq!(rom.info().len(), 2);
        assert_eq!(rom.printable_info().collect::<Vec<_>>(), vec!["rom test"]);
    }

    #[test]
    fn rom_units_borrow_the_image() {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let image = to_rom(&mut original).unwrap();
        let mut rom = load(&image).unwrap();
        let entry = rom.find("a", "c").unwrap();

        let mut buffer = Buffer::default();
        rom.load_samples(entry.wave_offset, 3 * 80, &mut buffer).unwrap();
        let Buffer::Borrowed(bytes) = buffer else {
            panic!("ROM samples were copied");
        };
        let start = bytes.as_ptr() as usize - image.as_ptr() as usize;
        assert_eq!(start % 2, 0);
        assert!(start >= image.len() - 2 * original.read_all_samples().unwrap().len());
    }

    #[test]
    fn owned_load_detaches_from_the_image() {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let image = to_rom(&mut original).unwrap();
        let mut owned = load_owned(&image).unwrap();
        drop(image);
        assert!(!owned.is_rom());
        assert_eq!(owned.read_all_samples().unwrap(), original.read_all_samples().unwrap());
        assert_eq!(owned.name(), "voice");
    }

    #[test]
    fn rom_images_cannot_be_written_as_database_files() {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let image = to_rom(&mut original).unwrap();
        let mut rom = load(&image).unwrap();
        assert!(matches!(
            rom.write_to(&mut Vec::new()),
            Err(MbrolaError::Format(_))
        ));
    }

    /// Offset of the first slot record and the slot count of an image of
    /// a database named `voice`.
    fn slot_table(image: &[u8]) -> (usize, usize) {
        let count_at = ("voice".len() + 1).next_multiple_of(4) + 32;
        let count = LittleEndian::read_i32(&image[count_at..count_at + 4]) as usize;
        (count_at + 8, count)
    }

    fn patched(patch: impl Fn(&mut [u8])) -> MbrolaResult<()> {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let mut image = to_rom(&mut original).unwrap();
        let (start, count) = slot_table(&image);
        for record in image[start..start + count * SLOT_SIZE].chunks_exact_mut(SLOT_SIZE) {
            if record[23] != EMPTY_SLOT {
                patch(record);
            }
        }
        load(&image).map(|_| ())
    }

    #[test]
    fn intact_slot_table_loads() {
        assert!(patched(|_| {}).is_ok());
    }

    #[test]
    fn slot_links_outside_the_table_are_refused() {
        let result = patched(|record| LittleEndian::write_i16(&mut record[20..22], 0x7000));
        assert!(matches!(result, Err(MbrolaError::Format(_))));
    }

    #[test]
    fn looping_chains_are_refused() {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let mut image = to_rom(&mut original).unwrap();
        let (start, count) = slot_table(&image);
        let id = (0..count)
            .find(|&id| image[start + id * SLOT_SIZE + 23] != EMPTY_SLOT)
            .unwrap();
        let at = start + id * SLOT_SIZE + 20;
        LittleEndian::write_i16(&mut image[at..at + 2], id as i16);
        assert!(matches!(load(&image), Err(MbrolaError::Format(_))));
    }

    #[test]
    fn unknown_phoneme_codes_are_refused() {
        let result = patched(|record| LittleEndian::write_u16(&mut record[16..18], 0xFFFF));
        assert!(matches!(result, Err(MbrolaError::Format(_))));
    }

    #[test]
    fn free_cursor_outside_the_table_is_refused() {
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let mut image = to_rom(&mut original).unwrap();
        let (start, _) = slot_table(&image);
        LittleEndian::write_i32(&mut image[start - 4..start], 0x7000);
        assert!(matches!(load(&image), Err(MbrolaError::Format(_))));
    }

    #[test]
    fn long_legacy_frames_survive_the_round_trip() {
        let bytes = DatabaseBuilder::new(16000, 80)
            .legacy(true)
            .segment(Segment::tone("_", "a", &[V; 180], 7200))
            .segment(Segment::tone("_", "_", &[UV, UV], 80))
            .to_bytes()
            .unwrap();
        let mut original = Database::from_bytes("voice", &bytes).unwrap();
        assert_eq!(original.max_frame(), 270);

        let image = to_rom(&mut original).unwrap();
        assert_eq!(load(&image).unwrap().max_frame(), 270);
        assert_eq!(load_owned(&image).unwrap().max_samples(), original.max_samples());
    }

    #[test]
    fn database_files_are_not_rom_images() {
        assert!(matches!(load(&voice()), Err(MbrolaError::Format(_))));
        let mut original = Database::from_bytes("voice", &voice()).unwrap();
        let image = to_rom(&mut original).unwrap();
        assert!(matches!(
            load(&image[..image.len() / 2]),
            Err(MbrolaError::Format(_))
        ));
    }
}
