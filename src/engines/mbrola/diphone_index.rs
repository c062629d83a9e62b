//! Coalescent hash table over interned phoneme pairs.
//!
//! Collisions are resolved by linking into free slots taken from a pool that
//! shrinks from the end of the table. A slot handed out by the free cursor is
//! never reconsidered, which keeps insertion O(1) amortized and makes the
//! table layout a pure function of insertion order.

use super::model::MbrolaError;
use super::phoneme_table::{PhonemeCode, PhonemeTable};

/// Fractional part of the golden ratio used to spread raw hashes.
const GOLDEN_FRACTION: f64 = 0.6180339887;

/// Index of a slot in a [`DiphoneIndex`]. Invalidated by any rebuild.
pub type SlotId = usize;

/// Location and shape of one recorded diphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiphoneEntry {
    pub left: PhonemeCode,
    pub right: PhonemeCode,
    /// First wave sample of the diphone.
    pub wave_offset: i64,
    /// Sample offset of the left/right boundary.
    pub halfseg: i32,
    /// First frame in the global pitch-mark stream.
    pub pitch_mark_start: i32,
    /// Number of physical analysis frames.
    pub frame_count: u8,
}

/// Fields of a diphone that do not depend on its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFields {
    pub wave_offset: i64,
    pub halfseg: i32,
    pub pitch_mark_start: i32,
    pub frame_count: u8,
}

impl DiphoneEntry {
    pub fn fields(&self) -> SegmentFields {
        SegmentFields {
            wave_offset: self.wave_offset,
            halfseg: self.halfseg,
            pitch_mark_start: self.pitch_mark_start,
            frame_count: self.frame_count,
        }
    }
}

/// An occupied slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub entry: DiphoneEntry,
    pub next: Option<SlotId>,
    /// Number of keys whose chain passes through this slot. Diagnostics only.
    pub hits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Occupied(Cell),
}

/// Fixed-capacity coalescent hash table keyed by `(left, right)` phoneme names.
#[derive(Debug, Clone)]
pub struct DiphoneIndex {
    phonemes: PhonemeTable,
    slots: Vec<Slot>,
    /// Next candidate for a collision slot, scanning downward.
    first_free: Option<SlotId>,
    len: usize,
}

/// Rolling 32-bit hash of a diphone name pair.
pub fn hash(left: &str, right: &str) -> u32 {
    let mut shift = 0u32;
    let mut acc = 0u32;
    for byte in left.bytes().chain(right.bytes()) {
        acc = acc.wrapping_add((byte as u32) << shift);
        shift = (shift + 8) % 32;
    }
    acc
}

/// Spread a raw hash over `size` slots (Fibonacci hashing).
pub fn mix(raw: u32, size: usize) -> SlotId {
    let scaled = raw as f64 * GOLDEN_FRACTION;
    let fraction = scaled - scaled.floor();
    ((fraction * size as f64) as usize).min(size.saturating_sub(1))
}

/// Table capacity for `count` diphones: 25% slack over the diphone count.
pub fn capacity_for(count: usize) -> usize {
    count + count / 4
}

impl DiphoneIndex {
    /// Create an empty table with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_phonemes(capacity, PhonemeTable::new())
    }

    fn with_phonemes(capacity: usize, phonemes: PhonemeTable) -> Self {
        Self {
            phonemes,
            slots: vec![Slot::Empty; capacity],
            first_free: capacity.checked_sub(1),
            len: 0,
        }
    }

    /// Rebuild a table from raw parts, as stored in a ROM image.
    pub fn from_parts(
        phonemes: PhonemeTable,
        slots: Vec<Slot>,
        first_free: Option<SlotId>,
    ) -> Self {
        let len = slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count();
        Self {
            phonemes,
            slots,
            first_free,
            len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn phonemes(&self) -> &PhonemeTable {
        &self.phonemes
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn first_free(&self) -> Option<SlotId> {
        self.first_free
    }

    fn home(&self, left: &str, right: &str) -> Option<SlotId> {
        if self.slots.is_empty() {
            return None;
        }
        Some(mix(hash(left, right), self.slots.len()))
    }

    /// Insert a diphone. The caller guarantees the key is not present yet.
    pub fn insert(
        &mut self,
        left: &str,
        right: &str,
        fields: SegmentFields,
    ) -> Result<SlotId, MbrolaError> {
        let home = self.home(left, right).ok_or(MbrolaError::IndexFull)?;
        let entry = DiphoneEntry {
            left: self.phonemes.intern(left)?,
            right: self.phonemes.intern(right)?,
            wave_offset: fields.wave_offset,
            halfseg: fields.halfseg,
            pitch_mark_start: fields.pitch_mark_start,
            frame_count: fields.frame_count,
        };

        if matches!(self.slots[home], Slot::Empty) {
            self.slots[home] = Slot::Occupied(Cell {
                entry,
                next: None,
                hits: 1,
            });
            self.len += 1;
            return Ok(home);
        }

        let chosen = self.take_free_slot()?;
        let home_next = match &mut self.slots[home] {
            Slot::Occupied(cell) => {
                cell.hits = cell.hits.saturating_add(1);
                cell.next.replace(chosen)
            }
            Slot::Empty => None,
        };
        self.slots[chosen] = Slot::Occupied(Cell {
            entry,
            next: home_next,
            hits: 1,
        });
        self.len += 1;
        Ok(chosen)
    }

    fn take_free_slot(&mut self) -> Result<SlotId, MbrolaError> {
        let mut cursor = self.first_free.ok_or(MbrolaError::IndexFull)?;
        loop {
            if matches!(self.slots[cursor], Slot::Empty) {
                self.first_free = cursor.checked_sub(1);
                return Ok(cursor);
            }
            cursor = cursor.checked_sub(1).ok_or(MbrolaError::IndexFull)?;
        }
    }

    /// Slot holding `left-right`, if any.
    pub fn lookup(&self, left: &str, right: &str) -> Option<SlotId> {
        let mut current = Some(self.home(left, right)?);
        while let Some(id) = current {
            let Slot::Occupied(cell) = &self.slots[id] else {
                return None;
            };
            if self.phonemes.resolve(cell.entry.left) == left
                && self.phonemes.resolve(cell.entry.right) == right
            {
                return Some(id);
            }
            current = cell.next;
        }
        None
    }

    pub fn entry(&self, slot: SlotId) -> Option<&DiphoneEntry> {
        match self.slots.get(slot) {
            Some(Slot::Occupied(cell)) => Some(&cell.entry),
            _ => None,
        }
    }

    /// Copy of the entry stored under `left-right`.
    pub fn get(&self, left: &str, right: &str) -> Option<DiphoneEntry> {
        self.lookup(left, right)
            .and_then(|slot| self.entry(slot))
            .copied()
    }

    pub fn contains(&self, left: &str, right: &str) -> bool {
        self.lookup(left, right).is_some()
    }

    /// Live entries in slot order.
    pub fn entries(&self) -> impl Iterator<Item = &DiphoneEntry> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(cell) => Some(&cell.entry),
            Slot::Empty => None,
        })
    }

    /// Live entries with their names resolved.
    pub fn named_entries(&self) -> impl Iterator<Item = (&str, &str, &DiphoneEntry)> {
        self.entries().map(|entry| {
            (
                self.phonemes.resolve(entry.left),
                self.phonemes.resolve(entry.right),
                entry,
            )
        })
    }

    /// Register `target` as an alias of the existing diphone `source`.
    pub fn insert_replacement(
        &mut self,
        source: (&str, &str),
        target: (&str, &str),
    ) -> Result<SlotId, MbrolaError> {
        let fields = self
            .get(source.0, source.1)
            .ok_or_else(|| MbrolaError::DuplicateSourceMissing {
                left: source.0.to_string(),
                right: source.1.to_string(),
            })?
            .fields();
        if self.contains(target.0, target.1) {
            return Err(MbrolaError::DuplicateExists {
                left: target.0.to_string(),
                right: target.1.to_string(),
            });
        }
        self.insert(target.0, target.1, fields)
    }

    fn insert_unique(
        &mut self,
        left: &str,
        right: &str,
        fields: SegmentFields,
    ) -> Result<(), MbrolaError> {
        if self.contains(left, right) {
            return Err(MbrolaError::DuplicateDiphone {
                left: left.to_string(),
                right: right.to_string(),
            });
        }
        self.insert(left, right, fields).map(|_| ())
    }

    /// Rebuild the table with every phoneme name passed through `rename`.
    ///
    /// The result has the same capacity. All slot ids obtained from `self`
    /// are meaningless for the new table.
    pub fn renamed<'m, F>(&self, rename: F) -> Result<Self, MbrolaError>
    where
        F: Fn(&str) -> Option<&'m str>,
    {
        let mut rebuilt = Self::with_capacity(self.capacity());
        for (left, right, entry) in self.named_entries() {
            let new_left = rename(left).unwrap_or(left);
            let new_right = rename(right).unwrap_or(right);
            rebuilt.insert_unique(new_left, new_right, entry.fields())?;
        }
        Ok(rebuilt)
    }

    /// Number of new entries [`cloned`](Self::cloned) would add for `from`.
    pub fn clone_count(&self, from: &str) -> usize {
        self.named_entries()
            .map(|(left, right, _)| match (left == from, right == from) {
                (true, true) => 3,
                (true, false) | (false, true) => 1,
                (false, false) => 0,
            })
            .sum()
    }

    /// Rebuild the table with every diphone touching `from` duplicated under `to`.
    ///
    /// Capacity grows by exactly the number of added entries. Returns the new
    /// table and the list of `(source, target)` name pairs that were added.
    pub fn cloned(
        &self,
        from: &str,
        to: &str,
    ) -> Result<(Self, Vec<ClonedPair>), MbrolaError> {
        let added = self.clone_count(from);
        let mut rebuilt = Self::with_capacity(self.capacity() + added);
        let mut pairs = Vec::with_capacity(added);

        for (left, right, entry) in self.named_entries() {
            rebuilt.insert_unique(left, right, entry.fields())?;
        }
        for (left, right, entry) in self.named_entries() {
            let mut targets = Vec::new();
            if left == from {
                targets.push((to, right));
            }
            if right == from {
                targets.push((left, to));
            }
            if left == from && right == from {
                targets.push((to, to));
            }
            for (new_left, new_right) in targets {
                rebuilt.insert_unique(new_left, new_right, entry.fields())?;
                pairs.push(ClonedPair {
                    source: (left.to_string(), right.to_string()),
                    target: (new_left.to_string(), new_right.to_string()),
                });
            }
        }
        Ok((rebuilt, pairs))
    }

    /// Average number of key comparisons for a successful lookup.
    pub fn mean_probe_length(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let total: usize = self
            .named_entries()
            .map(|(left, right, _)| self.probe_length(left, right))
            .sum();
        total as f64 / self.len as f64
    }

    fn probe_length(&self, left: &str, right: &str) -> usize {
        let mut steps = 0;
        let mut current = self.home(left, right);
        while let Some(id) = current {
            steps += 1;
            match &self.slots[id] {
                Slot::Occupied(cell)
                    if self.phonemes.resolve(cell.entry.left) == left
                        && self.phonemes.resolve(cell.entry.right) == right =>
                {
                    break
                }
                Slot::Occupied(cell) => current = cell.next,
                Slot::Empty => break,
            }
        }
        steps
    }
}

/// A diphone added by [`DiphoneIndex::cloned`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonedPair {
    pub source: (String, String),
    pub target: (String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fields(n: i64) -> SegmentFields {
        SegmentFields {
            wave_offset: n * 100,
            halfseg: n as i32,
            pitch_mark_start: n as i32 * 3,
            frame_count: 3,
        }
    }

    fn sorted_pairs(index: &DiphoneIndex) -> Vec<(String, String, SegmentFields)> {
        let mut pairs: Vec<_> = index
            .named_entries()
            .map(|(l, r, e)| (l.to_string(), r.to_string(), e.fields()))
            .collect();
        pairs.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        pairs
    }

    #[test]
    fn hash_accumulates_with_rolling_shift() {
        assert_eq!(hash("", ""), 0);
        assert_eq!(hash("a", ""), 0x61);
        assert_eq!(hash("a", "b"), 0x61 + (0x62 << 8));
        assert_eq!(hash("abcd", "e"), 0x61 + (0x62 << 8) + (0x63 << 16) + (0x64 << 24) + 0x65);
        assert_eq!(hash("ab", "cd"), hash("abc", "d"));
    }

    #[test]
    fn mix_stays_inside_the_table() {
        for raw in [0u32, 1, 97, 0xdead_beef, u32::MAX] {
            for size in [1usize, 2, 7, 125, 4000] {
                assert!(mix(raw, size) < size);
            }
        }
        assert_eq!(mix(0, 10), 0);
    }

    #[test]
    fn every_inserted_pair_is_found() {
        let names = ["_", "a", "e", "i", "o", "u", "p", "t", "k", "s"];
        let count = names.len() * names.len();
        let mut index = DiphoneIndex::with_capacity(capacity_for(count));
        let mut n = 0;
        for left in names {
            for right in names {
                index.insert(left, right, fields(n)).unwrap();
                n += 1;
            }
        }
        assert_eq!(index.len(), count);

        let mut n = 0;
        for left in names {
            for right in names {
                let entry = index.get(left, right).expect("inserted pair must be found");
                assert_eq!(entry.fields(), fields(n));
                assert_eq!(index.phonemes().resolve(entry.left), left);
                assert_eq!(index.phonemes().resolve(entry.right), right);
                n += 1;
            }
        }
        assert!(index.get("a", "x").is_none());
        assert!(index.mean_probe_length() >= 1.0);
    }

    #[test]
    fn collisions_are_prepended_to_the_home_chain() {
        let capacity = 8;
        let home = mix(hash("a", "b"), capacity);
        let colliding: Vec<String> = (0..1000)
            .map(|i| format!("k{i}"))
            .filter(|name| mix(hash(name, "b"), capacity) == home)
            .take(2)
            .collect();
        assert_eq!(colliding.len(), 2);

        let mut index = DiphoneIndex::with_capacity(capacity);
        assert_eq!(index.insert("a", "b", fields(1)).unwrap(), home);
        let second = index.insert(&colliding[0], "b", fields(2)).unwrap();
        let third = index.insert(&colliding[1], "b", fields(3)).unwrap();
        assert!(second != home && third != home);
        assert!(third < second);

        let next_of = |slot: SlotId| match &index.slots()[slot] {
            Slot::Occupied(cell) => cell.next,
            Slot::Empty => panic!("slot {slot} should be occupied"),
        };
        assert_eq!(next_of(home), Some(third));
        assert_eq!(next_of(third), Some(second));
        assert_eq!(next_of(second), None);

        assert_eq!(index.get(&colliding[0], "b").unwrap().fields(), fields(2));
        assert_eq!(index.get(&colliding[1], "b").unwrap().fields(), fields(3));
        assert!(index.first_free().map_or(true, |free| free < third));
    }

    #[test]
    fn full_table_reports_error() {
        let mut index = DiphoneIndex::with_capacity(1);
        index.insert("a", "b", fields(0)).unwrap();
        assert!(matches!(
            index.insert("c", "d", fields(1)),
            Err(MbrolaError::IndexFull)
        ));
        let mut empty = DiphoneIndex::with_capacity(0);
        assert!(matches!(
            empty.insert("c", "d", fields(1)),
            Err(MbrolaError::IndexFull)
        ));
        assert!(empty.lookup("c", "d").is_none());
    }

    #[test]
    fn replacement_duplicates_source_fields() {
        let mut index = DiphoneIndex::with_capacity(5);
        index.insert("a", "b", fields(4)).unwrap();
        index.insert_replacement(("a", "b"), ("a", "c")).unwrap();
        assert_eq!(index.get("a", "c").unwrap().fields(), fields(4));

        assert!(matches!(
            index.insert_replacement(("z", "z"), ("q", "q")),
            Err(MbrolaError::DuplicateSourceMissing { .. })
        ));
        assert!(matches!(
            index.insert_replacement(("a", "b"), ("a", "c")),
            Err(MbrolaError::DuplicateExists { .. })
        ));
    }

    #[test]
    fn rename_then_inverse_restores_pairs() {
        let mut index = DiphoneIndex::with_capacity(capacity_for(4));
        index.insert("_", "A", fields(0)).unwrap();
        index.insert("A", "_", fields(1)).unwrap();
        index.insert("A", "A", fields(2)).unwrap();
        index.insert("_", "_", fields(3)).unwrap();

        let forward = index
            .renamed(|name| if name == "A" { Some("B") } else { None })
            .unwrap();
        assert_eq!(forward.capacity(), index.capacity());
        assert!(forward.contains("B", "B"));
        assert!(!forward.contains("A", "A"));

        let back = forward
            .renamed(|name| if name == "B" { Some("A") } else { None })
            .unwrap();
        assert_eq!(sorted_pairs(&back), sorted_pairs(&index));
    }

    #[test]
    fn rename_onto_existing_pair_fails() {
        let mut index = DiphoneIndex::with_capacity(capacity_for(2));
        index.insert("a", "_", fields(0)).unwrap();
        index.insert("b", "_", fields(1)).unwrap();
        let result = index.renamed(|name| if name == "a" { Some("b") } else { None });
        assert!(matches!(result, Err(MbrolaError::DuplicateDiphone { .. })));
        assert!(index.contains("a", "_"));
    }

    #[test]
    fn clone_of_self_pair_adds_three_entries() {
        let mut index = DiphoneIndex::with_capacity(capacity_for(2));
        index.insert("X", "X", fields(7)).unwrap();
        index.insert("_", "_", fields(8)).unwrap();

        assert_eq!(index.clone_count("X"), 3);
        let (cloned, added) = index.cloned("X", "Y").unwrap();
        assert_eq!(cloned.capacity(), index.capacity() + 3);
        assert_eq!(cloned.len(), index.len() + 3);
        assert_eq!(added.len(), 3);

        let targets: Vec<_> = added.iter().map(|p| p.target.clone()).collect();
        assert_eq!(
            targets,
            vec![
                ("Y".to_string(), "X".to_string()),
                ("X".to_string(), "Y".to_string()),
                ("Y".to_string(), "Y".to_string()),
            ]
        );
        for (l, r) in [("Y", "X"), ("X", "Y"), ("Y", "Y"), ("X", "X")] {
            assert_eq!(cloned.get(l, r).unwrap().fields(), fields(7));
        }
    }

    #[test]
    fn clone_conflict_is_fatal() {
        let mut index = DiphoneIndex::with_capacity(capacity_for(2));
        index.insert("X", "_", fields(0)).unwrap();
        index.insert("Y", "_", fields(1)).unwrap();
        assert!(matches!(
            index.cloned("X", "Y"),
            Err(MbrolaError::DuplicateDiphone { .. })
        ));
    }
}
