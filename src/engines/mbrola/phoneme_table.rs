use std::collections::HashMap;

use super::model::MbrolaError;

/// Compact code standing for an interned phoneme name.
pub type PhonemeCode = u16;

/// Upper bound on distinct phoneme names in one database.
pub const MAX_PHONEMES: usize = 65_000;

/// Interning table for phoneme names.
///
/// Codes are indices into an append-only list, so a code handed out once stays
/// valid for the lifetime of the table.
#[derive(Debug, Clone, Default)]
pub struct PhonemeTable {
    names: Vec<String>,
    codes: HashMap<String, PhonemeCode>,
}

impl PhonemeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the code of `name`, appending it if it is not known yet.
    pub fn intern(&mut self, name: &str) -> Result<PhonemeCode, MbrolaError> {
        if let Some(&code) = self.codes.get(name) {
            return Ok(code);
        }
        if self.names.len() >= MAX_PHONEMES {
            return Err(MbrolaError::TooManyPhonemes(MAX_PHONEMES));
        }

        let code = self.names.len() as PhonemeCode;
        self.names.push(name.to_string());
        self.codes.insert(name.to_string(), code);
        Ok(code)
    }

    /// Code of an already interned name.
    pub fn code(&self, name: &str) -> Option<PhonemeCode> {
        self.codes.get(name).copied()
    }

    /// Name behind a code. Unknown codes resolve to the empty string.
    pub fn resolve(&self, code: PhonemeCode) -> &str {
        self.names
            .get(code as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in code order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::PhonemeTable;

    #[test]
    fn interning_twice_returns_the_same_code() {
        let mut table = PhonemeTable::new();
        let a = table.intern("a").unwrap();
        let b = table.intern("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.intern("a").unwrap(), a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resolve_is_the_inverse_of_intern() {
        let mut table = PhonemeTable::new();
        for name in ["_", "a", "E~", "tS"] {
            let code = table.intern(name).unwrap();
            assert_eq!(table.resolve(code), name);
        }
        assert_eq!(table.iter().collect::<Vec<_>>(), vec!["_", "a", "E~", "tS"]);
    }

    #[test]
    fn growth_keeps_earlier_codes() {
        let mut table = PhonemeTable::new();
        let first = table.intern("first").unwrap();
        for i in 0..500 {
            table.intern(&format!("p{i}")).unwrap();
        }
        assert_eq!(table.resolve(first), "first");
        assert_eq!(table.code("first"), Some(first));
    }

    #[test]
    fn unknown_code_resolves_to_empty_name() {
        let table = PhonemeTable::new();
        assert_eq!(table.resolve(7), "");
        assert_eq!(table.code("x"), None);
    }
}
