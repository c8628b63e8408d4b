//! Data Section Builder
//!
//! Interns the constants generated code refers to: NUL-terminated strings
//! (packed into `__cstring`) and 8-byte doubles (an 8-byte-aligned
//! `__const` region). Identical input always yields the identical label, which
//! is what makes enum identity by string address work.

use std::collections::HashMap;

/// A deduplicated string constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrConst(u32);

/// A deduplicated double constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoubleConst(u32);

/// Symbolic reference to a constant placed by the Mach-O builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLabel {
    Str(StrConst),
    Double(DoubleConst),
}

#[derive(Debug, Default)]
pub struct DataSection {
    strings: Vec<u8>,
    string_offsets: Vec<usize>,
    string_index: HashMap<Vec<u8>, StrConst>,
    doubles: Vec<u64>,
    double_index: HashMap<u64, DoubleConst>,
}

impl DataSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string whose escape sequences are still in source form
    /// (`\n`, `\t`, ...). They are expanded into real bytes first.
    pub fn intern_str(&mut self, text: &str) -> StrConst {
        self.intern_bytes(expand_escapes(text))
    }

    /// Intern a string exactly as given
    pub fn intern_raw(&mut self, text: &str) -> StrConst {
        self.intern_bytes(text.as_bytes().to_vec())
    }

    fn intern_bytes(&mut self, bytes: Vec<u8>) -> StrConst {
        if let Some(&label) = self.string_index.get(&bytes) {
            return label;
        }
        let label = StrConst(self.string_offsets.len() as u32);
        self.string_offsets.push(self.strings.len());
        self.strings.extend_from_slice(&bytes);
        self.strings.push(0);
        self.string_index.insert(bytes, label);
        label
    }

    /// Intern a double by bit pattern
    pub fn intern_double(&mut self, value: f64) -> DoubleConst {
        let bits = value.to_bits();
        if let Some(&label) = self.double_index.get(&bits) {
            return label;
        }
        let label = DoubleConst(self.doubles.len() as u32);
        self.doubles.push(bits);
        self.double_index.insert(bits, label);
        label
    }

    /// Byte offset of a string inside the `__cstring` blob
    #[cfg(test)]
    pub fn string_offset(&self, label: StrConst) -> Option<usize> {
        self.string_offsets.get(label.0 as usize).copied()
    }

    /// Byte offset of a double inside the `__const` blob
    #[cfg(test)]
    pub fn double_offset(&self, label: DoubleConst) -> Option<usize> {
        ((label.0 as usize) < self.doubles.len()).then(|| label.0 as usize * 8)
    }

    #[cfg(test)]
    pub fn string_count(&self) -> usize {
        self.string_offsets.len()
    }

    #[cfg(test)]
    pub fn double_count(&self) -> usize {
        self.doubles.len()
    }

    /// Freeze into the two section images
    pub fn finish(self) -> DataImage {
        DataImage {
            cstrings: self.strings,
            string_offsets: self.string_offsets,
            doubles: self.doubles.iter().flat_map(|b| b.to_le_bytes()).collect(),
        }
    }
}

/// Frozen constant pools, ready for placement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataImage {
    pub cstrings: Vec<u8>,
    pub string_offsets: Vec<usize>,
    pub doubles: Vec<u8>,
}

impl DataImage {
    pub fn offset_of(&self, label: DataLabel) -> Option<usize> {
        match label {
            DataLabel::Str(s) => self.string_offsets.get(s.0 as usize).copied(),
            DataLabel::Double(d) => {
                let at = d.0 as usize * 8;
                (at < self.doubles.len()).then_some(at)
            }
        }
    }
}

/// Re-expand the source form of escape sequences into the bytes they denote.
/// Unknown escapes are kept verbatim.
pub fn expand_escapes(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut tmp = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('\'') => out.push(b'\''),
            Some(other) => {
                out.push(b'\\');
                let mut tmp = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut tmp).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}

/// Escape `%` so text can be used as a printf format
pub fn printf_literal(text: &str) -> String {
    text.replace('%', "%%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_deduplicated() {
        let mut data = DataSection::new();
        let a = data.intern_str("Red");
        let b = data.intern_str("Green");
        let c = data.intern_str("Red");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(data.string_count(), 2);
    }

    #[test]
    fn test_string_layout_is_packed() {
        let mut data = DataSection::new();
        let a = data.intern_raw("ab");
        let b = data.intern_raw("c");
        assert_eq!(data.string_offset(a), Some(0));
        assert_eq!(data.string_offset(b), Some(3));
        let image = data.finish();
        assert_eq!(image.cstrings, b"ab\0c\0");
    }

    #[test]
    fn test_escape_expansion() {
        assert_eq!(expand_escapes(r"a\nb"), b"a\nb");
        assert_eq!(expand_escapes(r#"say \"hi\"\t"#), b"say \"hi\"\t");
        assert_eq!(expand_escapes(r"\q"), b"\\q");
        assert_eq!(expand_escapes("tail\\"), b"tail\\");

        // Source-form and expanded spellings of the same text share a label
        let mut data = DataSection::new();
        let a = data.intern_str(r"x\n");
        let b = data.intern_raw("x\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_doubles_by_bit_pattern() {
        let mut data = DataSection::new();
        let a = data.intern_double(1.5);
        let b = data.intern_double(1.5);
        let z = data.intern_double(0.0);
        let nz = data.intern_double(-0.0);
        assert_eq!(a, b);
        assert_ne!(z, nz);
        assert_eq!(data.double_offset(z), Some(8));
        let image = data.finish();
        assert_eq!(image.doubles.len(), 24);
        assert_eq!(&image.doubles[0..8], &1.5f64.to_le_bytes());
        assert_eq!(image.offset_of(DataLabel::Double(nz)), Some(16));
    }

    #[test]
    fn test_printf_literal() {
        assert_eq!(printf_literal("100%"), "100%%");
        assert_eq!(printf_literal("plain"), "plain");
    }
}
