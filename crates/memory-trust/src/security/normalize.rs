//! Look-alike folding and invisible-character stripping run before pattern matching.
//!
//! Detectors match against `ScanText::normalized` but every reported span is mapped back
//! to byte offsets in the original content, so redaction removes exactly what was stored.

use std::ops::Range;

/// Content prepared for detectors: the raw text plus a folded copy with an offset map.
#[derive(Debug, Clone)]
pub struct ScanText {
    raw: String,
    normalized: String,
    /// For each byte of `normalized`, the raw byte offset of the char it came from.
    /// Has one trailing element equal to `raw.len()`.
    origin: Vec<usize>,
}

impl ScanText {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut normalized = String::with_capacity(raw.len());
        let mut origin = Vec::with_capacity(raw.len() + 1);
        for (offset, ch) in raw.char_indices() {
            if is_invisible(ch) {
                continue;
            }
            let folded = fold(ch);
            normalized.push(folded);
            origin.extend(std::iter::repeat(offset).take(folded.len_utf8()));
        }
        origin.push(raw.len());
        Self {
            raw,
            normalized,
            origin,
        }
    }

    #[inline]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// True when folding or stripping changed anything.
    pub fn was_altered(&self) -> bool {
        self.raw != self.normalized
    }

    /// Maps a byte range of `normalized` onto the raw content.
    pub fn to_raw_span(&self, span: Range<usize>) -> Range<usize> {
        let start = self.origin[span.start.min(self.normalized.len())];
        let end = if span.end >= self.normalized.len() {
            self.raw.len()
        } else {
            self.origin[span.end]
        };
        start..end.max(start)
    }
}

/// Zero-width joiners/spaces, soft hyphen, BOM and bidi controls.
pub fn is_invisible(ch: char) -> bool {
    matches!(
        ch,
        '\u{00AD}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
    )
}

/// Bidi overrides/isolates: these reorder displayed text and have no place in a memory.
pub fn is_bidi_control(ch: char) -> bool {
    matches!(ch, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// Cyrillic or Greek letters commonly substituted for Latin ones.
pub fn is_confusable_script(ch: char) -> bool {
    matches!(ch, '\u{0370}'..='\u{03FF}' | '\u{0400}'..='\u{04FF}')
}

fn fold(ch: char) -> char {
    match ch {
        // fullwidth ASCII
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
        '\u{00A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => ' ',
        // Cyrillic
        'а' => 'a',
        'е' => 'e',
        'о' => 'o',
        'р' => 'p',
        'с' => 'c',
        'у' => 'y',
        'х' => 'x',
        'і' => 'i',
        'ј' => 'j',
        'ѕ' => 's',
        'ԁ' => 'd',
        'ɡ' => 'g',
        'А' => 'A',
        'В' => 'B',
        'Е' => 'E',
        'К' => 'K',
        'М' => 'M',
        'Н' => 'H',
        'О' => 'O',
        'Р' => 'P',
        'С' => 'C',
        'Т' => 'T',
        'Х' => 'X',
        'І' => 'I',
        'Ѕ' => 'S',
        // Greek
        'α' => 'a',
        'ε' => 'e',
        'ι' => 'i',
        'ν' => 'v',
        'ο' => 'o',
        'ρ' => 'p',
        'τ' => 't',
        'υ' => 'u',
        'Α' => 'A',
        'Β' => 'B',
        'Ε' => 'E',
        'Η' => 'H',
        'Ι' => 'I',
        'Κ' => 'K',
        'Μ' => 'M',
        'Ν' => 'N',
        'Ο' => 'O',
        'Ρ' => 'P',
        'Τ' => 'T',
        'Χ' => 'X',
        _ => ch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_zero_width_and_maps_spans() {
        let raw = "ig\u{200B}nore this";
        let text = ScanText::new(raw);
        assert_eq!(text.normalized(), "ignore this");
        let span = text.to_raw_span(0..6);
        assert_eq!(&raw[span], "ig\u{200B}nore");
    }

    #[test]
    fn folds_cyrillic_lookalikes() {
        let text = ScanText::new("ignоre prеvious");
        assert_eq!(text.normalized(), "ignore previous");
        assert!(text.was_altered());
        let span = text.to_raw_span(7..15);
        assert_eq!(&text.raw()[span], "prеvious");
    }

    #[test]
    fn folds_fullwidth() {
        let text = ScanText::new("ｓｙｓｔｅｍ:");
        assert_eq!(text.normalized(), "system:");
    }

    #[test]
    fn clean_text_is_untouched() {
        let text = ScanText::new("Remember to buy milk");
        assert!(!text.was_altered());
        assert_eq!(text.to_raw_span(12..16), 12..16);
    }
}
