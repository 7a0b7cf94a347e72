//! Plate text normalization and positional ambiguity correction.
//!
//! Brazilian plates have seven slots: `L L L D X D D` where `L` is a letter,
//! `D` a digit and `X` either (old format digit, Mercosul letter). OCR
//! confuses lookalike glyphs; the slot class decides which reading is right.

use crate::config::ConfigError;
use regex::Regex;

pub const PLATE_LEN: usize = 7;

/// Character class allowed at a plate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Letter,
    Digit,
    Either,
}

const SLOTS: [Slot; PLATE_LEN] = [
    Slot::Letter,
    Slot::Letter,
    Slot::Letter,
    Slot::Digit,
    Slot::Either,
    Slot::Digit,
    Slot::Digit,
];

/// Digit read where a letter must be.
fn as_letter(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '5' => 'S',
        '8' => 'B',
        '2' => 'Z',
        other => other,
    }
}

/// Letter read where a digit must be.
fn as_digit(c: char) -> char {
    match c {
        'O' | 'Q' => '0',
        'I' => '1',
        'S' => '5',
        'B' => '8',
        'Z' => '2',
        other => other,
    }
}

/// Strip everything but ASCII letters and digits, uppercase.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Normalize, then correct lookalikes slot by slot.
///
/// Strings shorter than seven characters are returned normalized but
/// uncorrected; longer ones are corrected and cut to the seven plate slots.
pub fn correct_ambiguities(raw: &str) -> String {
    let text = normalize_plate(raw);
    if text.chars().count() < PLATE_LEN {
        return text;
    }
    text.chars()
        .zip(SLOTS)
        .map(|(c, slot)| match slot {
            Slot::Letter if c.is_ascii_digit() => as_letter(c),
            Slot::Digit if c.is_ascii_alphabetic() => as_digit(c),
            _ => c,
        })
        .collect()
}

/// Full-match validity check for corrected plate text.
#[derive(Debug, Clone)]
pub struct PlateGrammar {
    regex: Regex,
}

impl PlateGrammar {
    /// Compile `pattern`; it is anchored at both ends regardless of how it is written.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored)
            .map_err(|e| ConfigError::Invalid(format!("plate pattern does not compile: {e}")))?;
        Ok(Self { regex })
    }

    pub fn is_valid(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}
