//! Document-number extraction from OCR text.
//!
//! OCR output is noisy: numbers arrive split across whitespace, surrounded by
//! unrelated text, or with misread digits. Each document kind has one or more
//! search patterns and a strict validator; a candidate is only trusted when it
//! passes both. Aadhaar numbers carry a Verhoeff check digit, which catches
//! every single-digit error and every adjacent transposition.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Supported identity documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Aadhaar,
    Pan,
    DrivingLicense,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Aadhaar => "aadhaar",
            DocumentKind::Pan => "pan",
            DocumentKind::DrivingLicense => "driving_license",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aadhaar" => Ok(DocumentKind::Aadhaar),
            "pan" => Ok(DocumentKind::Pan),
            "driving_license" | "license" | "dl" => Ok(DocumentKind::DrivingLicense),
            other => Err(format!("unknown document kind '{other}'")),
        }
    }
}

/// How strictly driving-license numbers are checked.
///
/// `Permissive` accepts two letters followed by 2–14 digits. `Strict`
/// additionally requires the 15 alphanumerics of the printed
/// `SSRR YYYYNNNNNNN` form (16 characters with its separator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseFormat {
    #[default]
    Permissive,
    Strict,
}

const STRICT_LICENSE_LEN: usize = 15;

/// A document number that matched its pattern and passed validation.
///
/// `value` holds only the alphanumeric characters of the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedNumber {
    pub kind: DocumentKind,
    pub value: String,
}

impl ValidatedNumber {
    /// Display form with everything but the last four characters hidden.
    pub fn masked(&self) -> String {
        mask_number(self.kind, &self.value)
    }
}

/// Result of scanning OCR text for one document kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(ValidatedNumber),
    /// Text looked like a number of this kind but none passed validation.
    Rejected { candidates: usize },
    Nothing,
}

static AADHAAR_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"\b[0-9]{4}[ \t][0-9]{4}[ \t][0-9]{4}\b").unwrap(),
        Regex::new(r"\b[0-9]{12}\b").unwrap(),
    ]
});

static PAN_PATTERNS: LazyLock<[Regex; 1]> =
    LazyLock::new(|| [Regex::new(r"\b[A-Z]{5}[0-9]{4}[A-Z]\b").unwrap()]);

static LICENSE_PATTERNS: LazyLock<[Regex; 1]> = LazyLock::new(|| {
    [Regex::new(r"\b[A-Z]{2}[- \t]?[0-9]{2}(?:[- \t]?[0-9]{1,12})?\b").unwrap()]
});

static PAN_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{5}[0-9]{4}[A-Z]$").unwrap());

static LICENSE_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}[-\s]?[0-9]{2,14}$").unwrap());

/// Find the first trustworthy document number of `kind` in `raw_text`.
pub fn extract(raw_text: &str, kind: DocumentKind) -> Option<ValidatedNumber> {
    extract_with(raw_text, kind, LicenseFormat::default())
}

/// [`extract`] with an explicit driving-license format.
pub fn extract_with(
    raw_text: &str,
    kind: DocumentKind,
    license_format: LicenseFormat,
) -> Option<ValidatedNumber> {
    match scan(raw_text, kind, license_format) {
        ScanOutcome::Found(number) => Some(number),
        _ => None,
    }
}

/// Scan `raw_text`, distinguishing "nothing number-like" from "candidates
/// seen but all invalid".
pub fn scan(raw_text: &str, kind: DocumentKind, license_format: LicenseFormat) -> ScanOutcome {
    let patterns: &[Regex] = match kind {
        DocumentKind::Aadhaar => &AADHAAR_PATTERNS[..],
        DocumentKind::Pan => &PAN_PATTERNS[..],
        DocumentKind::DrivingLicense => &LICENSE_PATTERNS[..],
    };

    let mut candidates = 0usize;
    for pattern in patterns {
        // Overlapping starts: a rejected match must not consume the digits
        // of a valid number that begins inside it.
        let mut start = 0;
        while let Some(m) = pattern.find_at(raw_text, start) {
            start = m.start() + 1;
            candidates += 1;
            let value = strip_non_alphanumeric(m.as_str());
            let valid = match kind {
                DocumentKind::Aadhaar => is_valid_aadhaar(&value),
                DocumentKind::Pan => is_valid_pan(&value),
                DocumentKind::DrivingLicense => is_valid_license(&value, license_format),
            };
            if valid {
                tracing::debug!(kind = %kind, "document number validated");
                return ScanOutcome::Found(ValidatedNumber { kind, value });
            }
        }
    }

    if candidates > 0 {
        tracing::debug!(kind = %kind, candidates, "document number candidates rejected");
        ScanOutcome::Rejected { candidates }
    } else {
        ScanOutcome::Nothing
    }
}

fn strip_non_alphanumeric(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// 12 ASCII digits with a valid Verhoeff check digit.
pub fn is_valid_aadhaar(number: &str) -> bool {
    number.len() == 12 && number.bytes().all(|b| b.is_ascii_digit()) && verhoeff_validate(number)
}

/// Exactly `[A-Z]{5}[0-9]{4}[A-Z]`; lowercase is rejected.
pub fn is_valid_pan(number: &str) -> bool {
    number.len() == 10 && PAN_FORMAT.is_match(number)
}

pub fn is_valid_license(number: &str, format: LicenseFormat) -> bool {
    if !LICENSE_FORMAT.is_match(number) {
        return false;
    }
    match format {
        LicenseFormat::Permissive => true,
        LicenseFormat::Strict => strip_non_alphanumeric(number).len() == STRICT_LICENSE_LEN,
    }
}

// ── Verhoeff ──────────────────────────────────────────────────────────────────

/// Multiplication table of the dihedral group D5.
const VERHOEFF_D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];

/// Position-dependent permutation, cycling every 8 digits.
const VERHOEFF_P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

const VERHOEFF_INV: [u8; 10] = [0, 4, 3, 2, 1, 5, 6, 7, 8, 9];

/// Fold `digits` (check digit last) right to left; valid iff the result is 0.
///
/// Returns `false` for empty input or any non-digit character.
pub fn verhoeff_validate(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }
    let mut c = 0u8;
    for (i, b) in digits.bytes().rev().enumerate() {
        if !b.is_ascii_digit() {
            return false;
        }
        let digit = (b - b'0') as usize;
        c = VERHOEFF_D[c as usize][VERHOEFF_P[i % 8][digit] as usize];
    }
    c == 0
}

/// Compute the check digit to append to `digits`.
pub fn verhoeff_check_digit(digits: &str) -> Option<u8> {
    let mut c = 0u8;
    for (i, b) in digits.bytes().rev().enumerate() {
        if !b.is_ascii_digit() {
            return None;
        }
        let digit = (b - b'0') as usize;
        c = VERHOEFF_D[c as usize][VERHOEFF_P[(i + 1) % 8][digit] as usize];
    }
    Some(VERHOEFF_INV[c as usize])
}

fn mask_number(kind: DocumentKind, value: &str) -> String {
    let visible = value.len().min(4);
    let split = value.len() - visible;
    let tail = &value[split..];
    match kind {
        DocumentKind::Aadhaar if value.len() == 12 => format!("XXXX XXXX {tail}"),
        _ => format!("{}{tail}", "X".repeat(split)),
    }
}
