//! Encoding & Unicode normalization policy.
//!
//! All transformations applied to produce `text_norm` from `text_raw`.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Invisible characters dropped entirely from `text_norm`.
const REMOVE_CHARS: &[char] = &[
    '\u{200b}', // ZERO WIDTH SPACE
    '\u{200c}', // ZERO WIDTH NON-JOINER
    '\u{200d}', // ZERO WIDTH JOINER
    '\u{2060}', // WORD JOINER
    '\u{feff}', // BOM / ZERO WIDTH NO-BREAK SPACE
    '\u{00ad}', // SOFT HYPHEN
];

/// Characters normalized to an ASCII space in `text_norm`.
const NORMALIZE_TO_SPACE: &[char] = &[
    '\u{00a0}', // NON-BREAKING SPACE
    '\u{202f}', // NARROW NO-BREAK SPACE
    '\u{2007}', // FIGURE SPACE
    '\u{2009}', // THIN SPACE
    '\u{00a4}', // CURRENCY SIGN (¤)
];

const SEP_MARK: char = '\u{00a4}';

fn is_strippable_control(ch: char) -> bool {
    (ch as u32) < 0x20 && ch != '\t' && ch != '\n' && ch != '\r'
}

/// Apply the full Unicode normalization policy to produce `text_norm`.
///
/// 1. NFC normalization.
/// 2. Normalize line breaks to `\n`.
/// 3. Remove invisible characters (ZWSP, soft hyphen, BOM, ...).
/// 4. Normalize NBSP/NNBSP/figure-space/thin-space/¤ to ASCII space.
/// 5. Strip ASCII control characters (except TAB and LF).
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let nfc: String = text.nfc().collect();
    let nfc = nfc.replace("\r\n", "\n").replace('\r', "\n");

    let mut result = String::with_capacity(nfc.len());
    for ch in nfc.chars() {
        if REMOVE_CHARS.contains(&ch) {
            continue;
        }
        if NORMALIZE_TO_SPACE.contains(&ch) {
            result.push(' ');
            continue;
        }
        if is_strippable_control(ch) {
            continue;
        }
        result.push(ch);
    }
    result
}

/// Display-friendly rendering of `text_raw`, not stored in the DB.
/// Replaces `¤` with `" | "` to show segment boundaries visibly.
pub fn text_display(text_raw: &str) -> String {
    text_raw.replace(SEP_MARK, " | ")
}

/// Count `¤` separators in `text_raw` (for `meta_json.sep_count`).
pub fn count_sep(text_raw: &str) -> usize {
    text_raw.matches(SEP_MARK).count()
}

/// Hex SHA-256 of raw import bytes (for `source_hash`).
pub fn sha256_of_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
