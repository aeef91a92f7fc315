//! Rewrites a single column payload in place according to a matched
//! rule's kind. Operates purely on bytes: length-encoded string
//! contents, already stripped of their length prefix by the caller.
use tracing::warn;

use crate::masking::rules::{MaskingRule, RuleKind};

/// Tiles `fill` across `payload`'s full length, truncating the final
/// copy of `fill` if it doesn't divide evenly.
fn tile_fill(payload: &mut [u8], fill: &[u8]) {
    if fill.is_empty() {
        return;
    }
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = fill[i % fill.len()];
    }
}

fn rot13_byte(b: u8) -> u8 {
    match b {
        b'a'..=b'z' => b'a' + (b - b'a' + 13) % 26,
        b'A'..=b'Z' => b'A' + (b - b'A' + 13) % 26,
        _ => b.saturating_add(32).min(127),
    }
}

/// Rewrites `payload` (the column's raw bytes) according to `rule`.
/// Returns `false` when no valid rewrite was possible — §7
/// RULES_REWRITE_NOP — in which case `payload` is left untouched.
pub fn apply_rule(rule: &MaskingRule, payload: &mut [u8]) -> bool {
    match &rule.kind {
        RuleKind::Replace { value, fill } => apply_replace(payload, value, fill),
        RuleKind::Obfuscate { .. } => {
            for b in payload.iter_mut() {
                *b = rot13_byte(*b);
            }
            true
        }
        RuleKind::Capture { regex, fill } => apply_capture(payload, regex, fill),
    }
}

fn apply_replace(payload: &mut [u8], value: &[u8], fill: &[u8]) -> bool {
    if value.len() == payload.len() {
        payload.copy_from_slice(value);
        return true;
    }
    if !fill.is_empty() {
        tile_fill(payload, fill);
        return true;
    }
    warn!("masking Replace rule produced no valid rewrite (length mismatch, empty fill)");
    false
}

/// Repeatedly matches `regex` against `payload` and tiles `fill` over
/// each non-empty match, preserving total length. A zero-length match
/// terminates the scan rather than looping forever at the same offset.
fn apply_capture(payload: &mut [u8], regex: &regex::Regex, fill: &[u8]) -> bool {
    if fill.is_empty() {
        warn!("masking Capture rule has an empty fill, leaving payload unchanged");
        return false;
    }
    let text = match std::str::from_utf8(payload) {
        Ok(t) => t,
        Err(_) => {
            warn!("masking Capture rule skipped non-UTF8 payload");
            return false;
        }
    };

    let mut rewritten = false;
    let mut offset = 0usize;
    let mut buf = payload.to_vec();
    while offset < text.len() {
        let Some(m) = regex.find_at(text, offset) else {
            break;
        };
        if m.end() == m.start() {
            break;
        }
        let span = m.start()..m.end();
        tile_fill(&mut buf[span.clone()], fill);
        rewritten = true;
        offset = m.end();
    }
    if rewritten {
        payload.copy_from_slice(&buf);
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::rules::load_rules;

    #[test]
    fn replace_exact_length_copies_value() {
        let text = r#"{"rules": [{"replace": {"column": "ssn", "with": {"value": "XXXXXXXXX", "fill": "X"}}}]}"#;
        let rules = load_rules(text).unwrap();
        let mut payload = b"123456789".to_vec();
        assert!(apply_rule(&rules[0], &mut payload));
        assert_eq!(&payload, b"XXXXXXXXX");
    }

    #[test]
    fn replace_mismatched_length_tiles_fill() {
        let text = r#"{"rules": [{"replace": {"column": "ssn", "with": {"value": "XXXXXXXXX", "fill": "X"}}}]}"#;
        let rules = load_rules(text).unwrap();
        let mut payload = b"42".to_vec();
        assert!(apply_rule(&rules[0], &mut payload));
        assert_eq!(&payload, b"XX");
    }

    #[test]
    fn obfuscate_letters_are_involutive() {
        // Spec invariant: applied twice, ASCII letters return to their
        // original byte; non-letters are only required to saturate at
        // 127, not to round-trip.
        let text = r#"{"rules": [{"obfuscate": {"column": "name"}}]}"#;
        let rules = load_rules(text).unwrap();
        let original = b"HelloWorld".to_vec();
        let mut payload = original.clone();
        apply_rule(&rules[0], &mut payload);
        apply_rule(&rules[0], &mut payload);
        assert_eq!(payload, original);
    }

    #[test]
    fn obfuscate_non_letter_saturates_at_127_not_255() {
        let text = r#"{"rules": [{"obfuscate": {"column": "name"}}]}"#;
        let rules = load_rules(text).unwrap();
        let mut payload = vec![200u8];
        apply_rule(&rules[0], &mut payload);
        assert_eq!(payload[0], 127);
    }

    #[test]
    fn capture_masks_digit_groups_preserving_length() {
        let text = r#"{"rules": [{"replace": {"column": "card", "capture": "\\d{4}", "with": {"fill": "*"}}}]}"#;
        let rules = load_rules(text).unwrap();
        let mut payload = b"card 1234 5678 end".to_vec();
        let before_len = payload.len();
        assert!(apply_rule(&rules[0], &mut payload));
        assert_eq!(payload.len(), before_len);
        assert_eq!(&payload, b"card **** **** end");
    }

    #[test]
    fn capture_with_no_match_reports_nop() {
        let text = r#"{"rules": [{"replace": {"column": "card", "capture": "\\d{4}", "with": {"fill": "*"}}}]}"#;
        let rules = load_rules(text).unwrap();
        let mut payload = b"no digits here".to_vec();
        assert!(!apply_rule(&rules[0], &mut payload));
        assert_eq!(&payload, b"no digits here");
    }
}
