pub mod engine;
pub mod rules;

use crate::errors::RouterError;
use crate::protocol::mysql::basic::Column;
use crate::masking::rules::RuleSet;
use tracing::debug;

/// Rewrites the value bytes of a single result-set row packet in
/// place, for every column that a rule in `rules` matches. `payload`
/// is the row packet's body (no 4-byte MySQL packet header). Column
/// values are length-encoded strings in `columns` order; a `0xfb`
/// length byte marks SQL NULL and is left untouched.
pub fn rewrite_row(payload: &mut [u8], columns: &[Column], rules: &RuleSet, user: &str, host: &str) {
    let mut offset = 0usize;
    for col in columns {
        if offset >= payload.len() {
            break;
        }
        let Some((value_start, value_len)) = length_encoded_span(&payload[offset..]) else {
            // NULL marker: a single 0xfb byte, nothing to rewrite.
            offset += 1;
            continue;
        };
        let abs_start = offset + value_start;
        let abs_end = abs_start + value_len;
        if abs_end > payload.len() {
            break;
        }
        if let Some(rule) = rules.matching_rule(col, user, host) {
            if engine::apply_rule(rule, &mut payload[abs_start..abs_end]) {
                common::metrics::counter_inc(
                    common::metrics::metric_def::ROUTER_MASKING_REWRITES,
                    1,
                    Some(common::metrics::common_labels()),
                );
            } else {
                let err = RouterError::RulesRewriteNop(col.org_name.clone());
                debug!(%err);
            }
        }
        offset = abs_end;
    }
}

/// Returns `(prefix_len, value_len)` for the length-encoded string
/// starting at `i[0]`, or `None` for a NULL (`0xfb`) marker.
fn length_encoded_span(i: &[u8]) -> Option<(usize, usize)> {
    let first = *i.first()?;
    match first {
        0xfb => None,
        0xfc => i.get(1..3).map(|b| (3, u16::from_le_bytes([b[0], b[1]]) as usize)),
        0xfd => i.get(1..4).map(|b| (4, (b[0] as usize) | (b[1] as usize) << 8 | (b[2] as usize) << 16)),
        0xfe => i
            .get(1..9)
            .map(|b| (9, u64::from_le_bytes(b.try_into().unwrap()) as usize)),
        n => Some((1, n as usize)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::rules::load_rules;
    use mysql_common::constants::{ColumnFlags, ColumnType};

    fn col(name: &str) -> Column {
        Column {
            table: "accounts".to_string(),
            column: name.to_string(),
            column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
            column_flags: ColumnFlags::empty(),
            schema: "app".to_string(),
            org_table: "accounts".to_string(),
            org_name: name.to_string(),
        }
    }

    #[test]
    fn rewrite_row_masks_matching_column_and_skips_null() {
        let text = r#"{"rules": [{"replace": {"column": "ssn", "with": {"value": "XXXXXXXXX", "fill": "X"}}}]}"#;
        let rules = RuleSet::new(load_rules(text).unwrap());
        let columns = vec![col("id"), col("ssn")];

        let mut row = Vec::new();
        row.push(0xfb); // id column is NULL
        row.push(9);
        row.extend_from_slice(b"123456789");

        rewrite_row(&mut row, &columns, &rules, "app", "localhost");

        assert_eq!(row[0], 0xfb);
        assert_eq!(&row[2..], b"XXXXXXXXX");
    }
}
