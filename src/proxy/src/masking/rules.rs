//! Declarative masking rules: load a JSON rule file and decide, for a
//! given column-def and connected account, whether a rule applies.
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;

use crate::errors::RouterError;
use crate::protocol::mysql::basic::Column;

#[derive(Debug, Clone)]
pub enum RuleKind {
    Replace { value: Vec<u8>, fill: Vec<u8> },
    Obfuscate { fill: Vec<u8> },
    Capture { regex: Regex, fill: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct AccountMatcher {
    /// `None` means "matches any user"/"matches any host".
    user: Option<AccountPart>,
    host: Option<AccountPart>,
}

#[derive(Debug, Clone)]
enum AccountPart {
    Literal(String),
    Wildcard(Regex),
}

impl AccountPart {
    fn matches(&self, value: &str) -> bool {
        match self {
            AccountPart::Literal(s) => s.eq_ignore_ascii_case(value),
            AccountPart::Wildcard(re) => re.is_match(value),
        }
    }
}

fn wildcard_to_regex(pattern: &str) -> Regex {
    let mut out = String::from("(?i)^");
    let mut literal = String::new();
    let flush = |literal: &mut String, out: &mut String| {
        if !literal.is_empty() {
            out.push_str(&regex::escape(literal));
            literal.clear();
        }
    };
    for c in pattern.chars() {
        match c {
            '%' => {
                flush(&mut literal, &mut out);
                out.push_str(".*");
            }
            '_' => {
                flush(&mut literal, &mut out);
                out.push('.');
            }
            c => literal.push(c),
        }
    }
    flush(&mut literal, &mut out);
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

impl AccountMatcher {
    /// Parses a `user@host` specifier. Either side may carry `%`/`_`
    /// wildcards, in which case it is compiled to a regex; otherwise it
    /// is compared byte-for-byte (case-insensitively, matching MySQL's
    /// own account-name comparison).
    pub fn parse(spec: &str) -> Self {
        let (user_part, host_part) = spec.split_once('@').unwrap_or((spec, "%"));
        AccountMatcher {
            user: compile_part(user_part),
            host: compile_part(host_part),
        }
    }

    pub fn matches(&self, user: &str, host: &str) -> bool {
        self.user.as_ref().map_or(true, |p| p.matches(user))
            && self.host.as_ref().map_or(true, |p| p.matches(host))
    }
}

fn compile_part(spec: &str) -> Option<AccountPart> {
    if spec == "%" || spec.is_empty() {
        return None;
    }
    if spec.contains('%') || spec.contains('_') {
        Some(AccountPart::Wildcard(wildcard_to_regex(spec)))
    } else {
        Some(AccountPart::Literal(spec.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct MaskingRule {
    pub column: String,
    pub table: Option<String>,
    pub database: Option<String>,
    pub applies_to: Vec<AccountMatcher>,
    pub exempted: Vec<AccountMatcher>,
    pub kind: RuleKind,
}

impl MaskingRule {
    pub fn matches_column(&self, col: &Column) -> bool {
        if col.org_name != self.column {
            return false;
        }
        if let Some(table) = &self.table {
            if !table.is_empty() && *table != col.org_table {
                return false;
            }
        }
        if let Some(db) = &self.database {
            if !db.is_empty() && *db != col.schema {
                return false;
            }
        }
        true
    }

    pub fn matches_account(&self, user: &str, host: &str) -> bool {
        if !self.applies_to.is_empty() && !self.applies_to.iter().any(|a| a.matches(user, host)) {
            return false;
        }
        if self.exempted.iter().any(|a| a.matches(user, host)) {
            return false;
        }
        true
    }
}

// --- JSON wire format -------------------------------------------------

#[derive(Debug, Deserialize)]
struct RulesFile {
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    replace: Option<RawReplace>,
    #[serde(default)]
    obfuscate: Option<RawObfuscate>,
    #[serde(default)]
    applies_to: Vec<String>,
    #[serde(default)]
    exempted: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawReplace {
    column: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    capture: Option<String>,
    with: RawWith,
}

#[derive(Debug, Deserialize)]
struct RawObfuscate {
    column: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    database: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawWith {
    #[serde(default = "default_fill")]
    fill: String,
    #[serde(default)]
    value: Option<String>,
}

fn default_fill() -> String {
    "X".to_string()
}

/// Parses a masking rules file. On any malformed input the caller is
/// expected to refuse the load and keep the previously active ruleset
/// — this function only ever returns `Ok` for a fully valid document.
pub fn load_rules(text: &str) -> Result<Vec<MaskingRule>, RouterError> {
    let file: RulesFile =
        serde_json::from_str(text).map_err(|e| RouterError::RulesParse(e.to_string()))?;

    file.rules.into_iter().map(compile_rule).collect()
}

fn compile_accounts(specs: &[String]) -> Vec<AccountMatcher> {
    specs.iter().map(|s| AccountMatcher::parse(s)).collect()
}

fn compile_rule(raw: RawRule) -> Result<MaskingRule, RouterError> {
    match (raw.replace, raw.obfuscate) {
        (Some(replace), None) => {
            let fill = replace.with.fill.clone().into_bytes();
            if fill.is_empty() {
                return Err(RouterError::RulesParse(
                    "masking rule `fill` must be non-empty".to_string(),
                ));
            }
            let kind = if let Some(pattern) = &replace.capture {
                let compiled = Regex::new(pattern)
                    .map_err(|e| RouterError::RulesParse(format!("bad capture regex: {e}")))?;
                RuleKind::Capture {
                    regex: compiled,
                    fill,
                }
            } else {
                let value = replace
                    .with
                    .value
                    .clone()
                    .ok_or_else(|| {
                        RouterError::RulesParse(
                            "replace rule requires `with.value`".to_string(),
                        )
                    })?
                    .into_bytes();
                if value.is_empty() {
                    return Err(RouterError::RulesParse(
                        "replace rule `value` must be non-empty".to_string(),
                    ));
                }
                RuleKind::Replace { value, fill }
            };
            Ok(MaskingRule {
                column: replace.column,
                table: replace.table,
                database: replace.database,
                applies_to: compile_accounts(&raw.applies_to),
                exempted: compile_accounts(&raw.exempted),
                kind,
            })
        }
        (None, Some(obfuscate)) => Ok(MaskingRule {
            column: obfuscate.column,
            table: obfuscate.table,
            database: obfuscate.database,
            applies_to: compile_accounts(&raw.applies_to),
            exempted: compile_accounts(&raw.exempted),
            kind: RuleKind::Obfuscate {
                fill: b"X".to_vec(),
            },
        }),
        (Some(_), Some(_)) => Err(RouterError::RulesParse(
            "rule must carry exactly one of `replace` or `obfuscate`".to_string(),
        )),
        (None, None) => Err(RouterError::RulesParse(
            "rule must carry `replace` or `obfuscate`".to_string(),
        )),
    }
}

/// Rule set held by the session; atomically swapped on a successful
/// reload, left untouched on a parse failure (§7 RULES_PARSE).
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<MaskingRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<MaskingRule>) -> Self {
        RuleSet { rules }
    }

    pub fn rules(&self) -> &[MaskingRule] {
        &self.rules
    }

    pub fn matching_rule(&self, col: &Column, user: &str, host: &str) -> Option<&MaskingRule> {
        self.rules
            .iter()
            .find(|r| r.matches_column(col) && r.matches_account(user, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(schema: &str, table: &str, name: &str) -> Column {
        Column {
            table: table.to_string(),
            column: name.to_string(),
            column_type: mysql_common::constants::ColumnType::MYSQL_TYPE_VAR_STRING,
            column_flags: mysql_common::constants::ColumnFlags::empty(),
            schema: schema.to_string(),
            org_table: table.to_string(),
            org_name: name.to_string(),
        }
    }

    #[test]
    fn loads_replace_rule() {
        let text = r#"{
            "rules": [
                { "replace": { "column": "ssn", "table": "users", "with": { "value": "XXXXXXXXX", "fill": "X" } } }
            ]
        }"#;
        let rules = load_rules(text).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].matches_column(&col("mydb", "users", "ssn")));
        assert!(!rules[0].matches_column(&col("mydb", "other", "ssn")));
    }

    #[test]
    fn rejects_empty_fill() {
        let text = r#"{"rules": [{"replace": {"column": "ssn", "with": {"value": "X", "fill": ""}}}]}"#;
        assert!(load_rules(text).is_err());
    }

    #[test]
    fn account_wildcard_matches_host_suffix() {
        let matcher = AccountMatcher::parse("app@%.internal");
        assert!(matcher.matches("app", "db1.internal"));
        assert!(!matcher.matches("app", "db1.external"));
    }

    #[test]
    fn exempted_account_overrides_applies_to() {
        let text = r#"{
            "rules": [
                { "replace": { "column": "ssn", "with": { "value": "XXXXXXXXX" } },
                  "applies_to": ["%@%"], "exempted": ["admin@%"] }
            ]
        }"#;
        let rules = load_rules(text).unwrap();
        assert!(!rules[0].matches_account("admin", "localhost"));
        assert!(rules[0].matches_account("app", "localhost"));
    }

    #[test]
    fn capture_rule_parses_regex() {
        let text = r#"{"rules": [{"replace": {"column": "card", "capture": "\\d{4}", "with": {"fill": "*"}}}]}"#;
        let rules = load_rules(text).unwrap();
        assert!(matches!(rules[0].kind, RuleKind::Capture { .. }));
    }
}
