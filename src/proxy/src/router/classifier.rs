//! Decides what a command packet *means* for routing, without parsing
//! SQL any further than that. Mirrors the kind of lightweight text
//! sniffing MariaDB's own classifier does for routing purposes (it
//! never builds a full parse tree either) — here it is cheap regex and
//! substring matching over the query text.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::UseSqlVariablesIn;
use crate::errors::RouterError;
use crate::protocol::mysql::basic::Command;
use crate::protocol::mysql::constants::CommandCode;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RouteTarget: u8 {
        const MASTER = 0b0001;
        const SLAVE  = 0b0010;
        const ALL    = Self::MASTER.bits() | Self::SLAVE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDataState {
    Inactive,
    Start,
    Active,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempTableAction {
    Create,
    Drop,
}

#[derive(Debug)]
pub struct Classification {
    pub command: CommandCode,
    pub target_mask: RouteTarget,
    pub is_session_modifying: bool,
    pub is_read_only: bool,
    pub is_multi_stmt: bool,
    pub starts_load_data: bool,
    pub ends_load_data: bool,
    pub touches_temp_table: bool,
    pub needs_broadcast: bool,
    /// Set when this statement must be synthesized an ERR and never
    /// routed anywhere — the bug694 user-variable-modifying SELECT case.
    pub rejected: Option<RouterError>,
    /// A temp-table name this statement creates or drops, for the
    /// router session to fold into its temp-table set.
    pub temp_table_action: Option<(TempTableAction, String)>,
}

/// What the classifier needs to know about the session besides the
/// packet itself.
pub struct ClassifierContext<'a> {
    pub temp_tables: &'a std::collections::HashSet<String>,
    pub load_data_state: LoadDataState,
    pub strict_multi_stmt: bool,
    pub use_sql_variables_in: UseSqlVariablesIn,
    pub sticky_master: bool,
}

static USER_VAR_ASSIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)@[a-z0-9_.$]+\s*:=").unwrap());
static TEMP_TABLE_CREATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*create\s+(?:temporary|global\s+temporary)\s+table\s+(?:if\s+not\s+exists\s+)?`?([a-z0-9_.$]+)`?").unwrap()
});
static TEMP_TABLE_DROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*drop\s+(?:temporary\s+)?table\s+(?:if\s+exists\s+)?`?([a-z0-9_.$]+)`?")
        .unwrap()
});
static BEGIN_TXN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(begin|start\s+transaction)\b").unwrap());
static END_TXN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(commit|rollback)\b").unwrap());

pub fn is_begin_transaction(stmt: &str) -> bool {
    BEGIN_TXN.is_match(stmt)
}

pub fn is_end_transaction(stmt: &str) -> bool {
    END_TXN.is_match(stmt)
}

/// First top-level statement of a (possibly multi-statement) COM_QUERY
/// payload's text, used by callers that need to sniff transaction
/// boundaries without re-running the full classifier.
pub fn first_statement_text(payload: &[u8]) -> String {
    if payload.first() != Some(&(CommandCode::ComQuery as u8)) {
        return String::new();
    }
    let sql = String::from_utf8_lossy(&payload[1..]);
    split_statements(&sql)
        .first()
        .map(|s| s.to_string())
        .unwrap_or_default()
}
static WRITE_STMT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(insert|update|delete|replace|create|drop|alter|truncate|grant|revoke|lock\s+tables)\b").unwrap()
});
static LOAD_DATA_LOCAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*load\s+data\s+local\s+infile\b").unwrap());
static SESSION_MODIFYING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(set\b|use\b|set\s+names\b|set\s+character\s+set\b)").unwrap());

/// Splits top-level statements on `;`. Deliberately naive — quoted
/// strings and comments are not accounted for, matching the
/// classifier's license to do routing-only text sniffing rather than
/// full SQL parsing.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_pure_select(stmt: &str) -> bool {
    stmt.trim_start().get(0..6).map_or(false, |head| {
        head.eq_ignore_ascii_case("select")
    })
}

fn references_temp_table(sql: &str, temp_tables: &std::collections::HashSet<String>) -> bool {
    if temp_tables.is_empty() {
        return false;
    }
    let lower = sql.to_ascii_lowercase();
    temp_tables
        .iter()
        .any(|t| lower.contains(t.to_ascii_lowercase().as_str()))
}

pub fn classify_packet(payload: &[u8], ctx: &ClassifierContext<'_>) -> Classification {
    if let Ok((_, command)) = crate::protocol::mysql::basic::from_packet(payload) {
        return classify_command(command, ctx);
    }
    // Commands the winnow grammar doesn't cover explicitly (ComInitDB,
    // ComChangeUser, etc.) fall through to a code-only classification.
    let code = payload
        .first()
        .and_then(|b| num_traits::FromPrimitive::from_u8(*b))
        .unwrap_or(CommandCode::ComSleep);
    classify_by_code(code, &[], ctx)
}

fn classify_command(command: Command<'_>, ctx: &ClassifierContext<'_>) -> Classification {
    match command {
        Command::Query(sql) => classify_query(sql, ctx),
        Command::Init(_) => classify_by_code(CommandCode::ComInitDB, &[], ctx),
        Command::Prepare(sql) => classify_by_code(CommandCode::ComStmtPrepare, sql, ctx),
        Command::Execute { .. } => classify_by_code(CommandCode::ComStmtExecute, &[], ctx),
        Command::SendLongData { .. } => {
            classify_by_code(CommandCode::ComStmtSendLongData, &[], ctx)
        }
        Command::Close(_) => classify_by_code(CommandCode::ComStmtClose, &[], ctx),
        Command::ListFields(_) => classify_by_code(CommandCode::ComFieldList, &[], ctx),
        Command::Ping => classify_by_code(CommandCode::ComPing, &[], ctx),
        Command::Quit => classify_by_code(CommandCode::ComQuit, &[], ctx),
    }
}

fn classify_by_code(code: CommandCode, text: &[u8], ctx: &ClassifierContext<'_>) -> Classification {
    let sql = String::from_utf8_lossy(text);
    let session_modifying = matches!(
        code,
        CommandCode::ComInitDB
            | CommandCode::ComChangeUser
            | CommandCode::ComStmtPrepare
            | CommandCode::ComResetConnection
    );
    Classification {
        command: code,
        target_mask: if session_modifying {
            RouteTarget::ALL
        } else {
            RouteTarget::MASTER
        },
        is_session_modifying: session_modifying,
        is_read_only: false,
        is_multi_stmt: false,
        starts_load_data: false,
        ends_load_data: false,
        touches_temp_table: references_temp_table(&sql, ctx.temp_tables),
        needs_broadcast: session_modifying,
        rejected: None,
        temp_table_action: None,
    }
}

fn classify_query(sql: &[u8], ctx: &ClassifierContext<'_>) -> Classification {
    let sql = String::from_utf8_lossy(sql);

    if ctx.load_data_state == LoadDataState::Active {
        // Raw data packet belonging to an in-flight LOAD DATA LOCAL
        // INFILE: forward to master, no classification needed.
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: RouteTarget::MASTER,
            is_session_modifying: false,
            is_read_only: false,
            is_multi_stmt: false,
            starts_load_data: false,
            ends_load_data: sql.is_empty(),
            touches_temp_table: false,
            needs_broadcast: false,
            rejected: None,
            temp_table_action: None,
        };
    }

    let statements = split_statements(&sql);
    let is_multi_stmt = statements.len() > 1;
    let first = statements.first().copied().unwrap_or("");

    if SESSION_MODIFYING.is_match(first) {
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: RouteTarget::ALL,
            is_session_modifying: true,
            is_read_only: false,
            is_multi_stmt,
            starts_load_data: false,
            ends_load_data: false,
            touches_temp_table: false,
            needs_broadcast: true,
            rejected: None,
            temp_table_action: None,
        };
    }

    if LOAD_DATA_LOCAL.is_match(first) {
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: RouteTarget::MASTER,
            is_session_modifying: false,
            is_read_only: false,
            is_multi_stmt,
            starts_load_data: true,
            ends_load_data: false,
            touches_temp_table: false,
            needs_broadcast: false,
            rejected: None,
            temp_table_action: None,
        };
    }

    if let Some(caps) = TEMP_TABLE_CREATE.captures(first) {
        let name = caps.get(1).unwrap().as_str().to_string();
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: RouteTarget::MASTER,
            is_session_modifying: false,
            is_read_only: false,
            is_multi_stmt,
            starts_load_data: false,
            ends_load_data: false,
            touches_temp_table: true,
            needs_broadcast: false,
            rejected: None,
            temp_table_action: Some((TempTableAction::Create, name)),
        };
    }
    if let Some(caps) = TEMP_TABLE_DROP.captures(first) {
        let name = caps.get(1).unwrap().as_str().to_string();
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: RouteTarget::MASTER,
            is_session_modifying: false,
            is_read_only: false,
            is_multi_stmt,
            starts_load_data: false,
            ends_load_data: false,
            touches_temp_table: true,
            needs_broadcast: false,
            rejected: None,
            temp_table_action: Some((TempTableAction::Drop, name)),
        };
    }

    let is_select = is_pure_select(first);
    if is_select {
        if ctx.use_sql_variables_in == UseSqlVariablesIn::All
            && USER_VAR_ASSIGN.is_match(first)
        {
            return Classification {
                command: CommandCode::ComQuery,
                target_mask: RouteTarget::empty(),
                is_session_modifying: false,
                is_read_only: true,
                is_multi_stmt,
                starts_load_data: false,
                ends_load_data: false,
                touches_temp_table: false,
                needs_broadcast: false,
                rejected: Some(RouterError::ClassificationReject(
                    "SELECT with session data modification is not supported".to_string(),
                )),
                temp_table_action: None,
            };
        }

        let touches_temp = references_temp_table(first, ctx.temp_tables);
        let sticky = ctx.sticky_master || (is_multi_stmt && ctx.strict_multi_stmt);
        let target = if touches_temp || sticky {
            RouteTarget::MASTER
        } else {
            RouteTarget::SLAVE
        };
        return Classification {
            command: CommandCode::ComQuery,
            target_mask: target,
            is_session_modifying: false,
            is_read_only: true,
            is_multi_stmt,
            starts_load_data: false,
            ends_load_data: false,
            touches_temp_table: touches_temp,
            needs_broadcast: false,
            rejected: None,
            temp_table_action: None,
        };
    }

    let is_write = WRITE_STMT.is_match(first) || BEGIN_TXN.is_match(first);
    let _ = is_write;
    Classification {
        command: CommandCode::ComQuery,
        target_mask: RouteTarget::MASTER,
        is_session_modifying: false,
        is_read_only: false,
        is_multi_stmt,
        starts_load_data: false,
        ends_load_data: false,
        touches_temp_table: references_temp_table(first, ctx.temp_tables),
        needs_broadcast: false,
        rejected: None,
        temp_table_action: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ctx(temp_tables: &HashSet<String>) -> ClassifierContext<'_> {
        ClassifierContext {
            temp_tables,
            load_data_state: LoadDataState::Inactive,
            strict_multi_stmt: false,
            use_sql_variables_in: UseSqlVariablesIn::Master,
            sticky_master: false,
        }
    }

    fn query_packet(sql: &str) -> Vec<u8> {
        let mut p = vec![CommandCode::ComQuery as u8];
        p.extend(sql.as_bytes());
        p
    }

    #[test]
    fn plain_select_targets_slave() {
        let temps = HashSet::new();
        let c = classify_packet(&query_packet("SELECT 1"), &ctx(&temps));
        assert_eq!(c.target_mask, RouteTarget::SLAVE);
        assert!(c.is_read_only);
    }

    #[test]
    fn write_targets_master() {
        let temps = HashSet::new();
        let c = classify_packet(&query_packet("INSERT INTO t VALUES (1)"), &ctx(&temps));
        assert_eq!(c.target_mask, RouteTarget::MASTER);
        assert!(!c.is_read_only);
    }

    #[test]
    fn bug694_user_variable_select_is_rejected() {
        let temps = HashSet::new();
        let mut c = ctx(&temps);
        c.use_sql_variables_in = UseSqlVariablesIn::All;
        let classification = classify_packet(&query_packet("SELECT @a:=@a+1 as a, test.b FROM test"), &c);
        assert!(classification.rejected.is_some());
        assert!(classification.target_mask.is_empty());
    }

    #[test]
    fn create_temp_table_is_recorded() {
        let temps = HashSet::new();
        let c = classify_packet(&query_packet("CREATE TEMPORARY TABLE scratch (x int)"), &ctx(&temps));
        assert_eq!(
            c.temp_table_action,
            Some((TempTableAction::Create, "scratch".to_string()))
        );
    }

    #[test]
    fn select_referencing_temp_table_targets_master() {
        let mut temps = HashSet::new();
        temps.insert("test".to_string());
        let c = classify_packet(&query_packet("SELECT @a:=@a+1 as a, test.b FROM test"), &ctx(&temps));
        assert_eq!(c.target_mask, RouteTarget::MASTER);
    }

    #[test]
    fn multi_stmt_with_strict_flag_goes_to_master() {
        let temps = HashSet::new();
        let mut c = ctx(&temps);
        c.strict_multi_stmt = true;
        let classification = classify_packet(&query_packet("SELECT 1; SELECT 2;"), &c);
        assert!(classification.is_multi_stmt);
        assert_eq!(classification.target_mask, RouteTarget::MASTER);
    }
}
