//! MySQL server error numbers and SQLSTATEs, as needed for synthesizing
//! ERR packets the proxy itself originates (auth failures, routing
//! failures, rejected statements) rather than packets forwarded from a
//! real backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_ACCESS_DENIED_NO_PASSWORD_ERROR = 1698,
    ER_DBACCESS_DENIED_ERROR = 1044,
    ER_BAD_DB_ERROR = 1049,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_NO_SUCH_TABLE = 1146,
    ER_OPTION_PREVENTS_STATEMENT = 1290,
    ER_CONNECTION_KILLED = 1927,
    ER_SERVER_SHUTDOWN = 1053,
    /// Synthesized when the classifier marks a statement CLASSIFICATION_REJECT.
    ER_UNKNOWN_ERROR = 1105,
}

impl ErrorKind {
    /// Five-byte SQLSTATE that accompanies this error number on the wire,
    /// matching the codes MariaDB itself emits for the same condition.
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR
            | ErrorKind::ER_ACCESS_DENIED_NO_PASSWORD_ERROR
            | ErrorKind::ER_DBACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_BAD_DB_ERROR | ErrorKind::ER_NO_SUCH_TABLE => b"42000",
            ErrorKind::ER_UNKNOWN_COM_ERROR => b"08S01",
            ErrorKind::ER_OPTION_PREVENTS_STATEMENT => b"HY000",
            ErrorKind::ER_CONNECTION_KILLED | ErrorKind::ER_SERVER_SHUTDOWN => b"08S01",
            ErrorKind::ER_UNKNOWN_ERROR => b"HY000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_uses_28000() {
        assert_eq!(ErrorKind::ER_ACCESS_DENIED_ERROR.sqlstate(), b"28000");
    }
}
