//! Typed errors, the MySQL errno table, and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Stable error taxonomy surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    ClusterEvent,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Canceled => "CANCELED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::ClusterEvent => "CLUSTER_EVENT",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MySQL server and client error numbers referenced by name.
pub mod errno {
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_BAD_DB: u16 = 1049;
    pub const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;
    pub const ER_SPECIFIED_ACCESS_DENIED: u16 = 1227;
    pub const ER_ACCESS_DENIED: u16 = 1045;
    pub const ER_CON_COUNT: u16 = 1040;
    pub const ER_SERVER_SHUTDOWN: u16 = 1053;
    pub const ER_READ_ONLY_TRANSACTION: u16 = 1207;
    pub const CR_UNKNOWN_ERROR: u16 = 2000;
    pub const CR_CONNECTION_ERROR: u16 = 2002;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_NAMED_PIPE_STATE_ERROR: u16 = 2018;
}

/// SQLSTATE used when the server did not report one.
pub const SS_UNKNOWN_SQL_STATE: &str = "HY000";

/// An error reported by MySQL, keeping errno and sqlstate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (errno {number}) (sqlstate {state})")]
pub struct SqlError {
    pub number: u16,
    pub state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(number: u16, state: impl Into<String>, message: impl Into<String>) -> Self {
        SqlError {
            number,
            state: state.into(),
            message: message.into(),
        }
    }

    /// Recover an errno/sqlstate pair embedded in error text, e.g.
    /// `Duplicate entry '1' (errno 1062) (sqlstate 23000)`.
    pub fn parse(text: &str) -> Option<SqlError> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"\(errno (\d+)\) \(sqlstate ([0-9A-Za-z]{5})\)").expect("static regex")
        });
        let caps = re.captures(text)?;
        let number = caps.get(1)?.as_str().parse::<u16>().ok()?;
        let state = caps.get(2)?.as_str().to_string();
        let start = caps.get(0)?.start();
        let message = text[..start].trim_end().to_string();
        Some(SqlError {
            number,
            state,
            message,
        })
    }

    /// Client-level errors that mean the connection itself is unusable.
    pub fn is_conn_err(&self) -> bool {
        if self.number == errno::ER_CON_COUNT {
            return false;
        }
        (errno::CR_UNKNOWN_ERROR..=errno::CR_NAMED_PIPE_STATE_ERROR).contains(&self.number)
            || self.number == errno::ER_QUERY_INTERRUPTED
    }

    /// Errors that indicate MySQL itself may be down, worth a reachability probe.
    pub fn suggests_mysql_down(&self) -> bool {
        matches!(
            self.number,
            errno::CR_CONNECTION_ERROR | errno::CR_CONN_HOST_ERROR | errno::CR_SERVER_GONE
        )
    }

    pub fn code(&self) -> Code {
        match self.number {
            1235 => Code::Unimplemented,
            1021 | 1037 | 1038 | 1040 | 1041 | 1114 | 1129 | 1135 | 1151 | 1153 | 1203 | 1206
            | 1226 => Code::ResourceExhausted,
            1205 => Code::DeadlineExceeded,
            2006 | 1053 | 3168 | 2002 | 2003 => Code::Unavailable,
            1029 | 1032 | 1054 | 1094 | 1109 | 1122 | 1141 | 1146 | 1147 | 1176 => Code::NotFound,
            1044 | 1045 | 1095 | 1211 => Code::PermissionDenied,
            1046 | 1082 | 1091 | 1099 | 1100 | 1104 | 1148 | 1162 | 1165 | 1169 | 1173 | 1179
            | 1207 | 1215 | 1216 | 1217 | 1223 | 1230 | 1241 | 1242 | 1288 | 1289 | 1291
            | 1451 | 1452 | 1264 => Code::FailedPrecondition,
            1290 => Code::ClusterEvent,
            1050 | 1062 | 1086 | 1125 => Code::AlreadyExists,
            1078 | 1080 | 1152 | 1213 => Code::Aborted,
            1047 | 1048 | 1049 | 1051 | 1052 | 1055 | 1056 | 1057 | 1058 | 1059 | 1060 | 1061
            | 1063 | 1064 | 1065 | 1066 | 1067 | 1068 | 1069 | 1070 | 1071 | 1072 | 1073
            | 1074 | 1075 | 1083 | 1084 | 1085 | 1089 | 1090 | 1093 | 1096 | 1097 | 1101
            | 1102 | 1103 | 1106 | 1107 | 1108 | 1110 | 1111 | 1113 | 1115 | 1116 | 1117
            | 1118 | 1120 | 1121 | 1128 | 1136 | 1138 | 1139 | 1140 | 1144 | 1149 | 1166
            | 1167 | 1170 | 1171 | 1172 | 1193 | 1204 | 1210 | 1221 | 1222 | 1225 | 1228
            | 1229 | 1231 | 1232 | 1233 | 1234 | 1238 | 1239 | 1240 | 1245 | 1247 | 1248
            | 1250 | 1253 | 1267 | 1270 | 1271 | 1272 | 1273 | 1280 | 1281 | 1283 | 1292
            | 1293 | 1294 | 1298 | 1300 | 1366 | 1367 | 1406 | 1690 => Code::InvalidArgument,
            1227 => {
                if self.message.contains("failover in progress") {
                    Code::FailedPrecondition
                } else {
                    Code::PermissionDenied
                }
            }
            2013 => Code::Canceled,
            _ => Code::Unknown,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TabletError {
    #[error("{message}")]
    Status { code: Code, message: String },
    #[error(transparent)]
    Sql(#[from] SqlError),
}

impl TabletError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        TabletError::Status {
            code,
            message: message.into(),
        }
    }

    /// Code after running MySQL errors through the errno table.
    pub fn code(&self) -> Code {
        match self {
            TabletError::Status { code, .. } => *code,
            TabletError::Sql(e) => e.code(),
        }
    }

    pub fn as_sql(&self) -> Option<&SqlError> {
        match self {
            TabletError::Sql(e) => Some(e),
            TabletError::Status { .. } => None,
        }
    }
}

impl From<sqlx::Error> for TabletError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::mysql::MySqlDatabaseError;
        match &err {
            sqlx::Error::Database(db) => {
                if let Some(my) = db.try_downcast_ref::<MySqlDatabaseError>() {
                    return TabletError::Sql(SqlError::new(
                        my.number(),
                        my.code().unwrap_or(SS_UNKNOWN_SQL_STATE),
                        my.message(),
                    ));
                }
                TabletError::new(Code::Unknown, db.message().to_string())
            }
            sqlx::Error::Io(e) => TabletError::Sql(SqlError::new(
                errno::CR_SERVER_LOST,
                SS_UNKNOWN_SQL_STATE,
                format!("Lost connection to MySQL server during query: {}", e),
            )),
            sqlx::Error::Tls(e) => TabletError::Sql(SqlError::new(
                errno::CR_CONNECTION_ERROR,
                SS_UNKNOWN_SQL_STATE,
                format!("Can't connect to MySQL server: {}", e),
            )),
            sqlx::Error::PoolTimedOut => TabletError::new(Code::ResourceExhausted, err.to_string()),
            sqlx::Error::RowNotFound => TabletError::new(Code::NotFound, err.to_string()),
            _ => {
                let text = err.to_string();
                match SqlError::parse(&text) {
                    Some(sql) => TabletError::Sql(sql),
                    None => TabletError::new(Code::Unknown, text),
                }
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for TabletError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::FailedPrecondition | Code::ClusterEvent => StatusCode::PRECONDITION_FAILED,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Canceled | Code::Unknown | Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table_maps_common_errors() {
        let cases = [
            (errno::ER_DUP_ENTRY, Code::AlreadyExists),
            (errno::ER_LOCK_DEADLOCK, Code::Aborted),
            (errno::ER_LOCK_WAIT_TIMEOUT, Code::DeadlineExceeded),
            (errno::ER_PARSE_ERROR, Code::InvalidArgument),
            (errno::ER_NO_SUCH_TABLE, Code::NotFound),
            (errno::ER_OPTION_PREVENTS_STATEMENT, Code::ClusterEvent),
            (errno::ER_READ_ONLY_TRANSACTION, Code::FailedPrecondition),
            (errno::CR_SERVER_GONE, Code::Unavailable),
            (errno::CR_SERVER_LOST, Code::Canceled),
            (errno::ER_CON_COUNT, Code::ResourceExhausted),
            (errno::ER_NOT_SUPPORTED_YET, Code::Unimplemented),
            (9999, Code::Unknown),
        ];
        for (number, want) in cases {
            let err = SqlError::new(number, "HY000", "boom");
            assert_eq!(err.code(), want, "errno {}", number);
        }
    }

    #[test]
    fn specified_access_denied_during_failover_is_failed_precondition() {
        let plain = SqlError::new(errno::ER_SPECIFIED_ACCESS_DENIED, "42000", "denied");
        assert_eq!(plain.code(), Code::PermissionDenied);
        let failover = SqlError::new(
            errno::ER_SPECIFIED_ACCESS_DENIED,
            "42000",
            "failover in progress",
        );
        assert_eq!(failover.code(), Code::FailedPrecondition);
    }

    #[test]
    fn parse_recovers_errno_from_text() {
        let err = SqlError::parse("Duplicate entry '1' for key 'PRIMARY' (errno 1062) (sqlstate 23000) during query")
            .expect("parsed");
        assert_eq!(err.number, 1062);
        assert_eq!(err.state, "23000");
        assert_eq!(err.message, "Duplicate entry '1' for key 'PRIMARY'");
        assert!(SqlError::parse("no errno here").is_none());
    }

    #[test]
    fn conn_errors_are_detected() {
        assert!(SqlError::new(errno::CR_SERVER_GONE, "HY000", "gone").is_conn_err());
        assert!(SqlError::new(errno::ER_QUERY_INTERRUPTED, "70100", "interrupted").is_conn_err());
        assert!(!SqlError::new(errno::ER_DUP_ENTRY, "23000", "dup").is_conn_err());
    }

    #[test]
    fn sql_error_display_keeps_errno_and_state() {
        let err = TabletError::from(SqlError::new(1062, "23000", "Duplicate entry"));
        assert_eq!(err.to_string(), "Duplicate entry (errno 1062) (sqlstate 23000)");
        assert_eq!(err.code(), Code::AlreadyExists);
    }
}
