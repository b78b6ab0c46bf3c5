//! Named bind variables: rewrite `:name` to `?` and convert JSON values into MySQL parameters.

use regex::{Captures, Regex};
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::mysql::{MySql, MySqlTypeInfo};
use sqlx::{Database, Type};
use std::sync::OnceLock;

use super::BindVars;
use crate::error::{Code, TabletError};

/// A value that can be bound to a MySQL statement. Converts from serde_json::Value.
#[derive(Clone, Debug, PartialEq)]
pub enum MySqlBindValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Json(Value),
}

impl MySqlBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => MySqlBindValue::Null,
            Value::Bool(b) => MySqlBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MySqlBindValue::I64(i)
                } else if let Some(u) = n.as_u64() {
                    MySqlBindValue::U64(u)
                } else {
                    MySqlBindValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => MySqlBindValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => MySqlBindValue::Json(v.clone()),
        }
    }
}

impl<'q> Encode<'q, MySql> for MySqlBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <MySql as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            MySqlBindValue::Null => <Option<i64> as Encode<MySql>>::encode_by_ref(&None, buf)?,
            MySqlBindValue::Bool(b) => <bool as Encode<MySql>>::encode_by_ref(b, buf)?,
            MySqlBindValue::I64(n) => <i64 as Encode<MySql>>::encode_by_ref(n, buf)?,
            MySqlBindValue::U64(n) => <u64 as Encode<MySql>>::encode_by_ref(n, buf)?,
            MySqlBindValue::F64(n) => <f64 as Encode<MySql>>::encode_by_ref(n, buf)?,
            MySqlBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<MySql>>::encode_by_ref(&s_ref, buf)?
            }
            MySqlBindValue::Json(v) => {
                let text = v.to_string();
                <&str as Encode<MySql>>::encode_by_ref(&text.as_str(), buf)?
            }
        })
    }

    fn produces(&self) -> Option<MySqlTypeInfo> {
        Some(match self {
            MySqlBindValue::Null | MySqlBindValue::I64(_) => <i64 as Type<MySql>>::type_info(),
            MySqlBindValue::Bool(_) => <bool as Type<MySql>>::type_info(),
            MySqlBindValue::U64(_) => <u64 as Type<MySql>>::type_info(),
            MySqlBindValue::F64(_) => <f64 as Type<MySql>>::type_info(),
            MySqlBindValue::String(_) | MySqlBindValue::Json(_) => {
                <str as Type<MySql>>::type_info()
            }
        })
    }
}

impl Type<MySql> for MySqlBindValue {
    fn type_info() -> MySqlTypeInfo {
        <str as Type<MySql>>::type_info()
    }

    fn compatible(_ty: &MySqlTypeInfo) -> bool {
        true
    }
}

fn bind_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|`[^`]*`|(::?)([A-Za-z_][A-Za-z0-9_]*)"#,
        )
        .expect("static regex")
    })
}

/// Rewrites `:name` placeholders to `?` and `::name` list placeholders to `(?, ?, ...)`,
/// returning the parameters in statement order. Quoted text is left alone.
pub fn bind_positional(
    sql: &str,
    bind_vars: &BindVars,
) -> Result<(String, Vec<MySqlBindValue>), TabletError> {
    let mut params = Vec::new();
    let mut failure: Option<TabletError> = None;
    let rewritten = bind_pattern().replace_all(sql, |caps: &Captures| {
        let (Some(colons), Some(name)) = (caps.get(1), caps.get(2)) else {
            return caps[0].to_string();
        };
        let name = name.as_str();
        let Some(value) = bind_vars.get(name) else {
            failure.get_or_insert_with(|| {
                TabletError::new(Code::InvalidArgument, format!("missing bind var {}", name))
            });
            return caps[0].to_string();
        };
        if colons.as_str() == "::" {
            let Value::Array(items) = value else {
                failure.get_or_insert_with(|| {
                    TabletError::new(
                        Code::InvalidArgument,
                        format!("unexpected arg type for {}: expecting a list", name),
                    )
                });
                return caps[0].to_string();
            };
            if items.is_empty() {
                failure.get_or_insert_with(|| {
                    TabletError::new(
                        Code::InvalidArgument,
                        format!("empty list supplied for {}", name),
                    )
                });
                return caps[0].to_string();
            }
            params.extend(items.iter().map(MySqlBindValue::from_json));
            return format!("({})", vec!["?"; items.len()].join(", "));
        }
        params.push(MySqlBindValue::from_json(value));
        "?".to_string()
    });
    if let Some(err) = failure {
        return Err(err);
    }
    Ok((rewritten.into_owned(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> BindVars {
        serde_json::from_value(v).expect("bind vars")
    }

    #[test]
    fn named_placeholders_become_positional() {
        let bv = vars(json!({"id": 7, "name": "x"}));
        let (sql, params) =
            bind_positional("select * from t where id = :id and name = :name", &bv).expect("bind");
        assert_eq!(sql, "select * from t where id = ? and name = ?");
        assert_eq!(
            params,
            vec![MySqlBindValue::I64(7), MySqlBindValue::String("x".into())]
        );
    }

    #[test]
    fn quoted_text_is_not_rewritten() {
        let bv = vars(json!({"id": 1}));
        let (sql, params) =
            bind_positional("select ':id', \"a:b\", `c:d` from t where id = :id", &bv)
                .expect("bind");
        assert_eq!(sql, "select ':id', \"a:b\", `c:d` from t where id = ?");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn list_placeholders_expand() {
        let bv = vars(json!({"ids": [1, 2, 3]}));
        let (sql, params) = bind_positional("delete from t where id in ::ids", &bv).expect("bind");
        assert_eq!(sql, "delete from t where id in (?, ?, ?)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn missing_and_bad_lists_are_invalid_arguments() {
        let err = bind_positional("select :nope", &BindVars::new()).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("missing bind var nope"));

        let bv = vars(json!({"ids": []}));
        let err = bind_positional("select ::ids", &bv).unwrap_err();
        assert!(err.to_string().contains("empty list supplied for ids"));
    }

    #[test]
    fn json_values_convert() {
        assert_eq!(MySqlBindValue::from_json(&json!(null)), MySqlBindValue::Null);
        assert_eq!(MySqlBindValue::from_json(&json!(true)), MySqlBindValue::Bool(true));
        assert_eq!(
            MySqlBindValue::from_json(&json!(u64::MAX)),
            MySqlBindValue::U64(u64::MAX)
        );
        assert_eq!(MySqlBindValue::from_json(&json!(1.5)), MySqlBindValue::F64(1.5));
        assert!(matches!(
            MySqlBindValue::from_json(&json!({"a": 1})),
            MySqlBindValue::Json(_)
        ));
    }
}
