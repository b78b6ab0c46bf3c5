//! Session-scoped SQL applied lazily to pooled connections.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Setting {
    query: String,
    reset_query: String,
    without_db_name: bool,
}

impl Setting {
    pub fn new(query: impl Into<String>, reset_query: impl Into<String>) -> Self {
        Setting {
            query: query.into(),
            reset_query: reset_query.into(),
            without_db_name: false,
        }
    }

    /// Marks a setting whose connection must not select a default database.
    pub fn without_db_name(mut self) -> Self {
        self.without_db_name = true;
        self
    }

    /// Setting built from `set @@session.x = ...` statements; each variable is reset to its default.
    pub fn from_set_statements<S: AsRef<str>>(statements: &[S]) -> Self {
        static VAR: OnceLock<Regex> = OnceLock::new();
        let re = VAR.get_or_init(|| {
            Regex::new(r"(?i)^\s*set\s+(?:@@session\.|session\s+|@@)?`?([A-Za-z_][A-Za-z0-9_]*)`?\s*=")
                .expect("static regex")
        });
        let mut applies = Vec::new();
        let mut resets = Vec::new();
        for stmt in statements {
            let stmt = stmt.as_ref().trim().trim_end_matches(';');
            if stmt.is_empty() {
                continue;
            }
            applies.push(stmt.to_string());
            if let Some(var) = re.captures(stmt).and_then(|c| c.get(1)) {
                resets.push(format!("set @@session.{} = default", var.as_str()));
            }
        }
        Setting::new(applies.join("; "), resets.join("; "))
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn reset_query(&self) -> &str {
        &self.reset_query
    }

    pub fn is_without_db_name(&self) -> bool {
        self.without_db_name
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_statements_get_default_resets() {
        let s = Setting::from_set_statements(&[
            "set @@session.sql_mode = 'ANSI'",
            "SET time_zone = '+00:00';",
            "",
        ]);
        assert_eq!(s.query(), "set @@session.sql_mode = 'ANSI'; SET time_zone = '+00:00'");
        assert_eq!(
            s.reset_query(),
            "set @@session.sql_mode = default; set @@session.time_zone = default"
        );
        assert!(!s.is_empty());
        assert!(Setting::default().is_empty());
    }
}
