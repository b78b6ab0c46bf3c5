//! Table ACL: which callers may read, write or administer which tables.
//!
//! Groups come from a JSON file:
//!
//! ```json
//! {"table_groups": [{"name": "msgs", "table_names_or_prefixes": ["msg_%"],
//!   "readers": ["app"], "writers": ["app"], "admins": ["dba"]}]}
//! ```
//!
//! A `%` suffix matches by prefix and the user `%` matches every caller. With no
//! file configured every check passes; with a file, tables outside every group
//! are denied.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::error::{Code, ConfigError, TabletError};
use crate::lifecycle::FallibleLifecycle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "READER",
            Role::Writer => "WRITER",
            Role::Admin => "ADMIN",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AclConfig {
    #[serde(default)]
    table_groups: Vec<TableGroupSpec>,
}

#[derive(Debug, Deserialize)]
struct TableGroupSpec {
    name: String,
    #[serde(default)]
    table_names_or_prefixes: Vec<String>,
    #[serde(default)]
    readers: Vec<String>,
    #[serde(default)]
    writers: Vec<String>,
    #[serde(default)]
    admins: Vec<String>,
}

struct TableGroup {
    name: String,
    tables: Regex,
    readers: Vec<String>,
    writers: Vec<String>,
    admins: Vec<String>,
}

impl TableGroup {
    fn compile(spec: TableGroupSpec) -> Result<Self, ConfigError> {
        let alternatives: Vec<String> = spec
            .table_names_or_prefixes
            .iter()
            .map(|t| match t.strip_suffix('%') {
                Some(prefix) => format!("{}.*", regex::escape(prefix)),
                None => regex::escape(t),
            })
            .collect();
        let pattern = format!("^(?:{})$", alternatives.join("|"));
        let tables = Regex::new(&pattern).map_err(|e| {
            ConfigError::Validation(format!("table group {}: {}", spec.name, e))
        })?;
        Ok(TableGroup {
            name: spec.name,
            tables,
            readers: spec.readers,
            writers: spec.writers,
            admins: spec.admins,
        })
    }

    fn matches(&self, table: &str) -> bool {
        self.tables.is_match(table)
    }

    /// Writers may read and admins may do anything.
    fn allows(&self, role: Role, user: &str) -> bool {
        let listed = |users: &[String]| users.iter().any(|u| u == "%" || u == user);
        match role {
            Role::Reader => listed(&self.readers) || listed(&self.writers) || listed(&self.admins),
            Role::Writer => listed(&self.writers) || listed(&self.admins),
            Role::Admin => listed(&self.admins),
        }
    }
}

pub struct TableAcl {
    file: Option<PathBuf>,
    groups: RwLock<Option<Vec<TableGroup>>>,
}

impl TableAcl {
    pub fn new(file: Option<impl Into<PathBuf>>) -> Self {
        TableAcl {
            file: file.map(Into::into),
            groups: RwLock::new(None),
        }
    }

    /// Replaces the loaded groups from JSON text.
    pub fn load_str(&self, json: &str) -> Result<(), ConfigError> {
        let cfg: AclConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
        let groups = cfg
            .table_groups
            .into_iter()
            .map(TableGroup::compile)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(groups = groups.len(), "table acl loaded");
        *self.groups.write().unwrap_or_else(PoisonError::into_inner) = Some(groups);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn check(&self, table: &str, role: Role, caller: Option<&str>) -> Result<(), TabletError> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let Some(groups) = groups.as_ref() else {
            return Ok(());
        };
        let user = caller.unwrap_or("");
        let Some(group) = groups.iter().find(|g| g.matches(table)) else {
            return Err(TabletError::new(
                Code::PermissionDenied,
                format!("table acl error: table {} is not in any table group", table),
            ));
        };
        if group.allows(role, user) {
            return Ok(());
        }
        Err(TabletError::new(
            Code::PermissionDenied,
            format!(
                "table acl error: {:?} cannot run {} on table {:?} (group {})",
                user,
                role.as_str(),
                table,
                group.name
            ),
        ))
    }
}

#[async_trait]
impl FallibleLifecycle for TableAcl {
    async fn open(&self) -> Result<(), TabletError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let text = tokio::fs::read_to_string(file).await.map_err(|e| {
            TabletError::new(
                Code::FailedPrecondition,
                format!("table acl file {}: {}", file.display(), e),
            )
        })?;
        self.load_str(&text)
            .map_err(|e| TabletError::new(Code::FailedPrecondition, e.to_string()))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{"table_groups": [
        {"name": "msgs", "table_names_or_prefixes": ["msg_%"], "readers": ["reader"], "writers": ["app"], "admins": ["dba"]},
        {"name": "public", "table_names_or_prefixes": ["lookup"], "readers": ["%"]}
    ]}"#;

    #[test]
    fn unloaded_acl_allows_everything() {
        let acl = TableAcl::new(None::<PathBuf>);
        assert!(!acl.is_loaded());
        assert!(acl.check("anything", Role::Admin, None).is_ok());
    }

    #[test]
    fn roles_follow_the_hierarchy() {
        let acl = TableAcl::new(None::<PathBuf>);
        acl.load_str(CONFIG).unwrap();
        assert!(acl.check("msg_orders", Role::Reader, Some("reader")).is_ok());
        assert!(acl.check("msg_orders", Role::Reader, Some("app")).is_ok());
        assert!(acl.check("msg_orders", Role::Writer, Some("app")).is_ok());
        assert!(acl.check("msg_orders", Role::Admin, Some("dba")).is_ok());

        let err = acl.check("msg_orders", Role::Writer, Some("reader")).unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert!(err.to_string().contains("WRITER"));
        assert!(acl.check("msg_orders", Role::Admin, Some("app")).is_err());
    }

    #[test]
    fn wildcard_user_and_unmatched_tables() {
        let acl = TableAcl::new(None::<PathBuf>);
        acl.load_str(CONFIG).unwrap();
        assert!(acl.check("lookup", Role::Reader, Some("anyone")).is_ok());
        assert!(acl.check("lookup", Role::Writer, Some("anyone")).is_err());
        assert!(acl.check("lookup_extra", Role::Reader, Some("anyone")).is_err());
        let err = acl.check("orders", Role::Reader, Some("dba")).unwrap_err();
        assert!(err.to_string().contains("not in any table group"));
    }

    #[test]
    fn bad_json_is_rejected() {
        let acl = TableAcl::new(None::<PathBuf>);
        assert!(acl.load_str("{not json").is_err());
        assert!(!acl.is_loaded());
    }

    #[tokio::test]
    async fn open_without_file_is_a_no_op() {
        let acl = TableAcl::new(None::<PathBuf>);
        acl.open().await.unwrap();
        assert!(!acl.is_loaded());

        let missing = TableAcl::new(Some("/nonexistent/acl.json"));
        assert_eq!(
            missing.open().await.unwrap_err().code(),
            Code::FailedPrecondition
        );
    }
}
