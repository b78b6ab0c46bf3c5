//! Tablet roles, request targets and per-request execute options.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletType {
    #[default]
    Unknown,
    Primary,
    Replica,
    Rdonly,
    Spare,
    Experimental,
    Backup,
    Restore,
    Drained,
}

impl TabletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletType::Unknown => "UNKNOWN",
            TabletType::Primary => "PRIMARY",
            TabletType::Replica => "REPLICA",
            TabletType::Rdonly => "RDONLY",
            TabletType::Spare => "SPARE",
            TabletType::Experimental => "EXPERIMENTAL",
            TabletType::Backup => "BACKUP",
            TabletType::Restore => "RESTORE",
            TabletType::Drained => "DRAINED",
        }
    }

    /// Roles that can take application traffic.
    pub fn is_serving_type(&self) -> bool {
        matches!(
            self,
            TabletType::Primary
                | TabletType::Replica
                | TabletType::Rdonly
                | TabletType::Experimental
        )
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => TabletType::Unknown,
            "PRIMARY" | "MASTER" => TabletType::Primary,
            "REPLICA" => TabletType::Replica,
            "RDONLY" | "BATCH" => TabletType::Rdonly,
            "SPARE" => TabletType::Spare,
            "EXPERIMENTAL" => TabletType::Experimental,
            "BACKUP" => TabletType::Backup,
            "RESTORE" => TabletType::Restore,
            "DRAINED" => TabletType::Drained,
            other => return Err(format!("unknown tablet type: {}", other)),
        })
    }
}

/// The (keyspace, shard, role) a request is addressed to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    #[serde(default)]
    pub cell: String,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Self {
        Target {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
            cell: String::new(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.keyspace, self.shard, self.tablet_type)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Workload {
    #[default]
    Unspecified,
    Oltp,
    Olap,
    Dba,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub workload: Workload,
    /// Skip the per-keyspace `use` setting.
    pub skip_use: bool,
    /// Read-only transaction requested at begin.
    pub read_only: bool,
}
