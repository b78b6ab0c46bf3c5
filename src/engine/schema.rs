//! Schema engine: verifies the database exists and caches table definitions.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::dbconn::connect_options;
use crate::config::DbConfig;
use crate::error::{errno, TabletError};
use crate::lifecycle::{FallibleLifecycle, RoleAware, SchemaControl};
use crate::sql::quote_identifier;
use crate::target::TabletType;

pub struct SchemaEngine {
    db_name: String,
    with_db: MySqlConnectOptions,
    without_db: MySqlConnectOptions,
    is_open: AtomicBool,
    is_primary: AtomicBool,
    tables: Mutex<HashMap<String, String>>,
}

impl SchemaEngine {
    pub fn new(db: &DbConfig) -> Self {
        let without_db = connect_options(&DbConfig {
            db_name: String::new(),
            ..db.clone()
        });
        SchemaEngine {
            db_name: db.db_name.clone(),
            with_db: connect_options(db),
            without_db,
            is_open: AtomicBool::new(false),
            is_primary: AtomicBool::new(false),
            tables: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(&self) -> Result<MySqlConnection, TabletError> {
        Ok(self.with_db.connect().await?)
    }

    async fn load(&self, tables: &[String]) -> Result<HashMap<String, String>, TabletError> {
        let mut conn = self.connect().await?;
        let result = load_tables(&mut conn, tables).await;
        let _ = conn.close().await;
        result
    }

    /// Number of cached table definitions.
    pub fn table_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn is_bad_db(err: &TabletError) -> bool {
    err.as_sql().is_some_and(|e| e.number == errno::ER_BAD_DB)
}

async fn load_tables(
    conn: &mut MySqlConnection,
    tables: &[String],
) -> Result<HashMap<String, String>, TabletError> {
    let names: Vec<String> = if tables.is_empty() {
        sqlx::query_scalar("show tables").fetch_all(&mut *conn).await?
    } else {
        tables.to_vec()
    };
    let mut schema = HashMap::with_capacity(names.len());
    for name in names {
        let stmt = format!("show create table {}", quote_identifier(&name));
        let row = sqlx::query(&stmt).fetch_one(&mut *conn).await?;
        let create: String = row.try_get(1)?;
        schema.insert(name, create);
    }
    Ok(schema)
}

#[async_trait]
impl FallibleLifecycle for SchemaEngine {
    async fn open(&self) -> Result<(), TabletError> {
        if self.is_open.load(Ordering::SeqCst) {
            return Ok(());
        }
        let tables = self.load(&[]).await?;
        let count = tables.len();
        *self.tables.lock().unwrap_or_else(PoisonError::into_inner) = tables;
        self.is_open.store(true, Ordering::SeqCst);
        tracing::info!(db = %self.db_name, tables = count, "schema engine opened");
        Ok(())
    }

    async fn close(&self) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("schema engine closed");
    }
}

#[async_trait]
impl RoleAware for SchemaEngine {
    async fn make_primary(&self) {
        self.is_primary.store(true, Ordering::SeqCst);
    }

    async fn make_non_primary(&self) {
        self.is_primary.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SchemaControl for SchemaEngine {
    /// Primaries create a missing database; other roles wait for replication to bring it.
    async fn ensure_connection_and_db(&self, tablet_type: TabletType) -> Result<(), TabletError> {
        match self.connect().await {
            Ok(conn) => {
                let _ = conn.close().await;
                Ok(())
            }
            Err(err) if is_bad_db(&err) && tablet_type == TabletType::Primary => {
                let mut conn = self.without_db.connect().await?;
                let stmt = format!(
                    "create database if not exists {}",
                    quote_identifier(&self.db_name)
                );
                let result = (&mut conn).execute(sqlx::raw_sql(&stmt)).await;
                let _ = conn.close().await;
                result?;
                tracing::info!(db = %self.db_name, "created database");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_schema(&self, tables: &[String]) -> Result<HashMap<String, String>, TabletError> {
        {
            let cached = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            if !cached.is_empty() {
                if tables.is_empty() {
                    return Ok(cached.clone());
                }
                if tables.iter().all(|t| cached.contains_key(t)) {
                    return Ok(tables
                        .iter()
                        .filter_map(|t| cached.get(t).map(|c| (t.clone(), c.clone())))
                        .collect());
                }
            }
        }
        self.load(tables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Code, SqlError};

    #[test]
    fn unknown_database_is_detected() {
        let err: TabletError = SqlError::new(errno::ER_BAD_DB, "42000", "Unknown database 'ks'").into();
        assert!(is_bad_db(&err));
        assert!(!is_bad_db(&TabletError::new(Code::Unknown, "x")));
    }

    #[tokio::test]
    async fn cached_schema_is_served_without_mysql() {
        let se = SchemaEngine::new(&DbConfig {
            port: 1,
            ..DbConfig::default()
        });
        se.tables
            .lock()
            .unwrap()
            .insert("t1".into(), "CREATE TABLE `t1` (id int)".into());
        let all = se.get_schema(&[]).await.unwrap();
        assert_eq!(all.len(), 1);
        let one = se.get_schema(&["t1".to_string()]).await.unwrap();
        assert_eq!(one["t1"], "CREATE TABLE `t1` (id int)");
        assert_eq!(se.table_count(), 1);
    }
}
