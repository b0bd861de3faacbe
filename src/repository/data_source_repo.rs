// ==========================================
// 医院业务价值核算 - 外部数据源登记仓储
// ==========================================
// 登记名同时作为 ATTACH 别名,只允许 [A-Za-z_][A-Za-z0-9_]*
// ==========================================

use crate::domain::workflow::DataSource;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

pub struct DataSourceRepository {
    conn: Arc<Mutex<Connection>>,
}

impl DataSourceRepository {
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 登记数据源 (同名则更新路径并重新启用)
    pub fn register(&self, name: &str, db_path: &str) -> RepositoryResult<i64> {
        if !is_valid_alias(name) {
            return Err(RepositoryError::FieldValueError {
                field: "name".to_string(),
                message: format!("数据源名称不合法: {}", name),
            });
        }
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO data_source (name, db_path, is_enabled) VALUES (?1, ?2, 1)
            ON CONFLICT(name) DO UPDATE SET db_path = excluded.db_path, is_enabled = 1
            "#,
            params![name, db_path],
        )?;
        let id = conn.query_row(
            "SELECT id FROM data_source WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn set_enabled(&self, name: &str, is_enabled: bool) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE data_source SET is_enabled = ?1 WHERE name = ?2",
            params![is_enabled, name],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "DataSource".to_string(),
                id: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> RepositoryResult<Option<DataSource>> {
        let conn = self.get_conn()?;
        find_data_source(&conn, name)
    }

    pub fn list(&self) -> RepositoryResult<Vec<DataSource>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, db_path, is_enabled FROM data_source ORDER BY name")?;
        let sources = stmt
            .query_map([], map_data_source)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }
}

pub(crate) fn find_data_source(
    conn: &Connection,
    name: &str,
) -> RepositoryResult<Option<DataSource>> {
    Ok(conn
        .query_row(
            "SELECT id, name, db_path, is_enabled FROM data_source WHERE name = ?1",
            params![name],
            map_data_source,
        )
        .optional()?)
}

/// ATTACH 别名校验
pub fn is_valid_alias(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(name.to_ascii_lowercase().as_str(), "main" | "temp")
}

fn map_data_source(row: &Row<'_>) -> rusqlite::Result<DataSource> {
    Ok(DataSource {
        id: row.get(0)?,
        name: row.get(1)?,
        db_path: row.get(2)?,
        is_enabled: row.get(3)?,
    })
}
