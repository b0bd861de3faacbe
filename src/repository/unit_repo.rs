// ==========================================
// 医院业务价值核算 - 核算单元仓储
// ==========================================

use crate::domain::model::AccountingUnit;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

pub struct AccountingUnitRepository {
    conn: Arc<Mutex<Connection>>,
}

impl AccountingUnitRepository {
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

    pub fn create(&self, organization_id: &str, code: &str, name: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO accounting_unit (organization_id, code, name, is_active) VALUES (?1, ?2, ?3, 1)",
            params![organization_id, code, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_by_id(&self, unit_id: i64) -> RepositoryResult<Option<AccountingUnit>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT id, organization_id, code, name, is_active FROM accounting_unit WHERE id = ?1",
                params![unit_id],
                map_unit,
            )
            .optional()?)
    }

    pub fn set_active(&self, unit_id: i64, is_active: bool) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE accounting_unit SET is_active = ?1 WHERE id = ?2",
            params![is_active, unit_id],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "AccountingUnit".to_string(),
                id: unit_id.to_string(),
            });
        }
        Ok(())
    }

    /// 机构下的启用核算单元
    pub fn list_active(&self, organization_id: &str) -> RepositoryResult<Vec<AccountingUnit>> {
        let conn = self.get_conn()?;
        list_active_units(&conn, organization_id)
    }
}

pub(crate) fn list_active_units(
    conn: &Connection,
    organization_id: &str,
) -> RepositoryResult<Vec<AccountingUnit>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, organization_id, code, name, is_active
        FROM accounting_unit
        WHERE organization_id = ?1 AND is_active = 1
        ORDER BY id
        "#,
    )?;
    let units = stmt
        .query_map(params![organization_id], map_unit)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(units)
}

fn map_unit(row: &Row<'_>) -> rusqlite::Result<AccountingUnit> {
    Ok(AccountingUnit {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        is_active: row.get(4)?,
    })
}
