// ==========================================
// 医院业务价值核算 - 步骤执行日志仓储
// ==========================================
// 红线: 只追加,不提供更新/删除接口 (表上另有触发器兜底)
// ==========================================

use crate::domain::task::{CalculationStepLog, NewStepLog};
use crate::domain::types::StepLogStatus;
use crate::repository::error::{
    format_db_datetime, parse_db_datetime, RepositoryError, RepositoryResult,
};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

pub struct StepLogRepository {
    conn: Arc<Mutex<Connection>>,
}

impl StepLogRepository {
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

    /// 追加一条步骤日志,返回 log_id
    pub fn append(&self, log: &NewStepLog) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let payload = log
            .result_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            r#"
            INSERT INTO calculation_step_log (
                task_id, step_id, step_name, status, start_time, end_time,
                duration_ms, result_payload, execution_info, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                log.task_id,
                log.step_id,
                log.step_name,
                log.status.to_db_str(),
                format_db_datetime(&log.start_time),
                format_db_datetime(&log.end_time),
                log.duration_ms,
                payload,
                log.execution_info,
                log.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 任务的全部步骤日志 (按写入顺序)
    pub fn list_by_task(&self, task_id: &str) -> RepositoryResult<Vec<CalculationStepLog>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT log_id, task_id, step_id, step_name, status, start_time, end_time,
                   duration_ms, result_payload, execution_info, error_message
            FROM calculation_step_log
            WHERE task_id = ?1
            ORDER BY log_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(log_id, task_id, step_id, step_name, status, start, end, duration_ms, payload, info, error)| {
                    let status = StepLogStatus::from_db_str(&status).ok_or_else(|| {
                        RepositoryError::FieldValueError {
                            field: "status".to_string(),
                            message: status.clone(),
                        }
                    })?;
                    Ok(CalculationStepLog {
                        log_id,
                        task_id,
                        step_id,
                        step_name,
                        status,
                        start_time: parse_db_datetime("start_time", &start)?,
                        end_time: parse_db_datetime("end_time", &end)?,
                        duration_ms,
                        result_payload: payload
                            .as_deref()
                            .map(serde_json::from_str)
                            .transpose()?,
                        execution_info: info,
                        error_message: error,
                    })
                },
            )
            .collect()
    }
}
