// ==========================================
// 医院业务价值核算 - 计算任务仓储
// ==========================================
// 红线: 状态迁移只走 pending -> running -> completed | failed
// 红线: 迁移以条件 UPDATE 实现 (比较并交换),并发启动只有一方成功
// ==========================================

use crate::domain::task::CalculationTask;
use crate::domain::types::TaskStatus;
use crate::repository::error::{
    format_db_datetime, parse_db_datetime, RepositoryError, RepositoryResult,
};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const TASK_COLUMNS: &str = r#"
    task_id, model_version_id, workflow_id, period, organization_id,
    status, progress, description, error_message,
    created_at, started_at, completed_at
"#;

pub struct TaskRepository {
    conn: Arc<Mutex<Connection>>,
}

impl TaskRepository {
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

    /// 创建任务 (状态必须为 pending)
    pub fn create(&self, task: &CalculationTask) -> RepositoryResult<()> {
        if task.status != TaskStatus::Pending {
            return Err(RepositoryError::BusinessRuleViolation(format!(
                "新建任务状态必须为 pending, 实际为 {}",
                task.status
            )));
        }
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO calculation_task (
                task_id, model_version_id, workflow_id, period, organization_id,
                status, progress, description, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)
            "#,
            params![
                task.task_id,
                task.model_version_id,
                task.workflow_id,
                task.period,
                task.organization_id,
                task.status.to_db_str(),
                task.progress,
                task.description,
                format_db_datetime(&task.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, task_id: &str) -> RepositoryResult<Option<CalculationTask>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM calculation_task WHERE task_id = ?1", TASK_COLUMNS);
        let raw = conn
            .query_row(&sql, params![task_id], read_task_row)
            .optional()?;
        raw.map(TaskRow::into_domain).transpose()
    }

    /// 最近创建的任务 (可按状态/模型版本过滤)
    pub fn list_recent(
        &self,
        status: Option<TaskStatus>,
        model_version_id: Option<i64>,
        limit: usize,
    ) -> RepositoryResult<Vec<CalculationTask>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM calculation_task
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR model_version_id = ?2)
            ORDER BY created_at DESC, task_id
            LIMIT ?3
            "#,
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.to_db_str()), model_version_id, limit as i64],
                read_task_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// pending -> running (比较并交换)
    ///
    /// # 返回
    /// - Ok(true): 本调用方取得执行权
    /// - Ok(false): 任务已被启动或已结束
    pub fn try_start(&self, task_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE calculation_task
            SET status = 'running', started_at = ?1, progress = 0
            WHERE task_id = ?2 AND status = 'pending'
            "#,
            params![format_db_datetime(&Local::now().naive_local()), task_id],
        )?;
        if affected == 0 && !task_exists(&conn, task_id)? {
            return Err(task_not_found(task_id));
        }
        Ok(affected == 1)
    }

    /// 更新进度 (仅 running)
    pub fn update_progress(&self, task_id: &str, progress: f64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE calculation_task SET progress = ?1 WHERE task_id = ?2 AND status = 'running'",
            params![progress.clamp(0.0, 100.0), task_id],
        )?;
        ensure_transition(&conn, affected, task_id, TaskStatus::Running)
    }

    /// running -> completed, progress 置为 100
    pub fn mark_completed(&self, task_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE calculation_task
            SET status = 'completed', progress = 100, completed_at = ?1, error_message = NULL
            WHERE task_id = ?2 AND status = 'running'
            "#,
            params![format_db_datetime(&Local::now().naive_local()), task_id],
        )?;
        ensure_transition(&conn, affected, task_id, TaskStatus::Completed)
    }

    /// running -> failed, 记录失败原因 (进度保持失败时的值)
    pub fn mark_failed(&self, task_id: &str, error_message: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE calculation_task
            SET status = 'failed', completed_at = ?1, error_message = ?2
            WHERE task_id = ?3 AND status = 'running'
            "#,
            params![
                format_db_datetime(&Local::now().naive_local()),
                error_message,
                task_id
            ],
        )?;
        ensure_transition(&conn, affected, task_id, TaskStatus::Failed)
    }
}

fn task_exists(conn: &Connection, task_id: &str) -> RepositoryResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM calculation_task WHERE task_id = ?1",
            params![task_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn task_not_found(task_id: &str) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "CalculationTask".to_string(),
        id: task_id.to_string(),
    }
}

/// 条件 UPDATE 未命中时区分 "不存在" 与 "状态不允许"
fn ensure_transition(
    conn: &Connection,
    affected: usize,
    task_id: &str,
    target: TaskStatus,
) -> RepositoryResult<()> {
    if affected > 0 {
        return Ok(());
    }
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM calculation_task WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    match current {
        None => Err(task_not_found(task_id)),
        Some(from) => Err(RepositoryError::InvalidStateTransition {
            from,
            to: target.to_db_str().to_string(),
        }),
    }
}

struct TaskRow {
    task_id: String,
    model_version_id: i64,
    workflow_id: i64,
    period: String,
    organization_id: String,
    status: String,
    progress: f64,
    description: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        model_version_id: row.get(1)?,
        workflow_id: row.get(2)?,
        period: row.get(3)?,
        organization_id: row.get(4)?,
        status: row.get(5)?,
        progress: row.get(6)?,
        description: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

impl TaskRow {
    fn into_domain(self) -> RepositoryResult<CalculationTask> {
        let status =
            TaskStatus::from_db_str(&self.status).ok_or_else(|| RepositoryError::FieldValueError {
                field: "status".to_string(),
                message: self.status.clone(),
            })?;
        Ok(CalculationTask {
            task_id: self.task_id,
            model_version_id: self.model_version_id,
            workflow_id: self.workflow_id,
            period: self.period,
            organization_id: self.organization_id,
            status,
            progress: self.progress,
            description: self.description,
            error_message: self.error_message,
            created_at: parse_db_datetime("created_at", &self.created_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(|s| parse_db_datetime("started_at", s))
                .transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|s| parse_db_datetime("completed_at", s))
                .transpose()?,
        })
    }
}
