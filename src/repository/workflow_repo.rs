// ==========================================
// 医院业务价值核算 - 计算流程/计算步骤仓储
// ==========================================
// 红线: Repository 不含业务逻辑 (插入位置由上层计算)
// 排序: sort_key 以 (分子, 分母) 精确存储,sort_key_real 仅用于 SQL 粗排
// ==========================================

use crate::domain::sort_key::SortKey;
use crate::domain::types::CodeKind;
use crate::domain::workflow::{CalculationStep, CalculationWorkflow, NewCalculationStep};
use crate::repository::error::{
    format_db_datetime, parse_db_datetime, RepositoryError, RepositoryResult,
};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

pub struct WorkflowRepository {
    conn: Arc<Mutex<Connection>>,
}

const STEP_COLUMNS: &str = r#"
    id, workflow_id, name, description, code_kind, body,
    sort_num, sort_den, is_enabled, data_source_ref, created_at, updated_at
"#;

impl WorkflowRepository {
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

    // ==========================================
    // 流程
    // ==========================================

    pub fn create_workflow(
        &self,
        model_version_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO calculation_workflow (model_version_id, name, description, is_enabled, created_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            "#,
            params![
                model_version_id,
                name,
                description,
                format_db_datetime(&Local::now().naive_local())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_workflow(&self, workflow_id: i64) -> RepositoryResult<Option<CalculationWorkflow>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                r#"
                SELECT id, model_version_id, name, description, is_enabled, created_at
                FROM calculation_workflow WHERE id = ?1
                "#,
                params![workflow_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(id, model_version_id, name, description, is_enabled, created_at)| {
            Ok(CalculationWorkflow {
                id,
                model_version_id,
                name,
                description,
                is_enabled,
                created_at: parse_db_datetime("created_at", &created_at)?,
            })
        })
        .transpose()
    }

    /// 复制流程及其全部步骤 (单事务)
    ///
    /// 步骤保留精确排序键、启用状态与数据源绑定;
    /// 目标版本下已有同名流程时拒绝
    pub fn copy_workflow(
        &self,
        source_workflow_id: i64,
        target_version_id: Option<i64>,
        new_name: &str,
        description: Option<&str>,
    ) -> RepositoryResult<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let (source_version_id, source_description, is_enabled): (i64, Option<String>, bool) = tx
            .query_row(
                "SELECT model_version_id, description, is_enabled FROM calculation_workflow WHERE id = ?1",
                params![source_workflow_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "CalculationWorkflow".to_string(),
                id: source_workflow_id.to_string(),
            })?;
        let version_id = target_version_id.unwrap_or(source_version_id);

        let duplicated: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM calculation_workflow WHERE model_version_id = ?1 AND name = ?2)",
            params![version_id, new_name],
            |row| row.get(0),
        )?;
        if duplicated {
            return Err(RepositoryError::BusinessRuleViolation(format!(
                "模型版本 {} 下已存在同名流程: {}",
                version_id, new_name
            )));
        }

        let now = format_db_datetime(&Local::now().naive_local());
        tx.execute(
            r#"
            INSERT INTO calculation_workflow (model_version_id, name, description, is_enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                version_id,
                new_name,
                description.map(str::to_string).or(source_description),
                is_enabled,
                now
            ],
        )?;
        let new_workflow_id = tx.last_insert_rowid();

        let copied = tx.execute(
            r#"
            INSERT INTO calculation_step (
                workflow_id, name, description, code_kind, body,
                sort_num, sort_den, sort_key_real, is_enabled, data_source_ref,
                created_at, updated_at
            )
            SELECT ?1, name, description, code_kind, body,
                   sort_num, sort_den, sort_key_real, is_enabled, data_source_ref,
                   ?2, ?2
            FROM calculation_step
            WHERE workflow_id = ?3
            ORDER BY id
            "#,
            params![new_workflow_id, now, source_workflow_id],
        )?;

        tx.commit()?;
        tracing::info!(
            source_workflow_id,
            new_workflow_id,
            model_version_id = version_id,
            steps = copied,
            "计算流程已复制"
        );
        Ok(new_workflow_id)
    }

    // ==========================================
    // 步骤
    // ==========================================

    /// 以指定排序键插入步骤
    pub fn insert_step(
        &self,
        workflow_id: i64,
        step: &NewCalculationStep,
        sort_key: SortKey,
    ) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let now = format_db_datetime(&Local::now().naive_local());
        conn.execute(
            r#"
            INSERT INTO calculation_step (
                workflow_id, name, description, code_kind, body,
                sort_num, sort_den, sort_key_real, is_enabled, data_source_ref,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
            params![
                workflow_id,
                step.name,
                step.description,
                step.code_kind.to_db_str(),
                step.body,
                sort_key.numerator(),
                sort_key.denominator(),
                sort_key.to_f64(),
                step.is_enabled,
                step.data_source_ref,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_step(&self, step_id: i64) -> RepositoryResult<Option<CalculationStep>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM calculation_step WHERE id = ?1", STEP_COLUMNS);
        let raw = conn
            .query_row(&sql, params![step_id], read_step_row)
            .optional()?;
        raw.map(StepRow::into_domain).transpose()
    }

    /// 流程下全部步骤,按排序键精确排序 (排序键相同按 id)
    pub fn list_steps(&self, workflow_id: i64) -> RepositoryResult<Vec<CalculationStep>> {
        let conn = self.get_conn()?;
        load_steps(&conn, workflow_id, false)
    }

    /// 流程下启用的步骤 (执行顺序)
    pub fn list_enabled_steps(&self, workflow_id: i64) -> RepositoryResult<Vec<CalculationStep>> {
        let conn = self.get_conn()?;
        load_steps(&conn, workflow_id, true)
    }

    /// 更新步骤内容 (不改排序)
    pub fn update_step(&self, step_id: i64, step: &NewCalculationStep) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE calculation_step
            SET name = ?1, description = ?2, code_kind = ?3, body = ?4,
                is_enabled = ?5, data_source_ref = ?6, updated_at = ?7
            WHERE id = ?8
            "#,
            params![
                step.name,
                step.description,
                step.code_kind.to_db_str(),
                step.body,
                step.is_enabled,
                step.data_source_ref,
                format_db_datetime(&Local::now().naive_local()),
                step_id,
            ],
        )?;
        ensure_step_affected(affected, step_id)
    }

    pub fn set_step_enabled(&self, step_id: i64, is_enabled: bool) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE calculation_step SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                is_enabled,
                format_db_datetime(&Local::now().naive_local()),
                step_id
            ],
        )?;
        ensure_step_affected(affected, step_id)
    }

    pub fn update_sort_key(&self, step_id: i64, sort_key: SortKey) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = write_sort_key(&conn, step_id, sort_key)?;
        ensure_step_affected(affected, step_id)
    }

    /// 交换两个步骤的排序键 (单事务)
    pub fn swap_sort_keys(&self, a: &CalculationStep, b: &CalculationStep) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        ensure_step_affected(write_sort_key(&tx, a.id, b.sort_key)?, a.id)?;
        ensure_step_affected(write_sort_key(&tx, b.id, a.sort_key)?, b.id)?;
        tx.commit()?;
        Ok(())
    }

    /// 批量写入排序键 (单事务)
    pub fn update_sort_keys(&self, keys: &[(i64, SortKey)]) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for (step_id, sort_key) in keys {
            ensure_step_affected(write_sort_key(&tx, *step_id, *sort_key)?, *step_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_step(&self, step_id: i64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM calculation_step WHERE id = ?1", params![step_id])?;
        ensure_step_affected(affected, step_id)
    }
}

fn write_sort_key(conn: &Connection, step_id: i64, sort_key: SortKey) -> RepositoryResult<usize> {
    Ok(conn.execute(
        r#"
        UPDATE calculation_step
        SET sort_num = ?1, sort_den = ?2, sort_key_real = ?3, updated_at = ?4
        WHERE id = ?5
        "#,
        params![
            sort_key.numerator(),
            sort_key.denominator(),
            sort_key.to_f64(),
            format_db_datetime(&Local::now().naive_local()),
            step_id,
        ],
    )?)
}

fn ensure_step_affected(affected: usize, step_id: i64) -> RepositoryResult<()> {
    if affected == 0 {
        return Err(RepositoryError::NotFound {
            entity: "CalculationStep".to_string(),
            id: step_id.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn load_steps(
    conn: &Connection,
    workflow_id: i64,
    enabled_only: bool,
) -> RepositoryResult<Vec<CalculationStep>> {
    let sql = format!(
        r#"
        SELECT {} FROM calculation_step
        WHERE workflow_id = ?1 AND (?2 = 0 OR is_enabled = 1)
        ORDER BY sort_key_real, id
        "#,
        STEP_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![workflow_id, enabled_only], read_step_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut steps = rows
        .into_iter()
        .map(StepRow::into_domain)
        .collect::<RepositoryResult<Vec<_>>>()?;
    // 浮点粗排之后按有理数精确排序
    steps.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then(a.id.cmp(&b.id)));
    Ok(steps)
}

struct StepRow {
    id: i64,
    workflow_id: i64,
    name: String,
    description: Option<String>,
    code_kind: String,
    body: String,
    sort_num: i64,
    sort_den: i64,
    is_enabled: bool,
    data_source_ref: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_step_row(row: &Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        code_kind: row.get(4)?,
        body: row.get(5)?,
        sort_num: row.get(6)?,
        sort_den: row.get(7)?,
        is_enabled: row.get(8)?,
        data_source_ref: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl StepRow {
    fn into_domain(self) -> RepositoryResult<CalculationStep> {
        let code_kind =
            CodeKind::from_db_str(&self.code_kind).ok_or_else(|| RepositoryError::FieldValueError {
                field: "code_kind".to_string(),
                message: self.code_kind.clone(),
            })?;
        let sort_key =
            SortKey::new(self.sort_num, self.sort_den).map_err(|e| RepositoryError::FieldValueError {
                field: "sort_key".to_string(),
                message: e.to_string(),
            })?;
        Ok(CalculationStep {
            id: self.id,
            workflow_id: self.workflow_id,
            name: self.name,
            description: self.description,
            code_kind,
            body: self.body,
            sort_key,
            is_enabled: self.is_enabled,
            data_source_ref: self.data_source_ref,
            created_at: parse_db_datetime("created_at", &self.created_at)?,
            updated_at: parse_db_datetime("updated_at", &self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_repo() -> (WorkflowRepository, i64) {
        let conn = crate::db::open_test_connection();
        conn.execute(
            "INSERT INTO model_version (id, organization_id, name, created_at) VALUES (1, 'H1', 'v1', '2025-01-01 00:00:00')",
            [],
        )
        .unwrap();
        let repo = WorkflowRepository::from_connection(Arc::new(Mutex::new(conn)));
        let wf = repo.create_workflow(1, "月度核算", None).unwrap();
        (repo, wf)
    }

    fn key(raw: &str) -> SortKey {
        SortKey::parse(raw).unwrap()
    }

    #[test]
    fn test_list_steps_exact_rational_order() {
        let (repo, wf) = setup_repo();
        // 1/3 与 0.333333333333333333 在 f64 下相等,精确排序须区分
        repo.insert_step(wf, &NewCalculationStep::sql("c", "SELECT 1"), key("1/3")).unwrap();
        repo.insert_step(wf, &NewCalculationStep::sql("b", "SELECT 1"), key("0.333333333333333333"))
            .unwrap();
        repo.insert_step(wf, &NewCalculationStep::sql("a", "SELECT 1"), key("0.25")).unwrap();

        let names: Vec<_> = repo.list_steps(wf).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_enabled_filter_and_swap() {
        let (repo, wf) = setup_repo();
        let s1 = repo.insert_step(wf, &NewCalculationStep::sql("s1", "SELECT 1"), key("1")).unwrap();
        let s2 = repo.insert_step(wf, &NewCalculationStep::sql("s2", "SELECT 1"), key("2")).unwrap();
        let s3 = repo.insert_step(wf, &NewCalculationStep::sql("s3", "SELECT 1"), key("3")).unwrap();

        repo.set_step_enabled(s2, false).unwrap();
        let enabled: Vec<_> = repo.list_enabled_steps(wf).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(enabled, vec![s1, s3]);

        let a = repo.find_step(s1).unwrap().unwrap();
        let b = repo.find_step(s3).unwrap().unwrap();
        repo.swap_sort_keys(&a, &b).unwrap();
        let order: Vec<_> = repo.list_steps(wf).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![s3, s2, s1]);
    }

    #[test]
    fn test_missing_step_reports_not_found() {
        let (repo, _) = setup_repo();
        assert!(matches!(
            repo.set_step_enabled(42, true),
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(repo.find_step(42).unwrap().is_none());
    }

    #[test]
    fn test_copy_workflow_keeps_steps_and_keys() {
        let (repo, wf) = setup_repo();
        repo.insert_step(wf, &NewCalculationStep::sql("s1", "SELECT 1"), key("1")).unwrap();
        let s2 = repo
            .insert_step(
                wf,
                &NewCalculationStep::sql("s2", "SELECT 2").with_data_source("his"),
                key("4.5"),
            )
            .unwrap();
        repo.set_step_enabled(s2, false).unwrap();

        let copy = repo.copy_workflow(wf, None, "月度核算 (副本)", None).unwrap();
        assert_ne!(copy, wf);
        let steps = repo.list_steps(copy).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "s1");
        assert_eq!(steps[1].sort_key, key("9/2"));
        assert!(!steps[1].is_enabled);
        assert_eq!(steps[1].data_source_ref.as_deref(), Some("his"));
        // 原流程不受影响
        assert_eq!(repo.list_steps(wf).unwrap().len(), 2);

        assert!(matches!(
            repo.copy_workflow(wf, None, "月度核算", None),
            Err(RepositoryError::BusinessRuleViolation(_))
        ));
        assert!(matches!(
            repo.copy_workflow(999, None, "x", None),
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_step_keeps_sort_key() {
        let (repo, wf) = setup_repo();
        let id = repo.insert_step(wf, &NewCalculationStep::sql("s", "SELECT 1"), key("4.5")).unwrap();
        repo.update_step(id, &NewCalculationStep::script("s2", r#"{"op":"rollup"}"#)).unwrap();
        let step = repo.find_step(id).unwrap().unwrap();
        assert_eq!(step.name, "s2");
        assert_eq!(step.code_kind, CodeKind::Script);
        assert_eq!(step.sort_key, key("9/2"));
    }
}
