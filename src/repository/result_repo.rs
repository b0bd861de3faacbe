// ==========================================
// 医院业务价值核算 - 计算结果/汇总/调整明细仓储
// ==========================================
// 红线: (task_id, node_id, unit_id) 唯一,由表约束保证
// 红线: 写入函数接收 &Connection,供执行器在步骤事务内调用
// ==========================================

use crate::domain::result::{
    AdjustmentDetail, CalculationResult, CalculationSummary, CategorySummary,
    NewCalculationResult,
};
use crate::domain::types::NodeType;
use crate::repository::error::{
    format_db_datetime, parse_db_datetime, RepositoryError, RepositoryResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const RESULT_COLUMNS: &str = r#"
    id, task_id, unit_id, node_id, node_code, node_name, node_type, parent_id,
    workload, weight, original_weight, value, ratio, created_at
"#;

/// 同一键的重复行 (正常情况下恒为空)
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateResultKey {
    pub node_id: i64,
    pub unit_id: i64,
    pub row_count: i64,
}

pub struct ResultRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ResultRepository {
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

    pub fn list_by_task(&self, task_id: &str) -> RepositoryResult<Vec<CalculationResult>> {
        let conn = self.get_conn()?;
        load_results(&conn, task_id)
    }

    pub fn list_by_unit(
        &self,
        task_id: &str,
        unit_id: i64,
    ) -> RepositoryResult<Vec<CalculationResult>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM calculation_result WHERE task_id = ?1 AND unit_id = ?2 ORDER BY node_id",
            RESULT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id, unit_id], read_result_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ResultRow::into_domain).collect()
    }

    pub fn find_summary(
        &self,
        task_id: &str,
        unit_id: i64,
    ) -> RepositoryResult<Option<CalculationSummary>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                r#"
                SELECT task_id, unit_id, categories_json, total_value, updated_at
                FROM calculation_summary WHERE task_id = ?1 AND unit_id = ?2
                "#,
                params![task_id, unit_id],
                read_summary_row,
            )
            .optional()?;
        raw.map(SummaryRow::into_domain).transpose()
    }

    pub fn list_summaries(&self, task_id: &str) -> RepositoryResult<Vec<CalculationSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT task_id, unit_id, categories_json, total_value, updated_at
            FROM calculation_summary WHERE task_id = ?1 ORDER BY unit_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![task_id], read_summary_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SummaryRow::into_domain).collect()
    }

    pub fn list_adjustments(&self, task_id: &str) -> RepositoryResult<Vec<AdjustmentDetail>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT task_id, unit_id, node_id, pass_name, rule_ref, actual_value,
                   benchmark_value, ratio, coefficient, weight_before, weight_after,
                   is_adjusted, reason
            FROM adjustment_detail WHERE task_id = ?1 ORDER BY id
            "#,
        )?;
        let details = stmt
            .query_map(params![task_id], |row| {
                Ok(AdjustmentDetail {
                    task_id: row.get(0)?,
                    unit_id: row.get(1)?,
                    node_id: row.get(2)?,
                    pass_name: row.get(3)?,
                    rule_ref: row.get(4)?,
                    actual_value: row.get(5)?,
                    benchmark_value: row.get(6)?,
                    ratio: row.get(7)?,
                    coefficient: row.get(8)?,
                    weight_before: row.get(9)?,
                    weight_after: row.get(10)?,
                    is_adjusted: row.get(11)?,
                    reason: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(details)
    }

    /// 重复键排查
    pub fn find_duplicate_keys(&self, task_id: &str) -> RepositoryResult<Vec<DuplicateResultKey>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT node_id, unit_id, COUNT(*) AS row_count
            FROM calculation_result
            WHERE task_id = ?1
            GROUP BY node_id, unit_id
            HAVING COUNT(*) > 1
            ORDER BY node_id, unit_id
            "#,
        )?;
        let keys = stmt
            .query_map(params![task_id], |row| {
                Ok(DuplicateResultKey {
                    node_id: row.get(0)?,
                    unit_id: row.get(1)?,
                    row_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

// ==========================================
// 步骤事务内的读写
// ==========================================

pub(crate) fn load_results(
    conn: &Connection,
    task_id: &str,
) -> RepositoryResult<Vec<CalculationResult>> {
    let sql = format!(
        "SELECT {} FROM calculation_result WHERE task_id = ?1 ORDER BY unit_id, node_id",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![task_id], read_result_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(ResultRow::into_domain).collect()
}

/// 写入一行结果 (original_weight 缺省取 weight)
pub(crate) fn insert_result(conn: &Connection, r: &NewCalculationResult) -> RepositoryResult<i64> {
    conn.execute(
        r#"
        INSERT INTO calculation_result (
            task_id, unit_id, node_id, node_code, node_name, node_type, parent_id,
            workload, weight, original_weight, value
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            r.task_id,
            r.unit_id,
            r.node_id,
            r.node_code,
            r.node_name,
            r.node_type.to_db_str(),
            r.parent_id,
            r.workload,
            r.weight,
            r.original_weight.or(r.weight),
            r.value,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// 汇总行写入: 已存在则覆盖数值 (重复汇总结果不变)
pub(crate) fn upsert_aggregate(
    conn: &Connection,
    r: &NewCalculationResult,
) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO calculation_result (
            task_id, unit_id, node_id, node_code, node_name, node_type, parent_id,
            workload, weight, original_weight, value
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9)
        ON CONFLICT(task_id, node_id, unit_id) DO UPDATE SET
            workload = excluded.workload,
            value = excluded.value
        "#,
        params![
            r.task_id,
            r.unit_id,
            r.node_id,
            r.node_code,
            r.node_name,
            r.node_type.to_db_str(),
            r.parent_id,
            r.workload,
            r.value,
        ],
    )?;
    Ok(())
}

/// 调整后的权重与价值 (original_weight 不动)
pub(crate) fn update_weight_value(
    conn: &Connection,
    result_id: i64,
    weight: f64,
    value: f64,
) -> RepositoryResult<()> {
    conn.execute(
        "UPDATE calculation_result SET weight = ?1, value = ?2 WHERE id = ?3",
        params![weight, value, result_id],
    )?;
    Ok(())
}

pub(crate) fn update_ratio(
    conn: &Connection,
    task_id: &str,
    unit_id: i64,
    node_id: i64,
    ratio: f64,
) -> RepositoryResult<()> {
    conn.execute(
        "UPDATE calculation_result SET ratio = ?1 WHERE task_id = ?2 AND unit_id = ?3 AND node_id = ?4",
        params![ratio, task_id, unit_id, node_id],
    )?;
    Ok(())
}

/// 汇总按 (task_id, unit_id) 覆盖写入 (内容不变时保留 updated_at)
pub(crate) fn upsert_summary(conn: &Connection, s: &CalculationSummary) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO calculation_summary (task_id, unit_id, categories_json, total_value, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(task_id, unit_id) DO UPDATE SET
            categories_json = excluded.categories_json,
            total_value = excluded.total_value,
            updated_at = CASE
                WHEN categories_json IS excluded.categories_json
                 AND total_value IS excluded.total_value
                THEN updated_at
                ELSE excluded.updated_at
            END
        "#,
        params![
            s.task_id,
            s.unit_id,
            serde_json::to_string(&s.categories)?,
            s.total_value,
            format_db_datetime(&s.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_adjustment(conn: &Connection, d: &AdjustmentDetail) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO adjustment_detail (
            task_id, unit_id, node_id, pass_name, rule_ref, actual_value,
            benchmark_value, ratio, coefficient, weight_before, weight_after,
            is_adjusted, reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            d.task_id,
            d.unit_id,
            d.node_id,
            d.pass_name,
            d.rule_ref,
            d.actual_value,
            d.benchmark_value,
            d.ratio,
            d.coefficient,
            d.weight_before,
            d.weight_after,
            d.is_adjusted,
            d.reason,
        ],
    )?;
    Ok(())
}

struct ResultRow {
    id: i64,
    task_id: String,
    unit_id: i64,
    node_id: i64,
    node_code: String,
    node_name: String,
    node_type: String,
    parent_id: Option<i64>,
    workload: f64,
    weight: Option<f64>,
    original_weight: Option<f64>,
    value: f64,
    ratio: Option<f64>,
    created_at: String,
}

fn read_result_row(row: &Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok(ResultRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        unit_id: row.get(2)?,
        node_id: row.get(3)?,
        node_code: row.get(4)?,
        node_name: row.get(5)?,
        node_type: row.get(6)?,
        parent_id: row.get(7)?,
        workload: row.get(8)?,
        weight: row.get(9)?,
        original_weight: row.get(10)?,
        value: row.get(11)?,
        ratio: row.get(12)?,
        created_at: row.get(13)?,
    })
}

impl ResultRow {
    fn into_domain(self) -> RepositoryResult<CalculationResult> {
        let node_type =
            NodeType::from_db_str(&self.node_type).ok_or_else(|| RepositoryError::FieldValueError {
                field: "node_type".to_string(),
                message: self.node_type.clone(),
            })?;
        Ok(CalculationResult {
            id: self.id,
            task_id: self.task_id,
            unit_id: self.unit_id,
            node_id: self.node_id,
            node_code: self.node_code,
            node_name: self.node_name,
            node_type,
            parent_id: self.parent_id,
            workload: self.workload,
            weight: self.weight,
            original_weight: self.original_weight,
            value: self.value,
            ratio: self.ratio,
            created_at: parse_db_datetime("created_at", &self.created_at)?,
        })
    }
}

struct SummaryRow {
    task_id: String,
    unit_id: i64,
    categories_json: String,
    total_value: f64,
    updated_at: String,
}

fn read_summary_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        task_id: row.get(0)?,
        unit_id: row.get(1)?,
        categories_json: row.get(2)?,
        total_value: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl SummaryRow {
    fn into_domain(self) -> RepositoryResult<CalculationSummary> {
        let categories: Vec<CategorySummary> = serde_json::from_str(&self.categories_json)?;
        Ok(CalculationSummary {
            task_id: self.task_id,
            unit_id: self.unit_id,
            categories,
            total_value: self.total_value,
            updated_at: parse_db_datetime("updated_at", &self.updated_at)?,
        })
    }
}
