// ==========================================
// 医院业务价值核算 - 末级工作量入库
// ==========================================
// 按 (核算单元, 末级维度) 汇总工作量,写入 value = workload × weight
// 红线: 每个 (task, node, unit) 只写一次,重复执行由唯一约束拒绝
// ==========================================

use crate::domain::result::NewCalculationResult;
use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope};
use crate::engine::script::{load_tree, load_units_by_code};
use crate::repository::result_repo::insert_result;
use rusqlite::params;
use serde_json::json;

pub const DEFAULT_WORKLOAD_TABLE: &str = "workload_record";

pub fn run(
    scope: &mut ExecutionScope<'_>,
    source_table: Option<&str>,
) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let period = scope.period()?.to_string();
    let organization_id = scope.organization_id()?.to_string();
    let tree = load_tree(scope)?;
    let units = load_units_by_code(scope)?;
    let table = scope.qualify(source_table.unwrap_or(DEFAULT_WORKLOAD_TABLE))?;

    let conn = scope.conn();
    let sql = format!(
        r#"
        SELECT unit_code, dimension_code, SUM(quantity)
        FROM {}
        WHERE organization_id = ?1 AND period = ?2
        GROUP BY unit_code, dimension_code
        ORDER BY unit_code, dimension_code
        "#,
        table
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| scope.classify(e))?;
    let grouped = stmt
        .query_map(params![organization_id, period], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })
        .map_err(|e| scope.classify(e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| scope.classify(e))?;

    let mut inserted: u64 = 0;
    let mut unknown_unit: u64 = 0;
    let mut unknown_dimension: u64 = 0;

    for (unit_code, dimension_code, workload) in grouped {
        scope.check_deadline()?;
        let Some(unit) = units.get(&unit_code) else {
            unknown_unit += 1;
            continue;
        };
        let Some(node) = tree
            .node_by_code(&dimension_code)
            .filter(|n| n.is_leaf_dimension())
        else {
            unknown_dimension += 1;
            continue;
        };

        let weight = node.effective_weight();
        insert_result(
            conn,
            &NewCalculationResult {
                task_id: task_id.clone(),
                unit_id: unit.id,
                node_id: node.id,
                node_code: node.code.clone(),
                node_name: node.name.clone(),
                node_type: node.node_type,
                parent_id: node.parent_id,
                workload,
                weight: Some(weight),
                original_weight: Some(weight),
                value: workload * weight,
            },
        )?;
        inserted += 1;
    }

    if unknown_unit + unknown_dimension > 0 {
        tracing::warn!(
            task_id = %task_id,
            unknown_unit,
            unknown_dimension,
            "工作量记录存在未匹配的单元或维度"
        );
        scope.note(format!(
            "未匹配: 单元 {} 组, 维度 {} 组",
            unknown_unit, unknown_dimension
        ));
    }

    Ok(ExecutionResult {
        rows_affected: inserted,
        payload: json!({
            "op": "leaf_workload",
            "inserted": inserted,
            "unmatched_unit": unknown_unit,
            "unmatched_dimension": unknown_dimension,
        }),
        summary: format!("末级工作量写入 {} 行", inserted),
    })
}
