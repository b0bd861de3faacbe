// ==========================================
// 医院业务价值核算 - 汇总与分类投影
// ==========================================
// rollup: 后序遍历模型树,非末级 value/workload = Σ 子节点,再计算占父比例
// summary: 每个单元按根节点 (一级分类) 投影,含总价值与占比
// 红线: 机构启用单元与有结果行的单元都补齐整棵树 (缺失末级写 0 行),父节点不缺失
// 红线: 两个运算均可重复执行,结果不变
// ==========================================

use crate::domain::model::ModelNode;
use crate::domain::result::{CalculationSummary, CategorySummary, NewCalculationResult};
use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope};
use crate::engine::script::load_tree;
use crate::repository::result_repo::{insert_result, load_results, update_ratio, upsert_aggregate, upsert_summary};
use crate::repository::unit_repo::list_active_units;
use chrono::Local;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

/// 单元内各节点的 (workload, value)
type UnitTotals = HashMap<i64, (f64, f64)>;

fn totals_by_unit(scope: &ExecutionScope<'_>, task_id: &str) -> Result<BTreeMap<i64, UnitTotals>, StepError> {
    let mut by_unit: BTreeMap<i64, UnitTotals> = BTreeMap::new();
    for row in load_results(scope.conn(), task_id)? {
        by_unit
            .entry(row.unit_id)
            .or_default()
            .insert(row.node_id, (row.workload, row.value));
    }
    Ok(by_unit)
}

fn result_for(task_id: &str, unit_id: i64, node: &ModelNode, workload: f64, value: f64) -> NewCalculationResult {
    NewCalculationResult {
        task_id: task_id.to_string(),
        unit_id,
        node_id: node.id,
        node_code: node.code.clone(),
        node_name: node.name.clone(),
        node_type: node.node_type,
        parent_id: node.parent_id,
        workload,
        weight: node.weight,
        original_weight: node.weight,
        value,
    }
}

/// 自下而上汇总
pub fn run_rollup(scope: &mut ExecutionScope<'_>) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let tree = load_tree(scope)?;
    let mut by_unit = totals_by_unit(scope, &task_id)?;
    // 本期无工作量的启用单元也要有整棵树
    for unit in list_active_units(scope.conn(), scope.organization_id()?)? {
        by_unit.entry(unit.id).or_default();
    }
    let conn = scope.conn();
    let order = tree.post_order();

    let mut zero_filled: u64 = 0;
    let mut aggregated: u64 = 0;

    for (&unit_id, totals) in by_unit.iter_mut() {
        scope.check_deadline()?;

        for &node_id in &order {
            let Some(node) = tree.node(node_id) else {
                continue;
            };
            if node.is_leaf {
                if !totals.contains_key(&node_id) {
                    insert_result(conn, &result_for(&task_id, unit_id, node, 0.0, 0.0))?;
                    totals.insert(node_id, (0.0, 0.0));
                    zero_filled += 1;
                }
                continue;
            }

            // 子节点均已在后序中先行处理
            let (workload, value) = tree.children(node_id).fold((0.0, 0.0), |(w, v), child| {
                let (cw, cv) = totals.get(&child.id).copied().unwrap_or((0.0, 0.0));
                (w + cw, v + cv)
            });
            let mut row = result_for(&task_id, unit_id, node, workload, value);
            row.weight = None;
            row.original_weight = None;
            upsert_aggregate(conn, &row)?;
            totals.insert(node_id, (workload, value));
            aggregated += 1;
        }

        for &node_id in &order {
            let Some(node) = tree.node(node_id) else {
                continue;
            };
            let value = totals.get(&node_id).map(|t| t.1).unwrap_or(0.0);
            let ratio = match node.parent_id {
                None => 1.0,
                Some(parent_id) => {
                    let parent_value = totals.get(&parent_id).map(|t| t.1).unwrap_or(0.0);
                    if parent_value == 0.0 {
                        0.0
                    } else {
                        value / parent_value
                    }
                }
            };
            update_ratio(conn, &task_id, unit_id, node_id, ratio)?;
        }
    }

    if zero_filled > 0 {
        scope.note(format!("补齐缺失末级 {} 行", zero_filled));
    }

    Ok(ExecutionResult {
        rows_affected: zero_filled + aggregated,
        payload: json!({
            "op": "rollup",
            "units": by_unit.len(),
            "zero_filled": zero_filled,
            "aggregated": aggregated,
        }),
        summary: format!(
            "汇总 {} 个单元, 非末级 {} 行, 补零 {} 行",
            by_unit.len(),
            aggregated,
            zero_filled
        ),
    })
}

/// 单元级分类汇总 (一级分类 = 根节点)
pub fn run_summary(scope: &mut ExecutionScope<'_>) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let tree = load_tree(scope)?;
    let by_unit = totals_by_unit(scope, &task_id)?;
    let conn = scope.conn();
    let now = Local::now().naive_local();

    for (&unit_id, totals) in &by_unit {
        scope.check_deadline()?;
        let values: Vec<(&ModelNode, f64)> = tree
            .roots()
            .map(|root| (root, totals.get(&root.id).map(|t| t.1).unwrap_or(0.0)))
            .collect();
        let total_value: f64 = values.iter().map(|(_, v)| v).sum();

        let categories = values
            .into_iter()
            .map(|(root, value)| CategorySummary {
                node_id: root.id,
                code: root.code.clone(),
                name: root.name.clone(),
                value,
                ratio: if total_value > 0.0 {
                    value / total_value * 100.0
                } else {
                    0.0
                },
            })
            .collect();

        upsert_summary(
            conn,
            &CalculationSummary {
                task_id: task_id.clone(),
                unit_id,
                categories,
                total_value,
                updated_at: now,
            },
        )?;
    }

    Ok(ExecutionResult {
        rows_affected: by_unit.len() as u64,
        payload: json!({
            "op": "summary",
            "units": by_unit.len(),
            "categories": tree.roots().count(),
        }),
        summary: format!("分类汇总 {} 个单元", by_unit.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::NewModelNode;
    use crate::engine::script::fixtures::{add_workload, setup};
    use crate::engine::script::leaf;
    use crate::repository::model_repo::insert_node;
    use crate::repository::result_repo::load_results;
    use rusqlite::params;

    fn summary_json(conn: &rusqlite::Connection) -> (String, f64, String) {
        conn.query_row(
            "SELECT categories_json, total_value, updated_at FROM calculation_summary WHERE task_id = 'T1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap()
    }

    #[test]
    fn test_rollup_sums_children_and_fills_missing_leaves() {
        let fx = setup(vec![]);
        let mid = insert_node(&fx.conn, fx.version_id, &NewModelNode::dimension("M", "手术", fx.seq_id)).unwrap();
        let deep = insert_node(&fx.conn, fx.version_id, &NewModelNode::leaf("M-1", "一级手术", mid, 2.0)).unwrap();
        add_workload(&fx.conn, "U1", "L", 100.0);
        let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
        leaf::run(&mut scope, None).unwrap();

        let result = run_rollup(&mut scope).unwrap();
        assert_eq!(result.payload["zero_filled"], 1);

        let rows = load_results(&fx.conn, "T1").unwrap();
        let by_node: HashMap<i64, _> = rows.iter().map(|r| (r.node_id, r)).collect();
        assert_eq!(by_node.len(), 4);
        assert_eq!(by_node[&deep].value, 0.0);
        assert_eq!(by_node[&deep].weight, Some(2.0));
        assert_eq!(by_node[&mid].value, 0.0);
        assert_eq!(by_node[&fx.seq_id].value, 1000.0);
        assert_eq!(by_node[&fx.seq_id].workload, 100.0);
        assert_eq!(by_node[&fx.seq_id].ratio, Some(1.0));
        assert_eq!(by_node[&fx.leaf_id].ratio, Some(1.0));
        assert_eq!(by_node[&mid].ratio, Some(0.0));
        // 父节点为 0 时占比为 0
        assert_eq!(by_node[&deep].ratio, Some(0.0));
    }

    #[test]
    fn test_rollup_covers_active_unit_without_workload() {
        let fx = setup(vec![]);
        fx.conn
            .execute(
                "INSERT INTO accounting_unit (organization_id, code, name, is_active) VALUES ('H1', 'U2', '外科', 1)",
                [],
            )
            .unwrap();
        let idle = fx.conn.last_insert_rowid();
        fx.conn
            .execute(
                "INSERT INTO accounting_unit (organization_id, code, name, is_active) VALUES ('H1', 'U3', '停用', 0)",
                [],
            )
            .unwrap();
        add_workload(&fx.conn, "U1", "L", 10.0);
        let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
        leaf::run(&mut scope, None).unwrap();
        run_rollup(&mut scope).unwrap();
        run_summary(&mut scope).unwrap();

        let rows = load_results(&fx.conn, "T1").unwrap();
        let idle_rows: Vec<_> = rows.iter().filter(|r| r.unit_id == idle).collect();
        assert_eq!(idle_rows.len(), 2);
        assert!(idle_rows.iter().all(|r| r.value == 0.0));
        assert_eq!(rows.iter().filter(|r| r.unit_id == fx.unit_id).count(), 2);
        // 停用单元不补行
        assert_eq!(rows.len(), 4);

        let summaries: i64 = fx
            .conn
            .query_row(
                "SELECT COUNT(*) FROM calculation_summary WHERE task_id = 'T1' AND unit_id = ?1",
                params![idle],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(summaries, 1);
    }

    #[test]
    fn test_rollup_is_repeatable() {
        let fx = setup(vec![]);
        add_workload(&fx.conn, "U1", "L", 3.0);
        let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
        leaf::run(&mut scope, None).unwrap();
        run_rollup(&mut scope).unwrap();
        let first: Vec<(i64, f64)> = load_results(&fx.conn, "T1").unwrap().iter().map(|r| (r.node_id, r.value)).collect();
        let again = run_rollup(&mut scope).unwrap();
        assert_eq!(again.payload["zero_filled"], 0);
        let second: Vec<(i64, f64)> = load_results(&fx.conn, "T1").unwrap().iter().map(|r| (r.node_id, r.value)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_summary_ratio_and_idempotence() {
        let fx = setup(vec![]);
        let nur = insert_node(&fx.conn, fx.version_id, &NewModelNode::sequence("N", "护理序列")).unwrap();
        insert_node(&fx.conn, fx.version_id, &NewModelNode::leaf("N-1", "护理", nur, 1.0)).unwrap();
        add_workload(&fx.conn, "U1", "L", 30.0);
        add_workload(&fx.conn, "U1", "N-1", 100.0);
        let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
        leaf::run(&mut scope, None).unwrap();
        run_rollup(&mut scope).unwrap();
        run_summary(&mut scope).unwrap();
        let first = summary_json(&fx.conn);

        let categories: Vec<CategorySummary> = serde_json::from_str(&first.0).unwrap();
        assert_eq!(first.1, 400.0);
        assert_eq!(categories[0].code, "S");
        assert!((categories[0].ratio - 75.0).abs() < 1e-9);
        assert!((categories[1].ratio - 25.0).abs() < 1e-9);

        run_summary(&mut scope).unwrap();
        assert_eq!(summary_json(&fx.conn), first);
    }

    #[test]
    fn test_summary_non_positive_total_gives_zero_ratio() {
        let fx = setup(vec![]);
        let cost = insert_node(&fx.conn, fx.version_id, &NewModelNode::leaf("S-cost-hr", "人员经费", fx.seq_id, 1.0)).unwrap();
        fx.conn
            .execute(
                "INSERT INTO calculation_result (task_id, unit_id, node_id, node_code, node_name, node_type, parent_id, workload, weight, original_weight, value) \
                 VALUES ('T1', ?1, ?2, 'S-cost-hr', '人员经费', 'dimension', ?3, 50, 1, 1, -50)",
                params![fx.unit_id, cost, fx.seq_id],
            )
            .unwrap();
        let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
        run_rollup(&mut scope).unwrap();
        run_summary(&mut scope).unwrap();
        let (json, total, _) = summary_json(&fx.conn);
        let categories: Vec<CategorySummary> = serde_json::from_str(&json).unwrap();
        assert_eq!(total, -50.0);
        assert_eq!(categories[0].ratio, 0.0);
    }
}
