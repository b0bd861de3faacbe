// ==========================================
// 医院业务价值核算 - 结果一致性校验
// ==========================================
// 校验项:
//   1. (task_id, node_id, unit_id) 重复行
//   2. 非末级节点 value = Σ 子节点 value (逐单元)
//   3. 汇总总价值 = Σ 分类价值 = Σ 根节点 value
// 只读,不修改任何结果
// ==========================================

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::model_tree::ModelTree;
use crate::repository::{
    DuplicateResultKey, ModelNodeRepository, ResultRepository, TaskRepository,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// 数值比较容差 (相对)
const TOLERANCE: f64 = 1e-6;

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupMismatch {
    pub unit_id: i64,
    pub node_id: i64,
    pub node_code: String,
    pub stored_value: f64,
    pub children_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMismatch {
    pub unit_id: i64,
    pub total_value: f64,
    pub category_sum: f64,
    pub root_sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub task_id: String,
    pub result_rows: usize,
    pub duplicate_keys: Vec<(i64, i64, i64)>, // (node_id, unit_id, 行数)
    pub rollup_mismatches: Vec<RollupMismatch>,
    pub summary_mismatches: Vec<SummaryMismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicate_keys.is_empty()
            && self.rollup_mismatches.is_empty()
            && self.summary_mismatches.is_empty()
    }
}

pub struct ConsistencyChecker {
    task_repo: TaskRepository,
    node_repo: ModelNodeRepository,
    result_repo: ResultRepository,
}

impl ConsistencyChecker {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            task_repo: TaskRepository::from_connection(conn.clone()),
            node_repo: ModelNodeRepository::from_connection(conn.clone()),
            result_repo: ResultRepository::from_connection(conn),
        }
    }

    pub fn verify_task(&self, task_id: &str) -> EngineResult<ConsistencyReport> {
        let task = self
            .task_repo
            .find_by_id(task_id)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let tree = ModelTree::build(
            task.model_version_id,
            self.node_repo.find_by_version(task.model_version_id)?,
        )?;

        let duplicate_keys = self
            .result_repo
            .find_duplicate_keys(task_id)?
            .into_iter()
            .map(|DuplicateResultKey { node_id, unit_id, row_count }| (node_id, unit_id, row_count))
            .collect();

        let results = self.result_repo.list_by_task(task_id)?;
        let result_rows = results.len();
        let mut values: BTreeMap<i64, HashMap<i64, f64>> = BTreeMap::new();
        for row in &results {
            *values.entry(row.unit_id).or_default().entry(row.node_id).or_insert(0.0) += row.value;
        }

        let mut rollup_mismatches = Vec::new();
        for (&unit_id, unit_values) in &values {
            for node_id in tree.post_order() {
                let Some(node) = tree.node(node_id) else {
                    continue;
                };
                if node.is_leaf {
                    continue;
                }
                let Some(&stored_value) = unit_values.get(&node_id) else {
                    continue;
                };
                let children_value: f64 = tree
                    .children(node_id)
                    .map(|c| unit_values.get(&c.id).copied().unwrap_or(0.0))
                    .sum();
                if !approx_eq(stored_value, children_value) {
                    rollup_mismatches.push(RollupMismatch {
                        unit_id,
                        node_id,
                        node_code: node.code.clone(),
                        stored_value,
                        children_value,
                    });
                }
            }
        }

        let mut summary_mismatches = Vec::new();
        for summary in self.result_repo.list_summaries(task_id)? {
            let category_sum: f64 = summary.categories.iter().map(|c| c.value).sum();
            let root_sum: f64 = values
                .get(&summary.unit_id)
                .map(|unit_values| {
                    tree.roots()
                        .map(|r| unit_values.get(&r.id).copied().unwrap_or(0.0))
                        .sum()
                })
                .unwrap_or(0.0);
            if !approx_eq(summary.total_value, category_sum) || !approx_eq(category_sum, root_sum) {
                summary_mismatches.push(SummaryMismatch {
                    unit_id: summary.unit_id,
                    total_value: summary.total_value,
                    category_sum,
                    root_sum,
                });
            }
        }

        let report = ConsistencyReport {
            task_id: task_id.to_string(),
            result_rows,
            duplicate_keys,
            rollup_mismatches,
            summary_mismatches,
        };
        if !report.is_consistent() {
            tracing::warn!(
                task_id,
                duplicates = report.duplicate_keys.len(),
                rollup = report.rollup_mismatches.len(),
                summary = report.summary_mismatches.len(),
                "任务结果不一致"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::ExecutionScope;
    use crate::engine::script::fixtures::{add_workload, setup};
    use crate::engine::script::{leaf, rollup};

    #[test]
    fn test_detects_tampered_aggregate() {
        let fx = setup(vec![]);
        add_workload(&fx.conn, "U1", "L", 10.0);
        {
            let mut scope = ExecutionScope::new(&fx.conn, fx.ctx());
            leaf::run(&mut scope, None).unwrap();
            rollup::run_rollup(&mut scope).unwrap();
            rollup::run_summary(&mut scope).unwrap();
        }
        let seq_id = fx.seq_id;
        let shared = Arc::new(Mutex::new(fx.conn));
        let checker = ConsistencyChecker::from_connection(shared.clone());

        let report = checker.verify_task("T1").unwrap();
        assert!(report.is_consistent(), "{:?}", report);
        assert_eq!(report.result_rows, 2);

        shared
            .lock()
            .unwrap()
            .execute(
                "UPDATE calculation_result SET value = 1 WHERE node_id = ?1",
                [seq_id],
            )
            .unwrap();
        let report = checker.verify_task("T1").unwrap();
        assert_eq!(report.rollup_mismatches.len(), 1);
        assert_eq!(report.rollup_mismatches[0].children_value, 100.0);
        assert_eq!(report.summary_mismatches.len(), 1);
    }
}
