// ==========================================
// 医院业务价值核算 - 权重调整
// ==========================================
// ladder_adjustment: 业务导向规则 (阶梯 / 固定标杆)
// coefficient_override: 学科系数 (单元 × 维度)
// 红线: 只改 weight 与 value,original_weight 不动
// 红线: 多次调整在当前权重上连乘,顺序由步骤 sort_key 决定
// ==========================================

use crate::domain::result::{AdjustmentDetail, CalculationResult};
use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope};
use crate::engine::model_tree::ModelTree;
use crate::engine::script::{load_tree, load_unit_codes_by_id};
use crate::repository::result_repo::{insert_adjustment, load_results, update_weight_value};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

pub const LADDER_PASS: &str = "ladder_adjustment";
pub const OVERRIDE_PASS: &str = "coefficient_override";

/// 业务导向规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrientationType {
    /// 实际/标杆 比值落入阶梯区间,取区间强度
    BenchmarkLadder,
    /// 实际/标杆 比值直接作为系数
    FixedBenchmark,
}

impl OrientationType {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "benchmark_ladder" => Some(OrientationType::BenchmarkLadder),
            "fixed_benchmark" => Some(OrientationType::FixedBenchmark),
            _ => None,
        }
    }
}

/// 单条规则对单个 (单元, 节点) 的判定
#[derive(Debug, Clone, PartialEq)]
struct RuleDecision {
    actual: Option<f64>,
    benchmark: Option<f64>,
    ratio: Option<f64>,
    coefficient: Option<f64>,
    reason: Option<String>,
}

impl RuleDecision {
    fn skipped(reason: &str) -> Self {
        Self {
            actual: None,
            benchmark: None,
            ratio: None,
            coefficient: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// 参考表名 (数据源绑定时带别名)
struct OrientationTables {
    rule: String,
    benchmark: String,
    actual: String,
    ladder: String,
}

impl OrientationTables {
    fn qualified(scope: &ExecutionScope<'_>) -> Result<Self, StepError> {
        Ok(Self {
            rule: scope.qualify("orientation_rule")?,
            benchmark: scope.qualify("orientation_benchmark")?,
            actual: scope.qualify("orientation_actual")?,
            ladder: scope.qualify("orientation_ladder")?,
        })
    }
}

/// 待调整的末级行 (按树中的末级维度过滤)
fn leaf_rows<'t>(
    rows: Vec<CalculationResult>,
    tree: &'t ModelTree,
) -> Vec<(CalculationResult, &'t crate::domain::model::ModelNode)> {
    rows.into_iter()
        .filter_map(|row| {
            tree.node(row.node_id)
                .filter(|n| n.is_leaf_dimension())
                .map(|n| (row, n))
        })
        .collect()
}

fn evaluate_rule(
    scope: &ExecutionScope<'_>,
    tables: &OrientationTables,
    rule_id: i64,
    unit_code: &str,
    period: &str,
) -> Result<RuleDecision, StepError> {
    let conn = scope.conn();
    let classify = |e: rusqlite::Error| scope.classify(e);

    let rule_type: Option<String> = conn
        .prepare_cached(&format!("SELECT orientation_type FROM {} WHERE id = ?1", tables.rule))
        .map_err(classify)?
        .query_row(params![rule_id], |row| row.get(0))
        .optional()
        .map_err(classify)?;
    let Some(rule_type) = rule_type.as_deref().and_then(OrientationType::from_db_str) else {
        return Ok(RuleDecision::skipped("规则不存在"));
    };

    let benchmark: Option<f64> = conn
        .prepare_cached(&format!(
            "SELECT benchmark_value FROM {} WHERE rule_id = ?1 AND unit_code = ?2 AND period = ?3",
            tables.benchmark
        ))
        .map_err(classify)?
        .query_row(params![rule_id, unit_code, period], |row| row.get(0))
        .optional()
        .map_err(classify)?;
    let actual: Option<f64> = conn
        .prepare_cached(&format!(
            "SELECT actual_value FROM {} WHERE rule_id = ?1 AND unit_code = ?2 AND period = ?3",
            tables.actual
        ))
        .map_err(classify)?
        .query_row(params![rule_id, unit_code, period], |row| row.get(0))
        .optional()
        .map_err(classify)?;

    let mut decision = RuleDecision {
        actual,
        benchmark,
        ..RuleDecision::skipped("")
    };

    let (benchmark, actual) = match (benchmark, actual) {
        (None, _) => {
            decision.reason = Some("无标杆值".to_string());
            return Ok(decision);
        }
        (Some(b), _) if b == 0.0 => {
            decision.reason = Some("标杆值为 0".to_string());
            return Ok(decision);
        }
        (Some(_), None) => {
            decision.reason = Some("无实际值".to_string());
            return Ok(decision);
        }
        (Some(b), Some(a)) => (b, a),
    };

    let ratio = actual / benchmark;
    decision.ratio = Some(ratio);

    match rule_type {
        OrientationType::FixedBenchmark => {
            decision.coefficient = Some(ratio);
            decision.reason = None;
        }
        OrientationType::BenchmarkLadder => {
            let intensity: Option<f64> = conn
                .prepare_cached(&format!(
                    r#"
                    SELECT intensity FROM {}
                    WHERE rule_id = ?1
                      AND lower_limit <= ?2
                      AND (upper_limit IS NULL OR ?2 < upper_limit)
                    ORDER BY lower_limit DESC
                    LIMIT 1
                    "#,
                    tables.ladder
                ))
                .map_err(classify)?
                .query_row(params![rule_id, ratio], |row| row.get(0))
                .optional()
                .map_err(classify)?;
            match intensity {
                Some(c) => {
                    decision.coefficient = Some(c);
                    decision.reason = None;
                }
                None => decision.reason = Some("无匹配阶梯".to_string()),
            }
        }
    }
    Ok(decision)
}

/// 业务导向阶梯调整
pub fn run_ladder(scope: &mut ExecutionScope<'_>) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let period = scope.period()?.to_string();
    let tree = load_tree(scope)?;
    let unit_codes = load_unit_codes_by_id(scope)?;
    let tables = OrientationTables::qualified(scope)?;
    let conn = scope.conn();

    let rows = load_results(conn, &task_id)?;
    let mut adjusted_rows: u64 = 0;
    let mut details: u64 = 0;
    let mut skipped: u64 = 0;

    for (row, node) in leaf_rows(rows, &tree) {
        if node.orientation_rule_ids.is_empty() {
            continue;
        }
        let Some(unit_code) = unit_codes.get(&row.unit_id) else {
            continue;
        };
        scope.check_deadline()?;

        let mut weight = row.weight.unwrap_or(0.0);
        let mut value = row.value;
        let mut changed = false;

        for &rule_id in &node.orientation_rule_ids {
            let decision = evaluate_rule(scope, &tables, rule_id, unit_code, &period)?;
            let weight_before = weight;
            if let Some(c) = decision.coefficient {
                weight *= c;
                value *= c;
                changed = true;
            } else {
                skipped += 1;
            }
            insert_adjustment(
                conn,
                &AdjustmentDetail {
                    task_id: task_id.clone(),
                    unit_id: row.unit_id,
                    node_id: row.node_id,
                    pass_name: LADDER_PASS.to_string(),
                    rule_ref: Some(format!("orientation_rule:{}", rule_id)),
                    actual_value: decision.actual,
                    benchmark_value: decision.benchmark,
                    ratio: decision.ratio,
                    coefficient: decision.coefficient,
                    weight_before: Some(weight_before),
                    weight_after: Some(weight),
                    is_adjusted: decision.coefficient.is_some(),
                    reason: decision.reason,
                },
            )?;
            details += 1;
        }

        if changed {
            update_weight_value(conn, row.id, weight, value)?;
            adjusted_rows += 1;
        }
    }

    Ok(ExecutionResult {
        rows_affected: adjusted_rows,
        payload: json!({
            "op": LADDER_PASS,
            "adjusted_rows": adjusted_rows,
            "detail_rows": details,
            "not_adjusted": skipped,
        }),
        summary: format!(
            "业务导向调整 {} 行, 未调整判定 {} 条",
            adjusted_rows, skipped
        ),
    })
}

/// 学科系数覆盖
pub fn run_coefficient_override(scope: &mut ExecutionScope<'_>) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let version_id = scope.model_version_id()?;
    let organization_id = scope.organization_id()?.to_string();
    let tree = load_tree(scope)?;
    let unit_codes = load_unit_codes_by_id(scope)?;
    let rule_table = scope.qualify("discipline_rule")?;
    let conn = scope.conn();

    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT unit_code, dimension_code, coefficient
            FROM {}
            WHERE model_version_id = ?1 AND organization_id = ?2
            "#,
            rule_table
        ))
        .map_err(|e| scope.classify(e))?;
    let coefficients: HashMap<(String, String), f64> = stmt
        .query_map(params![version_id, organization_id], |row| {
            Ok(((row.get(0)?, row.get(1)?), row.get(2)?))
        })
        .map_err(|e| scope.classify(e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| scope.classify(e))?;

    let rows = load_results(conn, &task_id)?;
    let mut adjusted_rows: u64 = 0;

    for (row, node) in leaf_rows(rows, &tree) {
        let Some(unit_code) = unit_codes.get(&row.unit_id) else {
            continue;
        };
        let key = (unit_code.clone(), node.code.clone());
        let Some(&coefficient) = coefficients.get(&key) else {
            continue;
        };
        scope.check_deadline()?;

        let weight_before = row.weight.unwrap_or(0.0);
        let weight_after = weight_before * coefficient;
        update_weight_value(conn, row.id, weight_after, row.value * coefficient)?;
        insert_adjustment(
            conn,
            &AdjustmentDetail {
                task_id: task_id.clone(),
                unit_id: row.unit_id,
                node_id: row.node_id,
                pass_name: OVERRIDE_PASS.to_string(),
                rule_ref: Some(format!("discipline_rule:{}/{}", unit_code, node.code)),
                actual_value: None,
                benchmark_value: None,
                ratio: None,
                coefficient: Some(coefficient),
                weight_before: Some(weight_before),
                weight_after: Some(weight_after),
                is_adjusted: true,
                reason: None,
            },
        )?;
        adjusted_rows += 1;
    }

    Ok(ExecutionResult {
        rows_affected: adjusted_rows,
        payload: json!({
            "op": OVERRIDE_PASS,
            "adjusted_rows": adjusted_rows,
            "rules_loaded": coefficients.len(),
        }),
        summary: format!("学科系数调整 {} 行", adjusted_rows),
    })
}
