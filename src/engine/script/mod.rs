// ==========================================
// 医院业务价值核算 - 脚本步骤执行器
// ==========================================
// 职责: 解析 JSON 脚本体,分派到内置运算
// 运算: leaf_workload / ladder_adjustment / coefficient_override /
//       cost_deduction / rollup / summary
// 红线: 只读写当前任务 (task_id) 的结果行
// ==========================================

pub mod adjustment;
pub mod cost;
pub mod leaf;
pub mod rollup;

use crate::domain::model::AccountingUnit;
use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope, StepExecutor};
use crate::engine::model_tree::ModelTree;
use crate::repository::model_repo::load_nodes;
use crate::repository::unit_repo::list_active_units;
use serde::Deserialize;
use std::collections::HashMap;

pub use cost::{CostField, CostMapping};

// ==========================================
// ScriptOp - 脚本运算
// ==========================================
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    /// 末级工作量入库: 工作量 × 权重
    LeafWorkload {
        #[serde(default)]
        source_table: Option<String>,
    },
    /// 业务导向阶梯调整
    LadderAdjustment,
    /// 学科系数覆盖
    CoefficientOverride,
    /// 成本扣减 (负值末级行)
    CostDeduction {
        #[serde(default)]
        mapping: Vec<CostMapping>,
    },
    /// 自下而上汇总 + 占比
    Rollup,
    /// 单元级分类汇总
    Summary,
}

impl ScriptOp {
    pub fn parse(body: &str) -> Result<Self, StepError> {
        serde_json::from_str(body).map_err(|e| StepError::Syntax(format!("脚本解析失败: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptOp::LeafWorkload { .. } => "leaf_workload",
            ScriptOp::LadderAdjustment => "ladder_adjustment",
            ScriptOp::CoefficientOverride => "coefficient_override",
            ScriptOp::CostDeduction { .. } => "cost_deduction",
            ScriptOp::Rollup => "rollup",
            ScriptOp::Summary => "summary",
        }
    }
}

pub struct ScriptExecutor;

impl StepExecutor for ScriptExecutor {
    fn execute(
        &self,
        body: &str,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let op = ScriptOp::parse(body)?;
        tracing::debug!(op = op.name(), "执行脚本运算");
        match op {
            ScriptOp::LeafWorkload { source_table } => leaf::run(scope, source_table.as_deref()),
            ScriptOp::LadderAdjustment => adjustment::run_ladder(scope),
            ScriptOp::CoefficientOverride => adjustment::run_coefficient_override(scope),
            ScriptOp::CostDeduction { mapping } => cost::run(scope, &mapping),
            ScriptOp::Rollup => rollup::run_rollup(scope),
            ScriptOp::Summary => rollup::run_summary(scope),
        }
    }
}

/// 加载任务绑定版本的模型树
pub(crate) fn load_tree(scope: &ExecutionScope<'_>) -> Result<ModelTree, StepError> {
    let version_id = scope.model_version_id()?;
    let nodes = load_nodes(scope.conn(), version_id)?;
    Ok(ModelTree::build(version_id, nodes)?)
}

/// 机构有效核算单元 (按编码索引)
pub(crate) fn load_units_by_code(
    scope: &ExecutionScope<'_>,
) -> Result<HashMap<String, AccountingUnit>, StepError> {
    let units = list_active_units(scope.conn(), scope.organization_id()?)?;
    Ok(units.into_iter().map(|u| (u.code.clone(), u)).collect())
}

/// 单元ID -> 单元编码 (含停用单元,已写入的结果行仍需匹配规则)
pub(crate) fn load_unit_codes_by_id(
    scope: &ExecutionScope<'_>,
) -> Result<HashMap<i64, String>, StepError> {
    let organization_id = scope.organization_id()?;
    let mut stmt = scope
        .conn()
        .prepare("SELECT id, code FROM accounting_unit WHERE organization_id = ?1")
        .map_err(|e| scope.classify(e))?;
    let pairs = stmt
        .query_map([organization_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| scope.classify(e))?
        .collect::<rusqlite::Result<HashMap<i64, String>>>()
        .map_err(|e| scope.classify(e))?;
    Ok(pairs)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ops() {
        assert_eq!(ScriptOp::parse(r#"{"op":"rollup"}"#).unwrap(), ScriptOp::Rollup);
        assert_eq!(
            ScriptOp::parse(r#"{"op":"leaf_workload","source_table":"his_workload"}"#).unwrap(),
            ScriptOp::LeafWorkload {
                source_table: Some("his_workload".to_string())
            }
        );
        assert_eq!(
            ScriptOp::parse(r#"{"op":"cost_deduction"}"#).unwrap(),
            ScriptOp::CostDeduction { mapping: vec![] }
        );
    }

    #[test]
    fn test_unknown_op_and_bad_json_are_syntax_errors() {
        for body in [r#"{"op":"explode"}"#, "not json", r#"{"no_op":1}"#] {
            assert_eq!(ScriptOp::parse(body).unwrap_err().kind(), "syntax", "{}", body);
        }
    }
}
