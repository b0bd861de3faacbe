// ==========================================
// 医院业务价值核算 - 成本扣减
// ==========================================
// 成本报表字段 -> 成本维度末级节点,写入负值行:
//   workload = 成本金额, value = -1 × workload × weight
// 未显式配置映射时按节点编码后缀识别:
//   *-cost-hr / *-cost-mat / *-cost-depr / *-cost-other
// ==========================================

use crate::domain::model::ModelNode;
use crate::domain::result::NewCalculationResult;
use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope};
use crate::engine::model_tree::ModelTree;
use crate::engine::script::{load_tree, load_units_by_code};
use crate::repository::result_repo::insert_result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// 成本报表字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostField {
    PersonnelCost,
    MaterialCost,
    DepreciationCost,
    OtherCost,
}

impl CostField {
    pub const ALL: [CostField; 4] = [
        CostField::PersonnelCost,
        CostField::MaterialCost,
        CostField::DepreciationCost,
        CostField::OtherCost,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            CostField::PersonnelCost => "personnel_cost",
            CostField::MaterialCost => "material_cost",
            CostField::DepreciationCost => "depreciation_cost",
            CostField::OtherCost => "other_cost",
        }
    }

    /// 在 CostField::ALL 中的位置 (即查询列序)
    fn index(&self) -> usize {
        match self {
            CostField::PersonnelCost => 0,
            CostField::MaterialCost => 1,
            CostField::DepreciationCost => 2,
            CostField::OtherCost => 3,
        }
    }

    /// 节点编码后缀
    pub fn code_suffix(&self) -> &'static str {
        match self {
            CostField::PersonnelCost => "-cost-hr",
            CostField::MaterialCost => "-cost-mat",
            CostField::DepreciationCost => "-cost-depr",
            CostField::OtherCost => "-cost-other",
        }
    }

    pub fn from_node_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| code.ends_with(f.code_suffix()))
    }
}

/// 显式映射: 维度编码 -> 成本字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMapping {
    pub dimension_code: String,
    pub cost_field: CostField,
}

/// 解析映射到模型节点 (只接受末级维度)
fn resolve_targets<'t>(
    tree: &'t ModelTree,
    mapping: &[CostMapping],
) -> Result<Vec<(&'t ModelNode, CostField)>, StepError> {
    if mapping.is_empty() {
        return Ok(tree
            .leaves()
            .into_iter()
            .filter_map(|n| CostField::from_node_code(&n.code).map(|f| (n, f)))
            .collect());
    }
    mapping
        .iter()
        .map(|m| {
            tree.node_by_code(&m.dimension_code)
                .filter(|n| n.is_leaf_dimension())
                .map(|n| (n, m.cost_field))
                .ok_or_else(|| {
                    StepError::Syntax(format!("成本维度不存在或非末级: {}", m.dimension_code))
                })
        })
        .collect()
}

pub fn run(
    scope: &mut ExecutionScope<'_>,
    mapping: &[CostMapping],
) -> Result<ExecutionResult, StepError> {
    let task_id = scope.task_id()?.to_string();
    let period = scope.period()?.to_string();
    let organization_id = scope.organization_id()?.to_string();
    let tree = load_tree(scope)?;
    let units = load_units_by_code(scope)?;
    let targets = resolve_targets(&tree, mapping)?;
    let table = scope.qualify("cost_report")?;
    let conn = scope.conn();

    if targets.is_empty() {
        scope.note("模型中没有成本维度");
        return Ok(ExecutionResult {
            rows_affected: 0,
            payload: json!({ "op": "cost_deduction", "inserted": 0, "cost_dimensions": 0 }),
            summary: "无成本维度, 未写入".to_string(),
        });
    }

    let columns: Vec<&str> = CostField::ALL.iter().map(|f| f.column()).collect();
    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT unit_code, {}
            FROM {}
            WHERE organization_id = ?1 AND period = ?2
            ORDER BY unit_code
            "#,
            columns.join(", "),
            table
        ))
        .map_err(|e| scope.classify(e))?;
    let reports = stmt
        .query_map(params![organization_id, period], |row| {
            Ok((
                row.get::<_, String>(0)?,
                [
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                ],
            ))
        })
        .map_err(|e| scope.classify(e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| scope.classify(e))?;

    let mut inserted: u64 = 0;
    let mut units_covered: u64 = 0;
    for (unit_code, costs) in reports {
        let Some(unit) = units.get(&unit_code) else {
            continue;
        };
        scope.check_deadline()?;
        units_covered += 1;
        for &(node, field) in &targets {
            let workload = costs[field.index()];
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
                    value: -workload * weight,
                },
            )?;
            inserted += 1;
        }
    }

    Ok(ExecutionResult {
        rows_affected: inserted,
        payload: json!({
            "op": "cost_deduction",
            "inserted": inserted,
            "units": units_covered,
            "cost_dimensions": targets.len(),
        }),
        summary: format!("成本扣减写入 {} 行 ({} 个单元)", inserted, units_covered),
    })
}
