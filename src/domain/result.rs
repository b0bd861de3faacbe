// ==========================================
// 医院业务价值核算 - 计算结果与汇总
// ==========================================
// 红线: 同一任务内 (node_id, unit_id) 至多一行,否则汇总时重复计值
// 红线: original_weight 首次写入后不再修改
// ==========================================

use crate::domain::types::NodeType;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// CalculationResult - 计算结果明细
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationResult {
    pub id: i64,
    pub task_id: String,
    pub unit_id: i64,
    pub node_id: i64,
    pub node_code: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub parent_id: Option<i64>,
    pub workload: f64,                // 工作量 (原始计量)
    pub weight: Option<f64>,          // 当前权重 (可能已调整)
    pub original_weight: Option<f64>, // 调整前权重
    pub value: f64,                   // 价值 (带符号: 负值为成本)
    pub ratio: Option<f64>,           // 占父节点比例
    pub created_at: NaiveDateTime,
}

/// 待写入的结果行
#[derive(Debug, Clone)]
pub struct NewCalculationResult {
    pub task_id: String,
    pub unit_id: i64,
    pub node_id: i64,
    pub node_code: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub parent_id: Option<i64>,
    pub workload: f64,
    pub weight: Option<f64>,
    pub original_weight: Option<f64>,
    pub value: f64,
}

// ==========================================
// CategorySummary - 一级分类汇总
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub node_id: i64,
    pub code: String,
    pub name: String,
    pub value: f64,
    pub ratio: f64, // 占总价值百分比 (0-100)
}

// ==========================================
// CalculationSummary - 核算单元汇总
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationSummary {
    pub task_id: String,
    pub unit_id: i64,
    pub categories: Vec<CategorySummary>,
    pub total_value: f64,
    pub updated_at: NaiveDateTime,
}

impl CalculationSummary {
    /// 按编码查找分类
    pub fn category(&self, code: &str) -> Option<&CategorySummary> {
        self.categories.iter().find(|c| c.code == code)
    }
}

// ==========================================
// AdjustmentDetail - 调整过程明细
// ==========================================
// 记录每一次导向/系数调整的输入与决策,供事后核查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentDetail {
    pub task_id: String,
    pub unit_id: i64,
    pub node_id: i64,
    pub pass_name: String,        // ladder_adjustment / coefficient_override
    pub rule_ref: Option<String>, // 规则标识
    pub actual_value: Option<f64>,
    pub benchmark_value: Option<f64>,
    pub ratio: Option<f64>,
    pub coefficient: Option<f64>,
    pub weight_before: Option<f64>,
    pub weight_after: Option<f64>,
    pub is_adjusted: bool,
    pub reason: Option<String>,   // 未调整原因
}
