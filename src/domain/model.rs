// ==========================================
// 医院业务价值核算 - 模型版本与模型节点
// ==========================================
// 红线: 计算过程中模型树只读
// 红线: 序列节点不持有权重,只由子节点汇总
// ==========================================

use crate::domain::types::NodeType;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// ModelVersion - 模型版本
// ==========================================
// 用途: 一棵模型树的不可变快照,编辑即产生新版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: i64,                   // 版本ID
    pub organization_id: String,   // 医疗机构ID
    pub name: String,              // 版本名称
    pub description: Option<String>,
    pub is_active: bool,           // 是否为该机构当前激活版本
    pub created_at: NaiveDateTime, // 创建时间
}

// ==========================================
// ModelNode - 模型节点
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelNode {
    pub id: i64,
    pub model_version_id: i64,
    pub code: String,               // 节点编码 (版本内唯一)
    pub name: String,               // 节点名称
    pub node_type: NodeType,        // 序列 / 维度
    pub is_leaf: bool,              // 是否末级
    pub parent_id: Option<i64>,     // 父节点 (根节点为 None)
    pub weight: Option<f64>,        // 权重/单价 (仅末级维度有意义)
    pub orientation_rule_ids: Vec<i64>, // 绑定的业务导向规则
    pub sort_order: i32,            // 同级展示顺序
}

impl ModelNode {
    /// 是否末级维度节点 (唯一直接承载工作量的节点)
    pub fn is_leaf_dimension(&self) -> bool {
        self.is_leaf && self.node_type == NodeType::Dimension
    }

    /// 计算使用的权重 (未配置视为 0)
    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(0.0)
    }
}

/// 新建节点的参数 (id 由数据库生成)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewModelNode {
    pub code: String,
    pub name: String,
    pub node_type: NodeType,
    pub is_leaf: bool,
    pub parent_id: Option<i64>,
    pub weight: Option<f64>,
    pub orientation_rule_ids: Vec<i64>,
    pub sort_order: i32,
}

impl NewModelNode {
    /// 序列节点 (树根,一级分类)
    pub fn sequence(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            node_type: NodeType::Sequence,
            is_leaf: false,
            parent_id: None,
            weight: None,
            orientation_rule_ids: Vec::new(),
            sort_order: 0,
        }
    }

    /// 中间维度节点
    pub fn dimension(code: &str, name: &str, parent_id: i64) -> Self {
        Self {
            node_type: NodeType::Dimension,
            parent_id: Some(parent_id),
            ..Self::sequence(code, name)
        }
    }

    /// 末级维度节点
    pub fn leaf(code: &str, name: &str, parent_id: i64, weight: f64) -> Self {
        Self {
            is_leaf: true,
            weight: Some(weight),
            ..Self::dimension(code, name, parent_id)
        }
    }

    pub fn with_orientation_rules(mut self, rule_ids: Vec<i64>) -> Self {
        self.orientation_rule_ids = rule_ids;
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
}

// ==========================================
// AccountingUnit - 核算单元 (科室/成本中心)
// ==========================================
// 外部只读维表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingUnit {
    pub id: i64,
    pub organization_id: String,
    pub code: String,
    pub name: String,
    pub is_active: bool,
}
