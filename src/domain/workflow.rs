// ==========================================
// 医院业务价值核算 - 计算流程与计算步骤
// ==========================================
// 步骤独立于任务编写,同一流程下的所有任务复用同一组步骤
// ==========================================

use crate::domain::sort_key::SortKey;
use crate::domain::types::CodeKind;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// CalculationWorkflow - 计算流程
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationWorkflow {
    pub id: i64,
    pub model_version_id: i64, // 绑定的模型版本
    pub name: String,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub created_at: NaiveDateTime,
}

// ==========================================
// CalculationStep - 计算步骤
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationStep {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub code_kind: CodeKind,             // 执行方言
    pub body: String,                    // 带占位符的代码模板
    pub sort_key: SortKey,               // 执行顺序 (有理数)
    pub is_enabled: bool,
    pub data_source_ref: Option<String>, // 绑定的外部数据源名称
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// 新建步骤的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCalculationStep {
    pub name: String,
    pub description: Option<String>,
    pub code_kind: CodeKind,
    pub body: String,
    pub is_enabled: bool,
    pub data_source_ref: Option<String>,
}

impl NewCalculationStep {
    pub fn sql(name: &str, body: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            code_kind: CodeKind::Sql,
            body: body.to_string(),
            is_enabled: true,
            data_source_ref: None,
        }
    }

    pub fn script(name: &str, body: &str) -> Self {
        Self {
            code_kind: CodeKind::Script,
            ..Self::sql(name, body)
        }
    }

    pub fn with_data_source(mut self, data_source_ref: &str) -> Self {
        self.data_source_ref = Some(data_source_ref.to_string());
        self
    }
}

// ==========================================
// DataSource - 外部数据源登记
// ==========================================
// name 同时作为 ATTACH 的 schema 别名
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub name: String,
    pub db_path: String,
    pub is_enabled: bool,
}
