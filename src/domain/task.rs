// ==========================================
// 医院业务价值核算 - 计算任务与步骤日志
// ==========================================
// 红线: 任务只由流程执行器修改,终态不可重试 (重试 = 新建任务)
// 红线: 步骤日志只追加,不更新
// ==========================================

use crate::domain::types::{StepLogStatus, TaskStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// CalculationTask - 计算任务
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationTask {
    pub task_id: String,       // 全局唯一任务ID (UUID)
    pub model_version_id: i64,
    pub workflow_id: i64,
    pub period: String,        // 核算周期 YYYY-MM
    pub organization_id: String,
    pub status: TaskStatus,
    pub progress: f64,         // 0-100
    pub description: Option<String>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

/// 任务状态视图 (对外状态查询接口)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub error_message: Option<String>,
}

impl From<&CalculationTask> for TaskStatusView {
    fn from(task: &CalculationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            progress: task.progress,
            error_message: task.error_message.clone(),
        }
    }
}

// ==========================================
// CalculationStepLog - 步骤执行日志
// ==========================================
// 每次步骤尝试恰好一行,无论成功失败
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationStepLog {
    pub log_id: i64,
    pub task_id: String,
    pub step_id: i64,
    pub step_name: String,
    pub status: StepLogStatus,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub duration_ms: i64,
    pub result_payload: Option<JsonValue>, // 行数/诊断计数等结构化结果
    pub execution_info: Option<String>,    // 可读摘要
    pub error_message: Option<String>,
}

/// 待追加的步骤日志 (log_id 由数据库生成)
#[derive(Debug, Clone)]
pub struct NewStepLog {
    pub task_id: String,
    pub step_id: i64,
    pub step_name: String,
    pub status: StepLogStatus,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub duration_ms: i64,
    pub result_payload: Option<JsonValue>,
    pub execution_info: Option<String>,
    pub error_message: Option<String>,
}
