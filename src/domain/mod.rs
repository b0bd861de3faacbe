// ==========================================
// 医院业务价值核算 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod model;
pub mod result;
pub mod sort_key;
pub mod task;
pub mod types;
pub mod workflow;

// 重导出核心类型
pub use model::{AccountingUnit, ModelNode, ModelVersion, NewModelNode};
pub use result::{
    AdjustmentDetail, CalculationResult, CalculationSummary, CategorySummary,
    NewCalculationResult,
};
pub use sort_key::{SortKey, SortKeyError};
pub use task::{CalculationStepLog, CalculationTask, NewStepLog, TaskStatusView};
pub use types::{CodeKind, NodeType, Period, StepLogStatus, TaskStatus};
pub use workflow::{CalculationStep, CalculationWorkflow, DataSource, NewCalculationStep};
