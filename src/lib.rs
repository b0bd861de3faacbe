// ==========================================
// 医院业务价值核算 - 核心库
// ==========================================
// 系统定位: 按模型树把科室工作量折算为业务价值的计算流程引擎
// 技术栈: Rust + SQLite
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 模板解析/步骤执行/流程编排
pub mod engine;

// 配置层 - 引擎运行参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/表结构）
pub mod db;

// 日志系统
pub mod logging;

// SQL 性能统计
pub mod perf;

// API 层 - 业务接口
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{CodeKind, NodeType, Period, StepLogStatus, TaskStatus};

// 领域实体
pub use domain::{
    CalculationResult, CalculationStep, CalculationStepLog, CalculationSummary, CalculationTask,
    CalculationWorkflow, ModelNode, NewCalculationStep, SortKey, TaskStatusView,
};

// 引擎
pub use engine::{
    ConsistencyChecker, ConsistencyReport, EngineError, PipelineRunner, StepError, TaskOutcome,
    TaskScheduler, TemplateContext,
};

// API
pub use api::{ApiError, ApiResult, CalculationApi, WorkflowApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "医院业务价值核算";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
