// ==========================================
// 医院业务价值核算 - 引擎层
// ==========================================
// 职责: 模板解析、步骤执行、流程编排、结果校验
// 红线: 步骤之间严格顺序,每个步骤独立事务
// 红线: 任务间不共享连接,只共享数据库文件
// ==========================================

pub mod consistency;
pub mod data_source;
pub mod error;
pub mod executor;
pub mod model_tree;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod template;

// 重导出核心引擎
pub use consistency::{ConsistencyChecker, ConsistencyReport, RollupMismatch, SummaryMismatch};
pub use data_source::{AttachedSource, DataSourceBinder};
pub use error::{EngineError, EngineResult, StepError};
pub use executor::{
    executor_for, run_step, ExecutionResult, ExecutionScope, SqlExecutor, StepExecutor, StepMode,
};
pub use model_tree::{ModelTree, TreeError};
pub use runner::{PipelineRunner, TaskOutcome};
pub use scheduler::TaskScheduler;
pub use script::{CostField, CostMapping, ScriptExecutor, ScriptOp};
pub use template::{placeholders_in, resolve, Placeholder, TemplateContext, TemplateError};
