// ==========================================
// 医院业务价值核算 - API 层
// ==========================================
// 职责: 提供任务与流程编排的业务接口,供命令行/上层服务调用
// ==========================================

pub mod calculation_api;
pub mod error;
pub mod workflow_api;

// 重导出核心类型
pub use calculation_api::CalculationApi;
pub use error::{ApiError, ApiResult};
pub use workflow_api::{StepTestContext, WorkflowApi};
