// ==========================================
// 医院业务价值核算 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod data_source_repo;
pub mod error;
pub mod model_repo;
pub mod result_repo;
pub mod step_log_repo;
pub mod task_repo;
pub mod unit_repo;
pub mod workflow_repo;

// 重导出核心仓储
pub use data_source_repo::DataSourceRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use model_repo::{ModelNodeRepository, ModelVersionRepository};
pub use result_repo::{DuplicateResultKey, ResultRepository};
pub use step_log_repo::StepLogRepository;
pub use task_repo::TaskRepository;
pub use unit_repo::AccountingUnitRepository;
pub use workflow_repo::WorkflowRepository;
