// ==========================================
// 医院业务价值核算 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型,把仓储/引擎错误转换为可读的业务错误
// 红线: 错误信息必须包含显式原因
// ==========================================

use crate::engine::error::{EngineError, StepError};
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    /// 步骤试运行失败 (保留失败分类)
    #[error("步骤执行失败 ({kind}): {message}")]
    StepFailed { kind: String, message: String },

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::DatabaseTransactionError(msg) => {
                ApiError::DatabaseTransactionError(msg)
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("外键约束违反: {}", msg))
            }
            RepositoryError::BusinessRuleViolation(msg) => ApiError::BusinessRuleViolation(msg),
            RepositoryError::InvalidStateTransition { from, to } => {
                ApiError::InvalidStateTransition { from, to }
            }
            RepositoryError::ValidationError(msg) => ApiError::ValidationError(msg),
            RepositoryError::FieldValueError { field, message } => {
                ApiError::ValidationError(format!("字段 {} 的值无效: {}", field, message))
            }
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(e) => ApiError::Other(e),
        }
    }
}

// ==========================================
// 从 EngineError 转换
// ==========================================
impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::TaskNotFound(task_id) => {
                ApiError::NotFound(format!("任务(id={})不存在", task_id))
            }
            EngineError::InvalidStateTransition { from, .. } => ApiError::InvalidStateTransition {
                from,
                to: "running".to_string(),
            },
            EngineError::Repository(e) => e.into(),
            EngineError::Tree(e) => ApiError::ValidationError(e.to_string()),
            EngineError::Config(msg) | EngineError::Join(msg) => ApiError::InternalError(msg),
        }
    }
}

impl From<StepError> for ApiError {
    fn from(err: StepError) -> Self {
        ApiError::StepFailed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// API层Result类型
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_not_found_names_entity() {
        let err: ApiError = RepositoryError::NotFound {
            entity: "CalculationWorkflow".to_string(),
            id: "7".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "资源未找到: CalculationWorkflow(id=7)不存在");
    }

    #[test]
    fn test_engine_state_error_maps_to_transition() {
        let err: ApiError = EngineError::InvalidStateTransition {
            task_id: "T1".to_string(),
            from: "completed".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            ApiError::InvalidStateTransition { ref from, ref to } if from == "completed" && to == "running"
        ));
    }

    #[test]
    fn test_step_error_keeps_kind() {
        let err: ApiError = StepError::Timeout { limit_ms: 10 }.into();
        match err {
            ApiError::StepFailed { kind, .. } => assert_eq!(kind, "timeout"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
