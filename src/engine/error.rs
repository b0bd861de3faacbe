// ==========================================
// 医院业务价值核算 - 引擎层错误类型
// ==========================================
// StepError: 单步骤执行结果 (写入步骤日志,终止流程)
// EngineError: 流程执行器自身的失败 (仓储/状态迁移)
// ==========================================

use crate::engine::model_tree::TreeError;
use crate::engine::template::TemplateError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 步骤执行失败分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("模板解析失败: {0}")]
    Template(#[from] TemplateError),

    #[error("语法错误: {0}")]
    Syntax(String),

    #[error("约束违反: {0}")]
    ConstraintViolation(String),

    #[error("执行失败: {0}")]
    Execution(String),

    #[error("数据源不可用 ({name}): {reason}")]
    SourceUnavailable { name: String, reason: String },

    #[error("执行超时: 超过 {limit_ms} ms")]
    Timeout { limit_ms: u64 },
}

impl StepError {
    /// 分类标识 (写入步骤日志的 result_payload)
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Template(_) => "template",
            StepError::Syntax(_) => "syntax",
            StepError::ConstraintViolation(_) => "constraint_violation",
            StepError::Execution(_) => "execution",
            StepError::SourceUnavailable { .. } => "source_unavailable",
            StepError::Timeout { .. } => "timeout",
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::UniqueConstraintViolation(msg)
            | RepositoryError::ForeignKeyViolation(msg) => StepError::ConstraintViolation(msg),
            RepositoryError::ValidationError(msg) => StepError::Syntax(msg),
            other => StepError::Execution(other.to_string()),
        }
    }
}

impl From<TreeError> for StepError {
    fn from(err: TreeError) -> Self {
        StepError::Execution(err.to_string())
    }
}

/// 流程执行器错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    #[error("无效的状态转换: task_id={task_id}, 当前状态={from}")]
    InvalidStateTransition { task_id: String, from: String },

    #[error("仓储错误: {0}")]
    Repository(#[from] RepositoryError),

    #[error("模型树错误: {0}")]
    Tree(#[from] TreeError),

    #[error("配置读取失败: {0}")]
    Config(String),

    #[error("任务调度失败: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Repository(err.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_mapping() {
        let err: StepError = RepositoryError::UniqueConstraintViolation("UNIQUE".into()).into();
        assert_eq!(err.kind(), "constraint_violation");
        let err: StepError = RepositoryError::LockError("poisoned".into()).into();
        assert_eq!(err.kind(), "execution");
    }

    #[test]
    fn test_messages_name_the_cause() {
        let err = StepError::SourceUnavailable {
            name: "his".into(),
            reason: "文件不存在".into(),
        };
        assert_eq!(err.to_string(), "数据源不可用 (his): 文件不存在");
        assert_eq!(
            StepError::Timeout { limit_ms: 50 }.to_string(),
            "执行超时: 超过 50 ms"
        );
    }
}
