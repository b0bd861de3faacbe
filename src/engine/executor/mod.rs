// ==========================================
// 医院业务价值核算 - 步骤执行器
// ==========================================
// 职责: 解析模板 -> 绑定数据源 -> 单事务执行 -> 提交/回滚
// 红线: 一个步骤一个事务,不跨步骤
// 红线: 超时由 SQLite progress handler 中断,结果统一归类为 Timeout
// ==========================================

pub mod sql;

use crate::config::EngineSettings;
use crate::domain::types::{CodeKind, Period};
use crate::domain::workflow::CalculationStep;
use crate::engine::data_source::DataSourceBinder;
use crate::engine::error::StepError;
use crate::engine::script::ScriptExecutor;
use crate::engine::template::{self, TemplateContext};
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use sql::{split_statements, SqlExecutor};

/// progress handler 回调间隔 (虚拟机指令数)
const PROGRESS_HANDLER_OPS: i32 = 1_000;

/// 结果库在错误信息中的名称
pub const RESULT_STORE_NAME: &str = "main";

// ==========================================
// ExecutionResult - 单步骤执行结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub rows_affected: u64,
    pub payload: JsonValue,  // 写入步骤日志 result_payload
    pub summary: String,     // 写入步骤日志 execution_info
}

// ==========================================
// ExecutionScope - 步骤执行范围
// ==========================================
// 持有步骤事务内的连接与上下文,执行器只通过它访问数据
pub struct ExecutionScope<'c> {
    conn: &'c Connection,
    ctx: TemplateContext,
    source_alias: Option<String>,
    deadline: Option<Instant>,
    timeout_ms: u64,
    notes: Vec<String>,
}

impl<'c> ExecutionScope<'c> {
    pub fn new(conn: &'c Connection, ctx: TemplateContext) -> Self {
        Self {
            conn,
            ctx,
            source_alias: None,
            deadline: None,
            timeout_ms: 0,
            notes: Vec::new(),
        }
    }

    pub fn with_source_alias(mut self, alias: Option<String>) -> Self {
        self.source_alias = alias;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self.deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        self
    }

    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    pub fn context(&self) -> &TemplateContext {
        &self.ctx
    }

    pub fn task_id(&self) -> Result<&str, StepError> {
        self.ctx
            .task_id
            .as_deref()
            .ok_or_else(|| StepError::Execution("执行上下文缺少 task_id".to_string()))
    }

    pub fn period(&self) -> Result<Period, StepError> {
        self.ctx
            .period
            .ok_or_else(|| StepError::Execution("执行上下文缺少 period".to_string()))
    }

    pub fn organization_id(&self) -> Result<&str, StepError> {
        self.ctx
            .organization_id
            .as_deref()
            .ok_or_else(|| StepError::Execution("执行上下文缺少 organization_id".to_string()))
    }

    pub fn model_version_id(&self) -> Result<i64, StepError> {
        self.ctx
            .model_version_id
            .ok_or_else(|| StepError::Execution("执行上下文缺少 model_version_id".to_string()))
    }

    /// 参考数据表名: 绑定数据源时加别名前缀
    pub fn qualify(&self, table: &str) -> Result<String, StepError> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !table.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(StepError::Syntax(format!("表名不合法: {}", table)));
        }
        Ok(match &self.source_alias {
            Some(alias) => format!("\"{}\".\"{}\"", alias, table),
            None => format!("\"{}\"", table),
        })
    }

    /// 脚本内循环的超时检查 (SQL 语句由 progress handler 中断)
    pub fn check_deadline(&self) -> Result<(), StepError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StepError::Timeout {
                limit_ms: self.timeout_ms,
            }),
            _ => Ok(()),
        }
    }

    /// 执行过程备注 (进入步骤日志)
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// rusqlite 错误归类 (数据源名取当前绑定)
    pub fn classify(&self, err: rusqlite::Error) -> StepError {
        classify_sqlite_error(
            err,
            self.source_alias.as_deref().unwrap_or(RESULT_STORE_NAME),
        )
    }
}

// ==========================================
// StepExecutor - 按代码类型多态执行
// ==========================================
pub trait StepExecutor: Send + Sync {
    fn execute(&self, body: &str, scope: &mut ExecutionScope<'_>)
        -> Result<ExecutionResult, StepError>;
}

/// 按 code_kind 选择执行器
pub fn executor_for(kind: CodeKind) -> Box<dyn StepExecutor> {
    match kind {
        CodeKind::Sql => Box::new(SqlExecutor),
        CodeKind::Script => Box::new(ScriptExecutor),
    }
}

/// rusqlite 错误 -> 步骤失败分类
pub fn classify_sqlite_error(err: rusqlite::Error, source_name: &str) -> StepError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            let text = msg.clone().unwrap_or_else(|| e.to_string());
            match e.code {
                ErrorCode::ConstraintViolation => StepError::ConstraintViolation(text),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::NotADatabase => StepError::SourceUnavailable {
                    name: source_name.to_string(),
                    reason: text,
                },
                _ if is_syntax_message(&text) => StepError::Syntax(text),
                _ => StepError::Execution(text),
            }
        }
        rusqlite::Error::InvalidParameterCount(_, _) | rusqlite::Error::MultipleStatement => {
            StepError::Syntax(err.to_string())
        }
        _ => StepError::Execution(err.to_string()),
    }
}

fn is_syntax_message(text: &str) -> bool {
    text.contains("syntax error")
        || text.contains("incomplete input")
        || text.contains("unrecognized token")
}

/// 步骤提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// 成功提交,失败回滚
    Commit,
    /// 无论成败均回滚 (编写期试运行)
    DryRun,
}

/// 执行一个步骤 (完整生命周期)
pub fn run_step(
    conn: &mut Connection,
    step: &CalculationStep,
    ctx: &TemplateContext,
    settings: &EngineSettings,
    mode: StepMode,
) -> Result<ExecutionResult, StepError> {
    let resolved = template::resolve(&step.body, ctx)?;
    let attached = DataSourceBinder::bind(conn, step.data_source_ref.as_deref())?;

    let interrupted = Arc::new(AtomicBool::new(false));
    if settings.step_timeout_ms > 0 {
        let deadline = Instant::now() + Duration::from_millis(settings.step_timeout_ms);
        let flag = interrupted.clone();
        conn.progress_handler(
            PROGRESS_HANDLER_OPS,
            Some(move || {
                if Instant::now() >= deadline {
                    flag.store(true, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }),
        );
    }

    let alias = attached.as_ref().map(|a| a.alias.clone());
    let outcome = execute_in_transaction(conn, step.code_kind, &resolved, ctx, alias, settings, mode);

    if settings.step_timeout_ms > 0 {
        conn.progress_handler(0, None::<fn() -> bool>);
    }
    DataSourceBinder::release(conn, attached);

    match outcome {
        Err(_) if interrupted.load(Ordering::Relaxed) => Err(StepError::Timeout {
            limit_ms: settings.step_timeout_ms,
        }),
        other => other,
    }
}

fn execute_in_transaction(
    conn: &mut Connection,
    kind: CodeKind,
    body: &str,
    ctx: &TemplateContext,
    alias: Option<String>,
    settings: &EngineSettings,
    mode: StepMode,
) -> Result<ExecutionResult, StepError> {
    let source_name = alias.clone().unwrap_or_else(|| RESULT_STORE_NAME.to_string());
    // 立即取得写锁: 并发任务在 busy_timeout 内排队,避免读事务升级写锁失败
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| classify_sqlite_error(e, &source_name))?;

    let outcome = {
        let mut scope = ExecutionScope::new(&tx, ctx.clone())
            .with_source_alias(alias)
            .with_timeout_ms(settings.step_timeout_ms);
        let executor = executor_for(kind);
        executor.execute(body, &mut scope).map(|mut result| {
            if !scope.notes().is_empty() {
                if let JsonValue::Object(map) = &mut result.payload {
                    map.insert("notes".to_string(), JsonValue::from(scope.notes().to_vec()));
                }
            }
            result
        })
    };

    match (outcome, mode) {
        (Ok(result), StepMode::Commit) => {
            tx.commit().map_err(|e| classify_sqlite_error(e, &source_name))?;
            Ok(result)
        }
        (outcome, _) => {
            if let Err(e) = tx.rollback() {
                tracing::warn!(error = %e, "步骤事务回滚失败");
            }
            outcome
        }
    }
}
