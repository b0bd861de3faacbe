// ==========================================
// 医院业务价值核算 - 流程执行器
// ==========================================
// 职责: 执行一个任务的全部启用步骤,维护任务状态机
// 状态: pending --start--> running --全部成功--> completed
//                                  --任一失败--> failed
// 红线: 首个失败步骤立即终止,之前成功步骤的结果保留 (不做整任务回滚)
// 红线: 每次步骤尝试恰好写一条步骤日志
// 红线: 只有 pending 任务可以启动 (比较并交换)
// ==========================================

use crate::config::{ConfigManager, EngineSettings};
use crate::domain::task::{CalculationTask, NewStepLog};
use crate::domain::types::{Period, StepLogStatus, TaskStatus};
use crate::domain::workflow::CalculationStep;
use crate::engine::error::{EngineError, EngineResult, StepError};
use crate::engine::executor::{run_step, ExecutionResult, StepMode};
use crate::engine::template::TemplateContext;
use crate::perf::StepPerfGuard;
use crate::repository::{
    RepositoryError, StepLogRepository, TaskRepository, WorkflowRepository,
};
use chrono::Local;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::instrument;

// ==========================================
// TaskOutcome - 任务执行结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub steps_total: usize,          // 启用步骤数
    pub steps_succeeded: usize,      // 成功步骤数
    pub failed_step_id: Option<i64>, // 失败步骤 (前置检查失败时为 None)
    pub error_message: Option<String>,
    pub elapsed_ms: i64,
}

// ==========================================
// PipelineRunner - 流程执行器
// ==========================================
pub struct PipelineRunner {
    conn: Arc<Mutex<Connection>>,
    task_repo: TaskRepository,
    workflow_repo: WorkflowRepository,
    step_log_repo: StepLogRepository,
    config: ConfigManager,
    settings_override: Option<EngineSettings>,
}

impl PipelineRunner {
    /// 打开独立连接 (每个任务一个执行器,任务间只共享数据库文件)
    pub fn new(db_path: &str) -> EngineResult<Self> {
        let mut conn = crate::db::open_sqlite_connection(db_path)?;
        crate::perf::install_sqlite_tracing(&mut conn);
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> EngineResult<Self> {
        let config = ConfigManager::from_connection(conn.clone())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            task_repo: TaskRepository::from_connection(conn.clone()),
            workflow_repo: WorkflowRepository::from_connection(conn.clone()),
            step_log_repo: StepLogRepository::from_connection(conn.clone()),
            config,
            conn,
            settings_override: None,
        })
    }

    /// 使用给定配置,不再读取 config_kv
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings_override = Some(settings);
        self
    }

    fn load_settings(&self) -> EngineResult<EngineSettings> {
        match self.settings_override {
            Some(settings) => Ok(settings),
            None => self
                .config
                .load_engine_settings()
                .map_err(|e| EngineError::Config(e.to_string())),
        }
    }

    /// 执行任务
    ///
    /// # 返回
    /// - Ok(TaskOutcome): 任务已进入终态 (completed / failed)
    /// - Err(InvalidStateTransition): 任务不是 pending,未做任何修改
    /// - Err(TaskNotFound): 任务不存在
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn run_task(&self, task_id: &str) -> EngineResult<TaskOutcome> {
        let started = Instant::now();
        let task = self
            .task_repo
            .find_by_id(task_id)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        // 配置在启动前读取: 读取失败时任务仍为 pending
        let settings = self.load_settings()?;
        let config_snapshot = self
            .config
            .get_config_snapshot()
            .ok()
            .and_then(|raw| serde_json::from_str::<JsonValue>(&raw).ok())
            .unwrap_or(JsonValue::Null);

        if !self.task_repo.try_start(task_id)? {
            let current = self
                .task_repo
                .find_by_id(task_id)?
                .map(|t| t.status)
                .unwrap_or(task.status);
            return Err(EngineError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from: current.to_string(),
            });
        }
        tracing::info!(
            workflow_id = task.workflow_id,
            model_version_id = task.model_version_id,
            period = %task.period,
            "任务开始执行"
        );

        match self.execute_pipeline(&task, &settings, config_snapshot, started) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // 执行器自身故障: 任务不能停留在 running
                let message = format!("执行器内部错误: {}", e);
                if let Err(mark_err) = self.task_repo.mark_failed(task_id, &message) {
                    tracing::error!(error = %mark_err, "标记任务失败时出错");
                }
                Err(e)
            }
        }
    }

    /// 前置检查: 返回 Some(原因) 表示任务不可执行
    fn precheck(&self, task: &CalculationTask) -> EngineResult<Option<String>> {
        let Some(workflow) = self.workflow_repo.find_workflow(task.workflow_id)? else {
            return Ok(Some(format!("工作流不存在: {}", task.workflow_id)));
        };
        if !workflow.is_enabled {
            return Ok(Some(format!("工作流已停用: {}", workflow.name)));
        }
        if workflow.model_version_id != task.model_version_id {
            return Ok(Some(format!(
                "工作流绑定的模型版本 {} 与任务模型版本 {} 不一致",
                workflow.model_version_id, task.model_version_id
            )));
        }
        if Period::parse(&task.period).is_none() {
            return Ok(Some(format!("核算周期格式错误: {}", task.period)));
        }
        Ok(None)
    }

    fn execute_pipeline(
        &self,
        task: &CalculationTask,
        settings: &EngineSettings,
        config_snapshot: JsonValue,
        started: Instant,
    ) -> EngineResult<TaskOutcome> {
        let task_id = task.task_id.as_str();
        let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

        if let Some(reason) = self.precheck(task)? {
            tracing::warn!(reason = %reason, "任务前置检查失败");
            self.task_repo.mark_failed(task_id, &reason)?;
            return Ok(TaskOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Failed,
                steps_total: 0,
                steps_succeeded: 0,
                failed_step_id: None,
                error_message: Some(reason),
                elapsed_ms: elapsed(started),
            });
        }

        let steps = self.workflow_repo.list_enabled_steps(task.workflow_id)?;
        let total = steps.len();
        if total == 0 {
            tracing::info!("工作流没有启用的步骤, 任务直接完成");
            self.task_repo.mark_completed(task_id)?;
            return Ok(TaskOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Completed,
                steps_total: 0,
                steps_succeeded: 0,
                failed_step_id: None,
                error_message: None,
                elapsed_ms: elapsed(started),
            });
        }

        let ctx = TemplateContext::for_task(task);
        let mut snapshot = Some(config_snapshot);

        for (index, step) in steps.iter().enumerate() {
            let outcome = self.attempt_step(task_id, step, &ctx, settings, snapshot.take())?;

            match outcome {
                Ok(_) => {
                    let progress = settings.round_progress((index + 1) as f64 / total as f64 * 100.0);
                    self.task_repo.update_progress(task_id, progress)?;
                }
                Err(err) => {
                    let message = format!("步骤 [{}] 执行失败: {}", step.name, err);
                    tracing::error!(
                        step_id = step.id,
                        step_name = %step.name,
                        error_kind = err.kind(),
                        error = %err,
                        "步骤执行失败, 任务终止"
                    );
                    self.task_repo.mark_failed(task_id, &message)?;
                    return Ok(TaskOutcome {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Failed,
                        steps_total: total,
                        steps_succeeded: index,
                        failed_step_id: Some(step.id),
                        error_message: Some(message),
                        elapsed_ms: elapsed(started),
                    });
                }
            }
        }

        self.task_repo.mark_completed(task_id)?;
        let elapsed_ms = elapsed(started);
        tracing::info!(steps_total = total, elapsed_ms, "任务执行完成");
        Ok(TaskOutcome {
            task_id: task_id.to_string(),
            status: TaskStatus::Completed,
            steps_total: total,
            steps_succeeded: total,
            failed_step_id: None,
            error_message: None,
            elapsed_ms,
        })
    }

    /// 执行单个步骤并写日志
    ///
    /// 外层 Err 为执行器自身故障 (日志写入失败等),内层为步骤结果
    fn attempt_step(
        &self,
        task_id: &str,
        step: &CalculationStep,
        ctx: &TemplateContext,
        settings: &EngineSettings,
        config_snapshot: Option<JsonValue>,
    ) -> EngineResult<Result<ExecutionResult, StepError>> {
        let start_time = Local::now().naive_local();
        let clock = Instant::now();
        let perf = StepPerfGuard::new(task_id, step.id);

        let outcome = {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            run_step(&mut conn, step, ctx, settings, StepMode::Commit)
        };

        let stats = perf.stats();
        drop(perf);
        let duration_ms = clock.elapsed().as_millis() as i64;
        let end_time = Local::now().naive_local();

        if settings.slow_step_warn_ms > 0 && duration_ms as u64 >= settings.slow_step_warn_ms {
            tracing::warn!(step_id = step.id, step_name = %step.name, duration_ms, "慢步骤");
        } else {
            tracing::debug!(step_id = step.id, step_name = %step.name, duration_ms, "步骤结束");
        }

        let mut payload = match &outcome {
            Ok(result) => result.payload.clone(),
            Err(err) => json!({ "error_kind": err.kind() }),
        };
        if let JsonValue::Object(map) = &mut payload {
            map.insert("sql_count".to_string(), json!(stats.sql_count));
            map.insert("slow_sql_count".to_string(), json!(stats.slow_sql_count));
            if let Some(snapshot) = config_snapshot {
                map.insert("config_snapshot".to_string(), snapshot);
            }
        }

        let (status, execution_info, error_message) = match &outcome {
            Ok(result) => (StepLogStatus::Success, Some(result.summary.clone()), None),
            Err(err) => (StepLogStatus::Failed, None, Some(err.to_string())),
        };
        self.step_log_repo.append(&NewStepLog {
            task_id: task_id.to_string(),
            step_id: step.id,
            step_name: step.name.clone(),
            status,
            start_time,
            end_time,
            duration_ms,
            result_payload: Some(payload),
            execution_info,
            error_message,
        })?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sort_key::SortKey;
    use crate::domain::workflow::NewCalculationStep;

    struct Harness {
        runner: PipelineRunner,
        workflow_id: i64,
        version_id: i64,
    }

    fn harness() -> Harness {
        let conn = crate::db::open_test_connection();
        conn.execute_batch(
            "INSERT INTO model_version (organization_id, name, is_active, created_at) \
             VALUES ('H1', 'v1', 1, '2025-10-01 00:00:00.000'); \
             CREATE TABLE scratch (k TEXT, step INTEGER);",
        )
        .unwrap();
        let version_id = conn.last_insert_rowid();
        let shared = Arc::new(Mutex::new(conn));
        let runner = PipelineRunner::from_connection(shared.clone())
            .unwrap()
            .with_settings(EngineSettings::default());
        let workflow_id = runner
            .workflow_repo
            .create_workflow(version_id, "wf", None)
            .unwrap();
        Harness {
            runner,
            workflow_id,
            version_id,
        }
    }

    fn add_step(h: &Harness, n: i64, body: &str) -> i64 {
        h.runner
            .workflow_repo
            .insert_step(
                h.workflow_id,
                &NewCalculationStep::sql(&format!("step{}", n), body),
                SortKey::from_integer(n),
            )
            .unwrap()
    }

    fn new_task(h: &Harness, task_id: &str, version_id: i64) {
        let now = Local::now().naive_local();
        h.runner
            .task_repo
            .create(&CalculationTask {
                task_id: task_id.to_string(),
                model_version_id: version_id,
                workflow_id: h.workflow_id,
                period: "2025-10".to_string(),
                organization_id: "H1".to_string(),
                status: TaskStatus::Pending,
                progress: 0.0,
                description: None,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .unwrap();
    }

    fn scratch_count(h: &Harness) -> i64 {
        let conn = h.runner.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM scratch", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_all_steps_succeed() {
        let h = harness();
        add_step(&h, 1, "INSERT INTO scratch VALUES ('{task_id}', 1)");
        add_step(&h, 2, "INSERT INTO scratch VALUES ('{task_id}', 2)");
        add_step(&h, 3, "INSERT INTO scratch VALUES ('{task_id}', 3)");
        new_task(&h, "T1", h.version_id);

        let outcome = h.runner.run_task("T1").unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.steps_succeeded, 3);

        let task = h.runner.task_repo.find_by_id("T1").unwrap().unwrap();
        assert_eq!(task.progress, 100.0);
        assert!(task.completed_at.is_some());

        let logs = h.runner.step_log_repo.list_by_task("T1").unwrap();
        assert_eq!(logs.len(), 3);
        let first = logs[0].result_payload.as_ref().unwrap();
        assert!(first.get("config_snapshot").is_some());
        assert!(logs[1].result_payload.as_ref().unwrap().get("config_snapshot").is_none());
    }

    #[test]
    fn test_failure_halts_and_keeps_earlier_writes() {
        let h = harness();
        add_step(&h, 1, "INSERT INTO scratch VALUES ('{task_id}', 1)");
        let bad = add_step(&h, 2, "INSERT INTO no_such_table VALUES (1)");
        add_step(&h, 3, "INSERT INTO scratch VALUES ('{task_id}', 3)");
        new_task(&h, "T1", h.version_id);

        let outcome = h.runner.run_task("T1").unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.failed_step_id, Some(bad));
        assert_eq!(outcome.steps_succeeded, 1);
        assert!(outcome.error_message.as_deref().unwrap().contains("step2"));
        assert_eq!(scratch_count(&h), 1);

        let task = h.runner.task_repo.find_by_id("T1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress, 50.0);
        let logs = h.runner.step_log_repo.list_by_task("T1").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].status, StepLogStatus::Failed);
    }

    #[test]
    fn test_terminal_task_cannot_restart() {
        let h = harness();
        add_step(&h, 1, "INSERT INTO scratch VALUES ('{task_id}', 1)");
        new_task(&h, "T1", h.version_id);
        h.runner.run_task("T1").unwrap();

        let err = h.runner.run_task("T1").unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert_eq!(scratch_count(&h), 1);
        assert_eq!(h.runner.step_log_repo.list_by_task("T1").unwrap().len(), 1);

        assert!(matches!(
            h.runner.run_task("missing").unwrap_err(),
            EngineError::TaskNotFound(_)
        ));
    }

    #[test]
    fn test_empty_workflow_completes() {
        let h = harness();
        new_task(&h, "T1", h.version_id);
        let outcome = h.runner.run_task("T1").unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        let task = h.runner.task_repo.find_by_id("T1").unwrap().unwrap();
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn test_version_mismatch_fails_without_step_logs() {
        let h = harness();
        add_step(&h, 1, "INSERT INTO scratch VALUES ('{task_id}', 1)");
        {
            let conn = h.runner.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO model_version (organization_id, name, is_active, created_at) \
                 VALUES ('H1', 'v2', 0, '2025-10-01 00:00:00.000')",
                [],
            )
            .unwrap();
        }
        new_task(&h, "T1", h.version_id + 1);

        let outcome = h.runner.run_task("T1").unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.failed_step_id, None);
        assert!(h.runner.step_log_repo.list_by_task("T1").unwrap().is_empty());
        assert_eq!(scratch_count(&h), 0);
    }

    #[test]
    fn test_disabled_steps_are_skipped() {
        let h = harness();
        add_step(&h, 1, "INSERT INTO scratch VALUES ('{task_id}', 1)");
        let off = add_step(&h, 2, "INSERT INTO no_such_table VALUES (1)");
        h.runner.workflow_repo.set_step_enabled(off, false).unwrap();
        new_task(&h, "T1", h.version_id);
        let outcome = h.runner.run_task("T1").unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.steps_total, 1);
    }
}
