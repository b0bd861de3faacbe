// ==========================================
// 医院业务价值核算 - 计算任务 API
// ==========================================
// 职责: 任务创建、执行、状态/日志/结果查询、结果校验
// 红线: 任务创建时只校验引用关系,不执行任何步骤
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::domain::result::{CalculationResult, CalculationSummary};
use crate::domain::task::{CalculationStepLog, CalculationTask, TaskStatusView};
use crate::domain::types::{Period, TaskStatus};
use crate::engine::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::engine::runner::{PipelineRunner, TaskOutcome};
use crate::repository::{
    ModelVersionRepository, ResultRepository, StepLogRepository, TaskRepository,
    WorkflowRepository,
};
use chrono::Local;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// 任务列表默认条数
pub const DEFAULT_TASK_LIST_LIMIT: usize = 50;

/// 计算任务API
pub struct CalculationApi {
    conn: Arc<Mutex<Connection>>,
    task_repo: TaskRepository,
    workflow_repo: WorkflowRepository,
    version_repo: ModelVersionRepository,
    step_log_repo: StepLogRepository,
    result_repo: ResultRepository,
}

impl CalculationApi {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            task_repo: TaskRepository::from_connection(conn.clone()),
            workflow_repo: WorkflowRepository::from_connection(conn.clone()),
            version_repo: ModelVersionRepository::from_connection(conn.clone()),
            step_log_repo: StepLogRepository::from_connection(conn.clone()),
            result_repo: ResultRepository::from_connection(conn.clone()),
            conn,
        }
    }

    /// 创建计算任务 (pending)
    ///
    /// # 返回
    /// - Ok(task_id): 新任务ID (UUID v4)
    /// - Err(InvalidInput): 周期格式错误或流程与模型版本不匹配
    /// - Err(NotFound): 流程或模型版本不存在
    pub fn create_task(
        &self,
        model_version_id: i64,
        workflow_id: i64,
        period: &str,
        organization_id: &str,
        description: Option<&str>,
    ) -> ApiResult<String> {
        let period = Period::parse(period)
            .ok_or_else(|| ApiError::InvalidInput(format!("核算周期格式错误: {}", period)))?;
        if organization_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("organization_id 不能为空".to_string()));
        }

        self.version_repo
            .find_version(model_version_id)?
            .ok_or_else(|| ApiError::NotFound(format!("模型版本(id={})不存在", model_version_id)))?;
        let workflow = self
            .workflow_repo
            .find_workflow(workflow_id)?
            .ok_or_else(|| ApiError::NotFound(format!("计算流程(id={})不存在", workflow_id)))?;
        if workflow.model_version_id != model_version_id {
            return Err(ApiError::InvalidInput(format!(
                "计算流程 {} 绑定模型版本 {}, 与请求的模型版本 {} 不一致",
                workflow_id, workflow.model_version_id, model_version_id
            )));
        }

        let task_id = Uuid::new_v4().to_string();
        self.task_repo.create(&CalculationTask {
            task_id: task_id.clone(),
            model_version_id,
            workflow_id,
            period: period.to_string(),
            organization_id: organization_id.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            description: description.map(str::to_string),
            error_message: None,
            created_at: Local::now().naive_local(),
            started_at: None,
            completed_at: None,
        })?;

        tracing::info!(task_id = %task_id, workflow_id, period = %period, "计算任务已创建");
        Ok(task_id)
    }

    /// 同步执行任务 (共享本API的连接)
    pub fn run_task(&self, task_id: &str) -> ApiResult<TaskOutcome> {
        let runner = PipelineRunner::from_connection(self.conn.clone())?;
        Ok(runner.run_task(task_id)?)
    }

    pub fn get_task(&self, task_id: &str) -> ApiResult<CalculationTask> {
        self.task_repo
            .find_by_id(task_id)?
            .ok_or_else(|| ApiError::NotFound(format!("任务(id={})不存在", task_id)))
    }

    pub fn get_task_status(&self, task_id: &str) -> ApiResult<TaskStatusView> {
        Ok(TaskStatusView::from(&self.get_task(task_id)?))
    }

    /// 步骤日志 (按执行顺序)
    pub fn get_step_logs(&self, task_id: &str) -> ApiResult<Vec<CalculationStepLog>> {
        self.get_task(task_id)?;
        Ok(self.step_log_repo.list_by_task(task_id)?)
    }

    /// 结果行,可按核算单元过滤
    pub fn get_results(
        &self,
        task_id: &str,
        unit_id: Option<i64>,
    ) -> ApiResult<Vec<CalculationResult>> {
        self.get_task(task_id)?;
        let rows = match unit_id {
            Some(unit_id) => self.result_repo.list_by_unit(task_id, unit_id)?,
            None => self.result_repo.list_by_task(task_id)?,
        };
        Ok(rows)
    }

    /// 分类汇总,可按核算单元过滤
    pub fn get_summary(
        &self,
        task_id: &str,
        unit_id: Option<i64>,
    ) -> ApiResult<Vec<CalculationSummary>> {
        self.get_task(task_id)?;
        match unit_id {
            Some(unit_id) => Ok(self
                .result_repo
                .find_summary(task_id, unit_id)?
                .into_iter()
                .collect()),
            None => Ok(self.result_repo.list_summaries(task_id)?),
        }
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        model_version_id: Option<i64>,
        limit: Option<usize>,
    ) -> ApiResult<Vec<CalculationTask>> {
        Ok(self.task_repo.list_recent(
            status,
            model_version_id,
            limit.unwrap_or(DEFAULT_TASK_LIST_LIMIT),
        )?)
    }

    /// 结果一致性校验 (只读)
    pub fn verify_task(&self, task_id: &str) -> ApiResult<ConsistencyReport> {
        Ok(ConsistencyChecker::from_connection(self.conn.clone()).verify_task(task_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_with_workflow() -> (CalculationApi, i64, i64) {
        let conn = crate::db::open_test_connection();
        conn.execute(
            "INSERT INTO model_version (organization_id, name, is_active, created_at) \
             VALUES ('H1', 'v1', 1, '2025-10-01 00:00:00.000')",
            [],
        )
        .unwrap();
        let version_id = conn.last_insert_rowid();
        let api = CalculationApi::new(Arc::new(Mutex::new(conn)));
        let workflow_id = api
            .workflow_repo
            .create_workflow(version_id, "wf", None)
            .unwrap();
        (api, version_id, workflow_id)
    }

    #[test]
    fn test_create_task_is_pending() {
        let (api, version_id, workflow_id) = api_with_workflow();
        let task_id = api
            .create_task(version_id, workflow_id, "2025-10", "H1", Some("十月核算"))
            .unwrap();
        assert!(Uuid::parse_str(&task_id).is_ok());

        let status = api.get_task_status(&task_id).unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.progress, 0.0);
        assert!(api.get_step_logs(&task_id).unwrap().is_empty());
    }

    #[test]
    fn test_create_task_validates_references() {
        let (api, version_id, workflow_id) = api_with_workflow();
        assert!(matches!(
            api.create_task(version_id, workflow_id, "2025-13", "H1", None),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(matches!(
            api.create_task(version_id, workflow_id + 100, "2025-10", "H1", None),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            api.create_task(version_id + 100, workflow_id, "2025-10", "H1", None),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_run_task_twice_is_rejected() {
        let (api, version_id, workflow_id) = api_with_workflow();
        let task_id = api
            .create_task(version_id, workflow_id, "2025-10", "H1", None)
            .unwrap();
        let outcome = api.run_task(&task_id).unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(matches!(
            api.run_task(&task_id),
            Err(ApiError::InvalidStateTransition { .. })
        ));
        assert_eq!(api.list_tasks(Some(TaskStatus::Completed), None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let (api, _, _) = api_with_workflow();
        assert!(matches!(api.get_task_status("nope"), Err(ApiError::NotFound(_))));
        assert!(matches!(api.verify_task("nope"), Err(ApiError::NotFound(_))));
    }
}
