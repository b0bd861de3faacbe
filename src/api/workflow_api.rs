// ==========================================
// 医院业务价值核算 - 计算流程编排 API
// ==========================================
// 职责: 流程/步骤维护、流程复制、步骤排序调整、步骤试运行、数据源登记
// 红线: 排序调整只改动被交换的步骤 (及与其同键的相邻步骤),其它步骤不重新编号
// 红线: 试运行无论成败都回滚,不写任务/日志/结果
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::ConfigManager;
use crate::domain::sort_key::SortKey;
use crate::domain::types::Period;
use crate::domain::workflow::{CalculationStep, CalculationWorkflow, NewCalculationStep};
use crate::engine::executor::{run_step, ExecutionResult, StepMode};
use crate::engine::template::TemplateContext;
use crate::repository::{
    DataSourceRepository, ModelVersionRepository, RepositoryError, WorkflowRepository,
};
use chrono::Local;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// 试运行上下文 (未给出 task_id 时生成临时标识)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTestContext {
    pub period: String,
    pub organization_id: String,
    pub task_id: Option<String>,
}

/// 计算流程编排API
pub struct WorkflowApi {
    conn: Arc<Mutex<Connection>>,
    workflow_repo: WorkflowRepository,
    version_repo: ModelVersionRepository,
    data_source_repo: DataSourceRepository,
}

impl WorkflowApi {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            workflow_repo: WorkflowRepository::from_connection(conn.clone()),
            version_repo: ModelVersionRepository::from_connection(conn.clone()),
            data_source_repo: DataSourceRepository::from_connection(conn.clone()),
            conn,
        }
    }

    // ==========================================
    // 流程
    // ==========================================

    pub fn create_workflow(
        &self,
        model_version_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> ApiResult<i64> {
        if name.trim().is_empty() {
            return Err(ApiError::InvalidInput("流程名称不能为空".to_string()));
        }
        self.version_repo
            .find_version(model_version_id)?
            .ok_or_else(|| ApiError::NotFound(format!("模型版本(id={})不存在", model_version_id)))?;
        Ok(self
            .workflow_repo
            .create_workflow(model_version_id, name, description)?)
    }

    pub fn get_workflow(&self, workflow_id: i64) -> ApiResult<CalculationWorkflow> {
        self.workflow_repo
            .find_workflow(workflow_id)?
            .ok_or_else(|| ApiError::NotFound(format!("计算流程(id={})不存在", workflow_id)))
    }

    /// 复制流程及全部步骤
    ///
    /// # 参数
    /// - target_version_id: 目标模型版本,缺省为原流程所属版本
    /// - description: 缺省沿用原流程说明
    pub fn copy_workflow(
        &self,
        workflow_id: i64,
        new_name: &str,
        target_version_id: Option<i64>,
        description: Option<&str>,
    ) -> ApiResult<i64> {
        if new_name.trim().is_empty() {
            return Err(ApiError::InvalidInput("流程名称不能为空".to_string()));
        }
        self.get_workflow(workflow_id)?;
        if let Some(version_id) = target_version_id {
            self.version_repo
                .find_version(version_id)?
                .ok_or_else(|| ApiError::NotFound(format!("模型版本(id={})不存在", version_id)))?;
        }
        Ok(self
            .workflow_repo
            .copy_workflow(workflow_id, target_version_id, new_name, description)?)
    }

    // ==========================================
    // 步骤
    // ==========================================

    fn get_step(&self, step_id: i64) -> ApiResult<CalculationStep> {
        self.workflow_repo
            .find_step(step_id)?
            .ok_or_else(|| ApiError::NotFound(format!("计算步骤(id={})不存在", step_id)))
    }

    fn validate_step(&self, step: &NewCalculationStep) -> ApiResult<()> {
        if step.name.trim().is_empty() {
            return Err(ApiError::InvalidInput("步骤名称不能为空".to_string()));
        }
        if step.body.trim().is_empty() {
            return Err(ApiError::InvalidInput(format!("步骤 [{}] 代码为空", step.name)));
        }
        if let Some(name) = step.data_source_ref.as_deref() {
            self.data_source_repo
                .find_by_name(name)?
                .ok_or_else(|| ApiError::NotFound(format!("数据源({})未登记", name)))?;
        }
        Ok(())
    }

    /// 追加到流程末尾 (排序键 = 当前最大值取整 + 1,空流程为 1)
    pub fn add_step(&self, workflow_id: i64, step: &NewCalculationStep) -> ApiResult<i64> {
        self.get_workflow(workflow_id)?;
        self.validate_step(step)?;
        let sort_key = self
            .workflow_repo
            .list_steps(workflow_id)?
            .iter()
            .map(|s| s.sort_key)
            .max()
            .map(|k| k.after())
            .unwrap_or_else(|| SortKey::from_integer(1));
        Ok(self.workflow_repo.insert_step(workflow_id, step, sort_key)?)
    }

    /// 在两个已有步骤之间插入 (排序键取中点)
    pub fn insert_step_between(
        &self,
        workflow_id: i64,
        first_step_id: i64,
        second_step_id: i64,
        step: &NewCalculationStep,
    ) -> ApiResult<i64> {
        self.get_workflow(workflow_id)?;
        self.validate_step(step)?;
        let first = self.get_step(first_step_id)?;
        let second = self.get_step(second_step_id)?;
        if first.workflow_id != workflow_id || second.workflow_id != workflow_id {
            return Err(ApiError::BusinessRuleViolation(format!(
                "步骤 {} / {} 不属于流程 {}",
                first_step_id, second_step_id, workflow_id
            )));
        }
        let sort_key = SortKey::between(first.sort_key, second.sort_key)
            .map_err(|e| ApiError::BusinessRuleViolation(e.to_string()))?;
        Ok(self.workflow_repo.insert_step(workflow_id, step, sort_key)?)
    }

    pub fn update_step(&self, step_id: i64, step: &NewCalculationStep) -> ApiResult<()> {
        self.validate_step(step)?;
        Ok(self.workflow_repo.update_step(step_id, step)?)
    }

    pub fn delete_step(&self, step_id: i64) -> ApiResult<()> {
        Ok(self.workflow_repo.delete_step(step_id)?)
    }

    /// 与前一个步骤交换位置
    ///
    /// # 返回
    /// - Ok(false): 已是第一个步骤,未做修改
    pub fn move_step_up(&self, step_id: i64) -> ApiResult<bool> {
        self.move_step(step_id, -1)
    }

    /// 与后一个步骤交换位置
    ///
    /// # 返回
    /// - Ok(false): 已是最后一个步骤,未做修改
    pub fn move_step_down(&self, step_id: i64) -> ApiResult<bool> {
        self.move_step(step_id, 1)
    }

    fn move_step(&self, step_id: i64, offset: isize) -> ApiResult<bool> {
        let step = self.get_step(step_id)?;
        let steps = self.workflow_repo.list_steps(step.workflow_id)?;
        let index = steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| ApiError::InternalError(format!("步骤 {} 不在所属流程的步骤列表中", step_id)))?;
        let Some(neighbor) = index
            .checked_add_signed(offset)
            .and_then(|i| steps.get(i))
        else {
            return Ok(false);
        };

        if neighbor.sort_key == step.sort_key {
            // 同键步骤按 id 排序,交换排序键无效: 把同键段在其上界之前拉开后按新顺序重排
            self.reorder_tied_group(&steps, index, offset)?;
        } else {
            self.workflow_repo.swap_sort_keys(&step, neighbor)?;
        }
        tracing::debug!(step_id, neighbor_id = neighbor.id, "步骤顺序已调整");
        Ok(true)
    }

    fn reorder_tied_group(
        &self,
        steps: &[CalculationStep],
        index: usize,
        offset: isize,
    ) -> ApiResult<()> {
        let key = steps[index].sort_key;
        let start = steps[..index]
            .iter()
            .rposition(|s| s.sort_key != key)
            .map_or(0, |i| i + 1);
        let end = steps[index..]
            .iter()
            .position(|s| s.sort_key != key)
            .map_or(steps.len(), |i| index + i);
        let upper = steps.get(end).map_or_else(|| key.after(), |s| s.sort_key);

        let mut ids: Vec<i64> = steps[start..end].iter().map(|s| s.id).collect();
        let local = index - start;
        let other = local
            .checked_add_signed(offset)
            .ok_or_else(|| ApiError::InternalError("相邻步骤越界".to_string()))?;
        ids.swap(local, other);

        let keys = SortKey::spread(key, upper, ids.len())
            .map_err(|e| ApiError::BusinessRuleViolation(e.to_string()))?;
        let assignments: Vec<(i64, SortKey)> = ids.into_iter().zip(keys).collect();
        Ok(self.workflow_repo.update_sort_keys(&assignments)?)
    }

    pub fn set_step_enabled(&self, step_id: i64, is_enabled: bool) -> ApiResult<()> {
        Ok(self.workflow_repo.set_step_enabled(step_id, is_enabled)?)
    }

    /// 流程下全部步骤 (执行顺序,含停用步骤)
    pub fn list_steps(&self, workflow_id: i64) -> ApiResult<Vec<CalculationStep>> {
        self.get_workflow(workflow_id)?;
        Ok(self.workflow_repo.list_steps(workflow_id)?)
    }

    // ==========================================
    // 试运行
    // ==========================================

    /// 在流程的模型版本下试运行一段步骤代码
    ///
    /// # 返回
    /// - Ok(ExecutionResult): 执行成功 (已回滚)
    /// - Err(StepFailed): 执行失败,保留失败分类
    pub fn test_step(
        &self,
        workflow_id: i64,
        step: &NewCalculationStep,
        context: &StepTestContext,
    ) -> ApiResult<ExecutionResult> {
        let workflow = self.get_workflow(workflow_id)?;
        self.validate_step(step)?;
        let period = Period::parse(&context.period)
            .ok_or_else(|| ApiError::InvalidInput(format!("核算周期格式错误: {}", context.period)))?;

        let settings = ConfigManager::from_connection(self.conn.clone())
            .and_then(|config| config.load_engine_settings())
            .map_err(|e| ApiError::InternalError(format!("配置读取失败: {}", e)))?;

        let now = Local::now().naive_local();
        let transient = CalculationStep {
            id: 0,
            workflow_id,
            name: step.name.clone(),
            description: step.description.clone(),
            code_kind: step.code_kind,
            body: step.body.clone(),
            sort_key: SortKey::from_integer(0),
            is_enabled: true,
            data_source_ref: step.data_source_ref.clone(),
            created_at: now,
            updated_at: now,
        };
        let ctx = TemplateContext {
            task_id: Some(
                context
                    .task_id
                    .clone()
                    .unwrap_or_else(|| format!("dry-run-{}", uuid::Uuid::new_v4())),
            ),
            period: Some(period),
            organization_id: Some(context.organization_id.clone()),
            model_version_id: Some(workflow.model_version_id),
            current_period: None,
        };

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        let result = run_step(&mut conn, &transient, &ctx, &settings, StepMode::DryRun)?;
        tracing::info!(workflow_id, step_name = %step.name, rows = result.rows_affected, "步骤试运行完成");
        Ok(result)
    }

    // ==========================================
    // 数据源
    // ==========================================

    pub fn register_data_source(&self, name: &str, db_path: &str) -> ApiResult<i64> {
        Ok(self.data_source_repo.register(name, db_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CodeKind;

    fn api() -> (WorkflowApi, i64) {
        let conn = crate::db::open_test_connection();
        conn.execute(
            "INSERT INTO model_version (organization_id, name, is_active, created_at) \
             VALUES ('H1', 'v1', 1, '2025-10-01 00:00:00.000')",
            [],
        )
        .unwrap();
        let version_id = conn.last_insert_rowid();
        let api = WorkflowApi::new(Arc::new(Mutex::new(conn)));
        let workflow_id = api.create_workflow(version_id, "月度核算", None).unwrap();
        (api, workflow_id)
    }

    fn names(api: &WorkflowApi, workflow_id: i64) -> Vec<String> {
        api.list_steps(workflow_id)
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    #[test]
    fn test_add_and_insert_between() {
        let (api, wf) = api();
        let a = api.add_step(wf, &NewCalculationStep::sql("A", "SELECT 1")).unwrap();
        let b = api.add_step(wf, &NewCalculationStep::sql("B", "SELECT 2")).unwrap();
        api.insert_step_between(wf, a, b, &NewCalculationStep::sql("AB", "SELECT 3"))
            .unwrap();
        assert_eq!(names(&api, wf), vec!["A", "AB", "B"]);

        let steps = api.list_steps(wf).unwrap();
        assert_eq!(steps[1].sort_key.to_string(), "1.5");
        assert_eq!(steps[2].sort_key, SortKey::from_integer(2));
    }

    #[test]
    fn test_move_steps() {
        let (api, wf) = api();
        let a = api.add_step(wf, &NewCalculationStep::sql("A", "SELECT 1")).unwrap();
        api.add_step(wf, &NewCalculationStep::sql("B", "SELECT 2")).unwrap();
        let c = api.add_step(wf, &NewCalculationStep::sql("C", "SELECT 3")).unwrap();

        assert!(!api.move_step_up(a).unwrap());
        assert!(!api.move_step_down(c).unwrap());
        assert!(api.move_step_up(c).unwrap());
        assert_eq!(names(&api, wf), vec!["A", "C", "B"]);
        assert!(api.move_step_down(a).unwrap());
        assert_eq!(names(&api, wf), vec!["C", "A", "B"]);
    }

    fn insert_at(api: &WorkflowApi, wf: i64, name: &str, key: &str) -> i64 {
        api.workflow_repo
            .insert_step(wf, &NewCalculationStep::sql(name, "SELECT 1"), SortKey::parse(key).unwrap())
            .unwrap()
    }

    #[test]
    fn test_move_step_up_with_tied_keys() {
        let (api, wf) = api();
        insert_at(&api, wf, "A", "2.5");
        insert_at(&api, wf, "B", "3");
        let c = insert_at(&api, wf, "C", "3");

        assert!(api.move_step_up(c).unwrap());
        assert_eq!(names(&api, wf), vec!["A", "C", "B"]);
        let steps = api.list_steps(wf).unwrap();
        assert_eq!(steps[0].sort_key.to_string(), "2.5");
    }

    #[test]
    fn test_move_step_within_longer_tie_run() {
        let (api, wf) = api();
        insert_at(&api, wf, "A", "3");
        let b = insert_at(&api, wf, "B", "3");
        let c = insert_at(&api, wf, "C", "3");
        insert_at(&api, wf, "D", "3");
        insert_at(&api, wf, "E", "5");

        assert!(api.move_step_up(c).unwrap());
        assert_eq!(names(&api, wf), vec!["A", "C", "B", "D", "E"]);
        assert!(api.move_step_down(b).unwrap());
        assert_eq!(names(&api, wf), vec!["A", "C", "D", "B", "E"]);
    }

    #[test]
    fn test_move_step_down_in_trailing_tie_run() {
        // 末尾同键段: 上界取 after()
        let (api, wf) = api();
        insert_at(&api, wf, "X", "1");
        let y = insert_at(&api, wf, "Y", "2");
        insert_at(&api, wf, "Z", "2");
        assert!(api.move_step_down(y).unwrap());
        assert_eq!(names(&api, wf), vec!["X", "Z", "Y"]);
    }

    #[test]
    fn test_copy_workflow_to_other_version() {
        let (api, wf) = api();
        api.add_step(wf, &NewCalculationStep::sql("A", "SELECT 1")).unwrap();
        api.add_step(wf, &NewCalculationStep::sql("B", "SELECT 2")).unwrap();

        let source_version = api.get_workflow(wf).unwrap().model_version_id;
        let target = api.version_repo.copy_version(source_version, "v2").unwrap();
        let copy = api.copy_workflow(wf, "月度核算", Some(target), Some("v2 流程")).unwrap();
        let copied = api.get_workflow(copy).unwrap();
        assert_eq!(copied.model_version_id, target);
        assert_eq!(copied.description.as_deref(), Some("v2 流程"));
        assert_eq!(names(&api, copy), vec!["A", "B"]);

        // 同版本同名拒绝
        assert!(matches!(
            api.copy_workflow(wf, "月度核算", None, None),
            Err(ApiError::BusinessRuleViolation(_))
        ));
        assert!(matches!(
            api.copy_workflow(wf, "x", Some(999), None),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_step_rejects_unknown_source_and_empty_body() {
        let (api, wf) = api();
        assert!(matches!(
            api.add_step(wf, &NewCalculationStep::sql("A", "SELECT 1").with_data_source("his")),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            api.add_step(wf, &NewCalculationStep::sql("A", "   ")),
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_step_dry_run_rolls_back() {
        let (api, wf) = api();
        let ctx = StepTestContext {
            period: "2025-10".to_string(),
            organization_id: "H1".to_string(),
            task_id: Some("scratch".to_string()),
        };
        let step = NewCalculationStep::sql(
            "写入",
            "CREATE TABLE scratch (v TEXT); INSERT INTO scratch VALUES ('{task_id}-{period}')",
        );
        let result = api.test_step(wf, &step, &ctx).unwrap();
        assert_eq!(result.rows_affected, 1);

        let exists: i64 = api
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
        assert_eq!(step.code_kind, CodeKind::Sql);
    }

    #[test]
    fn test_step_dry_run_reports_kind() {
        let (api, wf) = api();
        let ctx = StepTestContext {
            period: "2025-10".to_string(),
            organization_id: "H1".to_string(),
            task_id: None,
        };
        match api.test_step(wf, &NewCalculationStep::sql("坏", "SELEC 1"), &ctx) {
            Err(ApiError::StepFailed { kind, .. }) => assert_eq!(kind, "syntax"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
