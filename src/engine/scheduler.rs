// ==========================================
// 医院业务价值核算 - 任务调度
// ==========================================
// 职责: 在阻塞线程池上执行任务,支持批量并发
// 红线: 每个任务独立连接,任务之间只共享数据库文件
// ==========================================

use crate::config::{ConfigManager, EngineSettings};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::runner::{PipelineRunner, TaskOutcome};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// 默认批量并发数
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub struct TaskScheduler {
    db_path: String,
    max_concurrency: usize,
}

impl TaskScheduler {
    pub fn new(db_path: &str) -> Self {
        Self {
            db_path: db_path.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// 异步读取引擎配置 (EngineConfigReader)
    async fn load_settings(&self) -> EngineResult<EngineSettings> {
        let config =
            ConfigManager::new(&self.db_path).map_err(|e| EngineError::Config(e.to_string()))?;
        EngineSettings::load(&config)
            .await
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    async fn spawn_run(
        db_path: String,
        task_id: String,
        settings: EngineSettings,
    ) -> EngineResult<TaskOutcome> {
        tokio::task::spawn_blocking(move || {
            PipelineRunner::new(&db_path)?
                .with_settings(settings)
                .run_task(&task_id)
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// 执行单个任务
    pub async fn run_task(&self, task_id: &str) -> EngineResult<TaskOutcome> {
        let settings = self.load_settings().await?;
        Self::spawn_run(self.db_path.clone(), task_id.to_string(), settings).await
    }

    /// 并发执行多个任务,结果顺序与输入一致
    pub async fn run_batch(
        &self,
        task_ids: Vec<String>,
    ) -> EngineResult<Vec<(String, EngineResult<TaskOutcome>)>> {
        let settings = self.load_settings().await?;
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        tracing::info!(
            tasks = task_ids.len(),
            max_concurrency = self.max_concurrency,
            "批量执行任务"
        );

        let runs = task_ids.into_iter().map(|task_id| {
            let permits = permits.clone();
            let db_path = self.db_path.clone();
            async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => Self::spawn_run(db_path, task_id.clone(), settings).await,
                    Err(e) => Err(EngineError::Join(e.to_string())),
                };
                (task_id, result)
            }
        });
        Ok(join_all(runs).await)
    }
}
