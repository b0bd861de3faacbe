// ==========================================
// 医院业务价值核算 - 引擎配置读取 Trait
// ==========================================
// 职责: 定义流程执行器所需的配置读取接口 (不包含实现)
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use async_trait::async_trait;
use std::error::Error;

pub type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

// ==========================================
// EngineConfigReader Trait
// ==========================================
// 实现者: ConfigManager (从 config_kv 表读取)
#[async_trait]
pub trait EngineConfigReader: Send + Sync {
    /// 单步骤执行超时 (毫秒)
    ///
    /// # 默认值
    /// - 600000 (10 分钟); 0 表示不限
    async fn get_step_timeout_ms(&self) -> ConfigResult<u64>;

    /// 任务进度保留的小数位数
    ///
    /// # 默认值
    /// - 2
    async fn get_progress_precision(&self) -> ConfigResult<u32>;

    /// 慢步骤告警阈值 (毫秒)
    ///
    /// # 默认值
    /// - 30000
    async fn get_slow_step_warn_ms(&self) -> ConfigResult<u64>;
}

/// 一次任务执行期间使用的配置快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub step_timeout_ms: u64,
    pub progress_precision: u32,
    pub slow_step_warn_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 600_000,
            progress_precision: 2,
            slow_step_warn_ms: 30_000,
        }
    }
}

impl EngineSettings {
    /// 从配置读取器加载
    pub async fn load(reader: &dyn EngineConfigReader) -> ConfigResult<Self> {
        Ok(Self {
            step_timeout_ms: reader.get_step_timeout_ms().await?,
            progress_precision: reader.get_progress_precision().await?,
            slow_step_warn_ms: reader.get_slow_step_warn_ms().await?,
        })
    }

    /// 按配置精度取整进度
    pub fn round_progress(&self, progress: f64) -> f64 {
        let factor = 10f64.powi(self.progress_precision.min(6) as i32);
        (progress * factor).round() / factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_progress() {
        let settings = EngineSettings::default();
        assert_eq!(settings.round_progress(100.0 / 3.0), 33.33);
        let coarse = EngineSettings {
            progress_precision: 0,
            ..settings
        };
        assert_eq!(coarse.round_progress(66.6667), 67.0);
    }
}
