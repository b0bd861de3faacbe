// ==========================================
// 医院业务价值核算 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::engine_config_trait::{ConfigResult, EngineConfigReader, EngineSettings};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }
        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值
    pub fn get_global_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值 (存在则覆盖)
    pub fn set_global_config_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value, updated_at)
            VALUES ('global', ?1, ?2, datetime('now'))
            ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')
            "#,
            params![key, value],
        )?;
        tracing::info!(key, value, "配置已更新");
        Ok(())
    }

    /// 数值配置: 缺失或无法解析时取默认值
    fn get_number_or_default<T: std::str::FromStr + Copy>(
        &self,
        key: &str,
        default: T,
    ) -> ConfigResult<T> {
        match self.get_config_value(key)? {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(key, raw = %raw, "配置值无法解析, 使用默认值");
                    Ok(default)
                }
            },
        }
    }

    /// 同步加载引擎配置 (供阻塞线程内的执行器使用)
    pub fn load_engine_settings(&self) -> ConfigResult<EngineSettings> {
        let defaults = EngineSettings::default();
        Ok(EngineSettings {
            step_timeout_ms: self
                .get_number_or_default(config_keys::STEP_TIMEOUT_MS, defaults.step_timeout_ms)?,
            progress_precision: self.get_number_or_default(
                config_keys::PROGRESS_PRECISION,
                defaults.progress_precision,
            )?,
            slow_step_warn_ms: self
                .get_number_or_default(config_keys::SLOW_STEP_WARN_MS, defaults.slow_step_warn_ms)?,
        })
    }

    /// 获取所有配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 任务开始时记录在首条步骤日志中,便于事后复核
    pub fn get_config_snapshot(&self) -> ConfigResult<String> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;

        let mut config_map: BTreeMap<String, String> = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        Ok(serde_json::to_string(&json!(config_map))?)
    }
}

#[async_trait]
impl EngineConfigReader for ConfigManager {
    async fn get_step_timeout_ms(&self) -> ConfigResult<u64> {
        self.get_number_or_default(
            config_keys::STEP_TIMEOUT_MS,
            EngineSettings::default().step_timeout_ms,
        )
    }

    async fn get_progress_precision(&self) -> ConfigResult<u32> {
        self.get_number_or_default(
            config_keys::PROGRESS_PRECISION,
            EngineSettings::default().progress_precision,
        )
    }

    async fn get_slow_step_warn_ms(&self) -> ConfigResult<u64> {
        self.get_number_or_default(
            config_keys::SLOW_STEP_WARN_MS,
            EngineSettings::default().slow_step_warn_ms,
        )
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 步骤执行
    pub const STEP_TIMEOUT_MS: &str = "step_timeout_ms";
    pub const SLOW_STEP_WARN_MS: &str = "slow_step_warn_ms";

    // 任务进度
    pub const PROGRESS_PRECISION: &str = "progress_precision";
}
