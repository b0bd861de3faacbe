// ==========================================
// 步骤级 SQL 统计
// ==========================================
// 每个步骤在独立线程的独立连接上执行,计数器按线程隔离
// ==========================================

use rusqlite::Connection;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static PERF_SQL_ENABLED: AtomicBool = AtomicBool::new(false);
static SLOW_SQL_THRESHOLD_MS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static PERF_DEPTH: Cell<u32> = Cell::new(0);
    static SQL_COUNT: Cell<u64> = Cell::new(0);
    static SLOW_SQL_COUNT: Cell<u64> = Cell::new(0);
}

fn is_true(v: &str) -> bool {
    matches!(
        v.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn truncate_sql(sql: &str, max_len: usize) -> String {
    let s = sql.trim().replace('\n', " ");
    if s.chars().count() <= max_len {
        return s;
    }
    let cut: String = s.chars().take(max_len).collect();
    format!("{}…", cut)
}

/// 安装 SQLite 语句 trace/profile（用于 SQL 计数 + 慢查询日志）
///
/// 开关：
/// - Debug 默认开启；Release 默认关闭（可通过环境变量开启）
/// - `HOSPITAL_VALUE_PERF_SQL=1` 强制开启
/// - `HOSPITAL_VALUE_SLOW_SQL_MS=500` 配置慢 SQL 阈值（毫秒）
pub fn install_sqlite_tracing(conn: &mut Connection) {
    let enabled = match std::env::var("HOSPITAL_VALUE_PERF_SQL") {
        Ok(v) => is_true(&v),
        Err(_) => cfg!(debug_assertions),
    };

    PERF_SQL_ENABLED.store(enabled, Ordering::Relaxed);

    if !enabled {
        conn.trace(None);
        conn.profile(None);
        return;
    }

    let slow_ms = std::env::var("HOSPITAL_VALUE_SLOW_SQL_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(if cfg!(debug_assertions) { 200 } else { 1_000 });
    SLOW_SQL_THRESHOLD_MS.store(slow_ms, Ordering::Relaxed);

    conn.trace(Some(sql_trace_callback));
    conn.profile(Some(sql_profile_callback));
}

fn sql_trace_callback(_sql: &str) {
    if !PERF_SQL_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let active = PERF_DEPTH.with(|d| d.get() > 0);
    if !active {
        return;
    }
    SQL_COUNT.with(|c| c.set(c.get().saturating_add(1)));
}

fn sql_profile_callback(sql: &str, duration: Duration) {
    if !PERF_SQL_ENABLED.load(Ordering::Relaxed) {
        return;
    }

    let ms = duration.as_millis() as u64;
    let threshold = SLOW_SQL_THRESHOLD_MS.load(Ordering::Relaxed);
    if threshold > 0 && ms >= threshold {
        let sql_short = truncate_sql(sql, 420);
        tracing::warn!(
            target: "slow_sql",
            duration_ms = ms,
            sql = %sql_short,
            "slow sql"
        );
        let active = PERF_DEPTH.with(|d| d.get() > 0);
        if active {
            SLOW_SQL_COUNT.with(|c| c.set(c.get().saturating_add(1)));
        }
    }
}

/// 步骤统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlStats {
    pub sql_count: u64,
    pub slow_sql_count: u64,
}

/// 步骤性能 Guard：记录 elapsed_ms + SQL 语句数 + 慢 SQL 数
///
/// 使用方式：
/// ```ignore
/// let perf = hospital_value_calc::perf::StepPerfGuard::new(&task_id, step.id);
/// // execute step...
/// let stats = perf.stats();
/// ```
pub struct StepPerfGuard {
    task_id: String,
    step_id: i64,
    start: Instant,
    sql_start: u64,
    slow_sql_start: u64,
}

impl StepPerfGuard {
    pub fn new(task_id: &str, step_id: i64) -> Self {
        PERF_DEPTH.with(|d| d.set(d.get().saturating_add(1)));
        let sql_start = SQL_COUNT.with(|c| c.get());
        let slow_sql_start = SLOW_SQL_COUNT.with(|c| c.get());
        Self {
            task_id: task_id.to_string(),
            step_id,
            start: Instant::now(),
            sql_start,
            slow_sql_start,
        }
    }

    /// 截至当前的统计
    pub fn stats(&self) -> SqlStats {
        SqlStats {
            sql_count: SQL_COUNT.with(|c| c.get()).saturating_sub(self.sql_start),
            slow_sql_count: SLOW_SQL_COUNT
                .with(|c| c.get())
                .saturating_sub(self.slow_sql_start),
        }
    }
}

impl Drop for StepPerfGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let stats = self.stats();

        tracing::debug!(
            target: "perf",
            task_id = %self.task_id,
            step_id = self.step_id,
            elapsed_ms,
            sql_count = stats.sql_count,
            slow_sql_count = stats.slow_sql_count,
            "step done"
        );

        PERF_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_sql_is_char_safe() {
        assert_eq!(truncate_sql("SELECT 1", 20), "SELECT 1");
        assert_eq!(truncate_sql("SELECT '医生护士'", 10), "SELECT '医生…");
    }

    #[test]
    fn test_guard_counts_statements_on_current_thread() {
        std::env::set_var("HOSPITAL_VALUE_PERF_SQL", "1");
        let mut conn = Connection::open_in_memory().unwrap();
        install_sqlite_tracing(&mut conn);

        let guard = StepPerfGuard::new("t1", 1);
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        assert!(guard.stats().sql_count >= 2);
    }
}
