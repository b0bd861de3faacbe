// ==========================================
// 医院业务价值核算 - SQLite 连接初始化与表结构
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为 (外键/busy_timeout/WAL)
// - 引擎自有表结构集中定义,CREATE IF NOT EXISTS 保证幂等
// - 结果唯一性由 UNIQUE 约束保证,不依赖事后去重
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::path::PathBuf;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

/// 默认数据库路径
///
/// 优先读取环境变量 HOSPITAL_VALUE_DB_PATH,否则使用用户数据目录
pub fn default_db_path() -> String {
    if let Ok(path) = std::env::var("HOSPITAL_VALUE_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./hospital_value.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("hospital-value-calc");
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("hospital_value.db");
        }
    }
    path.to_string_lossy().into_owned()
}

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
///
/// 文件库切换为 WAL,多个任务并发执行时读写互不阻塞
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 初始化引擎自有表结构 (幂等)
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(ENGINE_SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;

    match read_schema_version(conn)? {
        Some(v) if v > CURRENT_SCHEMA_VERSION => {
            tracing::warn!(
                db_version = v,
                code_version = CURRENT_SCHEMA_VERSION,
                "数据库 schema_version 高于当前代码版本"
            );
        }
        _ => {}
    }
    Ok(())
}

/// 初始化外部参考数据表 (工作量/导向/学科/成本)
///
/// 这些表由外部系统维护,此处仅固化引擎读取所依赖的列契约,
/// 供开发库、测试库建库使用
pub fn init_reference_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(REFERENCE_SCHEMA)
}

const ENGINE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS model_version (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_model_version_org
    ON model_version(organization_id, is_active);

CREATE TABLE IF NOT EXISTS model_node (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_version_id INTEGER NOT NULL REFERENCES model_version(id) ON DELETE CASCADE,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    node_type TEXT NOT NULL CHECK (node_type IN ('sequence', 'dimension')),
    is_leaf INTEGER NOT NULL DEFAULT 0,
    parent_id INTEGER REFERENCES model_node(id),
    weight REAL,
    orientation_rule_ids TEXT NOT NULL DEFAULT '[]',
    sort_order INTEGER NOT NULL DEFAULT 0,
    UNIQUE (model_version_id, code)
);

CREATE INDEX IF NOT EXISTS idx_model_node_parent ON model_node(parent_id);

CREATE TABLE IF NOT EXISTS accounting_unit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id TEXT NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (organization_id, code)
);

CREATE TABLE IF NOT EXISTS data_source (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    db_path TEXT NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS calculation_workflow (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_version_id INTEGER NOT NULL REFERENCES model_version(id),
    name TEXT NOT NULL,
    description TEXT,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calculation_step (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id INTEGER NOT NULL REFERENCES calculation_workflow(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    code_kind TEXT NOT NULL CHECK (code_kind IN ('sql', 'script')),
    body TEXT NOT NULL,
    sort_num INTEGER NOT NULL,
    sort_den INTEGER NOT NULL CHECK (sort_den > 0),
    sort_key_real REAL NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    data_source_ref TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calculation_step_workflow
    ON calculation_step(workflow_id, sort_key_real);

CREATE TABLE IF NOT EXISTS calculation_task (
    task_id TEXT PRIMARY KEY,
    model_version_id INTEGER NOT NULL REFERENCES model_version(id),
    workflow_id INTEGER NOT NULL REFERENCES calculation_workflow(id),
    period TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    progress REAL NOT NULL DEFAULT 0,
    description TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_calculation_task_status
    ON calculation_task(status, created_at);

CREATE TABLE IF NOT EXISTS calculation_step_log (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES calculation_task(task_id),
    step_id INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    result_payload TEXT,
    execution_info TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_step_log_task ON calculation_step_log(task_id, log_id);

-- 步骤日志只追加
CREATE TRIGGER IF NOT EXISTS trg_step_log_append_only
BEFORE UPDATE ON calculation_step_log
BEGIN
    SELECT RAISE(ABORT, 'calculation_step_log is append-only');
END;

CREATE TABLE IF NOT EXISTS calculation_result (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    unit_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    node_code TEXT NOT NULL,
    node_name TEXT NOT NULL,
    node_type TEXT NOT NULL CHECK (node_type IN ('sequence', 'dimension')),
    parent_id INTEGER,
    workload REAL NOT NULL DEFAULT 0,
    weight REAL,
    original_weight REAL,
    value REAL NOT NULL DEFAULT 0,
    ratio REAL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    UNIQUE (task_id, node_id, unit_id)
);

CREATE INDEX IF NOT EXISTS idx_calculation_result_unit
    ON calculation_result(task_id, unit_id);

-- original_weight 首次写入后不可修改
CREATE TRIGGER IF NOT EXISTS trg_result_original_weight_frozen
BEFORE UPDATE OF original_weight ON calculation_result
WHEN OLD.original_weight IS NOT NULL AND NEW.original_weight IS NOT OLD.original_weight
BEGIN
    SELECT RAISE(ABORT, 'original_weight is immutable after first write');
END;

-- 已完成任务的结果不可删除
CREATE TRIGGER IF NOT EXISTS trg_result_completed_retained
BEFORE DELETE ON calculation_result
WHEN (SELECT status FROM calculation_task WHERE task_id = OLD.task_id) = 'completed'
BEGIN
    SELECT RAISE(ABORT, 'results of a completed task cannot be deleted');
END;

CREATE TABLE IF NOT EXISTS calculation_summary (
    task_id TEXT NOT NULL,
    unit_id INTEGER NOT NULL,
    categories_json TEXT NOT NULL,
    total_value REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (task_id, unit_id)
);

CREATE TABLE IF NOT EXISTS adjustment_detail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    unit_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    pass_name TEXT NOT NULL,
    rule_ref TEXT,
    actual_value REAL,
    benchmark_value REAL,
    ratio REAL,
    coefficient REAL,
    weight_before REAL,
    weight_after REAL,
    is_adjusted INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_adjustment_detail_task
    ON adjustment_detail(task_id, unit_id, node_id);
"#;

const REFERENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workload_record (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id TEXT NOT NULL,
    period TEXT NOT NULL,
    unit_code TEXT NOT NULL,
    dimension_code TEXT NOT NULL,
    quantity REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS orientation_rule (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    orientation_type TEXT NOT NULL CHECK (orientation_type IN ('benchmark_ladder', 'fixed_benchmark'))
);

CREATE TABLE IF NOT EXISTS orientation_benchmark (
    rule_id INTEGER NOT NULL,
    unit_code TEXT NOT NULL,
    period TEXT NOT NULL,
    benchmark_value REAL NOT NULL,
    PRIMARY KEY (rule_id, unit_code, period)
);

CREATE TABLE IF NOT EXISTS orientation_actual (
    rule_id INTEGER NOT NULL,
    unit_code TEXT NOT NULL,
    period TEXT NOT NULL,
    actual_value REAL NOT NULL,
    PRIMARY KEY (rule_id, unit_code, period)
);

CREATE TABLE IF NOT EXISTS orientation_ladder (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL,
    lower_limit REAL NOT NULL,
    upper_limit REAL,
    intensity REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS discipline_rule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_version_id INTEGER NOT NULL,
    organization_id TEXT NOT NULL,
    unit_code TEXT NOT NULL,
    dimension_code TEXT NOT NULL,
    coefficient REAL NOT NULL,
    UNIQUE (model_version_id, organization_id, unit_code, dimension_code)
);

CREATE TABLE IF NOT EXISTS cost_report (
    organization_id TEXT NOT NULL,
    unit_code TEXT NOT NULL,
    period TEXT NOT NULL,
    personnel_cost REAL NOT NULL DEFAULT 0,
    material_cost REAL NOT NULL DEFAULT 0,
    depreciation_cost REAL NOT NULL DEFAULT 0,
    other_cost REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (organization_id, unit_code, period)
);
"#;

/// 测试用内存库 (引擎表 + 参考表)
#[cfg(test)]
pub(crate) fn open_test_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    configure_sqlite_connection(&conn).unwrap();
    init_schema(&conn).unwrap();
    init_reference_schema(&conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        open_test_connection()
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
        init_reference_schema(&conn).unwrap();
        init_reference_schema(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_result_uniqueness_is_structural() {
        let conn = memory_db();
        let insert = "INSERT INTO calculation_result
            (task_id, unit_id, node_id, node_code, node_name, node_type, workload, weight, original_weight, value)
            VALUES ('t1', 1, 10, 'L', 'leaf', 'dimension', 100, 10, 10, 1000)";
        conn.execute(insert, []).unwrap();
        let err = conn.execute(insert, []).unwrap_err();
        assert!(err.to_string().contains("UNIQUE"));

        // 其他任务的同一 (node, unit) 不冲突
        conn.execute(&insert.replace("'t1'", "'t2'"), []).unwrap();
    }

    #[test]
    fn test_original_weight_is_frozen() {
        let conn = memory_db();
        conn.execute(
            "INSERT INTO calculation_result
            (task_id, unit_id, node_id, node_code, node_name, node_type, workload, weight, original_weight, value)
            VALUES ('t1', 1, 10, 'L', 'leaf', 'dimension', 100, 10, 10, 1000)",
            [],
        )
        .unwrap();

        conn.execute(
            "UPDATE calculation_result SET weight = weight * 0.8, value = value * 0.8",
            [],
        )
        .unwrap();
        let err = conn
            .execute("UPDATE calculation_result SET original_weight = 8", [])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn test_step_log_is_append_only() {
        let conn = memory_db();
        conn.execute_batch(
            "INSERT INTO model_version (id, organization_id, name, created_at) VALUES (1, 'H1', 'v1', '2025-01-01 00:00:00');
             INSERT INTO calculation_workflow (id, model_version_id, name, created_at) VALUES (1, 1, 'wf', '2025-01-01 00:00:00');
             INSERT INTO calculation_task (task_id, model_version_id, workflow_id, period, organization_id, created_at)
                VALUES ('t1', 1, 1, '2025-10', 'H1', '2025-01-01 00:00:00');
             INSERT INTO calculation_step_log (task_id, step_id, step_name, status, start_time, end_time, duration_ms)
                VALUES ('t1', 1, 's', 'success', 'a', 'b', 1);",
        )
        .unwrap();
        let err = conn
            .execute("UPDATE calculation_step_log SET status = 'failed'", [])
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
    }
}
