// ==========================================
// 医院业务价值核算 - 外部数据源绑定
// ==========================================
// 步骤绑定数据源时,以只读方式 ATTACH 到任务连接,别名即登记名
// 红线: 文件缺失/数据源停用/无法打开 一律视为数据源不可用,不自动创建文件
// ==========================================

use crate::engine::error::StepError;
use crate::repository::data_source_repo::{find_data_source, is_valid_alias};
use rusqlite::{params, Connection};
use std::path::Path;

/// 已挂载的数据源 (步骤结束后卸载)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedSource {
    pub alias: String,
    pub db_path: String,
}

pub struct DataSourceBinder;

impl DataSourceBinder {
    /// 按登记名挂载数据源
    ///
    /// # 返回
    /// - Ok(None): 步骤未绑定数据源,直接使用结果库
    /// - Ok(Some(_)): 已挂载,SQL 中以 `别名.表名` 访问
    pub fn bind(
        conn: &Connection,
        data_source_ref: Option<&str>,
    ) -> Result<Option<AttachedSource>, StepError> {
        let name = match data_source_ref.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => name,
            None => return Ok(None),
        };

        let unavailable = |reason: String| StepError::SourceUnavailable {
            name: name.to_string(),
            reason,
        };

        if !is_valid_alias(name) {
            return Err(unavailable("数据源名称不合法".to_string()));
        }

        let source = find_data_source(conn, name)
            .map_err(|e| unavailable(format!("读取数据源登记失败: {}", e)))?
            .ok_or_else(|| unavailable("数据源未登记".to_string()))?;

        if !source.is_enabled {
            return Err(unavailable("数据源已停用".to_string()));
        }
        if !Path::new(&source.db_path).is_file() {
            return Err(unavailable(format!("数据库文件不存在: {}", source.db_path)));
        }

        let uri = format!("file:{}?mode=ro", encode_uri_path(&source.db_path));
        conn.execute(&format!("ATTACH DATABASE ?1 AS \"{}\"", name), params![uri])
            .map_err(|e| unavailable(format!("挂载失败: {}", e)))?;

        // 非 SQLite 文件在首次读取时才会报错,挂载后立即探测
        let check: rusqlite::Result<i64> = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\".sqlite_master", name),
            [],
            |row| row.get(0),
        );
        if let Err(e) = check {
            let _ = conn.execute("DETACH DATABASE ?1", params![name]);
            return Err(unavailable(format!("无法读取: {}", e)));
        }

        tracing::debug!(alias = name, db_path = %source.db_path, "数据源已挂载");
        Ok(Some(AttachedSource {
            alias: name.to_string(),
            db_path: source.db_path,
        }))
    }

    /// 卸载数据源 (须在事务结束后调用)
    pub fn release(conn: &Connection, attached: Option<AttachedSource>) {
        if let Some(source) = attached {
            if let Err(e) = conn.execute("DETACH DATABASE ?1", params![source.alias]) {
                tracing::warn!(alias = %source.alias, error = %e, "数据源卸载失败");
            }
        }
    }
}

/// URI 文件名中的保留字符转义
fn encode_uri_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => out.push_str("%25"),
            '?' => out.push_str("%3f"),
            '#' => out.push_str("%23"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn register(conn: &Connection, name: &str, path: &str, enabled: bool) {
        conn.execute(
            "INSERT INTO data_source (name, db_path, is_enabled) VALUES (?1, ?2, ?3)",
            params![name, path, enabled],
        )
        .unwrap();
    }

    #[test]
    fn test_unbound_step_uses_result_store() {
        let conn = crate::db::open_test_connection();
        assert_eq!(DataSourceBinder::bind(&conn, None).unwrap(), None);
        assert_eq!(DataSourceBinder::bind(&conn, Some("  ")).unwrap(), None);
    }

    #[test]
    fn test_bind_and_read_attached_source() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        {
            let src = Connection::open(&path).unwrap();
            src.execute_batch("CREATE TABLE ledger (x INTEGER); INSERT INTO ledger VALUES (42);")
                .unwrap();
        }

        let conn = crate::db::open_test_connection();
        register(&conn, "his", &path, true);
        let attached = DataSourceBinder::bind(&conn, Some("his")).unwrap();
        let x: i64 = conn
            .query_row("SELECT x FROM his.ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(x, 42);

        // 只读挂载
        assert!(conn.execute("INSERT INTO his.ledger VALUES (1)", []).is_err());

        DataSourceBinder::release(&conn, attached);
        assert!(conn.query_row("SELECT x FROM his.ledger", [], |r| r.get::<_, i64>(0)).is_err());
    }

    #[test]
    fn test_unavailable_sources() {
        let conn = crate::db::open_test_connection();
        register(&conn, "gone", "/nonexistent/dir/ledger.db", true);
        let file = NamedTempFile::new().unwrap();
        register(&conn, "off", file.path().to_str().unwrap(), false);

        for name in ["gone", "off", "unknown"] {
            let err = DataSourceBinder::bind(&conn, Some(name)).unwrap_err();
            assert_eq!(err.kind(), "source_unavailable", "{}", name);
        }
        assert!(!Path::new("/nonexistent/dir/ledger.db").exists());
    }

    #[test]
    fn test_non_sqlite_file_is_unavailable() {
        use std::io::Write;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not a database file, just some text padding padding").unwrap();
        let conn = crate::db::open_test_connection();
        register(&conn, "junk", file.path().to_str().unwrap(), true);
        let err = DataSourceBinder::bind(&conn, Some("junk")).unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }
}
