// ==========================================
// 医院业务价值核算 - SQL 步骤执行器
// ==========================================
// 职责: 按语句拆分 body,顺序执行,累计影响行数,保留末条语句的结果集
// 红线: 拆分只识别引号/注释外的分号,不解析 SQL 语义
// ==========================================

use crate::engine::error::StepError;
use crate::engine::executor::{ExecutionResult, ExecutionScope, StepExecutor};
use rusqlite::types::ValueRef;
use serde_json::{json, Value as JsonValue};

/// 结果集最多保留的行数 (row_count 仍为实际行数)
pub const MAX_CAPTURED_ROWS: usize = 200;

pub struct SqlExecutor;

impl StepExecutor for SqlExecutor {
    fn execute(
        &self,
        body: &str,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let statements = split_statements(body);
        if statements.is_empty() {
            return Err(StepError::Syntax("步骤不包含可执行语句".to_string()));
        }

        let conn = scope.conn();
        let mut rows_affected: u64 = 0;
        let mut last_row_set: Option<JsonValue> = None;

        for (index, sql) in statements.iter().enumerate() {
            scope.check_deadline()?;
            let mut stmt = conn.prepare(sql).map_err(|e| scope.classify(e))?;

            if stmt.column_count() > 0 {
                // INSERT/UPDATE/DELETE ... RETURNING: 每个返回行对应一行改动
                let writes = is_dml(sql) && !stmt.readonly();
                let columns: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();
                let mut rows = stmt.query([]).map_err(|e| scope.classify(e))?;
                let mut captured: Vec<JsonValue> = Vec::new();
                let mut row_count: u64 = 0;
                while let Some(row) = rows.next().map_err(|e| scope.classify(e))? {
                    if captured.len() < MAX_CAPTURED_ROWS {
                        let mut values = Vec::with_capacity(columns.len());
                        for i in 0..columns.len() {
                            let value = row.get_ref(i).map_err(|e| scope.classify(e))?;
                            values.push(value_to_json(value));
                        }
                        captured.push(JsonValue::Array(values));
                    }
                    row_count += 1;
                }
                if writes {
                    rows_affected += row_count;
                }
                last_row_set = Some(json!({
                    "statement_index": index,
                    "columns": columns,
                    "rows": captured,
                    "row_count": row_count,
                    "truncated": row_count as usize > MAX_CAPTURED_ROWS,
                }));
            } else {
                let changed = stmt.execute([]).map_err(|e| scope.classify(e))?;
                // DDL 不重置 sqlite3_changes,只累计 DML
                if is_dml(sql) {
                    rows_affected += changed as u64;
                }
            }
        }

        let mut summary = format!(
            "执行 {} 条语句, 影响 {} 行",
            statements.len(),
            rows_affected
        );
        if let Some(row_count) = last_row_set.as_ref().and_then(|r| r["row_count"].as_u64()) {
            summary.push_str(&format!(", 返回 {} 行", row_count));
        }

        Ok(ExecutionResult {
            rows_affected,
            payload: json!({
                "code_kind": "sql",
                "statement_count": statements.len(),
                "rows_affected": rows_affected,
                "result_set": last_row_set,
            }),
            summary,
        })
    }
}

/// 首个关键字 (跳过前导空白与注释)
fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn is_dml(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "WITH"
    )
}

fn value_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(format!("<blob {} bytes>", b.len())),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    Quoted(u8),
    LineComment,
    BlockComment,
}

/// 按分号拆分语句
///
/// 引号 ('' "" `` []) 与注释 (-- /* */) 内的分号不拆分;
/// 只含空白与注释的片段丢弃
pub fn split_statements(body: &str) -> Vec<String> {
    let bytes = body.as_bytes();
    let mut statements = Vec::new();
    let mut state = LexState::Normal;
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            LexState::Normal => match b {
                b'\'' | b'"' | b'`' => {
                    state = LexState::Quoted(b);
                    has_code = true;
                }
                b'[' => {
                    state = LexState::Quoted(b']');
                    has_code = true;
                }
                b'-' if next == Some(b'-') => {
                    state = LexState::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = LexState::BlockComment;
                    i += 1;
                }
                b';' => {
                    if has_code {
                        statements.push(body[start..i].trim().to_string());
                    }
                    start = i + 1;
                    has_code = false;
                }
                c if !c.is_ascii_whitespace() => has_code = true,
                _ => {}
            },
            LexState::Quoted(close) => {
                if b == close {
                    // 引号转义: '' / ""
                    if close != b']' && next == Some(close) {
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::LineComment => {
                if b == b'\n' {
                    state = LexState::Normal;
                }
            }
            LexState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = LexState::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if has_code {
        statements.push(body[start..].trim().to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::template::TemplateContext;

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let body = "INSERT INTO t VALUES ('a;b'); -- trailing; comment\n\
                    /* block; */ UPDATE t SET x = \"c;d\";\n;  -- only comment\n";
        let parts = split_statements(body);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "INSERT INTO t VALUES ('a;b')");
        assert!(parts[1].ends_with("UPDATE t SET x = \"c;d\""));
    }

    #[test]
    fn test_split_escaped_quote_and_no_trailing_semicolon() {
        let parts = split_statements("SELECT 'it''s; fine'; SELECT [odd;name] FROM t");
        assert_eq!(
            parts,
            vec!["SELECT 'it''s; fine'", "SELECT [odd;name] FROM t"]
        );
        assert!(split_statements(" -- nothing\n /* here */ ").is_empty());
    }

    #[test]
    fn test_counts_mutations_and_captures_last_row_set() {
        let conn = crate::db::open_test_connection();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mut scope = ExecutionScope::new(&conn, TemplateContext::default());
        let result = SqlExecutor
            .execute(
                "INSERT INTO t VALUES (1),(2),(3); UPDATE t SET x = x * 10 WHERE x > 1; \
                 SELECT x, 'n' AS tag FROM t ORDER BY x",
                &mut scope,
            )
            .unwrap();
        assert_eq!(result.rows_affected, 5);
        let set = &result.payload["result_set"];
        assert_eq!(set["row_count"], 3);
        assert_eq!(set["columns"], json!(["x", "tag"]));
        assert_eq!(set["rows"][2], json!([30, "n"]));
    }

    #[test]
    fn test_empty_body_is_syntax_error() {
        let conn = crate::db::open_test_connection();
        let mut scope = ExecutionScope::new(&conn, TemplateContext::default());
        let err = SqlExecutor.execute("  ; -- x", &mut scope).unwrap_err();
        assert_eq!(err.kind(), "syntax");
        let err = SqlExecutor.execute("SELEC 1", &mut scope).unwrap_err();
        assert_eq!(err.kind(), "syntax");
    }

    #[test]
    fn test_ddl_does_not_count_stale_changes() {
        let conn = crate::db::open_test_connection();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2)").unwrap();
        let mut scope = ExecutionScope::new(&conn, TemplateContext::default());
        let result = SqlExecutor
            .execute("/* 建表 */ CREATE TABLE u (y INTEGER); INSERT INTO u VALUES (9)", &mut scope)
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert!(!is_dml("-- c\nCREATE INDEX i ON u(y)"));
        assert!(is_dml("  with a AS (SELECT 1) INSERT INTO u SELECT * FROM a"));
    }

    #[test]
    fn test_returning_rows_count_as_affected() {
        let conn = crate::db::open_test_connection();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mut scope = ExecutionScope::new(&conn, TemplateContext::default());
        let result = SqlExecutor
            .execute(
                "INSERT INTO t VALUES (1), (2) RETURNING x; \
                 UPDATE t SET x = x + 1 WHERE x = 2 RETURNING x; \
                 WITH c AS (SELECT x FROM t) SELECT x FROM c",
                &mut scope,
            )
            .unwrap();
        // 只读 CTE 查询不计入
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.payload["result_set"]["row_count"], 2);
    }
}
