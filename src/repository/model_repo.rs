// ==========================================
// 医院业务价值核算 - 模型版本/模型节点仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// 红线: 同一机构至多一个激活版本
// ==========================================

use crate::domain::model::{ModelNode, ModelVersion, NewModelNode};
use crate::domain::types::NodeType;
use crate::repository::error::{
    format_db_datetime, parse_db_datetime, RepositoryError, RepositoryResult,
};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ==========================================
// ModelVersionRepository
// ==========================================
pub struct ModelVersionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ModelVersionRepository {
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建仓储实例
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 创建模型版本 (默认未激活)
    pub fn create_version(
        &self,
        organization_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO model_version (organization_id, name, description, is_active, created_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
            params![
                organization_id,
                name,
                description,
                format_db_datetime(&Local::now().naive_local())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_version(&self, version_id: i64) -> RepositoryResult<Option<ModelVersion>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                r#"
                SELECT id, organization_id, name, description, is_active, created_at
                FROM model_version WHERE id = ?1
                "#,
                params![version_id],
                read_version_row,
            )
            .optional()?;
        raw.map(VersionRow::into_domain).transpose()
    }

    /// 查询机构当前激活版本
    pub fn find_active(&self, organization_id: &str) -> RepositoryResult<Option<ModelVersion>> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                r#"
                SELECT id, organization_id, name, description, is_active, created_at
                FROM model_version
                WHERE organization_id = ?1 AND is_active = 1
                ORDER BY id DESC LIMIT 1
                "#,
                params![organization_id],
                read_version_row,
            )
            .optional()?;
        raw.map(VersionRow::into_domain).transpose()
    }

    pub fn list_versions(&self, organization_id: &str) -> RepositoryResult<Vec<ModelVersion>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, organization_id, name, description, is_active, created_at
            FROM model_version WHERE organization_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map(params![organization_id], read_version_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(VersionRow::into_domain).collect()
    }

    /// 激活版本: 同机构其他版本同时取消激活 (单事务)
    pub fn activate(&self, version_id: i64) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let organization_id: String = tx
            .query_row(
                "SELECT organization_id FROM model_version WHERE id = ?1",
                params![version_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "ModelVersion".to_string(),
                id: version_id.to_string(),
            })?;

        tx.execute(
            "UPDATE model_version SET is_active = 0 WHERE organization_id = ?1",
            params![organization_id],
        )?;
        tx.execute(
            "UPDATE model_version SET is_active = 1 WHERE id = ?1",
            params![version_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 复制版本 (节点整体复制,父子关系按新ID重映射)
    ///
    /// 新版本未激活
    pub fn copy_version(&self, source_version_id: i64, new_name: &str) -> RepositoryResult<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let (organization_id, description): (String, Option<String>) = tx
            .query_row(
                "SELECT organization_id, description FROM model_version WHERE id = ?1",
                params![source_version_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "ModelVersion".to_string(),
                id: source_version_id.to_string(),
            })?;

        tx.execute(
            r#"
            INSERT INTO model_version (organization_id, name, description, is_active, created_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
            params![
                organization_id,
                new_name,
                description,
                format_db_datetime(&Local::now().naive_local())
            ],
        )?;
        let new_version_id = tx.last_insert_rowid();

        // 父节点先于子节点插入
        let nodes = load_nodes(&tx, source_version_id)?;
        let ordered = parents_first(&nodes);
        let mut id_map: HashMap<i64, i64> = HashMap::with_capacity(nodes.len());
        for node in ordered {
            let parent_id = match node.parent_id {
                Some(old) => Some(*id_map.get(&old).ok_or_else(|| {
                    RepositoryError::ValidationError(format!(
                        "节点 {} 的父节点 {} 不在版本 {} 内",
                        node.code, old, source_version_id
                    ))
                })?),
                None => None,
            };
            let copy = NewModelNode {
                code: node.code.clone(),
                name: node.name.clone(),
                node_type: node.node_type,
                is_leaf: node.is_leaf,
                parent_id,
                weight: node.weight,
                orientation_rule_ids: node.orientation_rule_ids.clone(),
                sort_order: node.sort_order,
            };
            let new_id = insert_node(&tx, new_version_id, &copy)?;
            id_map.insert(node.id, new_id);
        }

        tx.commit()?;
        tracing::info!(
            source_version_id,
            new_version_id,
            node_count = id_map.len(),
            "模型版本复制完成"
        );
        Ok(new_version_id)
    }
}

// ==========================================
// ModelNodeRepository
// ==========================================
// 节点只随版本新建/复制写入,计算过程只读
pub struct ModelNodeRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ModelNodeRepository {
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 新增节点
    pub fn create(&self, version_id: i64, node: &NewModelNode) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        insert_node(&conn, version_id, node)
    }

    /// 查询版本下全部节点 (按 sort_order, id 排序)
    pub fn find_by_version(&self, version_id: i64) -> RepositoryResult<Vec<ModelNode>> {
        let conn = self.get_conn()?;
        load_nodes(&conn, version_id)
    }
}

// ==========================================
// 共享行读写 (供执行器在步骤事务内复用)
// ==========================================

pub(crate) fn insert_node(
    conn: &Connection,
    version_id: i64,
    node: &NewModelNode,
) -> RepositoryResult<i64> {
    conn.execute(
        r#"
        INSERT INTO model_node (
            model_version_id, code, name, node_type, is_leaf,
            parent_id, weight, orientation_rule_ids, sort_order
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            version_id,
            node.code,
            node.name,
            node.node_type.to_db_str(),
            node.is_leaf,
            node.parent_id,
            node.weight,
            serde_json::to_string(&node.orientation_rule_ids)?,
            node.sort_order,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// 读取版本下全部节点
pub(crate) fn load_nodes(conn: &Connection, version_id: i64) -> RepositoryResult<Vec<ModelNode>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, model_version_id, code, name, node_type, is_leaf,
               parent_id, weight, orientation_rule_ids, sort_order
        FROM model_node
        WHERE model_version_id = ?1
        ORDER BY sort_order, id
        "#,
    )?;
    let rows = stmt
        .query_map(params![version_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<f64>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i32>(9)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, model_version_id, code, name, node_type, is_leaf, parent_id, weight, rules, sort_order)| {
                let node_type = NodeType::from_db_str(&node_type).ok_or_else(|| {
                    RepositoryError::FieldValueError {
                        field: "node_type".to_string(),
                        message: node_type.clone(),
                    }
                })?;
                Ok(ModelNode {
                    id,
                    model_version_id,
                    code,
                    name,
                    node_type,
                    is_leaf,
                    parent_id,
                    weight,
                    orientation_rule_ids: serde_json::from_str(&rules)?,
                    sort_order,
                })
            },
        )
        .collect()
}

/// 按 "父节点在前" 排序 (广度优先)
fn parents_first(nodes: &[ModelNode]) -> Vec<&ModelNode> {
    let mut ordered: Vec<&ModelNode> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
    let mut cursor = 0;
    while cursor < ordered.len() {
        let parent_id = ordered[cursor].id;
        ordered.extend(nodes.iter().filter(|n| n.parent_id == Some(parent_id)));
        cursor += 1;
    }
    ordered
}

struct VersionRow {
    id: i64,
    organization_id: String,
    name: String,
    description: Option<String>,
    is_active: bool,
    created_at: String,
}

fn read_version_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl VersionRow {
    fn into_domain(self) -> RepositoryResult<ModelVersion> {
        Ok(ModelVersion {
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            description: self.description,
            is_active: self.is_active,
            created_at: parse_db_datetime("created_at", &self.created_at)?,
        })
    }
}
