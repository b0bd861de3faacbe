// ==========================================
// 医院业务价值核算 - 模型树
// ==========================================
// 职责: 由版本节点构建只读树,提供后序遍历与按编码查找
// 红线: 构建时校验 父节点存在 / 无环 / 末级节点无子节点
// ==========================================

use crate::domain::model::ModelNode;
use crate::domain::types::NodeType;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("模型版本 {0} 没有任何节点")]
    Empty(i64),

    #[error("节点 {code} 的父节点 {parent_id} 不存在于同一版本")]
    MissingParent { code: String, parent_id: i64 },

    #[error("模型树存在环或孤立节点: {0:?}")]
    Unreachable(Vec<String>),

    #[error("末级节点 {0} 存在子节点")]
    LeafWithChildren(String),

    #[error("序列节点 {0} 不能为末级节点")]
    SequenceLeaf(String),
}

#[derive(Debug, Clone)]
pub struct ModelTree {
    version_id: i64,
    nodes: HashMap<i64, ModelNode>,
    children: HashMap<i64, Vec<i64>>,
    roots: Vec<i64>,
    by_code: HashMap<String, i64>,
}

impl ModelTree {
    pub fn build(version_id: i64, nodes: Vec<ModelNode>) -> Result<Self, TreeError> {
        if nodes.is_empty() {
            return Err(TreeError::Empty(version_id));
        }

        // nodes 已按 (sort_order, id) 有序,子节点列表沿用该顺序
        let mut roots = Vec::new();
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        let ids: std::collections::HashSet<i64> = nodes.iter().map(|n| n.id).collect();
        for node in &nodes {
            if node.node_type == NodeType::Sequence && node.is_leaf {
                return Err(TreeError::SequenceLeaf(node.code.clone()));
            }
            match node.parent_id {
                None => roots.push(node.id),
                Some(parent_id) if ids.contains(&parent_id) => {
                    children.entry(parent_id).or_default().push(node.id)
                }
                Some(parent_id) => {
                    return Err(TreeError::MissingParent {
                        code: node.code.clone(),
                        parent_id,
                    })
                }
            }
        }

        let by_code = nodes.iter().map(|n| (n.code.clone(), n.id)).collect();
        let nodes: HashMap<i64, ModelNode> = nodes.into_iter().map(|n| (n.id, n)).collect();

        for parent_id in children.keys() {
            if let Some(parent) = nodes.get(parent_id) {
                if parent.is_leaf {
                    return Err(TreeError::LeafWithChildren(parent.code.clone()));
                }
            }
        }

        let tree = Self {
            version_id,
            nodes,
            children,
            roots,
            by_code,
        };

        let reachable = tree.post_order().len();
        if reachable != tree.nodes.len() {
            let visited: std::collections::HashSet<i64> = tree.post_order().into_iter().collect();
            let mut orphans: Vec<String> = tree
                .nodes
                .values()
                .filter(|n| !visited.contains(&n.id))
                .map(|n| n.code.clone())
                .collect();
            orphans.sort();
            return Err(TreeError::Unreachable(orphans));
        }
        Ok(tree)
    }

    pub fn version_id(&self) -> i64 {
        self.version_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: i64) -> Option<&ModelNode> {
        self.nodes.get(&id)
    }

    pub fn node_by_code(&self, code: &str) -> Option<&ModelNode> {
        self.by_code.get(code).and_then(|id| self.nodes.get(id))
    }

    pub fn roots(&self) -> impl Iterator<Item = &ModelNode> {
        self.roots.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn children(&self, id: i64) -> impl Iterator<Item = &ModelNode> {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|cid| self.nodes.get(cid))
    }

    /// 末级维度节点 (按后序)
    pub fn leaves(&self) -> Vec<&ModelNode> {
        self.post_order()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .filter(|n| n.is_leaf_dimension())
            .collect()
    }

    /// 后序遍历: 子节点先于父节点
    ///
    /// 显式栈实现,树深度不受调用栈限制
    pub fn post_order(&self) -> Vec<i64> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(i64, bool)> = self.roots.iter().rev().map(|&id| (id, false)).collect();
        let mut seen = std::collections::HashSet::with_capacity(self.nodes.len());

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(kids) = self.children.get(&id) {
                for &kid in kids.iter().rev() {
                    stack.push((kid, false));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, code: &str, node_type: NodeType, is_leaf: bool, parent: Option<i64>) -> ModelNode {
        ModelNode {
            id,
            model_version_id: 1,
            code: code.to_string(),
            name: code.to_string(),
            node_type,
            is_leaf,
            parent_id: parent,
            weight: if is_leaf { Some(1.0) } else { None },
            orientation_rule_ids: vec![],
            sort_order: 0,
        }
    }

    fn sample() -> Vec<ModelNode> {
        vec![
            node(1, "DOC", NodeType::Sequence, false, None),
            node(2, "DOC-OP", NodeType::Dimension, false, Some(1)),
            node(3, "DOC-OP-1", NodeType::Dimension, true, Some(2)),
            node(4, "DOC-OP-2", NodeType::Dimension, true, Some(2)),
            node(5, "NUR", NodeType::Sequence, false, None),
            node(6, "NUR-1", NodeType::Dimension, true, Some(5)),
        ]
    }

    #[test]
    fn test_post_order_children_first() {
        let tree = ModelTree::build(1, sample()).unwrap();
        assert_eq!(tree.post_order(), vec![3, 4, 2, 1, 6, 5]);
        let leaf_codes: Vec<_> = tree.leaves().iter().map(|n| n.code.as_str()).collect();
        assert_eq!(leaf_codes, vec!["DOC-OP-1", "DOC-OP-2", "NUR-1"]);
        assert_eq!(tree.node_by_code("DOC-OP").unwrap().id, 2);
        assert_eq!(tree.children(2).count(), 2);
        assert_eq!(tree.roots().count(), 2);
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut nodes = sample();
        nodes.push(node(7, "X", NodeType::Dimension, true, Some(99)));
        assert!(matches!(
            ModelTree::build(1, nodes),
            Err(TreeError::MissingParent { parent_id: 99, .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            node(1, "ROOT", NodeType::Sequence, false, None),
            node(2, "A", NodeType::Dimension, false, Some(3)),
            node(3, "B", NodeType::Dimension, false, Some(2)),
        ];
        assert_eq!(
            ModelTree::build(1, nodes).unwrap_err(),
            TreeError::Unreachable(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn test_structural_invariants() {
        assert_eq!(ModelTree::build(9, vec![]).unwrap_err(), TreeError::Empty(9));

        let nodes = vec![
            node(1, "ROOT", NodeType::Sequence, false, None),
            node(2, "L", NodeType::Dimension, true, Some(1)),
            node(3, "UNDER-LEAF", NodeType::Dimension, true, Some(2)),
        ];
        assert_eq!(
            ModelTree::build(1, nodes).unwrap_err(),
            TreeError::LeafWithChildren("L".to_string())
        );

        let nodes = vec![node(1, "S", NodeType::Sequence, true, None)];
        assert_eq!(
            ModelTree::build(1, nodes).unwrap_err(),
            TreeError::SequenceLeaf("S".to_string())
        );
    }

    #[test]
    fn test_deep_tree_does_not_overflow() {
        let mut nodes = vec![node(1, "N1", NodeType::Sequence, false, None)];
        for i in 2..=5_000 {
            nodes.push(node(i, &format!("N{}", i), NodeType::Dimension, false, Some(i - 1)));
        }
        nodes.push(node(5_001, "LEAF", NodeType::Dimension, true, Some(5_000)));
        let tree = ModelTree::build(1, nodes).unwrap();
        let order = tree.post_order();
        assert_eq!(order.first(), Some(&5_001));
        assert_eq!(order.last(), Some(&1));
    }
}
