// ==========================================
// 医院业务价值核算 - 领域类型定义
// ==========================================
// 职责: 状态枚举、节点类型、代码类型、核算周期
// 红线: 状态字符串与数据库存储保持一致 (小写)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 计算任务状态 (Task Status)
// ==========================================
// 状态机: pending -> running -> completed | failed
// completed / failed 为终态,不可再迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,   // 排队中
    Running,   // 执行中
    Completed, // 已完成
    Failed,    // 已失败
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl TaskStatus {
    /// 从数据库字符串解析 (未知值返回 None,不做静默兜底)
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// 转换为数据库存储的字符串
    pub fn to_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

// ==========================================
// 步骤日志状态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepLogStatus {
    Success,
    Failed,
}

impl fmt::Display for StepLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl StepLogStatus {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "success" => Some(StepLogStatus::Success),
            "failed" => Some(StepLogStatus::Failed),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            StepLogStatus::Success => "success",
            StepLogStatus::Failed => "failed",
        }
    }
}

// ==========================================
// 模型节点类型
// ==========================================
// sequence: 序列 (只做汇总,不持有权重)
// dimension: 维度 (末级维度持有权重与工作量)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Sequence,
    Dimension,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl NodeType {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequence" => Some(NodeType::Sequence),
            "dimension" => Some(NodeType::Dimension),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            NodeType::Sequence => "sequence",
            NodeType::Dimension => "dimension",
        }
    }
}

// ==========================================
// 步骤代码类型 (执行方言)
// ==========================================
// sql: 声明式查询,直接在绑定数据源上执行
// script: 原生脚本,JSON 描述的内置运算 (汇总/调整/扣减)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Sql,
    Script,
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

impl CodeKind {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sql" => Some(CodeKind::Sql),
            "script" => Some(CodeKind::Script),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            CodeKind::Sql => "sql",
            CodeKind::Script => "script",
        }
    }
}

// ==========================================
// 核算周期 (Period) - YYYY-MM
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// 解析 `YYYY-MM` 格式周期
    ///
    /// 月份必须为 01-12 且两位,年份必须为四位数字
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (y, m) = s.split_once('-')?;
        if y.len() != 4 || m.len() != 2 {
            return None;
        }
        if !y.chars().all(|c| c.is_ascii_digit()) || !m.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let year: i32 = y.parse().ok()?;
        let month: u32 = m.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Period::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("无效的核算周期: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_db_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_db_str(s.to_db_str()), Some(s));
        }
        assert_eq!(TaskStatus::from_db_str("cancelled"), None);
    }

    #[test]
    fn test_period_parse() {
        let p = Period::parse("2025-10").unwrap();
        assert_eq!(p.year(), 2025);
        assert_eq!(p.month(), 10);
        assert_eq!(p.to_string(), "2025-10");

        assert!(Period::parse("2025-13").is_none());
        assert!(Period::parse("2025-00").is_none());
        assert!(Period::parse("2025-1").is_none());
        assert!(Period::parse("25-10").is_none());
        assert!(Period::parse("2025/10").is_none());
        assert!(Period::parse("").is_none());
    }

    #[test]
    fn test_period_serde() {
        let p: Period = serde_json::from_str("\"2024-02\"").unwrap();
        assert_eq!(p.to_string(), "2024-02");
        assert!(serde_json::from_str::<Period>("\"2024-2\"").is_err());
    }
}
