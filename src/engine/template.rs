// ==========================================
// 医院业务价值核算 - 步骤模板解析
// ==========================================
// 红线: 单遍替换,替换结果不再扫描 (值中的花括号保持原样)
// 红线: 全部识别到的占位符都能绑定,否则整体失败,不做部分替换
// 红线: 非识别的花括号文本原样保留
// ==========================================

use crate::domain::task::CalculationTask;
use crate::domain::types::Period;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("占位符未绑定: {{{token}}}")]
    UnresolvedPlaceholder { token: String },
}

// ==========================================
// Placeholder - 可识别的占位符 (封闭集合)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    TaskId,
    Period,
    CurrentYearMonth,
    OrganizationId,
    ModelVersionId,
}

impl Placeholder {
    pub const ALL: [Placeholder; 5] = [
        Placeholder::TaskId,
        Placeholder::Period,
        Placeholder::CurrentYearMonth,
        Placeholder::OrganizationId,
        Placeholder::ModelVersionId,
    ];

    /// 花括号内的名称
    pub fn name(&self) -> &'static str {
        match self {
            Placeholder::TaskId => "task_id",
            Placeholder::Period => "period",
            Placeholder::CurrentYearMonth => "current_year_month",
            Placeholder::OrganizationId => "organization_id",
            Placeholder::ModelVersionId => "model_version_id",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.name())
    }
}

// ==========================================
// TemplateContext - 执行上下文绑定
// ==========================================
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    pub task_id: Option<String>,
    pub period: Option<Period>,
    pub organization_id: Option<String>,
    pub model_version_id: Option<i64>,
    /// current_year_month 的覆盖值 (缺省同 period)
    pub current_period: Option<Period>,
}

impl TemplateContext {
    /// 由任务构建完整上下文
    pub fn for_task(task: &CalculationTask) -> Self {
        Self {
            task_id: Some(task.task_id.clone()),
            period: Period::parse(&task.period),
            organization_id: Some(task.organization_id.clone()),
            model_version_id: Some(task.model_version_id),
            current_period: None,
        }
    }

    pub fn with_current_period(mut self, period: Period) -> Self {
        self.current_period = Some(period);
        self
    }

    /// 占位符取值 (空字符串视同未绑定)
    pub fn value_of(&self, placeholder: Placeholder) -> Option<String> {
        let value = match placeholder {
            Placeholder::TaskId => self.task_id.clone(),
            Placeholder::Period => self.period.map(|p| p.to_string()),
            Placeholder::CurrentYearMonth => {
                self.current_period.or(self.period).map(|p| p.to_string())
            }
            Placeholder::OrganizationId => self.organization_id.clone(),
            Placeholder::ModelVersionId => self.model_version_id.map(|id| id.to_string()),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// 扫描 body 中的 `{name}` 片段,回调 (起始, 结束, 名称)
fn scan_braces<'a>(body: &'a str, mut visit: impl FnMut(usize, usize, &'a str)) {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(rel) = body[i + 1..].find(|c| c == '}' || c == '{') {
                let end = i + 1 + rel;
                if bytes[end] == b'}' {
                    visit(i, end + 1, &body[i + 1..end]);
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
}

/// 列出 body 使用的可识别占位符 (按首次出现顺序,去重)
pub fn placeholders_in(body: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    scan_braces(body, |_, _, name| {
        if let Some(p) = Placeholder::from_name(name) {
            if !found.contains(&p) {
                found.push(p);
            }
        }
    });
    found
}

/// 单遍替换全部可识别占位符
pub fn resolve(body: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    // 先确认全部可绑定,保证不产生部分替换的结果
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    let mut missing: Option<Placeholder> = None;
    scan_braces(body, |start, end, name| {
        if missing.is_some() {
            return;
        }
        if let Some(p) = Placeholder::from_name(name) {
            match ctx.value_of(p) {
                Some(value) => replacements.push((start, end, value)),
                None => missing = Some(p),
            }
        }
    });

    if let Some(p) = missing {
        return Err(TemplateError::UnresolvedPlaceholder {
            token: p.name().to_string(),
        });
    }

    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;
    for (start, end, value) in replacements {
        out.push_str(&body[cursor..start]);
        out.push_str(&value);
        cursor = end;
    }
    out.push_str(&body[cursor..]);
    Ok(out)
}
