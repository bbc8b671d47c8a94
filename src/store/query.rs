//! 任务查询过滤器
//!
//! 把结构化过滤条件编译为 SQL WHERE 子句，由数据库完成选择，
//! 避免调用方把整张表拉到内存里再过滤

use crate::downloader::DownloadStatus;
use rusqlite::types::Value;

/// 结构化查询条件，各字段之间为 AND 关系
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// 状态集合（空表示不过滤）
    pub statuses: Vec<DownloadStatus>,
    /// 创建时间下界（含）
    pub created_after: Option<i64>,
    /// 创建时间上界（含）
    pub created_before: Option<i64>,
    /// URL 子串匹配
    pub url_contains: Option<String>,
}

impl TaskFilter {
    pub fn with_status(status: DownloadStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    /// 编译为 (WHERE 子句, 绑定参数)；无条件时子句为空串
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if !self.statuses.is_empty() {
            let placeholders = vec!["?"; self.statuses.len()].join(", ");
            clauses.push(format!("status IN ({})", placeholders));
            for s in &self.statuses {
                params.push(Value::Text(s.as_str().to_string()));
            }
        }
        if let Some(after) = self.created_after {
            clauses.push("time_created >= ?".to_string());
            params.push(Value::Integer(after));
        }
        if let Some(before) = self.created_before {
            clauses.push("time_created <= ?".to_string());
            params.push(Value::Integer(before));
        }
        if let Some(ref needle) = self.url_contains {
            clauses.push("url LIKE ?".to_string());
            params.push(Value::Text(format!("%{}%", needle)));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params)
        }
    }
}
