//! 任务 SQLite 存储模块
//!
//! 任务记录的唯一落盘位置，进程崩溃后状态以此为准
//! - tasks: 每次下载尝试一条记录
//!
//! 每次 put/delete 都是一条已提交语句；resume/retry 的两行变更
//! （旧任务标记被取代 + 新任务插入）放在同一事务里，保证部分产物
//! 所有权转移与状态迁移原子完成

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::query::TaskFilter;
use crate::downloader::{DownloadStatus, DownloadTask};
use crate::error::{DownloadError, Result};

/// 任务数据库管理器
pub struct TaskDb {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, url, saved_dir, file_name, headers, status, progress, \
     bytes_downloaded, bytes_total, time_created, show_notification, \
     open_file_from_notification, requires_storage_not_low, save_in_public_storage, \
     resumable, superseded_by, error";

impl TaskDb {
    /// 打开（或创建）任务数据库
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DownloadError::Validation(format!("创建数据库目录失败: {}", e))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 打开内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                saved_dir TEXT NOT NULL,
                file_name TEXT NOT NULL,
                headers TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                -- 未知大小用 -1 表示
                bytes_total INTEGER NOT NULL DEFAULT -1,
                time_created INTEGER NOT NULL,
                show_notification INTEGER NOT NULL DEFAULT 0,
                open_file_from_notification INTEGER NOT NULL DEFAULT 0,
                requires_storage_not_low INTEGER NOT NULL DEFAULT 0,
                save_in_public_storage INTEGER NOT NULL DEFAULT 0,
                resumable INTEGER NOT NULL DEFAULT 0,
                superseded_by TEXT,
                error TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_time_created ON tasks(time_created)",
            [],
        )?;

        info!("任务数据库表初始化完成");
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // 持锁线程不会 panic（所有操作都是短查询），中毒锁直接恢复内层值
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 写入（upsert）任务记录，返回前已提交
    pub fn put(&self, task: &DownloadTask) -> Result<()> {
        let conn = self.lock_conn();
        let headers_json = serde_json::to_string(&task.headers).unwrap_or_else(|_| "{}".to_string());

        conn.execute(
            r#"
            INSERT OR REPLACE INTO tasks (
                id, url, saved_dir, file_name, headers, status, progress,
                bytes_downloaded, bytes_total, time_created, show_notification,
                open_file_from_notification, requires_storage_not_low, save_in_public_storage,
                resumable, superseded_by, error
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11,
                ?12, ?13, ?14,
                ?15, ?16, ?17
            )
            "#,
            params![
                task.id,
                task.url,
                task.saved_dir.to_string_lossy().to_string(),
                task.file_name,
                headers_json,
                task.status.as_str(),
                task.progress as i64,
                task.bytes_downloaded as i64,
                task.bytes_total.map(|t| t as i64).unwrap_or(-1),
                task.time_created,
                task.show_notification as i64,
                task.open_file_from_notification as i64,
                task.requires_storage_not_low as i64,
                task.save_in_public_storage as i64,
                task.resumable as i64,
                task.superseded_by,
                task.error,
            ],
        )?;

        debug!("任务已写入数据库: {} ({})", task.id, task.status.as_str());
        Ok(())
    }

    /// 点查
    pub fn get(&self, task_id: &str) -> Result<DownloadTask> {
        let conn = self.lock_conn();
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![task_id],
                Self::row_to_task,
            )
            .optional()?;

        task.ok_or_else(|| DownloadError::NotFound(task_id.to_string()))
    }

    /// 全表扫描，按创建时间排序
    pub fn list_all(&self) -> Result<Vec<DownloadTask>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY time_created ASC, id ASC",
            TASK_COLUMNS
        ))?;

        let rows = stmt.query_map([], Self::row_to_task)?;
        Self::collect_rows(rows)
    }

    /// 条件查询，过滤在数据库侧完成
    pub fn query(&self, filter: &TaskFilter) -> Result<Vec<DownloadTask>> {
        let (where_clause, bind_params) = filter.to_sql();
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks{} ORDER BY time_created ASC, id ASC",
            TASK_COLUMNS, where_clause
        ))?;

        let rows = stmt.query_map(params_from_iter(bind_params), Self::row_to_task)?;
        Self::collect_rows(rows)
    }

    /// 原生 SQL 查询，仅允许 SELECT；结果行必须能还原完整任务记录
    pub fn raw_query(&self, sql: &str) -> Result<Vec<DownloadTask>> {
        let trimmed = sql.trim_start();
        if !trimmed
            .get(..6)
            .map(|p| p.eq_ignore_ascii_case("select"))
            .unwrap_or(false)
        {
            return Err(DownloadError::Validation(
                "原生查询只允许 SELECT 语句".to_string(),
            ));
        }

        let conn = self.lock_conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], Self::row_to_task)?;

        // 调用方自带 SQL，列形状不全时不能静默吞行
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(|e| {
                DownloadError::Validation(format!("原生查询结果无法还原任务记录: {}", e))
            })?);
        }
        Ok(tasks)
    }

    /// 删除任务记录，返回前已提交
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        if deleted > 0 {
            info!("已从数据库删除任务: {}", task_id);
        }
        Ok(deleted > 0)
    }

    /// 原子取代：旧任务标记 superseded_by 并落到给定状态，新任务插入
    ///
    /// 两行变更在同一事务内提交，部分产物所有权转移不会出现中间态
    pub fn supersede_and_insert(
        &self,
        old_id: &str,
        old_status: DownloadStatus,
        new_task: &DownloadTask,
    ) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE tasks SET superseded_by = ?1, status = ?2 WHERE id = ?3",
            params![new_task.id, old_status.as_str(), old_id],
        )?;
        if updated == 0 {
            return Err(DownloadError::NotFound(old_id.to_string()));
        }

        let headers_json =
            serde_json::to_string(&new_task.headers).unwrap_or_else(|_| "{}".to_string());
        tx.execute(
            r#"
            INSERT INTO tasks (
                id, url, saved_dir, file_name, headers, status, progress,
                bytes_downloaded, bytes_total, time_created, show_notification,
                open_file_from_notification, requires_storage_not_low, save_in_public_storage,
                resumable, superseded_by, error
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11,
                ?12, ?13, ?14,
                ?15, ?16, ?17
            )
            "#,
            params![
                new_task.id,
                new_task.url,
                new_task.saved_dir.to_string_lossy().to_string(),
                new_task.file_name,
                headers_json,
                new_task.status.as_str(),
                new_task.progress as i64,
                new_task.bytes_downloaded as i64,
                new_task.bytes_total.map(|t| t as i64).unwrap_or(-1),
                new_task.time_created,
                new_task.show_notification as i64,
                new_task.open_file_from_notification as i64,
                new_task.requires_storage_not_low as i64,
                new_task.save_in_public_storage as i64,
                new_task.resumable as i64,
                new_task.superseded_by,
                new_task.error,
            ],
        )?;

        tx.commit()?;
        info!("任务 {} 已被 {} 取代", old_id, new_task.id);
        Ok(())
    }

    fn collect_rows(
        rows: impl Iterator<Item = rusqlite::Result<DownloadTask>>,
    ) -> Result<Vec<DownloadTask>> {
        let mut tasks = Vec::new();
        for row in rows {
            match row {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("读取任务行失败: {}", e),
            }
        }
        Ok(tasks)
    }

    /// 将数据库行转换为 DownloadTask
    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<DownloadTask> {
        let headers_json: String = row.get(4)?;
        let headers: HashMap<String, String> =
            serde_json::from_str(&headers_json).unwrap_or_default();
        let status_str: String = row.get(5)?;
        let status = DownloadStatus::from_str(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("未知任务状态: {}", status_str).into(),
            )
        })?;
        let bytes_total: i64 = row.get(8)?;
        let saved_dir: String = row.get(2)?;

        Ok(DownloadTask {
            id: row.get(0)?,
            url: row.get(1)?,
            saved_dir: saved_dir.into(),
            file_name: row.get(3)?,
            headers,
            status,
            progress: row.get::<_, i64>(6)? as i8,
            bytes_downloaded: row.get::<_, i64>(7)? as u64,
            bytes_total: if bytes_total < 0 {
                None
            } else {
                Some(bytes_total as u64)
            },
            time_created: row.get(9)?,
            show_notification: row.get::<_, i64>(10)? != 0,
            open_file_from_notification: row.get::<_, i64>(11)? != 0,
            requires_storage_not_low: row.get::<_, i64>(12)? != 0,
            save_in_public_storage: row.get::<_, i64>(13)? != 0,
            resumable: row.get::<_, i64>(14)? != 0,
            superseded_by: row.get(15)?,
            error: row.get(16)?,
        })
    }
}
