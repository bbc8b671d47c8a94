//! 本地文件系统协作层
//!
//! 管理器通过这里完成目录校验、产物删除和交给系统查看器打开，
//! 不直接散落 std::fs 调用

use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{DownloadError, Result};

/// 校验保存目录：必须为已存在的绝对路径目录
pub fn validate_saved_dir(dir: &Path) -> Result<()> {
    if !dir.is_absolute() {
        return Err(DownloadError::Validation(format!(
            "保存目录必须是绝对路径: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(DownloadError::Validation(format!(
            "保存目录不存在: {}",
            dir.display()
        )));
    }
    Ok(())
}

/// 删除下载产物（最终文件与部分产物都尝试清理）
///
/// 文件不存在不算错误；删除失败仅告警，任务记录的删除不受影响
pub fn delete_artifact(target: &Path, partial: &Path) {
    for path in [target, partial] {
        if path.exists() {
            match std::fs::remove_file(path) {
                Ok(_) => info!("已删除产物: {}", path.display()),
                Err(e) => warn!("删除产物失败 {}: {}", path.display(), e),
            }
        }
    }
}

/// 交给平台查看器打开产物，返回是否成功移交
pub fn open_artifact(path: &Path) -> bool {
    if !path.exists() {
        warn!("产物不存在，无法打开: {}", path.display());
        return false;
    }

    #[cfg(target_os = "macos")]
    let result = Command::new("open").arg(path).spawn();
    #[cfg(target_os = "windows")]
    let result = Command::new("cmd").args(["/C", "start", ""]).arg(path).spawn();
    #[cfg(all(unix, not(target_os = "macos")))]
    let result = Command::new("xdg-open").arg(path).spawn();

    match result {
        Ok(_) => {
            debug!("已移交系统查看器: {}", path.display());
            true
        }
        Err(e) => {
            warn!("打开产物失败 {}: {}", path.display(), e);
            false
        }
    }
}
