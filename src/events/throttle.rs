//! 进度事件节流器
//!
//! 按百分比步长控制进度事件的投递频率，避免事件风暴。
//! 终态事件不受节流约束，必须投递

use dashmap::DashMap;

/// 步长节流器
///
/// 把 0-100 按 `step` 划分为阈值档位，进度跨入新档位才放行；
/// 同一档位内的进度更新被吞掉。step = 0 表示全部放行。
/// 每个任务独立记录基准，初始基准为 0
#[derive(Debug)]
pub struct StepThrottler {
    /// 步长（0-100）
    step: u8,
    /// task_id -> 最近一次投递的百分比
    last_delivered: DashMap<String, i8>,
}

impl StepThrottler {
    pub fn new(step: u8) -> Self {
        Self {
            step,
            last_delivered: DashMap::new(),
        }
    }

    /// 非终态进度是否应投递；放行时同步更新基准
    pub fn should_deliver(&self, task_id: &str, percent: i8) -> bool {
        if self.step == 0 {
            self.last_delivered.insert(task_id.to_string(), percent);
            return true;
        }

        let last = self
            .last_delivered
            .get(task_id)
            .map(|v| *v)
            .unwrap_or(0);

        let step = self.step as i16;
        if (percent as i16) / step != (last as i16) / step {
            self.last_delivered.insert(task_id.to_string(), percent);
            true
        } else {
            false
        }
    }

    /// 终态投递后清理该任务的节流状态
    pub fn clear(&self, task_id: &str) {
        self.last_delivered.remove(task_id);
    }

    pub fn step(&self) -> u8 {
        self.step
    }
}
