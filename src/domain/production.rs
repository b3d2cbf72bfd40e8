// ==========================================
// 毛绒玩具生产编排核心 - 生产批次/工单领域模型
// ==========================================
// 红线: 工单只有在上道工单 FINISHED 且交接已接收后才能 RUNNING
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::types::{Department, RunState, TaskState};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// ProductionRun - 生产批次（一次分解请求）
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionRun {
    pub run_id: String,
    pub article_id: String,
    pub recipe_version_id: String, // 创建时绑定的配方版本
    pub batch_id: String,          // 产线占用使用的批次号
    pub requested_qty: Qty,
    pub state: RunState,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

// ==========================================
// Task - 部门工单
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub run_id: String,
    pub stage_id: String,
    pub department: Department,
    pub seq_no: i32,
    pub predecessor_task_id: Option<String>,
    pub target_qty: Qty,        // 缓冲后目标件数
    pub input_qty: Qty,         // 已接收的上道在制品
    pub actual_output_qty: Qty, // 累计合格产出
    pub reject_qty: Qty,        // 累计不良
    pub state: TaskState,
    pub block_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

impl Task {
    pub fn is_entry(&self) -> bool {
        self.predecessor_task_id.is_none()
    }

    /// 相对目标的差额（正数=超产，负数=短缺）
    pub fn output_delta(&self) -> Qty {
        self.actual_output_qty - self.target_qty
    }
}
