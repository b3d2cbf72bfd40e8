// ==========================================
// 毛绒玩具生产编排核心 - 工序交接领域模型
// ==========================================
// 状态机: INITIATED → LOCKED → ACCEPTED → COMPLETED
//         INITIATED → BLOCKED（产线被其他批次占用/暂停）
// 红线: 一条产线同一时刻只允许一个批次占用
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::types::{Department, LineState, TransferState};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// TransferRecord - 交接单（每次交接尝试一条）
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub from_task_id: String,
    pub to_task_id: String,
    pub from_department: Department,
    pub to_department: Department,
    pub batch_id: String,
    pub sent_qty: Qty,
    pub received_qty: Option<Qty>, // 接收确认前为 None
    pub state: TransferState,
    pub block_reason: Option<String>,
    pub last_rejected_qty: Option<Qty>, // 最近一次被拒的接收数量
    pub mismatch_count: i32,
    pub retry_of: Option<String>, // 由哪条 BLOCKED 交接重试而来

    // ===== 状态时间戳 =====
    pub initiated_at: NaiveDateTime,
    pub locked_at: Option<NaiveDateTime>,
    pub accepted_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub blocked_at: Option<NaiveDateTime>,
    pub stale_alerted_at: Option<NaiveDateTime>,

    pub revision: i32,
}

// ==========================================
// LineOccupancy - 产线占用
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineOccupancy {
    pub department: Department,
    pub state: LineState,
    pub batch_id: Option<String>,
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

impl LineOccupancy {
    pub fn clear(department: Department, now: NaiveDateTime) -> Self {
        Self {
            department,
            state: LineState::Clear,
            batch_id: None,
            updated_at: now,
            revision: 0,
        }
    }

    /// 该批次能否进入产线
    pub fn admits(&self, batch_id: &str) -> bool {
        match self.state {
            LineState::Clear => true,
            LineState::Occupied => self.batch_id.as_deref() == Some(batch_id),
            LineState::Paused => false,
        }
    }
}

/// 产线状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStatus {
    pub department: Department,
    pub state: LineState,
    pub batch_id: Option<String>,
}

impl From<&LineOccupancy> for LineStatus {
    fn from(line: &LineOccupancy) -> Self {
        Self {
            department: line.department,
            state: line.state,
            batch_id: line.batch_id.clone(),
        }
    }
}
