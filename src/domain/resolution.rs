// ==========================================
// 毛绒玩具生产编排核心 - 短缺处理领域模型
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::types::ApprovalStatus;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// 损耗报告（产出短缺时生成）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasteReport {
    pub report_id: String,
    pub task_id: String,
    pub shortfall_qty: Qty,
    pub reject_qty: Qty,
    pub reason: String,
    pub created_at: NaiveDateTime,
}

/// 短缺审批请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub task_id: String,
    pub waste_report_id: String,
    pub shortfall_qty: Qty,
    pub status: ApprovalStatus,
    pub requested_at: NaiveDateTime,
    pub decided_at: Option<NaiveDateTime>,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
    pub revision: i32,
}
