// ==========================================
// 毛绒玩具生产编排核心 - 物料台账领域模型
// ==========================================
// 职责: 库存头寸 / 物料欠账 / 工单预留
// 不变量: Σreserved ≤ Σon_hand + 未偿欠账（按物料汇总）
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::types::{DebtStatus, ReservationStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// StockPosition - 库存头寸 (物料 × 库位)
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPosition {
    pub material_id: String,
    pub location_id: String,
    pub on_hand: Qty,  // 账面库存（欠账消耗后可为负）
    pub reserved: Qty, // 已预留
    pub consumed: Qty, // 累计消耗（审计用）
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

impl StockPosition {
    /// 新头寸（零库存）
    pub fn empty(material_id: &str, location_id: &str, now: NaiveDateTime) -> Self {
        Self {
            material_id: material_id.to_string(),
            location_id: location_id.to_string(),
            on_hand: Qty::ZERO,
            reserved: Qty::ZERO,
            consumed: Qty::ZERO,
            updated_at: now,
            revision: 0,
        }
    }

    /// 可用库存 = max(on_hand − reserved, 0)
    pub fn available(&self) -> Qty {
        (self.on_hand - self.reserved).non_negative()
    }

    /// 超出账面库存的预留量（由欠账覆盖的部分）
    pub fn over_reserved(&self) -> Qty {
        (self.reserved - self.on_hand.non_negative()).non_negative()
    }
}

// ==========================================
// MaterialDebt - 物料欠账
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDebt {
    pub debt_id: String,
    pub material_id: String,
    pub location_id: String,
    pub source_ref: Option<String>, // 产生欠账的工单/操作
    pub total_qty: Qty,
    pub settled_qty: Qty,
    pub status: DebtStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

impl MaterialDebt {
    /// 未偿余额（已核销为 0）
    pub fn outstanding(&self) -> Qty {
        if self.status == DebtStatus::WrittenOff {
            return Qty::ZERO;
        }
        (self.total_qty - self.settled_qty).non_negative()
    }

    /// 偿还欠账，返回实际偿还量
    ///
    /// settled_qty 不会超过 total_qty
    pub fn settle(&mut self, offered: Qty, now: NaiveDateTime) -> Qty {
        if !self.status.is_open() || !offered.is_positive() {
            return Qty::ZERO;
        }
        let applied = offered.min(self.outstanding());
        self.settled_qty += applied;
        self.status = if self.settled_qty >= self.total_qty {
            DebtStatus::Settled
        } else if self.settled_qty.is_positive() {
            DebtStatus::PartiallySettled
        } else {
            DebtStatus::Active
        };
        self.updated_at = now;
        applied
    }
}

// ==========================================
// Reservation - 工单预留
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub task_id: String,
    pub material_id: String,
    pub location_id: String,
    pub reserved_qty: Qty,
    pub consumed_qty: Qty,
    pub released_qty: Qty,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub revision: i32,
}

impl Reservation {
    /// 尚未消耗/释放的预留余量
    pub fn remaining(&self) -> Qty {
        (self.reserved_qty - self.consumed_qty - self.released_qty).non_negative()
    }
}
