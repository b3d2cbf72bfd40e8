// ==========================================
// 毛绒玩具生产编排核心 - 领域类型定义
// ==========================================
// 职责: 枚举类型、状态机取值、数据库字符串映射
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 工序部门 (Department)
// ==========================================
// 顺序: 裁剪 < 绣花 < 缝制 < 整理 < 包装
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Department {
    Cutting,    // 裁剪
    Embroidery, // 绣花
    Sewing,     // 缝制
    Finishing,  // 整理(充棉/修剪)
    Packing,    // 包装
}

impl Department {
    /// 全部部门（按工序顺序）
    pub const ALL: [Department; 5] = [
        Department::Cutting,
        Department::Embroidery,
        Department::Sewing,
        Department::Finishing,
        Department::Packing,
    ];

    pub fn to_db_str(&self) -> &'static str {
        match self {
            Department::Cutting => "CUTTING",
            Department::Embroidery => "EMBROIDERY",
            Department::Sewing => "SEWING",
            Department::Finishing => "FINISHING",
            Department::Packing => "PACKING",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CUTTING" => Some(Department::Cutting),
            "EMBROIDERY" => Some(Department::Embroidery),
            "SEWING" => Some(Department::Sewing),
            "FINISHING" => Some(Department::Finishing),
            "PACKING" => Some(Department::Packing),
            _ => None,
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

/// 为状态枚举生成 to_db_str / from_db_str / Display
///
/// 所有状态字段在数据库中以大写字符串存储
macro_rules! db_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// 转换为数据库存储的字符串
            pub fn to_db_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// 从数据库字符串解析（未知取值返回 None）
            pub fn from_db_str(s: &str) -> Option<Self> {
                match s.trim().to_uppercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.to_db_str())
            }
        }
    };
}

// ==========================================
// 配方版本状态 (Recipe Version Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipeStatus {
    Active,   // 生效
    Archived, // 归档
}

db_enum!(RecipeStatus {
    Active => "ACTIVE",
    Archived => "ARCHIVED",
});

// ==========================================
// 物料欠账状态 (Debt Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebtStatus {
    Active,           // 未偿还
    PartiallySettled, // 部分偿还
    Settled,          // 已偿清
    WrittenOff,       // 已核销
}

db_enum!(DebtStatus {
    Active => "ACTIVE",
    PartiallySettled => "PARTIALLY_SETTLED",
    Settled => "SETTLED",
    WrittenOff => "WRITTEN_OFF",
});

impl DebtStatus {
    /// 是否仍有未偿余额
    pub fn is_open(&self) -> bool {
        matches!(self, DebtStatus::Active | DebtStatus::PartiallySettled)
    }
}

// ==========================================
// 工单预留状态 (Reservation Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,   // 预留中
    Consumed, // 已全部消耗
    Released, // 剩余已释放
}

db_enum!(ReservationStatus {
    Active => "ACTIVE",
    Consumed => "CONSUMED",
    Released => "RELEASED",
});

// ==========================================
// 生产批次状态 (Run State)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Draft,      // 已分解未开工
    InProgress, // 生产中
    Done,       // 已完成
    Cancelled,  // 已取消
}

db_enum!(RunState {
    Draft => "DRAFT",
    InProgress => "IN_PROGRESS",
    Done => "DONE",
    Cancelled => "CANCELLED",
});

impl RunState {
    /// 终态批次不再接受任何工单操作
    pub fn is_closed(&self) -> bool {
        matches!(self, RunState::Done | RunState::Cancelled)
    }
}

// ==========================================
// 工单状态 (Task State)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,  // 等待上道工序交付
    Ready,    // 可开工
    Running,  // 生产中
    Finished, // 已完工
    Blocked,  // 阻断（需人工介入）
}

db_enum!(TaskState {
    Pending => "PENDING",
    Ready => "READY",
    Running => "RUNNING",
    Finished => "FINISHED",
    Blocked => "BLOCKED",
});

// ==========================================
// 交接单状态 (Transfer State)
// ==========================================
// 状态机: INITIATED → LOCKED → ACCEPTED → COMPLETED
// 旁路:   INITIATED → BLOCKED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Initiated,
    Locked,
    Accepted,
    Completed,
    Blocked,
}

db_enum!(TransferState {
    Initiated => "INITIATED",
    Locked => "LOCKED",
    Accepted => "ACCEPTED",
    Completed => "COMPLETED",
    Blocked => "BLOCKED",
});

impl TransferState {
    /// 是否占用发送方产出（锁定中/已接收/已完成）
    pub fn holds_output(&self) -> bool {
        matches!(
            self,
            TransferState::Locked | TransferState::Accepted | TransferState::Completed
        )
    }

    /// 是否仍占用目标产线
    pub fn occupies_line(&self) -> bool {
        matches!(self, TransferState::Locked | TransferState::Accepted)
    }
}

// ==========================================
// 产线占用状态 (Line State)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineState {
    Clear,    // 空闲
    Occupied, // 被某批次占用
    Paused,   // 主管暂停
}

db_enum!(LineState {
    Clear => "CLEAR",
    Occupied => "OCCUPIED",
    Paused => "PAUSED",
});

// ==========================================
// 短缺审批 (Approval)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled, // 批次取消时作废
}

db_enum!(ApprovalStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Cancelled => "CANCELLED",
});

/// 审批结论（二选一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

// ==========================================
// 告警 (Alert)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    DebtCreated,              // 预留/消耗产生物料欠账
    ReservationFailed,        // 首道工序预留失败（主数据缺失）
    LineClearanceRequired,    // 目标产线被其他批次占用
    LineCleared,              // 产线释放，存在等待中的交接
    QuantityMismatch,         // 交接数量差异超限
    ShortageApprovalRequired, // 产出短缺待审批
    ShortageRejected,         // 短缺审批驳回，工单阻断
    SurplusAbsorbed,          // 超产已并入下道工序目标
    StaleTransfer,            // 交接长时间停留在 LOCKED
}

db_enum!(AlertType {
    DebtCreated => "DEBT_CREATED",
    ReservationFailed => "RESERVATION_FAILED",
    LineClearanceRequired => "LINE_CLEARANCE_REQUIRED",
    LineCleared => "LINE_CLEARED",
    QuantityMismatch => "QUANTITY_MISMATCH",
    ShortageApprovalRequired => "SHORTAGE_APPROVAL_REQUIRED",
    ShortageRejected => "SHORTAGE_REJECTED",
    SurplusAbsorbed => "SURPLUS_ABSORBED",
    StaleTransfer => "STALE_TRANSFER",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

db_enum!(AlertSeverity {
    Info => "INFO",
    Warning => "WARNING",
    Critical => "CRITICAL",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_department_order() {
        assert!(Department::Cutting < Department::Embroidery);
        assert!(Department::Sewing < Department::Packing);
        let mut sorted = Department::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Department::ALL.to_vec());
    }

    #[test]
    fn test_db_str_roundtrip_and_unknown() {
        assert_eq!(
            TransferState::from_db_str("locked"),
            Some(TransferState::Locked)
        );
        assert_eq!(DebtStatus::PartiallySettled.to_string(), "PARTIALLY_SETTLED");
        assert_eq!(Department::from_db_str("QUILTING"), None);
        assert_eq!(RunState::from_db_str("bogus"), None);
    }

    #[test]
    fn test_state_predicates() {
        assert!(TransferState::Accepted.occupies_line());
        assert!(!TransferState::Completed.occupies_line());
        assert!(TransferState::Completed.holds_output());
        assert!(!TransferState::Blocked.holds_output());
        assert!(DebtStatus::PartiallySettled.is_open());
        assert!(!DebtStatus::WrittenOff.is_open());
        assert!(RunState::Cancelled.is_closed());
    }
}
