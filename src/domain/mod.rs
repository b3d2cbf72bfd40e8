// ==========================================
// 毛绒玩具生产编排核心 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、定点数量
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod action_log;
pub mod alert;
pub mod handshake;
pub mod ledger;
pub mod production;
pub mod quantity;
pub mod recipe;
pub mod resolution;
pub mod types;

// 重导出核心类型
pub use action_log::{ActionLog, ActionType};
pub use alert::Alert;
pub use handshake::{LineOccupancy, LineStatus, TransferRecord};
pub use ledger::{MaterialDebt, Reservation, StockPosition};
pub use production::{ProductionRun, Task};
pub use quantity::{BufferFactor, Qty, QtyParseError};
pub use recipe::{
    Article, Location, Material, MaterialRequirement, RecipeGraph, RecipeGraphError, RecipeStage,
    RecipeVersion,
};
pub use resolution::{ApprovalRequest, WasteReport};
pub use types::{
    AlertSeverity, AlertType, ApprovalDecision, ApprovalStatus, DebtStatus, Department, LineState,
    RecipeStatus, ReservationStatus, RunState, TaskState, TransferState,
};
