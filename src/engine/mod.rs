// ==========================================
// 毛绒玩具生产编排核心 - 引擎层
// ==========================================
// 职责: 实现业务规则引擎,不拼 SQL
// 红线:
// - Engine 不拼 SQL，数据访问全部经由仓储 `*_in` 函数
// - 加锁顺序: 先 KeyedLock（lock_many 一次取齐），再数据库连接
// - 告警随业务事务落库，提交后再推送
// ==========================================

pub mod alerts;
pub mod error;
pub mod handshake;
pub mod keyed_lock;
pub mod ledger;
pub mod resolver;
pub mod task_generator;

#[cfg(test)]
pub(crate) mod fixtures;

// 重导出核心引擎
pub use alerts::{
    AlertOutbox, AlertPublisher, CollectingAlertPublisher, NoOpAlertPublisher,
    OptionalAlertPublisher,
};
pub use error::{EngineError, EngineResult};
pub use handshake::{AcceptOutcome, CompleteOutcome, HandshakeProtocol, InitiateOutcome};
pub use keyed_lock::{line_key, material_key, task_key, KeyedGuard, KeyedLock};
pub use ledger::{
    ConsumeOutcome, DebtSettlement, ReceiveOutcome, ReleaseOutcome, ReservationLedger,
    ReserveOutcome,
};
pub use resolver::{ApprovalOutcome, OutputOutcome, OutputResolution, ShortageResolver};
pub use task_generator::{
    plan_targets, CancelOutcome, GenerationOutcome, RunOptions, TaskGenerator, UnblockOutcome,
};
