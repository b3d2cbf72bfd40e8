// ==========================================
// 毛绒玩具生产编排核心 - 核心库
// ==========================================
// 职责: 配方分解 → 物料预留台账 → 部门工单 → 工序交接
// 技术栈: Rust + SQLite (rusqlite) + tracing
// 系统定位: 车间编排核心（人工审批短缺与阻断）
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 配置层 - 编排阈值
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/建库）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 依赖装配
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    AlertSeverity, AlertType, ApprovalDecision, ApprovalStatus, DebtStatus, Department, LineState,
    RunState, TaskState, TransferState,
};

// 领域实体
pub use domain::{
    ActionLog, ActionType, Alert, ApprovalRequest, LineStatus, MaterialDebt, ProductionRun, Qty,
    RecipeGraph, RecipeStage, StockPosition, Task, TransferRecord, WasteReport,
};

// 引擎
pub use engine::{
    HandshakeProtocol, KeyedLock, OutputResolution, ReservationLedger, RunOptions,
    ShortageResolver, TaskGenerator,
};

// API
pub use api::{ApiError, ApiResult, ConfigApi, HandshakeApi, MasterdataApi, ProductionApi, WarehouseApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "毛绒玩具生产编排核心";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert!(!APP_NAME.is_empty());
    }
}
