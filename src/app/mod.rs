// ==========================================
// 毛绒玩具生产编排核心 - 应用层
// ==========================================
// 职责: 按数据库路径装配仓储、引擎与 API（依赖注入，无全局状态）
// ==========================================

pub mod state;

// 重导出
pub use state::{get_default_db_path, AppState};
