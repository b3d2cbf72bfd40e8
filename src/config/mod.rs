// ==========================================
// 毛绒玩具生产编排核心 - 配置层
// ==========================================
// 职责: 编排阈值（缓冲系数/差异容差/超时）的读取与覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod policy;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use policy::{OrchestrationPolicy, PolicyReader, StaticPolicyReader};
