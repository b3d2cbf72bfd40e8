// ==========================================
// 毛绒玩具生产编排核心 - 操作日志仓储
// ==========================================
// 红线: 所有写操作必须记录
// ==========================================

mod core;
mod queries;

#[cfg(test)]
mod tests;

pub use core::ActionLogRepository;
