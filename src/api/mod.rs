// ==========================================
// 毛绒玩具生产编排核心 - API 层
// ==========================================
// 职责: 面向车间终端/调度服务的业务 API，校验输入并记录操作日志
// 红线: API 不直接改业务表，写操作全部委托引擎
// ==========================================

pub mod config_api;
pub mod error;
pub mod handshake_api;
pub mod masterdata_api;
pub mod production_api;
pub mod warehouse_api;

// 重导出核心类型
pub use config_api::{ConfigApi, ConfigItem};
pub use error::{ApiError, ApiResult};
pub use handshake_api::HandshakeApi;
pub use masterdata_api::{MasterdataApi, StageInput};
pub use production_api::{ProductionApi, RunDetail};
pub use warehouse_api::WarehouseApi;

use crate::domain::action_log::ActionLog;
use crate::repository::action_log_repo::ActionLogRepository;
use tracing::warn;

/// 记录操作日志（失败只告警，不影响已提交的业务结果）
pub(crate) fn record_action(repo: &ActionLogRepository, log: ActionLog) {
    if let Err(e) = repo.insert(&log) {
        warn!(action_type = %log.action_type, error = %e, "记录操作日志失败");
    }
}

/// 校验必填文本参数
pub(crate) fn require_text(value: &str, what: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidInput(format!("{}不能为空", what)));
    }
    Ok(())
}
