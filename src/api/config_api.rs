// ==========================================
// 毛绒玩具生产编排核心 - 配置管理 API
// ==========================================
// 职责: 编排阈值查询、更新、快照管理
// 红线: 写入前校验键与取值，所有写操作记录 ActionLog
// ==========================================

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::record_action;
use crate::config::config_manager::{config_keys, ConfigManager};
use crate::config::policy::{OrchestrationPolicy, PolicyReader};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::repository::action_log_repo::ActionLogRepository;

/// 配置项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub scope_id: String,
    pub key: String,
    pub value: String,
}

// ==========================================
// ConfigApi - 配置管理 API
// ==========================================

/// 配置管理API
///
/// 职责：
/// 1. 配置查询（全部、单个、生效阈值快照）
/// 2. 配置更新（单个、批量，均校验）
/// 3. 配置快照导出与恢复
pub struct ConfigApi {
    conn: Arc<Mutex<Connection>>,
    config_manager: Arc<ConfigManager>,
    action_log_repo: Arc<ActionLogRepository>,
}

impl ConfigApi {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config_manager: Arc<ConfigManager>,
        action_log_repo: Arc<ActionLogRepository>,
    ) -> Self {
        Self {
            conn,
            config_manager,
            action_log_repo,
        }
    }

    fn now() -> chrono::NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    /// 查询所有配置
    pub fn list_configs(&self) -> ApiResult<Vec<ConfigItem>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;

        let mut stmt = conn
            .prepare("SELECT scope_id, key, value FROM config_kv ORDER BY scope_id, key")
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let configs = stmt
            .query_map([], |row| {
                Ok(ConfigItem {
                    scope_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            })
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        Ok(configs)
    }

    /// 查询单个配置（global 作用域）
    ///
    /// # 返回
    /// - Ok(None): 未覆写，使用默认值
    pub fn get_config(&self, key: &str) -> ApiResult<Option<ConfigItem>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;

        let result = conn.query_row(
            "SELECT scope_id, key, value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| {
                Ok(ConfigItem {
                    scope_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            },
        );

        match result {
            Ok(config) => Ok(Some(config)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ApiError::DatabaseError(e.to_string())),
        }
    }

    /// 当前生效的编排阈值（含默认值）
    pub fn get_policy(&self) -> ApiResult<OrchestrationPolicy> {
        self.config_manager
            .load_policy()
            .map_err(|e| ApiError::ConfigError(e.to_string()))
    }

    /// 更新配置
    ///
    /// # 参数
    /// - key: 配置键（buffer_factor/{DEPT}、variance_tolerance_pct/{DEPT}、stale_transfer_minutes）
    /// - value: 配置值
    /// - operator: 操作人
    /// - reason: 操作原因
    pub fn update_config(&self, key: &str, value: &str, operator: &str, reason: &str) -> ApiResult<()> {
        if reason.trim().is_empty() {
            return Err(ApiError::InvalidInput("操作原因不能为空".to_string()));
        }
        config_keys::validate_entry(key, value).map_err(ApiError::ValidationError)?;

        self.config_manager
            .set_global_config_value(key, value.trim())
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        info!(config_key = key, value, operator, "配置已更新");
        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::UpdateConfig, operator, Self::now())
                .with_ref("config_kv", key)
                .with_payload(serde_json::json!({
                    "key": key,
                    "value": value,
                    "reason": reason,
                }))
                .with_detail(format!("更新配置: {}={}", key, value)),
        );

        Ok(())
    }

    /// 批量更新配置（全部校验通过才写入）
    ///
    /// # 返回
    /// - Ok(usize): 更新的配置数量
    pub fn batch_update_configs(
        &self,
        configs: Vec<ConfigItem>,
        operator: &str,
        reason: &str,
    ) -> ApiResult<usize> {
        if configs.is_empty() {
            return Err(ApiError::InvalidInput("配置列表不能为空".to_string()));
        }
        if reason.trim().is_empty() {
            return Err(ApiError::InvalidInput("操作原因不能为空".to_string()));
        }
        for config in &configs {
            if config.scope_id != "global" {
                return Err(ApiError::InvalidInput(format!(
                    "仅支持 global 作用域: {}",
                    config.scope_id
                )));
            }
            config_keys::validate_entry(&config.key, &config.value)
                .map_err(ApiError::ValidationError)?;
        }

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| ApiError::DatabaseTransactionError(e.to_string()))?;

        let mut count = 0;
        for config in &configs {
            count += tx
                .execute(
                    "INSERT INTO config_kv (scope_id, key, value, updated_at) VALUES ('global', ?1, ?2, datetime('now'))
                     ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
                    params![config.key, config.value.trim()],
                )
                .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .map_err(|e| ApiError::DatabaseTransactionError(e.to_string()))?;
        drop(conn);

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::UpdateConfig, operator, Self::now())
                .with_payload(serde_json::json!({
                    "configs": configs,
                    "reason": reason,
                }))
                .with_detail(format!("批量更新{}个配置", count)),
        );

        Ok(count)
    }

    /// 导出配置快照（JSON）
    pub fn get_config_snapshot(&self) -> ApiResult<String> {
        self.config_manager
            .get_config_snapshot()
            .map_err(|e| ApiError::DatabaseError(e.to_string()))
    }

    /// 从快照恢复配置
    ///
    /// # 返回
    /// - Ok(usize): 恢复的配置项数量
    pub fn restore_from_snapshot(&self, snapshot_json: &str, operator: &str, reason: &str) -> ApiResult<usize> {
        if reason.trim().is_empty() {
            return Err(ApiError::InvalidInput("操作原因不能为空".to_string()));
        }
        let parsed: std::collections::HashMap<String, String> = serde_json::from_str(snapshot_json)
            .map_err(|e| ApiError::InvalidInput(format!("快照格式错误: {}", e)))?;
        for (key, value) in &parsed {
            config_keys::validate_entry(key, value).map_err(ApiError::ValidationError)?;
        }

        let count = self
            .config_manager
            .restore_config_from_snapshot(snapshot_json)
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::UpdateConfig, operator, Self::now())
                .with_payload(serde_json::json!({
                    "snapshot": parsed,
                    "reason": reason,
                }))
                .with_detail(format!("从快照恢复{}个配置", count)),
        );

        Ok(count)
    }
}
