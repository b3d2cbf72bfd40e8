// ==========================================
// 毛绒玩具生产编排核心 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::policy::{OrchestrationPolicy, PolicyReader};
use crate::db::open_sqlite_connection;
use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::types::Department;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, Box<dyn Error>> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at) VALUES ('global', ?1, ?2, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取所有配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 仿真/排障时记录当时生效的阈值
    pub fn get_config_snapshot(&self) -> Result<String, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        let json_value = json!(config_map);
        Ok(serde_json::to_string(&json_value)?)
    }

    /// 从配置快照恢复配置
    ///
    /// # 返回
    /// - Ok(usize): 恢复的配置项数量
    ///
    /// # 注意
    /// - 此方法会覆盖现有的global配置
    pub fn restore_config_from_snapshot(&self, snapshot_json: &str) -> Result<usize, Box<dyn Error>> {
        let config_map: HashMap<String, String> = serde_json::from_str(snapshot_json)?;

        let mut conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        let tx = conn.transaction()?;

        let mut count = 0;
        for (key, value) in config_map.iter() {
            count += tx.execute(
                "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
                 ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
        }

        tx.commit()?;
        Ok(count)
    }

    // ===== 编排阈值 =====

    /// 部门缓冲系数（缺失或格式错误时使用默认值）
    pub fn get_buffer_factor(&self, department: Department) -> Result<Option<BufferFactor>, Box<dyn Error>> {
        let key = config_keys::buffer_factor(department);
        let Some(raw) = self.get_config_value(&key)? else {
            return Ok(None);
        };
        match raw.parse::<BufferFactor>() {
            Ok(f) => Ok(Some(f)),
            Err(e) => {
                tracing::warn!(config_key = %key, raw_value = %raw, error = %e, "缓冲系数配置格式错误，使用默认值");
                Ok(None)
            }
        }
    }

    /// 接收部门差异容差百分比
    pub fn get_variance_tolerance_pct(&self, department: Department) -> Result<Option<Qty>, Box<dyn Error>> {
        let key = config_keys::variance_tolerance_pct(department);
        let Some(raw) = self.get_config_value(&key)? else {
            return Ok(None);
        };
        match raw.parse::<Qty>() {
            Ok(q) if !q.is_negative() => Ok(Some(q)),
            _ => {
                tracing::warn!(config_key = %key, raw_value = %raw, "差异容差配置格式错误，使用默认值");
                Ok(None)
            }
        }
    }

    pub fn get_stale_transfer_minutes(&self) -> Result<Option<i64>, Box<dyn Error>> {
        let Some(raw) = self.get_config_value(config_keys::STALE_TRANSFER_MINUTES)? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(v) if v > 0 => Ok(Some(v)),
            _ => {
                tracing::warn!(
                    config_key = config_keys::STALE_TRANSFER_MINUTES,
                    raw_value = %raw,
                    "交接超时配置格式错误，使用默认值"
                );
                Ok(None)
            }
        }
    }
}

// ==========================================
// PolicyReader Trait 实现
// ==========================================
impl PolicyReader for ConfigManager {
    fn load_policy(&self) -> Result<OrchestrationPolicy, Box<dyn Error>> {
        let mut policy = OrchestrationPolicy::default();
        for dept in Department::ALL {
            if let Some(f) = self.get_buffer_factor(dept)? {
                policy.buffer_factors.insert(dept, f);
            }
            if let Some(t) = self.get_variance_tolerance_pct(dept)? {
                policy.variance_tolerance_pct.insert(dept, t);
            }
        }
        if let Some(m) = self.get_stale_transfer_minutes()? {
            policy.stale_transfer_minutes = m;
        }
        Ok(policy)
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    use crate::domain::quantity::{BufferFactor, Qty};
    use crate::domain::types::Department;

    pub const BUFFER_FACTOR_PREFIX: &str = "buffer_factor/";
    pub const VARIANCE_TOLERANCE_PREFIX: &str = "variance_tolerance_pct/";
    pub const STALE_TRANSFER_MINUTES: &str = "stale_transfer_minutes";

    pub fn buffer_factor(department: Department) -> String {
        format!("{}{}", BUFFER_FACTOR_PREFIX, department.to_db_str())
    }

    pub fn variance_tolerance_pct(department: Department) -> String {
        format!("{}{}", VARIANCE_TOLERANCE_PREFIX, department.to_db_str())
    }

    /// 校验配置键与取值
    ///
    /// # 返回
    /// - Err(String): 未知键或取值非法的原因
    pub fn validate_entry(key: &str, value: &str) -> Result<(), String> {
        let department_of = |suffix: &str| {
            Department::from_db_str(suffix)
                .filter(|d| d.to_db_str() == suffix)
                .ok_or_else(|| format!("未知部门: {}", suffix))
        };

        if let Some(suffix) = key.strip_prefix(BUFFER_FACTOR_PREFIX) {
            department_of(suffix)?;
            value
                .parse::<BufferFactor>()
                .map_err(|e| format!("缓冲系数非法: {}", e))?;
            return Ok(());
        }
        if let Some(suffix) = key.strip_prefix(VARIANCE_TOLERANCE_PREFIX) {
            department_of(suffix)?;
            let pct = value
                .parse::<Qty>()
                .map_err(|e| format!("差异容差非法: {}", e))?;
            if pct.is_negative() || pct > Qty::from_units(100) {
                return Err(format!("差异容差必须在0-100之间: {}", value));
            }
            return Ok(());
        }
        if key == STALE_TRANSFER_MINUTES {
            return match value.trim().parse::<i64>() {
                Ok(v) if v > 0 => Ok(()),
                _ => Err(format!("交接超时分钟数必须为正整数: {}", value)),
            };
        }
        Err(format!("未知配置键: {}", key))
    }
}
