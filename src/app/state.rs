// ==========================================
// 毛绒玩具生产编排核心 - 应用状态
// ==========================================
// 职责: 管理应用级别的共享状态和API实例
// 约束: 所有仓储与引擎共享同一个连接句柄与同一个 KeyedLock
// ==========================================

use std::sync::Arc;

use crate::api::{ConfigApi, HandshakeApi, MasterdataApi, ProductionApi, WarehouseApi};
use crate::config::config_manager::ConfigManager;
use crate::config::policy::PolicyReader;
use crate::engine::{
    AlertPublisher, HandshakeProtocol, KeyedLock, OptionalAlertPublisher, ReservationLedger,
    ShortageResolver, TaskGenerator,
};
use crate::repository::{
    ActionLogRepository, AlertRepository, LedgerRepository, MasterdataRepository,
    ProductionRepository, RecipeRepository, ResolutionRepository, TransferRepository,
};

/// 数据库路径环境变量
pub const DB_PATH_ENV: &str = "SOFTTOY_PRODUCTION_DB_PATH";

/// 应用状态
///
/// 包含所有API实例和共享资源
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 主数据/配方API
    pub masterdata_api: Arc<MasterdataApi>,

    /// 生产API（分解、开工、报工、审批）
    pub production_api: Arc<ProductionApi>,

    /// 交接API
    pub handshake_api: Arc<HandshakeApi>,

    /// 仓储台账API
    pub warehouse_api: Arc<WarehouseApi>,

    /// 配置管理API
    pub config_api: Arc<ConfigApi>,

    /// 操作日志仓储（用于审计追踪）
    pub action_log_repo: Arc<ActionLogRepository>,

    /// 告警仓储
    pub alert_repo: Arc<AlertRepository>,
}

impl AppState {
    /// 创建新的AppState实例（不推送告警，只落库）
    ///
    /// # 参数
    /// - db_path: 数据库文件路径（不存在时自动建库）
    pub fn new(db_path: String) -> Result<Self, String> {
        Self::with_alerts(db_path, OptionalAlertPublisher::none())
    }

    /// 创建带告警推送的AppState实例
    pub fn with_publisher(db_path: String, publisher: Arc<dyn AlertPublisher>) -> Result<Self, String> {
        Self::with_alerts(db_path, OptionalAlertPublisher::with_publisher(publisher))
    }

    fn with_alerts(db_path: String, alerts: OptionalAlertPublisher) -> Result<Self, String> {
        tracing::info!(db_path = %db_path, "初始化AppState");

        let conn = crate::db::open_shared_connection(&db_path)
            .map_err(|e| format!("无法打开数据库: {}", e))?;

        // ==========================================
        // 初始化Repository层
        // ==========================================
        let action_log_repo = Arc::new(ActionLogRepository::new(conn.clone()));
        let alert_repo = Arc::new(AlertRepository::new(conn.clone()));
        let ledger_repo = Arc::new(LedgerRepository::new(conn.clone()));
        let masterdata_repo = Arc::new(MasterdataRepository::new(conn.clone()));
        let production_repo = Arc::new(ProductionRepository::new(conn.clone()));
        let recipe_repo = Arc::new(RecipeRepository::new(conn.clone()));
        let resolution_repo = Arc::new(ResolutionRepository::new(conn.clone()));
        let transfer_repo = Arc::new(TransferRepository::new(conn.clone()));

        // ==========================================
        // 初始化Engine层
        // ==========================================
        let config_manager = Arc::new(
            ConfigManager::from_connection(conn.clone())
                .map_err(|e| format!("无法创建ConfigManager: {}", e))?,
        );
        let policy: Arc<dyn PolicyReader> = config_manager.clone();
        let locks = Arc::new(KeyedLock::new());

        let ledger = Arc::new(ReservationLedger::new(conn.clone(), locks.clone(), alerts.clone()));
        let generator = Arc::new(TaskGenerator::new(
            conn.clone(),
            locks.clone(),
            alerts.clone(),
            policy.clone(),
        ));
        let resolver = Arc::new(ShortageResolver::new(conn.clone(), locks.clone(), alerts.clone()));
        let protocol = Arc::new(HandshakeProtocol::new(conn.clone(), locks, alerts, policy));

        // ==========================================
        // 初始化API层
        // ==========================================
        let masterdata_api = Arc::new(MasterdataApi::new(
            masterdata_repo,
            recipe_repo,
            action_log_repo.clone(),
        ));
        let production_api = Arc::new(ProductionApi::new(
            generator,
            resolver,
            production_repo,
            resolution_repo,
            action_log_repo.clone(),
        ));
        let handshake_api = Arc::new(HandshakeApi::new(
            protocol,
            transfer_repo,
            action_log_repo.clone(),
        ));
        let warehouse_api = Arc::new(WarehouseApi::new(
            ledger,
            ledger_repo,
            alert_repo.clone(),
            action_log_repo.clone(),
        ));
        let config_api = Arc::new(ConfigApi::new(conn, config_manager, action_log_repo.clone()));

        tracing::info!("AppState初始化完成");

        Ok(Self {
            db_path,
            masterdata_api,
            production_api,
            handshake_api,
            warehouse_api,
            config_api,
            action_log_repo,
            alert_repo,
        })
    }

    /// 获取数据库路径
    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }
}

// ==========================================
// 默认数据库路径辅助函数
// ==========================================

/// 获取默认数据库路径
///
/// # 返回
/// - 环境变量 SOFTTOY_PRODUCTION_DB_PATH（非空时优先）
/// - 开发环境: 用户数据目录/softtoy-production-dev/softtoy_production.db
/// - 生产环境: 用户数据目录/softtoy-production/softtoy_production.db
pub fn get_default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./softtoy_production.db");

    if let Some(data_dir) = dirs::data_dir() {
        #[cfg(debug_assertions)]
        {
            path = data_dir.join("softtoy-production-dev");
        }

        #[cfg(not(debug_assertions))]
        {
            path = data_dir.join("softtoy-production");
        }

        // 目录创建失败时退回当前目录
        if std::fs::create_dir_all(&path).is_ok() {
            path = path.join("softtoy_production.db");
        } else {
            path = PathBuf::from("./softtoy_production.db");
        }
    }

    path.to_string_lossy().to_string()
}
