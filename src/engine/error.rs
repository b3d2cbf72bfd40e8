// ==========================================
// 毛绒玩具生产编排核心 - 引擎层错误类型
// ==========================================
// 说明: 可恢复的业务结果（欠账/短缺/产线占用/数量差异）以返回值表达，
//       这里只放调用方必须处理的错误
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::recipe::RecipeGraphError;
use crate::domain::types::Department;
use crate::repository::error::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // ===== 配置/主数据错误（不自动重试） =====
    #[error("未知库存头寸: material={material_id}, location={location_id}")]
    UnknownStockPosition {
        material_id: String,
        location_id: String,
    },

    #[error("成品没有生效配方: article={article_id}")]
    RecipeNotFound { article_id: String },

    #[error("配方结构非法: {0}")]
    InvalidRecipe(#[from] RecipeGraphError),

    #[error("配置读取失败: {0}")]
    Config(String),

    // ===== 输入/状态错误 =====
    #[error("输入参数非法: {0}")]
    InvalidInput(String),

    #[error("非法状态转换: {entity} id={id} 当前状态={state}, 操作={operation}")]
    InvalidState {
        entity: String,
        id: String,
        state: String,
        operation: String,
    },

    #[error("上道工单未完工: task={task_id}, predecessor={predecessor_id}")]
    PredecessorNotFinished {
        task_id: String,
        predecessor_id: String,
    },

    #[error("上道在制品尚未交接到位: task={task_id}")]
    InputNotDelivered { task_id: String },

    #[error("工单存在待审批的短缺申请: task={task_id}")]
    ApprovalPending { task_id: String },

    #[error("生产批次已关闭: run={run_id}, state={state}")]
    RunClosed { run_id: String, state: String },

    #[error("交接目标部门错误: 期望={expected}, 实际={actual}")]
    WrongDestination {
        expected: Department,
        actual: Department,
    },

    #[error("交接数量超出可交接产出: task={task_id}, requested={requested}, available={available}")]
    TransferQtyExceeded {
        task_id: String,
        requested: Qty,
        available: Qty,
    },

    // ===== 仓储错误 =====
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    pub fn invalid_state(
        entity: &str,
        id: &str,
        state: impl std::fmt::Display,
        operation: &str,
    ) -> Self {
        EngineError::InvalidState {
            entity: entity.to_string(),
            id: id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
