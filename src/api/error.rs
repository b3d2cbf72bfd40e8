// ==========================================
// 毛绒玩具生产编排核心 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型，把仓储/引擎错误转换为面向调用方的错误消息
// 红线: 所有错误信息必须包含显式原因
// ==========================================

use crate::engine::error::EngineError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 配置/主数据错误（不自动重试）
    // ==========================================
    #[error("未知库存头寸: material={material_id}, location={location_id}")]
    UnknownStockPosition {
        material_id: String,
        location_id: String,
    },

    #[error("配置错误: {0}")]
    ConfigError(String),

    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    #[error("无效的状态转换: state={from}, operation={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    // ==========================================
    // 并发控制错误
    // ==========================================
    #[error("乐观锁冲突: {0}")]
    OptimisticLockFailure(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::OptimisticLockFailure {
                entity,
                id,
                expected,
                actual,
            } => ApiError::OptimisticLockFailure(format!(
                "{}({})已被其他操作修改（期望revision={}，实际revision={}）",
                entity, id, expected, actual
            )),
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseTransactionError(msg) => ApiError::DatabaseTransactionError(msg),
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("外键约束违反: {}", msg))
            }
            RepositoryError::FieldValueError { field, message } => {
                ApiError::InvalidInput(format!("字段{}错误: {}", field, message))
            }
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 EngineError 转换
// ==========================================
impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownStockPosition {
                material_id,
                location_id,
            } => ApiError::UnknownStockPosition {
                material_id,
                location_id,
            },
            EngineError::RecipeNotFound { article_id } => {
                ApiError::NotFound(format!("成品 {} 没有生效配方", article_id))
            }
            EngineError::InvalidRecipe(e) => ApiError::ValidationError(e.to_string()),
            EngineError::Config(msg) => ApiError::ConfigError(msg),
            EngineError::InvalidInput(msg) => ApiError::InvalidInput(msg),
            EngineError::InvalidState {
                entity,
                id,
                state,
                operation,
            } => ApiError::InvalidStateTransition {
                from: format!("{}({}) {}", entity, id, state),
                to: operation,
            },
            e @ (EngineError::PredecessorNotFinished { .. }
            | EngineError::InputNotDelivered { .. }
            | EngineError::ApprovalPending { .. }
            | EngineError::RunClosed { .. }
            | EngineError::WrongDestination { .. }
            | EngineError::TransferQtyExceeded { .. }) => ApiError::BusinessRuleViolation(e.to_string()),
            EngineError::Repository(e) => e.into(),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quantity::Qty;

    #[test]
    fn test_repository_error_conversion() {
        let api_err: ApiError = RepositoryError::not_found("Task", "T001").into();
        match api_err {
            ApiError::NotFound(msg) => {
                assert!(msg.contains("Task"));
                assert!(msg.contains("T001"));
            }
            _ => panic!("Expected NotFound"),
        }

        let api_err: ApiError = RepositoryError::OptimisticLockFailure {
            entity: "StockPosition".to_string(),
            id: "PLUSH@WH-A".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();
        match api_err {
            ApiError::OptimisticLockFailure(msg) => {
                assert!(msg.contains("PLUSH@WH-A"));
                assert!(msg.contains("已被其他操作修改"));
            }
            _ => panic!("Expected OptimisticLockFailure"),
        }
    }

    #[test]
    fn test_engine_error_conversion() {
        let api_err: ApiError = EngineError::UnknownStockPosition {
            material_id: "EYE".to_string(),
            location_id: "WH-Z".to_string(),
        }
        .into();
        assert!(matches!(api_err, ApiError::UnknownStockPosition { .. }));

        let api_err: ApiError = EngineError::TransferQtyExceeded {
            task_id: "T1".to_string(),
            requested: Qty::from_units(10),
            available: Qty::from_units(5),
        }
        .into();
        match api_err {
            ApiError::BusinessRuleViolation(msg) => assert!(msg.contains("T1")),
            _ => panic!("Expected BusinessRuleViolation"),
        }

        let api_err: ApiError =
            EngineError::Repository(RepositoryError::LockError("poisoned".to_string())).into();
        assert!(matches!(api_err, ApiError::DatabaseConnectionError(_)));
    }
}
