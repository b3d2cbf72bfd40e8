// ==========================================
// 毛绒玩具生产编排核心 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化；更新一律带 revision 乐观锁
// ==========================================
// 约定:
// - `xxx_in(conn, ..)` 关联函数可在事务内调用（Transaction 解引用为 Connection）
// - `&self` 方法自行获取共享连接，只能在事务外调用
// ==========================================

pub mod action_log_repo;
pub mod alert_repo;
pub mod error;
pub mod ledger_repo;
pub mod masterdata_repo;
pub mod production_repo;
pub mod recipe_repo;
pub mod resolution_repo;
pub mod transfer_repo;
pub mod unit_of_work;

// 重导出核心仓储
pub use action_log_repo::ActionLogRepository;
pub use alert_repo::AlertRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use ledger_repo::LedgerRepository;
pub use masterdata_repo::MasterdataRepository;
pub use production_repo::ProductionRepository;
pub use recipe_repo::RecipeRepository;
pub use resolution_repo::ResolutionRepository;
pub use transfer_repo::TransferRepository;
pub use unit_of_work::UnitOfWork;

use chrono::NaiveDateTime;
use rusqlite::types::Type;

/// 时间戳存储格式
pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn fmt_ts(ts: &NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn fmt_ts_opt(ts: &Option<NaiveDateTime>) -> Option<String> {
    ts.as_ref().map(fmt_ts)
}

/// 解析时间戳列（格式错误视为数据损坏）
pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&raw, TS_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDateTime>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

/// 解析枚举列
pub(crate) fn parse_enum<T>(
    idx: usize,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("未知枚举取值: {}", raw).into(),
        )
    })
}

/// 乐观锁更新结果检查
///
/// rows_affected == 0 时区分“记录不存在”与“revision 冲突”
pub(crate) fn check_revision(
    conn: &rusqlite::Connection,
    rows_affected: usize,
    entity: &str,
    table: &str,
    key_column: &str,
    id: &str,
    expected: i32,
) -> RepositoryResult<()> {
    if rows_affected > 0 {
        return Ok(());
    }
    let sql = format!("SELECT revision FROM {} WHERE {} = ?1", table, key_column);
    match conn.query_row(&sql, [id], |row| row.get::<_, i32>(0)) {
        Ok(actual) => Err(RepositoryError::OptimisticLockFailure {
            entity: entity.to_string(),
            id: id.to_string(),
            expected,
            actual,
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(RepositoryError::not_found(entity, id)),
        Err(e) => Err(e.into()),
    }
}
