// ==========================================
// 毛绒玩具生产编排核心 - SQLite 连接与建库
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键、busy_timeout）
// - 建库脚本幂等，可在已有库上重复执行
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 建库脚本
///
/// 数量字段统一以 *_milli INTEGER 存储（千分位定点）
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS config_scope (
    scope_id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(scope_type, scope_key)
);

INSERT OR IGNORE INTO config_scope (scope_id, scope_type, scope_key)
VALUES ('global', 'GLOBAL', 'global');

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL REFERENCES config_scope(scope_id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

-- ===== 主数据 =====
CREATE TABLE IF NOT EXISTS material (
    material_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    unit_step_milli INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS location (
    location_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS article (
    article_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- ===== 配方图 =====
CREATE TABLE IF NOT EXISTS recipe_version (
    recipe_version_id TEXT PRIMARY KEY,
    article_id TEXT NOT NULL REFERENCES article(article_id),
    version_no INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(article_id, version_no)
);

CREATE TABLE IF NOT EXISTS recipe_stage (
    stage_id TEXT PRIMARY KEY,
    recipe_version_id TEXT NOT NULL REFERENCES recipe_version(recipe_version_id),
    department TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    input_good TEXT,
    output_good TEXT NOT NULL,
    optional INTEGER NOT NULL DEFAULT 0,
    buffer_factor_milli INTEGER,
    UNIQUE(recipe_version_id, seq_no)
);

-- 物料/库位不加外键: 配方可先于主数据发布，缺失在预留时暴露（入口工单 BLOCKED）
CREATE TABLE IF NOT EXISTS material_requirement (
    stage_id TEXT NOT NULL REFERENCES recipe_stage(stage_id),
    material_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    qty_per_unit_milli INTEGER NOT NULL,
    wastage_pct_milli INTEGER NOT NULL,
    PRIMARY KEY (stage_id, material_id, location_id)
);

-- ===== 物料台账 =====
CREATE TABLE IF NOT EXISTS stock_position (
    material_id TEXT NOT NULL REFERENCES material(material_id),
    location_id TEXT NOT NULL REFERENCES location(location_id),
    on_hand_milli INTEGER NOT NULL DEFAULT 0,
    reserved_milli INTEGER NOT NULL DEFAULT 0,
    consumed_milli INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (material_id, location_id)
);

CREATE TABLE IF NOT EXISTS material_debt (
    debt_id TEXT PRIMARY KEY,
    material_id TEXT NOT NULL REFERENCES material(material_id),
    location_id TEXT NOT NULL REFERENCES location(location_id),
    source_ref TEXT,
    total_milli INTEGER NOT NULL,
    settled_milli INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_material_debt_material ON material_debt(material_id, status);

-- ===== 生产批次/工单 =====
CREATE TABLE IF NOT EXISTS production_run (
    run_id TEXT PRIMARY KEY,
    article_id TEXT NOT NULL REFERENCES article(article_id),
    recipe_version_id TEXT NOT NULL REFERENCES recipe_version(recipe_version_id),
    batch_id TEXT NOT NULL,
    requested_milli INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS task (
    task_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES production_run(run_id),
    stage_id TEXT NOT NULL,
    department TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    predecessor_task_id TEXT REFERENCES task(task_id),
    target_milli INTEGER NOT NULL,
    input_milli INTEGER NOT NULL DEFAULT 0,
    actual_output_milli INTEGER NOT NULL DEFAULT 0,
    reject_milli INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    block_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    UNIQUE(run_id, seq_no)
);

CREATE TABLE IF NOT EXISTS reservation (
    reservation_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES task(task_id),
    material_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    reserved_milli INTEGER NOT NULL,
    consumed_milli INTEGER NOT NULL DEFAULT 0,
    released_milli INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_reservation_task ON reservation(task_id);

-- ===== 工序交接 =====
CREATE TABLE IF NOT EXISTS transfer_record (
    transfer_id TEXT PRIMARY KEY,
    from_task_id TEXT NOT NULL REFERENCES task(task_id),
    to_task_id TEXT NOT NULL REFERENCES task(task_id),
    from_department TEXT NOT NULL,
    to_department TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    sent_milli INTEGER NOT NULL,
    received_milli INTEGER,
    state TEXT NOT NULL,
    block_reason TEXT,
    last_rejected_milli INTEGER,
    mismatch_count INTEGER NOT NULL DEFAULT 0,
    retry_of TEXT,
    initiated_at TEXT NOT NULL,
    locked_at TEXT,
    accepted_at TEXT,
    completed_at TEXT,
    blocked_at TEXT,
    stale_alerted_at TEXT,
    revision INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_transfer_to_dept ON transfer_record(to_department, state);

CREATE TABLE IF NOT EXISTS line_occupancy (
    department TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    batch_id TEXT,
    updated_at TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO line_occupancy (department, state, batch_id, updated_at)
VALUES
    ('CUTTING', 'CLEAR', NULL, datetime('now')),
    ('EMBROIDERY', 'CLEAR', NULL, datetime('now')),
    ('SEWING', 'CLEAR', NULL, datetime('now')),
    ('FINISHING', 'CLEAR', NULL, datetime('now')),
    ('PACKING', 'CLEAR', NULL, datetime('now'));

-- ===== 短缺处理 =====
CREATE TABLE IF NOT EXISTS waste_report (
    report_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES task(task_id),
    shortfall_milli INTEGER NOT NULL,
    reject_milli INTEGER NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_request (
    approval_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES task(task_id),
    waste_report_id TEXT NOT NULL REFERENCES waste_report(report_id),
    shortfall_milli INTEGER NOT NULL,
    status TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    decided_at TEXT,
    decided_by TEXT,
    comment TEXT,
    revision INTEGER NOT NULL DEFAULT 0
);

-- ===== 告警/审计 =====
CREATE TABLE IF NOT EXISTS alert (
    alert_id TEXT PRIMARY KEY,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    department TEXT,
    recipients_json TEXT NOT NULL,
    ref_type TEXT NOT NULL,
    ref_id TEXT NOT NULL,
    message TEXT NOT NULL,
    payload_json TEXT,
    created_at TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_alert_ref ON alert(ref_type, ref_id);

CREATE TABLE IF NOT EXISTS action_log (
    action_id TEXT PRIMARY KEY,
    action_type TEXT NOT NULL,
    action_ts TEXT NOT NULL,
    actor TEXT NOT NULL,
    ref_type TEXT,
    ref_id TEXT,
    payload_json TEXT,
    detail TEXT
);
CREATE INDEX IF NOT EXISTS idx_action_log_ref ON action_log(ref_type, ref_id);
"#;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开连接、建库，并包装为仓储共享句柄
pub fn open_shared_connection(db_path: &str) -> rusqlite::Result<Arc<Mutex<Connection>>> {
    let conn = open_sqlite_connection(db_path)?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 建库（幂等）并登记 schema_version
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}
