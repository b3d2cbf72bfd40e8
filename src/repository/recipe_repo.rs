// ==========================================
// 毛绒玩具生产编排核心 - 配方图仓储
// ==========================================
// 职责: recipe_version / recipe_stage / material_requirement 表
// 红线: 已发布版本只读；发布新版本时在同一事务内归档旧 ACTIVE 版本
// ==========================================

use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::recipe::{MaterialRequirement, RecipeGraph, RecipeStage, RecipeVersion};
use crate::domain::types::{Department, RecipeStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{fmt_ts, parse_enum, parse_ts};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

// ==========================================
// RecipeRepository - 配方仓储
// ==========================================
pub struct RecipeRepository {
    conn: Arc<Mutex<Connection>>,
}

impl RecipeRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 发布配方新版本（自动分配 version_no，并归档旧版本）
    ///
    /// # 参数
    /// - article_id: 成品ID
    /// - stages: 已通过结构校验的工序列表
    ///
    /// # 返回
    /// - Ok(RecipeVersion): 新的 ACTIVE 版本
    pub fn publish_version(
        &self,
        article_id: &str,
        stages: &[RecipeStage],
        now: NaiveDateTime,
    ) -> RepositoryResult<RecipeVersion> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let max_version_no: Option<i32> = tx.query_row(
            "SELECT MAX(version_no) FROM recipe_version WHERE article_id = ?1",
            params![article_id],
            |row| row.get(0),
        )?;

        let version = RecipeVersion {
            recipe_version_id: uuid::Uuid::new_v4().to_string(),
            article_id: article_id.to_string(),
            version_no: max_version_no.unwrap_or(0) + 1,
            status: RecipeStatus::Active,
            created_at: now,
        };

        tx.execute(
            "UPDATE recipe_version SET status = ?1 WHERE article_id = ?2 AND status = ?3",
            params![
                RecipeStatus::Archived.to_db_str(),
                article_id,
                RecipeStatus::Active.to_db_str()
            ],
        )?;

        tx.execute(
            r#"INSERT INTO recipe_version (recipe_version_id, article_id, version_no, status, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                version.recipe_version_id,
                version.article_id,
                version.version_no,
                version.status.to_db_str(),
                fmt_ts(&version.created_at),
            ],
        )?;

        // 工序ID每个版本重新生成
        for stage in stages {
            let stage_id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                r#"INSERT INTO recipe_stage (
                    stage_id, recipe_version_id, department, seq_no,
                    input_good, output_good, optional, buffer_factor_milli
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                params![
                    stage_id,
                    version.recipe_version_id,
                    stage.department.to_db_str(),
                    stage.seq_no,
                    stage.input_good,
                    stage.output_good,
                    stage.optional,
                    stage.buffer_factor.map(|f| f.milli()),
                ],
            )?;

            for req in &stage.requirements {
                tx.execute(
                    r#"INSERT INTO material_requirement (
                        stage_id, material_id, location_id, qty_per_unit_milli, wastage_pct_milli
                    ) VALUES (?1, ?2, ?3, ?4, ?5)"#,
                    params![
                        stage_id,
                        req.material_id,
                        req.location_id,
                        req.qty_per_unit.milli(),
                        req.wastage_pct.milli(),
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(version)
    }

    /// 查询成品当前 ACTIVE 配方图
    pub fn find_active_graph(&self, article_id: &str) -> RepositoryResult<Option<RecipeGraph>> {
        let conn = self.get_conn()?;
        let version = conn
            .query_row(
                r#"SELECT recipe_version_id, article_id, version_no, status, created_at
                   FROM recipe_version
                   WHERE article_id = ?1 AND status = ?2"#,
                params![article_id, RecipeStatus::Active.to_db_str()],
                map_version,
            )
            .optional()?;

        match version {
            Some(v) => Ok(Some(Self::assemble_graph_in(&conn, v)?)),
            None => Ok(None),
        }
    }

    /// 按版本ID加载配方图（批次绑定的版本，无论是否已归档）
    pub fn find_graph_in(conn: &Connection, recipe_version_id: &str) -> RepositoryResult<Option<RecipeGraph>> {
        let version = conn
            .query_row(
                r#"SELECT recipe_version_id, article_id, version_no, status, created_at
                   FROM recipe_version
                   WHERE recipe_version_id = ?1"#,
                params![recipe_version_id],
                map_version,
            )
            .optional()?;

        match version {
            Some(v) => Ok(Some(Self::assemble_graph_in(conn, v)?)),
            None => Ok(None),
        }
    }

    pub fn find_graph(&self, recipe_version_id: &str) -> RepositoryResult<Option<RecipeGraph>> {
        let conn = self.get_conn()?;
        Self::find_graph_in(&conn, recipe_version_id)
    }

    fn assemble_graph_in(conn: &Connection, version: RecipeVersion) -> RepositoryResult<RecipeGraph> {
        let mut stmt = conn.prepare(
            r#"SELECT stage_id, department, seq_no, input_good, output_good, optional, buffer_factor_milli
               FROM recipe_stage
               WHERE recipe_version_id = ?1
               ORDER BY seq_no"#,
        )?;
        let mut stages = stmt
            .query_map(params![version.recipe_version_id], |row| {
                let dept: String = row.get(1)?;
                Ok(RecipeStage {
                    stage_id: row.get(0)?,
                    department: parse_enum(1, &dept, Department::from_db_str)?,
                    seq_no: row.get(2)?,
                    input_good: row.get(3)?,
                    output_good: row.get(4)?,
                    optional: row.get(5)?,
                    buffer_factor: row.get::<_, Option<i64>>(6)?.map(BufferFactor::from_milli),
                    requirements: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut req_stmt = conn.prepare(
            r#"SELECT material_id, location_id, qty_per_unit_milli, wastage_pct_milli
               FROM material_requirement
               WHERE stage_id = ?1
               ORDER BY material_id, location_id"#,
        )?;
        for stage in stages.iter_mut() {
            stage.requirements = req_stmt
                .query_map(params![stage.stage_id], |row| {
                    Ok(MaterialRequirement {
                        material_id: row.get(0)?,
                        location_id: row.get(1)?,
                        qty_per_unit: Qty::from_milli(row.get(2)?),
                        wastage_pct: Qty::from_milli(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }

        Ok(RecipeGraph { version, stages })
    }

    /// 查询成品的全部版本（新版本在前）
    pub fn list_versions(&self, article_id: &str) -> RepositoryResult<Vec<RecipeVersion>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT recipe_version_id, article_id, version_no, status, created_at
               FROM recipe_version
               WHERE article_id = ?1
               ORDER BY version_no DESC"#,
        )?;
        let versions = stmt
            .query_map(params![article_id], map_version)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }
}

fn map_version(row: &Row<'_>) -> rusqlite::Result<RecipeVersion> {
    let status: String = row.get(3)?;
    Ok(RecipeVersion {
        recipe_version_id: row.get(0)?,
        article_id: row.get(1)?,
        version_no: row.get(2)?,
        status: parse_enum(3, &status, RecipeStatus::from_db_str)?,
        created_at: parse_ts(4, row.get(4)?)?,
    })
}
