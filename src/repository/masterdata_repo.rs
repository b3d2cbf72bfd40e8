// ==========================================
// 毛绒玩具生产编排核心 - 主数据仓储
// ==========================================
// 职责: material / location / article 表的读写
// 说明: 主数据由外部维护，核心只在测试/初始化时写入
// ==========================================

use crate::domain::quantity::Qty;
use crate::domain::recipe::{Article, Location, Material};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::fmt_ts;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

// ==========================================
// MasterdataRepository - 主数据仓储
// ==========================================
pub struct MasterdataRepository {
    conn: Arc<Mutex<Connection>>,
}

impl MasterdataRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 写入（INSERT OR REPLACE，幂等）
    // ==========================================

    pub fn upsert_material(&self, material: &Material, now: NaiveDateTime) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO material (material_id, name, unit_step_milli, created_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(material_id) DO UPDATE SET name = ?2, unit_step_milli = ?3"#,
            params![
                material.material_id,
                material.name,
                material.unit_step.milli(),
                fmt_ts(&now),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_location(&self, location: &Location, now: NaiveDateTime) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO location (location_id, name, created_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(location_id) DO UPDATE SET name = ?2"#,
            params![location.location_id, location.name, fmt_ts(&now)],
        )?;
        Ok(())
    }

    pub fn upsert_article(&self, article: &Article, now: NaiveDateTime) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO article (article_id, name, created_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(article_id) DO UPDATE SET name = ?2"#,
            params![article.article_id, article.name, fmt_ts(&now)],
        )?;
        Ok(())
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn find_material_in(conn: &Connection, material_id: &str) -> RepositoryResult<Option<Material>> {
        let material = conn
            .query_row(
                "SELECT material_id, name, unit_step_milli FROM material WHERE material_id = ?1",
                params![material_id],
                |row| {
                    Ok(Material {
                        material_id: row.get(0)?,
                        name: row.get(1)?,
                        unit_step: Qty::from_milli(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(material)
    }

    pub fn find_material(&self, material_id: &str) -> RepositoryResult<Option<Material>> {
        let conn = self.get_conn()?;
        Self::find_material_in(&conn, material_id)
    }

    pub fn location_exists_in(conn: &Connection, location_id: &str) -> RepositoryResult<bool> {
        let found: Option<i32> = conn
            .query_row(
                "SELECT 1 FROM location WHERE location_id = ?1",
                params![location_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn location_exists(&self, location_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        Self::location_exists_in(&conn, location_id)
    }

    pub fn find_article(&self, article_id: &str) -> RepositoryResult<Option<Article>> {
        let conn = self.get_conn()?;
        let article = conn
            .query_row(
                "SELECT article_id, name FROM article WHERE article_id = ?1",
                params![article_id],
                |row| {
                    Ok(Article {
                        article_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(article)
    }
}
