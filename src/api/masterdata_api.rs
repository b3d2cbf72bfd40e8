// ==========================================
// 毛绒玩具生产编排核心 - 主数据 API
// ==========================================
// 职责: 物料/库位/成品登记，配方版本发布与查询
// 红线: 配方发布前必须通过结构校验
// ==========================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::{record_action, require_text};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::quantity::{BufferFactor, Qty};
use crate::domain::recipe::{
    Article, Location, Material, MaterialRequirement, RecipeGraph, RecipeStage, RecipeVersion,
};
use crate::domain::types::Department;
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::masterdata_repo::MasterdataRepository;
use crate::repository::recipe_repo::RecipeRepository;

/// 配方工序录入（序号按列表顺序从 1 分配）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub department: Department,
    pub input_good: Option<String>,
    pub output_good: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub buffer_factor: Option<BufferFactor>,
    pub requirements: Vec<MaterialRequirement>,
}

// ==========================================
// MasterdataApi - 主数据 API
// ==========================================
pub struct MasterdataApi {
    masterdata_repo: Arc<MasterdataRepository>,
    recipe_repo: Arc<RecipeRepository>,
    action_log_repo: Arc<ActionLogRepository>,
}

impl MasterdataApi {
    pub fn new(
        masterdata_repo: Arc<MasterdataRepository>,
        recipe_repo: Arc<RecipeRepository>,
        action_log_repo: Arc<ActionLogRepository>,
    ) -> Self {
        Self {
            masterdata_repo,
            recipe_repo,
            action_log_repo,
        }
    }

    fn now() -> chrono::NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    /// 登记物料（已存在则更新名称与计量单位）
    ///
    /// # 参数
    /// - unit_step: 最小计量单位，必须 > 0
    pub fn register_material(
        &self,
        material_id: &str,
        name: &str,
        unit_step: Qty,
        operator: &str,
    ) -> ApiResult<Material> {
        require_text(material_id, "物料ID")?;
        require_text(name, "物料名称")?;
        if !unit_step.is_positive() {
            return Err(ApiError::InvalidInput(format!("计量单位必须大于0: {}", unit_step)));
        }

        let material = Material {
            material_id: material_id.trim().to_string(),
            name: name.trim().to_string(),
            unit_step,
        };
        self.masterdata_repo.upsert_material(&material, Self::now())?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::RegisterMaterial, operator, Self::now())
                .with_ref("MATERIAL", &material.material_id)
                .with_payload(serde_json::json!(material)),
        );
        Ok(material)
    }

    pub fn register_location(&self, location_id: &str, name: &str, operator: &str) -> ApiResult<Location> {
        require_text(location_id, "库位ID")?;
        require_text(name, "库位名称")?;

        let location = Location {
            location_id: location_id.trim().to_string(),
            name: name.trim().to_string(),
        };
        self.masterdata_repo.upsert_location(&location, Self::now())?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::RegisterLocation, operator, Self::now())
                .with_ref("LOCATION", &location.location_id)
                .with_payload(serde_json::json!(location)),
        );
        Ok(location)
    }

    pub fn register_article(&self, article_id: &str, name: &str, operator: &str) -> ApiResult<Article> {
        require_text(article_id, "成品ID")?;
        require_text(name, "成品名称")?;

        let article = Article {
            article_id: article_id.trim().to_string(),
            name: name.trim().to_string(),
        };
        self.masterdata_repo.upsert_article(&article, Self::now())?;

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::RegisterArticle, operator, Self::now())
                .with_ref("ARTICLE", &article.article_id)
                .with_payload(serde_json::json!(article)),
        );
        Ok(article)
    }

    /// 发布配方新版本
    ///
    /// # 参数
    /// - article_id: 已登记的成品
    /// - stages: 按工艺顺序排列的工序
    ///
    /// # 返回
    /// - Ok(RecipeVersion): 新 ACTIVE 版本（旧版本归档）
    /// - Err(ValidationError): 结构校验失败
    ///
    /// # 说明
    /// - 未登记的物料/库位只告警不拒绝，开工预留时才作为硬错误暴露
    pub fn publish_recipe(
        &self,
        article_id: &str,
        stages: Vec<StageInput>,
        operator: &str,
    ) -> ApiResult<RecipeVersion> {
        require_text(article_id, "成品ID")?;
        if self.masterdata_repo.find_article(article_id)?.is_none() {
            return Err(ApiError::NotFound(format!("成品(id={})不存在", article_id)));
        }

        let stages: Vec<RecipeStage> = stages
            .into_iter()
            .enumerate()
            .map(|(idx, s)| RecipeStage {
                stage_id: String::new(),
                department: s.department,
                seq_no: idx as i32 + 1,
                input_good: s.input_good,
                output_good: s.output_good,
                optional: s.optional,
                buffer_factor: s.buffer_factor,
                requirements: s.requirements,
            })
            .collect();
        RecipeGraph::validate(&stages).map_err(|e| ApiError::ValidationError(e.to_string()))?;

        for req in stages.iter().flat_map(|s| s.requirements.iter()) {
            if self.masterdata_repo.find_material(&req.material_id)?.is_none() {
                warn!(article_id, material_id = %req.material_id, "配方引用了未登记的物料");
            }
            if !self.masterdata_repo.location_exists(&req.location_id)? {
                warn!(article_id, location_id = %req.location_id, "配方引用了未登记的库位");
            }
        }

        let version = self
            .recipe_repo
            .publish_version(article_id, &stages, Self::now())?;
        info!(
            article_id,
            version_no = version.version_no,
            stage_count = stages.len(),
            "配方版本已发布"
        );

        record_action(
            &self.action_log_repo,
            ActionLog::new(ActionType::PublishRecipe, operator, Self::now())
                .with_ref("RECIPE_VERSION", &version.recipe_version_id)
                .with_payload(serde_json::json!({
                    "article_id": article_id,
                    "version_no": version.version_no,
                    "stages": stages,
                }))
                .with_detail(format!("发布配方 {} v{}", article_id, version.version_no)),
        );
        Ok(version)
    }

    /// 查询成品当前生效的配方图
    pub fn get_active_recipe(&self, article_id: &str) -> ApiResult<RecipeGraph> {
        self.recipe_repo
            .find_active_graph(article_id)?
            .ok_or_else(|| ApiError::NotFound(format!("成品 {} 没有生效配方", article_id)))
    }

    pub fn list_recipe_versions(&self, article_id: &str) -> ApiResult<Vec<RecipeVersion>> {
        Ok(self.recipe_repo.list_versions(article_id)?)
    }

    pub fn get_material(&self, material_id: &str) -> ApiResult<Option<Material>> {
        Ok(self.masterdata_repo.find_material(material_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RecipeStatus;
    use crate::engine::fixtures::{bear_stages, memory_conn, q, ARTICLE, LOCATION};

    fn setup() -> (MasterdataApi, Arc<ActionLogRepository>) {
        let conn = memory_conn();
        let logs = Arc::new(ActionLogRepository::new(conn.clone()));
        let api = MasterdataApi::new(
            Arc::new(MasterdataRepository::new(conn.clone())),
            Arc::new(RecipeRepository::new(conn)),
            logs.clone(),
        );
        (api, logs)
    }

    fn to_inputs(stages: Vec<RecipeStage>) -> Vec<StageInput> {
        stages
            .into_iter()
            .map(|s| StageInput {
                department: s.department,
                input_good: s.input_good,
                output_good: s.output_good,
                optional: s.optional,
                buffer_factor: s.buffer_factor,
                requirements: s.requirements,
            })
            .collect()
    }

    #[test]
    fn test_register_and_publish() {
        let (api, logs) = setup();
        api.register_location(LOCATION, "主仓", "admin").unwrap();
        api.register_material("PLUSH", "短毛绒", q("0.001"), "admin").unwrap();
        api.register_article(ARTICLE, "泰迪熊", "admin").unwrap();

        let v1 = api
            .publish_recipe(ARTICLE, to_inputs(bear_stages()), "admin")
            .unwrap();
        let v2 = api
            .publish_recipe(ARTICLE, to_inputs(bear_stages()), "admin")
            .unwrap();
        assert_eq!(v1.version_no, 1);
        assert_eq!(v2.version_no, 2);

        let graph = api.get_active_recipe(ARTICLE).unwrap();
        assert_eq!(graph.version.recipe_version_id, v2.recipe_version_id);
        assert_eq!(graph.stages.len(), 3);

        let versions = api.list_recipe_versions(ARTICLE).unwrap();
        assert_eq!(
            versions
                .iter()
                .filter(|v| v.status == RecipeStatus::Active)
                .count(),
            1
        );
        assert_eq!(logs.count_by_action_type("PublishRecipe").unwrap(), 2);
    }

    #[test]
    fn test_publish_rejects_invalid_graph() {
        let (api, _) = setup();
        api.register_article(ARTICLE, "泰迪熊", "admin").unwrap();

        let mut stages = to_inputs(bear_stages());
        stages.swap(0, 2);
        let err = api.publish_recipe(ARTICLE, stages, "admin").unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));

        let err = api
            .publish_recipe("GHOST", to_inputs(bear_stages()), "admin")
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_register_material_rejects_bad_step() {
        let (api, _) = setup();
        assert!(api.register_material("EYE", "眼珠", Qty::ZERO, "admin").is_err());
        assert!(api.register_material(" ", "眼珠", q("1"), "admin").is_err());
    }
}
