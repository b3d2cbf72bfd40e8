// ==========================================
// 毛绒玩具生产编排核心 - 告警发布
// ==========================================
// 职责: 定义告警发布 trait，实现依赖倒置
// 说明: 告警先随业务事务落库（alert 表），提交成功后再推送给发布者
// ==========================================

use crate::domain::alert::Alert;
use crate::repository::alert_repo::AlertRepository;
use crate::repository::error::RepositoryResult;
use rusqlite::Connection;
use std::error::Error;
use std::sync::{Arc, Mutex};

// ==========================================
// 告警发布 Trait
// ==========================================

/// 告警发布者 Trait
///
/// 外部通知服务（看板推送/短信网关等）实现此 trait
pub trait AlertPublisher: Send + Sync {
    /// 发布告警
    ///
    /// # 返回
    /// - `Err`: 发布失败（不影响已提交的业务数据）
    fn publish(&self, alert: &Alert) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作告警发布者
#[derive(Debug, Clone, Default)]
pub struct NoOpAlertPublisher;

impl AlertPublisher for NoOpAlertPublisher {
    fn publish(&self, alert: &Alert) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            alert_id = %alert.alert_id,
            alert_type = %alert.alert_type,
            "NoOpAlertPublisher: 跳过告警推送"
        );
        Ok(())
    }
}

/// 内存收集发布者（测试/仿真用）
#[derive(Debug, Default)]
pub struct CollectingAlertPublisher {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlertPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取走已收集的告警
    pub fn drain(&self) -> Vec<Alert> {
        let mut guard = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertPublisher for CollectingAlertPublisher {
    fn publish(&self, alert: &Alert) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut guard = self
            .alerts
            .lock()
            .map_err(|e| format!("锁获取失败: {}", e))?;
        guard.push(alert.clone());
        Ok(())
    }
}

/// 可选的告警发布者包装
///
/// 简化 Option<Arc<dyn AlertPublisher>> 的使用
#[derive(Clone, Default)]
pub struct OptionalAlertPublisher {
    inner: Option<Arc<dyn AlertPublisher>>,
}

impl OptionalAlertPublisher {
    /// 创建带发布者的实例
    pub fn with_publisher(publisher: Arc<dyn AlertPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    /// 创建空实例（不推送告警）
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// 推送告警；失败只记日志
    pub fn publish_all(&self, alerts: &[Alert]) {
        let Some(publisher) = &self.inner else {
            return;
        };
        for alert in alerts {
            if let Err(e) = publisher.publish(alert) {
                tracing::warn!(
                    alert_id = %alert.alert_id,
                    alert_type = %alert.alert_type,
                    error = %e,
                    "告警推送失败"
                );
            }
        }
    }

    /// 检查是否配置了发布者
    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

// ==========================================
// AlertOutbox - 事务内告警暂存
// ==========================================
/// 事务内产生的告警：先写 alert 表，提交后由引擎统一推送
#[derive(Debug, Default)]
pub struct AlertOutbox {
    alerts: Vec<Alert>,
}

impl AlertOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 落库并暂存
    pub fn raise_in(&mut self, conn: &Connection, alert: Alert) -> RepositoryResult<()> {
        AlertRepository::insert_in(conn, &alert)?;
        tracing::info!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            ref_type = %alert.ref_type,
            ref_id = %alert.ref_id,
            "{}",
            alert.message
        );
        self.alerts.push(alert);
        Ok(())
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn into_alerts(self) -> Vec<Alert> {
        self.alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertSeverity, AlertType};
    use chrono::Utc;

    fn sample_alert() -> Alert {
        Alert::new(
            AlertType::DebtCreated,
            AlertSeverity::Warning,
            "DEBT",
            "D1",
            "物料欠账".to_string(),
            Utc::now().naive_utc(),
        )
    }

    #[test]
    fn test_noop_publisher() {
        assert!(NoOpAlertPublisher.publish(&sample_alert()).is_ok());
    }

    #[test]
    fn test_optional_publisher_none() {
        let publisher = OptionalAlertPublisher::none();
        assert!(!publisher.is_configured());
        publisher.publish_all(&[sample_alert()]);
    }

    #[test]
    fn test_optional_publisher_forwards_to_collector() {
        let collector = Arc::new(CollectingAlertPublisher::new());
        let publisher = OptionalAlertPublisher::with_publisher(collector.clone());
        assert!(publisher.is_configured());

        publisher.publish_all(&[sample_alert(), sample_alert()]);
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.drain().len(), 2);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_outbox_persists_alert() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();

        let mut outbox = AlertOutbox::new();
        outbox.raise_in(&conn, sample_alert()).unwrap();
        assert_eq!(outbox.alerts().len(), 1);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alert", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
