//! Component health checks: connectivity, stream backlogs, and disk usage.
//!
//! Each cycle writes one record per component to the `system_health` table
//! and to `health:{component}` in the state store. Warnings and criticals are
//! surfaced through the log with a per-component cooldown; the push transport
//! (Telegram et al.) is an external collaborator.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use sysinfo::Disks;
use tracing::{error, info, warn};

use crate::bus::{StreamConsumer, StreamPublisher, topics};
use crate::config::MonitoringConfig;
use crate::error::Result;
use crate::state::StateStore;

/// Backlog thresholds (entries).
const BACKLOG_WARNING: i64 = 10_000;
const BACKLOG_CRITICAL: i64 = 50_000;

/// Disk-usage thresholds (percent used).
const DISK_WARNING_PCT: f64 = 80.0;
const DISK_CRITICAL_PCT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Classify a stream backlog length.
pub(crate) fn backlog_status(length: i64) -> HealthStatus {
    if length > BACKLOG_CRITICAL {
        HealthStatus::Critical
    } else if length > BACKLOG_WARNING {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    }
}

/// Classify disk usage.
pub(crate) fn disk_status(used_pct: f64) -> HealthStatus {
    if used_pct > DISK_CRITICAL_PCT {
        HealthStatus::Critical
    } else if used_pct > DISK_WARNING_PCT {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    }
}

/// One component's health record.
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Value,
    pub message_rate: Option<f64>,
    pub lag_ms: Option<f64>,
}

impl ComponentHealth {
    fn to_json(&self) -> Value {
        serde_json::json!({
            "component": self.component,
            "status": self.status.as_str(),
            "details": self.details,
        })
    }
}

/// Probes every shared resource on a fixed interval.
pub struct HealthMonitor {
    state: StateStore,
    consumer: StreamConsumer,
    publisher: StreamPublisher,
    pool: PgPool,
    config: MonitoringConfig,
    last_stream_lengths: HashMap<&'static str, i64>,
    last_alert: HashMap<String, f64>,
}

const MONITORED_STREAMS: [(&str, &str); 4] = [
    (topics::TRADES, "trade_stream_backlog"),
    (topics::TICKER_V2, "ticker_stream_backlog"),
    (topics::ORDERBOOK_DELTAS, "orderbook_stream_backlog"),
    (topics::LIFECYCLE, "lifecycle_stream_backlog"),
];

impl HealthMonitor {
    pub fn new(
        state: StateStore,
        consumer: StreamConsumer,
        publisher: StreamPublisher,
        pool: PgPool,
        config: MonitoringConfig,
    ) -> Self {
        Self {
            state,
            consumer,
            publisher,
            pool,
            config,
            last_stream_lengths: HashMap::new(),
            last_alert: HashMap::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let interval = std::time::Duration::from_secs(self.config.health_check_interval.max(1));
        info!(interval_seconds = interval.as_secs(), "health_monitor_started");

        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;

            let results = self.run_all_checks().await;
            self.write_results(&results).await;
            self.update_state_store(&results).await;
            self.dispatch_alerts(&results).await;
        }
    }

    async fn run_all_checks(&mut self) -> Vec<ComponentHealth> {
        let mut results = Vec::new();

        results.push(self.check_state_store().await);
        results.push(self.check_database().await);
        for (stream, component) in MONITORED_STREAMS {
            results.push(self.check_stream_backlog(stream, component).await);
        }
        results.push(self.check_disk());

        results
    }

    async fn check_state_store(&self) -> ComponentHealth {
        match self.state.ping().await {
            Ok(latency_ms) => ComponentHealth {
                component: "redis".to_string(),
                status: HealthStatus::Ok,
                details: serde_json::json!({ "latency_ms": latency_ms }),
                message_rate: None,
                lag_ms: Some(latency_ms),
            },
            Err(e) => ComponentHealth {
                component: "redis".to_string(),
                status: HealthStatus::Critical,
                details: serde_json::json!({ "error": e.to_string() }),
                message_rate: None,
                lag_ms: None,
            },
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = std::time::Instant::now();
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                ComponentHealth {
                    component: "postgres".to_string(),
                    status: HealthStatus::Ok,
                    details: serde_json::json!({ "latency_ms": latency_ms }),
                    message_rate: None,
                    lag_ms: Some(latency_ms),
                }
            }
            Err(e) => ComponentHealth {
                component: "postgres".to_string(),
                status: HealthStatus::Critical,
                details: serde_json::json!({ "error": e.to_string() }),
                message_rate: None,
                lag_ms: None,
            },
        }
    }

    async fn check_stream_backlog(
        &mut self,
        stream: &'static str,
        component: &str,
    ) -> ComponentHealth {
        match self.consumer.stream_len(stream).await {
            Ok(length) => {
                let previous = self.last_stream_lengths.insert(stream, length).unwrap_or(0);
                let rate = (length - previous) as f64
                    / self.config.health_check_interval.max(1) as f64;

                ComponentHealth {
                    component: component.to_string(),
                    status: backlog_status(length),
                    details: serde_json::json!({ "length": length, "rate_per_sec": rate }),
                    message_rate: Some(rate.abs()),
                    lag_ms: None,
                }
            }
            Err(e) => ComponentHealth {
                component: component.to_string(),
                status: HealthStatus::Warning,
                details: serde_json::json!({ "error": e.to_string() }),
                message_rate: None,
                lag_ms: None,
            },
        }
    }

    fn check_disk(&self) -> ComponentHealth {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next());

        let Some(disk) = root else {
            return ComponentHealth {
                component: "disk".to_string(),
                status: HealthStatus::Warning,
                details: serde_json::json!({ "error": "no disks found" }),
                message_rate: None,
                lag_ms: None,
            };
        };

        let total = disk.total_space() as f64;
        let free = disk.available_space() as f64;
        let used_pct = if total > 0.0 {
            (total - free) / total * 100.0
        } else {
            0.0
        };

        ComponentHealth {
            component: "disk".to_string(),
            status: disk_status(used_pct),
            details: serde_json::json!({
                "used_pct": used_pct,
                "free_gb": free / (1024.0 * 1024.0 * 1024.0),
            }),
            message_rate: None,
            lag_ms: None,
        }
    }

    async fn write_results(&self, results: &[ComponentHealth]) {
        for record in results {
            let insert = sqlx::query(
                "INSERT INTO system_health (ts, component, status, details, message_rate, lag_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Utc::now())
            .bind(&record.component)
            .bind(record.status.as_str())
            .bind(&record.details)
            .bind(record.message_rate)
            .bind(record.lag_ms)
            .execute(&self.pool)
            .await;

            if let Err(e) = insert {
                error!(component = %record.component, error = %e, "health_write_error");
            }
        }
    }

    async fn update_state_store(&self, results: &[ComponentHealth]) {
        for record in results {
            if let Err(e) = self.state.set_health(&record.component, &record.to_json()).await {
                error!(component = %record.component, error = %e, "health_state_update_error");
            }
        }
    }

    /// Surface warnings/criticals, observing the per-component cooldown.
    /// Alerts also land on the `kalshi:system` topic for external transports.
    async fn dispatch_alerts(&mut self, results: &[ComponentHealth]) {
        let now = Utc::now().timestamp() as f64;
        let cooldown = self.config.alert_cooldown as f64;

        for record in results {
            if record.status == HealthStatus::Ok {
                continue;
            }

            let last = self.last_alert.get(&record.component).copied().unwrap_or(0.0);
            if now - last < cooldown {
                continue;
            }
            self.last_alert.insert(record.component.clone(), now);

            match record.status {
                HealthStatus::Critical => error!(
                    component = %record.component,
                    details = %record.details,
                    "health_alert_critical"
                ),
                HealthStatus::Warning => warn!(
                    component = %record.component,
                    details = %record.details,
                    "health_alert_warning"
                ),
                HealthStatus::Ok => {}
            }

            let alert = serde_json::json!({
                "severity": record.status.as_str(),
                "component": record.component,
                "details": record.details,
                "ts": now,
            });
            if let Err(e) = self.publisher.publish(topics::SYSTEM, &alert).await {
                error!(component = %record.component, error = %e, "system_alert_publish_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_thresholds() {
        assert_eq!(backlog_status(0), HealthStatus::Ok);
        assert_eq!(backlog_status(10_000), HealthStatus::Ok);
        assert_eq!(backlog_status(10_001), HealthStatus::Warning);
        assert_eq!(backlog_status(50_000), HealthStatus::Warning);
        assert_eq!(backlog_status(50_001), HealthStatus::Critical);
    }

    #[test]
    fn test_disk_thresholds() {
        assert_eq!(disk_status(50.0), HealthStatus::Ok);
        assert_eq!(disk_status(85.0), HealthStatus::Warning);
        assert_eq!(disk_status(95.0), HealthStatus::Critical);
    }

    #[test]
    fn test_health_record_json() {
        let record = ComponentHealth {
            component: "redis".to_string(),
            status: HealthStatus::Warning,
            details: serde_json::json!({ "latency_ms": 12.5 }),
            message_rate: None,
            lag_ms: Some(12.5),
        };
        let json = record.to_json();
        assert_eq!(json["component"], "redis");
        assert_eq!(json["status"], "warning");
        assert_eq!(json["details"]["latency_ms"], 12.5);
    }
}
