use crate::db::PersistenceGateway;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Funnel Analytics (C8): three admin-gated read-only queries over
/// `bot_flows`/`funnel_events`, each cached in-process for 60s keyed by its
/// query parameters so repeated dashboard polling doesn't hammer the pool.
pub struct FunnelAnalytics {
    db: Arc<PersistenceGateway>,
    cache: Mutex<HashMap<String, (Instant, Value)>>,
}

impl FunnelAnalytics {
    pub fn new(db: Arc<PersistenceGateway>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, key: String, compute: impl std::future::Future<Output = Value>) -> Value {
        {
            let cache = self.cache.lock().await;
            if let Some((at, value)) = cache.get(&key) {
                if at.elapsed() < CACHE_TTL {
                    return value.clone();
                }
            }
        }
        let value = compute.await;
        self.cache.lock().await.insert(key, (Instant::now(), value.clone()));
        value
    }

    /// Per-stage reach counts, cancelled/failed totals, unique creators, and
    /// step-by-step conversion ratios for flows within the last `days` days,
    /// windowed on either flow start (`created_at`) or last activity
    /// (`updated_at`).
    pub async fn funnel_summary(&self, days: i64, window: &str) -> Value {
        let date_col = if window == "activity" { "updated_at" } else { "created_at" };
        let key = format!("funnel_summary:{}:{}", days, date_col);
        self.cached(key, async {
            let Ok(client) = self.db.pool().get().await else {
                return json!({"error": "database unavailable"});
            };
            let sql = format!(
                "SELECT
                    COUNT(*) FILTER (WHERE current_stage >= 1) AS s1,
                    COUNT(*) FILTER (WHERE current_stage >= 2) AS s2,
                    COUNT(*) FILTER (WHERE current_stage >= 3) AS s3,
                    COUNT(*) FILTER (WHERE current_stage >= 4) AS s4,
                    COUNT(*) FILTER (WHERE current_stage >= 5) AS s5,
                    COUNT(*) FILTER (WHERE final_status = 'cancelled') AS cancelled,
                    COUNT(*) FILTER (WHERE final_status = 'failed') AS failed,
                    COUNT(DISTINCT user_id) AS unique_users
                 FROM bot_flows
                 WHERE {} >= now() - interval '{} days'",
                date_col, days
            );
            let Ok(row) = client.query_one(&sql, &[]).await else {
                return json!({"error": "query failed"});
            };
            let reached: Vec<i64> = (0..5).map(|i| row.get::<_, i64>(i)).collect();
            let cancelled: i64 = row.get(5);
            let failed: i64 = row.get(6);
            let unique_users: i64 = row.get(7);

            let ratio = |num: i64, den: i64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
            let step_conversion: Vec<f64> = (0..4).map(|i| ratio(reached[i + 1], reached[i])).collect();
            let drop_off: Vec<i64> = (0..4).map(|i| reached[i] - reached[i + 1]).collect();
            let overall_conversion = ratio(reached[4], reached[0]);

            json!({
                "days": days,
                "window": window,
                "reached_stage": {
                    "1": reached[0], "2": reached[1], "3": reached[2], "4": reached[3], "5": reached[4],
                },
                "cancelled": cancelled,
                "failed": failed,
                "unique_users": unique_users,
                "step_conversion": step_conversion,
                "overall_conversion": overall_conversion,
                "drop_off": drop_off,
            })
        })
        .await
    }

    /// Per-creator rollup within `days` days: highest stage reached, attempt
    /// count, and most recent flow status, optionally filtered to a single
    /// drop-off `stage` and capped at `limit` rows.
    pub async fn funnel_users(&self, days: i64, stage: Option<i32>, limit: i64) -> Value {
        let key = format!("funnel_users:{}:{:?}:{}", days, stage, limit);
        self.cached(key, async {
            let Ok(client) = self.db.pool().get().await else {
                return json!({"error": "database unavailable"});
            };
            let having = stage.map(|s| format!(" HAVING MAX(current_stage) = {}", s)).unwrap_or_default();
            let sql = format!(
                "SELECT user_id,
                        MAX(current_stage) AS max_stage,
                        COUNT(*) AS attempts,
                        (ARRAY_AGG(status ORDER BY updated_at DESC))[1] AS latest_status
                 FROM bot_flows
                 WHERE created_at >= now() - interval '{} days'
                 GROUP BY user_id
                 {}
                 ORDER BY max_stage DESC, attempts DESC
                 LIMIT {}",
                days, having, limit
            );
            let rows = client.query(&sql, &[]).await.unwrap_or_default();
            let users: Vec<Value> = rows
                .iter()
                .map(|r| {
                    let user_id: i64 = r.get(0);
                    let max_stage: i32 = r.get(1);
                    let attempts: i64 = r.get(2);
                    let latest_status: String = r.get(3);
                    json!({
                        "user_id": user_id,
                        "max_stage": max_stage,
                        "attempts": attempts,
                        "latest_status": latest_status,
                        "dropped_off": max_stage < 5,
                    })
                })
                .collect();
            json!({"users": users})
        })
        .await
    }

    /// Top distinct `metadata.error` values among `creation_failed` events in
    /// the last `days` days, most frequent first.
    pub async fn funnel_errors(&self, days: i64) -> Value {
        let key = format!("funnel_errors:{}", days);
        self.cached(key, async {
            let Ok(client) = self.db.pool().get().await else {
                return json!({"error": "database unavailable"});
            };
            let sql = format!(
                "SELECT metadata->>'error' AS err, COUNT(*) AS cnt
                 FROM funnel_events
                 WHERE event_type = 'creation_failed'
                   AND timestamp >= now() - interval '{} days'
                   AND metadata->>'error' IS NOT NULL
                 GROUP BY err
                 ORDER BY cnt DESC
                 LIMIT 10",
                days
            );
            let rows = client.query(&sql, &[]).await.unwrap_or_default();
            let errors: Vec<Value> = rows
                .iter()
                .map(|r| {
                    let error: String = r.get(0);
                    let count: i64 = r.get(1);
                    json!({"error": error, "count": count})
                })
                .collect();
            json!({"errors": errors})
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_ttl_is_one_minute() {
        assert_eq!(CACHE_TTL, Duration::from_secs(60));
    }
}
