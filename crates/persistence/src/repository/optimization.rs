//! Optimization runs repository: best parameters per search

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Best result of one optimization run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptimizationRunRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub symbol: String,
    pub interval: String,
    pub search_mode: String,
    pub strategy_kind: String,
    pub params_hash: String,
    pub params_json: String,
    pub summary_json: String,
    pub final_balance: f64,
    pub total_trades: i64,
    pub trials: i64,
    pub bars: i64,
    pub created_at: Option<i64>,
}

/// Repository for optimization results
pub struct OptimizationRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OptimizationRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, record: &OptimizationRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO optimization_runs (
                run_id, symbol, interval, search_mode, strategy_kind,
                params_hash, params_json, summary_json,
                final_balance, total_trades, trials, bars
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.symbol)
        .bind(&record.interval)
        .bind(&record.search_mode)
        .bind(&record.strategy_kind)
        .bind(&record.params_hash)
        .bind(&record.params_json)
        .bind(&record.summary_json)
        .bind(record.final_balance)
        .bind(record.total_trades)
        .bind(record.trials)
        .bind(record.bars)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent run for a market, if any
    pub async fn latest_for(
        &self,
        symbol: &str,
        interval: &str,
    ) -> DbResult<Option<OptimizationRunRecord>> {
        let record = sqlx::query_as::<_, OptimizationRunRecord>(
            r#"
            SELECT id, run_id, symbol, interval, search_mode, strategy_kind,
                   params_hash, params_json, summary_json,
                   final_balance, total_trades, trials, bars, created_at
            FROM optimization_runs
            WHERE symbol = ? AND interval = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(interval)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Newest runs first
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<OptimizationRunRecord>> {
        let records = sqlx::query_as::<_, OptimizationRunRecord>(
            r#"
            SELECT id, run_id, symbol, interval, search_mode, strategy_kind,
                   params_hash, params_json, summary_json,
                   final_balance, total_trades, trials, bars, created_at
            FROM optimization_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(run_id: &str, symbol: &str, final_balance: f64) -> OptimizationRunRecord {
        OptimizationRunRecord {
            id: None,
            run_id: run_id.to_string(),
            symbol: symbol.to_string(),
            interval: "1".to_string(),
            search_mode: "grid".to_string(),
            strategy_kind: "trend_filter".to_string(),
            params_hash: format!("hash-{run_id}"),
            params_json: r#"{"sma_period":50}"#.to_string(),
            summary_json: "{}".to_string(),
            final_balance,
            total_trades: 12,
            trials: 72,
            bars: 10_000,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_latest_for() {
        let db = Database::in_memory().await.unwrap();
        let repo = OptimizationRepository::new(db.pool());

        assert!(repo.latest_for("ADAUSDT", "1").await.unwrap().is_none());

        repo.save(&record("r1", "ADAUSDT", 1010.0)).await.unwrap();
        repo.save(&record("r2", "BTCUSDT", 990.0)).await.unwrap();
        repo.save(&record("r3", "ADAUSDT", 1005.0)).await.unwrap();

        let latest = repo.latest_for("ADAUSDT", "1").await.unwrap().unwrap();
        assert_eq!(latest.run_id, "r3");
        assert_eq!(latest.final_balance, 1005.0);
        assert_eq!(latest.params_json, r#"{"sma_period":50}"#);
        assert!(latest.created_at.is_some());

        assert!(repo.latest_for("ADAUSDT", "5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = OptimizationRepository::new(db.pool());
        for i in 0..5 {
            repo.save(&record(&format!("r{i}"), "ADAUSDT", 1000.0 + i as f64))
                .await
                .unwrap();
        }

        let recent = repo.list_recent(3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
    }

    #[tokio::test]
    async fn test_duplicate_run_id_rejected() {
        let db = Database::in_memory().await.unwrap();
        let repo = OptimizationRepository::new(db.pool());
        repo.save(&record("same", "ADAUSDT", 1000.0)).await.unwrap();
        assert!(repo.save(&record("same", "ADAUSDT", 1001.0)).await.is_err());
    }
}
