//! Paper trades repository: trades closed by live sessions

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A closed paper trade. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PaperTradeRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub symbol: String,
    pub params_hash: String,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub margin_used: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
    pub balance_after: f64,
    pub reason: String,
}

/// Repository for paper-trading logs
pub struct PaperTradeRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PaperTradeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a trade (INSERT OR IGNORE: the same trade twice in a session is
    /// stored once). Returns the number of rows inserted.
    pub async fn save(&self, record: &PaperTradeRecord) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO paper_trades (
                session_id, symbol, params_hash, entry_time, exit_time,
                entry_price, exit_price, quantity, margin_used,
                gross_pnl, net_pnl, entry_fee, exit_fee, leverage,
                liquidation_price, balance_after, reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.symbol)
        .bind(&record.params_hash)
        .bind(record.entry_time)
        .bind(record.exit_time)
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.quantity)
        .bind(record.margin_used)
        .bind(record.gross_pnl)
        .bind(record.net_pnl)
        .bind(record.entry_fee)
        .bind(record.exit_fee)
        .bind(record.leverage)
        .bind(record.liquidation_price)
        .bind(record.balance_after)
        .bind(&record.reason)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All trades of a session in exit order
    pub async fn list_for_session(&self, session_id: &str) -> DbResult<Vec<PaperTradeRecord>> {
        let records = sqlx::query_as::<_, PaperTradeRecord>(
            r#"
            SELECT id, session_id, symbol, params_hash, entry_time, exit_time,
                   entry_price, exit_price, quantity, margin_used,
                   gross_pnl, net_pnl, entry_fee, exit_fee, leverage,
                   liquidation_price, balance_after, reason
            FROM paper_trades
            WHERE session_id = ?
            ORDER BY exit_time ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn trade(session: &str, entry_time: i64, exit_time: i64, net_pnl: f64) -> PaperTradeRecord {
        PaperTradeRecord {
            id: None,
            session_id: session.to_string(),
            symbol: "ADAUSDT".to_string(),
            params_hash: "abc".to_string(),
            entry_time,
            exit_time,
            entry_price: 0.45,
            exit_price: 0.448,
            quantity: 6000.0,
            margin_used: 950.0,
            gross_pnl: 12.0,
            net_pnl,
            entry_fee: 1.6,
            exit_fee: 1.6,
            leverage: 3.0,
            liquidation_price: Some(0.6),
            balance_after: 1000.0 + net_pnl,
            reason: "TakeProfit".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_and_list_in_exit_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = PaperTradeRepository::new(db.pool());

        repo.save(&trade("s1", 3_000, 4_000, 2.0)).await.unwrap();
        repo.save(&trade("s1", 1_000, 2_000, 8.8)).await.unwrap();
        repo.save(&trade("s2", 1_000, 2_000, -1.0)).await.unwrap();

        let trades = repo.list_for_session("s1").await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].exit_time, 2_000);
        assert_eq!(trades[1].exit_time, 4_000);
        assert_eq!(trades[0].liquidation_price, Some(0.6));
        assert!(repo.list_for_session("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_trade_ignored() {
        let db = Database::in_memory().await.unwrap();
        let repo = PaperTradeRepository::new(db.pool());

        assert_eq!(repo.save(&trade("s1", 1_000, 2_000, 8.8)).await.unwrap(), 1);
        assert_eq!(repo.save(&trade("s1", 1_000, 2_000, 8.8)).await.unwrap(), 0);

        let mut no_liq = trade("s1", 5_000, 6_000, -3.0);
        no_liq.liquidation_price = None;
        repo.save(&no_liq).await.unwrap();

        let trades = repo.list_for_session("s1").await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].liquidation_price, None);
    }
}
