//! Database schema definitions

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Best parameters found by each optimization run
CREATE TABLE IF NOT EXISTS optimization_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    search_mode TEXT NOT NULL,
    strategy_kind TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    params_json TEXT NOT NULL,
    summary_json TEXT NOT NULL,
    final_balance REAL NOT NULL,
    total_trades INTEGER NOT NULL DEFAULT 0,
    trials INTEGER NOT NULL DEFAULT 0,
    bars INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

-- Trades closed by paper-trading sessions (times in epoch milliseconds)
CREATE TABLE IF NOT EXISTS paper_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    entry_time INTEGER NOT NULL,
    exit_time INTEGER NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    quantity REAL NOT NULL,
    margin_used REAL NOT NULL,
    gross_pnl REAL NOT NULL,
    net_pnl REAL NOT NULL,
    entry_fee REAL NOT NULL,
    exit_fee REAL NOT NULL,
    leverage REAL NOT NULL,
    liquidation_price REAL,
    balance_after REAL NOT NULL,
    reason TEXT NOT NULL,
    created_at INTEGER DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    UNIQUE (session_id, entry_time, exit_time)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_runs_market ON optimization_runs(symbol, interval, id DESC);
CREATE INDEX IF NOT EXISTS idx_runs_hash ON optimization_runs(params_hash);
CREATE INDEX IF NOT EXISTS idx_paper_session ON paper_trades(session_id, exit_time)
"#;
