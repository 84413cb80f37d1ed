pub mod bybit;

pub use bybit::{interval_minutes, BybitClient};
