//! REST gateway: signed/unsigned request building, rate limiting, and
//! response classification.

pub mod client;
pub mod types;

pub use client::{normalize_symbol, RestClient};
pub use types::{
    AccountAsset, AccountInfo, CancelAllResponse, ExchangeInfo, LeverageResponse, OrderResponse,
    PositionRisk, ServerTimeResponse, SymbolInfo,
};
