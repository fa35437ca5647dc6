//! REST response types for the signed and administrative endpoints.
//!
//! Market data responses decode through `data::decode` instead; these
//! structs cover account, order, and exchange-metadata payloads that have
//! no canonical record form. Prices and quantities stay strings to
//! preserve exchange precision at this layer.

use serde::{Deserialize, Serialize};

/// Response from `/fapi/v1/time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    /// Server time in milliseconds since the Unix epoch.
    pub server_time: i64,
}

impl ServerTimeResponse {
    /// Guards against zero or negative timestamps from a broken proxy.
    pub fn is_valid(&self) -> bool {
        self.server_time > 0
    }
}

/// Order details returned by the order endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub client_order_id: String,
    pub price: String,
    #[serde(default)]
    pub avg_price: String,
    pub orig_qty: String,
    pub executed_qty: String,
    #[serde(default)]
    pub time_in_force: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub update_time: i64,
}

/// Response from `DELETE /fapi/v1/allOpenOrders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAllResponse {
    pub code: i64,
    pub msg: String,
}

/// One entry from `/fapi/v2/positionRisk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: String,
    pub liquidation_price: String,
    pub leverage: String,
    pub margin_type: String,
    pub mark_price: String,
}

/// Asset balance inside the account response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAsset {
    pub asset: String,
    pub wallet_balance: String,
    pub available_balance: String,
    pub unrealized_profit: String,
}

/// Response from `/fapi/v2/account`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub total_wallet_balance: String,
    pub total_unrealized_profit: String,
    pub total_margin_balance: String,
    pub available_balance: String,
    #[serde(default)]
    pub assets: Vec<AccountAsset>,
}

/// Symbol metadata inside the exchange info response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
}

/// Response from `/fapi/v1/exchangeInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub timezone: String,
    pub server_time: i64,
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

/// Response from `POST /fapi/v1/leverage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageResponse {
    pub leverage: u32,
    pub max_notional_value: String,
    pub symbol: String,
}

/// Error body shape: `{"code": -1121, "msg": "Invalid symbol."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}
