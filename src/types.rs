//! Core domain types for positions, ledger entries, recommendations and user settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }
}

/// Long positions profit when the price rises, shorts when it falls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: String,
    pub user: String,
    pub symbol: String,
    pub direction: Direction,
    /// Unsigned share magnitude; the sign lives in `direction`.
    pub quantity: f64,
    pub buy_price: f64,
    pub current_price: f64,
    pub total_invested: f64,
    pub current_value: f64,
    pub profit_loss: f64,
    pub profit_loss_pct: f64,
    pub status: PositionStatus,
    pub close_price: Option<f64>,
    pub close_date: Option<DateTime<Utc>>,
    pub journal: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Position {
    /// Fresh position at `price`; P/L starts at zero.
    pub fn open(user: &str, symbol: &str, direction: Direction, quantity: f64, price: f64) -> Self {
        let gross = quantity * price;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_string(),
            symbol: symbol.to_string(),
            direction,
            quantity,
            buy_price: price,
            current_price: price,
            total_invested: gross,
            current_value: gross,
            profit_loss: 0.0,
            profit_loss_pct: 0.0,
            status: PositionStatus::Active,
            close_price: None,
            close_date: None,
            journal: None,
            created_at: Utc::now(),
        }
    }

    /// Positive for longs, negative for shorts.
    pub fn signed_shares(&self) -> f64 {
        match self.direction {
            Direction::Long => self.quantity,
            Direction::Short => -self.quantity,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Recompute value and P/L at `price`. Short P/L is inverted.
    pub fn revalue(&mut self, price: f64) {
        self.current_price = price;
        self.total_invested = self.quantity * self.buy_price;
        self.current_value = self.quantity * price;
        self.profit_loss = match self.direction {
            Direction::Long => self.current_value - self.total_invested,
            Direction::Short => self.total_invested - self.current_value,
        };
        self.profit_loss_pct = if self.total_invested > 0.0 {
            self.profit_loss / self.total_invested * 100.0
        } else {
            0.0
        };
    }
}

/// Partial update applied by `PortfolioStore::update`.
#[derive(Debug, Clone, Default)]
pub struct PositionPatch {
    pub quantity: Option<f64>,
    pub current_price: Option<f64>,
    pub status: Option<PositionStatus>,
    pub close_price: Option<f64>,
    pub close_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Inflow,
    Outflow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: String,
    pub user: String,
    pub flow: Flow,
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub memo: String,
    pub counterparty: Option<String>,
    pub journal: Option<String>,
}

impl LedgerEntry {
    pub fn new(user: &str, flow: Flow, amount: f64, memo: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_string(),
            flow,
            amount,
            date: Utc::now(),
            memo,
            counterparty: None,
            journal: None,
        }
    }

    /// Contribution to available capital.
    pub fn signed_amount(&self) -> f64 {
        match self.flow {
            Flow::Inflow => self.amount,
            Flow::Outflow => -self.amount,
        }
    }
}

/// Σ inflows − Σ outflows.
pub fn available_capital(entries: &[LedgerEntry]) -> f64 {
    entries.iter().map(LedgerEntry::signed_amount).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub action: Action,
    pub symbol: String,
    pub shares: f64,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTally {
    pub success: u32,
    pub failed: u32,
    /// (symbol, message) per failed recommendation.
    pub errors: Vec<(String, String)>,
}

impl ExecutionTally {
    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self, symbol: &str, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push((symbol.to_string(), message.into()));
    }

    /// "3 successful, 1 failed" plus the failure reasons.
    pub fn summary(&self) -> String {
        let mut out = format!("{} successful, {} failed", self.success, self.failed);
        for (symbol, msg) in &self.errors {
            out.push_str(&format!("\n  - {symbol}: {msg}"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    HostedApi,
    LocalServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: BackendKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_temperature() -> f64 {
    0.7
}

/// Process-wide commission percentages, read fresh for every execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CommissionSettings {
    pub buy_pct: f64,
    pub sell_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bot_mode: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl UserProfile {
    /// botMode on, a model configured and a non-empty instruction prompt.
    pub fn is_eligible(&self) -> bool {
        self.bot_mode
            && self.model.is_some()
            && self
                .instructions
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
    }
}
