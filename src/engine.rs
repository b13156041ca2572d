//! Execution engine: applies one recommendation to the ledger and portfolio.
//!
//! Cash movements are commission-adjusted. Longs and shorts are tracked as
//! separate positions; a `sell` reduces or closes a long, or opens a short when
//! no long is held, and a `buy` covers an open short before opening a long.
//! Several lots of one symbol can be open at once; sells and covers are
//! checked against their total and consume them oldest first. A position
//! created by a failed execution is deleted again.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::quotes::QuoteProvider;
use crate::store::{LedgerStore, PortfolioStore, SettingsSource};
use crate::types::{
    Action, Direction, Flow, LedgerEntry, Position, PositionPatch, PositionStatus, Recommendation,
};

const SHARE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Held,
    OpenedLong,
    ReducedLong,
    ClosedLong,
    OpenedShort,
    ReducedShort,
    CoveredShort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    pub symbol: String,
    pub shares: f64,
    pub price: f64,
    pub commission: f64,
    /// Ledger movement, absent for holds.
    pub cash: Option<(Flow, f64)>,
}

impl ExecutionOutcome {
    fn held(symbol: &str) -> Self {
        Self {
            kind: OutcomeKind::Held,
            symbol: symbol.to_string(),
            shares: 0.0,
            price: 0.0,
            commission: 0.0,
            cash: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub updated: usize,
    /// Symbols with no quote; their prices were left alone.
    pub skipped: Vec<String>,
}

/// Buy-side cash: (gross, commission, total).
pub fn buy_cost(shares: f64, price: f64, buy_pct: f64) -> (f64, f64, f64) {
    let gross = shares * price;
    let commission = gross * (buy_pct / 100.0);
    (gross, commission, gross + commission)
}

/// Sell-side cash: (gross, commission, net).
pub fn sell_proceeds(shares: f64, price: f64, sell_pct: f64) -> (f64, f64, f64) {
    let gross = shares.abs() * price;
    let net = gross * (1.0 - sell_pct / 100.0);
    (gross, gross - net, net)
}

pub struct Executor<'a, S, Q: ?Sized> {
    store: &'a S,
    quotes: &'a Q,
}

impl<'a, S, Q> Executor<'a, S, Q>
where
    S: LedgerStore + PortfolioStore + SettingsSource,
    Q: QuoteProvider + ?Sized,
{
    pub fn new(store: &'a S, quotes: &'a Q) -> Self {
        Self { store, quotes }
    }

    pub async fn execute(
        &self,
        user: &str,
        rec: &Recommendation,
    ) -> Result<ExecutionOutcome, EngineError> {
        if rec.action != Action::Hold && !(rec.shares.is_finite() && rec.shares > 0.0) {
            return Err(EngineError::InvalidRecommendation(format!(
                "{}: shares must be > 0, got {}",
                rec.symbol, rec.shares
            )));
        }
        let outcome = match rec.action {
            Action::Hold => ExecutionOutcome::held(&rec.symbol),
            Action::Buy => self.buy(user, &rec.symbol, rec.shares).await?,
            Action::Sell => self.sell(user, &rec.symbol, rec.shares).await?,
        };
        info!(
            "[{}] {:?} {} x{} @ {:.2} (commission {:.2}, cash {:?})",
            user,
            outcome.kind,
            outcome.symbol,
            outcome.shares,
            outcome.price,
            outcome.commission,
            outcome.cash
        );
        Ok(outcome)
    }

    async fn quote(&self, symbol: &str) -> Result<f64, EngineError> {
        match self.quotes.get_price(symbol).await {
            Ok(Some(price)) => Ok(price),
            Ok(None) => Err(EngineError::QuoteUnavailable(symbol.to_string())),
            Err(e) => {
                warn!("quote lookup for {} failed: {:#}", symbol, e);
                Err(EngineError::QuoteUnavailable(symbol.to_string()))
            }
        }
    }

    fn find(&self, user: &str, symbol: &str, direction: Direction) -> Result<Option<Position>, EngineError> {
        self.store
            .find_active_by_symbol(user, symbol, direction)
            .map_err(EngineError::store)
    }

    fn lots(&self, user: &str, symbol: &str, direction: Direction) -> Result<Vec<Position>, EngineError> {
        self.store
            .list_active_lots(user, symbol, direction)
            .map_err(EngineError::store)
    }

    /// Refuse to take more than the lots hold in total.
    fn check_held(symbol: &str, lots: &[Position], shares: f64) -> Result<f64, EngineError> {
        let held: f64 = lots.iter().map(|p| p.quantity).sum();
        if shares > held + SHARE_EPSILON {
            return Err(EngineError::Oversell {
                symbol: symbol.to_string(),
                requested: shares,
                held,
            });
        }
        Ok(held)
    }

    fn commission(&self) -> Result<crate::types::CommissionSettings, EngineError> {
        self.store.commission().map_err(EngineError::store)
    }

    async fn buy(&self, user: &str, symbol: &str, shares: f64) -> Result<ExecutionOutcome, EngineError> {
        if self.find(user, symbol, Direction::Short)?.is_some() {
            return self.cover(user, symbol, shares).await;
        }

        let price = self.quote(symbol).await?;
        let fees = self.commission()?;
        let (_, commission, total_cost) = buy_cost(shares, price, fees.buy_pct);

        let position = Position::open(user, symbol, Direction::Long, shares, price);
        let position_id = self.store.create(position).map_err(EngineError::store)?;

        let memo = format!(
            "BUY {shares} {symbol} @ {price:.2} (commission {commission:.2})"
        );
        self.append_after_position(user, Flow::Outflow, total_cost, memo, &position_id)?;

        Ok(ExecutionOutcome {
            kind: OutcomeKind::OpenedLong,
            symbol: symbol.to_string(),
            shares,
            price,
            commission,
            cash: Some((Flow::Outflow, total_cost)),
        })
    }

    async fn sell(&self, user: &str, symbol: &str, shares: f64) -> Result<ExecutionOutcome, EngineError> {
        if self.find(user, symbol, Direction::Long)?.is_none() {
            return self.open_short(user, symbol, shares).await;
        }
        let lots = self.lots(user, symbol, Direction::Long)?;
        let held = Self::check_held(symbol, &lots, shares)?;

        let price = self.quote(symbol).await?;
        let fees = self.commission()?;
        let (_, commission, net) = sell_proceeds(shares, price, fees.sell_pct);

        let memo = format!("SELL {shares} {symbol} @ {price:.2} (commission {commission:.2})");
        self.store
            .append(LedgerEntry::new(user, Flow::Inflow, net, memo))
            .map_err(EngineError::store)?;

        self.consume(user, &lots, shares, price)?;
        let kind = if (held - shares).abs() <= SHARE_EPSILON {
            OutcomeKind::ClosedLong
        } else {
            OutcomeKind::ReducedLong
        };

        Ok(ExecutionOutcome {
            kind,
            symbol: symbol.to_string(),
            shares,
            price,
            commission,
            cash: Some((Flow::Inflow, net)),
        })
    }

    async fn open_short(&self, user: &str, symbol: &str, shares: f64) -> Result<ExecutionOutcome, EngineError> {
        let price = self.quote(symbol).await?;
        let fees = self.commission()?;
        let (_, commission, net) = sell_proceeds(shares, price, fees.sell_pct);

        let position = Position::open(user, symbol, Direction::Short, shares, price);
        let position_id = self.store.create(position).map_err(EngineError::store)?;

        let memo = format!("SHORT {shares} {symbol} @ {price:.2} (commission {commission:.2})");
        self.append_after_position(user, Flow::Inflow, net, memo, &position_id)?;

        Ok(ExecutionOutcome {
            kind: OutcomeKind::OpenedShort,
            symbol: symbol.to_string(),
            shares,
            price,
            commission,
            cash: Some((Flow::Inflow, net)),
        })
    }

    async fn cover(&self, user: &str, symbol: &str, shares: f64) -> Result<ExecutionOutcome, EngineError> {
        let lots = self.lots(user, symbol, Direction::Short)?;
        let held = Self::check_held(symbol, &lots, shares)?;

        let price = self.quote(symbol).await?;
        let fees = self.commission()?;
        let (_, commission, total_cost) = buy_cost(shares, price, fees.buy_pct);

        let memo = format!("COVER {shares} {symbol} @ {price:.2} (commission {commission:.2})");
        self.store
            .append(LedgerEntry::new(user, Flow::Outflow, total_cost, memo))
            .map_err(EngineError::store)?;

        self.consume(user, &lots, shares, price)?;
        let kind = if (held - shares).abs() <= SHARE_EPSILON {
            OutcomeKind::CoveredShort
        } else {
            OutcomeKind::ReducedShort
        };

        Ok(ExecutionOutcome {
            kind,
            symbol: symbol.to_string(),
            shares,
            price,
            commission,
            cash: Some((Flow::Outflow, total_cost)),
        })
    }

    /// Take `shares` from the lots oldest first, closing each one it exhausts.
    fn consume(&self, user: &str, lots: &[Position], shares: f64, price: f64) -> Result<(), EngineError> {
        let mut left = shares;
        for lot in lots {
            if left <= SHARE_EPSILON {
                break;
            }
            let take = left.min(lot.quantity);
            self.shrink(user, lot, take, price)?;
            left -= take;
        }
        Ok(())
    }

    /// Close the position when `shares` covers it, otherwise cut its magnitude.
    fn shrink(&self, user: &str, position: &Position, shares: f64, price: f64) -> Result<(), EngineError> {
        let remaining = position.quantity - shares;
        let patch = if remaining.abs() <= SHARE_EPSILON {
            PositionPatch {
                current_price: Some(price),
                status: Some(PositionStatus::Closed),
                close_price: Some(price),
                close_date: Some(Utc::now()),
                ..Default::default()
            }
        } else {
            PositionPatch {
                quantity: Some(remaining),
                current_price: Some(price),
                ..Default::default()
            }
        };
        self.store.update(&position.id, &patch).map_err(|e| {
            error!(
                "[{}] ledger entry written but position {} ({}) not updated: {:#}",
                user, position.id, position.symbol, e
            );
            EngineError::store(e)
        })
    }

    /// Ledger write that follows a position create. On failure the position
    /// is deleted again so the execution leaves nothing behind.
    fn append_after_position(
        &self,
        user: &str,
        flow: Flow,
        amount: f64,
        memo: String,
        position_id: &str,
    ) -> Result<(), EngineError> {
        let Err(e) = self.store.append(LedgerEntry::new(user, flow, amount, memo)) else {
            return Ok(());
        };
        match self.store.delete(position_id) {
            Ok(()) => {
                warn!("[{}] ledger write failed, position {} removed: {:#}", user, position_id, e);
                Err(EngineError::Store(format!("ledger write failed: {e:#}")))
            }
            Err(undo) => {
                error!(
                    "[{}] position {} created but ledger entry failed ({:#}) and removal failed ({:#})",
                    user, position_id, e, undo
                );
                Err(EngineError::Store(format!(
                    "position {position_id} created without ledger entry: {e:#}"
                )))
            }
        }
    }

    /// Re-quote every active position and recompute value and P/L.
    pub async fn refresh_prices(&self, user: &str) -> Result<RefreshReport, EngineError> {
        let mut report = RefreshReport::default();
        let positions = self
            .store
            .list_active_by_user(user)
            .map_err(EngineError::store)?;
        for p in positions {
            match self.quote(&p.symbol).await {
                Ok(price) => {
                    let patch = PositionPatch {
                        current_price: Some(price),
                        ..Default::default()
                    };
                    self.store.update(&p.id, &patch).map_err(EngineError::store)?;
                    report.updated += 1;
                }
                Err(e) => {
                    warn!("[{}] price refresh skipped: {}", user, e);
                    report.skipped.push(p.symbol);
                }
            }
        }
        Ok(report)
    }
}
