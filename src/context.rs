//! Context builder: a bounded, deterministic summary of a user's financial state.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;

use crate::error::EngineError;
use crate::store::{LedgerStore, PortfolioStore};
use crate::types::{available_capital, ModelConfig, Position, PositionStatus, UserProfile};

pub const MAX_ACTIVE_POSITIONS: usize = 20;
pub const HISTORY_WINDOW: usize = 50;
pub const HISTORY_IN_SUMMARY: usize = 10;

const RESPONSE_RULES: &str = r#"
You manage this user's simulated portfolio. Using the context you are given:
1. Reason over the available capital, the open positions and the recent trade history.
2. Respond with ONLY a JSON array of objects with the keys "action" ("buy" | "sell" | "hold"), "symbol" (ticker), "shares" (number), "reason" (short explanation) and "confidence" (0.0-1.0).
3. Never commit more than 80% of the available capital, and keep positions diversified.
4. If no action is warranted, return an empty array [].
5. If the response must be a JSON object, wrap the array as {"recommendations": [...]}.
"#;

/// Instruction prompt followed by the fixed response rules.
pub fn build_system_prompt(instructions: &str) -> String {
    format!("{}\n{}", instructions.trim(), RESPONSE_RULES)
}

/// A run needs botMode, a model configuration and a non-empty instruction prompt.
pub fn ensure_configured(user: &UserProfile) -> Result<(&ModelConfig, &str), EngineError> {
    if !user.bot_mode {
        return Err(EngineError::NotConfigured(format!(
            "botMode is disabled for {}",
            user.id
        )));
    }
    let model = user.model.as_ref().ok_or_else(|| {
        EngineError::NotConfigured(format!("no model configuration for {}", user.id))
    })?;
    let instructions = user
        .instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EngineError::NotConfigured(format!("no instruction prompt for {}", user.id))
        })?;
    Ok((model, instructions))
}

#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub generated_at: DateTime<Utc>,
    pub available_capital: f64,
    pub active_count: usize,
    /// Newest first, at most `MAX_ACTIVE_POSITIONS`.
    pub active_positions: Vec<Position>,
    /// Trades considered, at most `HISTORY_WINDOW`.
    pub history_window: usize,
    /// Newest first, at most `HISTORY_IN_SUMMARY`.
    pub recent_trades: Vec<Position>,
}

fn newest_first(positions: &mut [Position]) {
    positions.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn build_context<S>(store: &S, user: &str, now: DateTime<Utc>) -> Result<ContextSnapshot, EngineError>
where
    S: LedgerStore + PortfolioStore,
{
    let ledger = store.list_by_user(user).map_err(EngineError::store)?;

    let mut active = store.list_active_by_user(user).map_err(EngineError::store)?;
    let active_count = active.len();
    newest_first(&mut active);
    active.truncate(MAX_ACTIVE_POSITIONS);

    let mut history = store.history_by_user(user).map_err(EngineError::store)?;
    newest_first(&mut history);
    history.truncate(HISTORY_WINDOW);
    let history_window = history.len();
    history.truncate(HISTORY_IN_SUMMARY);

    Ok(ContextSnapshot {
        generated_at: now,
        available_capital: available_capital(&ledger),
        active_count,
        active_positions: active,
        history_window,
        recent_trades: history,
    })
}

impl ContextSnapshot {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Current time: {}",
            self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "Available capital: ${:.2}", self.available_capital);

        let _ = writeln!(out, "\nActive positions ({}):", self.active_count);
        if self.active_positions.is_empty() {
            out.push_str("  none\n");
        }
        for p in &self.active_positions {
            let _ = writeln!(
                out,
                "  {} - {} shares @ ${:.2} (current: ${:.2}, P/L: ${:.2} / {:+.2}%)",
                p.symbol,
                p.signed_shares(),
                p.buy_price,
                p.current_price,
                p.profit_loss,
                p.profit_loss_pct
            );
        }

        let _ = writeln!(
            out,
            "\nRecent trades ({} of last {}):",
            self.recent_trades.len(),
            self.history_window
        );
        if self.recent_trades.is_empty() {
            out.push_str("  none\n");
        }
        for p in &self.recent_trades {
            let status = match p.status {
                PositionStatus::Active => "active",
                PositionStatus::Closed => "closed",
            };
            let _ = writeln!(
                out,
                "  {} {} {} shares @ ${:.2} [{}] P/L: ${:.2}",
                p.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                p.symbol,
                p.signed_shares(),
                p.buy_price,
                status,
                p.profit_loss
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::types::{BackendKind, Direction, Flow, LedgerEntry};
    use chrono::{Duration, TimeZone};

    fn user() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            name: "Ada".into(),
            bot_mode: true,
            admin: false,
            model: Some(ModelConfig {
                kind: BackendKind::LocalServer,
                api_key: None,
                base_url: None,
                model: "llama3".into(),
                temperature: 0.3,
            }),
            instructions: Some("Prefer dividend stocks.".into()),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_pieces_are_not_configured() {
        let mut u = user();
        u.bot_mode = false;
        assert!(matches!(ensure_configured(&u), Err(EngineError::NotConfigured(_))));

        let mut u = user();
        u.model = None;
        assert!(matches!(ensure_configured(&u), Err(EngineError::NotConfigured(_))));

        let mut u = user();
        u.instructions = Some("  ".into());
        assert!(matches!(ensure_configured(&u), Err(EngineError::NotConfigured(_))));

        assert!(ensure_configured(&user()).is_ok());
    }

    #[test]
    fn system_prompt_carries_instructions_and_rules() {
        let p = build_system_prompt("  Prefer dividend stocks. ");
        assert!(p.starts_with("Prefer dividend stocks.\n"));
        assert!(p.contains("80%"));
        assert!(p.contains("\"confidence\""));
        assert!(p.contains("empty array"));
    }

    #[test]
    fn context_is_bounded_and_newest_first() {
        let store = FileStore::in_memory();
        store
            .append(LedgerEntry::new("u1", Flow::Inflow, 1000.0, "deposit".into()))
            .unwrap();
        let base = fixed_now() - Duration::days(30);
        for i in 0..25 {
            let mut p = Position::open("u1", &format!("S{i:02}"), Direction::Long, 1.0, 10.0);
            p.created_at = base + Duration::hours(i);
            store.create(p).unwrap();
        }

        let ctx = build_context(&store, "u1", fixed_now()).unwrap();
        assert_eq!(ctx.available_capital, 1000.0);
        assert_eq!(ctx.active_count, 25);
        assert_eq!(ctx.active_positions.len(), MAX_ACTIVE_POSITIONS);
        assert_eq!(ctx.active_positions[0].symbol, "S24");
        assert_eq!(ctx.history_window, 25);
        assert_eq!(ctx.recent_trades.len(), HISTORY_IN_SUMMARY);
        assert_eq!(ctx.recent_trades[9].symbol, "S15");
    }

    #[test]
    fn rendering_is_deterministic() {
        let store = FileStore::in_memory();
        store
            .append(LedgerEntry::new("u1", Flow::Inflow, 500.0, "deposit".into()))
            .unwrap();
        let mut p = Position::open("u1", "TSLA", Direction::Short, 2.0, 200.0);
        p.created_at = fixed_now() - Duration::days(1);
        store.create(p).unwrap();

        let a = build_context(&store, "u1", fixed_now()).unwrap().render();
        let b = build_context(&store, "u1", fixed_now()).unwrap().render();
        assert_eq!(a, b);
        assert!(a.contains("Current time: 2026-10-18T12:00:00Z"));
        assert!(a.contains("Available capital: $500.00"));
        assert!(a.contains("TSLA - -2 shares @ $200.00"));
    }

    #[test]
    fn empty_user_renders_placeholders() {
        let store = FileStore::in_memory();
        let text = build_context(&store, "nobody", fixed_now()).unwrap().render();
        assert!(text.contains("Active positions (0):\n  none"));
        assert!(text.contains("Recent trades (0 of last 0):\n  none"));
    }
}
