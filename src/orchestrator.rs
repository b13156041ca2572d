//! Single-user pipeline: context -> model -> parser -> executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::{render_narrative, AuditRecord, UserSection, ORIGIN_SINGLE_USER};
use crate::backend::BackendFactory;
use crate::config::AppConfig;
use crate::context::{build_context, build_system_prompt, ensure_configured};
use crate::engine::Executor;
use crate::error::{EngineError, ErrorCategory};
use crate::parser::parse_recommendations;
use crate::quotes::QuoteProvider;
use crate::store::AdvisorStore;
use crate::types::{ExecutionTally, Recommendation, UserProfile};

/// Always populated, even on success, so a run can be reproduced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebugTrace {
    pub model: String,
    pub system_prompt: String,
    pub context: String,
    pub raw_response: String,
    pub error: Option<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub user: String,
    pub recommendations: Vec<Recommendation>,
    pub tally: ExecutionTally,
    pub debug: DebugTrace,
}

impl RunReport {
    pub fn message(&self) -> String {
        if self.recommendations.is_empty() {
            return match &self.debug.error {
                Some(e) => format!("no recommendations ({e})"),
                None => "no recommendations".to_string(),
            };
        }
        format!(
            "{} recommendations: {}",
            self.recommendations.len(),
            self.tally.summary()
        )
    }

    pub fn section(&self) -> UserSection {
        UserSection {
            user: self.user.clone(),
            debug: Some(self.debug.clone()),
            recommendations: self.recommendations.clone(),
            tally: Some(self.tally.clone()),
            error: None,
        }
    }
}

pub struct Orchestrator<'a, S, Q: ?Sized> {
    pub(crate) store: &'a S,
    quotes: &'a Q,
    backends: &'a dyn BackendFactory,
    cfg: &'a AppConfig,
}

impl<'a, S, Q> Orchestrator<'a, S, Q>
where
    S: AdvisorStore,
    Q: QuoteProvider + ?Sized,
{
    pub fn new(
        store: &'a S,
        quotes: &'a Q,
        backends: &'a dyn BackendFactory,
        cfg: &'a AppConfig,
    ) -> Self {
        Self {
            store,
            quotes,
            backends,
            cfg,
        }
    }

    /// Standalone run for one user; writes its own audit record.
    pub async fn run(&self, user_id: &str) -> Result<RunReport, EngineError> {
        let user = self
            .store
            .find_user(user_id)
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::UnknownUser(user_id.to_string()))?;

        let now = Utc::now();
        let result = self.run_profile(&user, now).await;
        let section = match &result {
            Ok(report) => report.section(),
            Err(e) => UserSection {
                user: user.id.clone(),
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        let body = render_narrative(usize::from(user.is_eligible()), &[section], now);
        if let Err(e) = self
            .store
            .write_audit(AuditRecord::new(ORIGIN_SINGLE_USER, body))
        {
            error!("[{}] audit write failed: {:#}", user.id, e);
        }
        result
    }

    /// The pipeline without auditing. Backend-category failures from the model
    /// degrade to an empty list; anything else ends the run with an error.
    pub async fn run_profile(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<RunReport, EngineError> {
        let (model_cfg, instructions) = ensure_configured(user)?;
        let backend = self.backends.backend_for(model_cfg)?;

        let context = build_context(self.store, &user.id, now)?.render();
        let mut trace = DebugTrace {
            model: backend.model_name().to_string(),
            system_prompt: build_system_prompt(instructions),
            context,
            ..Default::default()
        };

        info!("[{}] asking {} for recommendations", user.id, trace.model);
        let answer = match backend.generate(&trace.system_prompt, &trace.context).await {
            Ok(raw) => {
                let parsed =
                    parse_recommendations(&raw, self.cfg.backend.max_recommendations);
                trace.raw_response = raw;
                parsed
            }
            Err(e) => Err(e),
        };
        let recommendations = match answer {
            Ok(recs) => recs,
            Err(e) if e.category() == ErrorCategory::Backend => {
                warn!("[{}] degrading to no recommendations: {}", user.id, e);
                trace.error = Some(e.to_string());
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut tally = ExecutionTally::default();
        if recommendations.is_empty() {
            info!("[{}] nothing to execute", user.id);
        } else if self.cfg.exec.dry_run {
            info!(
                "[DRY-RUN] [{}] {} recommendations not executed",
                user.id,
                recommendations.len()
            );
            trace.notes.push("dry run: executions skipped".to_string());
        } else {
            let executor = Executor::new(self.store, self.quotes);
            for rec in &recommendations {
                match executor.execute(&user.id, rec).await {
                    Ok(_) => tally.record_success(),
                    Err(e) => {
                        warn!(
                            "[{}] {} {:?} failed ({:?}): {}",
                            user.id,
                            rec.symbol,
                            rec.action,
                            e.category(),
                            e
                        );
                        tally.record_failure(&rec.symbol, e.to_string());
                    }
                }
            }
        }

        let report = RunReport {
            user: user.id.clone(),
            recommendations,
            tally,
            debug: trace,
        };
        info!("[{}] {}", user.id, report.message());
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::ModelBackend;
    use crate::quotes::StaticQuotes;
    use crate::store::{FileStore, LedgerStore, PortfolioStore};
    use crate::types::{
        Action, BackendKind, CommissionSettings, Flow, LedgerEntry, ModelConfig, PositionStatus,
    };
    use crate::utils::approx_eq;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Replies with a canned response per model name; unknown models are unreachable.
    pub(crate) struct ScriptedBackend {
        model: String,
        reply: Result<String, EngineError>,
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn model_name(&self) -> &str {
            &self.model
        }

        async fn generate(&self, _system: &str, _context: &str) -> Result<String, EngineError> {
            self.reply.clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedBackends {
        pub replies: HashMap<String, Result<String, EngineError>>,
        /// Models whose backend cannot even be constructed.
        pub refused: Vec<String>,
    }

    impl ScriptedBackends {
        pub fn reply(mut self, model: &str, raw: &str) -> Self {
            self.replies.insert(model.to_string(), Ok(raw.to_string()));
            self
        }

        pub fn fail(mut self, model: &str, err: EngineError) -> Self {
            self.replies.insert(model.to_string(), Err(err));
            self
        }

        pub fn refuse(mut self, model: &str) -> Self {
            self.refused.push(model.to_string());
            self
        }
    }

    impl BackendFactory for ScriptedBackends {
        fn backend_for(&self, model: &ModelConfig) -> Result<Box<dyn ModelBackend>, EngineError> {
            if self.refused.contains(&model.model) {
                return Err(EngineError::BackendUnreachable(format!(
                    "{} refused connection",
                    model.model
                )));
            }
            let reply = self.replies.get(&model.model).cloned().unwrap_or_else(|| {
                Err(EngineError::BackendUnreachable(format!(
                    "no script for {}",
                    model.model
                )))
            });
            Ok(Box::new(ScriptedBackend {
                model: model.model.clone(),
                reply,
            }))
        }
    }

    pub(crate) fn bot_user(id: &str, model: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: id.to_uppercase(),
            bot_mode: true,
            admin: false,
            model: Some(ModelConfig {
                kind: BackendKind::LocalServer,
                api_key: None,
                base_url: None,
                model: model.to_string(),
                temperature: 0.2,
            }),
            instructions: Some("Grow capital carefully.".into()),
        }
    }

    pub(crate) fn seeded_store(users: &[UserProfile]) -> FileStore {
        let store = FileStore::in_memory();
        store
            .set_commission(CommissionSettings {
                buy_pct: 1.0,
                sell_pct: 2.0,
            })
            .unwrap();
        for u in users {
            store.upsert_user(u.clone()).unwrap();
            store
                .append(LedgerEntry::new(&u.id, Flow::Inflow, 1000.0, "deposit".into()))
                .unwrap();
        }
        store
    }

    const BUY_AAPL: &str =
        r#"[{"action":"buy","symbol":"AAPL","shares":5,"reason":"x","confidence":0.8}]"#;

    #[tokio::test]
    async fn buy_then_sell_scenario() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let mut quotes = StaticQuotes::default();
        quotes.set("AAPL", 100.0);

        let backends = ScriptedBackends::default().reply("m1", BUY_AAPL);
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!(report.tally.success, 1);
        assert_eq!(report.tally.failed, 0);
        assert_eq!(report.debug.model, "m1");
        assert!(report.debug.system_prompt.starts_with("Grow capital carefully."));
        assert_eq!(report.debug.raw_response, BUY_AAPL);
        assert!(report.debug.error.is_none());

        let p = &store.list_active_by_user("u1").unwrap()[0];
        assert_eq!((p.quantity, p.buy_price, p.total_invested), (5.0, 100.0, 500.0));
        let outflow = store.list_by_user("u1").unwrap().pop().unwrap();
        assert_eq!(outflow.flow, Flow::Outflow);
        assert!(approx_eq(outflow.amount, 505.0));

        quotes.set("AAPL", 120.0);
        let backends = ScriptedBackends::default().reply(
            "m1",
            r#"[{"action":"sell","symbol":"AAPL","shares":5,"reason":"take profit","confidence":0.9}]"#,
        );
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!(report.tally.success, 1);
        let inflow = store.list_by_user("u1").unwrap().pop().unwrap();
        assert_eq!(inflow.flow, Flow::Inflow);
        assert!((inflow.amount - 588.0).abs() < 1e-6);
        let closed = &store.history_by_user("u1").unwrap()[0];
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_price, Some(120.0));

        assert_eq!(store.audit_log().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_list_short_circuits() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().reply("m1", "[]");
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run_profile(&bot_user("u1", "m1"), Utc::now())
            .await
            .unwrap();
        assert_eq!((report.tally.success, report.tally.failed), (0, 0));
        assert!(store.history_by_user("u1").unwrap().is_empty());
        assert_eq!(store.list_by_user("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_degrades_to_empty() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().reply("m1", "I think you should buy AAPL");
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!((report.tally.success, report.tally.failed), (0, 0));
        assert!(report.recommendations.is_empty());
        assert!(!report.debug.error.as_deref().unwrap_or_default().is_empty());
        assert_eq!(report.debug.raw_response, "I think you should buy AAPL");
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_empty() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().fail(
            "m1",
            EngineError::BackendError {
                status: 503,
                body: "overloaded".into(),
            },
        );
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!(report.tally, ExecutionTally::default());
        assert_eq!(
            report.debug.error.as_deref(),
            Some("backend returned 503: overloaded")
        );
        assert!(report.message().starts_with("no recommendations"));
    }

    #[tokio::test]
    async fn configuration_error_from_model_fails_the_run() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().fail(
            "m1",
            EngineError::NotConfigured("api key revoked".into()),
        );
        let err = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(store.list_active_by_user("u1").unwrap().is_empty());
        let audit = store.audit_log().unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].body.contains("not run (not configured: api key revoked)"));
    }

    #[tokio::test]
    async fn missing_quote_counts_one_failure() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().reply("m1", BUY_AAPL);
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!((report.tally.success, report.tally.failed), (0, 1));
        assert_eq!(report.tally.errors[0].0, "AAPL");
        assert!(report.tally.errors[0].1.contains("no quote"));
        assert!(store.history_by_user("u1").unwrap().is_empty());
        assert_eq!(store.list_by_user("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_failure_keeps_going() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let cfg = AppConfig::default();
        let mut quotes = StaticQuotes::default();
        quotes.set("AAPL", 100.0);
        quotes.set("MSFT", 50.0);
        let raw = r#"{"recommendations":[
            {"action":"buy","symbol":"AAPL","shares":1},
            {"action":"sell","symbol":"AAPL","shares":10},
            {"action":"hold","symbol":"GOOG"},
            {"action":"buy","symbol":"MSFT","shares":2}
        ]}"#;
        let backends = ScriptedBackends::default().reply("m1", raw);
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!(report.recommendations.len(), 4);
        assert_eq!((report.tally.success, report.tally.failed), (3, 1));
        assert_eq!(report.tally.errors[0].0, "AAPL");
        assert!(report.message().contains("3 successful, 1 failed"));
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let store = seeded_store(&[bot_user("u1", "m1")]);
        let mut cfg = AppConfig::default();
        cfg.exec.dry_run = true;
        let mut quotes = StaticQuotes::default();
        quotes.set("AAPL", 100.0);
        let backends = ScriptedBackends::default().reply("m1", BUY_AAPL);
        let report = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap();
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.recommendations[0].action, Action::Buy);
        assert_eq!(report.tally, ExecutionTally::default());
        assert_eq!(report.debug.notes, vec!["dry run: executions skipped".to_string()]);
        assert!(store.history_by_user("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_user_is_refused_and_audited() {
        let mut user = bot_user("u1", "m1");
        user.instructions = None;
        let store = seeded_store(&[user]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default().reply("m1", BUY_AAPL);
        let err = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("u1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured(_)));

        let audit = store.audit_log().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].origin, ORIGIN_SINGLE_USER);
        assert!(audit[0].body.contains("1. Eligible users found: 0"));
        assert!(audit[0].body.contains("not run (not configured"));
    }

    #[tokio::test]
    async fn unknown_user_errors() {
        let store = seeded_store(&[]);
        let cfg = AppConfig::default();
        let quotes = StaticQuotes::default();
        let backends = ScriptedBackends::default();
        let err = Orchestrator::new(&store, &quotes, &backends, &cfg)
            .run("ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownUser(_)));
    }
}
