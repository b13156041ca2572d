//! Fleet runner: the single-user pipeline over every eligible user, one at a time.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use crate::audit::{render_narrative, AuditRecord, UserSection, ORIGIN_FLEET};
use crate::error::{EngineError, ErrorCategory};
use crate::orchestrator::Orchestrator;
use crate::quotes::QuoteProvider;
use crate::store::AdvisorStore;
use crate::types::{ExecutionTally, UserProfile};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserResult {
    pub user: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<ExecutionTally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

/// Counts of users, not of recommendations.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FleetSummary {
    pub total_users: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub results: Vec<UserResult>,
    pub summary: FleetSummary,
    /// Set when the abort flag stopped the run early.
    pub aborted: bool,
    pub audit_id: Option<String>,
}

impl FleetReport {
    /// Users processed vs. operations executed.
    pub fn headline(&self) -> String {
        let ops: u32 = self
            .results
            .iter()
            .filter_map(|r| r.tally.as_ref())
            .map(|t| t.success)
            .sum();
        format!(
            "{} users processed ({} ok, {} failed), {} operations executed",
            self.summary.total_users, self.summary.successful, self.summary.failed, ops
        )
    }
}

pub struct FleetRunner<'a, S, Q: ?Sized> {
    orchestrator: Orchestrator<'a, S, Q>,
}

impl<'a, S, Q> FleetRunner<'a, S, Q>
where
    S: AdvisorStore,
    Q: QuoteProvider + ?Sized,
{
    pub fn new(orchestrator: Orchestrator<'a, S, Q>) -> Self {
        Self { orchestrator }
    }

    /// `abort` is checked between users, never inside one user's run.
    pub async fn run_all(
        &self,
        caller: &UserProfile,
        abort: &AtomicBool,
    ) -> Result<FleetReport, EngineError> {
        if !caller.admin {
            return Err(EngineError::Unauthorized(format!(
                "{} may not run the fleet",
                caller.id
            )));
        }
        let store = self.orchestrator.store;
        let users = store.list_eligible_users().map_err(EngineError::store)?;
        info!("fleet run by {}: {} eligible users", caller.id, users.len());

        let now = Utc::now();
        let mut results = Vec::with_capacity(users.len());
        let mut sections = Vec::with_capacity(users.len());
        let mut aborted = false;

        for user in &users {
            if abort.load(Ordering::SeqCst) {
                warn!("fleet run aborted before {}", user.id);
                aborted = true;
                break;
            }
            match self.orchestrator.run_profile(user, Utc::now()).await {
                Ok(report) => {
                    sections.push(report.section());
                    results.push(UserResult {
                        user: user.id.clone(),
                        success: true,
                        message: Some(report.message()),
                        tally: Some(report.tally),
                        error: None,
                        category: None,
                    });
                }
                Err(e) => {
                    error!("[{}] fleet run failed ({:?}): {}", user.id, e.category(), e);
                    sections.push(UserSection {
                        user: user.id.clone(),
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                    results.push(UserResult {
                        user: user.id.clone(),
                        success: false,
                        message: None,
                        tally: None,
                        error: Some(e.to_string()),
                        category: Some(e.category()),
                    });
                }
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        let summary = FleetSummary {
            total_users: results.len(),
            successful,
            failed: results.len() - successful,
        };

        let record = AuditRecord::new(ORIGIN_FLEET, render_narrative(users.len(), &sections, now));
        let audit_id = Some(record.id.clone());
        let audit_id = match store.write_audit(record) {
            Ok(()) => audit_id,
            Err(e) => {
                error!("fleet audit write failed: {:#}", e);
                None
            }
        };

        let report = FleetReport {
            results,
            summary,
            aborted,
            audit_id,
        };
        info!("{}", report.headline());
        Ok(report)
    }
}
