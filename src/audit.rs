//! Audit records: one narrative log entry per run.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::orchestrator::DebugTrace;
use crate::types::{ExecutionTally, Recommendation};

pub const ORIGIN_SINGLE_USER: &str = "robo-advisor/single-user";
pub const ORIGIN_FLEET: &str = "robo-advisor/fleet";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

impl AuditRecord {
    pub fn new(origin: &str, body: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin: origin.to_string(),
            created_at: Utc::now(),
            body,
        }
    }
}

/// What one user's run contributes to the narrative.
#[derive(Debug, Clone, Default)]
pub struct UserSection {
    pub user: String,
    pub debug: Option<DebugTrace>,
    pub recommendations: Vec<Recommendation>,
    pub tally: Option<ExecutionTally>,
    pub error: Option<String>,
}

pub fn render_narrative(eligible: usize, sections: &[UserSection], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run at {}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(out, "1. Eligible users found: {eligible}");

    let mut total_ok = 0;
    for s in sections {
        let _ = writeln!(out, "\n=== User {} ===", s.user);

        out.push_str("2. Debug trace\n");
        match &s.debug {
            Some(d) => {
                let _ = writeln!(out, "   model: {}", d.model);
                let _ = writeln!(out, "   system prompt:\n{}", indent(&d.system_prompt));
                let _ = writeln!(out, "   raw response:\n{}", indent(&d.raw_response));
                let _ = writeln!(
                    out,
                    "   internal error: {}",
                    d.error.as_deref().unwrap_or("none")
                );
                for note in &d.notes {
                    let _ = writeln!(out, "   note: {note}");
                }
            }
            None => out.push_str("   (no backend call)\n"),
        }

        let _ = writeln!(out, "3. Parsed recommendations: {}", s.recommendations.len());
        let dump = serde_json::to_string_pretty(&s.recommendations)
            .unwrap_or_else(|e| format!("<unserializable: {e}>"));
        let _ = writeln!(out, "{}", indent(&dump));

        match (&s.tally, &s.error) {
            (Some(t), _) => {
                total_ok += t.success;
                let _ = writeln!(out, "4. Execution: {}", t.summary());
            }
            (None, Some(e)) => {
                let _ = writeln!(out, "4. Execution: not run ({e})");
            }
            (None, None) => out.push_str("4. Execution: not run\n"),
        }
    }

    let _ = writeln!(
        out,
        "\nSummary: {} users processed, {} successful operations",
        sections.len(),
        total_ok
    );
    out
}

fn indent(s: &str) -> String {
    s.lines()
        .map(|l| format!("      {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
