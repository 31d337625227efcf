//! Post-session processing: summary building and exports.

use crate::model::{AggregateRequest, SessionStatus, SessionSummary, Tally};
use crate::session::SessionState;
use anyhow::{Context, Result};
use std::path::Path;

/// Build the final record of a session.
pub fn summarize(request: &AggregateRequest, state: &SessionState) -> SessionSummary {
    summarize_parts(
        request,
        state.status(),
        state.failure().map(|e| e.reason()),
        state.tally(),
    )
}

pub(crate) fn summarize_parts(
    request: &AggregateRequest,
    status: SessionStatus,
    reason: Option<String>,
    tally: &Tally,
) -> SessionSummary {
    SessionSummary {
        finished_at_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        file_path: request.file_path.clone(),
        keyword: request.keyword.clone(),
        top_n: request.top_n,
        status,
        reason,
        processed: tally.processed,
        total: tally.total,
        keywords: tally.keywords.clone(),
    }
}

/// Write the summary as pretty JSON, creating parent directories as needed.
pub fn export_json(path: &Path, summary: &SessionSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
