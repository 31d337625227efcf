//! Text summary builder for CLI output.
//!
//! This module formats human-readable lines for text mode.

use crate::model::{KeywordCount, SessionStatus, SessionSummary, Tally};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// One-line progress report, e.g. `Progress: 3/10 (30%) top: 丹药 7`.
pub(crate) fn progress_line(tally: &Tally) -> String {
    let mut line = format!(
        "Progress: {}/{} ({}%)",
        tally.processed,
        tally.total,
        tally.percent()
    );
    if let Some(top) = tally.keywords.first() {
        line.push_str(&format!(" top: {} {}", top.word, top.count));
    }
    line
}

fn ranked_table(keywords: &[KeywordCount]) -> Vec<String> {
    let width = keywords
        .iter()
        .map(|k| k.word.chars().count())
        .max()
        .unwrap_or(0);
    keywords
        .iter()
        .enumerate()
        .map(|(i, k)| {
            let pad = width.saturating_sub(k.word.chars().count());
            format!("{:>3}. {}{} {:>8}", i + 1, k.word, " ".repeat(pad), k.count)
        })
        .collect()
}

/// Build the final text summary of a session.
pub(crate) fn build_text_summary(summary: &SessionSummary) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("File: {}", summary.file_path));
    lines.push(format!("Keyword: {} (top {})", summary.keyword, summary.top_n));

    let tally = Tally {
        processed: summary.processed,
        total: summary.total,
        keywords: Vec::new(),
    };
    match summary.status {
        SessionStatus::Completed => lines.push(format!(
            "Status: completed ({}/{} processed)",
            summary.processed, summary.total
        )),
        SessionStatus::Failed => {
            lines.push(format!(
                "Status: failed at {}/{} ({}%)",
                summary.processed,
                summary.total,
                tally.percent()
            ));
            if let Some(reason) = summary.reason.as_deref() {
                lines.push(format!("Reason: {reason}"));
            }
        }
        SessionStatus::Active => lines.push("Status: active".into()),
    }

    if summary.keywords.is_empty() {
        lines.push("No matching keywords.".into());
    } else {
        lines.push(format!("Keywords ({}):", summary.keywords.len()));
        lines.extend(ranked_table(&summary.keywords));
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: SessionStatus, reason: Option<&str>) -> SessionSummary {
        SessionSummary {
            finished_at_utc: "2026-01-01T00:00:00Z".into(),
            file_path: "/data/novel.txt".into(),
            keyword: "丹".into(),
            top_n: 20,
            status,
            reason: reason.map(str::to_string),
            processed: 3,
            total: 4,
            keywords: vec![KeywordCount::new("丹药", 12), KeywordCount::new("炼丹", 3)],
        }
    }

    #[test]
    fn progress_line_shows_percent_and_leader() {
        let t = Tally {
            processed: 1,
            total: 3,
            keywords: vec![KeywordCount::new("丹药", 7)],
        };
        assert_eq!(progress_line(&t), "Progress: 1/3 (33%) top: 丹药 7");
        assert_eq!(progress_line(&Tally::default()), "Progress: 0/0 (0%)");
    }

    #[test]
    fn failed_summary_includes_reason() {
        let s = build_text_summary(&summary(SessionStatus::Failed, Some("disk gone")));
        assert!(s.lines.contains(&"Status: failed at 3/4 (75%)".to_string()));
        assert!(s.lines.contains(&"Reason: disk gone".to_string()));
    }

    #[test]
    fn ranked_rows_are_aligned() {
        let s = build_text_summary(&summary(SessionStatus::Completed, None));
        let rows: Vec<_> = s.lines.iter().filter(|l| l.contains(". ")).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("  1. 丹药"));
        assert_eq!(rows[0].chars().count(), rows[1].chars().count());
    }
}
