use crate::types::{Report, UsageRecordSet};

pub const NO_DATA: &str = "No cost data found.";
pub const FETCH_FAILED: &str = "Error fetching cost data.";

const TABLE_HEADER: &str = "Date\t\tCost";
const TABLE_RULE: &str = "----------|------------";

/// Builds the console table and email body from the fetched records.
///
/// Both views share the same per-record lines so what the operator sees is
/// exactly what gets mailed.
#[must_use]
pub fn build_report(records: &UsageRecordSet) -> Report {
    let lines: Vec<String> = records.records().iter().map(|r| r.line()).collect();
    let skipped = records.skipped();

    let mut content = String::new();
    if lines.is_empty() {
        content.push_str(NO_DATA);
        if skipped > 0 {
            content.push('\n');
        }
    } else {
        for line in &lines {
            content.push_str(line);
            content.push('\n');
        }
    }
    if skipped > 0 {
        content.push_str(&skipped_line(skipped));
        content.push('\n');
    }

    Report {
        table: with_header(&content),
        body: content,
        lines,
        skipped,
    }
}

impl Report {
    /// Stand-in report mailed when the billing API refused the request.
    #[must_use]
    pub fn fetch_failed() -> Self {
        Self {
            lines: Vec::new(),
            skipped: 0,
            table: with_header(FETCH_FAILED),
            body: FETCH_FAILED.to_string(),
        }
    }
}

fn with_header(content: &str) -> String {
    let mut table = format!("{TABLE_HEADER}\n{TABLE_RULE}\n{content}");
    if !table.ends_with('\n') {
        table.push('\n');
    }
    table
}

fn skipped_line(skipped: usize) -> String {
    format!("Skipped {skipped} invalid record(s).")
}
