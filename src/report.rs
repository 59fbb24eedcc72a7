use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use crate::collection::{Fields, Key};
use crate::common::AuditError;
use crate::diff::DiffResults;
use crate::reconcile::ApplyReport;

/// Which detail tables to print alongside the diff summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportSection {
    All,
    Add,
    Del,
    Upd,
}

impl FromStr for ReportSection {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "all" => Ok(ReportSection::All),
            "add" => Ok(ReportSection::Add),
            "del" => Ok(ReportSection::Del),
            "upd" => Ok(ReportSection::Upd),
            other => Err(AuditError::not_found("report section", other)),
        }
    }
}

fn wants(sections: &[ReportSection], section: ReportSection) -> bool {
    sections.contains(&ReportSection::All) || sections.contains(&section)
}

/// Print the diff summary, then the requested per-bucket tables.
pub fn diff_report(diff: &DiffResults, sections: &[ReportSection]) {
    if diff.is_empty() {
        println!("\nNo diffs.");
        return;
    }

    println!("\nDiff report");
    println!("   Add items: count {}", diff.missing.len());
    println!("   Remove items: count {}", diff.extras.len());
    println!("   Update items: count {}", diff.changes.len());
    println!();

    if !diff.missing.is_empty() && wants(sections, ReportSection::Add) {
        print_items_table(&format!("Add items: {}", diff.missing.len()), &diff.missing);
    }
    if !diff.extras.is_empty() && wants(sections, ReportSection::Del) {
        print_items_table(
            &format!("Remove items: {}", diff.extras.len()),
            &diff.extras,
        );
    }
    if !diff.changes.is_empty() && wants(sections, ReportSection::Upd) {
        print_changes_table(diff);
    }
}

/// Print the apply summary after a reconcile run.
pub fn apply_report(report: &ApplyReport) {
    println!(
        "\nApply report: attempted {}, applied {}, failed {}",
        report.attempted,
        report.applied,
        report.failed()
    );
    for failure in &report.failures {
        println!("   {} {}: {}", failure.op, failure.key, failure.error);
    }
}

fn print_items_table(title: &str, items: &BTreeMap<Key, Fields>) {
    let Some(first) = items.values().next() else {
        return;
    };
    let headers: Vec<&str> = first.keys().map(String::as_str).collect();

    let rows: Vec<Vec<&str>> = items
        .values()
        .map(|item| {
            headers
                .iter()
                .map(|field| item.get(*field).map(String::as_str).unwrap_or(""))
                .collect()
        })
        .collect();

    println!("{}", rule());
    println!("{title}");
    println!("{}\n", rule());
    print!("{}", render_table(&headers, &rows));
    println!();
}

fn print_changes_table(diff: &DiffResults) {
    let headers = ["key", "field", "target", "origin"];
    let mut rows: Vec<Vec<String>> = Vec::new();

    for (key, changed) in &diff.changes {
        let current = diff.target.items.get(key);
        for (field, origin_value) in changed {
            let target_value = current
                .and_then(|item| item.get(field))
                .map(String::as_str)
                .unwrap_or("");
            rows.push(vec![
                key.to_string(),
                field.clone(),
                target_value.to_string(),
                origin_value.clone(),
            ]);
        }
    }

    let borrowed: Vec<Vec<&str>> = rows
        .iter()
        .map(|row| row.iter().map(String::as_str).collect())
        .collect();

    println!("{}", rule());
    println!("Update items: {}", diff.changes.len());
    println!("{}\n", rule());
    print!("{}", render_table(&headers, &borrowed));
    println!();
}

fn rule() -> String {
    "-".repeat(80)
}

fn render_table(headers: &[&str], rows: &[Vec<&str>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx < widths.len() {
                widths[idx] = widths[idx].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    for (idx, header) in headers.iter().enumerate() {
        let _ = write!(out, "{:<width$}  ", header, width = widths[idx]);
    }
    out.push('\n');
    for (idx, _) in headers.iter().enumerate() {
        let _ = write!(out, "{}  ", "-".repeat(widths[idx]));
    }
    out.push('\n');
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            let _ = write!(out, "{:<width$}  ", cell, width = widths[idx]);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_parse_and_reject() {
        assert_eq!("all".parse::<ReportSection>().unwrap(), ReportSection::All);
        assert_eq!("upd".parse::<ReportSection>().unwrap(), ReportSection::Upd);
        assert!("everything".parse::<ReportSection>().is_err());
    }

    #[test]
    fn table_columns_align_to_widest_cell() {
        let headers = ["hostname", "ip"];
        let rows = vec![
            vec!["core-sw1", "10.0.0.1"],
            vec!["r2", "192.168.100.250"],
        ];
        let table = render_table(&headers, &rows);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("hostname"));
        // every row pads to the same width
        assert_eq!(lines[2].len(), lines[3].len());
        assert!(lines[3].contains("192.168.100.250"));
    }

    #[test]
    fn wants_honors_all() {
        assert!(wants(&[ReportSection::All], ReportSection::Del));
        assert!(wants(&[ReportSection::Add], ReportSection::Add));
        assert!(!wants(&[ReportSection::Add], ReportSection::Del));
        assert!(!wants(&[], ReportSection::Upd));
    }
}
