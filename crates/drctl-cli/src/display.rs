//! Command output: pretty JSON, or a plain column view for terminals.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use drctl_core::protocol::BatchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Print any serializable value.
pub fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let value = serde_json::to_value(value).context("Failed to serialize output")?;
    match format {
        OutputFormat::Json => print_json(&value),
        OutputFormat::Text => {
            for line in text_lines(&value) {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// Print a batch report: one line per item and a summary.
pub fn render_report<T: Serialize>(report: &BatchReport<T>, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return render(report, format);
    }
    if report.is_empty() {
        println!("{}", "nothing to do".dimmed());
        return Ok(());
    }
    let width = report.items.iter().map(|i| i.key.len()).max().unwrap_or(0);
    for item in &report.items {
        if item.ok {
            println!("  {}  {:<width$}", "ok  ".green(), item.key, width = width);
        } else {
            println!(
                "  {}  {:<width$}  {}: {}",
                "FAIL".red().bold(),
                item.key,
                item.kind.as_deref().unwrap_or("error"),
                item.error.as_deref().unwrap_or_default(),
                width = width
            );
        }
    }
    println!("{} succeeded, {} failed", report.succeeded, report.failed);
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(scalar).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

/// Lay out a value as text. Arrays of objects become aligned columns
/// headed by the first row's keys; a lone object becomes `key: value`
/// lines.
fn text_lines(value: &Value) -> Vec<String> {
    match value {
        Value::Array(rows) if rows.is_empty() => vec!["(none)".to_string()],
        Value::Array(rows) => {
            let Some(Value::Object(first)) = rows.first() else {
                return rows.iter().map(scalar).collect();
            };
            let columns: Vec<&String> = first.keys().collect();
            let cells: Vec<Vec<String>> = rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c.as_str()).map(scalar).unwrap_or_default())
                        .collect()
                })
                .collect();
            let widths: Vec<usize> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    cells
                        .iter()
                        .map(|r| r[i].len())
                        .chain(std::iter::once(c.len()))
                        .max()
                        .unwrap_or(0)
                })
                .collect();

            let line = |values: Vec<String>| {
                values
                    .iter()
                    .zip(&widths)
                    .map(|(v, w)| format!("{:<w$}", v, w = *w))
                    .collect::<Vec<_>>()
                    .join("  ")
                    .trim_end()
                    .to_string()
            };
            let mut out = vec![line(columns.iter().map(|c| c.to_uppercase()).collect())];
            out.extend(cells.into_iter().map(line));
            out
        }
        Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, scalar(v)))
            .collect(),
        other => vec![scalar(other)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_are_aligned_under_headers() {
        let lines = text_lines(&json!([
            { "vm_name": "VM-1", "status": "registered" },
            { "vm_name": "VM-10", "status": "powered_on" },
        ]));
        assert_eq!(lines[0], "STATUS      VM_NAME");
        assert_eq!(lines[1], "registered  VM-1");
        assert_eq!(lines[2], "powered_on  VM-10");
    }

    #[test]
    fn test_object_renders_as_key_value_lines() {
        let lines = text_lines(&json!({ "vmx_path": null, "nic_rows": 1 }));
        assert!(lines.contains(&"vmx_path: -".to_string()));
        assert!(lines.contains(&"nic_rows: 1".to_string()));
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(text_lines(&json!([])), ["(none)"]);
    }
}
