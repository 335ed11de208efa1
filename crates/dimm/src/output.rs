//! Output formatting: table, JSON, YAML.
//!
//! Status and config views go through [`render`]. Measurements printed by
//! `dimm run` are always compact JSON, one per line.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

pub fn ok_mark(text: &str, color: bool) -> String {
    if color {
        format!("{} {text}", "✓".green())
    } else {
        format!("✓ {text}")
    }
}

/// Highlight a status word: green when healthy, red when faulted.
pub fn paint(text: &str, healthy: Option<bool>, color: bool) -> String {
    match (color, healthy) {
        (true, Some(true)) => text.green().to_string(),
        (true, Some(false)) => text.red().to_string(),
        (true, None) => text.yellow().to_string(),
        (false, _) => text.to_owned(),
    }
}

// ── Key/value table ──────────────────────────────────────────────────

#[derive(Tabled)]
pub struct FieldRow {
    #[tabled(rename = "Field")]
    pub field: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl FieldRow {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Flatten a JSON value into `a.b.c = value` rows.
pub fn flatten(prefix: &str, value: &serde_json::Value, rows: &mut Vec<FieldRow>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, rows);
            }
        }
        serde_json::Value::Null => rows.push(FieldRow::new(prefix, "-")),
        serde_json::Value::String(s) => rows.push(FieldRow::new(prefix, s.clone())),
        other => rows.push(FieldRow::new(prefix, other.to_string())),
    }
}

pub fn render_table(rows: &[FieldRow]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render `data` in the chosen format. Tables flatten the serialized form
/// unless `rows` supplies a custom view.
pub fn render<T: serde::Serialize>(
    format: OutputFormat,
    data: &T,
    rows: Option<Vec<FieldRow>>,
) -> Result<String, CliError> {
    let render_err = |e: &dyn std::fmt::Display| CliError::Render(e.to_string());
    match format {
        OutputFormat::Table => {
            let rows = match rows {
                Some(rows) => rows,
                None => {
                    let value = serde_json::to_value(data).map_err(|e| render_err(&e))?;
                    let mut rows = Vec::new();
                    flatten("", &value, &mut rows);
                    rows
                }
            };
            Ok(render_table(&rows))
        }
        OutputFormat::Json => serde_json::to_string_pretty(data).map_err(|e| render_err(&e)),
        OutputFormat::JsonCompact => serde_json::to_string(data).map_err(|e| render_err(&e)),
        OutputFormat::Yaml => serde_yaml::to_string(data).map_err(|e| render_err(&e)),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_flatten_to_dotted_paths() {
        let value = serde_json::json!({
            "controller": "sim",
            "astelco": { "port": 65432, "password": null },
        });
        let mut rows = Vec::new();
        flatten("", &value, &mut rows);
        let pairs: Vec<(String, String)> = rows.into_iter().map(|r| (r.field, r.value)).collect();
        assert!(pairs.contains(&("controller".into(), "sim".into())));
        assert!(pairs.contains(&("astelco.port".into(), "65432".into())));
        assert!(pairs.contains(&("astelco.password".into(), "-".into())));
    }

    #[test]
    fn plain_paint_leaves_text_alone() {
        assert_eq!(paint("running", Some(true), false), "running");
        assert_eq!(ok_mark("valid", false), "✓ valid");
    }
}
