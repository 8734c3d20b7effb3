// Output formatting utilities for CLI
use colored::*;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::types::OperationResult;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse output format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Print a list of data in the specified format
pub fn print_list<T>(data: &[T], format: OutputFormat) -> anyhow::Result<()>
where
    T: Tabled + Serialize,
{
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found".yellow());
            } else {
                let table = Table::new(data).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
    }
    Ok(())
}

/// Human-readable form of an envelope message.
pub fn describe(result: &OperationResult) -> String {
    match &result.envelope().message {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Print a gateway result: success in green, failure in red.
pub fn print_result(result: &OperationResult) {
    if result.is_info() {
        print_success(&describe(result));
        if let Some(info) = &result.envelope().info {
            print_info(&info.message.to_string());
        }
    } else {
        print_error(&format!("{} {}", result.envelope().status, describe(result)));
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatusCode;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::parse("other"), OutputFormat::Table);
    }

    #[test]
    fn test_describe_string_and_structured() {
        let text = OperationResult::error(StatusCode::CONFLICT, "Topic : \"t\" already exist.");
        assert_eq!(describe(&text), "Topic : \"t\" already exist.");

        let structured = OperationResult::info(StatusCode::OK, serde_json::json!(["a"]));
        assert_eq!(describe(&structured), r#"["a"]"#);
    }
}
