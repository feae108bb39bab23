//! Inspection commands: `access-csv files` and `access-csv parse`.

use anyhow::Result;
use chrono::{Local, TimeZone};

use crate::config::Config;
use crate::models::RegistryEntry;
use crate::parser;
use crate::runner::open_registry;
use crate::sink::csv_path;

/// Prints every registered day file, oldest first, or only `date`.
///
/// Returns `false` if `date` is given but not registered.
pub async fn run_files(config: &Config, date: Option<&str>) -> Result<bool> {
    let registry = open_registry(config).await?;

    let entries = match date {
        Some(key) => match registry.get(key).await? {
            Some(entry) => vec![entry],
            None => {
                println!("No CSV file registered for {}", key);
                return Ok(false);
            }
        },
        None => registry.list_all().await?,
    };

    if entries.is_empty() {
        println!("No CSV files registered yet.");
        return Ok(true);
    }

    println!("{:<12} {:<16} {:<20} {:>10}", "DATE", "FILE", "CREATED", "BYTES");
    for entry in &entries {
        println!("{}", format_entry(config, entry));
    }
    println!();
    println!("{} file(s) in {}", entries.len(), config.output.dir.display());
    Ok(true)
}

fn format_entry(config: &Config, entry: &RegistryEntry) -> String {
    let created = Local
        .timestamp_millis_opt(entry.created_at)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| entry.created_at.to_string());

    let size = std::fs::metadata(csv_path(&config.output.dir, &entry.date_key))
        .map(|m| m.len().to_string())
        .unwrap_or_else(|_| "missing".to_string());

    format!(
        "{:<12} {:<16} {:<20} {:>10}",
        entry.date_key, entry.file_name, created, size
    )
}

/// Prints the CSV row a raw line would produce.
///
/// Returns `false` if the line does not match the grammar.
pub fn run_parse(line: &str) -> bool {
    match parser::parse_line(line) {
        Some(record) => {
            println!("{}", record.to_row());
            true
        }
        None => {
            println!("no match: line would be skipped");
            false
        }
    }
}
