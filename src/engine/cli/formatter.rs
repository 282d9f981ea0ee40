//! CLI Output Formatting Module
//! Colorized status lines and prompts for the terminal

use chrono::{DateTime, Utc};
use colored::Colorize;
use std::io::{self, BufRead, Write};

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print indented, dimmed text (release notes and the like)
    pub fn quote(text: &str) {
        for line in text.lines() {
            println!("  {} {}", "│".bright_black(), line);
        }
    }

    /// Ask a yes/no question on stdin. Anything but y/yes is no.
    pub fn confirm(question: &str, default_yes: bool) -> io::Result<bool> {
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        print!("{} {} {} ", "?".bright_blue().bold(), question, hint.bright_black());
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(parse_answer(&answer, default_yes))
    }
}

fn parse_answer(answer: &str, default_yes: bool) -> bool {
    match answer.trim().to_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// "2024-05-01 12:00:00 UTC (3m 12s ago)"
pub fn format_since(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - at).num_seconds().max(0) as u64;
    format!(
        "{} ({} ago)",
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_duration(elapsed)
    )
}
