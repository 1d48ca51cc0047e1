//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a slice value with where it came from
    ///
    /// Quiet mode prints the bare compact JSON so the value can be piped.
    pub fn print_value(&self, slice: &str, phase: &str, value: &Value) {
        match self.format {
            OutputFormat::Human => {
                println!("{} ({})", slice, phase);
                println!("{}", pretty(value));
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"slice": slice, "phase": phase, "value": value})
                );
            }
            OutputFormat::Quiet => {
                println!("{}", value);
            }
        }
    }

    /// Print cached entries as key and raw JSON
    pub fn print_entries(&self, entries: &[(String, String)], empty_message: &str) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("{}", empty_message);
                    return;
                }
                for (key, raw) in entries {
                    println!("{} | {}", key, truncate(raw, 60));
                }
                let noun = if entries.len() == 1 { "entry" } else { "entries" };
                println!("\n{} {}", entries.len(), noun);
            }
            OutputFormat::Json => {
                let json_entries: Vec<_> = entries
                    .iter()
                    .map(|(key, raw)| serde_json::json!({"key": key, "bytes": raw.len()}))
                    .collect();
                println!("{}", serde_json::json!(json_entries));
            }
            OutputFormat::Quiet => {
                for (key, _) in entries {
                    println!("{}", key);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Pretty-print JSON, falling back to compact form
fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Shorten a value for one-line display, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
