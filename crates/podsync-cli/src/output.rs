use std::io::Write;

use podsync_core::ports::{IProgressSink, ProgressUpdate};

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Trait for formatting CLI output
pub trait OutputFormatter {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Human-readable output formatter with checkmarks and indentation
pub struct HumanFormatter;

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        println!("\u{2713} {}", message);
    }
    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {}", message);
    }
    fn warn(&self, message: &str) {
        eprintln!("\u{26a0} Warning: {}", message);
    }
    fn info(&self, message: &str) {
        println!("  {}", message);
    }
    fn print_json(&self, _value: &serde_json::Value) {
        // Human formatter doesn't print JSON
    }
}

/// JSON output formatter
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn success(&self, message: &str) {
        println!(
            "{}",
            serde_json::json!({"success": true, "message": message})
        );
    }
    fn error(&self, message: &str) {
        eprintln!(
            "{}",
            serde_json::json!({"success": false, "error": message})
        );
    }
    fn warn(&self, message: &str) {
        eprintln!(
            "{}",
            serde_json::json!({"level": "warning", "message": message})
        );
    }
    fn info(&self, _message: &str) {}
    fn print_json(&self, value: &serde_json::Value) {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_default()
        );
    }
}

/// Formatter that only reports errors
pub struct QuietFormatter;

impl OutputFormatter for QuietFormatter {
    fn success(&self, _message: &str) {}
    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {}", message);
    }
    fn warn(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn print_json(&self, _value: &serde_json::Value) {}
}

pub fn get_formatter(format: OutputFormat, quiet: bool) -> Box<dyn OutputFormatter> {
    match (format, quiet) {
        (OutputFormat::Json, _) => Box::new(JsonFormatter),
        (OutputFormat::Human, true) => Box::new(QuietFormatter),
        (OutputFormat::Human, false) => Box::new(HumanFormatter),
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Prints scan progress to stdout
///
/// Human mode rewrites a single status line; JSON mode emits one object
/// per update.
pub struct ConsoleProgressSink {
    format: OutputFormat,
}

impl ConsoleProgressSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

/// Renders one update as the human status line
pub fn progress_line(update: &ProgressUpdate) -> String {
    format!(
        "[{:>5.1}%] {} ({})",
        update.percent, update.message, update.counters
    )
}

impl IProgressSink for ConsoleProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "job_id": update.job_id.to_string(),
                    "percent": update.percent,
                    "message": update.message,
                    "counters": update.counters,
                    "state": update.state,
                });
                println!("{json}");
            }
            OutputFormat::Human => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "  {}", progress_line(update));
            }
        }
    }
}
