//! Output formatting for the asyncwinrm CLI.
//!
//! Human output is colored unless disabled or `NO_COLOR` is set. JSON mode
//! prints one machine-readable document on stdout and nothing else.

use std::time::Instant;

use colored::Colorize;
use serde::Serialize;

/// Output formatter for human and JSON modes
pub struct OutputFormatter {
    use_color: bool,
    json_mode: bool,
    verbosity: u8,
    start_time: Instant,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        if !use_color {
            colored::control::set_override(false);
        }

        Self {
            use_color,
            json_mode,
            verbosity,
            start_time: Instant::now(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.json_mode
    }

    /// Print a section header
    pub fn section(&self, title: &str) {
        if self.json_mode {
            return;
        }
        if self.use_color {
            println!("{}", title.cyan().bold());
        } else {
            println!("{title}");
        }
    }

    /// Print a `key: value` line
    pub fn field(&self, key: &str, value: impl std::fmt::Display) {
        if self.json_mode {
            return;
        }
        println!("  {:<18} {}", format!("{key}:").bold(), value);
    }

    /// Print a per-target status line
    pub fn status(&self, name: &str, ok: bool, detail: &str) {
        if self.json_mode {
            return;
        }
        let status = if ok { "ok".green() } else { "failed".red().bold() };
        println!("{:<14} {:<8} {}", name, status, detail);
    }

    /// Print a plain line
    pub fn line(&self, text: &str) {
        if !self.json_mode {
            println!("{text}");
        }
    }

    /// Print a warning to stderr
    pub fn warning(&self, message: &str) {
        eprintln!("{} {}", "warning:".yellow().bold(), message);
    }

    /// Print a debug line when running with `-vv` or more
    pub fn debug(&self, message: &str) {
        if self.verbosity >= 2 && !self.json_mode {
            eprintln!("{} {}", "debug:".dimmed(), message);
        }
    }

    /// Print `value` as pretty JSON
    pub fn json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print elapsed time
    pub fn elapsed(&self) {
        if self.json_mode || self.verbosity == 0 {
            return;
        }
        eprintln!(
            "{}",
            format!("finished in {:.2?}", self.start_time.elapsed()).dimmed()
        );
    }
}
