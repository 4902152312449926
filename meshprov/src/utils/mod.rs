use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn print_error(message: &str) {
    eprintln!("{prefix} {message}", prefix = "Error:".red().bold());
}

pub fn print_success(message: &str) {
    eprintln!("{prefix} {message}", prefix = "✓".green().bold());
}

pub fn print_warning(message: &str) {
    eprintln!("{prefix} {message}", prefix = "⚠".yellow().bold());
}

pub fn print_info(message: &str) {
    eprintln!("{prefix} {message}", prefix = "ℹ".blue().bold());
}

/// Parse a 16-bit value written in decimal or with a `0x` prefix.
pub fn parse_u16(text: &str) -> Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid value '{text}': {e}"))
}

pub fn parse_uuid(text: &str) -> anyhow::Result<[u8; 16]> {
    let mut uuid = [0u8; 16];
    hex::decode_to_slice(text.trim(), &mut uuid)
        .map_err(|e| anyhow::anyhow!("invalid UUID '{text}': {e}"))?;
    Ok(uuid)
}

/// Spinner shown while blocking on the device.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
