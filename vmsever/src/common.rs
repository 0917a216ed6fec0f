use std::io::Write;

use anyhow::{Context, Result};

/// Ask a yes/no question on the terminal. Only `yes` and `y` count as
/// agreement; anything else declines.
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    let answer = prompt_line(prompt)?;
    Ok(matches!(answer.as_str(), "yes" | "y"))
}

/// Print a prompt and read one trimmed line from stdin.
pub(crate) fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt} ");
    std::io::stdout().flush().context("unable to flush stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("unable to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Shorten a table cell to `width` characters, marking truncation with `..`.
pub(crate) fn truncate_cell(value: &str, width: usize) -> String {
    if value.chars().count() > width {
        let kept: String = value.chars().take(width.saturating_sub(2)).collect();
        format!("{kept}..")
    } else {
        value.to_string()
    }
}
