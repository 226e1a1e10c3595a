use crate::query::Stats;
use crate::record::{CommandRecord, SessionRecord};
use chrono::{Duration, Local};
use colored::*;
use std::path::{Path, PathBuf};
use unicode_width::UnicodeWidthChar;

const COMMAND_WIDTH: usize = 60;

/// What `status` shows about the local installation.
#[derive(Debug)]
pub struct StatusReport {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub commands_path: PathBuf,
    pub commands_bytes: u64,
    pub sessions_bytes: u64,
    pub records: usize,
    pub skipped: usize,
    // A writer is mid-append, or crashed during one
    pub incomplete_tail: bool,
    pub sessions: Vec<SessionRecord>,
    pub capturing: bool,
}

pub fn print_list(records: &[CommandRecord]) {
    if records.is_empty() {
        println!("{}", "No commands recorded yet.".yellow());
        return;
    }
    let home = dirs::home_dir();
    for record in records {
        let status = if record.succeeded() {
            format!("{:>3}", record.exit_code).green()
        } else {
            format!("{:>3}", record.exit_code).red().bold()
        };
        println!(
            "{} {} {} {}",
            record
                .start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed(),
            status,
            fit_width(&single_line(&record.command), COMMAND_WIDTH).bold(),
            format!(
                "({}, {})",
                format_duration(record.duration()),
                display_cwd(&record.cwd, home.as_deref())
            )
            .dimmed()
        );
    }
}

pub fn print_stats(stats: &Stats) {
    println!("{}", "Shelltape statistics".cyan().bold());
    println!();
    println!("{}: {}", "Total commands".yellow(), stats.total_commands.to_string().green());
    println!("{}: {}", "Sessions".yellow(), stats.distinct_sessions.to_string().green());
    println!(
        "{}: {} ({} / {})",
        "Success rate".yellow(),
        format!("{:.1}%", stats.success_rate * 100.0).green(),
        stats.successful,
        stats.total_commands
    );
    println!("{}: {}", "Average duration".yellow(), format_duration(stats.mean_duration));
    if let Some(longest) = &stats.longest {
        println!(
            "{}: {} ({})",
            "Longest command".yellow(),
            fit_width(&single_line(&longest.command), COMMAND_WIDTH),
            format_duration(longest.duration())
        );
    }
    if let (Some(first), Some(last)) = (stats.first_seen, stats.last_seen) {
        println!(
            "{}: {} .. {}",
            "Recorded".yellow(),
            first.with_timezone(&Local).format("%Y-%m-%d"),
            last.with_timezone(&Local).format("%Y-%m-%d")
        );
    }
    println!("{}: {}", "Storage".yellow(), format_bytes(stats.store_bytes));
    if stats.skipped_entries > 0 {
        println!(
            "{}",
            format!("{} unreadable entries skipped", stats.skipped_entries).red()
        );
    }

    if !stats.top_commands.is_empty() {
        println!();
        println!("{}", "Most used".cyan().bold());
        let widest = stats.top_commands.iter().map(|(_, n)| n.to_string().len()).max().unwrap_or(1);
        for (rank, (program, count)) in stats.top_commands.iter().enumerate() {
            println!("{:>3}. {:>widest$}  {}", rank + 1, count, program.green());
        }
    }
}

pub fn print_status(status: &StatusReport) {
    println!("{}", "Shelltape status".cyan().bold());
    println!();
    println!("{}: {}", "Data directory".yellow(), status.data_dir.display());
    println!("{}: {}", "Config".yellow(), status.config_path.display());
    println!(
        "{}: {} ({})",
        "Commands".yellow(),
        status.records.to_string().green(),
        format_bytes(status.commands_bytes)
    );
    println!("  {}", status.commands_path.display().to_string().dimmed());
    if status.skipped > 0 {
        println!("  {}", format!("{} unreadable entries skipped", status.skipped).red());
    }
    if status.incomplete_tail {
        println!("  {}", "last entry is incomplete".yellow());
    }
    let open = status.sessions.iter().filter(|s| s.ended_at.is_none()).count();
    println!(
        "{}: {} ({} open, {})",
        "Sessions".yellow(),
        status.sessions.len().to_string().green(),
        open,
        format_bytes(status.sessions_bytes)
    );
    let capturing = if status.capturing { "yes".green() } else { "no".dimmed() };
    println!("{}: {}", "Inside a capture".yellow(), capturing);
}

/// Collapse a multi-line command for one-line views.
pub fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `max` terminal columns, ending with `…` when cut.
pub fn fit_width(text: &str, max: usize) -> String {
    let total: usize = text.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w + 1 > max {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push('…');
    out
}

/// Show `cwd` relative to the home directory as `~/...`.
pub fn display_cwd(cwd: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if cwd == home {
            return "~".to_string();
        }
        if cwd.starts_with(home) {
            if let Some(rel) = pathdiff::diff_paths(cwd, home) {
                return format!("~/{}", rel.display());
            }
        }
    }
    cwd.display().to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let ms = duration.num_milliseconds();
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_wide_characters() {
        assert_eq!(fit_width("ls -la", 10), "ls -la");
        assert_eq!(fit_width("abcdefghij", 5), "abcd…");
        // Each CJK character takes two columns
        assert_eq!(fit_width("日本語テキスト", 7), "日本語…");
    }

    #[test]
    fn home_relative_paths() {
        let home = Path::new("/home/tester");
        assert_eq!(display_cwd(Path::new("/home/tester/src/app"), Some(home)), "~/src/app");
        assert_eq!(display_cwd(home, Some(home)), "~");
        assert_eq!(display_cwd(Path::new("/etc"), Some(home)), "/etc");
        assert_eq!(display_cwd(Path::new("/etc"), None), "/etc");
    }

    #[test]
    fn human_durations_and_sizes() {
        assert_eq!(format_duration(Duration::milliseconds(15)), "15ms");
        assert_eq!(format_duration(Duration::milliseconds(2_500)), "2.5s");
        assert_eq!(format_duration(Duration::seconds(125)), "2m05s");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }

    #[test]
    fn multi_line_commands_collapse() {
        assert_eq!(single_line("for f in *;\n  do echo $f;\ndone"), "for f in *; do echo $f; done");
    }
}
