use crate::record::CommandRecord;
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use regex::bytes::Regex;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;

/// Where an export goes: a file, or stdout for `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination<'a> {
    File(&'a Path),
    Stdout,
}

impl<'a> Destination<'a> {
    pub fn parse(path: &'a Path) -> Self {
        if path.as_os_str() == "-" {
            Destination::Stdout
        } else {
            Destination::File(path)
        }
    }
}

fn backtick_runs() -> Option<&'static Regex> {
    static RUNS: OnceLock<Option<Regex>> = OnceLock::new();
    RUNS.get_or_init(|| Regex::new("`+").ok()).as_ref()
}

/// A fence that cannot be closed early by anything inside `body`.
pub fn fence_for(body: &[u8]) -> String {
    let longest = backtick_runs()
        .and_then(|runs| runs.find_iter(body).map(|m| m.len()).max())
        .unwrap_or(0);
    "`".repeat(longest.max(2) + 1)
}

/// Render `records` as a Markdown document. Captured output is copied into
/// the document byte for byte.
pub fn render_markdown(records: &[CommandRecord], group_by_session: bool) -> Vec<u8> {
    let mut doc = Vec::new();
    // Writing into a Vec cannot fail
    let _ = write_document(&mut doc, records, group_by_session);
    doc
}

fn write_document<W: Write>(
    out: &mut W,
    records: &[CommandRecord],
    group_by_session: bool,
) -> io::Result<()> {
    writeln!(out, "# Shelltape Command History")?;
    writeln!(out)?;
    writeln!(out, "Generated: {}", Utc::now().with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "Total commands: {}", records.len())?;
    writeln!(out)?;

    if !group_by_session {
        for record in records {
            write_record(out, record, "##")?;
        }
        return Ok(());
    }

    // Sessions in order of first appearance
    let mut order: Vec<&str> = Vec::new();
    for record in records {
        if !order.contains(&record.session_id.as_str()) {
            order.push(&record.session_id);
        }
    }
    for session in order {
        let members: Vec<&CommandRecord> =
            records.iter().filter(|r| r.session_id == session).collect();
        writeln!(out, "## Session {session}")?;
        writeln!(out)?;
        if let Some(first) = members.first() {
            writeln!(
                out,
                "**Shell:** {} | **Hostname:** {} | **User:** {}",
                first.shell, first.hostname, first.username
            )?;
            writeln!(out)?;
        }
        for record in members {
            write_record(out, record, "###")?;
        }
    }
    Ok(())
}

fn write_record<W: Write>(out: &mut W, record: &CommandRecord, heading: &str) -> io::Result<()> {
    let started = record.start_time.with_timezone(&Local);
    let ended = record.end_time.with_timezone(&Local);

    writeln!(out, "{heading} {}", started.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out)?;
    writeln!(out, "**Directory:** `{}`", record.cwd.display())?;
    writeln!(out, "**Started:** {}", started.format("%Y-%m-%d %H:%M:%S%.3f"))?;
    writeln!(out, "**Finished:** {}", ended.format("%Y-%m-%d %H:%M:%S%.3f"))?;
    writeln!(out, "**Duration:** {}ms", record.duration_ms())?;
    writeln!(out, "**Exit Code:** {}", record.exit_code)?;
    writeln!(
        out,
        "**Session:** {} | **Shell:** {} | **Hostname:** {} | **User:** {}",
        record.session_id, record.shell, record.hostname, record.username
    )?;
    writeln!(out)?;

    let command_fence = fence_for(record.command.as_bytes());
    writeln!(out, "{command_fence}bash")?;
    writeln!(out, "{}", record.command)?;
    writeln!(out, "{command_fence}")?;
    writeln!(out)?;

    if !record.output.is_empty() {
        writeln!(out, "**Output:**")?;
        writeln!(out)?;
        let fence = fence_for(&record.output);
        writeln!(out, "{fence}")?;
        out.write_all(&record.output)?;
        if !record.output.ends_with(b"\n") {
            writeln!(out)?;
        }
        writeln!(out, "{fence}")?;
        writeln!(out)?;
    }
    if record.output_truncated {
        writeln!(
            out,
            "_Output truncated: {} of {} bytes kept._",
            record.output.len(),
            record.output_total_bytes
        )?;
        writeln!(out)?;
    }

    writeln!(out, "---")?;
    writeln!(out)?;
    Ok(())
}

/// Write the rendered document to `destination`.
pub fn export(
    records: &[CommandRecord],
    destination: &Destination,
    group_by_session: bool,
) -> Result<()> {
    let doc = render_markdown(records, group_by_session);
    match destination {
        Destination::Stdout => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&doc).context("Failed to write export to stdout")?;
            stdout.flush()?;
        }
        Destination::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            fs::write(path, &doc)
                .with_context(|| format!("Failed to write export: {}", path.display()))?;
        }
    }
    tracing::debug!(records = records.len(), "export written");
    Ok(())
}
