use super::state::{Browser, Mode};
use crate::record::CommandRecord;
use crate::report::{display_cwd, fit_width, format_duration, single_line};
use chrono::Local;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};
use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

const PREVIEW_LINES: usize = 200;

fn split(area: Rect) -> (Rect, Rect, Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // search bar
            Constraint::Min(0),
            Constraint::Length(1), // status bar
        ])
        .split(area);
    (chunks[0], chunks[1], chunks[2])
}

fn split_main(area: Rect) -> (Rect, Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);
    (chunks[0], chunks[1])
}

/// Visible list rows for a screen of `area`; used as the page size.
pub fn list_rows(area: Rect) -> usize {
    let (_, main, _) = split(area);
    let (list, _) = split_main(main);
    list.height.saturating_sub(2) as usize
}

pub fn draw(f: &mut Frame, browser: &Browser) {
    let (search, main, status) = split(f.size());

    draw_search_bar(f, browser, search);
    match browser.mode() {
        Mode::Detail => draw_detail(f, browser, main),
        _ => {
            let (list, preview) = split_main(main);
            draw_list(f, browser, list);
            draw_preview(f, browser, preview);
        }
    }
    draw_status_bar(f, browser, status);
}

fn draw_search_bar(f: &mut Frame, browser: &Browser, area: Rect) {
    let (text, style) = match browser.mode() {
        Mode::Search => (
            format!("Search: {}_", browser.filter().as_str()),
            Style::default().fg(Color::Yellow),
        ),
        _ if browser.filter().is_empty() => (
            "Press / to search".to_string(),
            Style::default().fg(Color::DarkGray),
        ),
        _ => (
            format!("Filter: {} (/ to edit, Esc to clear)", browser.filter().as_str()),
            Style::default(),
        ),
    };
    let paragraph = Paragraph::new(text)
        .style(style)
        .block(Block::default().borders(Borders::ALL).title(" Search "));
    f.render_widget(paragraph, area);
}

fn draw_list(f: &mut Frame, browser: &Browser, area: Rect) {
    let width = area.width.saturating_sub(24) as usize;
    let items: Vec<ListItem> = browser
        .view()
        .map(|record| {
            let mark = if browser.is_marked(&record.id) { "●" } else { " " };
            let (exit, exit_style) = if record.succeeded() {
                ("✓", Style::default().fg(Color::Green))
            } else {
                ("✗", Style::default().fg(Color::Red))
            };
            let time = record.start_time.with_timezone(&Local).format("%m-%d %H:%M:%S");

            let mut spans = vec![
                Span::styled(format!("{mark} "), Style::default().fg(Color::Cyan)),
                Span::styled(format!("{exit} "), exit_style),
                Span::styled(format!("{time} "), Style::default().fg(Color::DarkGray)),
            ];
            let command = fit_width(&single_line(&record.command), width);
            for (piece, matched) in browser.filter().segments(&command) {
                let style = if matched {
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                spans.push(Span::styled(piece.to_string(), style));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .title(format!(" Commands ({}/{}) ", browser.view_len(), browser.total()))
                .borders(Borders::ALL),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD));

    let mut state = ListState::default();
    if browser.view_len() > 0 {
        state.select(Some(browser.selected_index()));
    }
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_preview(f: &mut Frame, browser: &Browser, area: Rect) {
    let lines = match browser.selected_record() {
        Some(record) => {
            let mut lines = summary_lines(record);
            lines.push(Line::from(""));
            let output = plain_output(&record.output_text());
            if output.trim().is_empty() {
                let muted = Style::default().fg(Color::DarkGray);
                lines.push(Line::styled("(no output captured)", muted));
            } else {
                lines.extend(output.lines().take(PREVIEW_LINES).map(|l| Line::from(l.to_string())));
            }
            lines
        }
        None => vec![Line::styled("No matching commands", Style::default().fg(Color::Red))],
    };
    let paragraph = Paragraph::new(lines)
        .block(Block::default().title(" Preview ").borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    f.render_widget(paragraph, area);
}

fn draw_detail(f: &mut Frame, browser: &Browser, area: Rect) {
    let Some(record) = browser.selected_record() else {
        return;
    };
    let mut lines = summary_lines(record);
    lines.push(Line::from(vec![
        Span::styled("Shell:     ", Style::default().fg(Color::Yellow)),
        Span::raw(format!("{} on {} as {}", record.shell, record.hostname, record.username)),
    ]));
    lines.push(Line::from(vec![
        Span::styled("Session:   ", Style::default().fg(Color::Yellow)),
        Span::raw(record.session_id.clone()),
    ]));
    lines.push(Line::from(""));
    lines.push(Line::styled("Command:", Style::default().fg(Color::Yellow)));
    lines.extend(record.command.lines().map(|l| Line::from(format!("  {l}"))));
    lines.push(Line::from(""));
    lines.push(Line::styled("Output:", Style::default().fg(Color::Yellow)));
    let output = plain_output(&record.output_text());
    if output.trim().is_empty() {
        lines.push(Line::styled("  (no output captured)", Style::default().fg(Color::DarkGray)));
    } else {
        lines.extend(output.lines().map(|l| Line::from(format!("  {l}"))));
    }
    if record.output_truncated {
        lines.push(Line::styled(
            format!(
                "  … truncated: {} of {} bytes kept",
                record.output.len(),
                record.output_total_bytes
            ),
            Style::default().fg(Color::DarkGray),
        ));
    }

    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .title(" Detail (Esc to return) ")
                .borders(Borders::ALL),
        )
        .wrap(Wrap { trim: false })
        .scroll((browser.detail_scroll(), 0));
    f.render_widget(paragraph, area);
}

fn summary_lines(record: &CommandRecord) -> Vec<Line<'static>> {
    let label = Style::default().fg(Color::Yellow);
    let status = if record.succeeded() {
        Span::styled(format!("{} ✓", record.exit_code), Style::default().fg(Color::Green))
    } else {
        Span::styled(format!("{} ✗", record.exit_code), Style::default().fg(Color::Red))
    };
    let home = dirs::home_dir();
    vec![
        Line::from(vec![
            Span::styled("Command:   ", label),
            Span::raw(single_line(&record.command)),
        ]),
        Line::from(vec![
            Span::styled("Time:      ", label),
            Span::raw(
                record
                    .start_time
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
        ]),
        Line::from(vec![
            Span::styled("Duration:  ", label),
            Span::raw(format_duration(record.duration())),
        ]),
        Line::from(vec![Span::styled("Exit code: ", label), status]),
        Line::from(vec![
            Span::styled("Directory: ", label),
            Span::raw(display_cwd(&record.cwd, home.as_deref())),
        ]),
    ]
}

fn draw_status_bar(f: &mut Frame, browser: &Browser, area: Rect) {
    let help = match browser.mode() {
        Mode::Search => " Type to filter | Enter: apply | Esc: cancel ",
        Mode::Detail => " j/k: scroll | Esc/Enter: back ",
        Mode::Exporting => " Exporting… ",
        Mode::Normal => concat!(
            " j/k: move | Space: mark | a: mark all | c: clear ",
            "| /: search | Enter: detail | e: export | q: quit "
        ),
    };
    let mut text = help.to_string();
    if browser.marked_count() > 0 {
        text.push_str(&format!("| {} marked ", browser.marked_count()));
    }
    if let Some(notice) = browser.notice() {
        text.push_str(&format!("| {notice} "));
    }
    let paragraph = Paragraph::new(Line::from(Span::styled(
        text,
        Style::default().bg(Color::DarkGray).fg(Color::White),
    )));
    f.render_widget(paragraph, area);
}

fn osc_sequences() -> Option<&'static Regex> {
    static OSC: OnceLock<Option<Regex>> = OnceLock::new();
    // Ended by BEL or by ST (ESC \), as in terminal hyperlinks
    OSC.get_or_init(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").ok()).as_ref()
}

/// Terminal output made safe to draw: escape sequences and carriage returns
/// are dropped, other control characters except tab and newline too.
pub fn plain_output(text: &str) -> String {
    let without_osc = match osc_sequences() {
        Some(osc) => osc.replace_all(text, ""),
        None => Cow::Borrowed(text),
    };
    console::strip_ansi_codes(&without_osc)
        .chars()
        .filter(|c| matches!(c, '\n' | '\t') || !c.is_control())
        .collect()
}
