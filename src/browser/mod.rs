mod state;
mod ui;

use state::{Action, Browser};

use crate::export::{self, Destination};
use crate::record::CommandRecord;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyEventKind},
    execute,
    terminal::{self, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Once;
use tracing::debug;

/// Browse `records` full-screen until the user quits. Exports go to `export_path`.
pub fn run(records: Vec<CommandRecord>, export_path: &Path) -> Result<()> {
    let mut browser = Browser::new(records);

    static INIT_CTRL_C: Once = Once::new();
    INIT_CTRL_C.call_once(|| {
        let _ = ctrlc::set_handler(move || {
            // Best-effort restore terminal state and exit with 130
            let _ = terminal::disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
            let _ = io::stdout().flush();
            std::process::exit(130);
        });
    });

    terminal::enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = io::stdout();
    if let Err(err) = execute!(stdout, EnterAlternateScreen) {
        let _ = terminal::disable_raw_mode();
        return Err(err).context("Failed to enter alternate screen");
    }

    let mut terminal = match Terminal::new(CrosstermBackend::new(stdout)) {
        Ok(terminal) => terminal,
        Err(err) => {
            let _ = terminal::disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen);
            return Err(err).context("Failed to create terminal");
        }
    };

    let result = event_loop(&mut terminal, &mut browser, export_path);

    terminal::disable_raw_mode().context("Failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("Failed to leave alternate screen")?;
    terminal.show_cursor().context("Failed to show cursor")?;

    result
}

fn event_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    browser: &mut Browser,
    export_path: &Path,
) -> Result<()> {
    loop {
        let area = terminal.size()?;
        browser.set_page_size(ui::list_rows(area));
        terminal.draw(|f| ui::draw(f, browser))?;

        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match browser.handle_key(key) {
            Action::Quit => return Ok(()),
            Action::Export(records) => {
                terminal.draw(|f| ui::draw(f, browser))?;
                let result = export_to(&records, export_path);
                browser.finish_export(result);
            }
            Action::None => {}
        }
    }
}

/// Write `records` to `path`, returning the notice for the status bar.
fn export_to(records: &[CommandRecord], path: &Path) -> Result<String, String> {
    export::export(records, &Destination::File(path), false)
        .map(|()| {
            format!(
                "Exported {} command{} to {}",
                records.len(),
                if records.len() == 1 { "" } else { "s" },
                path.display()
            )
        })
        .map_err(|err| {
            // Stderr would draw over the alternate screen
            debug!("browser export failed: {err:#}");
            format!("{err:#}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample;
    use tempfile::tempdir;

    #[test]
    fn export_reports_through_the_notice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("picked.md");
        let records = vec![sample("1", "s1", "make", b"ok\n", 100)];

        let notice = export_to(&records, &path).unwrap();
        assert_eq!(notice, format!("Exported 1 command to {}", path.display()));
        assert!(std::fs::read_to_string(&path).unwrap().contains("make"));

        // Parent is a regular file
        let unwritable = path.join("nested.md");
        assert!(export_to(&records, &unwritable).is_err());
    }
}
