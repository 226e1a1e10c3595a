use crate::filter::Filter;
use crate::record::CommandRecord;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Search,
    Detail,
    Exporting,
}

/// What the runner has to do after a key was handled.
#[derive(Debug, PartialEq)]
pub enum Action {
    None,
    Quit,
    Export(Vec<CommandRecord>),
}

/// Browser state over a snapshot loaded once at start. Nothing here touches
/// the terminal or the store.
pub struct Browser {
    // Newest first
    records: Vec<CommandRecord>,
    // Indices into `records` that pass `filter`
    view: Vec<usize>,
    selected: usize,
    marks: HashSet<String>,
    filter: Filter,
    // Predicate to restore when a search is abandoned
    saved_filter: Option<Filter>,
    mode: Mode,
    detail_scroll: u16,
    page_size: usize,
    notice: Option<String>,
}

impl Browser {
    pub fn new(mut records: Vec<CommandRecord>) -> Self {
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let view = (0..records.len()).collect();
        Self {
            records,
            view,
            selected: 0,
            marks: HashSet::new(),
            filter: Filter::default(),
            saved_filter: None,
            mode: Mode::Normal,
            detail_scroll: 0,
            page_size: 10,
            notice: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn view_len(&self) -> usize {
        self.view.len()
    }

    /// Records of the filtered view, in display order.
    pub fn view(&self) -> impl Iterator<Item = &CommandRecord> + '_ {
        self.view.iter().map(move |&i| &self.records[i])
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_record(&self) -> Option<&CommandRecord> {
        self.view.get(self.selected).map(|&i| &self.records[i])
    }

    pub fn is_marked(&self, id: &str) -> bool {
        self.marks.contains(id)
    }

    pub fn marked_count(&self) -> usize {
        self.marks.len()
    }

    pub fn detail_scroll(&self) -> u16 {
        self.detail_scroll
    }

    /// Rows moved by page keys; the runner sets it from the list height.
    pub fn set_page_size(&mut self, rows: usize) {
        self.page_size = rows.max(1);
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match self.mode {
            Mode::Normal => self.handle_normal(key.code, ctrl),
            Mode::Search => {
                self.handle_search(key.code, ctrl);
                Action::None
            }
            Mode::Detail => {
                self.handle_detail(key.code, ctrl);
                Action::None
            }
            // Keys are ignored until the runner reports back
            Mode::Exporting => Action::None,
        }
    }

    fn handle_normal(&mut self, code: KeyCode, ctrl: bool) -> Action {
        if ctrl {
            match code {
                KeyCode::Char('c') => return Action::Quit,
                KeyCode::Char('d') => self.page_down(),
                KeyCode::Char('u') => self.page_up(),
                _ => {}
            }
            return Action::None;
        }
        self.notice = None;
        match code {
            KeyCode::Char('q') => return Action::Quit,
            KeyCode::Down | KeyCode::Char('j') => self.move_down(),
            KeyCode::Up | KeyCode::Char('k') => self.move_up(),
            KeyCode::PageDown => self.page_down(),
            KeyCode::PageUp => self.page_up(),
            KeyCode::Home | KeyCode::Char('g') => self.select_first(),
            KeyCode::End | KeyCode::Char('G') => self.select_last(),
            KeyCode::Char(' ') => self.toggle_mark(),
            KeyCode::Char('a') => self.mark_all(),
            KeyCode::Char('c') => self.clear_marks(),
            KeyCode::Char('/') => self.begin_search(),
            KeyCode::Enter => self.open_detail(),
            KeyCode::Esc => self.clear_filter(),
            KeyCode::Char('e') => {
                if let Some(records) = self.request_export() {
                    return Action::Export(records);
                }
            }
            _ => {}
        }
        Action::None
    }

    fn handle_search(&mut self, code: KeyCode, ctrl: bool) {
        match code {
            KeyCode::Char('c') if ctrl => self.cancel_search(),
            KeyCode::Enter => self.commit_search(),
            KeyCode::Esc => self.cancel_search(),
            KeyCode::Backspace => {
                self.filter.pop();
                self.refresh_view();
            }
            KeyCode::Char(c) if !ctrl => {
                self.filter.push(c);
                self.refresh_view();
            }
            _ => {}
        }
    }

    fn handle_detail(&mut self, code: KeyCode, ctrl: bool) {
        match code {
            KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q') => self.close_detail(),
            KeyCode::Char('c') if ctrl => self.close_detail(),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_detail(1),
            KeyCode::Up | KeyCode::Char('k') => self.scroll_detail(-1),
            KeyCode::PageDown => self.scroll_detail(self.page_size as i32),
            KeyCode::Char('d') if ctrl => self.scroll_detail(self.page_size as i32),
            KeyCode::PageUp => self.scroll_detail(-(self.page_size as i32)),
            KeyCode::Char('u') if ctrl => self.scroll_detail(-(self.page_size as i32)),
            KeyCode::Home | KeyCode::Char('g') => self.detail_scroll = 0,
            _ => {}
        }
    }

    pub fn move_down(&mut self) {
        if !self.view.is_empty() {
            self.selected = (self.selected + 1).min(self.view.len() - 1);
        }
    }

    pub fn move_up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn page_down(&mut self) {
        if !self.view.is_empty() {
            self.selected = (self.selected + self.page_size).min(self.view.len() - 1);
        }
    }

    pub fn page_up(&mut self) {
        self.selected = self.selected.saturating_sub(self.page_size);
    }

    pub fn select_first(&mut self) {
        self.selected = 0;
    }

    pub fn select_last(&mut self) {
        self.selected = self.view.len().saturating_sub(1);
    }

    /// Flip the mark on the highlighted record; the highlight stays put.
    pub fn toggle_mark(&mut self) {
        let Some(id) = self.selected_record().map(|r| r.id.clone()) else {
            return;
        };
        if !self.marks.remove(&id) {
            self.marks.insert(id);
        }
    }

    /// Mark every record of the filtered view, and nothing outside it.
    pub fn mark_all(&mut self) {
        for &i in &self.view {
            self.marks.insert(self.records[i].id.clone());
        }
    }

    pub fn clear_marks(&mut self) {
        self.marks.clear();
    }

    pub fn begin_search(&mut self) {
        self.saved_filter = Some(self.filter.clone());
        self.mode = Mode::Search;
    }

    pub fn commit_search(&mut self) {
        self.saved_filter = None;
        self.mode = Mode::Normal;
    }

    pub fn cancel_search(&mut self) {
        if let Some(previous) = self.saved_filter.take() {
            self.filter = previous;
        }
        self.mode = Mode::Normal;
        self.refresh_view();
    }

    pub fn clear_filter(&mut self) {
        if !self.filter.is_empty() {
            self.filter.clear();
            self.refresh_view();
        }
    }

    pub fn open_detail(&mut self) {
        if self.selected_record().is_some() {
            self.detail_scroll = 0;
            self.mode = Mode::Detail;
        }
    }

    pub fn close_detail(&mut self) {
        self.mode = Mode::Normal;
    }

    pub fn scroll_detail(&mut self, delta: i32) {
        let next = (self.detail_scroll as i32 + delta).clamp(0, u16::MAX as i32);
        self.detail_scroll = next as u16;
    }

    /// Records to export: the marked ones if any, otherwise the whole view.
    /// Enters `Exporting` unless the selection is empty.
    pub fn request_export(&mut self) -> Option<Vec<CommandRecord>> {
        let records: Vec<CommandRecord> = if self.marks.is_empty() {
            self.view().cloned().collect()
        } else {
            self.records
                .iter()
                .filter(|r| self.marks.contains(&r.id))
                .cloned()
                .collect()
        };
        if records.is_empty() {
            self.notice = Some("Nothing to export".to_string());
            return None;
        }
        self.mode = Mode::Exporting;
        Some(records)
    }

    /// Report the outcome of an export started by [`Browser::request_export`].
    pub fn finish_export(&mut self, result: Result<String, String>) {
        self.notice = Some(match result {
            Ok(message) => message,
            Err(error) => format!("Export failed: {error}"),
        });
        self.mode = Mode::Normal;
    }

    fn refresh_view(&mut self) {
        let filter = &self.filter;
        self.view = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| filter.matches(record))
            .map(|(i, _)| i)
            .collect();
        self.selected = 0;
    }
}
