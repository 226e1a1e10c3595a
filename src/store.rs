use crate::filter::Filter;
use crate::record::{decode_line, encode_line, CommandRecord, SessionRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const COMMANDS_FILE: &str = "commands.jsonl";
const SESSIONS_FILE: &str = "sessions.jsonl";

/// Append-only JSON-lines store with one file per stream.
///
/// Every entry is written with a single `write_all` on a descriptor opened in
/// append mode, so concurrent writers from separate processes never interleave
/// inside an entry. Readers ignore a trailing entry that has no newline yet.
pub struct LogStore {
    base_dir: PathBuf,
    commands_path: PathBuf,
    sessions_path: PathBuf,
}

/// What a sequential scan saw besides the entries it handed out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub entries: usize,
    pub skipped: usize,
    pub incomplete_tail: bool,
    // Offset just past the last newline-terminated entry
    pub complete_bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub kept: usize,
    pub sessions_removed: usize,
}

impl LogStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create data directory: {}", base_dir.display()))?;

        Ok(Self {
            commands_path: base_dir.join(COMMANDS_FILE),
            sessions_path: base_dir.join(SESSIONS_FILE),
            base_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn commands_path(&self) -> &Path {
        &self.commands_path
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    pub fn commands_size(&self) -> u64 {
        fs::metadata(&self.commands_path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn append_command(&self, record: &CommandRecord) -> Result<()> {
        record.validate().context("Refusing to store invalid command record")?;
        append_entry(&self.commands_path, record)
    }

    pub fn append_session(&self, session: &SessionRecord) -> Result<()> {
        session.validate().context("Refusing to store invalid session record")?;
        append_entry(&self.sessions_path, session)
    }

    /// Visit every complete command entry in file order.
    pub fn scan_commands<F: FnMut(CommandRecord)>(&self, visit: F) -> Result<ScanStats> {
        scan_entries(&self.commands_path, visit)
    }

    pub fn read_commands(&self) -> Result<Vec<CommandRecord>> {
        let mut commands = Vec::new();
        self.scan_commands(|record| commands.push(record))?;
        Ok(commands)
    }

    /// The `limit` most recent commands by start time among those matching
    /// `filter`, oldest first. Memory stays bounded by `limit`.
    pub fn tail_commands(&self, limit: usize, filter: &Filter) -> Result<Vec<CommandRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(limit + 1);
        let mut seq = 0u64;
        self.scan_commands(|record| {
            if !filter.matches(&record) {
                return;
            }
            heap.push(Reverse(Ranked { seq, record }));
            seq += 1;
            if heap.len() > limit {
                heap.pop();
            }
        })?;

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(r)| r).collect();
        ranked.sort();
        Ok(ranked.into_iter().map(|r| r.record).collect())
    }

    /// Sessions folded per id, ordered by start.
    pub fn read_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut folded: HashMap<String, SessionRecord> = HashMap::new();
        scan_entries(&self.sessions_path, |entry: SessionRecord| {
            match folded.get_mut(&entry.session_id) {
                Some(existing) => {
                    if entry.started_at < existing.started_at {
                        existing.started_at = entry.started_at;
                    }
                    if entry.ended_at > existing.ended_at {
                        existing.ended_at = entry.ended_at;
                    }
                }
                None => {
                    folded.insert(entry.session_id.clone(), entry);
                }
            }
        })?;

        let mut sessions: Vec<SessionRecord> = folded.into_values().collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    pub fn session_exists(&self, session_id: &str) -> Result<bool> {
        let mut found = false;
        scan_entries(&self.sessions_path, |entry: SessionRecord| {
            found |= entry.session_id == session_id;
        })?;
        Ok(found)
    }

    /// Append `session` unless its id is already known. Returns whether it was written.
    pub fn ensure_session(&self, session: &SessionRecord) -> Result<bool> {
        if self.session_exists(&session.session_id)? {
            return Ok(false);
        }
        self.append_session(session)?;
        Ok(true)
    }

    /// Record the end of a session by appending a closing entry.
    pub fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<SessionRecord> {
        let session = self
            .read_sessions()?
            .into_iter()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| anyhow!("Session not found: {}", session_id))?;

        let closed = SessionRecord {
            ended_at: Some(ended_at.max(session.started_at)),
            ..session
        };
        self.append_session(&closed)?;
        Ok(closed)
    }

    /// Drop every command that started before `cutoff`, and every session
    /// that started before it and has no surviving command.
    ///
    /// Files are replaced by writing a sibling temp file and renaming it over
    /// the live file; an interrupted prune leaves the live file untouched.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        let mut kept: Vec<CommandRecord> = Vec::new();
        let stats = self.scan_commands(|record| {
            if record.start_time < cutoff {
                report.removed += 1;
            } else {
                kept.push(record);
            }
        })?;
        report.kept = kept.len();

        if report.removed > 0 {
            replace_atomically(&self.commands_path, &kept, stats.complete_bytes)
                .context("Failed to rewrite commands file")?;
            debug!(removed = report.removed, kept = report.kept, "pruned commands");
        }

        let surviving: HashSet<&str> = kept.iter().map(|r| r.session_id.as_str()).collect();
        let mut sessions_total = 0usize;
        let mut sessions_kept: Vec<SessionRecord> = Vec::new();
        let session_stats = scan_entries(&self.sessions_path, |entry: SessionRecord| {
            sessions_total += 1;
            if entry.started_at >= cutoff || surviving.contains(entry.session_id.as_str()) {
                sessions_kept.push(entry);
            }
        })?;

        let dropped_entries = sessions_total - sessions_kept.len();
        if dropped_entries > 0 {
            let before: HashSet<String> = self
                .read_sessions()?
                .into_iter()
                .map(|s| s.session_id)
                .collect();
            replace_atomically(&self.sessions_path, &sessions_kept, session_stats.complete_bytes)
                .context("Failed to rewrite sessions file")?;
            let after: HashSet<&str> =
                sessions_kept.iter().map(|s| s.session_id.as_str()).collect();
            report.sessions_removed =
                before.iter().filter(|id| !after.contains(id.as_str())).count();
        }

        Ok(report)
    }
}

struct Ranked {
    seq: u64,
    record: CommandRecord,
}

impl Ranked {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.record.start_time, self.seq)
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

fn append_entry<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    let line = encode_line(entry)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open store file: {}", path.display()))?;

    // One write per entry: the append unit is the whole line
    file.write_all(&line)
        .with_context(|| format!("Failed to append to store file: {}", path.display()))?;
    Ok(())
}

fn scan_entries<T, F>(path: &Path, mut visit: F) -> Result<ScanStats>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ScanStats::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to open store file: {}", path.display()))
        }
    };

    let mut reader = BufReader::new(file);
    let mut stats = ScanStats::default();
    let mut line = Vec::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        if line.last() != Some(&b'\n') {
            // A writer is mid-append or crashed; not an entry yet
            debug!(path = %path.display(), line_no, "ignoring unterminated trailing entry");
            stats.incomplete_tail = true;
            break;
        }
        stats.complete_bytes += read as u64;

        let body = &line[..line.len() - 1];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match decode_line::<T>(body) {
            Ok(entry) => {
                stats.entries += 1;
                visit(entry);
            }
            Err(err) => {
                stats.skipped += 1;
                warn!(path = %path.display(), line_no, "skipping unreadable entry: {err:#}");
            }
        }
    }

    Ok(stats)
}

/// Write `entries` to a temp file next to `path`, carry over anything other
/// writers appended after `snapshot_len`, then rename it over `path`.
fn replace_atomically<T: Serialize>(path: &Path, entries: &[T], snapshot_len: u64) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

    {
        let mut writer = BufWriter::new(&mut tmp);
        for entry in entries {
            writer.write_all(&encode_line(entry)?)?;
        }
        writer.flush()?;
    }

    let late = appended_since(path, snapshot_len)?;
    if !late.is_empty() {
        debug!(bytes = late.len(), "carrying over entries appended during rewrite");
        tmp.write_all(&late)?;
    }

    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Complete entries past `offset`.
fn appended_since(path: &Path, offset: u64) -> Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() <= offset {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    match tail.iter().rposition(|&b| b == b'\n') {
        Some(last) => tail.truncate(last + 1),
        None => tail.clear(),
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn session(id: &str, started_secs: i64) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            shell: "bash".to_string(),
            hostname: "localhost".to_string(),
            started_at: Utc.timestamp_opt(started_secs, 0).unwrap(),
            ended_at: None,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();

        store.append_command(&sample("1", "s1", "echo hello", b"hello\n", 100)).unwrap();
        store.append_command(&sample("2", "s1", "ls -la", b"total 0\n", 200)).unwrap();

        let commands = store.read_commands().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "echo hello");
        assert_eq!(commands[1].output, b"total 0\n");
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path().join("nested")).unwrap();
        assert!(store.read_commands().unwrap().is_empty());
        assert!(store.read_sessions().unwrap().is_empty());
        assert!(!store.session_exists("s1").unwrap());
    }

    #[test]
    fn invalid_record_is_not_written() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        let mut record = sample("1", "s1", "ls", b"", 100);
        record.end_time = record.start_time - Duration::seconds(5);

        assert!(store.append_command(&record).is_err());
        assert!(!store.commands_path().exists());
    }

    #[test]
    fn unterminated_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        store.append_command(&sample("1", "s1", "one", b"", 100)).unwrap();
        store.append_command(&sample("2", "s1", "two", b"", 200)).unwrap();

        let partial = encode_line(&sample("3", "s1", "three", b"", 300)).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.commands_path()).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();

        let mut seen = Vec::new();
        let stats = store.scan_commands(|r| seen.push(r.id)).unwrap();
        assert_eq!(seen, vec!["1", "2"]);
        assert!(stats.incomplete_tail);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn corrupt_terminated_entry_is_skipped() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        store.append_command(&sample("1", "s1", "one", b"", 100)).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.commands_path()).unwrap();
        file.write_all(b"{\"id\": \"broken\n\n").unwrap();
        drop(file);
        store.append_command(&sample("2", "s1", "two", b"", 200)).unwrap();

        let mut seen = Vec::new();
        let stats = store.scan_commands(|r| seen.push(r.id)).unwrap();
        assert_eq!(seen, vec!["1", "2"]);
        assert_eq!(stats.skipped, 1);
        assert!(!stats.incomplete_tail);
    }

    #[test]
    fn concurrent_appenders_never_interleave() {
        let dir = tempdir().unwrap();
        let base = Arc::new(dir.path().to_path_buf());
        let writers = 8;
        let per_writer = 50;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let base = Arc::clone(&base);
                thread::spawn(move || {
                    let store = LogStore::open(base.as_path()).unwrap();
                    for i in 0..per_writer {
                        let output = vec![b'a' + (w as u8); 64 + i * 97];
                        let record = sample(
                            &format!("w{w}-{i}"),
                            &format!("s{w}"),
                            &format!("writer {w} entry {i}"),
                            &output,
                            1_000 + i as i64,
                        );
                        store.append_command(&record).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = LogStore::open(base.as_path()).unwrap();
        let mut ids = HashSet::new();
        let stats = store
            .scan_commands(|record| {
                let w = record.session_id[1..].parse::<u8>().unwrap();
                assert!(record.output.iter().all(|&b| b == b'a' + w));
                ids.insert(record.id);
            })
            .unwrap();

        assert_eq!(stats.skipped, 0);
        assert!(!stats.incomplete_tail);
        assert_eq!(ids.len(), writers * per_writer);
    }

    #[test]
    fn tail_selects_latest_start_times() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        // Appended out of start order, as long-running commands finish late
        for (id, start) in [("a", 300), ("b", 100), ("c", 500), ("d", 200), ("e", 400)] {
            store.append_command(&sample(id, "s1", id, b"", start)).unwrap();
        }

        let tail = store.tail_commands(3, &Filter::default()).unwrap();
        let ids: Vec<&str> = tail.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "e", "c"]);
        assert!(store.tail_commands(0, &Filter::default()).unwrap().is_empty());
    }

    #[test]
    fn tail_filters_before_taking() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        store.append_command(&sample("1", "s1", "git status", b"", 100)).unwrap();
        store.append_command(&sample("2", "s1", "ls", b"", 200)).unwrap();
        store.append_command(&sample("3", "s1", "git log", b"", 300)).unwrap();
        store.append_command(&sample("4", "s1", "pwd", b"", 400)).unwrap();

        let tail = store.tail_commands(2, &Filter::new("git")).unwrap();
        let ids: Vec<&str> = tail.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn sessions_fold_and_end() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();

        assert!(store.ensure_session(&session("s1", 100)).unwrap());
        assert!(!store.ensure_session(&session("s1", 150)).unwrap());
        assert!(store.ensure_session(&session("s2", 50)).unwrap());

        let end = Utc.timestamp_opt(900, 0).unwrap();
        let closed = store.end_session("s1", end).unwrap();
        assert_eq!(closed.ended_at, Some(end));

        let sessions = store.read_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s2");
        assert_eq!(sessions[1].session_id, "s1");
        assert_eq!(sessions[1].started_at, Utc.timestamp_opt(100, 0).unwrap());
        assert_eq!(sessions[1].ended_at, Some(end));

        assert!(store.end_session("missing", end).is_err());
    }

    #[test]
    fn prune_keeps_newer_records() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        for (id, start) in [("1", 100), ("2", 200), ("3", 300)] {
            store.append_command(&sample(id, "s1", id, b"x", start)).unwrap();
        }

        let cutoff = Utc.timestamp_opt(200, 0).unwrap();
        let report = store.prune_before(cutoff).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.kept, 2);

        let ids: Vec<String> = store.read_commands().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn prune_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        for (id, start) in [("1", 100), ("2", 200), ("3", 300), ("4", 400)] {
            store.append_command(&sample(id, "s1", id, b"", start)).unwrap();
        }
        let cutoff = Utc.timestamp_opt(250, 0).unwrap();

        store.prune_before(cutoff).unwrap();
        let once: Vec<CommandRecord> = store.read_commands().unwrap();
        let second = store.prune_before(cutoff).unwrap();
        let twice: Vec<CommandRecord> = store.read_commands().unwrap();

        assert_eq!(second.removed, 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn prune_cutoff_scenarios() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        let now = Utc::now();
        for i in 0..3 {
            let mut record = sample(&i.to_string(), "s1", "echo", b"", 0);
            record.start_time = now - Duration::minutes(10 - i);
            record.end_time = record.start_time + Duration::seconds(1);
            store.append_command(&record).unwrap();
        }

        let report = store.prune_before(now - Duration::days(30)).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(store.read_commands().unwrap().len(), 3);

        let report = store.prune_before(Utc::now()).unwrap();
        assert_eq!(report.removed, 3);
        assert!(store.read_commands().unwrap().is_empty());
    }

    #[test]
    fn prune_drops_orphaned_old_sessions() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        store.append_session(&session("old", 100)).unwrap();
        store.append_session(&session("busy", 100)).unwrap();
        store.append_session(&session("new", 900)).unwrap();
        store.append_command(&sample("1", "old", "a", b"", 150)).unwrap();
        store.append_command(&sample("2", "busy", "b", b"", 950)).unwrap();

        let report = store.prune_before(Utc.timestamp_opt(500, 0).unwrap()).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.sessions_removed, 1);

        let ids: Vec<String> =
            store.read_sessions().unwrap().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["busy", "new"]);
    }

    #[test]
    fn rewrite_carries_late_appends() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        store.append_command(&sample("1", "s1", "a", b"", 100)).unwrap();
        let snapshot = store.commands_size();
        store.append_command(&sample("2", "s1", "b", b"", 200)).unwrap();

        let kept = vec![sample("1", "s1", "a", b"", 100)];
        replace_atomically(store.commands_path(), &kept, snapshot).unwrap();

        let ids: Vec<String> = store.read_commands().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
