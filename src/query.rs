use crate::filter::Filter;
use crate::record::CommandRecord;
use crate::store::{LogStore, PruneReport};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Read-side operations over a [`LogStore`].
pub struct QueryEngine<'a> {
    store: &'a LogStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub total_commands: usize,
    pub distinct_sessions: usize,
    pub successful: usize,
    // In [0, 1]; 0 for an empty store
    pub success_rate: f64,
    pub top_commands: Vec<(String, usize)>,
    pub mean_duration: Duration,
    pub longest: Option<CommandRecord>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub store_bytes: u64,
    pub skipped_entries: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    NothingToPrune,
    Declined { candidates: usize },
    Pruned(PruneReport),
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store }
    }

    /// The last `limit` records among those matching `filter`, oldest first.
    pub fn list(&self, limit: usize, filter: &Filter) -> Result<Vec<CommandRecord>> {
        self.store.tail_commands(limit, filter)
    }

    /// Every record matching `filter` (and `session`, when given), oldest first.
    pub fn select(&self, session: Option<&str>, filter: &Filter) -> Result<Vec<CommandRecord>> {
        let mut selected: Vec<CommandRecord> = self
            .store
            .read_commands()?
            .into_iter()
            .filter(|record| {
                session.map_or(true, |id| record.session_id == id) && filter.matches(record)
            })
            .collect();
        selected.sort_by_key(|record| record.start_time);
        Ok(selected)
    }

    pub fn stats(&self, top_n: usize) -> Result<Stats> {
        let mut total = 0usize;
        let mut successful = 0usize;
        let mut sessions = HashSet::new();
        let mut programs: HashMap<String, usize> = HashMap::new();
        let mut total_duration = Duration::zero();
        let mut longest: Option<CommandRecord> = None;
        let mut first_seen: Option<DateTime<Utc>> = None;
        let mut last_seen: Option<DateTime<Utc>> = None;

        let scan = self.store.scan_commands(|record| {
            total += 1;
            if record.succeeded() {
                successful += 1;
            }
            sessions.insert(record.session_id.clone());
            let program = record.program();
            if !program.is_empty() {
                *programs.entry(program.to_string()).or_insert(0) += 1;
            }
            total_duration = total_duration + record.duration();
            first_seen = Some(first_seen.map_or(record.start_time, |t| t.min(record.start_time)));
            last_seen = Some(last_seen.map_or(record.start_time, |t| t.max(record.start_time)));
            if longest.as_ref().map_or(true, |l| record.duration() > l.duration()) {
                longest = Some(record);
            }
        })?;

        let mut top_commands: Vec<(String, usize)> = programs.into_iter().collect();
        top_commands.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_commands.truncate(top_n);

        let (success_rate, mean_duration) = if total == 0 {
            (0.0, Duration::zero())
        } else {
            (
                successful as f64 / total as f64,
                total_duration / total as i32,
            )
        };

        Ok(Stats {
            total_commands: total,
            distinct_sessions: sessions.len(),
            successful,
            success_rate,
            top_commands,
            mean_duration,
            longest,
            first_seen,
            last_seen,
            store_bytes: self.store.commands_size(),
            skipped_entries: scan.skipped,
        })
    }

    /// Remove records older than `older_than`. Candidates are counted first;
    /// unless `assume_yes`, `confirm` sees the count and must approve.
    pub fn prune<F>(
        &self,
        older_than: Duration,
        assume_yes: bool,
        confirm: F,
    ) -> Result<PruneOutcome>
    where
        F: FnOnce(usize, DateTime<Utc>) -> bool,
    {
        let cutoff = Utc::now()
            .checked_sub_signed(older_than)
            .ok_or_else(|| anyhow!("Retention of {} days is out of range", older_than.num_days()))?;
        self.prune_before(cutoff, assume_yes, confirm)
    }

    pub fn prune_before<F>(
        &self,
        cutoff: DateTime<Utc>,
        assume_yes: bool,
        confirm: F,
    ) -> Result<PruneOutcome>
    where
        F: FnOnce(usize, DateTime<Utc>) -> bool,
    {
        let mut candidates = 0usize;
        self.store.scan_commands(|record| {
            if record.start_time < cutoff {
                candidates += 1;
            }
        })?;

        if candidates == 0 {
            return Ok(PruneOutcome::NothingToPrune);
        }
        if !assume_yes && !confirm(candidates, cutoff) {
            return Ok(PruneOutcome::Declined { candidates });
        }
        Ok(PruneOutcome::Pruned(self.store.prune_before(cutoff)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample;
    use tempfile::tempdir;

    fn store_with(records: &[CommandRecord]) -> (tempfile::TempDir, LogStore) {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        for record in records {
            store.append_command(record).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn single_echo_session() {
        let echo = sample("1", "S1", "echo hi", b"hi\n", 1_700_000_000);
        let (_dir, store) = store_with(&[echo.clone()]);
        let query = QueryEngine::new(&store);

        assert_eq!(query.list(1, &Filter::default()).unwrap(), vec![echo]);

        let stats = query.stats(10).unwrap();
        assert_eq!(stats.total_commands, 1);
        assert_eq!(stats.distinct_sessions, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.top_commands, vec![("echo".to_string(), 1)]);
    }

    #[test]
    fn empty_store_stats() {
        let (_dir, store) = store_with(&[]);
        let stats = QueryEngine::new(&store).stats(10).unwrap();
        assert_eq!(stats.total_commands, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.mean_duration, Duration::zero());
        assert!(stats.longest.is_none());
        assert!(stats.top_commands.is_empty());
    }

    #[test]
    fn stats_rank_programs_and_sessions() {
        let mut failed = sample("3", "s2", "cargo test", b"", 300);
        failed.exit_code = 101;
        failed.end_time = failed.start_time + Duration::seconds(4);
        let records = vec![
            sample("1", "s1", "git status", b"", 100),
            sample("2", "s1", "cargo build", b"", 200),
            failed.clone(),
            sample("4", "s3", "git log", b"", 400),
            sample("5", "s3", "ls", b"", 500),
        ];
        let (_dir, store) = store_with(&records);

        let stats = QueryEngine::new(&store).stats(2).unwrap();
        assert_eq!(stats.total_commands, 5);
        assert_eq!(stats.distinct_sessions, 3);
        assert_eq!(stats.successful, 4);
        assert!((stats.success_rate - 0.8).abs() < f64::EPSILON);
        assert_eq!(
            stats.top_commands,
            vec![("cargo".to_string(), 2), ("git".to_string(), 2)]
        );
        assert_eq!(stats.longest, Some(failed));
        // (4 * 15ms + 4000ms) / 5
        assert_eq!(stats.mean_duration, Duration::milliseconds(812));
        assert!(stats.store_bytes > 0);
    }

    #[test]
    fn select_by_session_and_filter() {
        let records = vec![
            sample("1", "s1", "make", b"ok", 300),
            sample("2", "s2", "make", b"ok", 100),
            sample("3", "s1", "ls", b"Makefile", 200),
        ];
        let (_dir, store) = store_with(&records);
        let query = QueryEngine::new(&store);

        let ids: Vec<_> = query
            .select(Some("s1"), &Filter::default())
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["3", "1"]);

        let ids: Vec<_> = query
            .select(None, &Filter::new("make"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn prune_asks_before_deleting() {
        let records = vec![sample("1", "s1", "old", b"", 100), sample("2", "s1", "new", b"", 900)];
        let (_dir, store) = store_with(&records);
        let query = QueryEngine::new(&store);
        let cutoff = records[1].start_time;

        let mut seen = None;
        let outcome = query
            .prune_before(cutoff, false, |count, _| {
                seen = Some(count);
                false
            })
            .unwrap();
        assert_eq!(seen, Some(1));
        assert_eq!(outcome, PruneOutcome::Declined { candidates: 1 });
        assert_eq!(store.read_commands().unwrap().len(), 2);

        let outcome = query.prune_before(cutoff, true, |_, _| false).unwrap();
        assert!(matches!(outcome, PruneOutcome::Pruned(PruneReport { removed: 1, kept: 1, .. })));

        let outcome = query.prune_before(cutoff, true, |_, _| true).unwrap();
        assert_eq!(outcome, PruneOutcome::NothingToPrune);
    }

    #[test]
    fn prune_by_age_keeps_recent_records() {
        let mut recent = sample("1", "s1", "recent", b"", 0);
        recent.start_time = Utc::now() - Duration::days(1);
        recent.end_time = recent.start_time;
        let (_dir, store) = store_with(&[recent, sample("2", "s1", "ancient", b"", 100)]);

        let outcome = QueryEngine::new(&store)
            .prune(Duration::days(90), true, |_, _| true)
            .unwrap();
        assert!(matches!(outcome, PruneOutcome::Pruned(PruneReport { removed: 1, kept: 1, .. })));
    }

    #[test]
    fn out_of_range_retention_is_an_error() {
        let (_dir, store) = store_with(&[sample("1", "s1", "ls", b"", 100)]);
        let query = QueryEngine::new(&store);

        let err = query
            .prune(Duration::days(u32::MAX as i64), true, |_, _| true)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(store.read_commands().unwrap().len(), 1);
    }
}
