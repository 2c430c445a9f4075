use std::{
    future::{self, Future},
    io::{ErrorKind, SeekFrom},
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::NaiveDate;
use fs4::{fs_std::FileExt, tokio::AsyncFileExt};
use futures::{stream, Stream, StreamExt};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, warn};

use crate::{
    fs::operations::read_last_line,
    utils::time::{date_to_record_name, record_name_to_date},
};

use super::entities::{ActivityEntry, DayRecord};

/// Interface for abstracting storage of classified activity. Entries of one date form a
/// [DayRecord]; appending never reorders or rewrites what is already stored.
pub trait ActivityLog: Send + Sync {
    /// Retrieves every entry stored for `date`. [None] when nothing was ever recorded that day.
    fn get_day_record(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<DayRecord>>> + Send;

    /// Appends `entry` to the record of `date`, creating the record if needed.
    fn append_entry(
        &self,
        date: NaiveDate,
        entry: &ActivityEntry,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<T: Deref + Send + Sync> ActivityLog for T
where
    T::Target: ActivityLog,
{
    fn get_day_record(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<DayRecord>>> + Send {
        self.deref().get_day_record(date)
    }

    fn append_entry(
        &self,
        date: NaiveDate,
        entry: &ActivityEntry,
    ) -> impl Future<Output = Result<()>> + Send {
        self.deref().append_entry(date, entry)
    }
}

/// Records of every day between `start` and `end` (both inclusive) that has one. Days are
/// read a few at a time but yielded in date order.
pub fn read_range<L: ActivityLog>(
    log: L,
    start: NaiveDate,
    end: NaiveDate,
) -> impl Stream<Item = Result<DayRecord>> {
    let log = Arc::new(log);
    date_range(start, end)
        .map(move |day| {
            let log = log.clone();
            async move { log.get_day_record(day).await }
        })
        .buffered(4)
        .filter_map(|v| future::ready(v.transpose()))
}

/// Returns a stream of dates between start (inclusive) and end (inclusive).
fn date_range(start: NaiveDate, end: NaiveDate) -> impl Stream<Item = NaiveDate> {
    stream::unfold(Some(start), move |current| {
        future::ready(match current {
            Some(current) if current <= end => Some((current, current.succ_opt())),
            _ => None,
        })
    })
}

/// The main realization of [ActivityLog]: one JSON-lines file per day. Appends take an exclusive
/// file lock so that separate processes (the daemon and a forced `zeit track`) never interleave
/// partial writes, reads take a shared one.
pub struct JsonActivityLog {
    record_dir: PathBuf,
}

impl JsonActivityLog {
    pub fn new(record_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&record_dir)?;

        Ok(Self { record_dir })
    }

    fn record_path(&self, date: NaiveDate) -> PathBuf {
        self.record_dir.join(date_to_record_name(date))
    }

    /// Opens `path` and waits for its lock on the blocking pool, another holder of the lock may
    /// keep it for the whole duration of its write.
    async fn open_locked(
        path: &Path,
        options: std::fs::OpenOptions,
        exclusive: bool,
    ) -> Result<File, std::io::Error> {
        let path = path.to_owned();
        let file = tokio::task::spawn_blocking(move || {
            let file = options.open(&path)?;
            if exclusive {
                FileExt::lock_exclusive(&file)?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(File::from_std(file))
    }

    /// Opens an existing record for reading. [None] when the record doesn't exist.
    async fn open_shared(path: &Path) -> Result<Option<File>, std::io::Error> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        match Self::open_locked(path, options, false).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Releases a lock after the work on the file is done.
    async fn release<T>(file: &File, path: &Path, outcome: T) -> T {
        Self::settle(path, outcome, file.unlock_async().await)
    }

    /// Closing the file releases the lock anyway, so a failed unlock doesn't undo what was read
    /// or written and is only reported.
    fn settle<T>(path: &Path, outcome: T, unlocked: Result<(), std::io::Error>) -> T {
        if let Err(e) = unlocked {
            warn!("Failed to unlock {path:?} {e}");
        }
        outcome
    }

    async fn read_entries(path: &Path) -> Result<Option<Vec<ActivityEntry>>, std::io::Error> {
        let Some(file) = Self::open_shared(path).await? else {
            return Ok(None);
        };
        debug!("Reading {path:?}");
        let mut lines = BufReader::new(file).lines();
        let mut entries = vec![];
        let read_result = loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<ActivityEntry>(&line) {
                    Ok(v) => entries.push(v),
                    Err(e) => {
                        // A write cut off by a shutdown leaves a broken line behind. Skip it.
                        warn!("Found illegal entry in {:?} {}: {e}", path, &line)
                    }
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        Self::release(lines.into_inner().get_ref(), path, read_result).await?;
        Ok(Some(entries))
    }

    async fn append_with_file(file: &mut File, line: &[u8]) -> Result<()> {
        let length = file.seek(SeekFrom::End(0)).await?;
        let mut buffer = Vec::with_capacity(line.len() + 2);
        if length > 0 {
            file.seek(SeekFrom::Start(length - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!("Record didn't end with a newline, terminating the broken line");
                buffer.push(b'\n');
            }
        }
        buffer.extend_from_slice(line);
        buffer.push(b'\n');
        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Dates that have a record, newest first, with their number of entries.
    pub async fn list_days(&self) -> Result<Vec<(NaiveDate, usize)>> {
        let mut days = vec![];
        let mut dir = tokio::fs::read_dir(&self.record_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let Some(date) = item.file_name().to_str().and_then(record_name_to_date) else {
                continue;
            };
            let count = Self::read_entries(&item.path())
                .await?
                .map_or(0, |v| v.len());
            days.push((date, count));
        }
        days.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(days)
    }

    /// Last entry of `date`, read from the end of the record without parsing the whole day.
    pub async fn last_entry(&self, date: NaiveDate) -> Result<Option<ActivityEntry>> {
        let path = self.record_path(date);
        let Some(mut file) = Self::open_shared(&path).await? else {
            return Ok(None);
        };
        let line = read_last_line(&mut file).await;
        let Some(line) = Self::release(&file, &path, line).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&line) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Last entry of {date} is corrupted {e}");
                Ok(None)
            }
        }
    }

    /// Removes the record of `date`. Administrative operation, the tracker itself never deletes.
    pub async fn delete_day(&self, date: NaiveDate) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(date)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl ActivityLog for JsonActivityLog {
    async fn get_day_record(&self, date: NaiveDate) -> Result<Option<DayRecord>> {
        let entries = Self::read_entries(&self.record_path(date)).await?;
        Ok(entries.map(|entries| DayRecord { date, entries }))
    }

    async fn append_entry(&self, date: NaiveDate, entry: &ActivityEntry) -> Result<()> {
        let line = serde_json::to_vec(entry)?;
        let path = self.record_path(date);
        let mut options = std::fs::OpenOptions::new();
        options.read(true).append(true).create(true);
        let mut file = Self::open_locked(&path, options, true).await?;

        let written = Self::append_with_file(&mut file, &line).await;
        Self::release(&file, &path, written).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        path::Path,
        sync::Arc,
    };

    use anyhow::{anyhow, Result};
    use chrono::{Duration, FixedOffset, NaiveDate, TimeZone};
    use futures::TryStreamExt;
    use tempfile::tempdir;

    use crate::storage::entities::ActivityEntry;

    use super::{read_range, ActivityLog, JsonActivityLog};

    const TEST_DATE: NaiveDate = NaiveDate::from_ymd_opt(2018, 7, 4).unwrap();

    fn entry(minute: i64, activity: &str) -> ActivityEntry {
        let moment = FixedOffset::east_opt(0)
            .unwrap()
            .from_local_datetime(&TEST_DATE.and_hms_opt(9, 0, 0).unwrap())
            .unwrap()
            + Duration::minutes(minute);
        ActivityEntry::new(moment, activity, Some(format!("reason {minute}")), None, None)
    }

    #[tokio::test]
    async fn records_are_created_lazily() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        assert_eq!(log.get_day_record(TEST_DATE).await?, None);
        assert!(std::fs::read_dir(dir.path())?.next().is_none());

        log.append_entry(TEST_DATE, &entry(0, "work_coding")).await?;
        let record = log.get_day_record(TEST_DATE).await?.unwrap();
        assert_eq!(record.date, TEST_DATE);
        assert_eq!(record.entries, vec![entry(0, "work_coding")]);
        Ok(())
    }

    #[tokio::test]
    async fn entries_keep_append_order() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        // Deliberately not chronological: storage order is call order.
        let entries = [entry(5, "slack"), entry(1, "idle"), entry(3, "work_email")];
        for v in &entries {
            log.append_entry(TEST_DATE, v).await?;
        }
        let record = log.get_day_record(TEST_DATE).await?.unwrap();
        assert_eq!(record.entries, entries.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn days_are_partitioned() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        let next_day = TEST_DATE.succ_opt().unwrap();
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;
        log.append_entry(next_day, &entry(1, "slack")).await?;
        log.append_entry(next_day, &entry(2, "slack")).await?;

        assert_eq!(log.get_day_record(TEST_DATE).await?.unwrap().entries.len(), 1);
        assert_eq!(log.list_days().await?, vec![(next_day, 2), (TEST_DATE, 1)]);
        Ok(())
    }

    #[tokio::test]
    async fn broken_lines_are_skipped_and_terminated() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("2018-07-04.jsonl"))?;
        file.write_all(br#"{"timestamp":"2018-07-04T09:01"#)?;
        drop(file);

        log.append_entry(TEST_DATE, &entry(2, "work_email")).await?;
        let record = log.get_day_record(TEST_DATE).await?.unwrap();
        assert_eq!(
            record.entries,
            vec![entry(0, "slack"), entry(2, "work_email")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn last_entry_reads_the_tail() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        assert_eq!(log.last_entry(TEST_DATE).await?, None);
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;
        log.append_entry(TEST_DATE, &entry(1, "zoom_meeting")).await?;
        assert_eq!(log.last_entry(TEST_DATE).await?, Some(entry(1, "zoom_meeting")));
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_day_removes_only_that_day() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        let next_day = TEST_DATE.succ_opt().unwrap();
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;
        log.append_entry(next_day, &entry(0, "slack")).await?;

        assert!(log.delete_day(TEST_DATE).await?);
        assert!(!log.delete_day(TEST_DATE).await?);
        assert_eq!(log.get_day_record(TEST_DATE).await?, None);
        assert!(log.get_day_record(next_day).await?.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_lose_nothing() -> Result<()> {
        let dir = tempdir()?;
        let log = Arc::new(JsonActivityLog::new(dir.path().to_owned())?);
        let tasks = (0..32)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move { log.append_entry(TEST_DATE, &entry(i, "slack")).await })
            })
            .collect::<Vec<_>>();
        let record = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            for task in tasks {
                task.await??;
            }
            log.get_day_record(TEST_DATE).await
        })
        .await??
        .unwrap();
        assert_eq!(record.entries.len(), 32);
        let mut minutes = record
            .entries
            .iter()
            .map(|v| v.reasoning.clone().unwrap())
            .collect::<Vec<_>>();
        minutes.sort();
        minutes.dedup();
        assert_eq!(minutes.len(), 32);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_and_writers_share_few_workers() -> Result<()> {
        let dir = tempdir()?;
        let log = Arc::new(JsonActivityLog::new(dir.path().to_owned())?);
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;

        let tasks = (1..=24)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        log.append_entry(TEST_DATE, &entry(i, "work_email")).await?;
                    } else {
                        assert!(log.get_day_record(TEST_DATE).await?.is_some());
                        assert!(log.last_entry(TEST_DATE).await?.is_some());
                    }
                    anyhow::Ok(())
                })
            })
            .collect::<Vec<_>>();
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            for task in tasks {
                task.await??;
            }
            anyhow::Ok(())
        })
        .await??;

        let record = log.get_day_record(TEST_DATE).await?.unwrap();
        assert_eq!(record.entries.len(), 13);
        Ok(())
    }

    #[test]
    fn failed_unlock_keeps_the_outcome() {
        let path = Path::new("2018-07-04.jsonl");
        let written = JsonActivityLog::settle(path, anyhow::Ok(()), Err(io::Error::other("EBADF")));
        assert!(written.is_ok());
        let failed = JsonActivityLog::settle(path, Err::<(), _>(anyhow!("disk full")), Ok(()));
        assert_eq!(failed.unwrap_err().to_string(), "disk full");
    }

    #[tokio::test]
    async fn ranges_skip_days_without_records() -> Result<()> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().to_owned())?;
        let third_day = TEST_DATE + Duration::days(2);
        log.append_entry(TEST_DATE, &entry(0, "slack")).await?;
        log.append_entry(third_day, &entry(1, "work_coding")).await?;

        let records: Vec<_> = read_range(&log, TEST_DATE, TEST_DATE + Duration::days(5))
            .try_collect()
            .await?;
        assert_eq!(
            records.iter().map(|v| v.date).collect::<Vec<_>>(),
            vec![TEST_DATE, third_day]
        );

        let empty: Vec<_> = read_range(&log, third_day, TEST_DATE).try_collect().await?;
        assert!(empty.is_empty());
        Ok(())
    }
}
