use crate::{
    aggregate::{AggregateDocument, ArchivedTick},
    error::StorageError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{debug, warn};

/// Durable batch store for aggregate documents.
///
/// A single long-lived handle is opened at process start and shared by every writer.
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn insert_many(&self, documents: &[AggregateDocument]) -> Result<(), StorageError>;

    /// Replace every document previously stored for the session on `date` with `documents`.
    async fn replace_session(
        &self,
        date: NaiveDate,
        documents: &[AggregateDocument],
    ) -> Result<(), StorageError>;
}

/// Read access to archived raw ticks for offline reconstruction.
#[async_trait]
pub trait TickArchive: Send + Sync {
    /// Every archived tick received on the `date` (market local time), in archive order.
    async fn ticks_on(&self, date: NaiveDate) -> Result<Vec<ArchivedTick>, StorageError>;
}

/// Append-only JSON lines file, one [`AggregateDocument`] per line.
///
/// Session replacements are written to a sibling file per date (see
/// [`JsonLinesSink::session_path`]), leaving the live append-only file untouched.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open (creating if required) the file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|error| StorageError::Unavailable(format!("{}: {error}", path.display())))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File holding the replaced session documents for `date`.
    pub fn session_path(&self, date: NaiveDate) -> PathBuf {
        self.path.with_extension(format!("session.{date}.jsonl"))
    }
}

fn encode_lines(documents: &[AggregateDocument]) -> Result<Vec<u8>, StorageError> {
    let mut lines = Vec::with_capacity(documents.len() * 192);
    for document in documents {
        serde_json::to_writer(&mut lines, document)?;
        lines.push(b'\n');
    }
    Ok(lines)
}

#[async_trait]
impl AggregateSink for JsonLinesSink {
    async fn insert_many(&self, documents: &[AggregateDocument]) -> Result<(), StorageError> {
        if documents.is_empty() {
            return Ok(());
        }

        let lines = encode_lines(documents)?;

        let mut file = self.file.lock().await;
        let write = async {
            file.write_all(&lines).await?;
            file.flush().await
        };
        write.await.map_err(|error| StorageError::Insert {
            count: documents.len(),
            reason: error.to_string(),
        })?;

        debug!(count = documents.len(), path = %self.path.display(), "inserted documents");
        Ok(())
    }

    async fn replace_session(
        &self,
        date: NaiveDate,
        documents: &[AggregateDocument],
    ) -> Result<(), StorageError> {
        let lines = encode_lines(documents)?;
        let target = self.session_path(date);
        let staging = target.with_extension("jsonl.tmp");

        // Readers only ever see a complete session file
        let replace = async {
            tokio::fs::write(&staging, &lines).await?;
            tokio::fs::rename(&staging, &target).await
        };
        replace.await.map_err(|error| StorageError::Insert {
            count: documents.len(),
            reason: format!("{}: {error}", target.display()),
        })?;

        debug!(count = documents.len(), path = %target.display(), "replaced session documents");
        Ok(())
    }
}

/// [`TickArchive`] reading the raw ticks written by a [`JsonLinesSink`].
#[derive(Debug, Clone)]
pub struct JsonLinesArchive {
    path: PathBuf,
}

impl JsonLinesArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TickArchive for JsonLinesArchive {
    async fn ticks_on(&self, date: NaiveDate) -> Result<Vec<ArchivedTick>, StorageError> {
        let unavailable = |error: std::io::Error| {
            StorageError::Unavailable(format!("{}: {error}", self.path.display()))
        };

        let file = File::open(&self.path).await.map_err(unavailable)?;
        let mut lines = BufReader::new(file).lines();

        let mut ticks = Vec::new();
        let mut line_number = 0;
        while let Some(line) = lines.next_line().await.map_err(unavailable)? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AggregateDocument>(&line) {
                Ok(AggregateDocument::Tick(tick)) if tick.received_at.date_naive() == date => {
                    ticks.push(tick)
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(line = line_number, %error, "skipping unreadable archive line")
                }
            }
        }

        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::MinuteVolumeBucket,
        test_util::{archived_tick, instrument, temp_path, time},
    };

    #[tokio::test]
    async fn test_json_lines_sink_round_trips_archive() {
        let path = temp_path("sink");
        let sink = JsonLinesSink::open(&path).await.unwrap();

        let bucket = MinuteVolumeBucket::new(&instrument("X", "X"), time(9, 15, 0), 1, 2, 3);
        let tick = archived_tick("X", 100.0, time(9, 15, 10), 1000);

        sink.insert_many(&[
            AggregateDocument::from(bucket.clone()),
            AggregateDocument::from(tick.clone()),
        ])
        .await
        .unwrap();
        sink.insert_many(&[]).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(raw.lines().count(), 2);

        let archive = JsonLinesArchive::new(&path);
        let actual = archive.ticks_on(time(9, 0, 0).date_naive()).await.unwrap();
        assert_eq!(actual, vec![tick]);

        let other_day = NaiveDate::from_ymd_opt(2025, 1, 21).unwrap();
        assert!(archive.ticks_on(other_day).await.unwrap().is_empty());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_json_lines_archive_skips_unreadable_lines() {
        let path = temp_path("archive");
        let tick = archived_tick("X", 100.0, time(9, 15, 10), 1000);
        let raw = format!(
            "{}\n\nnot json\n{}\n",
            serde_json::to_string(&AggregateDocument::from(tick.clone())).unwrap(),
            serde_json::to_string(&AggregateDocument::from(tick.clone())).unwrap(),
        );
        tokio::fs::write(&path, raw).await.unwrap();

        let actual = JsonLinesArchive::new(&path)
            .ticks_on(time(9, 0, 0).date_naive())
            .await
            .unwrap();
        assert_eq!(actual, vec![tick.clone(), tick]);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_json_lines_sink_replace_session_overwrites_previous_output() {
        let path = temp_path("replace");
        let sink = JsonLinesSink::open(&path).await.unwrap();
        let date = time(9, 0, 0).date_naive();
        let x = instrument("X", "X");

        let first = (15..20)
            .map(|minute| MinuteVolumeBucket::new(&x, time(9, minute, 0), 1, 0, 1).into())
            .collect::<Vec<AggregateDocument>>();
        let second = (15..18)
            .map(|minute| MinuteVolumeBucket::new(&x, time(9, minute, 0), 2, 0, 2).into())
            .collect::<Vec<AggregateDocument>>();

        sink.replace_session(date, &first).await.unwrap();
        sink.replace_session(date, &second).await.unwrap();

        let raw = tokio::fs::read_to_string(sink.session_path(date)).await.unwrap();
        let actual = raw
            .lines()
            .map(|line| serde_json::from_str::<AggregateDocument>(line).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(actual, second);

        // The live append-only file is untouched
        let live = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(live.is_empty());

        let _ = tokio::fs::remove_file(sink.session_path(date)).await;
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_json_lines_archive_missing_file() {
        let archive = JsonLinesArchive::new(temp_path("missing"));
        let actual = archive.ticks_on(time(9, 0, 0).date_naive()).await;
        assert!(matches!(actual, Err(StorageError::Unavailable(_))));
    }
}
