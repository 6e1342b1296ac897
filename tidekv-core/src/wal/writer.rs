//! WAL writer: page ring, segment file and background flush task

use super::reader::{list_segments, segment_path};
use super::{BufferPage, FsyncPolicy, WalConfig, WalError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ring of buffer pages.
///
/// `append_seq` names the page accepting writes; pages in
/// `flush_seq..append_seq` are sealed and waiting for disk. Page `seq` lives
/// at index `seq % pages.len()`.
struct Ring {
    pages: Vec<BufferPage>,
    append_seq: u64,
    flush_seq: u64,
}

impl Ring {
    fn slot(&self, seq: u64) -> usize {
        (seq % self.pages.len() as u64) as usize
    }

    fn current(&mut self) -> &mut BufferPage {
        let slot = self.slot(self.append_seq);
        &mut self.pages[slot]
    }

    /// Sealing the current page must leave one free slot for the next one
    fn can_advance(&self) -> bool {
        self.append_seq + 1 - self.flush_seq < self.pages.len() as u64
    }

    fn sealed(&self) -> u64 {
        self.append_seq - self.flush_seq
    }

    /// Drain the oldest sealed page
    fn take_oldest(&mut self) -> Option<Vec<Bytes>> {
        if self.flush_seq == self.append_seq {
            return None;
        }
        let slot = self.slot(self.flush_seq);
        self.flush_seq += 1;
        Some(self.pages[slot].drain())
    }

    /// Drain every sealed page, then the current page, in sequence order
    fn take_all(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(mut page) = self.take_oldest() {
            chunks.append(&mut page);
        }
        chunks.append(&mut self.current().drain());
        chunks
    }
}

/// The open segment file
struct SegmentFile {
    writer: BufWriter<File>,
    number: u64,
    path: PathBuf,
}

impl SegmentFile {
    fn open(config: &WalConfig, number: u64) -> Result<Self, WalError> {
        let path = segment_path(&config.dir, number);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            number,
            path,
        })
    }

    fn write_chunks(&mut self, chunks: &[Bytes]) -> Result<usize, WalError> {
        let mut written = 0;
        for chunk in chunks {
            self.writer.write_all(chunk)?;
            written += chunk.len();
        }
        self.writer.flush()?;
        Ok(written)
    }

    fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Paged write-ahead log.
///
/// Lock order is `io` then `ring`. The ring lock is never held across file
/// I/O, so appends only wait on the disk when the ring is saturated.
pub struct Wal {
    config: WalConfig,
    ring: Mutex<Ring>,
    io: Mutex<SegmentFile>,
    flush_requested: Notify,
    closed: AtomicBool,
    bytes_written: AtomicU64,
}

impl Wal {
    /// Open the WAL, appending to the newest segment numbered at least
    /// `min_segment`
    pub fn open(config: WalConfig, min_segment: u64) -> Result<Self, WalError> {
        if config.page_count < 2 {
            return Err(WalError::TooFewPages(config.page_count));
        }
        if config.page_size == 0 {
            return Err(WalError::ZeroPageSize);
        }
        std::fs::create_dir_all(&config.dir)?;

        let newest = list_segments(&config.dir)?
            .last()
            .map(|(number, _)| *number)
            .unwrap_or(0);
        let segment = SegmentFile::open(&config, newest.max(min_segment))?;
        info!(
            "WAL opened at {} ({} pages of {} bytes, fsync {:?})",
            segment.path.display(),
            config.page_count,
            config.page_size,
            config.fsync
        );

        let pages = (0..config.page_count)
            .map(|_| BufferPage::new(config.page_size))
            .collect();

        Ok(Self {
            ring: Mutex::new(Ring {
                pages,
                append_seq: 0,
                flush_seq: 0,
            }),
            io: Mutex::new(segment),
            flush_requested: Notify::new(),
            closed: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Number of the segment currently being appended to
    pub fn current_segment(&self) -> u64 {
        self.io.lock().number
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Buffer one record.
    ///
    /// Blocks on disk only when every page holds unflushed data, in which
    /// case the oldest page is written inline before the append proceeds.
    pub fn append(&self, record: &[u8]) -> Result<(), WalError> {
        let mut sealed_page = false;
        loop {
            {
                let mut ring = self.ring.lock();
                if ring.current().try_append(record) {
                    break;
                }
                if ring.can_advance() {
                    ring.append_seq += 1;
                    sealed_page = true;
                    continue;
                }
            }
            debug!("WAL ring saturated, flushing oldest page inline");
            self.flush_oldest()?;
        }

        match self.config.fsync {
            FsyncPolicy::Always => self.flush()?,
            FsyncPolicy::Everysec | FsyncPolicy::No if sealed_page => self.request_flush(),
            _ => {}
        }
        Ok(())
    }

    /// Ask the flush task to run. Requests made while one is pending collapse
    /// into a single flush.
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    /// Write the oldest sealed page to the segment file
    fn flush_oldest(&self) -> Result<(), WalError> {
        let mut io = self.io.lock();
        let chunks = match self.ring.lock().take_oldest() {
            Some(chunks) => chunks,
            None => return Ok(()),
        };
        let written = io.write_chunks(&chunks)?;
        if self.config.fsync != FsyncPolicy::No {
            io.sync()?;
        }
        self.bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write every buffered byte in sequence order and sync.
    ///
    /// Calling it with nothing buffered is harmless. Under the `no` policy the
    /// data is handed to the OS without an fsync.
    pub fn flush(&self) -> Result<(), WalError> {
        self.flush_inner(self.config.fsync != FsyncPolicy::No)
    }

    fn flush_inner(&self, sync: bool) -> Result<(), WalError> {
        let mut io = self.io.lock();
        let chunks = self.ring.lock().take_all();
        let written = io.write_chunks(&chunks)?;
        if sync {
            io.sync()?;
        }
        self.bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Drain the ring and fsync; no buffered byte survives this call
    pub fn quit(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let sealed = self.ring.lock().sealed();
            if sealed == 0 {
                break;
            }
            self.flush_oldest()?;
        }
        self.flush_inner(true)?;
        self.flush_requested.notify_one();
        info!(
            "WAL closed after writing {} bytes",
            self.bytes_written.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Drain and fsync the current segment, then start the next one.
    ///
    /// Returns the new segment number. Everything appended after this call
    /// lands in the new segment.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut io = self.io.lock();
        let chunks = self.ring.lock().take_all();
        let written = io.write_chunks(&chunks)?;
        io.sync()?;
        self.bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);

        let next = SegmentFile::open(&self.config, io.number + 1)?;
        debug!("WAL rotated from {} to {}", io.path.display(), next.path.display());
        *io = next;
        Ok(io.number)
    }

    /// Delete segments numbered below `before`, never the current one.
    ///
    /// Returns how many files were removed.
    pub fn compact(&self, before: u64) -> Result<usize, WalError> {
        let current = self.current_segment();
        let mut removed = 0;
        for (number, path) in list_segments(&self.config.dir)? {
            if number >= before || number >= current {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove WAL segment {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("WAL compaction removed {} segment(s) below {}", removed, before);
        }
        Ok(removed)
    }

    /// Spawn the background flush task.
    ///
    /// It wakes on flush requests and, under `everysec`, once a second. A
    /// flush error terminates the process.
    pub fn spawn_flush_task(self: &Arc<Self>) -> JoinHandle<()> {
        let wal = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let periodic = wal.config.fsync == FsyncPolicy::Everysec;

            loop {
                tokio::select! {
                    _ = wal.flush_requested.notified() => {}
                    _ = ticker.tick(), if periodic => {}
                }
                if wal.closed.load(Ordering::SeqCst) {
                    debug!("WAL flush task stopping");
                    break;
                }

                let worker = Arc::clone(&wal);
                match tokio::task::spawn_blocking(move || worker.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => crate::fatal("WAL flush failed", &e),
                    Err(e) => crate::fatal("WAL flush task panicked", &e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, page_size: usize, page_count: usize) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            page_size,
            page_count,
            fsync: FsyncPolicy::Everysec,
        }
    }

    fn read_segment(dir: &TempDir, number: u64) -> Vec<u8> {
        std::fs::read(segment_path(dir.path(), number)).unwrap()
    }

    #[test]
    fn test_rejects_single_page_ring() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            Wal::open(test_config(&temp_dir, 16, 1), 0),
            Err(WalError::TooFewPages(1))
        ));
    }

    #[test]
    fn test_saturated_ring_flushes_oldest_inline() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(&temp_dir, 4, 2), 0).unwrap();

        wal.append(b"aaaa").unwrap();
        assert!(read_segment(&temp_dir, 0).is_empty());

        // Seals page 0; page 1 becomes current.
        wal.append(b"bbbb").unwrap();
        assert!(read_segment(&temp_dir, 0).is_empty());

        // No free slot left, so page 0 goes to disk before the append.
        wal.append(b"cc").unwrap();
        assert_eq!(read_segment(&temp_dir, 0), b"aaaa");

        wal.quit().unwrap();
        assert_eq!(read_segment(&temp_dir, 0), b"aaaabbbbcc");
    }

    #[test]
    fn test_flush_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(&temp_dir, 64, 2), 0).unwrap();
        wal.flush().unwrap();
        wal.append(b"SET a 1").unwrap();
        wal.flush().unwrap();
        wal.flush().unwrap();
        assert_eq!(read_segment(&temp_dir, 0), b"SET a 1");
        assert_eq!(wal.bytes_written(), 7);
    }

    #[test]
    fn test_rotate_and_compact() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(&temp_dir, 64, 2), 0).unwrap();
        wal.append(b"one").unwrap();
        assert_eq!(wal.rotate().unwrap(), 1);
        wal.append(b"two").unwrap();
        assert_eq!(wal.rotate().unwrap(), 2);
        wal.quit().unwrap();

        assert_eq!(read_segment(&temp_dir, 0), b"one");
        assert_eq!(read_segment(&temp_dir, 1), b"two");

        assert_eq!(wal.compact(2).unwrap(), 2);
        let remaining: Vec<u64> = list_segments(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(remaining, vec![2]);
    }

    #[test]
    fn test_reopen_appends_to_newest_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(&temp_dir, 64, 2), 0).unwrap();
            wal.rotate().unwrap();
            wal.append(b"x").unwrap();
            wal.quit().unwrap();
        }
        let wal = Wal::open(test_config(&temp_dir, 64, 2), 0).unwrap();
        assert_eq!(wal.current_segment(), 1);
        wal.append(b"y").unwrap();
        wal.quit().unwrap();
        assert_eq!(read_segment(&temp_dir, 1), b"xy");

        let wal = Wal::open(test_config(&temp_dir, 64, 2), 5).unwrap();
        assert_eq!(wal.current_segment(), 5);
    }

    #[tokio::test]
    async fn test_flush_task_writes_sealed_pages() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(test_config(&temp_dir, 4, 4), 0).unwrap());
        let task = wal.spawn_flush_task();

        wal.append(b"abcd").unwrap();
        wal.append(b"ef").unwrap();

        let mut on_disk = Vec::new();
        for _ in 0..50 {
            on_disk = read_segment(&temp_dir, 0);
            if on_disk.len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(on_disk.starts_with(b"abcd"));

        wal.quit().unwrap();
        task.await.unwrap();
        assert_eq!(read_segment(&temp_dir, 0), b"abcdef");
    }

    proptest! {
        #[test]
        fn prop_quit_preserves_every_record_in_order(
            page_size in 1usize..32,
            page_count in 2usize..5,
            records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..80), 0..60),
            flush_every in 0usize..10,
        ) {
            let temp_dir = TempDir::new().unwrap();
            let wal = Wal::open(test_config(&temp_dir, page_size, page_count), 0).unwrap();

            let mut expected = Vec::new();
            for (i, record) in records.iter().enumerate() {
                wal.append(record).unwrap();
                expected.extend_from_slice(record);
                if flush_every > 0 && i % flush_every == 0 {
                    wal.flush().unwrap();
                }
            }
            wal.quit().unwrap();

            prop_assert_eq!(read_segment(&temp_dir, 0), expected);
        }
    }
}
