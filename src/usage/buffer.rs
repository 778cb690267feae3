//! Durable on-disk usage spool.
//!
//! An append-only JSONL segment plus an acknowledgement checkpoint. Records
//! are appended before any publish attempt and only pass out of the spool
//! when the checkpoint advances past them, so a crash between publish and
//! ack re-publishes (at-least-once). The segment is rewritten once the
//! acked prefix grows past a threshold.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::record::UsageRecord;

const SEGMENT_FILE: &str = "usage.log";
const CHECKPOINT_FILE: &str = "usage.ack";

/// Acked records kept in the segment before a compaction pass
const COMPACT_THRESHOLD: u64 = 1024;

#[derive(Debug, Serialize, Deserialize, Default)]
struct Checkpoint {
    /// Sequence number of the segment's first line
    base_seq: u64,
    /// Records with seq below this are acknowledged
    ack_seq: u64,
}

struct SpoolInner {
    file: File,
    checkpoint: Checkpoint,
    /// Sequence the next appended record receives
    next_seq: u64,
    /// Bytes currently in the segment
    segment_bytes: u64,
}

/// Bounded durable buffer for usage records.
pub struct UsageSpool {
    dir: PathBuf,
    inner: Mutex<SpoolInner>,
    max_records: usize,
    max_bytes: u64,
    dropped: AtomicU64,
}

impl UsageSpool {
    /// Open (or create) the spool in `dir` and recover its checkpoint.
    pub fn open(dir: &Path, max_records: usize, max_bytes: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let checkpoint = match std::fs::read_to_string(dir.join(CHECKPOINT_FILE)) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Checkpoint::default(),
        };

        let segment_path = dir.join(SEGMENT_FILE);
        let (line_count, segment_bytes) = if segment_path.exists() {
            let metadata = std::fs::metadata(&segment_path)?;
            let reader = BufReader::new(File::open(&segment_path)?);
            (reader.lines().count() as u64, metadata.len())
        } else {
            (0, 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)?;

        let next_seq = checkpoint.base_seq + line_count;
        let ack_seq = checkpoint.ack_seq.min(next_seq);
        let base_seq = checkpoint.base_seq;

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(SpoolInner {
                file,
                checkpoint: Checkpoint { base_seq, ack_seq },
                next_seq,
                segment_bytes,
            }),
            max_records,
            max_bytes,
            dropped: AtomicU64::new(0),
        })
    }

    /// Unacknowledged record count.
    pub fn depth(&self) -> u64 {
        let inner = self.inner.lock();
        inner.next_seq - inner.checkpoint.ack_seq
    }

    /// Records dropped to the ceilings since open.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn persist_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        std::fs::rename(&tmp, dir.join(CHECKPOINT_FILE))?;
        Ok(())
    }

    /// Append one record; enforces ceilings by advancing the checkpoint
    /// past the oldest unacked records (drop-oldest).
    pub fn append(&self, record: &UsageRecord) -> std::io::Result<u64> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut inner = self.inner.lock();
        inner.file.write_all(&line)?;
        inner.file.flush()?;
        inner.segment_bytes += line.len() as u64;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut dropped = 0u64;
        while (inner.next_seq - inner.checkpoint.ack_seq) as usize > self.max_records {
            inner.checkpoint.ack_seq += 1;
            dropped += 1;
        }
        // The byte ceiling can only shed what is still unacked.
        if inner.segment_bytes > self.max_bytes {
            let avg = inner.segment_bytes / (inner.next_seq - inner.checkpoint.base_seq).max(1);
            while inner.segment_bytes
                > self.max_bytes + avg * (inner.checkpoint.ack_seq - inner.checkpoint.base_seq)
                && inner.checkpoint.ack_seq < inner.next_seq
            {
                inner.checkpoint.ack_seq += 1;
                dropped += 1;
            }
        }

        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            metrics::counter!("gantry_usage_spool_dropped_total").increment(dropped);
            tracing::warn!(dropped, "Usage spool ceiling reached, dropped oldest records");
            Self::persist_checkpoint(&self.dir, &inner.checkpoint)?;
            self.maybe_compact(&mut inner)?;
        }

        Ok(seq)
    }

    /// Unacknowledged records with their sequence numbers, oldest first.
    ///
    /// Corrupt lines (torn writes from a crash) are skipped with a warning.
    pub fn pending(&self) -> std::io::Result<Vec<(u64, UsageRecord)>> {
        let inner = self.inner.lock();
        let skip = (inner.checkpoint.ack_seq - inner.checkpoint.base_seq) as usize;
        let base = inner.checkpoint.base_seq;
        drop(inner);

        let path = self.dir.join(SEGMENT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut out = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            if index < skip {
                continue;
            }
            let line = line?;
            match serde_json::from_str::<UsageRecord>(&line) {
                Ok(record) => out.push((base + index as u64, record)),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping corrupt usage spool line");
                }
            }
        }
        Ok(out)
    }

    /// Acknowledge every record with seq < `up_to` and persist the
    /// checkpoint. Compacts the segment when the acked prefix is large.
    pub fn ack(&self, up_to: u64) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if up_to <= inner.checkpoint.ack_seq {
            return Ok(());
        }
        inner.checkpoint.ack_seq = up_to.min(inner.next_seq);
        Self::persist_checkpoint(&self.dir, &inner.checkpoint)?;
        self.maybe_compact(&mut inner)
    }

    /// Rewrite the segment without the acked prefix when it has grown past
    /// the threshold.
    fn maybe_compact(&self, inner: &mut SpoolInner) -> std::io::Result<()> {
        let acked_prefix = inner.checkpoint.ack_seq - inner.checkpoint.base_seq;
        if acked_prefix < COMPACT_THRESHOLD {
            return Ok(());
        }

        let path = self.dir.join(SEGMENT_FILE);
        let tmp = self.dir.join(format!("{SEGMENT_FILE}.tmp"));

        let reader = BufReader::new(File::open(&path)?);
        let mut kept_bytes = 0u64;
        {
            let mut out = File::create(&tmp)?;
            for line in reader.lines().skip(acked_prefix as usize) {
                let line = line?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
                kept_bytes += line.len() as u64 + 1;
            }
            out.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        inner.checkpoint.base_seq = inner.checkpoint.ack_seq;
        inner.segment_bytes = kept_bytes;
        inner.file = OpenOptions::new().append(true).open(&path)?;
        Self::persist_checkpoint(&self.dir, &inner.checkpoint)?;

        tracing::debug!(
            base_seq = inner.checkpoint.base_seq,
            kept_bytes,
            "Usage spool compacted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::record::UsageOutcome;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> UsageRecord {
        UsageRecord {
            record_id: Uuid::new_v4(),
            idempotency_token: Uuid::new_v4(),
            org_id: "acme".to_string(),
            key_id: "k".to_string(),
            model: "m1".to_string(),
            backend_id: None,
            input_bytes: 10,
            output_bytes: 0,
            upstream_latency_ms: 0,
            outcome: UsageOutcome::RateLimited,
            decision_reason: None,
            policy_version: None,
            timestamp_utc: Utc::now(),
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
        }
    }

    #[test]
    fn append_then_pending_then_ack() {
        let dir = tempfile::tempdir().unwrap();
        let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();

        let r1 = record();
        let r2 = record();
        spool.append(&r1).unwrap();
        spool.append(&r2).unwrap();
        assert_eq!(spool.depth(), 2);

        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1.record_id, r1.record_id);

        spool.ack(pending[0].0 + 1).unwrap();
        assert_eq!(spool.depth(), 1);
        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.record_id, r2.record_id);
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let r2_id;
        {
            let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
            spool.append(&record()).unwrap();
            let r2 = record();
            r2_id = r2.record_id;
            spool.append(&r2).unwrap();
            spool.ack(1).unwrap();
        }

        let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
        assert_eq!(spool.depth(), 1);
        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.record_id, r2_id);
    }

    #[test]
    fn record_ceiling_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let spool = UsageSpool::open(dir.path(), 3, 1 << 20).unwrap();

        let records: Vec<UsageRecord> = (0..5).map(|_| record()).collect();
        for r in &records {
            spool.append(r).unwrap();
        }

        assert_eq!(spool.depth(), 3);
        assert_eq!(spool.dropped(), 2);
        let pending = spool.pending().unwrap();
        // The two oldest were shed
        assert_eq!(pending[0].1.record_id, records[2].record_id);
    }

    #[test]
    fn corrupt_tail_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
            spool.append(&record()).unwrap();
        }
        // Simulate a torn write
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(SEGMENT_FILE))
            .unwrap();
        file.write_all(b"{\"truncated\n").unwrap();

        let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
        let pending = spool.pending().unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn ack_is_idempotent_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
        spool.append(&record()).unwrap();
        spool.append(&record()).unwrap();

        spool.ack(2).unwrap();
        spool.ack(1).unwrap(); // regression is a no-op
        assert_eq!(spool.depth(), 0);
    }
}
