//! One shared-memory-backed chunk of the capture ring.
//!
//! A segment is a fixed-size, preallocated file under the agent run root
//! (tmpfs in production). The single producer appends length-prefixed
//! event frames through a buffered writer; readers open a *fresh* view at
//! offset zero and stop at a flushed byte-count snapshot taken before the
//! scan starts, so writer and readers never share mutable bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use fs2::FileExt;
use thiserror::Error;

use crate::event::{decode_frame, encode_frame, CodecError, Event};

/// Magic bytes opening every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"VGLS";

/// Segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Fixed header written at every (re)open: magic, version, reserved,
/// open timestamp.
pub const SEGMENT_HEADER_LEN: u64 = 16;

/// Segment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Accepting appends.
    Open,
    /// No further appends, still readable.
    Sealed,
    /// Contents discarded, ready for reuse.
    Recycled,
}

/// Errors from segment storage.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Filesystem failure on the segment file.
    #[error("segment {name}: {source}")]
    Io {
        /// Segment name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Read view did not start with a valid header.
    #[error("segment {name}: bad header")]
    BadHeader {
        /// Segment name.
        name: String,
    },

    /// A buffered frame failed to decode.
    #[error("segment read: {0}")]
    Codec(#[from] CodecError),
}

/// Errors from the append path.
#[derive(Debug, Error)]
pub enum AppendError {
    /// The frame does not fit in the remaining capacity.
    #[error("segment full: frame of {frame} bytes, {remaining} remaining")]
    Full {
        /// Frame size.
        frame: u64,
        /// Remaining capacity.
        remaining: u64,
    },

    /// The segment is not open for appends.
    #[error("segment is not open")]
    NotOpen,

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] SegmentError),
}

struct Inner {
    writer: Option<BufWriter<File>>,
    state: SegmentState,
    written: u64,
}

/// A fixed-size segment of the capture ring.
pub struct Segment {
    name: String,
    path: PathBuf,
    capacity: u64,
    inner: Mutex<Inner>,
    flushed_bytes: AtomicU64,
    end_ts_ns: AtomicU64,
    n_events: AtomicU64,
}

impl Segment {
    /// Creates and opens a segment file, preallocating `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] if the file cannot be created,
    /// preallocated, or headed.
    pub fn create(run_root: &Path, name: &str, capacity: u64) -> Result<Self, SegmentError> {
        let path = run_root.join(name);
        let segment = Self {
            name: name.to_string(),
            path,
            capacity,
            inner: Mutex::new(Inner {
                writer: None,
                state: SegmentState::Recycled,
                written: 0,
            }),
            flushed_bytes: AtomicU64::new(0),
            end_ts_ns: AtomicU64::new(0),
            n_events: AtomicU64::new(0),
        };
        segment.reopen()?;
        Ok(segment)
    }

    /// Reopens the segment in a zeroed state: truncates, preallocates,
    /// writes a fresh header, resets counters, and transitions to `Open`.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] on any filesystem failure.
    pub fn reopen(&self) -> Result<(), SegmentError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        file.allocate(self.capacity)
            .map_err(|source| self.io_err(source))?;

        let mut writer = BufWriter::new(file);
        let mut header = BytesMut::with_capacity(SEGMENT_HEADER_LEN as usize);
        header.put_slice(&SEGMENT_MAGIC);
        header.put_u16(SEGMENT_VERSION);
        header.put_u16(0);
        header.put_u64(crate::clock::wall_ns());
        writer
            .write_all(&header)
            .map_err(|source| self.io_err(source))?;
        writer.flush().map_err(|source| self.io_err(source))?;

        let mut inner = self.inner.lock().expect("segment poisoned");
        inner.writer = Some(writer);
        inner.state = SegmentState::Open;
        inner.written = SEGMENT_HEADER_LEN;
        drop(inner);

        self.flushed_bytes.store(SEGMENT_HEADER_LEN, Ordering::Release);
        self.end_ts_ns.store(0, Ordering::Relaxed);
        self.n_events.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Appends one event frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Full`] when the frame does not fit (the
    /// caller rotates and retries), [`AppendError::NotOpen`] for a
    /// sealed or recycled segment, and [`AppendError::Storage`] for
    /// filesystem failures.
    pub fn append(&self, event: &Event) -> Result<(), AppendError> {
        let mut frame = BytesMut::new();
        encode_frame(event, &mut frame).map_err(SegmentError::from)?;
        let frame_len = frame.len() as u64;

        let mut inner = self.inner.lock().expect("segment poisoned");
        if inner.state != SegmentState::Open {
            return Err(AppendError::NotOpen);
        }
        if inner.written + frame_len > self.capacity {
            return Err(AppendError::Full {
                frame: frame_len,
                remaining: self.capacity - inner.written,
            });
        }
        let writer = inner.writer.as_mut().ok_or(AppendError::NotOpen)?;
        writer
            .write_all(&frame)
            .map_err(|source| SegmentError::Io {
                name: self.name.clone(),
                source,
            })?;
        inner.written += frame_len;
        drop(inner);

        self.n_events.fetch_add(1, Ordering::Relaxed);
        self.end_ts_ns.fetch_max(event.ts_ns, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes buffered writes and publishes the byte-count snapshot
    /// readers are allowed to read up to.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] if the flush fails.
    pub fn flush(&self) -> Result<u64, SegmentError> {
        let mut inner = self.inner.lock().expect("segment poisoned");
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush().map_err(|source| self.io_err(source))?;
        }
        let written = inner.written;
        drop(inner);
        self.flushed_bytes.store(written, Ordering::Release);
        Ok(written)
    }

    /// Seals the segment: flushes and refuses further appends.
    ///
    /// Idempotent; sealing a non-open segment only reports the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] if the final flush fails.
    pub fn seal(&self) -> Result<u64, SegmentError> {
        let snapshot = self.flush()?;
        let mut inner = self.inner.lock().expect("segment poisoned");
        if inner.state == SegmentState::Open {
            inner.state = SegmentState::Sealed;
        }
        Ok(snapshot)
    }

    /// Opens a fresh read view at offset zero.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] if the file cannot be opened and
    /// [`SegmentError::BadHeader`] if the header does not verify.
    pub fn open_reader(&self) -> Result<SegmentReader, SegmentError> {
        let mut file = File::open(&self.path).map_err(|source| self.io_err(source))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|source| self.io_err(source))?;

        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|source| self.io_err(source))?;
        if header[..4] != SEGMENT_MAGIC
            || u16::from_be_bytes([header[4], header[5]]) != SEGMENT_VERSION
        {
            return Err(SegmentError::BadHeader {
                name: self.name.clone(),
            });
        }

        Ok(SegmentReader {
            name: self.name.clone(),
            reader: BufReader::new(file),
            buf: BytesMut::new(),
            pos: SEGMENT_HEADER_LEN,
        })
    }

    /// Deletes the backing file. The segment is unusable afterwards.
    pub fn remove(&self) {
        let mut inner = self.inner.lock().expect("segment poisoned");
        inner.writer = None;
        inner.state = SegmentState::Recycled;
        drop(inner);
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(segment = %self.name, %err, "could not unlink segment file");
            }
        }
    }

    /// Segment name (also the file name under the run root).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.inner.lock().expect("segment poisoned").state
    }

    /// Largest event timestamp appended since the last reopen.
    #[must_use]
    pub fn end_ts_ns(&self) -> u64 {
        self.end_ts_ns.load(Ordering::Relaxed)
    }

    /// Events appended since the last reopen.
    #[must_use]
    pub fn events_written(&self) -> u64 {
        self.n_events.load(Ordering::Relaxed)
    }

    /// Last published flush snapshot.
    #[must_use]
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::Acquire)
    }

    fn io_err(&self, source: std::io::Error) -> SegmentError {
        SegmentError::Io {
            name: self.name.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("events", &self.events_written())
            .finish_non_exhaustive()
    }
}

/// A read cursor over one segment, bounded by flush snapshots.
pub struct SegmentReader {
    name: String,
    reader: BufReader<File>,
    buf: BytesMut,
    pos: u64,
}

impl SegmentReader {
    /// Decodes the next event, reading no further than `limit` bytes
    /// into the file. Returns `Ok(None)` when the limit is reached.
    ///
    /// The limit is a flush snapshot, so it always falls on a frame
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] for read failures or undecodable frames.
    pub fn next(&mut self, limit: u64) -> Result<Option<Event>, SegmentError> {
        loop {
            if let Some(event) = decode_frame(&mut self.buf)? {
                return Ok(Some(event));
            }
            if self.pos >= limit {
                return Ok(None);
            }
            let want = usize::try_from((limit - self.pos).min(64 * 1024))
                .expect("chunk bounded to 64 KiB");
            let mut chunk = vec![0u8; want];
            let got = self
                .reader
                .read(&mut chunk)
                .map_err(|source| SegmentError::Io {
                    name: self.name.clone(),
                    source,
                })?;
            if got == 0 {
                // Flushed snapshot beyond file end would mean a torn
                // write; treat as end of readable data.
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..got]);
            self.pos += got as u64;
        }
    }

    /// Bytes consumed from the file so far.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::event::EventType;

    fn event(ts: u64) -> Event {
        Event {
            ts_ns: ts,
            event_type: EventType::Open,
            thread_id: 2,
            process_id: 1,
            container_id: None,
            params: Bytes::from_static(b"p"),
        }
    }

    #[test]
    fn test_append_flush_read() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(dir.path(), "dragent-memdumper-0", 1 << 20).unwrap();

        for ts in 1..=10 {
            seg.append(&event(ts)).unwrap();
        }
        let limit = seg.flush().unwrap();
        assert_eq!(seg.events_written(), 10);
        assert_eq!(seg.end_ts_ns(), 10);

        let mut reader = seg.open_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(ev) = reader.next(limit).unwrap() {
            seen.push(ev.ts_ns);
        }
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_reader_stops_at_snapshot_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(dir.path(), "dragent-memdumper-0", 1 << 20).unwrap();

        seg.append(&event(1)).unwrap();
        let limit1 = seg.flush().unwrap();

        let mut reader = seg.open_reader().unwrap();
        assert_eq!(reader.next(limit1).unwrap().unwrap().ts_ns, 1);
        assert!(reader.next(limit1).unwrap().is_none());

        // More data past the snapshot becomes visible with a new limit.
        seg.append(&event(2)).unwrap();
        let limit2 = seg.flush().unwrap();
        assert_eq!(reader.next(limit2).unwrap().unwrap().ts_ns, 2);
        assert!(reader.next(limit2).unwrap().is_none());
    }

    #[test]
    fn test_full_segment_rejects_frame() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(dir.path(), "dragent-memdumper-0", 64).unwrap();

        // Header leaves 48 bytes; a frame is 29 bytes with a 1-byte
        // param, so the second append must not fit.
        seg.append(&event(1)).unwrap();
        assert!(matches!(
            seg.append(&event(2)),
            Err(AppendError::Full { .. })
        ));
    }

    #[test]
    fn test_sealed_segment_rejects_appends_but_reads() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(dir.path(), "dragent-memdumper-0", 1 << 20).unwrap();
        seg.append(&event(1)).unwrap();
        let limit = seg.seal().unwrap();

        assert!(matches!(seg.append(&event(2)), Err(AppendError::NotOpen)));
        assert_eq!(seg.state(), SegmentState::Sealed);

        let mut reader = seg.open_reader().unwrap();
        assert_eq!(reader.next(limit).unwrap().unwrap().ts_ns, 1);
    }

    #[test]
    fn test_reopen_zeroes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(dir.path(), "dragent-memdumper-0", 1 << 20).unwrap();
        seg.append(&event(1)).unwrap();
        seg.seal().unwrap();

        seg.reopen().unwrap();
        assert_eq!(seg.state(), SegmentState::Open);
        assert_eq!(seg.events_written(), 0);
        assert_eq!(seg.flushed_bytes(), SEGMENT_HEADER_LEN);

        let limit = seg.flush().unwrap();
        let mut reader = seg.open_reader().unwrap();
        assert!(reader.next(limit).unwrap().is_none());
    }
}
