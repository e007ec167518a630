//! Retrospective capture jobs.
//!
//! A job is one capture request: a time window around a moment of
//! interest, an optional filter, and an output file. The dumper's reader
//! thread fills it from the ring (past), then live appends are teed in
//! until the window's future edge passes. Whether the finished file ever
//! leaves the host is decided later, by the policy engine's throttle
//! verdict.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::event::filter::EventPredicate;
use crate::event::{decode_frame, encode_frame, Event};

/// Magic bytes opening every capture file.
pub const CAPTURE_MAGIC: [u8; 4] = *b"VGLC";

/// Capture file format version.
pub const CAPTURE_VERSION: u16 = 1;

/// Fixed capture file header: magic, version, reserved, window start.
pub const CAPTURE_HEADER_LEN: u64 = 16;

/// Capture job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// Scanning the ring or following the live tail.
    Running = 0,
    /// Completed; the output file is whole.
    DoneOk = 1,
    /// Failed; `last_error` holds the diagnostic.
    DoneError = 2,
    /// Cancelled before completion.
    Stopped = 3,
}

impl JobState {
    /// Returns `true` for any terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::DoneOk,
            2 => Self::DoneError,
            3 => Self::Stopped,
            _ => Self::Running,
        }
    }
}

/// Errors on the capture job's output path.
#[derive(Debug, Error)]
pub enum JobError {
    /// Output file failure.
    #[error("capture {token}: {source}")]
    Io {
        /// The job's token.
        token: Uuid,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Parameters of a capture request.
#[derive(Clone)]
pub struct CaptureSpec {
    /// Label for the output file name (the triggering policy's name).
    pub label: String,

    /// Window start, nanoseconds; `0` means unbounded past.
    pub start_ts_ns: u64,

    /// Window end, nanoseconds.
    pub end_ts_ns: u64,

    /// Future portion of the window; `0` means no live-follow phase.
    pub future_ns: u64,

    /// Optional event filter.
    pub filter: Option<Arc<dyn EventPredicate>>,
}

impl std::fmt::Debug for CaptureSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSpec")
            .field("label", &self.label)
            .field("start_ts_ns", &self.start_ts_ns)
            .field("end_ts_ns", &self.end_ts_ns)
            .field("future_ns", &self.future_ns)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

struct JobInner {
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
    n_events: u64,
    last_error: Option<String>,
}

/// One active or finished capture.
pub struct CaptureJob {
    token: Uuid,
    spec: CaptureSpec,
    path: PathBuf,
    max_disk_size: u64,
    state: AtomicU8,
    send_requested: AtomicBool,
    inner: Mutex<JobInner>,
}

impl CaptureJob {
    /// Creates the job and its output file.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] if the output file cannot be created -
    /// a local failure that never reaches the append path.
    pub fn create(
        run_root: &Path,
        token: Uuid,
        spec: CaptureSpec,
        max_disk_size: u64,
    ) -> Result<Arc<Self>, JobError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let file_name = format!("{}-{stamp}-{}.vcap", spec.label, token.simple());
        let path = run_root.join(file_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| JobError::Io { token, source })?;
        let mut writer = BufWriter::new(file);

        let mut header = BytesMut::with_capacity(CAPTURE_HEADER_LEN as usize);
        header.put_slice(&CAPTURE_MAGIC);
        header.put_u16(CAPTURE_VERSION);
        header.put_u16(0);
        header.put_u64(spec.start_ts_ns);
        writer
            .write_all(&header)
            .map_err(|source| JobError::Io { token, source })?;

        Ok(Arc::new(Self {
            token,
            spec,
            path,
            max_disk_size,
            state: AtomicU8::new(JobState::Running as u8),
            send_requested: AtomicBool::new(false),
            inner: Mutex::new(JobInner {
                writer: Some(writer),
                bytes_written: CAPTURE_HEADER_LEN,
                n_events: 0,
                last_error: None,
            }),
        }))
    }

    /// The job's capture token.
    #[must_use]
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// The capture request this job serves.
    #[must_use]
    pub fn spec(&self) -> &CaptureSpec {
        &self.spec
    }

    /// Output file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state; cheap enough for per-event checks.
    #[must_use]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Events written to the output so far.
    #[must_use]
    pub fn events_written(&self) -> u64 {
        self.inner.lock().expect("job poisoned").n_events
    }

    /// Diagnostic from a `DoneError` completion.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().expect("job poisoned").last_error.clone()
    }

    /// Whether the engine has asked for this capture to be drained.
    #[must_use]
    pub fn send_requested(&self) -> bool {
        self.send_requested.load(Ordering::Acquire)
    }

    /// Marks the capture for draining once complete.
    pub fn request_send(&self) {
        self.send_requested.store(true, Ordering::Release);
    }

    /// Returns `true` if `event` falls inside the window and passes the
    /// filter.
    #[must_use]
    pub fn accepts(&self, event: &Event) -> bool {
        if self.spec.start_ts_ns != 0 && event.ts_ns < self.spec.start_ts_ns {
            return false;
        }
        if event.ts_ns > self.spec.end_ts_ns {
            return false;
        }
        self.spec
            .filter
            .as_ref()
            .is_none_or(|f| f.matches(event))
    }

    /// Writes one accepted event to the output.
    ///
    /// Returns `Ok(false)` when the disk budget is exhausted and the job
    /// should complete early.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] on write failure.
    pub fn write_event(&self, event: &Event) -> Result<bool, JobError> {
        let mut frame = BytesMut::new();
        if encode_frame(event, &mut frame).is_err() {
            // Oversized events were already rejected by the ring; an
            // encode failure here means a frame cap change mid-flight.
            return Ok(true);
        }

        let mut inner = self.inner.lock().expect("job poisoned");
        let Some(writer) = inner.writer.as_mut() else {
            return Ok(false);
        };
        writer.write_all(&frame).map_err(|source| JobError::Io {
            token: self.token,
            source,
        })?;
        inner.bytes_written += frame.len() as u64;
        inner.n_events += 1;
        Ok(inner.bytes_written < self.max_disk_size)
    }

    /// Completes the job successfully, flushing and closing the output.
    pub fn finish_ok(&self) {
        let mut inner = self.inner.lock().expect("job poisoned");
        if let Some(mut writer) = inner.writer.take() {
            if let Err(err) = writer.flush() {
                tracing::warn!(token = %self.token, %err, "capture flush failed at completion");
            }
        }
        drop(inner);
        self.transition(JobState::DoneOk);
    }

    /// Completes the job with an error; the output is closed partial.
    pub fn finish_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().expect("job poisoned");
        inner.writer = None;
        inner.last_error = Some(message.into());
        drop(inner);
        self.transition(JobState::DoneError);
    }

    /// Requests cancellation; readers observe at the next event boundary.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("job poisoned");
        inner.writer = None;
        drop(inner);
        self.transition(JobState::Stopped);
    }

    /// Reads the finished output back in chunks for draining.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] if the file cannot be read.
    pub fn drain_chunks(&self, chunk_size: usize) -> Result<Vec<Bytes>, JobError> {
        let mut file = File::open(&self.path).map_err(|source| JobError::Io {
            token: self.token,
            source,
        })?;
        let mut chunks = Vec::new();
        loop {
            let mut chunk = vec![0u8; chunk_size];
            let mut filled = 0;
            while filled < chunk_size {
                let got = file
                    .read(&mut chunk[filled..])
                    .map_err(|source| JobError::Io {
                        token: self.token,
                        source,
                    })?;
                if got == 0 {
                    break;
                }
                filled += got;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);
            chunks.push(Bytes::from(chunk));
            if filled < chunk_size {
                break;
            }
        }
        Ok(chunks)
    }

    /// Unlinks the output file.
    pub fn remove_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(token = %self.token, %err, "could not unlink capture file");
            }
        }
    }

    /// Terminal states win over later transitions; `Stopped` may not
    /// overwrite a completed job and vice versa.
    fn transition(&self, next: JobState) {
        let _ = self.state.compare_exchange(
            JobState::Running as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl std::fmt::Debug for CaptureJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureJob")
            .field("token", &self.token)
            .field("state", &self.state())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Reads every event out of a finished capture file.
///
/// # Errors
///
/// Returns an error string for a missing or malformed file; used by
/// diagnostics and tests.
pub fn read_capture_file(path: &Path) -> Result<Vec<Event>, String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(CAPTURE_HEADER_LEN))
        .map_err(|e| e.to_string())?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw).map_err(|e| e.to_string())?;

    let mut buf = BytesMut::from(raw.as_slice());
    let mut events = Vec::new();
    while let Some(event) = decode_frame(&mut buf).map_err(|e| e.to_string())? {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::filter::ContainerPredicate;
    use crate::event::EventType;

    fn event(ts: u64, container: Option<&str>) -> Event {
        Event {
            ts_ns: ts,
            event_type: EventType::Connect,
            thread_id: 5,
            process_id: 5,
            container_id: container.map(str::to_string),
            params: Bytes::from_static(b"xy"),
        }
    }

    fn spec(start: u64, end: u64) -> CaptureSpec {
        CaptureSpec {
            label: "test".to_string(),
            start_ts_ns: start,
            end_ts_ns: end,
            future_ns: 0,
            filter: None,
        }
    }

    #[test]
    fn test_window_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::create(
            dir.path(),
            Uuid::new_v4(),
            CaptureSpec {
                filter: Some(Arc::new(ContainerPredicate::new("c1"))),
                ..spec(100, 200)
            },
            1 << 20,
        )
        .unwrap();

        assert!(!job.accepts(&event(99, Some("c1"))));
        assert!(job.accepts(&event(100, Some("c1"))));
        assert!(!job.accepts(&event(150, Some("c2"))));
        assert!(!job.accepts(&event(201, Some("c1"))));
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::create(dir.path(), Uuid::new_v4(), spec(0, 1000), 1 << 20).unwrap();

        for ts in [10, 20, 30] {
            assert!(job.write_event(&event(ts, None)).unwrap());
        }
        job.finish_ok();
        assert_eq!(job.state(), JobState::DoneOk);

        let events = read_capture_file(job.path()).unwrap();
        assert_eq!(
            events.iter().map(|e| e.ts_ns).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn test_disk_budget_signals_early_completion() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::create(dir.path(), Uuid::new_v4(), spec(0, 1000), 64).unwrap();

        // 30-byte frames against a 64-byte budget: the second write
        // crosses it.
        assert!(job.write_event(&event(1, None)).unwrap());
        assert!(!job.write_event(&event(2, None)).unwrap());
    }

    #[test]
    fn test_stop_does_not_overwrite_completion() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::create(dir.path(), Uuid::new_v4(), spec(0, 1000), 1 << 20).unwrap();
        job.finish_ok();
        job.stop();
        assert_eq!(job.state(), JobState::DoneOk);
    }

    #[test]
    fn test_drain_chunks_covers_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::create(dir.path(), Uuid::new_v4(), spec(0, 1000), 1 << 20).unwrap();
        for ts in 0..20 {
            job.write_event(&event(ts, None)).unwrap();
        }
        job.finish_ok();

        let chunks = job.drain_chunks(64).unwrap();
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let on_disk = std::fs::metadata(job.path()).unwrap().len();
        assert_eq!(total as u64, on_disk);
        assert!(chunks.len() > 1);
    }
}
