//! The memory dumper: owner of the capture ring.
//!
//! The dumper keeps two segments in steady state (one `Active`, one
//! sealed tail) and rotates them as the producer fills the Active. While
//! a capture job is scanning, rotation may grow the ring to a temporary
//! third segment; with three segments and a reader still active, the
//! producer stalls instead, dropping events into a missed counter until
//! the reader finishes.
//!
//! # Locking
//!
//! Two mutexes, with a fixed order (`membuf` before `ring` when both are
//! held):
//!
//! - `ring` protects the segment deque and the reader count, held only
//!   for deque mutation and snapshots;
//! - `membuf` serializes the producer's writes against a reader draining
//!   the Active segment's tail, so a job can finish the Active and
//!   register for live-follow without a gap.
//!
//! Rotation and append run on the producer thread; each capture job gets
//! its own reader thread.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{CaptureJob, CaptureSpec, JobState};
use super::segment::{AppendError, Segment, SEGMENT_HEADER_LEN};
use crate::clock;
use crate::config::MemdumpConfig;
use crate::egress::wire::CaptureDataMsg;
use crate::egress::EgressHandler;
use crate::event::Event;

/// Name of the allocation probe file created (and removed) at startup.
pub const MEM_TEST_FILE: &str = "dragent-mem-test";

/// Prefix of segment file names; the suffix is a monotonic file id.
pub const SEGMENT_PREFIX: &str = "dragent-memdumper-";

/// Threshold hits after which the dumper autodisables.
const AUTODISABLE_HITS: u32 = 10;

/// Errors surfaced by the dumper.
#[derive(Debug, Error)]
pub enum DumperError {
    /// The run root could not be created.
    #[error("could not create run root {path}: {source}")]
    RunRoot {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors starting or controlling a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The dumper is disabled; no captures can start.
    #[error("memory dump is disabled")]
    Disabled,

    /// The output file could not be created.
    #[error("could not create capture output: {0}")]
    Output(String),

    /// No job holds this token.
    #[error("unknown capture token {0}")]
    UnknownToken(Uuid),
}

struct Ring {
    /// Active at the front, oldest at the back.
    segments: VecDeque<Arc<Segment>>,
    /// Jobs currently scanning the ring.
    readers: usize,
}

/// Owner of the capture ring; see the module docs.
pub struct MemoryDumper {
    /// Self-reference handed to reader threads.
    me: Weak<Self>,
    cfg: MemdumpConfig,
    run_root: PathBuf,
    egress: Arc<EgressHandler>,

    ring: Mutex<Ring>,
    membuf: Mutex<()>,
    jobs: Mutex<HashMap<Uuid, Arc<CaptureJob>>>,
    followers: Mutex<Vec<Arc<CaptureJob>>>,

    disabled: AtomicBool,
    disabled_by_autodisable: AtomicBool,
    last_autodisable_ns: AtomicU64,
    last_rotation_ns: AtomicU64,
    threshold_hits: AtomicU32,
    sealed_header_bytes: AtomicU64,

    delayed_rotation_needed: AtomicBool,
    delayed_rotation_ready: AtomicBool,
    missed_events: AtomicU64,
    dropped_frames: AtomicU64,
    last_event_ts_ns: AtomicU64,
    file_id: AtomicU64,
}

impl MemoryDumper {
    /// Opens the dumper under `run_root`.
    ///
    /// Probes allocation feasibility with the `dragent-mem-test` file
    /// first; a probe or initial-segment failure logs once and leaves
    /// the dumper disabled for the process lifetime rather than
    /// failing construction (captures then report
    /// [`CaptureError::Disabled`]).
    ///
    /// # Errors
    ///
    /// Returns [`DumperError::RunRoot`] only if the run root itself
    /// cannot be created.
    pub fn open(
        cfg: &MemdumpConfig,
        run_root: &Path,
        egress: Arc<EgressHandler>,
    ) -> Result<Arc<Self>, DumperError> {
        std::fs::create_dir_all(run_root).map_err(|source| DumperError::RunRoot {
            path: run_root.to_path_buf(),
            source,
        })?;

        let dumper = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cfg: cfg.clone(),
            run_root: run_root.to_path_buf(),
            egress,
            ring: Mutex::new(Ring {
                segments: VecDeque::new(),
                readers: 0,
            }),
            membuf: Mutex::new(()),
            jobs: Mutex::new(HashMap::new()),
            followers: Mutex::new(Vec::new()),
            disabled: AtomicBool::new(false),
            disabled_by_autodisable: AtomicBool::new(false),
            last_autodisable_ns: AtomicU64::new(0),
            last_rotation_ns: AtomicU64::new(clock::wall_ns()),
            threshold_hits: AtomicU32::new(0),
            sealed_header_bytes: AtomicU64::new(0),
            delayed_rotation_needed: AtomicBool::new(false),
            delayed_rotation_ready: AtomicBool::new(false),
            missed_events: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            last_event_ts_ns: AtomicU64::new(0),
            file_id: AtomicU64::new(0),
        });

        if !cfg.enabled {
            dumper.disabled.store(true, Ordering::Release);
            return Ok(dumper);
        }

        info!(
            bufsize = cfg.bufsize,
            max_disk_size = cfg.max_disk_size,
            "initializing memory dumper"
        );

        if let Err(err) = dumper.probe_allocation() {
            error!(%err, "could not allocate shared memory, disabling memory dump");
            dumper.disabled.store(true, Ordering::Release);
            return Ok(dumper);
        }

        let mut ring = dumper.ring.lock().expect("ring poisoned");
        for _ in 0..2 {
            let name = dumper.next_segment_name();
            match Segment::create(&dumper.run_root, &name, cfg.segment_size()) {
                Ok(segment) => ring.segments.push_front(Arc::new(segment)),
                Err(err) => {
                    error!(segment = %name, %err, "could not open segment, disabling memory dump");
                    dumper.disabled.store(true, Ordering::Release);
                    break;
                },
            }
        }
        drop(ring);

        Ok(dumper)
    }

    /// Verifies the configured buffer can actually be allocated, with
    /// the probe file removed again before returning.
    fn probe_allocation(&self) -> std::io::Result<()> {
        let path = self.run_root.join(MEM_TEST_FILE);
        let _ = std::fs::remove_file(&path);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match file.allocate(self.cfg.bufsize) {
                Ok(()) => break Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    if attempts >= self.cfg.max_init_attempts {
                        break Err(err);
                    }
                },
                Err(err) => break Err(err),
            }
        };

        drop(file);
        let _ = std::fs::remove_file(&path);
        result
    }

    /// Returns `true` when the dumper is not accepting events.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Events dropped while rotation was stalled on a reader.
    #[must_use]
    pub fn missed_events(&self) -> u64 {
        self.missed_events.load(Ordering::Relaxed)
    }

    /// Frames dropped for reasons other than a stall (oversized frame,
    /// failed retry after rotation).
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Segments currently in the ring.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.ring.lock().expect("ring poisoned").segments.len()
    }

    /// Appends one event to the Active segment and tees it to any jobs
    /// in live-follow. Never blocks on the network; failures are local
    /// (counted or logged) and never propagate to the caller.
    pub fn append(&self, event: &Event) {
        self.last_event_ts_ns.store(event.ts_ns, Ordering::Relaxed);

        if self.is_disabled() {
            self.maybe_re_enable(event.ts_ns);
            if self.is_disabled() {
                return;
            }
        }

        if self.delayed_rotation_needed.load(Ordering::Acquire) {
            if self.delayed_rotation_ready.load(Ordering::Acquire) {
                // The reader finished; perform the rotation it blocked.
                self.rotate(event.ts_ns);
            } else {
                self.missed_events.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.append_to_active(event, true) {
            return;
        }

        // Active full: rotate and retry once (the first attempt already
        // teed the event to followers).
        self.rotate(event.ts_ns);
        if self.delayed_rotation_needed.load(Ordering::Acquire) {
            self.missed_events.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.append_to_active(event, false) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            warn!(ts = event.ts_ns, "event frame dropped after rotation");
        }
    }

    /// Appends under the handoff lock. The live-follow tee happens under
    /// the same guard, so an event is either inside a reader's flush
    /// snapshot or teed to the registered follower - never between.
    fn append_to_active(&self, event: &Event, tee: bool) -> bool {
        let active = {
            let ring = self.ring.lock().expect("ring poisoned");
            ring.segments.front().cloned()
        };
        let Some(active) = active else {
            return false;
        };

        let _guard = self.membuf.lock().expect("membuf poisoned");
        if tee {
            self.tee_to_followers(event);
        }
        match active.append(event) {
            Ok(()) => true,
            Err(AppendError::Full { .. } | AppendError::NotOpen) => false,
            Err(AppendError::Storage(err)) => {
                error!(%err, "segment append failed, disabling memory dump");
                self.disabled.store(true, Ordering::Release);
                false
            },
        }
    }

    /// Seals the Active segment and promotes a tail (or a temporary
    /// third segment) in its place; see the module docs for the policy
    /// while a reader is active.
    pub fn rotate(&self, ts_ns: u64) {
        let _guard = self.membuf.lock().expect("membuf poisoned");
        self.rotate_locked(ts_ns);
    }

    fn rotate_locked(&self, ts_ns: u64) {
        let sys_ns = clock::wall_ns();
        self.check_autodisable(ts_ns, sys_ns);
        self.last_rotation_ns.store(sys_ns, Ordering::Relaxed);

        let mut ring = self.ring.lock().expect("ring poisoned");
        if ring.segments.is_empty() {
            return;
        }
        debug!("rotating capture ring");

        if self.delayed_rotation_needed.swap(false, Ordering::AcqRel) {
            let missed = self.missed_events.load(Ordering::Relaxed);
            warn!(missed, "events missed while rotation was stalled on a capture job");
            self.delayed_rotation_ready.store(false, Ordering::Release);
        }

        if let Some(active) = ring.segments.front() {
            match active.seal() {
                Ok(_) => {
                    self.sealed_header_bytes
                        .fetch_add(SEGMENT_HEADER_LEN, Ordering::Relaxed);
                },
                Err(err) => warn!(%err, "could not seal active segment"),
            }
        }

        if ring.readers > 0 {
            if ring.segments.len() < 3 {
                debug!("creating temporary additional segment while reader is active");
                let name = self.next_segment_name();
                match Segment::create(&self.run_root, &name, self.cfg.segment_size()) {
                    Ok(segment) => ring.segments.push_front(Arc::new(segment)),
                    Err(err) => {
                        error!(segment = %name, %err, "could not open temporary segment, disabling memory dump");
                        self.disabled.store(true, Ordering::Release);
                    },
                }
            } else {
                warn!("stalling event processing while capture job scan is active");
                self.delayed_rotation_needed.store(true, Ordering::Release);
                self.delayed_rotation_ready.store(false, Ordering::Release);
                self.missed_events.store(0, Ordering::Relaxed);
            }
            return;
        }

        let recycled = ring.segments.pop_back().expect("ring never empty here");
        match recycled.reopen() {
            Ok(()) => ring.segments.push_front(recycled),
            Err(err) => {
                error!(%err, "could not reopen recycled segment, disabling memory dump");
                self.disabled.store(true, Ordering::Release);
            },
        }
    }

    fn check_autodisable(&self, evt_ts_ns: u64, sys_ts_ns: u64) {
        if !self.cfg.autodisable {
            return;
        }

        let min_ns = self.cfg.min_time_between_rotations.as_nanos() as u64;
        let since_last = sys_ts_ns.saturating_sub(self.last_rotation_ns.load(Ordering::Relaxed));
        let header_pct = self
            .sealed_header_bytes
            .load(Ordering::Relaxed)
            .saturating_mul(100)
            / self.cfg.segment_size().max(1);

        if since_last < min_ns {
            warn!(
                current_ms = since_last / 1_000_000,
                expected_ms = min_ns / 1_000_000,
                "rotation faster than configured minimum"
            );
            self.threshold_hits.fetch_add(1, Ordering::Relaxed);
        } else if header_pct > self.cfg.headers_pct_threshold {
            warn!(
                current_pct = header_pct,
                threshold_pct = self.cfg.headers_pct_threshold,
                "sealed capture headers above threshold"
            );
            self.threshold_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.threshold_hits.store(0, Ordering::Relaxed);
        }

        if self.threshold_hits.load(Ordering::Relaxed) >= AUTODISABLE_HITS {
            self.disabled.store(true, Ordering::Release);
            self.disabled_by_autodisable.store(true, Ordering::Release);
            // Re-enable is driven by event timestamps, so anchor the
            // disable moment on the event clock to avoid skew.
            self.last_autodisable_ns.store(evt_ts_ns, Ordering::Release);
            self.threshold_hits.store(0, Ordering::Relaxed);
            error!("disabling memory dump: rotation churn exceeded threshold");
        }
    }

    fn maybe_re_enable(&self, evt_ts_ns: u64) {
        if !self.disabled_by_autodisable.load(Ordering::Acquire) {
            return;
        }
        let since = evt_ts_ns.saturating_sub(self.last_autodisable_ns.load(Ordering::Acquire));
        if since >= self.cfg.re_enable_interval.as_nanos() as u64 {
            self.disabled_by_autodisable.store(false, Ordering::Release);
            self.disabled.store(false, Ordering::Release);
            self.sealed_header_bytes.store(0, Ordering::Relaxed);
            info!("re-enabling memory dump after autodisable interval");
        }
    }

    /// Starts a capture job: scans the ring for the window's past, then
    /// (for a nonzero future window) live-follows until the end
    /// timestamp passes. Returns the job's token.
    ///
    /// The scan runs on a dedicated reader thread; this call only
    /// creates the output file and registers the reader.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Disabled`] when the dumper is disabled
    /// and [`CaptureError::Output`] when the output file cannot be
    /// created.
    pub fn start_capture(&self, spec: CaptureSpec) -> Result<Uuid, CaptureError> {
        if self.is_disabled() {
            return Err(CaptureError::Disabled);
        }

        let token = Uuid::new_v4();
        let job = CaptureJob::create(&self.run_root, token, spec, self.cfg.max_disk_size)
            .map_err(|err| CaptureError::Output(err.to_string()))?;

        self.jobs
            .lock()
            .expect("jobs poisoned")
            .insert(token, Arc::clone(&job));
        self.ring.lock().expect("ring poisoned").readers += 1;

        let dumper = self.me.upgrade().expect("dumper was built via open()");
        let reader_job = Arc::clone(&job);
        std::thread::Builder::new()
            .name("vigil-capture".to_string())
            .spawn(move || dumper.run_scan(&reader_job))
            .map_err(|err| {
                // Roll the registration back; the thread never started.
                self.ring.lock().expect("ring poisoned").readers -= 1;
                self.jobs.lock().expect("jobs poisoned").remove(&token);
                job.remove_file();
                CaptureError::Output(err.to_string())
            })?;

        Ok(token)
    }

    /// Marks a capture for draining: once the job completes, its file
    /// is read back, chunked to the sink, and unlinked.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnknownToken`] if no job holds `token`.
    pub fn start_sending(&self, token: Uuid) -> Result<(), CaptureError> {
        let job = self
            .jobs
            .lock()
            .expect("jobs poisoned")
            .get(&token)
            .cloned()
            .ok_or(CaptureError::UnknownToken(token))?;

        job.request_send();
        if job.state() == JobState::DoneOk {
            self.drain_job(&job);
        }
        Ok(())
    }

    /// Stops a capture without emitting anything; the output file is
    /// unlinked.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnknownToken`] if no job holds `token`.
    pub fn stop_capture(&self, token: Uuid) -> Result<(), CaptureError> {
        let job = self
            .jobs
            .lock()
            .expect("jobs poisoned")
            .remove(&token)
            .ok_or(CaptureError::UnknownToken(token))?;

        job.stop();
        self.followers
            .lock()
            .expect("followers poisoned")
            .retain(|j| j.token() != token);
        job.remove_file();
        debug!(%token, "capture stopped");
        Ok(())
    }

    /// Finalizes any live-follow jobs whose window has fully passed.
    /// Called from the control tick so idle periods still complete jobs.
    pub fn check_jobs(&self) {
        let now = self.last_event_ts_ns.load(Ordering::Relaxed);
        let expired: Vec<Arc<CaptureJob>> = {
            let mut followers = self.followers.lock().expect("followers poisoned");
            let (done, keep) = followers
                .drain(..)
                .partition(|job| job.state() != JobState::Running || now > job.spec().end_ts_ns);
            *followers = keep;
            done
        };
        for job in expired {
            if job.state() == JobState::Running {
                job.finish_ok();
            }
            self.settle_job(&job);
        }
    }

    /// Stops every job, seals the ring, and unlinks segment files.
    pub fn close(&self) {
        let tokens: Vec<Uuid> = self.jobs.lock().expect("jobs poisoned").keys().copied().collect();
        for token in tokens {
            let _ = self.stop_capture(token);
        }

        self.disabled.store(true, Ordering::Release);
        let mut ring = self.ring.lock().expect("ring poisoned");
        for segment in ring.segments.drain(..) {
            let _ = segment.seal();
            segment.remove();
        }
        info!("memory dumper closed");
    }

    // ---- reader side ----------------------------------------------------

    fn run_scan(&self, job: &Arc<CaptureJob>) {
        let scan = self.scan_segments(job);

        {
            let mut ring = self.ring.lock().expect("ring poisoned");
            ring.readers -= 1;
            if ring.readers == 0 {
                // Sealed headers have now been read; reset the
                // autodisable accounting.
                self.sealed_header_bytes.store(0, Ordering::Relaxed);
                while ring.segments.len() > 2 {
                    debug!("removing temporary additional segment after capture scan");
                    if let Some(segment) = ring.segments.pop_back() {
                        segment.remove();
                    }
                }
                if self.delayed_rotation_needed.load(Ordering::Acquire) {
                    self.delayed_rotation_ready.store(true, Ordering::Release);
                }
            }
        }

        match scan {
            Ok(()) => {
                if job.spec().future_ns == 0 && job.state() == JobState::Running {
                    job.finish_ok();
                }
                if job.state() != JobState::Running {
                    self.settle_job(job);
                }
            },
            Err(message) => {
                job.finish_error(message);
                self.settle_job(job);
            },
        }
    }

    /// Walks segments oldest to newest. The final pass over the Active
    /// segment holds `membuf`, and live-follow registration happens
    /// under that same guard so no event falls between scan and follow.
    fn scan_segments(&self, job: &Arc<CaptureJob>) -> Result<(), String> {
        let mut scanned_from_back = 0usize;
        let mut active_guard: Option<MutexGuard<'_, ()>> = None;

        loop {
            if job.state() != JobState::Running {
                return Ok(());
            }

            let next = {
                let ring = self.ring.lock().expect("ring poisoned");
                if scanned_from_back < ring.segments.len() {
                    let idx = ring.segments.len() - 1 - scanned_from_back;
                    Some(ring.segments[idx].clone())
                } else {
                    None
                }
            };
            let Some(segment) = next else {
                break;
            };
            scanned_from_back += 1;

            active_guard = self.scan_one(job, &segment)?;
            if active_guard.is_some() {
                // We hold membuf, so the deque cannot change; this was
                // the newest segment.
                break;
            }
        }

        // Register for live-follow before releasing the handoff lock.
        if job.spec().future_ns > 0 && job.state() == JobState::Running {
            self.followers
                .lock()
                .expect("followers poisoned")
                .push(Arc::clone(job));
        }
        drop(active_guard);
        Ok(())
    }

    /// Scans one segment. For the Active segment this returns the held
    /// `membuf` guard after a second, writer-quiesced pass over the
    /// tail.
    fn scan_one<'a>(
        &'a self,
        job: &Arc<CaptureJob>,
        segment: &Arc<Segment>,
    ) -> Result<Option<MutexGuard<'a, ()>>, String> {
        let is_front = |ring: &Ring| {
            ring.segments
                .front()
                .is_some_and(|front| Arc::ptr_eq(front, segment))
        };
        let was_front = { is_front(&self.ring.lock().expect("ring poisoned")) };

        if !was_front {
            if segment.events_written() == 0 {
                return Ok(None);
            }
            if job.spec().start_ts_ns != 0 && segment.end_ts_ns() < job.spec().start_ts_ns {
                return Ok(None);
            }
        }

        let limit = segment.flush().map_err(|e| e.to_string())?;
        debug!(
            segment = segment.name(),
            limit, "scanning segment for capture"
        );
        let mut reader = segment.open_reader().map_err(|e| e.to_string())?;
        if !self.read_range(job, &mut reader, limit)? {
            return Ok(None);
        }

        // Second pass: quiesce the writer if this is still the Active
        // segment, then catch the tail written during the first pass.
        let guard = {
            let guard = self.membuf.lock().expect("membuf poisoned");
            if is_front(&self.ring.lock().expect("ring poisoned")) {
                Some(guard)
            } else {
                None
            }
        };
        let limit = segment.flush().map_err(|e| e.to_string())?;
        if !self.read_range(job, &mut reader, limit)? {
            return Ok(None);
        }
        Ok(guard)
    }

    /// Feeds `job` every acceptable event up to `limit`. Returns
    /// `Ok(false)` when the job should stop consuming (cancelled or out
    /// of disk budget).
    fn read_range(
        &self,
        job: &Arc<CaptureJob>,
        reader: &mut super::segment::SegmentReader,
        limit: u64,
    ) -> Result<bool, String> {
        loop {
            if job.state() != JobState::Running {
                return Ok(false);
            }
            let Some(event) = reader.next(limit).map_err(|e| e.to_string())? else {
                return Ok(true);
            };
            if !job.accepts(&event) {
                continue;
            }
            let within_budget = job.write_event(&event).map_err(|e| e.to_string())?;
            if !within_budget {
                debug!(token = %job.token(), "capture reached disk budget");
                job.finish_ok();
                return Ok(false);
            }
        }
    }

    // ---- producer-side tee ----------------------------------------------

    fn tee_to_followers(&self, event: &Event) {
        let mut finished = Vec::new();
        {
            let mut followers = self.followers.lock().expect("followers poisoned");
            followers.retain(|job| {
                if job.state() != JobState::Running {
                    finished.push(Arc::clone(job));
                    return false;
                }
                if event.ts_ns > job.spec().end_ts_ns {
                    job.finish_ok();
                    finished.push(Arc::clone(job));
                    return false;
                }
                if !job.accepts(event) {
                    return true;
                }
                match job.write_event(event) {
                    Ok(true) => true,
                    Ok(false) => {
                        job.finish_ok();
                        finished.push(Arc::clone(job));
                        false
                    },
                    Err(err) => {
                        job.finish_error(err.to_string());
                        finished.push(Arc::clone(job));
                        false
                    },
                }
            });
        }
        for job in finished {
            self.settle_job(&job);
        }
    }

    // ---- completion -----------------------------------------------------

    /// Applies the pending drain decision to a terminal job. Jobs whose
    /// verdict has not arrived yet stay in the table until the engine
    /// calls `start_sending` or `stop_capture`.
    fn settle_job(&self, job: &Arc<CaptureJob>) {
        match job.state() {
            JobState::DoneOk => {
                if job.send_requested() {
                    self.drain_job(job);
                }
            },
            JobState::DoneError => {
                warn!(
                    token = %job.token(),
                    error = job.last_error().as_deref().unwrap_or("unknown"),
                    "capture job failed"
                );
                self.jobs.lock().expect("jobs poisoned").remove(&job.token());
                job.remove_file();
            },
            JobState::Stopped | JobState::Running => {},
        }
    }

    fn drain_job(&self, job: &Arc<CaptureJob>) {
        let removed = self.jobs.lock().expect("jobs poisoned").remove(&job.token());
        if removed.is_none() {
            // Already drained or stopped.
            return;
        }

        match job.drain_chunks(self.cfg.capture_chunk_size) {
            Ok(chunks) => {
                let total = chunks.len();
                info!(token = %job.token(), chunks = total, "draining capture to sink");
                for (seq, payload) in chunks.into_iter().enumerate() {
                    self.egress.capture_data_ready(
                        clock::wall_ns(),
                        &CaptureDataMsg {
                            token: job.token().to_string(),
                            seq: u32::try_from(seq).unwrap_or(u32::MAX),
                            last: seq + 1 == total,
                            payload: payload.to_vec(),
                        },
                    );
                }
            },
            Err(err) => warn!(token = %job.token(), %err, "could not drain capture file"),
        }
        job.remove_file();
    }

    fn next_segment_name(&self) -> String {
        format!(
            "{SEGMENT_PREFIX}{}",
            self.file_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// The job table entry for `token`, if any. Test and diagnostic use.
    #[must_use]
    pub fn job(&self, token: Uuid) -> Option<Arc<CaptureJob>> {
        self.jobs.lock().expect("jobs poisoned").get(&token).cloned()
    }
}

impl std::fmt::Debug for MemoryDumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDumper")
            .field("disabled", &self.is_disabled())
            .field("segments", &self.segment_count())
            .field("missed_events", &self.missed_events())
            .finish_non_exhaustive()
    }
}
