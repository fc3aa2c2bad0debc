/// Continuous advertisement capture.
///
/// One worker thread per interface waits on its scanning channel in rounds of
/// `scan_timeout` and appends each round's frames to the shared
/// [`CaptureBuffer`]. A round without any frame means the radio went quiet, so
/// the channel is closed and opened again.
use log::{debug, error, info};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bluetooth::hci::{Radio, RadioChannel, ScanMode};
use crate::config::MonitorConfig;
use crate::error::CaptureError;
use crate::models::RawFrame;

const STOP_TIMEOUT_SECS: u64 = 10;
const POLL_SLICE: Duration = Duration::from_millis(500);
const STOP_POLL: Duration = Duration::from_millis(20);

/// Frames captured since the last drain, shared by all workers
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    frames: Arc<Mutex<Vec<RawFrame>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        CaptureBuffer::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RawFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, batch: Vec<RawFrame>) {
        if batch.is_empty() {
            return;
        }
        self.lock().extend(batch);
    }

    /// Take every buffered frame, leaving the buffer empty
    pub fn drain(&self) -> Vec<RawFrame> {
        mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interfaces: Vec<u16>,
    pub mode: ScanMode,
    pub scan_timeout: Duration,
    pub stop_timeout: Duration,
}

impl From<&MonitorConfig> for CaptureSettings {
    fn from(config: &MonitorConfig) -> Self {
        CaptureSettings {
            interfaces: config.hci_interfaces.clone(),
            mode: ScanMode::from_active(config.active_scan),
            scan_timeout: Duration::from_secs(config.scan_timeout),
            stop_timeout: Duration::from_secs(STOP_TIMEOUT_SECS),
        }
    }
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const EXITED: u8 = 2;

/// Lifecycle flag shared by a worker thread and the session
///
/// A stop request can be withdrawn until the worker commits to exiting, so a
/// restart never mistakes a worker on its way out for a live one.
#[derive(Debug, Default)]
struct WorkerState(AtomicU8);

impl WorkerState {
    fn stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STOPPING
    }

    fn request_stop(&self) {
        let _ = self.0.compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Withdraw a stop request; false once the worker has committed to exiting
    fn resume(&self) -> bool {
        match self.0.compare_exchange(STOPPING, RUNNING, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => true,
            Err(current) => current == RUNNING,
        }
    }

    /// Commit to a pending stop; false if it was withdrawn in the meantime
    fn confirm_stop(&self) -> bool {
        self.0
            .compare_exchange(STOPPING, EXITED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn exit(&self) {
        self.0.store(EXITED, Ordering::SeqCst);
    }
}

struct Worker {
    interface: u16,
    state: Arc<WorkerState>,
    handle: JoinHandle<()>,
}

pub struct CaptureSession {
    radio: Arc<dyn Radio>,
    settings: CaptureSettings,
    buffer: CaptureBuffer,
    workers: Vec<Worker>,
}

impl CaptureSession {
    pub fn new(radio: Arc<dyn Radio>, settings: CaptureSettings, buffer: CaptureBuffer) -> Self {
        CaptureSession {
            radio,
            settings,
            buffer,
            workers: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    pub fn running_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// Spawn a worker for every interface that has none running
    ///
    /// A worker left behind by a stop that timed out is told to carry on
    /// instead of getting a twin, unless it already committed to exiting.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.workers
            .retain(|w| !w.handle.is_finished() && w.state.resume());

        for &interface in &self.settings.interfaces {
            if self.workers.iter().any(|w| w.interface == interface) {
                continue;
            }

            let state = Arc::new(WorkerState::default());
            let radio = Arc::clone(&self.radio);
            let buffer = self.buffer.clone();
            let mode = self.settings.mode;
            let scan_timeout = self.settings.scan_timeout;
            let worker_state = Arc::clone(&state);

            let handle = thread::Builder::new()
                .name(format!("capture-hci{}", interface))
                .spawn(move || {
                    run_worker(radio.as_ref(), interface, mode, scan_timeout, &buffer, &worker_state)
                })
                .map_err(|source| CaptureError::Spawn { interface, source })?;

            self.workers.push(Worker {
                interface,
                state,
                handle,
            });
        }
        Ok(())
    }

    /// Ask every worker to finish its wait round and exit
    ///
    /// Waits at most the configured stop timeout. Returns false if a worker is
    /// still running; the buffer is then left untouched.
    pub async fn stop(&mut self) -> bool {
        for worker in &self.workers {
            worker.state.request_stop();
        }

        let deadline = Instant::now() + self.settings.stop_timeout;
        while !self.workers.iter().all(|w| w.handle.is_finished()) && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }

        let (finished, lingering): (Vec<Worker>, Vec<Worker>) = mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        for worker in finished {
            if worker.handle.join().is_err() {
                error!("Capture worker for hci{} panicked", worker.interface);
            }
        }

        if lingering.is_empty() {
            return true;
        }
        let interfaces: Vec<String> = lingering.iter().map(|w| format!("hci{}", w.interface)).collect();
        error!(
            "Capture workers did not stop within {}s: {}",
            self.settings.stop_timeout.as_secs_f32(),
            interfaces.join(", ")
        );
        self.workers = lingering;
        false
    }

    /// Stop capture on process termination
    pub async fn shutdown(&mut self) -> bool {
        info!("Stopping capture, {} worker(s) running", self.running_workers());
        self.stop().await
    }
}

fn run_worker(
    radio: &dyn Radio,
    interface: u16,
    mode: ScanMode,
    scan_timeout: Duration,
    buffer: &CaptureBuffer,
    state: &WorkerState,
) {
    loop {
        if state.stop_requested() && state.confirm_stop() {
            return;
        }
        let mut channel = match radio.open(interface, mode) {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to open scanner on hci{}: {}", interface, e);
                state.exit();
                return;
            }
        };
        debug!("Scanning on hci{}", interface);

        loop {
            let (batch, result) = collect_round(channel.as_mut(), interface, scan_timeout, state);
            let found = !batch.is_empty();
            buffer.append(batch);

            if let Err(e) = result {
                error!("Scanner read failed on hci{}: {}", interface, e);
                state.exit();
                return;
            }
            if state.stop_requested() {
                if state.confirm_stop() {
                    return;
                }
                continue;
            }
            if !found {
                info!(
                    "Nothing received on hci{} for {}s, restarting scanner",
                    interface,
                    scan_timeout.as_secs()
                );
                break;
            }
        }
    }
}

/// Receive frames until the round ends or a stop is requested
fn collect_round(
    channel: &mut dyn RadioChannel,
    interface: u16,
    scan_timeout: Duration,
    state: &WorkerState,
) -> (Vec<RawFrame>, io::Result<()>) {
    let mut batch = Vec::new();
    let deadline = Instant::now() + scan_timeout;

    while !state.stop_requested() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match channel.recv(remaining.min(POLL_SLICE)) {
            Ok(Some(bytes)) => batch.push(RawFrame::new(interface, bytes)),
            Ok(None) => {}
            Err(e) => return (batch, Err(e)),
        }
    }
    (batch, Ok(()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Radio fed from a queue shared with the test
    #[derive(Clone, Default)]
    pub(crate) struct FakeRadio {
        pub frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub opens: Arc<AtomicUsize>,
        pub fail_open: bool,
        /// The first receive call blocks this long, ignoring its timeout
        pub first_recv_stall: Option<Duration>,
    }

    struct FakeChannel {
        radio: FakeRadio,
        stalled: bool,
    }

    impl RadioChannel for FakeChannel {
        fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            if let (Some(stall), false) = (self.radio.first_recv_stall, self.stalled) {
                self.stalled = true;
                thread::sleep(stall);
                return Ok(None);
            }
            if let Some(frame) = self.radio.frames.lock().unwrap().pop_front() {
                return Ok(Some(frame));
            }
            thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(None)
        }
    }

    impl Radio for FakeRadio {
        fn open(&self, _interface: u16, _mode: ScanMode) -> io::Result<Box<dyn RadioChannel>> {
            let previous = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no access"));
            }
            Ok(Box::new(FakeChannel {
                radio: self.clone(),
                stalled: previous > 0,
            }))
        }
    }

    pub(crate) fn settings(interfaces: Vec<u16>) -> CaptureSettings {
        CaptureSettings {
            interfaces,
            mode: ScanMode::Passive,
            scan_timeout: Duration::from_millis(40),
            stop_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = CaptureBuffer::new();
        buffer.append(vec![RawFrame::new(0, vec![1]), RawFrame::new(0, vec![2])]);
        buffer.append(Vec::new());

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[tokio::test]
    async fn workers_append_frames_until_stopped() {
        let radio = FakeRadio::default();
        radio.frames.lock().unwrap().extend([vec![1], vec![2], vec![3]]);
        let buffer = CaptureBuffer::new();
        let mut session = CaptureSession::new(Arc::new(radio.clone()), settings(vec![0]), buffer.clone());

        session.start().unwrap();
        wait_for(|| buffer.len() == 3).await;

        assert!(session.stop().await);
        assert_eq!(session.running_workers(), 0);
        let frames = buffer.drain();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.interface == 0));
    }

    #[tokio::test]
    async fn quiet_radio_is_restarted() {
        let radio = FakeRadio::default();
        let mut session = CaptureSession::new(Arc::new(radio.clone()), settings(vec![0]), CaptureBuffer::new());

        session.start().unwrap();
        wait_for(|| radio.opens.load(Ordering::SeqCst) >= 3).await;
        assert!(session.stop().await);
        assert!(radio.opens.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn open_failure_ends_the_worker() {
        let radio = FakeRadio {
            fail_open: true,
            ..FakeRadio::default()
        };
        let mut session = CaptureSession::new(Arc::new(radio.clone()), settings(vec![0]), CaptureBuffer::new());

        session.start().unwrap();
        wait_for(|| session.running_workers() == 0).await;
        assert!(session.stop().await);
        assert_eq!(radio.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_worker_per_interface() {
        let radio = FakeRadio::default();
        let mut session =
            CaptureSession::new(Arc::new(radio.clone()), settings(vec![0, 1]), CaptureBuffer::new());

        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(session.workers.len(), 2);
        assert!(session.stop().await);
    }

    #[tokio::test]
    async fn stop_timeout_leaves_the_buffer_alone() {
        let radio = FakeRadio {
            first_recv_stall: Some(Duration::from_millis(400)),
            ..FakeRadio::default()
        };
        let buffer = CaptureBuffer::new();
        buffer.append(vec![RawFrame::new(0, vec![9])]);
        let mut session = CaptureSession::new(
            Arc::new(radio),
            CaptureSettings {
                stop_timeout: Duration::from_millis(50),
                ..settings(vec![0])
            },
            buffer.clone(),
        );

        session.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.stop().await);
        assert_eq!(buffer.len(), 1);

        // The straggler exits once its stalled read returns
        wait_for(|| session.running_workers() == 0).await;
        assert!(session.stop().await);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn stop_requests_are_withdrawn_until_the_worker_commits() {
        let state = WorkerState::default();
        assert!(!state.stop_requested());
        assert!(state.resume());

        state.request_stop();
        assert!(state.stop_requested());
        assert!(state.resume());
        assert!(!state.confirm_stop());

        state.request_stop();
        assert!(state.confirm_stop());
        assert!(!state.resume());
        state.request_stop();
        assert!(!state.stop_requested());
    }

    #[tokio::test]
    async fn restart_replaces_a_worker_already_on_its_way_out() {
        let radio = FakeRadio::default();
        let mut session = CaptureSession::new(Arc::new(radio.clone()), settings(vec![0]), CaptureBuffer::new());

        // A worker that saw its stop request but whose thread has not finished yet
        let state = Arc::new(WorkerState::default());
        state.request_stop();
        assert!(state.confirm_stop());
        session.workers.push(Worker {
            interface: 0,
            state: Arc::clone(&state),
            handle: thread::spawn(|| thread::sleep(Duration::from_millis(200))),
        });

        session.start().unwrap();
        assert_eq!(session.workers.len(), 1);
        assert!(!Arc::ptr_eq(&session.workers[0].state, &state));
        wait_for(|| radio.opens.load(Ordering::SeqCst) >= 1).await;
        assert!(radio.opens.load(Ordering::SeqCst) >= 1);
        assert!(session.stop().await);
    }

    #[tokio::test]
    async fn restart_keeps_a_lingering_worker_that_can_carry_on() {
        let radio = FakeRadio {
            first_recv_stall: Some(Duration::from_millis(300)),
            ..FakeRadio::default()
        };
        let mut session = CaptureSession::new(
            Arc::new(radio.clone()),
            CaptureSettings {
                stop_timeout: Duration::from_millis(50),
                ..settings(vec![0])
            },
            CaptureBuffer::new(),
        );

        session.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.stop().await);

        session.start().unwrap();
        assert_eq!(session.workers.len(), 1);
        assert_eq!(radio.opens.load(Ordering::SeqCst), 1);

        // Once the stalled read returns the resumed worker keeps scanning
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(session.running_workers(), 1);
        assert!(session.stop().await);
    }
}
