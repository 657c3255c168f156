//! Asynchronous request lifecycle.
//!
//! Every access-manager operation returns a [`VolumeDataRequest`]: a handle
//! over a monotonic Pending -> (Completed | Canceled) state machine serviced
//! by the manager's worker runtime. Polling never blocks; `wait_for_completion`
//! and `data` block only the calling thread. The destination buffer is owned
//! by the job while Pending, moves into the handle on completion and is
//! discarded on cancellation.

use crate::accessor::Scalar;
use crate::error::{Result, VdsError};
use crate::types::VoxelFormat;
use bytes::Bytes;
use ndarray::{ArrayD, IxDyn};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// State of an asynchronous request. Transitions are monotonic: once a
/// terminal state is reached it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Completed,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

struct RequestInner {
    state: RequestState,
    result: Option<Bytes>,
    failure: Option<String>,
    wakers: Vec<Waker>,
}

/// State shared between a request handle and its worker job
pub(crate) struct RequestShared {
    id: u64,
    inner: Mutex<RequestInner>,
    completed_cond: Condvar,
    cancel_requested: AtomicBool,
}

impl RequestShared {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(RequestInner {
                state: RequestState::Pending,
                result: None,
                failure: None,
                wakers: Vec::new(),
            }),
            completed_cond: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Whether cancellation has been requested; jobs poll this between
    /// chunks of work
    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Terminal transition to Completed. No-op if already terminal, so a
    /// late-arriving job result cannot overwrite an earlier transition.
    pub(crate) fn finish_completed(&self, result: Option<Bytes>) {
        self.finish(RequestState::Completed, result, None);
    }

    /// Terminal transition to Canceled, optionally recording the failure
    /// that forced it
    pub(crate) fn finish_canceled(&self, failure: Option<String>) {
        self.finish(RequestState::Canceled, None, failure);
    }

    fn finish(&self, state: RequestState, result: Option<Bytes>, failure: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        inner.result = result;
        inner.failure = failure;
        let wakers = std::mem::take(&mut inner.wakers);
        drop(inner);
        self.completed_cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    fn wait_until_terminal(&self) -> RequestState {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.completed_cond.wait(&mut inner);
        }
        inner.state
    }
}

/// Handle to one asynchronous volume data request.
///
/// Dropping a still-pending request cancels it and waits for the job to
/// leave the scheduler, so a discarded handle can never leak a running job.
pub struct VolumeDataRequest {
    shared: Arc<RequestShared>,
    format: VoxelFormat,
    shape: Vec<usize>,
}

impl VolumeDataRequest {
    pub(crate) fn new(shared: Arc<RequestShared>, format: VoxelFormat, shape: Vec<usize>) -> Self {
        Self {
            shared,
            format,
            shape,
        }
    }

    /// Opaque identifier, unique among outstanding requests of the manager
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// Current state; never blocks
    pub fn state(&self) -> RequestState {
        self.shared.state()
    }

    /// Non-blocking poll: has the request completed successfully?
    pub fn is_completed(&self) -> bool {
        self.shared.state() == RequestState::Completed
    }

    /// Non-blocking poll: has the request been canceled?
    pub fn is_canceled(&self) -> bool {
        self.shared.state() == RequestState::Canceled
    }

    /// Element format of the delivered data
    pub fn format(&self) -> VoxelFormat {
        self.format
    }

    /// Shape of the delivered data in dimension order (empty for prefetch
    /// requests, which deliver no caller-visible buffer)
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Request best-effort cancellation. The job observes the flag between
    /// chunks of work, so completion may still win the race; use
    /// [`cancel_and_wait_for_completion`](Self::cancel_and_wait_for_completion)
    /// before reusing buffers.
    pub fn cancel(&self) -> Result<()> {
        if self.is_completed() {
            return Err(VdsError::AlreadyCompleted);
        }
        self.shared.request_cancel();
        Ok(())
    }

    /// Block the calling thread until the request completes or the timeout
    /// elapses. A zero timeout is a non-blocking poll. Returns `false` on
    /// timeout, leaving the request Pending and waitable again.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<bool> {
        let mut inner = self.shared.inner.lock();
        if inner.state == RequestState::Canceled {
            return Err(VdsError::AlreadyCanceled);
        }
        if inner.state == RequestState::Completed {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }
        let deadline = Instant::now() + timeout;
        while !inner.state.is_terminal() {
            if self
                .shared
                .completed_cond
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                break;
            }
        }
        match inner.state {
            RequestState::Completed => Ok(true),
            RequestState::Canceled => Err(VdsError::AlreadyCanceled),
            RequestState::Pending => Ok(false),
        }
    }

    /// Cancel and block until the race between cancellation and natural
    /// completion resolves. On return the job has left the scheduler and
    /// the destination buffer is no longer written to.
    pub fn cancel_and_wait_for_completion(&self) -> RequestState {
        self.shared.request_cancel();
        self.shared.wait_until_terminal()
    }

    /// The delivered data, blocking until the request completes.
    /// Fails with [`VdsError::RequestCanceled`] for canceled requests.
    pub fn data(&self) -> Result<Bytes> {
        match self.shared.wait_until_terminal() {
            RequestState::Completed => {
                let inner = self.shared.inner.lock();
                Ok(inner.result.clone().unwrap_or_default())
            }
            _ => Err(VdsError::RequestCanceled),
        }
    }

    /// The delivered data viewed as typed elements. Fails when `T` does not
    /// match the request's element format.
    pub fn data_as<T: Scalar>(&self) -> Result<Vec<T>> {
        if T::FORMAT != self.format {
            return Err(VdsError::Configuration(format!(
                "request delivers {}, not {}",
                self.format,
                T::FORMAT
            )));
        }
        let bytes = self.data()?;
        crate::accessor::typed_from_bytes(&bytes)
    }

    /// The delivered data as a dynamically shaped array
    pub fn data_array<T: Scalar>(&self) -> Result<ArrayD<T>> {
        let data = self.data_as::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), data)
            .map_err(|e| VdsError::InvalidDimensions(e.to_string()))
    }

    /// The failure message recorded when an I/O error forced cancellation
    pub fn failure(&self) -> Option<String> {
        self.shared.inner.lock().failure.clone()
    }

    /// A future resolving to the terminal state, for async callers. The
    /// blocking and async paths observe the same state machine.
    pub fn completion(&self) -> RequestCompletion {
        RequestCompletion {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for VolumeDataRequest {
    fn drop(&mut self) {
        if !self.shared.state().is_terminal() {
            tracing::debug!(id = self.shared.id(), "canceling discarded request");
            self.shared.request_cancel();
            self.shared.wait_until_terminal();
        }
    }
}

/// Future returned by [`VolumeDataRequest::completion`]
pub struct RequestCompletion {
    shared: Arc<RequestShared>,
}

impl Future for RequestCompletion {
    type Output = RequestState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            return Poll::Ready(inner.state);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_request(id: u64) -> (VolumeDataRequest, Arc<RequestShared>) {
        let shared = Arc::new(RequestShared::new(id));
        let request = VolumeDataRequest::new(Arc::clone(&shared), VoxelFormat::U8, vec![4]);
        (request, shared)
    }

    #[test]
    fn test_poll_is_non_blocking_and_idempotent() {
        let (request, shared) = make_request(1);
        assert!(!request.is_completed());
        assert!(!request.is_canceled());

        shared.finish_completed(Some(Bytes::from_static(&[1, 2, 3, 4])));
        for _ in 0..3 {
            assert!(request.is_completed());
            assert!(!request.is_canceled());
        }
        assert_eq!(request.data().unwrap(), Bytes::from_static(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_terminal_state_is_monotonic() {
        let (request, shared) = make_request(2);
        shared.finish_canceled(None);
        // A late job result must not overwrite the terminal state
        shared.finish_completed(Some(Bytes::from_static(&[9])));
        assert!(request.is_canceled());
        assert!(matches!(request.data(), Err(VdsError::RequestCanceled)));
    }

    #[test]
    fn test_zero_timeout_polls() {
        let (request, shared) = make_request(3);
        assert!(!request.wait_for_completion(Duration::ZERO).unwrap());
        shared.finish_completed(None);
        assert!(request.wait_for_completion(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_timeout_leaves_request_pending() {
        let (request, shared) = make_request(4);
        let done = request
            .wait_for_completion(Duration::from_millis(20))
            .unwrap();
        assert!(!done);
        assert_eq!(request.state(), RequestState::Pending);
        shared.finish_completed(None);
        assert!(request
            .wait_for_completion(Duration::from_millis(20))
            .unwrap());
    }

    #[test]
    fn test_wait_unblocks_on_completion() {
        let (request, shared) = make_request(5);
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                shared.finish_completed(Some(Bytes::from_static(b"done")));
            })
        };
        assert!(request.wait_for_completion(Duration::from_secs(5)).unwrap());
        worker.join().unwrap();
    }

    #[test]
    fn test_cancel_after_completion_fails() {
        let (request, shared) = make_request(6);
        shared.finish_completed(None);
        assert!(matches!(request.cancel(), Err(VdsError::AlreadyCompleted)));
    }

    #[test]
    fn test_wait_on_canceled_fails() {
        let (request, shared) = make_request(7);
        shared.finish_canceled(None);
        assert!(matches!(
            request.wait_for_completion(Duration::from_millis(1)),
            Err(VdsError::AlreadyCanceled)
        ));
    }

    #[test]
    fn test_cancel_and_wait_resolves_race() {
        // A worker that honors the cancel flag
        let (request, shared) = make_request(8);
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for _ in 0..1000 {
                    if shared.is_cancel_requested() {
                        shared.finish_canceled(None);
                        return;
                    }
                    thread::sleep(Duration::from_micros(100));
                }
                shared.finish_completed(None);
            })
        };
        let state = request.cancel_and_wait_for_completion();
        assert!(state.is_terminal());
        let completed = state == RequestState::Completed;
        let canceled = state == RequestState::Canceled;
        assert!(completed ^ canceled);
        worker.join().unwrap();
    }

    #[test]
    fn test_data_as_format_mismatch() {
        let (request, shared) = make_request(9);
        shared.finish_completed(Some(Bytes::from_static(&[0, 0, 0, 0])));
        assert!(request.data_as::<f32>().is_err());
        assert_eq!(request.data_as::<u8>().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_completion_future() {
        let (request, shared) = make_request(10);
        let completion = request.completion();
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                shared.finish_completed(None);
            })
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let state = runtime.block_on(completion);
        assert_eq!(state, RequestState::Completed);
        worker.join().unwrap();
    }
}
