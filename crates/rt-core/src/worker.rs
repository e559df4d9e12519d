//! Background execution of pipeline runs.
//!
//! One worker thread drains a job queue. The run lock is taken on the
//! submitting thread, so a second request fails immediately with
//! `ConcurrentOperation` instead of queueing behind the first.

use crate::cancel::CancellationToken;
use crate::events::ProgressSink;
use crate::pipeline::{
    OperationPipeline, OperationRequest, PipelineError, RunGuard, RunReport,
    WarningAcknowledgement,
};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

type RunResult = Result<RunReport, PipelineError>;

struct Job {
    guard: RunGuard,
    request: OperationRequest,
    ack: WarningAcknowledgement,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    reply: Sender<RunResult>,
}

pub struct OperationWorker {
    pipeline: Arc<OperationPipeline>,
    jobs: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OperationWorker {
    pub fn spawn(pipeline: Arc<OperationPipeline>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let runner = Arc::clone(&pipeline);
        let thread = thread::Builder::new()
            .name("romtools-worker".to_string())
            .spawn(move || {
                for job in rx {
                    let Job {
                        guard,
                        request,
                        ack,
                        sink,
                        cancel,
                        reply,
                    } = job;
                    let result =
                        runner.run_locked(&guard, &request, ack, sink.as_ref(), &cancel);
                    // Release before replying so a waiter can submit again at once.
                    drop(guard);
                    if reply.send(result).is_err() {
                        debug!(operation = %request.kind, "run finished with no waiter");
                    }
                }
            })?;
        Ok(Self {
            pipeline,
            jobs: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn pipeline(&self) -> &Arc<OperationPipeline> {
        &self.pipeline
    }

    /// Queue `request` for the worker. Fails without queueing when another
    /// run holds the lock.
    pub fn submit(
        &self,
        request: OperationRequest,
        ack: WarningAcknowledgement,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<OperationHandle, PipelineError> {
        let guard = self.pipeline.lock().try_acquire()?;
        let cancel = CancellationToken::new();
        let (reply, result) = mpsc::channel();
        let jobs = self.jobs.lock().map_err(|_| PipelineError::WorkerGone)?;
        let sender = jobs.as_ref().ok_or(PipelineError::WorkerGone)?;
        sender
            .send(Job {
                guard,
                request,
                ack,
                sink,
                cancel: cancel.clone(),
                reply,
            })
            .map_err(|_| PipelineError::WorkerGone)?;
        Ok(OperationHandle { result, cancel })
    }

    /// Stop accepting jobs and wait for the current one to finish.
    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("operation worker panicked");
            }
        }
    }
}

impl Drop for OperationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A submitted run.
pub struct OperationHandle {
    result: Receiver<RunResult>,
    cancel: CancellationToken,
}

impl OperationHandle {
    /// Request cancellation at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the run reaches a terminal outcome.
    pub fn wait(self) -> RunResult {
        self.result.recv().map_err(|_| PipelineError::WorkerGone)?
    }

    /// `None` when the run is still going after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunResult> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::WorkerGone)),
        }
    }
}
