//! Session worker driving one pipeline on its own thread

use crate::processor::ProcessingNode;
use bci_core::{BspError, BspResult, Chunk};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Running,
    /// `reason` is set when a fatal error ended the session
    Stopped { reason: Option<String> },
}

/// Owns a pipeline exclusively and feeds it chunks in arrival order.
///
/// The first fatal error stops the session; nothing is emitted after it.
pub struct SessionWorker {
    name: String,
    input: Option<mpsc::Sender<Chunk>>,
    output: broadcast::Sender<Chunk>,
    state: watch::Receiver<SessionState>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Start a worker thread for `pipeline`, queueing up to `capacity` chunks
    pub fn spawn<P>(name: &str, mut pipeline: P, capacity: usize) -> BspResult<Self>
    where
        P: ProcessingNode + 'static,
    {
        let (input, mut receiver) = mpsc::channel::<Chunk>(capacity.max(1));
        let (output, _) = broadcast::channel(capacity.max(1));
        let (state_tx, state) = watch::channel(SessionState::Running);
        let sender = output.clone();
        let session = name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("session-{}", name))
            .spawn(move || {
                info!(session = %session, pipeline = pipeline.name(), "Session started");
                let mut processed = 0u64;
                while let Some(chunk) = receiver.blocking_recv() {
                    match pipeline.process(&chunk) {
                        Ok(Some(out)) => {
                            processed += 1;
                            // no subscribers is fine
                            let _ = sender.send(out);
                        }
                        Ok(None) => debug!(session = %session, "No output this cycle"),
                        Err(e) if !e.is_fatal() => warn!(session = %session, error = %e, "Recoverable pipeline error"),
                        Err(e) => {
                            error!(session = %session, error = %e, "Pipeline failed, stopping session");
                            state_tx.send_replace(SessionState::Stopped {
                                reason: Some(e.to_string()),
                            });
                            return;
                        }
                    }
                }
                info!(session = %session, outputs = processed, "Input closed, session finished");
                state_tx.send_replace(SessionState::Stopped { reason: None });
            })
            .map_err(|e| BspError::SessionStopped {
                session: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(SessionWorker {
            name: name.to_string(),
            input: Some(input),
            output,
            state,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receiver for every non-empty pipeline output
    pub fn subscribe(&self) -> broadcast::Receiver<Chunk> {
        self.output.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn stopped(&self) -> BspError {
        let reason = match self.state() {
            SessionState::Stopped { reason: Some(reason) } => reason,
            _ => "session is no longer accepting input".to_string(),
        };
        BspError::SessionStopped {
            session: self.name.clone(),
            reason,
        }
    }

    /// Queue a chunk, waiting for room. Must not be called from async code.
    pub fn blocking_send(&self, chunk: Chunk) -> BspResult<()> {
        match &self.input {
            Some(input) => input.blocking_send(chunk).map_err(|_| self.stopped()),
            None => Err(self.stopped()),
        }
    }

    /// Queue a chunk from async code
    pub async fn send(&self, chunk: Chunk) -> BspResult<()> {
        match &self.input {
            Some(input) => input.send(chunk).await.map_err(|_| self.stopped()),
            None => Err(self.stopped()),
        }
    }

    /// Close the input, let the worker drain the queue and join it
    pub fn stop(mut self) -> SessionState {
        self.shutdown();
        self.state()
    }

    fn shutdown(&mut self) {
        self.input.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(session = %self.name, "Session thread panicked");
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
