use crate::error::TermError;
use crate::pty::{Terminal, TerminalSize};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

impl ResizeRequest {
    // Zero dimensions count as malformed.
    pub fn parse(text: &str) -> Option<TerminalSize> {
        let request: ResizeRequest = serde_json::from_str(text).ok()?;
        let size = TerminalSize::new(request.rows, request.cols);
        size.is_valid().then_some(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    TerminalClosed,
    TerminalFailed,
    OutputFailed,
    InputFailed,
    ClientClosed,
    ClientFailed,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::TerminalClosed => "terminal_closed",
            RelayOutcome::TerminalFailed => "terminal_failed",
            RelayOutcome::OutputFailed => "output_failed",
            RelayOutcome::InputFailed => "input_failed",
            RelayOutcome::ClientClosed => "client_closed",
            RelayOutcome::ClientFailed => "client_failed",
        }
    }
}

struct Termination {
    token: CancellationToken,
    cause: OnceLock<RelayOutcome>,
}

impl Termination {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: OnceLock::new(),
        }
    }

    fn trigger(&self, cause: RelayOutcome) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    fn outcome(&self, fallback: RelayOutcome) -> RelayOutcome {
        self.cause.get().copied().unwrap_or(fallback)
    }
}

/// Once either pump stops the other is cancelled, then the terminal is
/// closed before the connection.
pub struct Relay<T> {
    terminal: Arc<T>,
    connection_id: String,
}

impl<T> Relay<T>
where
    T: Terminal + 'static,
{
    pub fn new(terminal: T, connection_id: impl Into<String>) -> Self {
        Self {
            terminal: Arc::new(terminal),
            connection_id: connection_id.into(),
        }
    }

    pub async fn run<S, R>(self, sink: S, stream: R) -> RelayOutcome
    where
        S: Sink<Frame, Error = TermError> + Send + Unpin + 'static,
        R: Stream<Item = Result<Frame, TermError>> + Send + Unpin + 'static,
    {
        let termination = Arc::new(Termination::new());
        let outbound = tokio::spawn(pump_output(
            self.terminal.clone(),
            sink,
            termination.clone(),
            self.connection_id.clone(),
        ));
        let inbound = tokio::spawn(pump_input(
            self.terminal.clone(),
            stream,
            termination.clone(),
            self.connection_id.clone(),
        ));

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        if let Err(err) = &inbound {
            tracing::error!(connection_id = %self.connection_id, error = %err, "Input pump panicked");
            termination.trigger(RelayOutcome::ClientFailed);
        }
        let sink = match outbound {
            Ok(handoff) => handoff,
            Err(err) => {
                tracing::error!(connection_id = %self.connection_id, error = %err, "Output pump panicked");
                termination.trigger(RelayOutcome::OutputFailed);
                SinkHandoff::Broken
            }
        };
        let outcome = termination.outcome(RelayOutcome::TerminalFailed);

        tracing::info!(connection_id = %self.connection_id, cause = outcome.as_str(), "Relay finished; cleaning up");
        if let Err(err) = self.terminal.close().await {
            tracing::warn!(connection_id = %self.connection_id, error = %err, "Failed to close terminal");
        }
        match sink {
            SinkHandoff::Open(mut sink) => {
                if sink.send(Frame::Close).await.is_ok() {
                    let _ = sink.close().await;
                }
            }
            SinkHandoff::CloseSent(mut sink) => {
                let _ = sink.close().await;
            }
            SinkHandoff::Broken => {}
        }
        outcome
    }
}

// A sink that has returned an error is dropped, never polled again.
enum SinkHandoff<S> {
    Open(S),
    CloseSent(S),
    Broken,
}

async fn pump_output<T, S>(
    terminal: Arc<T>,
    mut sink: S,
    termination: Arc<Termination>,
    connection_id: String,
) -> SinkHandoff<S>
where
    T: Terminal + ?Sized,
    S: Sink<Frame, Error = TermError> + Unpin,
{
    loop {
        let read = tokio::select! {
            _ = termination.token.cancelled() => return SinkHandoff::Open(sink),
            read = terminal.read() => read,
        };
        match read {
            Ok(Some(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if let Err(err) = sink.send(Frame::Binary(chunk)).await {
                    tracing::debug!(connection_id = %connection_id, error = %err, "Failed to send terminal output");
                    termination.trigger(RelayOutcome::OutputFailed);
                    return SinkHandoff::Broken;
                }
            }
            Ok(None) => {
                tracing::debug!(connection_id = %connection_id, "Terminal reached EOF");
                termination.trigger(RelayOutcome::TerminalClosed);
                return send_close(sink).await;
            }
            Err(err) => {
                tracing::debug!(connection_id = %connection_id, error = %err, "Failed to read from terminal");
                termination.trigger(RelayOutcome::TerminalFailed);
                return send_close(sink).await;
            }
        }
    }
}

async fn send_close<S>(mut sink: S) -> SinkHandoff<S>
where
    S: Sink<Frame, Error = TermError> + Unpin,
{
    match sink.send(Frame::Close).await {
        Ok(()) => SinkHandoff::CloseSent(sink),
        Err(_) => SinkHandoff::Broken,
    }
}

async fn pump_input<T, R>(
    terminal: Arc<T>,
    mut stream: R,
    termination: Arc<Termination>,
    connection_id: String,
) where
    T: Terminal + ?Sized,
    R: Stream<Item = Result<Frame, TermError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = termination.token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Frame::Text(text))) => {
                let Some(size) = ResizeRequest::parse(&text) else {
                    tracing::trace!(connection_id = %connection_id, "Ignoring malformed control message");
                    continue;
                };
                let resized = tokio::select! {
                    _ = termination.token.cancelled() => return,
                    resized = terminal.resize(size) => resized,
                };
                match resized {
                    Ok(()) => {
                        tracing::debug!(connection_id = %connection_id, rows = size.rows, cols = size.cols, "Terminal resized");
                    }
                    Err(err) => {
                        tracing::warn!(connection_id = %connection_id, error = %err, "Failed to resize terminal");
                    }
                }
            }
            Some(Ok(Frame::Binary(data))) => {
                if data.is_empty() {
                    continue;
                }
                let written = tokio::select! {
                    _ = termination.token.cancelled() => return,
                    written = terminal.write(&data) => written,
                };
                if let Err(err) = written {
                    tracing::debug!(connection_id = %connection_id, error = %err, "Failed to write to terminal");
                    termination.trigger(RelayOutcome::InputFailed);
                    return;
                }
            }
            Some(Ok(Frame::Close)) | None => {
                tracing::debug!(connection_id = %connection_id, "Client closed connection");
                termination.trigger(RelayOutcome::ClientClosed);
                return;
            }
            Some(Err(err)) => {
                tracing::debug!(connection_id = %connection_id, error = %err, "Failed to read from client");
                termination.trigger(RelayOutcome::ClientFailed);
                return;
            }
        }
    }
}
