use crate::config::{Config, TerminalConfig};
use crate::error::{ApiError, ErrorCode, TermError, TermResult};
use crate::multiplexer::{
    Multiplexer, SessionResolver, Tmux, missing_multiplexer_message, session_failure_message,
};
use crate::pty::{PtyProcess, TerminalEnv};
use crate::relay::{Frame, Relay, RelayOutcome};
use axum::{
    Router,
    body::Body,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const INDEX_DOCUMENT: &str = "index.html";
const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str =
    "Origin, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    MultiplexerMissing,
    SessionFailed,
    SpawnFailed,
    Relayed(RelayOutcome),
}

pub struct TerminalService {
    resolver: SessionResolver,
    config: TerminalConfig,
}

impl TerminalService {
    pub fn new(multiplexer: Arc<dyn Multiplexer>, config: TerminalConfig) -> Self {
        let resolver = SessionResolver::new(multiplexer, &config.session_name, &config.locale);
        Self { resolver, config }
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub async fn serve_connection<S, R>(
        &self,
        mut sink: S,
        stream: R,
        connection_id: &str,
    ) -> ConnectionOutcome
    where
        S: Sink<Frame, Error = TermError> + Send + Unpin + 'static,
        R: Stream<Item = TermResult<Frame>> + Send + Unpin + 'static,
    {
        if let Err(err) = self.resolver.check_available() {
            tracing::warn!(connection_id = %connection_id, error = %err, "Multiplexer not found");
            let message = missing_multiplexer_message(self.resolver.program());
            close_with_diagnostic(&mut sink, Some(message)).await;
            return ConnectionOutcome::MultiplexerMissing;
        }

        let command = match self.resolver.ensure_session().await {
            Ok(command) => command,
            Err(err) => {
                tracing::error!(
                    connection_id = %connection_id,
                    session = %self.resolver.session_name(),
                    error = %err,
                    "Failed to prepare tmux session"
                );
                let message = session_failure_message(&err.client_text());
                close_with_diagnostic(&mut sink, Some(message)).await;
                return ConnectionOutcome::SessionFailed;
            }
        };

        let env = TerminalEnv::for_attach(&self.config);
        let pty = match PtyProcess::spawn(
            &command,
            self.config.initial_size(),
            &env,
            self.config.read_chunk_bytes,
        ) {
            Ok(pty) => pty,
            Err(err) => {
                tracing::error!(connection_id = %connection_id, error = %err, "Failed to start PTY");
                close_with_diagnostic(&mut sink, None).await;
                return ConnectionOutcome::SpawnFailed;
            }
        };
        tracing::info!(
            connection_id = %connection_id,
            session = %self.resolver.session_name(),
            pid = ?pty.process_id(),
            "Attached to tmux session"
        );

        let outcome = Relay::new(pty, connection_id).run(sink, stream).await;
        ConnectionOutcome::Relayed(outcome)
    }
}

async fn close_with_diagnostic<S>(sink: &mut S, message: Option<String>)
where
    S: Sink<Frame, Error = TermError> + Unpin,
{
    if let Some(message) = message
        && sink.send(Frame::Text(message)).await.is_err()
    {
        return;
    }
    if sink.send(Frame::Close).await.is_ok() {
        let _ = sink.close().await;
    }
}

#[derive(Clone)]
pub struct AppState {
    terminal: Arc<TerminalService>,
    static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(terminal: TerminalService, static_dir: Option<PathBuf>) -> Self {
        Self {
            terminal: Arc::new(terminal),
            static_dir,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(terminal_ws))
        .fallback(static_asset)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

pub async fn serve(config: &Config) -> TermResult<()> {
    let addr = config.listen_addr()?;
    let multiplexer = Arc::new(Tmux::new(&config.terminal.multiplexer));
    let terminal = TerminalService::new(multiplexer, config.terminal.clone());
    if let Err(err) = terminal.resolver().check_available() {
        tracing::warn!(error = %err, "tmux is not installed; clients will be shown install instructions");
    }
    let state = AppState::new(terminal, config.server.static_dir.clone());

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
    })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(listen = %local_addr, session = %config.terminal.session_name, "Server listening");
    tracing::info!("Access the terminal at http://{local_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed").with_details(err.to_string())
        })?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn terminal_ws(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Failed to upgrade connection");
            return rejection.into_response();
        }
    };
    let connection_id = Uuid::new_v4().to_string();
    let failed_id = connection_id.clone();
    ws.on_failed_upgrade(move |err| {
        tracing::warn!(connection_id = %failed_id, error = %err, "Failed to upgrade connection");
    })
    .on_upgrade(move |socket| async move {
        tracing::debug!(connection_id = %connection_id, "Terminal connection opened");
        let (sink, stream) = split_socket(socket);
        let outcome = state
            .terminal
            .serve_connection(sink, stream, &connection_id)
            .await;
        tracing::debug!(connection_id = %connection_id, outcome = ?outcome, "Terminal connection closed");
    })
}

fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TermError> + Send + Unpin + 'static,
    impl Stream<Item = TermResult<Frame>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ok::<Message, TermError>(outbound_message(frame)));
    let stream = stream.filter_map(|message| future::ready(inbound_frame(message)));
    (sink, stream)
}

fn outbound_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Close => Message::Close(None),
    }
}

// Pings and pongs are answered by the WebSocket layer.
fn inbound_frame(message: Result<Message, axum::Error>) -> Option<TermResult<Frame>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(err) => Some(Err(err.into())),
    }
}

async fn cors(req: axum::http::Request<Body>, next: middleware::Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

async fn static_asset(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(root) = state.static_dir.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Undecodable paths fall through to the index document.
    let decoded = urlencoding::decode(uri.path()).unwrap_or_default();
    let requested = decoded.trim_start_matches('/');
    let requested = if requested.is_empty() {
        INDEX_DOCUMENT
    } else {
        requested
    };

    let path = match existing_asset(root, requested).await {
        Some(path) => path,
        None => match existing_asset(root, INDEX_DOCUMENT).await {
            Some(path) => path,
            None => return StatusCode::NOT_FOUND.into_response(),
        },
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            if let Some(content_type) = content_type_for(&path) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
            response
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read static asset");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn existing_asset(root: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return None;
    }
    let path = root.join(relative);
    let metadata = tokio::fs::metadata(&path).await.ok()?;
    metadata.is_file().then_some(path)
}

pub fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "html" => Some("text/html; charset=utf-8"),
        "js" => Some("application/javascript"),
        "css" => Some("text/css"),
        "ico" => Some("image/x-icon"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::CommandSpec;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedMultiplexer {
        installed: bool,
        create_fails: bool,
        attach_program: String,
        queries: AtomicUsize,
    }

    impl ScriptedMultiplexer {
        fn new(installed: bool, create_fails: bool, attach_program: &str) -> Arc<Self> {
            Arc::new(Self {
                installed,
                create_fails,
                attach_program: attach_program.to_string(),
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Multiplexer for ScriptedMultiplexer {
        fn program(&self) -> &str {
            "tmux"
        }

        fn locate(&self) -> TermResult<PathBuf> {
            if self.installed {
                Ok(PathBuf::from("/usr/bin/tmux"))
            } else {
                Err(ApiError::new(ErrorCode::MultiplexerUnavailable, "tmux not found").into())
            }
        }

        async fn has_session(&self, _name: &str) -> TermResult<bool> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn create_session(&self, _name: &str, _env: &TerminalEnv) -> TermResult<()> {
            if self.create_fails {
                Err(ApiError::new(ErrorCode::SessionCreateFailed, "Failed to create tmux session")
                    .with_details("server exited unexpectedly")
                    .into())
            } else {
                Ok(())
            }
        }

        fn attach_command(&self, _name: &str) -> CommandSpec {
            CommandSpec::new(&self.attach_program)
        }
    }

    async fn run_connection(multiplexer: Arc<ScriptedMultiplexer>) -> (ConnectionOutcome, Vec<Frame>) {
        let service = TerminalService::new(multiplexer, TerminalConfig::default());
        let (server_tx, client_rx) = mpsc::unbounded::<Frame>();
        let sink = server_tx.with(|frame: Frame| future::ok::<Frame, TermError>(frame));
        let (_client_tx, server_stream) = mpsc::unbounded::<TermResult<Frame>>();
        let outcome = service.serve_connection(sink, server_stream, "test").await;
        let frames = client_rx.collect::<Vec<_>>().await;
        (outcome, frames)
    }

    #[tokio::test]
    async fn missing_multiplexer_sends_one_diagnostic() {
        let multiplexer = ScriptedMultiplexer::new(false, false, "tmux");
        let (outcome, frames) = run_connection(multiplexer.clone()).await;

        assert_eq!(outcome, ConnectionOutcome::MultiplexerMissing);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Text(text) => assert!(text.contains("brew install tmux")),
            other => panic!("expected diagnostic text, got {other:?}"),
        }
        assert_eq!(frames[1], Frame::Close);
        assert_eq!(multiplexer.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_failure_is_reported_to_client() {
        let multiplexer = ScriptedMultiplexer::new(true, true, "tmux");
        let (outcome, frames) = run_connection(multiplexer).await;

        assert_eq!(outcome, ConnectionOutcome::SessionFailed);
        assert_eq!(
            frames,
            vec![
                Frame::Text(session_failure_message("server exited unexpectedly")),
                Frame::Close
            ]
        );
    }

    #[tokio::test]
    async fn spawn_failure_closes_without_diagnostic() {
        let multiplexer =
            ScriptedMultiplexer::new(true, false, "/nonexistent/webterm-attach-missing");
        let (outcome, frames) = run_connection(multiplexer).await;

        assert_eq!(outcome, ConnectionOutcome::SpawnFailed);
        assert_eq!(frames, vec![Frame::Close]);
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(
            content_type_for(Path::new("index.html")),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(
            content_type_for(Path::new("main.abc123.js")),
            Some("application/javascript")
        );
        assert_eq!(content_type_for(Path::new("styles.css")), Some("text/css"));
        assert_eq!(content_type_for(Path::new("favicon.ico")), Some("image/x-icon"));
        assert_eq!(content_type_for(Path::new("font.woff2")), None);
        assert_eq!(content_type_for(Path::new("LICENSE")), None);
    }

    #[test]
    fn inbound_frames_skip_keepalives() {
        assert!(inbound_frame(Ok(Message::Ping(vec![1]))).is_none());
        assert!(inbound_frame(Ok(Message::Pong(vec![]))).is_none());
        assert!(matches!(
            inbound_frame(Ok(Message::Binary(vec![1, 2]))),
            Some(Ok(Frame::Binary(bytes))) if bytes == vec![1, 2]
        ));
        assert!(matches!(
            inbound_frame(Ok(Message::Close(None))),
            Some(Ok(Frame::Close))
        ));
    }
}
