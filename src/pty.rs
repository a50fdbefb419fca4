use crate::config::TerminalConfig;
use crate::error::{ApiError, ErrorCode, TermError, TermResult};
use async_trait::async_trait;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

const OUTPUT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalEnv {
    vars: Vec<(String, String)>,
    removed: Vec<String>,
}

impl TerminalEnv {
    pub fn utf8_locale(locale: &str) -> Self {
        let mut env = Self::default();
        env.set("LANG", locale);
        env.set("LC_ALL", locale);
        env.set("LC_CTYPE", locale);
        // A server started from inside tmux would otherwise refuse to nest.
        env.remove("TMUX");
        env
    }

    pub fn for_attach(config: &TerminalConfig) -> Self {
        let size = config.initial_size();
        let mut env = Self::utf8_locale(&config.locale);
        env.set("TERM", &config.term);
        env.set("COLORTERM", "truecolor");
        env.set("PS1", &config.prompt);
        env.set("COLUMNS", size.cols.to_string());
        env.set("LINES", size.rows.to_string());
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.removed.retain(|name| name != &key);
        match self.vars.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.vars.retain(|(name, _)| name != &key);
        if !self.removed.contains(&key) {
            self.removed.push(key);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    fn apply(&self, cmd: &mut CommandBuilder) {
        for key in &self.removed {
            cmd.env_remove(key);
        }
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// `resize` may run while a `read` is pending.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn read(&self) -> TermResult<Option<Vec<u8>>>;
    async fn write(&self, data: &[u8]) -> TermResult<usize>;
    async fn resize(&self, size: TerminalSize) -> TermResult<()>;
    fn size(&self) -> TerminalSize;
    /// Kills the process and releases the PTY. Safe to call repeatedly.
    async fn close(&self) -> TermResult<()>;
}

type ChildHandle = Box<dyn portable_pty::Child + Send + Sync>;

pub struct PtyProcess {
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    child: Arc<Mutex<ChildHandle>>,
    output: tokio::sync::Mutex<mpsc::Receiver<io::Result<Vec<u8>>>>,
    rows: AtomicU16,
    cols: AtomicU16,
    closed: AtomicBool,
    pid: Option<u32>,
}

impl PtyProcess {
    pub fn spawn(
        command: &CommandSpec,
        size: TerminalSize,
        env: &TerminalEnv,
        read_chunk_bytes: usize,
    ) -> TermResult<Self> {
        if !size.is_valid() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "Invalid terminal size")
                .with_details(format!("{}x{}", size.cols, size.rows))
                .into());
        }

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size.into()).map_err(|err| {
            ApiError::new(ErrorCode::SpawnFailed, "Failed to allocate PTY")
                .with_details(err.to_string())
        })?;
        let portable_pty::PtyPair { master, slave } = pair;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        env.apply(&mut cmd);

        let mut child = slave.spawn_command(cmd).map_err(|err| {
            ApiError::new(
                ErrorCode::SpawnFailed,
                format!("Failed to spawn {}", command.program),
            )
            .with_details(err.to_string())
        })?;
        // The child holds its own copy; keeping ours would mask EOF.
        drop(slave);

        let io = master
            .try_clone_reader()
            .map_err(|err| spawn_io_error("Failed to clone PTY reader", err))
            .and_then(|reader| {
                master
                    .take_writer()
                    .map(|writer| (reader, writer))
                    .map_err(|err| spawn_io_error("Failed to take PTY writer", err))
            })
            .and_then(|(reader, writer)| {
                spawn_reader(reader, read_chunk_bytes.max(1)).map(|rx| (rx, writer))
            });
        let (output, writer) = match io {
            Ok(parts) => parts,
            Err(err) => {
                let _ = child.kill();
                return Err(err);
            }
        };

        let pid = child.process_id();
        tracing::debug!(pid = ?pid, program = %command.program, rows = size.rows, cols = size.cols, "PTY process spawned");

        Ok(Self {
            master: Arc::new(Mutex::new(Some(master))),
            writer: Arc::new(Mutex::new(Some(writer))),
            child: Arc::new(Mutex::new(child)),
            output: tokio::sync::Mutex::new(output),
            rows: AtomicU16::new(size.rows),
            cols: AtomicU16::new(size.cols),
            closed: AtomicBool::new(false),
            pid,
        })
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    pub fn reported_size(&self) -> TermResult<TerminalSize> {
        let master = self.master.lock().expect("master mutex poisoned");
        let master = master.as_ref().ok_or_else(pty_closed)?;
        let size = master.get_size().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to query PTY size")
                .with_details(err.to_string())
        })?;
        Ok(TerminalSize::new(size.rows, size.cols))
    }
}

#[async_trait]
impl Terminal for PtyProcess {
    async fn read(&self) -> TermResult<Option<Vec<u8>>> {
        let mut output = self.output.lock().await;
        match output.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(TermError::Io(err)),
            None => Ok(None),
        }
    }

    async fn write(&self, data: &[u8]) -> TermResult<usize> {
        let data = data.to_vec();
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> TermResult<usize> {
            let mut writer = writer.lock().expect("writer mutex poisoned");
            let writer = writer.as_mut().ok_or_else(pty_closed)?;
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|err| {
                    TermError::from(
                        ApiError::new(ErrorCode::IoError, "Failed to write to PTY")
                            .with_details(err.to_string()),
                    )
                })?;
            Ok(data.len())
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join write").with_details(err.to_string())
        })?
    }

    async fn resize(&self, size: TerminalSize) -> TermResult<()> {
        if !size.is_valid() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "Invalid terminal size")
                .with_details(format!("{}x{}", size.cols, size.rows))
                .into());
        }
        let master = self.master.clone();

        tokio::task::spawn_blocking(move || -> TermResult<()> {
            let master = master.lock().expect("master mutex poisoned");
            let master = master.as_ref().ok_or_else(pty_closed)?;
            master.resize(size.into()).map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to resize PTY")
                    .with_details(err.to_string())
                    .into()
            })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join resize").with_details(err.to_string())
        })??;

        self.rows.store(size.rows, Ordering::SeqCst);
        self.cols.store(size.cols, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        TerminalSize::new(
            self.rows.load(Ordering::SeqCst),
            self.cols.load(Ordering::SeqCst),
        )
    }

    async fn close(&self) -> TermResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let child = self.child.clone();
        let writer = self.writer.clone();
        let master = self.master.clone();
        let pid = self.pid;

        tokio::task::spawn_blocking(move || -> TermResult<()> {
            let mut child = child.lock().expect("child mutex poisoned");
            let still_running = matches!(child.try_wait(), Ok(None));
            if still_running {
                if let Err(err) = child.kill() {
                    tracing::warn!(pid = ?pid, error = %err, "Failed to kill PTY process");
                }
                let _ = child.wait();
            }
            writer.lock().expect("writer mutex poisoned").take();
            master.lock().expect("master mutex poisoned").take();
            tracing::debug!(pid = ?pid, killed = still_running, "PTY process closed");
            Ok(())
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join close").with_details(err.to_string())
        })?
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut child) = self.child.lock()
            && matches!(child.try_wait(), Ok(None))
        {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    chunk_bytes: usize,
) -> TermResult<mpsc::Receiver<io::Result<Vec<u8>>>> {
    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
    thread::Builder::new()
        .name("webterm-pty-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; chunk_bytes];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        })
        .map_err(|err| spawn_io_error("Failed to start PTY reader thread", err))?;
    Ok(rx)
}

fn spawn_io_error(message: &str, err: impl ToString) -> TermError {
    ApiError::new(ErrorCode::SpawnFailed, message)
        .with_details(err.to_string())
        .into()
}

fn pty_closed() -> TermError {
    ApiError::new(ErrorCode::ConnectionClosed, "PTY is closed").into()
}
