use crate::error::{ApiError, ErrorCode, TermResult};
use crate::pty::TerminalSize;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "webterm.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub multiplexer: String,
    pub session_name: String,
    pub rows: u16,
    pub cols: u16,
    pub locale: String,
    pub term: String,
    pub prompt: String,
    pub read_chunk_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            multiplexer: "tmux".to_string(),
            session_name: "web-terminal".to_string(),
            rows: 24,
            cols: 80,
            locale: "en_US.UTF-8".to_string(),
            term: "xterm-256color".to_string(),
            prompt: "$ ".to_string(),
            read_chunk_bytes: 1024,
        }
    }
}

impl TerminalConfig {
    pub fn initial_size(&self) -> TerminalSize {
        TerminalSize::new(self.rows, self.cols)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser, Clone, Default)]
#[command(author, version = crate::version::VERSION, about = "Browser terminal bridged to a shared tmux session")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub session_name: Option<String>,
    #[arg(long)]
    pub multiplexer: Option<String>,
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
    #[arg(long)]
    pub rows: Option<u16>,
    #[arg(long)]
    pub cols: Option<u16>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(args: &Cli) -> TermResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> TermResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> TermResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("WEBTERM_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("WEBTERM_STATIC_DIR")
            && !value.trim().is_empty()
        {
            self.server.static_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("WEBTERM_SESSION_NAME") {
            self.terminal.session_name = value;
        }
        if let Ok(value) = env::var("WEBTERM_MULTIPLEXER") {
            self.terminal.multiplexer = value;
        }
        if let Ok(value) = env::var("WEBTERM_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("WEBTERM_LOG_FORMAT") {
            self.logging.format = value;
        }
    }

    pub fn apply_cli(&mut self, args: &Cli) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(dir) = &args.static_dir {
            self.server.static_dir = Some(dir.clone());
        }
        if let Some(name) = &args.session_name {
            self.terminal.session_name = name.clone();
        }
        if let Some(program) = &args.multiplexer {
            self.terminal.multiplexer = program.clone();
        }
        if let Some(rows) = args.rows {
            self.terminal.rows = rows;
        }
        if let Some(cols) = args.cols {
            self.terminal.cols = cols;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> TermResult<()> {
        self.listen_addr()?;
        if self.terminal.session_name.trim().is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "Session name is empty").into());
        }
        // tmux reserves ':' and '.' as target separators.
        if self.terminal.session_name.contains([':', '.']) {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Session name must not contain ':' or '.'",
            )
            .with_details(self.terminal.session_name.clone())
            .into());
        }
        if self.terminal.multiplexer.trim().is_empty() {
            return Err(
                ApiError::new(ErrorCode::InvalidArgument, "Multiplexer program is empty").into(),
            );
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Terminal rows and cols must be non-zero",
            )
            .into());
        }
        if self.terminal.read_chunk_bytes == 0 {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "read_chunk_bytes must be non-zero",
            )
            .into());
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> TermResult<SocketAddr> {
        self.server.listen.parse().map_err(|_| {
            ApiError::new(ErrorCode::InvalidArgument, "Invalid listen address")
                .with_details(self.server.listen.clone())
                .into()
        })
    }
}
