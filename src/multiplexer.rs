use crate::error::{ApiError, ErrorCode, TermResult};
use crate::pty::{CommandSpec, TerminalEnv};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn program(&self) -> &str;
    fn locate(&self) -> TermResult<PathBuf>;
    async fn has_session(&self, name: &str) -> TermResult<bool>;
    async fn create_session(&self, name: &str, env: &TerminalEnv) -> TermResult<()>;
    fn attach_command(&self, name: &str) -> CommandSpec;
}

#[derive(Debug, Clone)]
pub struct Tmux {
    program: String,
}

impl Tmux {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// `=` asks tmux for an exact name match instead of a prefix match.
fn exact_target(name: &str) -> String {
    format!("={name}")
}

#[async_trait]
impl Multiplexer for Tmux {
    fn program(&self) -> &str {
        &self.program
    }

    fn locate(&self) -> TermResult<PathBuf> {
        which::which(&self.program).map_err(|err| {
            ApiError::new(
                ErrorCode::MultiplexerUnavailable,
                format!("{} not found", self.program),
            )
            .with_details(err.to_string())
            .into()
        })
    }

    async fn has_session(&self, name: &str) -> TermResult<bool> {
        let target = exact_target(name);
        let status = self
            .command()
            .args(["has-session", "-t", target.as_str()])
            .env_remove("TMUX")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to query tmux session")
                    .with_details(err.to_string())
            })?;
        Ok(status.success())
    }

    async fn create_session(&self, name: &str, env: &TerminalEnv) -> TermResult<()> {
        let mut cmd = self.command();
        cmd.args(["new-session", "-d", "-s", name]);
        for key in env.removed() {
            cmd.env_remove(key);
        }
        cmd.envs(env.vars().iter().map(|(key, value)| (key, value)));
        let output = cmd.output().await.map_err(|err| {
            ApiError::new(ErrorCode::SessionCreateFailed, "Failed to run tmux new-session")
                .with_details(err.to_string())
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let details = if stderr.is_empty() {
            format!("tmux new-session exited with {}", output.status)
        } else {
            stderr.to_string()
        };
        Err(
            ApiError::new(ErrorCode::SessionCreateFailed, "Failed to create tmux session")
                .with_details(details)
                .into(),
        )
    }

    fn attach_command(&self, name: &str) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("attach-session")
            .arg("-t")
            .arg(exact_target(name))
    }
}

#[derive(Clone)]
pub struct SessionResolver {
    multiplexer: Arc<dyn Multiplexer>,
    session_name: String,
    create_env: TerminalEnv,
}

impl SessionResolver {
    pub fn new(
        multiplexer: Arc<dyn Multiplexer>,
        session_name: impl Into<String>,
        locale: &str,
    ) -> Self {
        Self {
            multiplexer,
            session_name: session_name.into(),
            create_env: TerminalEnv::utf8_locale(locale),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn program(&self) -> &str {
        self.multiplexer.program()
    }

    pub fn check_available(&self) -> TermResult<PathBuf> {
        self.multiplexer.locate()
    }

    pub async fn ensure_session(&self) -> TermResult<CommandSpec> {
        let name = self.session_name.as_str();
        if self.multiplexer.has_session(name).await? {
            tracing::debug!(session = %name, "Reusing existing tmux session");
            return Ok(self.multiplexer.attach_command(name));
        }

        if let Err(err) = self.multiplexer.create_session(name, &self.create_env).await {
            // Another connection may have created it between the check and
            // our attempt; tmux rejects the duplicate name.
            if !self.multiplexer.has_session(name).await.unwrap_or(false) {
                return Err(err);
            }
            tracing::debug!(session = %name, error = %err, "tmux session appeared concurrently");
        } else {
            tracing::info!(session = %name, "Created tmux session");
        }
        Ok(self.multiplexer.attach_command(name))
    }
}

pub fn missing_multiplexer_message(program: &str) -> String {
    let lines = [
        format!("{program} is required"),
        String::new(),
        format!("This web terminal needs {program} to run."),
        String::new(),
        "Install it with:".to_string(),
        format!("  macOS:         brew install {program}"),
        format!("  Debian/Ubuntu: sudo apt install {program}"),
        format!("  Fedora/CentOS: sudo dnf install {program}"),
        String::new(),
        "Restart the server after installing.".to_string(),
    ];
    let width = lines.iter().map(|line| line.chars().count()).max().unwrap_or(0) + 4;
    let border = "═".repeat(width);

    let mut out = String::from("\r\n\r\n");
    out.push_str(&format!("╔{border}╗\r\n"));
    for line in &lines {
        let pad = width - 2 - line.chars().count();
        out.push_str(&format!("║  {line}{}║\r\n", " ".repeat(pad)));
    }
    out.push_str(&format!("╚{border}╝\r\n\r\n"));
    out
}

pub fn session_failure_message(details: &str) -> String {
    format!("\r\nFailed to create tmux session: {details}\r\n")
}
