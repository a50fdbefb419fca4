use futures::{SinkExt, StreamExt};
use std::net::{SocketAddr, TcpListener};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::test]
async fn missing_multiplexer_sends_install_notice() -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], pick_unused_port()));
    let mut child = spawn_server(addr, &["--multiplexer", "webterm-missing-multiplexer"])?;

    let test_result: Result<(), Box<dyn std::error::Error>> = async {
        wait_for_port(addr).await?;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await?;

        let first = timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or("connection closed before the notice")??;
        let text = match first {
            Message::Text(text) => text,
            other => return Err(format!("expected a text notice, got {other:?}").into()),
        };
        assert!(text.as_str().contains("webterm-missing-multiplexer is required"));
        assert!(text.as_str().contains("brew install webterm-missing-multiplexer"));

        loop {
            match timeout(Duration::from_secs(5), client.next()).await? {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(other)) => {
                    return Err(format!("unexpected frame after notice: {other:?}").into());
                }
            }
        }
        Ok(())
    }
    .await;

    let _ = child.kill().await;
    let _ = child.wait().await;
    test_result
}

#[tokio::test]
async fn version_flag_prints_build_label() -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new(env!("CARGO_BIN_EXE_webterm"))
        .arg("--version")
        .output()
        .await?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.starts_with("webterm "), "unexpected version output: {stdout}");
    Ok(())
}

#[tokio::test]
async fn invalid_listen_address_fails_fast() -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new(env!("CARGO_BIN_EXE_webterm"))
        .args(["--listen", "not-an-address"])
        .output()
        .await?;
    assert!(!output.status.success());
    Ok(())
}

#[tokio::test]
async fn clients_share_one_tmux_session() -> Result<(), Box<dyn std::error::Error>> {
    if which::which("tmux").is_err() {
        eprintln!("tmux not installed; skipping");
        return Ok(());
    }
    let session = format!("webterm-test-{}", uuid::Uuid::new_v4().simple());
    let addr = SocketAddr::from(([127, 0, 0, 1], pick_unused_port()));
    let mut child = spawn_server(addr, &["--session-name", &session])?;

    let test_result: Result<(), Box<dyn std::error::Error>> = async {
        wait_for_port(addr).await?;
        let url = format!("ws://{addr}/ws");

        let (mut first, _) = connect_async(url.as_str()).await?;
        first
            .send(Message::Text(r#"{"rows":30,"cols":100}"#.into()))
            .await?;
        first
            .send(Message::Binary(b"echo webterm-$((6*7))-marker\r".to_vec().into()))
            .await?;
        read_until(&mut first, "webterm-42-marker").await?;

        // Malformed control text is ignored and the connection stays usable.
        first.send(Message::Text("{not json".into())).await?;

        let (mut second, _) = connect_async(url.as_str()).await?;
        sleep(Duration::from_millis(300)).await;
        first
            .send(Message::Binary(b"echo shared-$((2+3))-output\r".to_vec().into()))
            .await?;
        read_until(&mut first, "shared-5-output").await?;
        read_until(&mut second, "shared-5-output").await?;

        first.close(None).await?;
        second.close(None).await?;
        sleep(Duration::from_millis(300)).await;

        let status = Command::new("tmux")
            .args(["has-session", "-t", &format!("={session}")])
            .env_remove("TMUX")
            .status()
            .await?;
        assert!(status.success(), "session should outlive its clients");
        Ok(())
    }
    .await;

    let _ = child.kill().await;
    let _ = child.wait().await;
    let _ = Command::new("tmux")
        .args(["kill-session", "-t", &format!("={session}")])
        .env_remove("TMUX")
        .status()
        .await;
    test_result
}

async fn read_until(client: &mut Client, needle: &str) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = timeout(remaining, client.next())
            .await
            .map_err(|_| format!("timed out waiting for {needle:?}"))?
            .ok_or("connection closed")??;
        if let Message::Binary(bytes) = frame {
            seen.extend_from_slice(&bytes);
            if String::from_utf8_lossy(&seen).contains(needle) {
                return Ok(());
            }
        }
    }
}

fn spawn_server(addr: SocketAddr, extra: &[&str]) -> std::io::Result<Child> {
    Command::new(env!("CARGO_BIN_EXE_webterm"))
        .arg("--listen")
        .arg(addr.to_string())
        .args(extra)
        .env_remove("TMUX")
        .kill_on_drop(true)
        .spawn()
}

fn pick_unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to ephemeral port");
    listener.local_addr().expect("get local addr").port()
}

async fn wait_for_port(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err("timeout waiting for HTTP server".into());
        }
        sleep(Duration::from_millis(100)).await;
    }
}
