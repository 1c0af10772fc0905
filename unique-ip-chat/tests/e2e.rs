use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("unique_ip_chat");

    let mut server = spawn_server(&binary).await?;
    let banner = next_line(&mut server.stdout, "waiting for server banner").await?;
    let port = parse_port(&banner)?;

    let mut alice = spawn_client(&binary, "127.0.0.2", &port).await?;
    expect_line(&mut server.stdout, "*** new connection: 127.0.0.2").await?;
    let mut bob = spawn_client(&binary, "127.0.0.3", &port).await?;
    expect_line(&mut server.stdout, "*** new connection: 127.0.0.3").await?;

    // Alice's chat reaches Bob and the server console, tagged with her address.
    alice.send_line("Hello from Alice").await?;
    expect_line(&mut bob.stdout, "[127.0.0.2]: Hello from Alice").await?;
    expect_line(&mut server.stdout, "[127.0.0.2]: Hello from Alice").await?;

    // Operator messages go to everyone.
    server.send_line("hi everyone").await?;
    expect_line(&mut server.stdout, "Server (you): hi everyone").await?;
    expect_line(&mut alice.stdout, "Server: hi everyone").await?;
    expect_line(&mut bob.stdout, "Server: hi everyone").await?;

    // A second client from Alice's address is turned away.
    let impostor = timeout(
        READ_TIMEOUT,
        Command::new(&binary)
            .args(["client", "--local", "127.0.0.2", "--server", "127.0.0.1"])
            .args(["--port", port.as_str()])
            .env("RUST_LOG", "warn")
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .context("impostor client did not exit")??;
    assert!(!impostor.status.success());
    let stderr = String::from_utf8_lossy(&impostor.stderr);
    assert!(
        stderr.contains("rejected by server: IP 127.0.0.2 is already connected"),
        "unexpected impostor stderr: {stderr}"
    );
    expect_line(
        &mut server.stdout,
        "*** rejected connection: IP 127.0.0.2 is already connected",
    )
    .await?;

    alice.send_line("/quit").await?;
    expect_line(&mut alice.stdout, "*** leaving chat").await?;
    expect_line(&mut server.stdout, "*** disconnected: 127.0.0.2").await?;

    bob.send_line("/quit").await?;
    expect_line(&mut bob.stdout, "*** leaving chat").await?;
    expect_line(&mut server.stdout, "*** disconnected: 127.0.0.3").await?;

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    server.send_line("/quit").await?;
    expect_line(&mut server.stdout, "*** server stopped, closed 0 connection(s)").await?;
    ensure_success(&mut server.child, "server").await?;

    Ok(())
}

struct ChatProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ChatProcess {
    fn spawn(mut cmd: Command, name: &str) -> Result<Self> {
        cmd.env("RUST_LOG", "warn")
            .env("RUST_LOG_STYLE", "never")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {name}"))?;
        let stdin = child
            .stdin
            .take()
            .with_context(|| format!("{name} stdin missing after spawn"))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{name} stdout missing after spawn"))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<ChatProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(["server", "--bind", "127.0.0.1", "--port", "0"]);
    ChatProcess::spawn(cmd, "server")
}

async fn spawn_client(binary: &Path, local: &str, port: &str) -> Result<ChatProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(["client", "--local", local, "--server", "127.0.0.1", "--port", port]);
    let mut process = ChatProcess::spawn(cmd, local)?;

    let banner = next_line(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected from {local}") {
        return Err(anyhow!("expected connect banner for {local}, got '{banner}'"));
    }

    Ok(process)
}

fn parse_port(banner: &str) -> Result<String> {
    let addr = banner
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("server banner missing socket: {banner}"))?;
    Ok(port.to_string())
}

async fn expect_line(reader: &mut BufReader<ChildStdout>, expected: &str) -> Result<()> {
    let line = next_line(reader, &format!("waiting for '{expected}'")).await?;
    if line != expected {
        return Err(anyhow!("expected '{expected}', got '{line}'"));
    }
    Ok(())
}

/// Next stdout line without its terminator. EOF and a silent child are errors.
async fn next_line(reader: &mut BufReader<ChildStdout>, description: &str) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out"))?
        .with_context(|| format!("{description}: failed to read line"))?;
    if read == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
