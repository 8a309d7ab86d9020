use std::io::{Read, Write};
use std::process::Stdio;

use async_trait::async_trait;
use devnet_core::DevnetError;
use portable_pty::{Child as PtyChild, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecResult, ExecStream, NetworkId};

// ── DockerCli ──────────────────────────────────────────────────────

/// [`ContainerRuntime`] backed by the `docker` command-line client.
///
/// Every operation shells out via `tokio::process::Command`; daemon errors
/// are classified from the client's stderr.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_path: String,
}

/// Raw outcome of one docker client invocation.
struct DockerOutput {
    command: String,
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl DockerOutput {
    fn into_stdout(self) -> Result<String, DevnetError> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(self.failure())
        }
    }

    fn failure(&self) -> DevnetError {
        DevnetError::command(
            self.command.clone(),
            anyhow::anyhow!("docker exited with {}: {}", self.exit_code, self.stderr.trim()),
        )
    }
}

impl DockerCli {
    /// Create a client using the default `docker` command.
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
        }
    }

    /// Create a client with a custom path to the docker executable.
    pub fn with_docker_path(path: impl Into<String>) -> Self {
        Self {
            docker_path: path.into(),
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    /// Execute a docker CLI command and capture its output.
    async fn run_docker(&self, args: &[String]) -> Result<DockerOutput, DevnetError> {
        let command = format!("{} {}", self.docker_path, args.join(" "));
        let output = Command::new(&self.docker_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DevnetError::command(command.clone(), e))?;

        Ok(DockerOutput {
            command,
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_network(&self, name: &str) -> Result<NetworkId, DevnetError> {
        debug!(name = %name, "creating docker network");
        let out = self.run_docker(&args(["network", "create", name])).await?;
        Ok(NetworkId::new(out.into_stdout()?.trim()))
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<(), DevnetError> {
        debug!(id = %id, "removing docker network");
        let out = self.run_docker(&args(["network", "rm", id.id()])).await?;
        if !out.success && is_missing_network(&out.stderr) {
            return Err(DevnetError::NetworkNotFound(id.id().to_string()));
        }
        out.into_stdout().map(drop)
    }

    async fn network_exists(&self, id: &NetworkId) -> Result<bool, DevnetError> {
        debug!(id = %id, "inspecting docker network");
        let out = self
            .run_docker(&args(["network", "inspect", "--format", "{{.Id}}", id.id()]))
            .await?;
        if !out.success && is_missing_network(&out.stderr) {
            return Ok(false);
        }
        out.into_stdout().map(|_| true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, DevnetError> {
        let run_args = run_args(spec);
        debug!(image = %spec.image, name = %spec.name, "running docker container");
        let out = self.run_docker(&run_args).await?;
        if !out.success && is_name_conflict(&out.stderr) {
            return Err(DevnetError::AlreadyExists(spec.name.clone()));
        }
        let id = out.into_stdout()?;
        // `docker run -d` prints the full id last, after any pull progress.
        let id = id.lines().last().unwrap_or("").trim();
        if id.is_empty() {
            return Err(DevnetError::command(
                format!("docker run {}", spec.name),
                anyhow::anyhow!("docker run printed no container id"),
            ));
        }
        Ok(ContainerHandle::new(id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerHandle>, DevnetError> {
        debug!("listing docker containers");
        let out = self
            .run_docker(&args(["ps", "-a", "--no-trunc", "--format", "{{json .}}"]))
            .await?
            .into_stdout()?;
        Ok(parse_ps_output(&out))
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<ExecResult, DevnetError> {
        debug!(container = %handle, cmd = %argv.join(" "), "docker exec");
        let mut exec_args = args(["exec", handle.id()]);
        exec_args.extend_from_slice(argv);
        let out = self.run_docker(&exec_args).await?;
        if !out.success && is_missing_container(&out.stderr) {
            return Err(DevnetError::NotFound(handle.id().to_string()));
        }
        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout.into_bytes(),
            stderr: out.stderr.into_bytes(),
        })
    }

    async fn exec_detached(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<(), DevnetError> {
        debug!(container = %handle, cmd = %argv.join(" "), "docker exec -d");
        let mut exec_args = args(["exec", "-d", handle.id()]);
        exec_args.extend_from_slice(argv);
        let out = self.run_docker(&exec_args).await?;
        if !out.success && is_missing_container(&out.stderr) {
            return Err(DevnetError::NotFound(handle.id().to_string()));
        }
        out.into_stdout().map(drop)
    }

    async fn exec_interactive(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<ExecStream, DevnetError> {
        let command = format!("{} exec -it {} {}", self.docker_path, handle.id(), argv.join(" "));
        debug!(container = %handle, cmd = %argv.join(" "), "docker exec -it");

        let mut exec_args = args(["exec", "-it", handle.id()]);
        exec_args.extend_from_slice(argv);
        spawn_on_pty(&self.docker_path, &exec_args).map_err(|e| DevnetError::command(command, e))
    }

    async fn stop_and_remove(&self, handle: &ContainerHandle) -> Result<(), DevnetError> {
        debug!(container = %handle, "stopping docker container");
        let out = self.run_docker(&args(["stop", handle.id()])).await?;
        if !out.success && is_missing_container(&out.stderr) {
            return Err(DevnetError::NotFound(handle.id().to_string()));
        }
        out.into_stdout()?;

        debug!(container = %handle, "removing docker container");
        self.run_docker(&args(["rm", handle.id()]))
            .await?
            .into_stdout()
            .map(drop)
    }
}

// ── Interactive stream ─────────────────────────────────────────────

const PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

const PTY_CHUNK: usize = 4096;

/// Run `program` on a fresh pseudo-terminal and return the master side as an
/// async duplex stream.
///
/// The pty is blocking, so two threads pump bytes between it and the stream.
/// Once the caller drops the stream the child gets EOF and is killed.
fn spawn_on_pty(program: &str, args: &[String]) -> anyhow::Result<ExecStream> {
    let pair = native_pty_system().openpty(PTY_SIZE)?;
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    let child = pair.slave.spawn_command(cmd)?;
    // Only the child may hold the slave, or reads never see its exit.
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    let (ours, theirs) = tokio::io::duplex(PTY_CHUNK);
    let (mut from_caller, mut to_caller) = tokio::io::split(theirs);

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
    std::thread::spawn(move || pump_output(reader, out_tx));
    tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if to_caller.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = to_caller.shutdown().await;
    });

    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(16);
    tokio::spawn(async move {
        let mut buf = vec![0u8; PTY_CHUNK];
        loop {
            match from_caller.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    std::thread::spawn(move || pump_input(writer, in_rx, pair.master, child));

    Ok(Box::new(ours))
}

/// Copy pty output into `tx` until the child side closes.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; PTY_CHUNK];
    loop {
        match reader.read(&mut buf) {
            // Linux reports EIO once the last slave fd is closed.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Copy caller input onto the pty. When the caller is gone, close the
/// terminal and reap the child.
fn pump_input(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    mut child: Box<dyn PtyChild + Send + Sync>,
) {
    while let Some(chunk) = rx.blocking_recv() {
        if writer.write_all(&chunk).and_then(|()| writer.flush()).is_err() {
            break;
        }
    }
    drop(writer);
    if matches!(child.try_wait(), Ok(None)) {
        if let Err(e) = child.kill() {
            debug!(error = %e, "interactive exec already gone");
        }
    }
    let _ = child.wait();
    drop(master);
}

// ── Argument and output helpers ────────────────────────────────────

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `docker run` arguments for a detached, tty-attached node container.
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut run = args([
        "run",
        "-d",
        "-t",
        "--name",
        spec.name.as_str(),
        "--network",
        spec.network.as_str(),
    ]);
    if let Some(ref platform) = spec.platform {
        run.push("--platform".to_string());
        run.push(platform.clone());
    }
    for port in &spec.ports {
        run.push("-p".to_string());
        run.push(port.publish_arg());
    }
    run.push(spec.image.clone());
    run
}

/// Parse `docker ps --format '{{json .}}'` output, one JSON object per line.
fn parse_ps_output(output: &str) -> Vec<ContainerHandle> {
    let mut handles = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(val) => match val["ID"].as_str() {
                Some(id) if !id.is_empty() => handles.push(ContainerHandle::new(id)),
                _ => warn!(line = %line, "container JSON line without ID"),
            },
            Err(e) => {
                warn!(line = %line, error = %e, "failed to parse container JSON line");
            }
        }
    }
    handles
}

fn is_name_conflict(stderr: &str) -> bool {
    stderr.contains("is already in use")
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

fn is_missing_network(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such network") || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortMapping;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "babylon/bbld:latest".into(),
            name: "A".into(),
            network: "bbl-net".into(),
            ports: vec![PortMapping::tcp(18555, 30001)],
            platform: Some("linux/amd64".into()),
        }
    }

    #[test]
    fn client_construction() {
        assert_eq!(DockerCli::new().docker_path(), "docker");
        assert_eq!(DockerCli::default().docker_path(), "docker");
        assert_eq!(
            DockerCli::with_docker_path("/usr/local/bin/docker").docker_path(),
            "/usr/local/bin/docker"
        );
    }

    #[test]
    fn run_args_include_name_network_platform_and_ports() {
        let run = run_args(&spec());
        assert_eq!(&run[..3], ["run", "-d", "-t"]);
        let joined = run.join(" ");
        assert!(joined.contains("--name A"), "got: {joined}");
        assert!(joined.contains("--network bbl-net"), "got: {joined}");
        assert!(joined.contains("--platform linux/amd64"), "got: {joined}");
        assert!(joined.contains("-p 30001:18555/tcp"), "got: {joined}");
        assert_eq!(run.last().unwrap(), "babylon/bbld:latest");
    }

    #[test]
    fn run_args_without_platform() {
        let mut s = spec();
        s.platform = None;
        assert!(!run_args(&s).iter().any(|a| a == "--platform"));
    }

    #[test]
    fn parses_ps_lines_and_skips_garbage() {
        let output = concat!(
            r#"{"ID":"aaaaaaaaaaaa1111","Names":"A","State":"running"}"#,
            "\n\nnot json\n",
            r#"{"ID":"bbbbbbbbbbbb2222","Names":"B","State":"exited"}"#,
            "\n",
            r#"{"Names":"no-id"}"#,
        );
        let handles = parse_ps_output(output);
        assert_eq!(
            handles,
            vec![
                ContainerHandle::new("aaaaaaaaaaaa1111"),
                ContainerHandle::new("bbbbbbbbbbbb2222"),
            ]
        );
    }

    #[test]
    fn classifies_daemon_errors() {
        assert!(is_name_conflict(
            r#"docker: Error response from daemon: Conflict. The container name "/A" is already in use by container "abc"."#
        ));
        assert!(is_missing_container("Error response from daemon: No such container: abc"));
        assert!(is_missing_network("Error response from daemon: network abc not found"));
        assert!(is_missing_network("Error: No such network: abc"));
        assert!(!is_missing_network("Error response from daemon: network has active endpoints"));
    }

    /// Write an executable stand-in for the docker client.
    #[cfg(unix)]
    fn fake_docker(dir: &tempfile::TempDir, body: &str) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerCli::with_docker_path(path.to_string_lossy())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interactive_exec_runs_on_a_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_docker(
            &dir,
            r#"if [ -t 0 ] && [ -t 1 ]; then echo "$1 $2 tty"; else echo "$1 $2 pipe"; fi"#,
        );

        let mut stream = docker
            .exec_interactive(&ContainerHandle::new("abc"), &args(["btcwallet", "--create"]))
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "exec -it tty");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interactive_exec_forwards_answers() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_docker(&dir, r#"printf 'Passphrase: '; read -r answer; echo "got:$answer""#);

        let mut stream = docker
            .exec_interactive(&ContainerHandle::new("abc"), &args(["btcwallet", "--create"]))
            .await
            .unwrap();
        stream.write_all(b"secret\n").await.unwrap();
        stream.flush().await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("Passphrase: "), "got: {out:?}");
        assert!(out.contains("got:secret"), "got: {out:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn network_existence_is_read_from_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_docker(
            &dir,
            r#"if [ "$5" = "gone" ]; then echo "Error: No such network: gone" >&2; exit 1; fi; echo "$5""#,
        );
        assert!(docker.network_exists(&NetworkId::new("net1")).await.unwrap());
        assert!(!docker.network_exists(&NetworkId::new("gone")).await.unwrap());
    }

    #[tokio::test]
    async fn missing_docker_binary_is_command_error() {
        let docker = DockerCli::with_docker_path("/nonexistent/docker-binary-for-tests");
        let err = docker.list_containers().await.unwrap_err();
        assert!(matches!(err, DevnetError::CommandExecution { .. }), "got: {err}");
    }
}
