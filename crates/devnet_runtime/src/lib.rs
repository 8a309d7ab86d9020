//! Container runtime seam.
//!
//! The deploy pipeline talks to containers only through [`ContainerRuntime`].
//! Implementations return handles and raw command output; they never see the
//! persisted state record.

pub mod docker;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use devnet_core::DevnetError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use docker::DockerCli;
pub use memory::{ExecRecord, MemoryRuntime};

// ── Types ──────────────────────────────────────────────────────────

/// Opaque container identity, captured once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Docker ids are 64 hex chars; the short form is what `docker ps` shows.
        let short: String = self.0.chars().take(12).collect();
        f.write_str(&short)
    }
}

/// Identifier of a container network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A port published from the container to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "tcp".to_string(),
        }
    }

    /// `host:container/proto`, the form `docker run -p` takes.
    pub fn publish_arg(&self) -> String {
        format!("{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

/// Everything needed to create one node container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub network: String,
    pub ports: Vec<PortMapping>,
    /// Platform pin such as `linux/amd64`.
    pub platform: Option<String>,
}

/// Output of an attached, non-interactive exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout as trimmed UTF-8 (lossy).
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Raw duplex byte stream attached to an interactive exec.
pub trait ExecIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ExecIo for T {}

pub type ExecStream = Box<dyn ExecIo>;

// ── Trait ──────────────────────────────────────────────────────────

/// The container operations the deploy pipeline consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_network(&self, name: &str) -> Result<NetworkId, DevnetError>;

    /// Fails with [`DevnetError::NetworkNotFound`] when the id is unknown.
    async fn remove_network(&self, id: &NetworkId) -> Result<(), DevnetError>;

    async fn network_exists(&self, id: &NetworkId) -> Result<bool, DevnetError>;

    /// Create and start a container. A name clash is
    /// [`DevnetError::AlreadyExists`].
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, DevnetError>;

    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerHandle>, DevnetError>;

    /// Whether the container behind `handle` still exists.
    async fn is_live(&self, handle: &ContainerHandle) -> Result<bool, DevnetError> {
        Ok(self.list_containers().await?.iter().any(|h| h == handle))
    }

    /// Run `argv` and wait for it. A non-zero exit is reported in the
    /// result, not as an error; transport failures are errors.
    async fn exec(&self, handle: &ContainerHandle, argv: &[String])
    -> Result<ExecResult, DevnetError>;

    /// Start `argv` in the background and return immediately.
    async fn exec_detached(&self, handle: &ContainerHandle, argv: &[String])
    -> Result<(), DevnetError>;

    /// Start `argv` with stdin/stdout attached as a byte stream.
    async fn exec_interactive(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<ExecStream, DevnetError>;

    async fn stop_and_remove(&self, handle: &ContainerHandle) -> Result<(), DevnetError>;
}
