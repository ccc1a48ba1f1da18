//! Container driver.
//!
//! Wraps the container engine CLI (docker) behind an async trait so the
//! terminal orchestrator and the tests can swap in a fake. The driver owns
//! the isolated bridge network, per-user upload directory preparation and
//! the sandbox flags applied to every user container.

mod error;

pub use error::{ContainerError, ContainerResult};

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use portable_pty::CommandBuilder;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Name of the isolated bridge network all user containers attach to.
pub const NETWORK_NAME: &str = "isolated_net";

/// Prefix of every per-user container name.
pub const CONTAINER_NAME_PREFIX: &str = "user-container-";

/// Fixed image tag user containers are created from.
pub const IMAGE: &str = "3compute";

/// Hostname set inside every user container.
pub const CONTAINER_HOSTNAME: &str = "3compute";

/// Prefix of the per-tab multiplexer session names inside a container.
pub const TAB_SESSION_PREFIX: &str = "3compute-tab";

/// Maximum number of users the host is provisioned for; memory is divided
/// evenly across this many containers.
pub const MAX_USERS: u64 = 20;

/// Container name for a user.
pub fn container_name(user_id: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}{user_id}")
}

/// Multiplexer session name for a terminal tab.
pub fn tab_session_name(tab_id: &str) -> String {
    format!("{TAB_SESSION_PREFIX}{tab_id}")
}

/// A contiguous range of published ports, ten per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Range starting at `start`, spanning ten ports.
    pub fn from_start(start: u16) -> Self {
        Self {
            start,
            end: start + 9,
        }
    }

    /// The `-p` publish argument for this range.
    pub fn publish_spec(&self) -> String {
        format!("{0}-{1}:{0}-{1}", self.start, self.end)
    }
}

/// Driver configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Engine binary to shell out to.
    pub binary: String,
    /// Host directory holding one upload directory per user.
    pub uploads_root: PathBuf,
    /// In-container user the sandbox runs as.
    pub uid: u32,
    pub gid: u32,
    /// CPU cap per container.
    pub cpu_per_user: f64,
    /// Memory cap per container in MB.
    pub memory_per_user_mb: u64,
    /// Skip host-isolation packet-filter rules (CI or non-Linux hosts).
    pub ci: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            uploads_root: PathBuf::from("/tmp/uploads"),
            uid: 999,
            gid: 995,
            cpu_per_user: 1.0,
            memory_per_user_mb: crate::observability::DEFAULT_MEMORY_PER_USER_MB,
            ci: false,
        }
    }
}

/// Container engine abstraction used by the terminal orchestrator.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create the isolated bridge network if it does not exist yet.
    async fn setup_isolated_network(&self) -> ContainerResult<()>;

    /// Ensure the user's upload directory exists with container ownership.
    async fn prepare_user_directory(&self, user_id: &str) -> ContainerResult<()>;

    /// Whether a container with this name exists, running or stopped.
    async fn container_exists(&self, name: &str) -> ContainerResult<bool>;

    /// Whether a container with this name is currently running.
    async fn container_is_running(&self, name: &str) -> ContainerResult<bool>;

    /// Create and start a new sandbox container for a user.
    async fn spawn_container(
        &self,
        user_id: &str,
        name: &str,
        ports: &PortRange,
    ) -> ContainerResult<()>;

    /// Start a stopped container.
    async fn start_container(&self, name: &str) -> ContainerResult<()>;

    /// Forcefully remove a container; a missing container is not an error.
    async fn remove_container(&self, name: &str) -> ContainerResult<()>;

    /// Names of all per-user containers known to the engine.
    async fn list_user_containers(&self) -> ContainerResult<Vec<String>>;

    /// User processes currently running in a container, with infrastructure
    /// processes (init, multiplexer, login shells, keepalive) filtered out.
    async fn get_container_processes(&self, name: &str) -> ContainerResult<Vec<String>>;

    /// Unstarted command that attaches to the tab's multiplexer session
    /// inside a running container.
    async fn attach_to_container(
        &self,
        name: &str,
        tab_id: &str,
    ) -> ContainerResult<CommandBuilder>;

    /// Kill the multiplexer session backing a tab.
    async fn kill_tab_session(&self, name: &str, tab_id: &str) -> ContainerResult<()>;
}

/// Container driver shelling out to the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: DriverConfig,
}

impl DockerCli {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run an engine command and return stdout, mapping a nonzero exit
    /// status to [`ContainerError::CommandFailed`].
    async fn run(&self, command: &str, args: &[&str]) -> ContainerResult<String> {
        let output = Command::new(&self.config.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Ensure the uploads root itself exists with container ownership.
    pub async fn setup_uploads_root(&self) -> ContainerResult<()> {
        let root = self.config.uploads_root.clone();
        tokio::fs::create_dir_all(&root).await?;
        apply_container_ownership(&root, self.config.uid, self.config.gid);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn install_host_isolation_rule(&self) -> ContainerResult<()> {
        // Block traffic from the isolated bridge to the default docker
        // bridge; containers keep internet access but cannot reach the host
        // network.
        let output = match self
            .run("network inspect", &["network", "inspect", "-f", "{{.Id}}", NETWORK_NAME])
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!("failed to get network id: {err}");
                return Ok(());
            }
        };
        let mut network_id = output.trim().to_string();
        network_id.truncate(12);

        let bridge = format!("br-{network_id}");
        let status = Command::new("iptables")
            .args(["-I", "DOCKER-USER", "-i", bridge.as_str(), "-o", "docker0", "-j", "DROP"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(code) if code.success() => {
                info!("blocked host communication for network {NETWORK_NAME}");
            }
            Ok(_) | Err(_) => {
                warn!("failed to block host communication for network {NETWORK_NAME}");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for DockerCli {
    async fn setup_isolated_network(&self) -> ContainerResult<()> {
        let inspect = Command::new(&self.config.binary)
            .args(["network", "inspect", NETWORK_NAME])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "network inspect".to_string(),
                message: e.to_string(),
            })?;

        if !inspect.success() {
            self.run(
                "network create",
                &[
                    "network",
                    "create",
                    "--driver",
                    "bridge",
                    // No inter-container communication on the bridge.
                    "--opt",
                    "com.docker.network.bridge.enable_icc=false",
                    NETWORK_NAME,
                ],
            )
            .await?;
            info!("network {NETWORK_NAME} created successfully");
        }

        if self.config.ci {
            warn!("skipping packet-filter configuration in CI");
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        self.install_host_isolation_rule().await?;

        Ok(())
    }

    async fn prepare_user_directory(&self, user_id: &str) -> ContainerResult<()> {
        validate_name(user_id)?;
        let dir = self.config.uploads_root.join(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        apply_container_ownership(&dir, self.config.uid, self.config.gid);
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> ContainerResult<bool> {
        validate_name(name)?;
        let filter = format!("name={name}");
        let output = self
            .run(
                "ps",
                &["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"],
            )
            .await?;
        Ok(output.lines().any(|line| line.trim() == name))
    }

    async fn container_is_running(&self, name: &str) -> ContainerResult<bool> {
        validate_name(name)?;
        let filter = format!("name={name}");
        let output = self
            .run(
                "ps",
                &["ps", "--filter", filter.as_str(), "--format", "{{.Names}}"],
            )
            .await?;
        Ok(output.lines().any(|line| line.trim() == name))
    }

    async fn spawn_container(
        &self,
        user_id: &str,
        name: &str,
        ports: &PortRange,
    ) -> ContainerResult<()> {
        validate_name(user_id)?;
        validate_name(name)?;

        if self.container_exists(name).await? {
            warn!("container {name} already exists, not creating a new one");
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }

        // The upload directory must exist with container ownership before it
        // is bind-mounted, or the in-container user cannot write to /app.
        self.prepare_user_directory(user_id).await?;

        let network = format!("--network={NETWORK_NAME}");
        let user = format!("--user={}:{}", self.config.uid, self.config.gid);
        let cpus = format!("{:.1}", self.config.cpu_per_user);
        let memory = format!("{}m", self.config.memory_per_user_mb);
        let volume = format!(
            "{}:/app",
            self.config.uploads_root.join(user_id).display()
        );
        let publish = ports.publish_spec();

        let args = [
            "run",
            "-d",
            "--name",
            name,
            "--hostname",
            CONTAINER_HOSTNAME,
            network.as_str(),
            "--cap-drop=ALL",
            user.as_str(),
            "--security-opt",
            "no-new-privileges",
            "--cpus",
            cpus.as_str(),
            "--memory",
            memory.as_str(),
            "-p",
            publish.as_str(),
            "-v",
            volume.as_str(),
            IMAGE,
        ];

        info!(
            "[{user_id}] spawning container '{name}' with cmd: {} {}",
            self.config.binary,
            args.join(" ")
        );
        self.run("run", &args).await?;
        info!("[{user_id}] successfully started container '{name}'");
        Ok(())
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        validate_name(name)?;
        self.run("start", &["start", name]).await?;
        info!("started container {name}");
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> ContainerResult<()> {
        validate_name(name)?;
        match self.run("rm", &["rm", "-f", name]).await {
            Ok(_) => {
                info!("removed container {name}");
                Ok(())
            }
            Err(ContainerError::CommandFailed { message, .. })
                if message.contains("No such container") =>
            {
                debug!("container {name} already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_user_containers(&self) -> ContainerResult<Vec<String>> {
        let filter = format!("name={CONTAINER_NAME_PREFIX}");
        let output = self
            .run(
                "ps",
                &["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"],
            )
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(CONTAINER_NAME_PREFIX))
            .map(str::to_string)
            .collect())
    }

    async fn get_container_processes(&self, name: &str) -> ContainerResult<Vec<String>> {
        validate_name(name)?;
        let output = self.run("top", &["top", name]).await?;
        Ok(parse_top_output(&output))
    }

    async fn attach_to_container(
        &self,
        name: &str,
        tab_id: &str,
    ) -> ContainerResult<CommandBuilder> {
        validate_name(name)?;
        validate_tab_id(tab_id)?;

        if !self.container_is_running(name).await? {
            return Err(ContainerError::NotRunning(name.to_string()));
        }

        let script = attach_script(tab_id);
        let mut command = CommandBuilder::new(&self.config.binary);
        command.args(["exec", "-it", name, "sh", "-lc", script.as_str()]);

        info!(
            "attaching to container '{name}' with multiplexer session '{}'",
            tab_session_name(tab_id)
        );
        Ok(command)
    }

    async fn kill_tab_session(&self, name: &str, tab_id: &str) -> ContainerResult<()> {
        validate_name(name)?;
        validate_tab_id(tab_id)?;
        let session = tab_session_name(tab_id);
        self.run(
            "exec",
            &["exec", name, "tmux", "kill-session", "-t", session.as_str()],
        )
        .await?;
        info!("killed multiplexer session {session} in container {name}");
        Ok(())
    }
}

/// Shell script run inside the container to attach a tab: configure the
/// multiplexer, then attach-or-create the tab's named session.
fn attach_script(tab_id: &str) -> String {
    let session = tab_session_name(tab_id);
    format!(
        "tmux set -g mouse on; tmux set -g status off; tmux set -g history-limit 100000; \
         tmux new-session -d -A -s {session}; tmux attach -t {session}"
    )
}

/// Parse the engine's `top` output into user process command lines.
fn parse_top_output(output: &str) -> Vec<String> {
    let mut lines = output.trim().lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };

    let header_cols: Vec<&str> = header.split_whitespace().collect();
    let cmd_idx = header_cols
        .iter()
        .position(|col| *col == "COMMAND" || *col == "CMD")
        .unwrap_or(header_cols.len().saturating_sub(1));

    lines
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() <= cmd_idx {
                return None;
            }
            let command = cols[cmd_idx..].join(" ");
            if is_infrastructure_process(&command) {
                None
            } else {
                Some(command)
            }
        })
        .collect()
}

/// Processes that belong to the sandbox plumbing rather than the user.
fn is_infrastructure_process(command: &str) -> bool {
    if command.starts_with("/sbin/tini") {
        return true;
    }
    if command == "tmux" || command.starts_with("tmux ") {
        return true;
    }
    if command == "sleep infinity" {
        return true;
    }
    let shell = command.split_whitespace().next().unwrap_or("");
    matches!(shell, "sh" | "-sh" | "-ash" | "bash")
}

/// Validate a container or user name used as an engine argument.
fn validate_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "name exceeds maximum length".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Tab ids are interpolated into multiplexer session names and exec
/// arguments, so they must stay strictly alphanumeric.
fn validate_tab_id(tab_id: &str) -> ContainerResult<()> {
    if tab_id.is_empty() || !tab_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ContainerError::InvalidInput(format!(
            "tab id '{tab_id}' must be alphanumeric"
        )));
    }
    Ok(())
}

/// Set container-user ownership on a host path. Permission failures are
/// tolerated on dev machines where the backend does not run as root.
pub(crate) fn apply_container_ownership(path: &std::path::Path, uid: u32, gid: u32) {
    #[cfg(unix)]
    {
        if let Err(err) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
            warn!("failed to set ownership for {}: {err}", path.display());
        } else {
            debug!("set ownership of {} to UID {uid}", path.display());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
    }
}
