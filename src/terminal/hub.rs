//! Terminal orchestrator hub.
//!
//! A single reducer task consumes register/unregister/broadcast events and
//! is the sole mutator of the registry. Engine and PTY calls never happen
//! while the exclusive lock is held (the quick resize call excepted);
//! per-user serialization comes from the reducer itself.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::Principal;
use crate::container::{container_name, ContainerDriver, PortRange, CONTAINER_NAME_PREFIX};

use super::messages;
use super::pty::{self, PtyProcess, PtyReader};
use super::registry::{ClientHandle, ClientId, ContainerInfo, Registry, Session};

/// How long an idle user's container waits between process-list polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// PTY output is read in chunks of this size.
const PTY_READ_CHUNK: usize = 20 * 1024;

/// How long the forwarder waits for space in a client's send queue before
/// giving up on the stream.
const FORWARD_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the reducer's event channels.
const EVENT_BUFFER_SIZE: usize = 256;

struct RegisterRequest {
    client_id: ClientId,
    handle: ClientHandle,
    ready: oneshot::Sender<()>,
}

/// Receiver ends of the hub's event channels, consumed by [`Hub::run`].
pub struct HubChannels {
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<Vec<u8>>,
}

/// The terminal session orchestrator.
pub struct Hub {
    driver: Arc<dyn ContainerDriver>,
    registry: Arc<RwLock<Registry>>,
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<ClientId>,
    broadcast_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Hub {
    /// Create a hub around a container driver. The returned channels must be
    /// handed to [`Hub::run`] on a dedicated task.
    pub fn new(driver: Arc<dyn ContainerDriver>) -> (Arc<Self>, HubChannels) {
        let (register_tx, register_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        let hub = Arc::new(Self {
            driver,
            registry: Arc::new(RwLock::new(Registry::default())),
            register_tx,
            unregister_tx,
            broadcast_tx,
            cancel: CancellationToken::new(),
        });

        (
            hub,
            HubChannels {
                register_rx,
                unregister_rx,
                broadcast_rx,
            },
        )
    }

    /// Run the reducer until shutdown. Discovers pre-existing containers
    /// first so a restart does not orphan running sandboxes.
    pub async fn run(self: Arc<Self>, mut channels: HubChannels) {
        self.discover_existing_containers().await;
        self.start_pollers_for_orphaned_containers().await;

        loop {
            tokio::select! {
                Some(request) = channels.register_rx.recv() => {
                    self.handle_register(request).await;
                }
                Some(client_id) = channels.unregister_rx.recv() => {
                    self.handle_unregister(client_id).await;
                }
                Some(message) = channels.broadcast_rx.recv() => {
                    self.handle_broadcast(message).await;
                }
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Request shutdown: the reducer tears down all state and exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the hub shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a new client. Returns once the reducer has created the
    /// session, so frames arriving afterwards always find it.
    pub async fn register(&self, handle: ClientHandle) -> ClientId {
        let client_id = ClientId::next();
        let (ready_tx, ready_rx) = oneshot::channel();
        let request = RegisterRequest {
            client_id,
            handle,
            ready: ready_tx,
        };
        if self.register_tx.send(request).await.is_err() {
            return client_id;
        }
        let _ = ready_rx.await;
        client_id
    }

    /// Enqueue removal of a client and its session.
    pub async fn unregister(&self, client_id: ClientId) {
        let _ = self.unregister_tx.send(client_id).await;
    }

    /// Enqueue a frame for every connected client.
    pub async fn broadcast(&self, message: Vec<u8>) {
        let _ = self.broadcast_tx.send(message).await;
    }

    /// Container recorded for a user, if any.
    pub async fn container_for_user(&self, user_id: &str) -> Option<String> {
        self.registry
            .read()
            .await
            .user_containers
            .get(user_id)
            .map(|info| info.container_name.clone())
    }

    /// Whether an idle cleanup timer is armed for a user.
    pub async fn has_cleanup_timer(&self, user_id: &str) -> bool {
        self.registry
            .read()
            .await
            .cleanup_timers
            .contains_key(user_id)
    }

    /// Number of live sessions across all users.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    /// Whether the client's session has attached to its PTY yet.
    pub async fn session_attached(&self, client_id: ClientId) -> Option<bool> {
        self.registry
            .read()
            .await
            .sessions
            .get(&client_id)
            .map(|session| session.attached)
    }

    /// Write client input to the session's PTY.
    pub async fn handle_pty_input(&self, client_id: ClientId, input: &str) -> anyhow::Result<()> {
        let pty = {
            let registry = self.registry.read().await;
            registry
                .sessions
                .get(&client_id)
                .and_then(|session| session.pty.clone())
        };

        let pty = pty.ok_or_else(|| anyhow::anyhow!("no active pty session"))?;
        pty.write_all(input.as_bytes()).context("writing to pty")?;
        Ok(())
    }

    /// Handle a resize frame: attach lazily on the first one, then set the
    /// terminal window size.
    pub async fn handle_resize(
        &self,
        client_id: ClientId,
        rows: u16,
        cols: u16,
    ) -> anyhow::Result<()> {
        enum Target {
            Existing(Arc<PtyProcess>),
            NeedsAttach {
                principal: Principal,
                tab_id: String,
                container_name: String,
                sender: mpsc::Sender<Vec<u8>>,
            },
        }

        let target = {
            let registry = self.registry.read().await;
            let session = registry
                .sessions
                .get(&client_id)
                .ok_or_else(|| anyhow::anyhow!("no session found"))?;
            match &session.pty {
                Some(pty) => Target::Existing(pty.clone()),
                None => {
                    let client = registry
                        .clients
                        .get(&client_id)
                        .ok_or_else(|| anyhow::anyhow!("no client registered"))?;
                    Target::NeedsAttach {
                        principal: client.principal.clone(),
                        tab_id: session.tab_id.clone(),
                        container_name: session.container_name.clone(),
                        sender: client.sender.clone(),
                    }
                }
            }
        };

        let pty = match target {
            Target::Existing(pty) => pty,
            Target::NeedsAttach {
                principal,
                tab_id,
                container_name,
                sender,
            } => {
                self.attach(client_id, principal, container_name, tab_id, sender)
                    .await?
            }
        };

        pty.resize(rows, cols).context("setting window size")?;
        debug!("resized terminal for client {client_id} to {rows}x{cols}");
        Ok(())
    }

    /// Attach a session to its tab's multiplexer session under a fresh PTY
    /// and start the output forwarder.
    async fn attach(
        &self,
        client_id: ClientId,
        principal: Principal,
        container_name: String,
        tab_id: String,
        sender: mpsc::Sender<Vec<u8>>,
    ) -> anyhow::Result<Arc<PtyProcess>> {
        if !self
            .driver
            .container_is_running(&container_name)
            .await
            .context("checking container status")?
        {
            info!("container {container_name} not running at attach time, attempting restart");
            if let Err(err) = self.driver.start_container(&container_name).await {
                warn!("failed to restart {container_name}, spawning a replacement: {err}");
                let _ = self.driver.remove_container(&container_name).await;
                let ports = PortRange::from_start(principal.port_start);
                self.driver
                    .spawn_container(&principal.user_id, &container_name, &ports)
                    .await
                    .context("spawning replacement container")?;
                info!("spawned replacement container {container_name}");
            }
        }

        let command = self
            .driver
            .attach_to_container(&container_name, &tab_id)
            .await
            .context("building attach command")?;
        let (pty, reader) = pty::spawn(command).context("starting pty")?;

        {
            let mut registry = self.registry.write().await;
            let Some(session) = registry.sessions.get_mut(&client_id) else {
                // The client disconnected while we were attaching.
                pty.close();
                anyhow::bail!("client disconnected during attach");
            };
            session.pty = Some(pty.clone());
            session.attached = true;
        }

        self.spawn_forwarder(client_id, pty.clone(), reader, sender);
        info!(
            "attached to container for user {} tab {tab_id}",
            principal.user_id
        );
        Ok(pty)
    }

    /// Move bytes from the PTY to the client's send queue until EOF, error,
    /// queue backpressure or shutdown. Always releases the PTY on exit.
    fn spawn_forwarder(
        &self,
        client_id: ClientId,
        pty: Arc<PtyProcess>,
        reader: PtyReader,
        sender: mpsc::Sender<Vec<u8>>,
    ) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let read_task = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; PTY_READ_CHUNK];
                    let result = reader.read(&mut buffer);
                    (reader, buffer, result)
                });

                let (returned, buffer, result) = tokio::select! {
                    joined = read_task => match joined {
                        Ok(value) => value,
                        Err(_) => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                reader = returned;

                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!("pty read ended for client {client_id}: {err}");
                        break;
                    }
                };

                let frame = messages::pty_output_frame(&buffer[..n]);
                match tokio::time::timeout(FORWARD_SEND_TIMEOUT, sender.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!("send queue blocked for client {client_id}, dropping pty stream");
                        break;
                    }
                }
            }

            pty.close();
            debug!("stopped forwarder for client {client_id}");
        });
    }

    async fn handle_register(&self, request: RegisterRequest) {
        let RegisterRequest {
            client_id,
            handle,
            ready,
        } = request;
        let principal = handle.principal.clone();
        let user_id = principal.user_id.clone();
        let tab_id = handle.tab_id.clone();
        let name = container_name(&user_id);

        {
            let mut registry = self.registry.write().await;
            registry.cancel_cleanup_timer(&user_id);
        }

        // Engine calls run outside the lock; concurrent registers for the
        // same user are serialized by this reducer, so exactly one create
        // can be issued.
        let container = match self.ensure_user_container(&principal).await {
            Ok(info) => Some(info),
            Err(err) => {
                error!("failed to set up container for user {user_id}: {err}");
                None
            }
        };

        {
            let mut registry = self.registry.write().await;
            if let Some(info) = container {
                registry.user_containers.insert(user_id.clone(), info);
            }
            registry.sessions.insert(
                client_id,
                Session {
                    user_id: user_id.clone(),
                    tab_id: tab_id.clone(),
                    container_name: name,
                    attached: false,
                    pty: None,
                },
            );
            registry.clients.insert(client_id, handle);
        }

        info!("client {client_id} connected for user {user_id}, tab {tab_id}");
        let _ = ready.send(());
    }

    /// Reuse, restart or create the user's container. Idempotent.
    async fn ensure_user_container(
        &self,
        principal: &Principal,
    ) -> Result<ContainerInfo, crate::container::ContainerError> {
        let user_id = &principal.user_id;
        let name = container_name(user_id);
        let ports = PortRange::from_start(principal.port_start);

        let known = {
            let registry = self.registry.read().await;
            registry.user_containers.get(user_id).cloned()
        };

        match known {
            None => {
                if self.driver.container_exists(&name).await? {
                    if self.driver.container_is_running(&name).await? {
                        info!("found existing running container {name}, reusing it");
                    } else {
                        info!("found existing stopped container {name}, restarting it");
                        if let Err(err) = self.driver.start_container(&name).await {
                            warn!("failed to restart container {name}, creating a new one: {err}");
                            let _ = self.driver.remove_container(&name).await;
                            self.driver.spawn_container(user_id, &name, &ports).await?;
                        }
                    }
                } else {
                    self.driver.spawn_container(user_id, &name, &ports).await?;
                    info!("spawned new container for user {user_id}");
                }
                Ok(ContainerInfo {
                    container_name: name,
                    port_range: Some(ports),
                })
            }
            Some(mut info) => {
                if !self.driver.container_is_running(&name).await? {
                    info!("container {name} exists but is not running, restarting it");
                    if let Err(err) = self.driver.start_container(&name).await {
                        warn!("failed to restart container {name}, creating a new one: {err}");
                        {
                            let mut registry = self.registry.write().await;
                            registry.user_containers.remove(user_id);
                        }
                        let _ = self.driver.remove_container(&name).await;
                        self.driver.spawn_container(user_id, &name, &ports).await?;
                        info.port_range = Some(ports);
                    }
                }
                // Containers discovered at startup have no recorded range
                // until their user connects.
                if info.port_range.is_none() {
                    info.port_range = Some(ports);
                }
                Ok(info)
            }
        }
    }

    async fn handle_unregister(&self, client_id: ClientId) {
        let mut registry = self.registry.write().await;

        let client = registry.clients.remove(&client_id);
        let session = registry.sessions.remove(&client_id);
        if client.is_none() && session.is_none() {
            return;
        }

        if let Some(session) = session {
            if let Some(pty) = session.pty {
                pty.close();
            }
            if !registry.has_sessions_for_user(&session.user_id)
                && registry.user_containers.contains_key(&session.user_id)
            {
                self.arm_idle_poller(&mut registry, &session.user_id);
            }
        }

        // Dropping the handle closes the send queue, ending the write pump.
        drop(client);
        debug!("client {client_id} unregistered");
    }

    async fn handle_broadcast(&self, message: Vec<u8>) {
        let registry = self.registry.read().await;
        for (client_id, client) in registry.clients.iter() {
            if let Err(err) = client.sender.try_send(message.clone()) {
                warn!("failed to enqueue broadcast for client {client_id}: {err}");
            }
        }
    }

    /// Arm the idle reaper for a user. Caller holds the exclusive lock and
    /// has observed zero sessions for the user.
    fn arm_idle_poller(&self, registry: &mut Registry, user_id: &str) {
        registry.cancel_cleanup_timer(user_id);

        let handle = tokio::spawn(poll_container_for_idle(
            self.driver.clone(),
            self.registry.clone(),
            self.cancel.clone(),
            user_id.to_string(),
        ));
        registry.cleanup_timers.insert(user_id.to_string(), handle);
    }

    /// Record containers left over from a previous run.
    async fn discover_existing_containers(&self) {
        let names = match self.driver.list_user_containers().await {
            Ok(names) => names,
            Err(err) => {
                warn!("failed to discover existing containers: {err}");
                return;
            }
        };

        let mut discovered = Vec::new();
        for name in names {
            let Some(user_id) = name.strip_prefix(CONTAINER_NAME_PREFIX) else {
                continue;
            };
            if user_id.is_empty() {
                continue;
            }
            match self.driver.container_is_running(&name).await {
                Ok(true) => info!("found running container {name} for user {user_id}"),
                Ok(false) => info!("found stopped container {name} for user {user_id}"),
                Err(err) => {
                    warn!("failed to check status of discovered container {name}: {err}");
                    continue;
                }
            }
            discovered.push((user_id.to_string(), name));
        }

        let mut registry = self.registry.write().await;
        for (user_id, name) in discovered {
            registry.user_containers.insert(
                user_id,
                ContainerInfo {
                    container_name: name,
                    port_range: None,
                },
            );
        }
    }

    /// Start reapers for discovered containers that have no sessions yet.
    async fn start_pollers_for_orphaned_containers(&self) {
        let mut registry = self.registry.write().await;
        let users: Vec<String> = registry.user_containers.keys().cloned().collect();
        for user_id in users {
            if !registry.has_sessions_for_user(&user_id) {
                info!("starting idle poller for orphaned container user {user_id}");
                self.arm_idle_poller(&mut registry, &user_id);
            }
        }
    }

    /// Tear down all state on shutdown.
    async fn shutdown(&self) {
        let mut registry = self.registry.write().await;
        for (_, timer) in registry.cleanup_timers.drain() {
            timer.abort();
        }
        for (_, session) in registry.sessions.drain() {
            if let Some(pty) = session.pty {
                pty.close();
            }
        }
        // Dropping every handle closes every send queue and with it every
        // stream.
        registry.clients.clear();
        info!("terminal hub stopped");
    }
}

/// Idle reaper loop for one user: poll the container's process list every
/// [`POLL_INTERVAL`]; remove the container once no user processes remain
/// and no session has reappeared.
async fn poll_container_for_idle(
    driver: Arc<dyn ContainerDriver>,
    registry: Arc<RwLock<Registry>>,
    cancel: CancellationToken,
    user_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let container = {
            registry
                .read()
                .await
                .user_containers
                .get(&user_id)
                .map(|info| info.container_name.clone())
        };
        let Some(container_name) = container else {
            registry.write().await.cleanup_timers.remove(&user_id);
            return;
        };

        let processes = match driver.get_container_processes(&container_name).await {
            Ok(processes) => processes,
            Err(err) => {
                warn!("process listing failed for {container_name}: {err}");
                continue;
            }
        };
        if !processes.is_empty() {
            continue;
        }

        // A tab may have reconnected while we were polling; removing the
        // container now would tear it down under the new session.
        {
            let mut guard = registry.write().await;
            if guard.has_sessions_for_user(&user_id) {
                guard.cleanup_timers.remove(&user_id);
                return;
            }
        }

        info!("no user processes left in {container_name}, removing it");
        if let Err(err) = driver.remove_container(&container_name).await {
            warn!("failed to remove idle container {container_name}: {err}");
            continue;
        }

        let mut guard = registry.write().await;
        guard.user_containers.remove(&user_id);
        guard.cleanup_timers.remove(&user_id);
        return;
    }
}
