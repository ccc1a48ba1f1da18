//! Test doubles shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use portable_pty::CommandBuilder;

use threecompute_backend::container::{
    ContainerDriver, ContainerError, ContainerResult, PortRange, CONTAINER_NAME_PREFIX,
};

/// Recording in-memory container driver.
#[derive(Default)]
pub struct FakeState {
    pub existing: HashSet<String>,
    pub running: HashSet<String>,
    /// User processes reported per container.
    pub processes: HashMap<String, Vec<String>>,
    /// When set, `start_container` fails.
    pub fail_start: bool,
    /// When set, `get_container_processes` fails.
    pub fail_top: bool,

    pub spawn_calls: Vec<(String, String, PortRange)>,
    pub start_calls: Vec<String>,
    pub remove_calls: Vec<String>,
    pub attach_calls: Vec<(String, String)>,
    pub kill_calls: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Preload a container as existing, optionally running.
    pub fn add_container(&self, name: &str, running: bool) {
        let mut state = self.state();
        state.existing.insert(name.to_string());
        if running {
            state.running.insert(name.to_string());
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn setup_isolated_network(&self) -> ContainerResult<()> {
        Ok(())
    }

    async fn prepare_user_directory(&self, _user_id: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.state().existing.contains(name))
    }

    async fn container_is_running(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.state().running.contains(name))
    }

    async fn spawn_container(
        &self,
        user_id: &str,
        name: &str,
        ports: &PortRange,
    ) -> ContainerResult<()> {
        let mut state = self.state();
        if state.existing.contains(name) {
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }
        state
            .spawn_calls
            .push((user_id.to_string(), name.to_string(), *ports));
        state.existing.insert(name.to_string());
        state.running.insert(name.to_string());
        Ok(())
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        let mut state = self.state();
        state.start_calls.push(name.to_string());
        if state.fail_start {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "injected start failure".to_string(),
            });
        }
        if !state.existing.contains(name) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: format!("No such container: {name}"),
            });
        }
        state.running.insert(name.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> ContainerResult<()> {
        let mut state = self.state();
        state.remove_calls.push(name.to_string());
        state.existing.remove(name);
        state.running.remove(name);
        state.processes.remove(name);
        Ok(())
    }

    async fn list_user_containers(&self) -> ContainerResult<Vec<String>> {
        Ok(self
            .state()
            .existing
            .iter()
            .filter(|name| name.starts_with(CONTAINER_NAME_PREFIX))
            .cloned()
            .collect())
    }

    async fn get_container_processes(&self, name: &str) -> ContainerResult<Vec<String>> {
        let state = self.state();
        if state.fail_top {
            return Err(ContainerError::CommandFailed {
                command: "top".to_string(),
                message: "injected top failure".to_string(),
            });
        }
        Ok(state.processes.get(name).cloned().unwrap_or_default())
    }

    async fn attach_to_container(
        &self,
        name: &str,
        tab_id: &str,
    ) -> ContainerResult<CommandBuilder> {
        let mut state = self.state();
        if !state.running.contains(name) {
            return Err(ContainerError::NotRunning(name.to_string()));
        }
        state
            .attach_calls
            .push((name.to_string(), tab_id.to_string()));
        // A local echo process stands in for the in-container multiplexer.
        Ok(CommandBuilder::new("cat"))
    }

    async fn kill_tab_session(&self, name: &str, tab_id: &str) -> ContainerResult<()> {
        self.state()
            .kill_calls
            .push((name.to_string(), tab_id.to_string()));
        Ok(())
    }
}
