use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::core::config::Paths;
use crate::core::profile::{Catalog, Declarations, RunProfile};
use crate::core::state::{ProcessStatus, ProfileKey, StateStore};
use crate::core::supervisor::Supervisor;

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub paths: Paths,
    pub store: Arc<StateStore>,
    pub declarations: Arc<Declarations>,
    pub supervisor: Arc<Supervisor>,
}

impl Fixture {
    /// Temp data dir with an agent directory for every declared agent.
    pub fn new(catalog: Catalog) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = Paths {
            data_dir: root.to_path_buf(),
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
            run_dir: root.join("run"),
            agents_root: root.join("agents"),
        };
        paths.ensure().unwrap();
        for profile in catalog.profiles() {
            std::fs::create_dir_all(paths.agent_dir(&profile.agent_id)).unwrap();
        }
        let store = Arc::new(StateStore::open(&paths.state_dir).unwrap());
        let declarations = Arc::new(Declarations::fixed(catalog));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            declarations.clone(),
            paths.clone(),
            Duration::from_secs(2),
        ));
        Self {
            dir,
            paths,
            store,
            declarations,
            supervisor,
        }
    }

    /// A second supervisor over the same files, as after a daemon restart.
    pub fn reboot(&self) -> Arc<Supervisor> {
        let store = Arc::new(StateStore::open(&self.paths.state_dir).unwrap());
        Arc::new(Supervisor::new(
            store,
            self.declarations.clone(),
            self.paths.clone(),
            Duration::from_secs(2),
        ))
    }
}

pub(crate) fn profile(agent_id: &str, label: &str, command: &str) -> RunProfile {
    RunProfile {
        agent_id: agent_id.to_string(),
        label: label.to_string(),
        command: command.to_string(),
        port: None,
    }
}

pub(crate) async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub(crate) async fn wait_for_status(
    store: &StateStore,
    key: &ProfileKey,
    status: ProcessStatus,
) -> bool {
    wait_for(Duration::from_secs(10), || async move {
        store
            .load()
            .await
            .ok()
            .and_then(|snap| snap.process(key).map(|record| record.status))
            == Some(status)
    })
    .await
}
