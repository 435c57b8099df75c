use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{AgentvisorError, Result};
use crate::core::profile::ProbeKind;
use crate::platform::{NativePlatform, Platform};

/// Everything a probe may look at for one check.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub target: Option<String>,
    pub port: Option<u16>,
    pub cwd: PathBuf,
    pub alive: bool,
    pub timeout: Duration,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, ctx: &ProbeContext) -> Result<()>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, ctx: &ProbeContext) -> Result<()> {
        let url = match (&ctx.target, ctx.port) {
            (Some(target), _) => target.clone(),
            (None, Some(port)) => format!("http://127.0.0.1:{port}/"),
            (None, None) => {
                return Err(AgentvisorError::ProbeFailed(
                    "http probe needs a probe_target or a port".to_string(),
                ));
            }
        };
        let response = self
            .client
            .get(&url)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| AgentvisorError::ProbeFailed(format!("GET {url}: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentvisorError::ProbeFailed(format!(
                "GET {url} returned {}",
                response.status()
            )))
        }
    }
}

pub struct CommandProbe;

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self, ctx: &ProbeContext) -> Result<()> {
        let Some(command) = ctx.target.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Err(AgentvisorError::ProbeFailed(
                "command probe needs a probe_target".to_string(),
            ));
        };
        let mut cmd = NativePlatform::shell_inline(command);
        cmd.current_dir(&ctx.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = cmd
            .status()
            .await
            .map_err(|e| AgentvisorError::ProbeFailed(format!("{command}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(AgentvisorError::ProbeFailed(format!(
                "{command} exited with {}",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".to_string())
            )))
        }
    }
}

pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, ctx: &ProbeContext) -> Result<()> {
        let addr = match (&ctx.target, ctx.port) {
            (Some(target), _) => target.clone(),
            (None, Some(port)) => format!("127.0.0.1:{port}"),
            (None, None) => {
                return Err(AgentvisorError::ProbeFailed(
                    "tcp probe needs a probe_target or a port".to_string(),
                ));
            }
        };
        tokio::net::TcpStream::connect(&addr)
            .await
            .map(|_| ())
            .map_err(|e| AgentvisorError::ProbeFailed(format!("connect {addr}: {e}")))
    }
}

/// `probe_kind = none`: healthy while the process is alive.
pub struct ProcessProbe;

#[async_trait]
impl Probe for ProcessProbe {
    async fn check(&self, ctx: &ProbeContext) -> Result<()> {
        if ctx.alive {
            Ok(())
        } else {
            Err(AgentvisorError::ProbeFailed("process is not running".to_string()))
        }
    }
}

pub struct ProbeTable {
    probes: HashMap<ProbeKind, Arc<dyn Probe>>,
}

impl ProbeTable {
    pub fn standard() -> Self {
        let mut table = Self {
            probes: HashMap::new(),
        };
        table.register(ProbeKind::Http, Arc::new(HttpProbe::new()));
        table.register(ProbeKind::Command, Arc::new(CommandProbe));
        table.register(ProbeKind::Tcp, Arc::new(TcpProbe));
        table.register(ProbeKind::None, Arc::new(ProcessProbe));
        table
    }

    pub fn register(&mut self, kind: ProbeKind, probe: Arc<dyn Probe>) {
        self.probes.insert(kind, probe);
    }

    /// Run the probe for `kind`, bounded by the context's timeout.
    pub async fn run(&self, kind: ProbeKind, ctx: &ProbeContext) -> Result<()> {
        let probe = self.probes.get(&kind).ok_or_else(|| {
            AgentvisorError::ProbeFailed(format!("no probe registered for {kind:?}"))
        })?;
        match tokio::time::timeout(ctx.timeout, probe.check(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AgentvisorError::ProbeFailed(format!(
                "timed out after {}s",
                ctx.timeout.as_secs()
            ))),
        }
    }
}
