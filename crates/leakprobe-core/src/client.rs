//! Storage client collaborator.
//!
//! The monitor drives a [`StorageClient`] through `open → probe → close`.
//! [`SimulatedAbfsClient`] stands in for the real ABFS client: opening a
//! handle starts a read and a write throttling analyzer, and closing it with
//! [`CloseBehavior::LeakAnalyzers`] drops them without release, so their
//! timers outlive the client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{ENABLE_AUTOTHROTTLING, Properties};
use crate::error::CollaboratorError;
use crate::registry::NamedTaskRegistry;
use crate::resource::{PeriodicTaskResource, ThrottlingConfig};

/// open / probe / close over some storage endpoint.
#[async_trait]
pub trait StorageClient: Send + Sync {
    type Handle: Send;

    async fn open(
        &self,
        uri: &str,
        properties: &Properties,
    ) -> Result<Self::Handle, CollaboratorError>;

    /// Observable operation; returns whether `path` exists.
    async fn probe(&self, handle: &mut Self::Handle, path: &str)
    -> Result<bool, CollaboratorError>;

    /// Close the handle. Closing twice is a no-op.
    async fn close(&self, handle: &mut Self::Handle) -> Result<(), CollaboratorError>;
}

/// What `close` does with the analyzers a handle owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseBehavior {
    /// Drop the analyzers without releasing them (the leak).
    #[default]
    LeakAnalyzers,
    /// Release both analyzers before returning.
    ReleaseAnalyzers,
}

impl std::fmt::Display for CloseBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeakAnalyzers => write!(f, "leak_analyzers"),
            Self::ReleaseAnalyzers => write!(f, "release_analyzers"),
        }
    }
}

impl std::str::FromStr for CloseBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "leak_analyzers" | "leak" => Ok(Self::LeakAnalyzers),
            "release_analyzers" | "release" => Ok(Self::ReleaseAnalyzers),
            _ => Err(format!(
                "unknown close behavior: {s}. Expected one of: leak_analyzers, release_analyzers"
            )),
        }
    }
}

/// Parsed `abfs[s]://[container@]account[.host]/path` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbfsUri {
    pub scheme: String,
    pub container: Option<String>,
    pub account: String,
    pub host: Option<String>,
}

impl AbfsUri {
    pub fn parse(uri: &str) -> Result<Self, CollaboratorError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| CollaboratorError::InvalidUri(uri.to_string()))?;
        let scheme = scheme.to_lowercase();
        if scheme != "abfs" && scheme != "abfss" {
            return Err(CollaboratorError::UnsupportedScheme {
                scheme,
                uri: uri.to_string(),
            });
        }

        let authority = rest.split('/').next().unwrap_or_default();
        let (container, endpoint) = match authority.split_once('@') {
            Some((container, endpoint)) => (Some(container.to_string()), endpoint),
            None => (None, authority),
        };
        let (account, host) = match endpoint.split_once('.') {
            Some((account, host)) => (account, Some(host.to_string())),
            None => (endpoint, None),
        };
        if account.is_empty() || container.as_deref() == Some("") {
            return Err(CollaboratorError::InvalidUri(uri.to_string()));
        }

        Ok(Self {
            scheme,
            container,
            account: account.to_string(),
            host,
        })
    }
}

/// Open connection of the simulated client.
#[derive(Debug)]
pub struct SimulatedHandle {
    uri: AbfsUri,
    read_analyzer: Option<PeriodicTaskResource>,
    write_analyzer: Option<PeriodicTaskResource>,
    closed: bool,
}

impl SimulatedHandle {
    #[must_use]
    pub fn uri(&self) -> &AbfsUri {
        &self.uri
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Registry ids of the analyzers this handle still owns.
    #[must_use]
    pub fn analyzer_task_ids(&self) -> Vec<u64> {
        [&self.read_analyzer, &self.write_analyzer]
            .into_iter()
            .flatten()
            .map(PeriodicTaskResource::task_id)
            .collect()
    }
}

/// In-process ABFS-style client reproducing the analyzer timer leak.
#[derive(Debug, Clone)]
pub struct SimulatedAbfsClient {
    registry: Arc<NamedTaskRegistry>,
    close_behavior: CloseBehavior,
    fail_probes: bool,
}

impl SimulatedAbfsClient {
    #[must_use]
    pub fn new(registry: Arc<NamedTaskRegistry>, close_behavior: CloseBehavior) -> Self {
        Self {
            registry,
            close_behavior,
            fail_probes: false,
        }
    }

    /// Make every probe fail after recording failed activity.
    #[must_use]
    pub fn with_failing_probes(mut self, fail: bool) -> Self {
        self.fail_probes = fail;
        self
    }

    #[must_use]
    pub fn close_behavior(&self) -> CloseBehavior {
        self.close_behavior
    }

    fn start_analyzer(
        &self,
        identity: String,
        config: &ThrottlingConfig,
    ) -> Result<PeriodicTaskResource, CollaboratorError> {
        PeriodicTaskResource::spawn(identity, config, &self.registry)
            .map_err(|e| CollaboratorError::ResourceFailed(e.to_string()))
    }
}

#[async_trait]
impl StorageClient for SimulatedAbfsClient {
    type Handle = SimulatedHandle;

    async fn open(
        &self,
        uri: &str,
        properties: &Properties,
    ) -> Result<SimulatedHandle, CollaboratorError> {
        let parsed = AbfsUri::parse(uri)?;
        let throttling = properties
            .get_bool(ENABLE_AUTOTHROTTLING, true)
            .map_err(|e| CollaboratorError::ResourceFailed(e.to_string()))?;

        let (read_analyzer, write_analyzer) = if throttling {
            let config = ThrottlingConfig::from_properties(properties)
                .map_err(|e| CollaboratorError::ResourceFailed(e.to_string()))?;
            let read = self.start_analyzer(format!("read {}", parsed.account), &config)?;
            let write = match self.start_analyzer(format!("write {}", parsed.account), &config) {
                Ok(write) => write,
                Err(err) => {
                    read.release().await;
                    return Err(err);
                }
            };
            (Some(read), Some(write))
        } else {
            (None, None)
        };

        debug!(identity = %uri, account = %parsed.account, throttling, "Client opened");
        Ok(SimulatedHandle {
            uri: parsed,
            read_analyzer,
            write_analyzer,
            closed: false,
        })
    }

    async fn probe(
        &self,
        handle: &mut SimulatedHandle,
        path: &str,
    ) -> Result<bool, CollaboratorError> {
        if handle.closed {
            return Err(CollaboratorError::ClientClosed);
        }

        let units = path.len() as u64;
        if let Some(read) = &handle.read_analyzer {
            let delay = read.throttle_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            read.record_activity(units, self.fail_probes);
        }

        if self.fail_probes {
            return Err(CollaboratorError::ProbeFailed {
                path: path.to_string(),
                reason: "simulated probe failure".to_string(),
            });
        }

        trace!(account = %handle.uri.account, path, "probe");
        Ok(false)
    }

    async fn close(&self, handle: &mut SimulatedHandle) -> Result<(), CollaboratorError> {
        if handle.closed {
            return Ok(());
        }
        handle.closed = true;

        let analyzers = [handle.read_analyzer.take(), handle.write_analyzer.take()];
        match self.close_behavior {
            CloseBehavior::LeakAnalyzers => {
                let leaked = analyzers.iter().flatten().count();
                drop(analyzers);
                debug!(account = %handle.uri.account, leaked, "Client closed; analyzers dropped without release");
            }
            CloseBehavior::ReleaseAnalyzers => {
                for analyzer in analyzers.iter().flatten() {
                    analyzer.release().await;
                }
                debug!(account = %handle.uri.account, "Client closed; analyzers released");
            }
        }
        Ok(())
    }
}
