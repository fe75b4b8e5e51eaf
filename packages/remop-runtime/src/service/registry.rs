//! Performer modules and their lifecycle.
//!
//! A module claims a set of operation codes. The registry refuses two modules
//! claiming the same code, checks every claim against the served table before
//! any module starts, and stops modules in reverse start order.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use remop_core::{OperationCode, OperationTable};

use super::config::ServerConfig;

/// What a module sees when it starts.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<ServerConfig>,
    /// Table the performer serves.
    pub table: Arc<OperationTable>,
}

/// A performer module with a start/stop lifecycle.
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
    /// Unique module name, e.g. `"imisc"`.
    fn name(&self) -> &'static str;

    /// Operation codes this module performs.
    fn operations(&self) -> Vec<OperationCode> {
        Vec::new()
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Stops the module. `terminate` skips graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

struct Entry {
    service: Arc<dyn ManagedService>,
    started: bool,
}

/// Modules in registration order, with an operation-code ownership index.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<Vec<Entry>>,
    owners: DashMap<OperationCode, &'static str>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module and returns the shared handle, so the caller can build
    /// its router.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or an operation code is already claimed.
    pub fn register<T: ManagedService>(&self, service: T) -> anyhow::Result<Arc<T>> {
        let name = service.name();
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.service.name() == name) {
            anyhow::bail!("module {name:?} is already registered");
        }

        let claims = service.operations();
        let mut seen = HashSet::new();
        for code in &claims {
            if let Some(owner) = self.owners.get(code) {
                anyhow::bail!("operation {code} is already performed by {:?}", *owner);
            }
            if !seen.insert(*code) {
                anyhow::bail!("module {name:?} claims operation {code} twice");
            }
        }
        for code in claims {
            self.owners.insert(code, name);
        }

        let service = Arc::new(service);
        entries.push(Entry {
            service: Arc::clone(&service) as Arc<dyn ManagedService>,
            started: false,
        });
        tracing::debug!(module = name, "module registered");
        Ok(service)
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedService>> {
        self.entries.read().iter().map(|e| Arc::clone(&e.service)).collect()
    }

    fn mark_started(&self, name: &str, started: bool) {
        if let Some(entry) = self.entries.write().iter_mut().find(|e| e.service.name() == name) {
            entry.started = started;
        }
    }

    /// Starts every module in registration order.
    ///
    /// Every claimed operation must be in `ctx.table`. If a module fails to
    /// start, the ones already started are stopped again.
    ///
    /// # Errors
    ///
    /// The first missing operation or failing `init`.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for owner in self.owners.iter() {
            if ctx.table.get(*owner.key()).is_none() {
                anyhow::bail!(
                    "module {:?} performs operation {} which the {} table lacks",
                    owner.value(),
                    owner.key(),
                    ctx.table.module()
                );
            }
        }

        for service in self.snapshot() {
            let name = service.name();
            if let Err(e) = service.init(ctx).await {
                tracing::error!(module = name, error = %e, "module failed to start");
                if let Err(stop) = self.shutdown_all(true).await {
                    tracing::warn!(error = %stop, "rollback incomplete");
                }
                return Err(e).with_context(|| format!("failed to start module {name:?}"));
            }
            self.mark_started(name, true);
            tracing::info!(module = name, "module started");
        }
        Ok(())
    }

    /// Stops every started module in reverse order. Every module is asked
    /// to stop even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// The first failing `shutdown`.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let started: Vec<_> = self
            .entries
            .read()
            .iter()
            .rev()
            .filter(|e| e.started)
            .map(|e| Arc::clone(&e.service))
            .collect();

        let mut first_error = None;
        for service in started {
            let name = service.name();
            match service.shutdown(terminate).await {
                Ok(()) => tracing::debug!(module = name, "module stopped"),
                Err(e) => {
                    tracing::warn!(module = name, error = %e, "module failed to stop");
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("failed to stop module {name:?}")));
                    }
                }
            }
            self.mark_started(name, false);
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use remop_core::imisc::{self, Echo, Ping};
    use remop_core::RemoteOperation;

    use super::*;

    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Module {
        name: &'static str,
        ops: Vec<OperationCode>,
        fail_init: bool,
        log: Log,
    }

    impl Module {
        fn new(name: &'static str, ops: &[OperationCode], log: &Log) -> Self {
            Self {
                name,
                ops: ops.to_vec(),
                fail_init: false,
                log: Arc::clone(log),
            }
        }

        fn failing(mut self) -> Self {
            self.fail_init = true;
            self
        }
    }

    #[async_trait]
    impl ManagedService for Module {
        fn name(&self) -> &'static str {
            self.name
        }

        fn operations(&self) -> Vec<OperationCode> {
            self.ops.clone()
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("no backing store");
            }
            self.log.lock().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn ctx() -> ServiceContext {
        ServiceContext {
            config: Arc::new(ServerConfig::default()),
            table: Arc::new(imisc::table().clone()),
        }
    }

    fn log() -> Log {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[test]
    fn overlapping_claims_are_refused() {
        let registry = ServiceRegistry::new();
        let log = log();
        registry.register(Module::new("a", &[Ping::CODE], &log)).unwrap();

        let err = registry.register(Module::new("b", &[Echo::CODE, Ping::CODE], &log)).unwrap_err();
        assert!(err.to_string().contains("\"a\""));
        assert!(registry.register(Module::new("a", &[], &log)).is_err());
        assert!(registry.register(Module::new("c", &[Echo::CODE, Echo::CODE], &log)).is_err());

        // Refused modules leave no claims behind.
        let echo = registry.register(Module::new("echo", &[Echo::CODE], &log)).unwrap();
        assert_eq!(echo.operations(), vec![Echo::CODE]);
    }

    #[tokio::test]
    async fn lifecycle_runs_in_order() {
        let registry = ServiceRegistry::new();
        let log = log();
        registry.register(Module::new("first", &[Ping::CODE], &log)).unwrap();
        registry.register(Module::new("second", &[Echo::CODE], &log)).unwrap();

        registry.init_all(&ctx()).await.unwrap();
        registry.shutdown_all(false).await.unwrap();

        assert_eq!(
            log.lock().clone(),
            vec!["init:first", "init:second", "shutdown:second", "shutdown:first"]
        );
    }

    #[tokio::test]
    async fn claim_outside_table_fails_before_any_start() {
        let registry = ServiceRegistry::new();
        let log = log();
        registry.register(Module::new("ok", &[Ping::CODE], &log)).unwrap();
        registry.register(Module::new("stray", &[OperationCode(99)], &log)).unwrap();

        let err = registry.init_all(&ctx()).await.unwrap_err();
        assert!(err.to_string().contains("stray"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_start_stops_started_modules() {
        let registry = ServiceRegistry::new();
        let log = log();
        registry.register(Module::new("first", &[], &log)).unwrap();
        registry.register(Module::new("broken", &[], &log).failing()).unwrap();
        registry.register(Module::new("never", &[], &log)).unwrap();

        assert!(registry.init_all(&ctx()).await.is_err());
        assert_eq!(log.lock().clone(), vec!["init:first", "shutdown:first"]);

        // Nothing left running.
        registry.shutdown_all(false).await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }
}
