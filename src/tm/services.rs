use crate::tm::config::{CheckKind, Service, ServiceCheck};
use crate::tm::env::TaskEnv;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How often the background loop pushes the current service set again, to
/// heal registrations the agent may have lost.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Driver whose script checks run inside the task's container.
pub const CONTAINER_DRIVER: &str = "docker";
/// Drivers whose script checks run on the host against the task directory.
pub const HOST_SCRIPT_DRIVERS: &[&str] = &["exec", "raw_exec", "java"];

/// Identifier under which a task's services are registered.
pub fn service_identifier(alloc_id: &str, task_name: &str) -> String {
    format!("{alloc_id}-{task_name}")
}

/// Client of the external registry agent. The agent itself is opaque to the
/// executor; it only needs replace-set and remove-all semantics.
pub trait RegistryClient: Send + Sync + 'static {
    /// Replace the set of services registered under `id`.
    fn sync(&self, id: &str, services: &[Service]) -> anyhow::Result<()>;
    /// Remove everything registered under `id`.
    fn deregister_all(&self, id: &str) -> anyhow::Result<()>;
}

/// Context handed to SyncServices: the agent client plus what delegated
/// checks need to run.
#[derive(Clone)]
pub struct RegistryContext {
    pub client: Arc<dyn RegistryClient>,
    /// Container the task runs in, when the driver is the container driver.
    pub container_id: Option<String>,
}

/// A script check owned by this executor instead of the registry agent.
///
/// Closed set keyed by driver: anything else is the agent's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegatedCheck {
    /// Executed inside the task's container.
    Container {
        id: String,
        container_id: String,
        command: String,
        args: Vec<String>,
        interval: Duration,
        timeout: Duration,
    },
    /// Executed on the host against the task directory, entering the chroot
    /// when the task is filesystem-isolated.
    Host {
        id: String,
        command: String,
        args: Vec<String>,
        interval: Duration,
        timeout: Duration,
        task_dir: PathBuf,
        fs_isolation: bool,
    },
}

/// Build the executor-owned variant of a script check.
///
/// Fails for any driver/check combination the executor does not own.
pub fn create_check(
    driver: &str,
    check: &ServiceCheck,
    check_id: &str,
    container_id: Option<&str>,
    task_dir: &Path,
    fs_isolation: bool,
) -> anyhow::Result<DelegatedCheck> {
    if check.kind != CheckKind::Script {
        anyhow::bail!("check {:?} is not owned by the executor", check.name);
    }
    if driver == CONTAINER_DRIVER {
        let container_id = container_id
            .ok_or_else(|| anyhow::anyhow!("script check {:?} needs a container id", check.name))?;
        return Ok(DelegatedCheck::Container {
            id: check_id.to_string(),
            container_id: container_id.to_string(),
            command: check.command.clone(),
            args: check.args.clone(),
            interval: check.interval(),
            timeout: check.timeout(),
        });
    }
    if HOST_SCRIPT_DRIVERS.contains(&driver) {
        return Ok(DelegatedCheck::Host {
            id: check_id.to_string(),
            command: check.command.clone(),
            args: check.args.clone(),
            interval: check.interval(),
            timeout: check.timeout(),
            task_dir: task_dir.to_path_buf(),
            fs_isolation,
        });
    }
    anyhow::bail!("couldn't create check {:?} for driver {driver:?}", check.name)
}

/// Resolve `${VAR}` placeholders in the dynamic service and check fields.
pub fn interpolate_services(task_env: &TaskEnv, services: &mut [Service]) {
    for service in services.iter_mut() {
        for check in service.checks.iter_mut() {
            if check.kind != CheckKind::Script {
                continue;
            }
            check.name = task_env.replace(&check.name);
            check.command = task_env.replace(&check.command);
            check.args = task_env.replace_all(&check.args);
            check.path = task_env.replace(&check.path);
            check.protocol = task_env.replace(&check.protocol);
        }
        service.name = task_env.replace(&service.name);
        service.tags = task_env.replace_all(&service.tags);
    }
}

/// Bridge between the task's lifecycle and the external registry agent.
///
/// Created lazily on the first SyncServices call; its background loop runs
/// until shutdown, which always happens by the time Exit returns.
pub struct Syncer {
    client: Arc<dyn RegistryClient>,
    service_id: String,
    services: Mutex<Vec<Service>>,
    delegated: Mutex<Vec<DelegatedCheck>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl Syncer {
    pub fn new(client: Arc<dyn RegistryClient>, service_id: String) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            service_id,
            services: Mutex::new(Vec::new()),
            delegated: Mutex::new(Vec::new()),
            shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Record the checks this executor runs itself.
    pub fn set_delegated_checks(&self, checks: Vec<DelegatedCheck>) {
        *self.delegated.lock().unwrap_or_else(|p| p.into_inner()) = checks;
    }

    pub fn delegated_checks(&self) -> Vec<DelegatedCheck> {
        self.delegated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Push `services` to the agent and remember them for the re-sync loop.
    pub fn sync_services(&self, services: Vec<Service>) -> anyhow::Result<()> {
        self.client.sync(&self.service_id, &services)?;
        *self.services.lock().unwrap_or_else(|p| p.into_inner()) = services;
        Ok(())
    }

    /// Start the background re-sync loop. Subsequent calls are no-ops.
    pub fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let this = self;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SYNC_INTERVAL);
            // consume the immediate first tick; the caller already synced
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let services = this
                            .services
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .clone();
                        if let Err(e) = this.client.sync(&this.service_id, &services) {
                            warn!("periodic service sync for {} failed: {e}", this.service_id);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("service syncer for {} shutting down", this.service_id);
                        return;
                    }
                }
            }
        });
    }

    /// Stop the loop and remove everything registered under the task.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.client.deregister_all(&self.service_id)
    }
}

/// Registry client that only logs; used when no agent is configured.
pub struct NoopRegistry;

impl RegistryClient for NoopRegistry {
    fn sync(&self, id: &str, services: &[Service]) -> anyhow::Result<()> {
        debug!("registry sync id={id} services={}", services.len());
        Ok(())
    }

    fn deregister_all(&self, id: &str) -> anyhow::Result<()> {
        debug!("registry deregister id={id}");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory registry agent for tests.
    #[derive(Default)]
    pub struct MemoryRegistry {
        entries: Mutex<HashMap<String, Vec<Service>>>,
    }

    impl MemoryRegistry {
        pub fn services_for(&self, id: &str) -> Vec<Service> {
            self.entries
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn has_entries(&self, id: &str) -> bool {
            !self.services_for(id).is_empty()
        }
    }

    impl RegistryClient for MemoryRegistry {
        fn sync(&self, id: &str, services: &[Service]) -> anyhow::Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(id.to_string(), services.to_vec());
            Ok(())
        }

        fn deregister_all(&self, id: &str) -> anyhow::Result<()> {
            self.entries.lock().unwrap().remove(id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryRegistry;
    use super::*;

    fn script_check(name: &str) -> ServiceCheck {
        ServiceCheck {
            name: name.to_string(),
            kind: CheckKind::Script,
            command: "/bin/true".to_string(),
            args: vec![],
            path: String::new(),
            protocol: String::new(),
            interval_ms: 1000,
            timeout_ms: 500,
        }
    }

    fn service(name: &str, checks: Vec<ServiceCheck>) -> Service {
        Service {
            name: name.to_string(),
            tags: vec![],
            port_label: None,
            checks,
        }
    }

    #[test]
    fn identifier_joins_alloc_and_task() {
        assert_eq!(service_identifier("a1b2", "web"), "a1b2-web");
    }

    #[test]
    fn container_driver_gets_a_container_check() {
        let check = script_check("ok");
        let created = create_check("docker", &check, "c1", Some("abc123"), Path::new("/t"), false).unwrap();
        match created {
            DelegatedCheck::Container { container_id, .. } => assert_eq!(container_id, "abc123"),
            other => panic!("expected container check, got {other:?}"),
        }
    }

    #[test]
    fn container_driver_without_container_id_fails() {
        let check = script_check("ok");
        assert!(create_check("docker", &check, "c1", None, Path::new("/t"), false).is_err());
    }

    #[test]
    fn host_drivers_get_a_host_check_honoring_isolation() {
        let check = script_check("ok");
        for driver in ["exec", "raw_exec", "java"] {
            let created =
                create_check(driver, &check, "c1", None, Path::new("/srv/task"), true).unwrap();
            match created {
                DelegatedCheck::Host {
                    task_dir,
                    fs_isolation,
                    interval,
                    ..
                } => {
                    assert_eq!(task_dir, PathBuf::from("/srv/task"));
                    assert!(fs_isolation);
                    assert_eq!(interval, Duration::from_secs(1));
                }
                other => panic!("expected host check, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_driver_fails_at_check_creation() {
        let check = script_check("ok");
        let err = create_check("qemu", &check, "c1", None, Path::new("/t"), false).unwrap_err();
        assert!(err.to_string().contains("couldn't create check"));
    }

    #[test]
    fn non_script_checks_are_not_executor_owned() {
        let mut check = script_check("ok");
        check.kind = CheckKind::Http;
        assert!(create_check("exec", &check, "c1", None, Path::new("/t"), false).is_err());
    }

    #[test]
    fn interpolation_resolves_dynamic_fields() {
        let mut env = TaskEnv::default();
        env.set("NAME", "web");
        env.set("CMD", "/bin/check");
        let mut check = script_check("${NAME}-check");
        check.command = "${CMD}".to_string();
        check.args = vec!["--tag".to_string(), "${NAME}".to_string()];
        let mut services = vec![service("${NAME}", vec![check])];
        services[0].tags = vec!["v-${NAME}".to_string()];

        interpolate_services(&env, &mut services);
        assert_eq!(services[0].name, "web");
        assert_eq!(services[0].tags, vec!["v-web".to_string()]);
        assert_eq!(services[0].checks[0].name, "web-check");
        assert_eq!(services[0].checks[0].command, "/bin/check");
        assert_eq!(services[0].checks[0].args[1], "web");
    }

    #[test]
    fn sync_then_shutdown_leaves_no_entries() {
        let registry = Arc::new(MemoryRegistry::default());
        let syncer = Syncer::new(registry.clone(), service_identifier("a1", "web"));

        syncer
            .sync_services(vec![service("web", vec![script_check("ok")])])
            .unwrap();
        assert!(registry.has_entries("a1-web"));
        assert_eq!(registry.services_for("a1-web")[0].name, "web");

        syncer.shutdown().unwrap();
        assert!(!registry.has_entries("a1-web"));
    }
}
