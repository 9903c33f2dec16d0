use crate::tm::config::{AllocDir, CheckKind, LogConfig, Task};
use crate::tm::env::TaskEnv;
use crate::tm::error::MultiError;
use crate::tm::isolation::{self, IsolationConfig};
use crate::tm::logrotate::FileRotator;
use crate::tm::pids;
use crate::tm::services::{self, DelegatedCheck, RegistryContext, Syncer};
use crate::tm::stats::{self, PidRecord, TaskResourceUsage};
use crate::tm::syslog::{SyslogServer, SyslogServerState};
use anyhow::Context as _;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Api version of the executor.
pub const EXECUTOR_VERSION: &str = "1.0.0";

/// A launch request: the user command plus its isolation toggles.
///
/// Immutable once accepted by [`TaskExecutor::launch`].
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub cmd: String,
    pub args: Vec<String>,
    /// User to run the command as.
    pub user: Option<String>,
    /// Run the command inside a chroot of the task directory.
    pub fs_isolation: bool,
    /// Enforce resource limits through a cgroup.
    pub resource_limits: bool,
}

/// Context the driver supplies for the lifetime of one launch.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub task_env: TaskEnv,
    pub alloc_dir: AllocDir,
    pub task: Task,
    pub alloc_id: String,
    /// Name of the driver that invoked the executor; decides who owns
    /// script checks.
    pub driver: String,
    pub port_lower_bound: u16,
    pub port_upper_bound: u16,
}

/// Snapshot of the supervised process: the initial one returned by launch
/// (pid set, exit code -1) or the terminal one returned by wait (pid 0).
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub pid: u32,
    pub exit_code: i32,
    pub signal: i32,
    pub isolation: IsolationConfig,
    pub time: DateTime<Local>,
}

#[derive(Clone)]
struct RotatorPair {
    stdout: Arc<FileRotator>,
    stderr: Arc<FileRotator>,
}

/// Launches a single command under the configured isolation, supervises its
/// process tree and tears everything down deterministically on exit.
pub struct TaskExecutor {
    request: Option<LaunchRequest>,
    ctx: Option<ExecutorContext>,
    task_dir: PathBuf,
    child_pid: Option<u32>,

    isolation: Mutex<IsolationConfig>,
    exit_state: Arc<Mutex<Option<ProcessState>>>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,

    pid_records: Arc<RwLock<HashMap<u32, Arc<Mutex<PidRecord>>>>>,
    rotators: Mutex<Option<RotatorPair>>,
    syncer: Mutex<Option<Arc<Syncer>>>,
    syslog: Mutex<Option<SyslogServer>>,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(false);
        Self {
            request: None,
            ctx: None,
            task_dir: PathBuf::new(),
            child_pid: None,
            isolation: Mutex::new(IsolationConfig::default()),
            exit_state: Arc::new(Mutex::new(None)),
            exit_tx,
            exit_rx,
            pid_records: Arc::new(RwLock::new(HashMap::new())),
            rotators: Mutex::new(None),
            syncer: Mutex::new(None),
            syslog: Mutex::new(None),
        }
    }

    pub fn version(&self) -> &'static str {
        EXECUTOR_VERSION
    }

    /// Launch the command and start supervising it.
    ///
    /// Returns the initial [`ProcessState`] with the child's pid and an exit
    /// code of -1. Must run inside a tokio runtime (the pid collector and
    /// the output pumps are tasks).
    pub fn launch(&mut self, request: LaunchRequest, ctx: ExecutorContext) -> anyhow::Result<ProcessState> {
        if self.child_pid.is_some() {
            anyhow::bail!("a command has already been launched");
        }
        debug!("launching command {} {}", request.cmd, request.args.join(" "));

        let task_dir = ctx
            .alloc_dir
            .task_dir(&ctx.task.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("couldn't find task directory for task {}", ctx.task.name))?;
        if !task_dir.is_dir() {
            anyhow::bail!("task directory {} does not exist", task_dir.display());
        }

        // Both isolation toggles succeed before anything else happens, or
        // whatever was acquired is released inside configure().
        let iso = isolation::configure(
            &task_dir,
            request.fs_isolation,
            request.resource_limits,
            &ctx.alloc_id,
            &ctx.task.name,
        )?;

        // From here on, any failure has to release the acquired isolation.
        match self.launch_prepared(&request, &ctx, &task_dir, &iso) {
            Ok(state) => {
                self.task_dir = task_dir;
                self.child_pid = Some(state.pid);
                *self.isolation.lock().unwrap_or_else(|p| p.into_inner()) = iso;
                self.request = Some(request);
                self.ctx = Some(ctx);
                Ok(state)
            }
            Err(e) => {
                release_isolation(&task_dir, &request, &iso);
                Err(e)
            }
        }
    }

    /// The part of the launch sequence that runs with isolation acquired.
    fn launch_prepared(
        &self,
        request: &LaunchRequest,
        ctx: &ExecutorContext,
        task_dir: &Path,
        iso: &IsolationConfig,
    ) -> anyhow::Result<ProcessState> {
        // Resolve the run-as user before forking; the ids are dropped in
        // the child.
        let creds = match request.user.as_deref() {
            Some(name) => {
                debug!("running command as {name}");
                Some(resolve_user(name)?)
            }
            None => None,
        };

        let rotators = self.configure_rotators(ctx)?;

        // Binary resolution happens after env interpolation.
        let interpolated = ctx.task_env.replace(&request.cmd);
        let abs_path = lookup_bin(task_dir, &interpolated)?;
        make_executable(&abs_path)?;

        // Under filesystem isolation the chrooted child sees the binary at
        // its task-dir-relative location.
        let exec_path = if request.fs_isolation {
            let rel = abs_path.strip_prefix(task_dir).map_err(|_| {
                anyhow::anyhow!(
                    "binary {} lies outside the task directory {}",
                    abs_path.display(),
                    task_dir.display()
                )
            })?;
            rel.to_path_buf()
        } else {
            abs_path.clone()
        };

        let mut cmd = Command::new(&exec_path);
        cmd.args(ctx.task_env.replace_all(&request.args));
        cmd.env_clear();
        cmd.envs(ctx.task_env.env_list());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            // argv[0] is the path the child was resolved to
            cmd.arg0(&exec_path);
            if !request.fs_isolation {
                cmd.current_dir(task_dir);
            }
            let chroot_dir = if request.fs_isolation {
                Some(task_dir.to_path_buf())
            } else {
                None
            };
            // Child-side setup order: detach from the controlling terminal,
            // enter the chroot, drop gid/uid, then exec. Errno is the only
            // thing the parent reliably sees from a pre_exec failure, so
            // raw os errors are passed through unwrapped.
            unsafe {
                cmd.pre_exec(move || {
                    let _ = nix::unistd::setsid();
                    if let Some(dir) = &chroot_dir {
                        nix::unistd::chroot(dir.as_path()).map_err(errno_to_io)?;
                        nix::unistd::chdir("/").map_err(errno_to_io)?;
                    }
                    if let Some((uid, gid)) = creds {
                        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).map_err(errno_to_io)?;
                        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).map_err(errno_to_io)?;
                    }
                    Ok(())
                });
            }
        }

        // The supervisor MUST be in the cgroup before the child starts,
        // otherwise a task escapes isolation by forking right away and
        // letting the parent exit.
        if request.resource_limits {
            isolation::enter(iso, std::process::id()).context("entering cgroup before launch")?;
        }

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "spawn cmd={} cwd={} argv={:?} failed: kind={:?} os_error={:?} err={}",
                exec_path.display(),
                task_dir.display(),
                request.args,
                e.kind(),
                e.raw_os_error(),
                e
            )
        })?;
        let pid = child.id();

        if let Some(out) = child.stdout.take() {
            spawn_output_pump("stdout", out, Arc::clone(&rotators.stdout));
        }
        if let Some(err) = child.stderr.take() {
            spawn_output_pump("stderr", err, Arc::clone(&rotators.stderr));
        }

        self.spawn_pid_collector();
        self.spawn_wait_watcher(child, iso.clone());

        Ok(ProcessState {
            pid,
            exit_code: -1,
            signal: 0,
            isolation: iso.clone(),
            time: Local::now(),
        })
    }

    /// Block until the child has terminated and return the terminal state.
    pub async fn wait(&self) -> ProcessState {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(state) = self
                .exit_state
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
            {
                return state;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a state; re-check and bail out via the
                // state above on the next pass.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }

    /// Ask the child to stop: interrupt on POSIX, kill on Windows.
    ///
    /// "Process already finished" is not an error.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let pid = self
            .child_pid
            .ok_or_else(|| anyhow::anyhow!("no process was launched"))?;
        interrupt_child(pid)
    }

    /// Full teardown. Every step runs; errors are collected.
    pub fn exit(&mut self) -> Result<(), MultiError> {
        let mut merr = MultiError::new();

        // Side channels first; they do not carry child output.
        if let Some(server) = self.syslog.lock().unwrap_or_else(|p| p.into_inner()).take() {
            server.shutdown();
        }
        if let Some(syncer) = self.syncer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            merr.record(syncer.shutdown().context("shutting down registry bridge"));
        }

        let request = match self.request.clone() {
            Some(r) => r,
            None => {
                // Nothing was launched; only the rotators may exist.
                self.close_rotators();
                return merr.into_result();
            }
        };

        let exited = self
            .exit_state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some();
        if !exited && !request.resource_limits {
            if let Some(pid) = self.child_pid {
                merr.record(kill_child(pid));
            }
        }
        if request.resource_limits {
            let iso = self
                .isolation
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            // Destroying the cgroup kills the whole group, descendants
            // included; the supervisor removes itself last.
            if let Err(e) = isolation::destroy_cgroup(&iso, std::process::id()) {
                merr.extend(e);
            }
        }

        // Rotators close after the kill so the final pipe flush still lands.
        self.close_rotators();

        if request.fs_isolation {
            if let Err(e) = isolation::unmount_special_dirs(&self.task_dir) {
                merr.extend(e);
            }
        }
        merr.into_result()
    }

    /// Re-apply file count and size to both rotators.
    pub fn update_log_config(&mut self, log_config: &LogConfig) -> anyhow::Result<()> {
        {
            let guard = self.rotators.lock().unwrap_or_else(|p| p.into_inner());
            let pair = guard
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("log rotator does not exist"))?;
            let bytes = log_config.max_file_size_bytes();
            pair.stdout.set_config(log_config.max_files, bytes);
            pair.stderr.set_config(log_config.max_files, bytes);
        }
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.task.log_config = log_config.clone();
        }
        Ok(())
    }

    /// Apply an updated task: log config plus a service re-sync.
    pub fn update_task(&mut self, task: Task) -> anyhow::Result<()> {
        let log_config = task.log_config.clone();
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.task = task;
        }
        if let Err(e) = self.update_log_config(&log_config) {
            // Not fatal to the child; the rotators may simply not exist yet.
            debug!("updating log config: {e}");
        }

        let syncer = self.syncer.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let (Some(syncer), Some(ctx)) = (syncer, self.ctx.as_ref()) {
            let mut services = ctx.task.services.clone();
            services::interpolate_services(&ctx.task_env, &mut services);
            syncer.sync_services(services)?;
        }
        Ok(())
    }

    /// Register the task's services with the external agent, creating the
    /// bridge on first use.
    pub fn sync_services(&self, registry: RegistryContext) -> anyhow::Result<()> {
        info!("registering services");
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no executor context; nothing to register"))?;

        let syncer = {
            let mut guard = self.syncer.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(s) => Arc::clone(s),
                None => {
                    let id = services::service_identifier(&ctx.alloc_id, &ctx.task.name);
                    let syncer = Arc::new(Syncer::new(Arc::clone(&registry.client), id));
                    let fs_isolation = self.request.as_ref().map(|r| r.fs_isolation).unwrap_or(false);
                    syncer.set_delegated_checks(self.build_delegated_checks(
                        ctx,
                        registry.container_id.as_deref(),
                        fs_isolation,
                    )?);
                    *guard = Some(Arc::clone(&syncer));
                    syncer
                }
            }
        };

        let mut services = ctx.task.services.clone();
        services::interpolate_services(&ctx.task_env, &mut services);
        syncer.sync_services(services)?;
        syncer.run();
        Ok(())
    }

    /// Shut the bridge down, removing the task's registrations.
    pub fn deregister_services(&self) -> anyhow::Result<()> {
        info!("de-registering services and shutting down the registry bridge");
        match self.syncer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(syncer) => syncer.shutdown(),
            None => Ok(()),
        }
    }

    /// Latest aggregated resource usage of the task's process tree.
    ///
    /// Never fails; with no supervised pids the totals are zero.
    pub fn stats(&self) -> TaskResourceUsage {
        // Readers take shared access and clone the snapshot.
        let records: Vec<Arc<Mutex<PidRecord>>> = self
            .pid_records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        let mut pid_stats = HashMap::new();
        for record in records {
            let mut record = record.lock().unwrap_or_else(|p| p.into_inner());
            // A pid that died mid-scan is skipped silently.
            if let Some(usage) = record.sample() {
                pid_stats.insert(record.pid.to_string(), usage);
            }
        }
        stats::aggregate(pid_stats)
    }

    /// Launch the syslog listener and return its address.
    pub fn launch_syslog_server(&mut self, ctx: ExecutorContext) -> anyhow::Result<SyslogServerState> {
        let rotators = self.configure_rotators(&ctx)?;
        let (lower, upper) = (ctx.port_lower_bound, ctx.port_upper_bound);
        if self.ctx.is_none() {
            self.ctx = Some(ctx);
        }

        let mut guard = self.syslog.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(server) = guard.as_ref() {
            return Ok(server.state());
        }
        let server = SyslogServer::launch(lower, upper, rotators.stdout)?;
        let state = server.state();
        info!("syslog server listening on {}", state.addr);
        *guard = Some(server);
        Ok(state)
    }

    /// Create both rotators on first use. Creation is serialized so
    /// concurrent reconfiguration cannot race it.
    fn configure_rotators(&self, ctx: &ExecutorContext) -> anyhow::Result<RotatorPair> {
        let mut guard = self.rotators.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(pair) = guard.as_ref() {
            return Ok(pair.clone());
        }
        let log_dir = ctx.alloc_dir.log_dir();
        let max_files = ctx.task.log_config.max_files;
        let bytes = ctx.task.log_config.max_file_size_bytes();
        let pair = RotatorPair {
            stdout: Arc::new(FileRotator::new(
                log_dir,
                &format!("{}.stdout", ctx.task.name),
                max_files,
                bytes,
            )?),
            stderr: Arc::new(FileRotator::new(
                log_dir,
                &format!("{}.stderr", ctx.task.name),
                max_files,
                bytes,
            )?),
        };
        *guard = Some(pair.clone());
        Ok(pair)
    }

    /// Limits currently applied to the rotators: (max files, max file size
    /// in bytes). `None` until the rotators exist.
    pub fn rotator_limits(&self) -> Option<(usize, u64)> {
        self.rotators
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|pair| pair.stdout.config())
    }

    fn close_rotators(&self) {
        if let Some(pair) = self.rotators.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pair.stdout.close();
            pair.stderr.close();
        }
    }

    fn build_delegated_checks(
        &self,
        ctx: &ExecutorContext,
        container_id: Option<&str>,
        fs_isolation: bool,
    ) -> anyhow::Result<Vec<DelegatedCheck>> {
        let mut checks = Vec::new();
        for service in &ctx.task.services {
            for check in &service.checks {
                if check.kind != CheckKind::Script {
                    // Owned by the registry agent, not by us.
                    continue;
                }
                let check_id = format!(
                    "{}.{}",
                    services::service_identifier(&ctx.alloc_id, &ctx.task.name),
                    check.name
                );
                checks.push(services::create_check(
                    &ctx.driver,
                    check,
                    &check_id,
                    container_id,
                    &self.task_dir,
                    fs_isolation,
                )?);
            }
        }
        Ok(checks)
    }

    /// Periodically recompute the descendant set rooted at the supervisor.
    ///
    /// The first scan runs right away; the exit channel short-circuits the
    /// timer.
    fn spawn_pid_collector(&self) {
        let records = Arc::clone(&self.pid_records);
        let mut exit_rx = self.exit_rx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(pids::PID_SCAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match pids::process_table() {
                            Ok(table) => replace_pid_snapshot(&records, &table),
                            Err(e) => debug!("error collecting pids: {e}"),
                        }
                    }
                    _ = exit_rx.changed() => return,
                }
            }
        });
    }

    /// One blocking thread per launch that owns the child handle, computes
    /// the terminal state and closes the exit channel exactly once.
    fn spawn_wait_watcher(&self, mut child: Child, iso: IsolationConfig) {
        let exit_state = Arc::clone(&self.exit_state);
        let exit_tx = self.exit_tx.clone();
        std::thread::spawn(move || {
            let state = match child.wait() {
                Ok(status) => {
                    let (exit_code, signal) = exit_code_of(&status);
                    ProcessState {
                        pid: 0,
                        exit_code,
                        signal,
                        isolation: iso,
                        time: Local::now(),
                    }
                }
                Err(e) => {
                    warn!("waiting on child failed: {e}");
                    ProcessState {
                        pid: 0,
                        exit_code: 1,
                        signal: 0,
                        isolation: iso,
                        time: Local::now(),
                    }
                }
            };
            *exit_state.lock().unwrap_or_else(|p| p.into_inner()) = Some(state);
            let _ = exit_tx.send(true);
        });
    }
}

/// Swap in the freshly computed family as the new PidSet.
///
/// Rate-estimator state survives for pids present in consecutive scans;
/// pids whose parent disappeared drop out with the snapshot.
fn replace_pid_snapshot(
    records: &Arc<RwLock<HashMap<u32, Arc<Mutex<PidRecord>>>>>,
    table: &[pids::ProcessRow],
) {
    let family = pids::family_of(std::process::id(), table);
    let mut map = records.write().unwrap_or_else(|p| p.into_inner());
    let mut next = HashMap::with_capacity(family.len());
    for pid in family {
        let record = match map.get(&pid) {
            Some(existing) => Arc::clone(existing),
            None => Arc::new(Mutex::new(PidRecord::new(pid))),
        };
        next.insert(pid, record);
    }
    *map = next;
}

/// Exit-code policy: the child's own code on a normal exit, `128 + signum`
/// on a signal death, 1 when the status is unreadable.
fn exit_code_of(status: &std::process::ExitStatus) -> (i32, i32) {
    if let Some(code) = status.code() {
        return (code, 0);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return (128 + signal, signal);
        }
    }
    (1, 0)
}

#[cfg(unix)]
fn interrupt_child(pid: u32) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) => Ok(()),
        // Process already finished.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("sending interrupt to pid {pid}: {e}")),
    }
}

#[cfg(windows)]
fn interrupt_child(pid: u32) -> anyhow::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .context("running taskkill")?;
    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("taskkill for pid {pid} exited with {status}"))
    }
}

#[cfg(unix)]
fn kill_child(pid: u32) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Process already finished.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("can't kill process with pid {pid}: {e}")),
    }
}

#[cfg(windows)]
fn kill_child(pid: u32) -> anyhow::Result<()> {
    interrupt_child(pid)
}

#[cfg(unix)]
fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Resolve a run-as user to its (uid, gid) before forking.
fn resolve_user(name: &str) -> anyhow::Result<(u32, u32)> {
    let user = users::get_user_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("failed to identify user {name:?}"))?;
    Ok((user.uid(), user.primary_group_id()))
}

/// Release isolation acquired for a launch that failed after setup.
fn release_isolation(task_dir: &Path, request: &LaunchRequest, iso: &IsolationConfig) {
    if request.resource_limits {
        if let Err(e) = isolation::destroy_cgroup(iso, std::process::id()) {
            warn!("releasing cgroup after failed launch: {e}");
        }
    }
    if request.fs_isolation {
        if let Err(e) = isolation::unmount_special_dirs(task_dir) {
            warn!("releasing chroot mounts after failed launch: {e}");
        }
    }
}

/// Find the binary, in order: `<taskDir>/local/<bin>`, `<taskDir>/<bin>`,
/// host `PATH`. The returned path is absolute (or PATH-resolved).
fn lookup_bin(task_dir: &Path, bin: &str) -> anyhow::Result<PathBuf> {
    // An absolute command is looked up inside the task dir first; that is
    // where a chroot-populated binary lives.
    let rel = bin.trim_start_matches('/');

    let local = task_dir.join("local").join(rel);
    if local.is_file() {
        return Ok(local);
    }
    let root = task_dir.join(rel);
    if root.is_file() {
        return Ok(root);
    }
    if let Some(host) = lookup_path(bin) {
        return Ok(host);
    }
    anyhow::bail!("binary {bin:?} could not be found")
}

fn lookup_path(bin: &str) -> Option<PathBuf> {
    if bin.contains('/') {
        let p = PathBuf::from(bin);
        return if p.is_file() { Some(p) } else { None };
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Give the binary execute bits for owner, group and world if it lacks any.
#[cfg(unix)]
fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let md = fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::anyhow!("binary {} does not exist", path.display())
        } else {
            anyhow::anyhow!("specified binary is invalid: {e}")
        }
    })?;
    let perm = md.permissions().mode() & 0o777;
    let required = 0o555;
    if perm & required != required {
        fs::set_permissions(path, fs::Permissions::from_mode(perm | required))
            .with_context(|| format!("making {} executable", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Pump one child output stream into its rotator on the blocking pool.
fn spawn_output_pump<R>(stream: &'static str, mut src: R, sink: Arc<FileRotator>)
where
    R: std::io::Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.write_all(&buf[..n]) {
                        debug!("writing child {stream}: {e}");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("reading child {stream}: {e}");
                    break;
                }
            }
        }
        let _ = sink.flush();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lookup_prefers_local_then_task_dir_then_path() {
        let dir = tempdir().unwrap();
        let task_dir = dir.path();
        fs::create_dir_all(task_dir.join("local")).unwrap();
        fs::write(task_dir.join("local/app"), "#!/bin/sh\n").unwrap();
        fs::write(task_dir.join("app"), "#!/bin/sh\n").unwrap();

        assert_eq!(lookup_bin(task_dir, "app").unwrap(), task_dir.join("local/app"));

        fs::remove_file(task_dir.join("local/app")).unwrap();
        assert_eq!(lookup_bin(task_dir, "app").unwrap(), task_dir.join("app"));

        fs::remove_file(task_dir.join("app")).unwrap();
        let found = lookup_bin(task_dir, "sh").unwrap();
        assert!(found.ends_with("sh"), "expected PATH hit, got {found:?}");
    }

    #[test]
    fn absolute_commands_resolve_inside_the_task_dir_first() {
        let dir = tempdir().unwrap();
        let task_dir = dir.path();
        fs::create_dir_all(task_dir.join("bin")).unwrap();
        fs::write(task_dir.join("bin/echo"), "#!/bin/sh\n").unwrap();

        assert_eq!(lookup_bin(task_dir, "/bin/echo").unwrap(), task_dir.join("bin/echo"));
    }

    #[test]
    fn missing_binary_reports_not_found() {
        let dir = tempdir().unwrap();
        let err = lookup_bin(dir.path(), "definitely-no-such-binary").unwrap_err();
        assert!(err.to_string().contains("could not be found"));
    }

    #[cfg(unix)]
    #[test]
    fn make_executable_unions_0555() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempdir().unwrap();
        let bin = dir.path().join("app");
        fs::write(&bin, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o600)).unwrap();

        make_executable(&bin).unwrap();
        let mode = fs::metadata(&bin).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn exit_code_policy_for_normal_exit() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt as _;
            let ok = std::process::ExitStatus::from_raw(0);
            assert_eq!(exit_code_of(&ok), (0, 0));
            // raw wait status: exit code lives in the high byte
            let code3 = std::process::ExitStatus::from_raw(3 << 8);
            assert_eq!(exit_code_of(&code3), (3, 0));
            // killed by SIGKILL
            let sig9 = std::process::ExitStatus::from_raw(9);
            assert_eq!(exit_code_of(&sig9), (137, 9));
        }
    }

    #[test]
    fn version_is_static() {
        let executor = TaskExecutor::new();
        assert_eq!(executor.version(), "1.0.0");
    }

    #[test]
    fn shutdown_without_launch_fails() {
        let executor = TaskExecutor::new();
        assert!(executor.shutdown().is_err());
    }

    #[test]
    fn update_log_config_without_rotators_fails() {
        let mut executor = TaskExecutor::new();
        let err = executor.update_log_config(&LogConfig::default()).unwrap_err();
        assert!(err.to_string().contains("log rotator does not exist"));
    }
}
