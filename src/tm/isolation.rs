use crate::tm::cgroup;
use crate::tm::error::MultiError;
use anyhow::Context as _;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Base of the cgroup-v2 unified hierarchy.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";
/// Parent cgroup holding one leaf per supervised task.
const CGROUP_PARENT: &str = "taskmaster";

/// Controllers we ask the parent to delegate to task leaves. Best-effort:
/// a kernel without one of them still isolates with the rest.
const WANTED_CONTROLLERS: &[&str] = &["cpu", "memory", "pids"];

/// How long cgroup destruction waits for the group to drain after the kill.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// The task's cgroup leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupSpec {
    pub name: String,
    pub path: PathBuf,
}

/// OS isolation resources owned by one launch.
///
/// When resource limits were requested, both the descriptor and the
/// controller map are populated before the child is started.
#[derive(Debug, Clone, Default)]
pub struct IsolationConfig {
    pub cgroup: Option<CgroupSpec>,
    /// Controller name to absolute cgroup path. On the unified hierarchy
    /// every controller maps to the same leaf.
    pub cgroup_paths: HashMap<String, PathBuf>,
}

/// Acquire the requested isolation resources.
///
/// Either both toggles succeed or whatever was acquired is released before
/// the error is surfaced.
pub fn configure(
    task_dir: &Path,
    fs_isolation: bool,
    resource_limits: bool,
    alloc_id: &str,
    task_name: &str,
) -> anyhow::Result<IsolationConfig> {
    if fs_isolation {
        mount_special_dirs(task_dir).context("configuring chroot mounts")?;
    }
    if !resource_limits {
        return Ok(IsolationConfig::default());
    }
    match create_cgroup(alloc_id, task_name) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            if fs_isolation {
                if let Err(merr) = unmount_special_dirs(task_dir) {
                    warn!("releasing chroot mounts after cgroup failure: {merr}");
                }
            }
            Err(e).context("configuring cgroup")
        }
    }
}

/// Bind the special directories a chrooted child needs under the task dir.
///
/// A fresh procfs at `<taskDir>/proc` and the host's `/dev` at
/// `<taskDir>/dev`. Partial failure undoes the part already mounted.
pub fn mount_special_dirs(task_dir: &Path) -> anyhow::Result<()> {
    let proc_dir = task_dir.join("proc");
    cgroup::create_dir(&proc_dir)?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("mount proc at {}", proc_dir.display()))?;

    let dev_dir = task_dir.join("dev");
    if let Err(e) = cgroup::create_dir(&dev_dir).and_then(|()| {
        mount(
            Some("/dev"),
            &dev_dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| format!("bind /dev at {}", dev_dir.display()))
    }) {
        if let Err(ue) = umount2(&proc_dir, MntFlags::MNT_DETACH) {
            warn!("undoing proc mount at {}: {ue}", proc_dir.display());
        }
        return Err(e);
    }
    Ok(())
}

/// Undo [`mount_special_dirs`]. Both unmounts are attempted; a target that
/// is not mounted (or already gone) counts as done.
pub fn unmount_special_dirs(task_dir: &Path) -> Result<(), MultiError> {
    let mut merr = MultiError::new();
    for sub in ["proc", "dev"] {
        let target = task_dir.join(sub);
        match umount2(&target, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            // EINVAL: not a mount point; ENOENT: directory is gone
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => merr.push(anyhow::anyhow!("unmount {} failed: {e}", target.display())),
        }
    }
    merr.into_result()
}

/// Create the task's cgroup leaf and record the controller map.
///
/// The supervisor is *not* attached here; [`enter`] does that, and it must
/// happen before the child is started.
pub fn create_cgroup(alloc_id: &str, task_name: &str) -> anyhow::Result<IsolationConfig> {
    let parent = Path::new(CGROUP_ROOT).join(CGROUP_PARENT);
    cgroup::create_dir(&parent)?;
    enable_subtree_controllers(&parent);

    let name = format!("{}-{}-{}", alloc_id, task_name, Uuid::new_v4().simple());
    let path = parent.join(&name);
    cgroup::create_dir(&path)?;

    let mut cgroup_paths = HashMap::new();
    for ctrl in cgroup::controllers(&path).unwrap_or_default() {
        cgroup_paths.insert(ctrl, path.clone());
    }
    // The unified leaf itself always counts, even with no delegated controllers.
    cgroup_paths.insert("unified".to_string(), path.clone());

    Ok(IsolationConfig {
        cgroup: Some(CgroupSpec { name, path }),
        cgroup_paths,
    })
}

/// Delegate the wanted controllers to children of `parent`. Best-effort.
fn enable_subtree_controllers(parent: &Path) {
    let ctl = parent.join("cgroup.subtree_control");
    for ctrl in WANTED_CONTROLLERS {
        if let Err(e) = cgroup::write_control(&ctl, &format!("+{ctrl}\n")) {
            debug!("enable controller {ctrl} under {}: {e}", parent.display());
        }
    }
}

/// Put `pid` into the task cgroup.
///
/// Called with the supervisor's own pid before the child is spawned, so the
/// child inherits membership at fork time and cannot escape by forking
/// while the parent exits.
pub fn enter(cfg: &IsolationConfig, pid: u32) -> anyhow::Result<()> {
    let spec = cfg
        .cgroup
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no cgroup was configured"))?;
    cgroup::attach_pid(&spec.path, pid)
}

/// Destroy the task cgroup, killing everything still inside it.
///
/// `executor_pid` (the supervisor itself, which entered before launch) is
/// moved back to the root cgroup first so it survives the kill and the leaf
/// can be removed. Every step is attempted; errors are collected.
pub fn destroy_cgroup(cfg: &IsolationConfig, executor_pid: u32) -> Result<(), MultiError> {
    let mut merr = MultiError::new();
    let Some(spec) = cfg.cgroup.as_ref() else {
        return merr.into_result();
    };
    if !spec.path.exists() {
        // Already destroyed; nothing new to release.
        return merr.into_result();
    }

    match cgroup::attach_pid(Path::new(CGROUP_ROOT), executor_pid) {
        Ok(()) => merr.record(cgroup::kill_all_pids(&spec.path)),
        Err(e) => {
            merr.push(e.context("move supervisor out of the task cgroup"));
            // cgroup.kill would take the supervisor down with the group;
            // fall back to signalling everyone else individually.
            match cgroup::list_pids(&spec.path) {
                Ok(pids) => {
                    for pid in pids {
                        if pid == executor_pid {
                            continue;
                        }
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                }
                Err(e) => merr.push(e),
            }
        }
    }

    merr.record(drain(&spec.path));
    merr.record(cgroup::remove_dir(&spec.path));
    merr.into_result()
}

/// Wait for the cgroup to empty out after the kill so rmdir can succeed.
fn drain(path: &Path) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let pids = cgroup::list_pids(path)?;
        if pids.is_empty() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("cgroup {} still has pids after kill: {pids:?}", path.display());
        }
        thread::sleep(DRAIN_POLL);
    }
}
