use anyhow::Context as _;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Low-level cgroup-v2 file protocol helpers for the task leaf owned by the
/// executor. Policy (naming, enter/destroy ordering) lives in `isolation`.

/// Write a payload into a cgroup control file.
///
/// The kernel rejects bad payloads with errno instead of truncating, so the
/// raw io error stays in the chain along with what we tried to write.
pub(crate) fn write_control(path: &Path, payload: &str) -> anyhow::Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open control file {}", path.display()))?;
    f.write_all(payload.as_bytes())
        .with_context(|| format!("write {:?} into {}", payload.trim_end(), path.display()))
}

pub(crate) fn create_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

/// Controllers enabled for a cgroup, from `cgroup.controllers`.
pub(crate) fn controllers(cgroup_dir: &Path) -> anyhow::Result<Vec<String>> {
    let path = cgroup_dir.join("cgroup.controllers");
    let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(s.split_whitespace().map(|c| c.to_string()).collect())
}

/// Pids listed in this cgroup's own `cgroup.procs` (not recursive).
///
/// A missing cgroup reads as empty.
pub(crate) fn list_pids_self_only(cgroup_dir: &Path) -> anyhow::Result<Vec<u32>> {
    let procs = cgroup_dir.join("cgroup.procs");
    let s = match fs::read_to_string(&procs) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("read {}", procs.display())),
    };
    let mut out = Vec::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid: u32 = line
            .parse()
            .with_context(|| format!("parse pid {line:?} from {}", procs.display()))?;
        out.push(pid);
    }
    Ok(out)
}

/// Union of `cgroup.procs` over the cgroup and every descendant cgroup.
///
/// The child is free to create sub-cgroups under its leaf; destroy has to
/// see those pids too.
pub(crate) fn list_pids(cgroup_dir: &Path) -> anyhow::Result<Vec<u32>> {
    if !cgroup_dir.exists() {
        return Ok(vec![]);
    }
    let mut stack: Vec<PathBuf> = vec![cgroup_dir.to_path_buf()];
    let mut pids: Vec<u32> = Vec::new();
    while let Some(dir) = stack.pop() {
        pids.extend(list_pids_self_only(&dir)?);
        let rd = match fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("read_dir {}", dir.display())),
        };
        for ent in rd {
            let ent = ent.with_context(|| format!("read_dir entry under {}", dir.display()))?;
            let ft = ent
                .file_type()
                .with_context(|| format!("file_type {}", ent.path().display()))?;
            if ft.is_dir() && !ft.is_symlink() {
                stack.push(ent.path());
            }
        }
    }
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

/// Attach a pid to the cgroup by writing it into `cgroup.procs`.
pub(crate) fn attach_pid(cgroup_dir: &Path, pid: u32) -> anyhow::Result<()> {
    write_control(&cgroup_dir.join("cgroup.procs"), &format!("{pid}\n"))
        .with_context(|| format!("attach pid {pid} to {}", cgroup_dir.display()))
}

/// Kill every process in the cgroup (recursively) via `cgroup.kill`.
///
/// A missing cgroup means there is nothing left to kill.
pub(crate) fn kill_all_pids(cgroup_dir: &Path) -> anyhow::Result<()> {
    let killf = cgroup_dir.join("cgroup.kill");
    if !killf.exists() {
        return Ok(());
    }
    // Kernel expects "1"; a trailing newline is tolerated.
    write_control(&killf, "1\n").with_context(|| format!("kill all via {}", killf.display()))
}

/// Remove the cgroup directory itself; gone already is fine.
pub(crate) fn remove_dir(cgroup_dir: &Path) -> anyhow::Result<()> {
    match fs::remove_dir(cgroup_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove cgroup {}", cgroup_dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn list_pids_tolerates_missing_cgroup() {
        let dir = tempdir().unwrap();
        let gone = dir.path().join("no-such-cgroup");
        assert!(list_pids_self_only(&gone).unwrap().is_empty());
        assert!(list_pids(&gone).unwrap().is_empty());
    }

    #[test]
    fn list_pids_unions_descendant_groups() {
        let dir = tempdir().unwrap();
        let leaf = dir.path().join("task");
        let nested = leaf.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(leaf.join("cgroup.procs"), "10\n11\n").unwrap();
        fs::write(nested.join("cgroup.procs"), "12\n10\n").unwrap();

        assert_eq!(list_pids_self_only(&leaf).unwrap(), vec![10, 11]);
        assert_eq!(list_pids(&leaf).unwrap(), vec![10, 11, 12]);
    }

    #[test]
    fn kill_all_is_a_noop_without_a_cgroup() {
        let dir = tempdir().unwrap();
        assert!(kill_all_pids(&dir.path().join("gone")).is_ok());
    }

    #[test]
    fn remove_dir_tolerates_absent_dir() {
        let dir = tempdir().unwrap();
        assert!(remove_dir(&dir.path().join("gone")).is_ok());
    }
}
