use anyhow::Context as _;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Interval at which the process table is rescanned for descendants the
/// supervised task has forked.
pub const PID_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// One row of the system process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: u32,
}

/// Snapshot `/proc` into (pid, ppid) rows.
///
/// Processes that vanish mid-scan are skipped; the next scan sees the truth.
pub fn process_table() -> anyhow::Result<Vec<ProcessRow>> {
    process_table_at(Path::new("/proc"))
}

fn process_table_at(proc_root: &Path) -> anyhow::Result<Vec<ProcessRow>> {
    let mut rows = Vec::new();
    let rd = fs::read_dir(proc_root).with_context(|| format!("read_dir {}", proc_root.display()))?;
    for ent in rd {
        let ent = match ent {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = ent.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Some(ppid) = read_ppid(proc_root, pid) {
            rows.push(ProcessRow { pid, ppid });
        }
    }
    Ok(rows)
}

/// Parent pid from `/proc/<pid>/stat`.
///
/// The comm field may contain spaces and parentheses, so parsing starts
/// after the last `)`.
fn read_ppid(proc_root: &Path, pid: u32) -> Option<u32> {
    let stat = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let mut fields = after.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Transitive descendant set of `root` in `table`, `root` included.
///
/// Rows whose parent is not (yet) in the family stay in a buffer and are
/// retried each pass; the sweep stops once a full pass adds nothing. A
/// descendant that was reparented to init has no path back to `root` and
/// falls out of the set, which is intended: once a process escapes the
/// supervisor's tree it is also outside the supervisor's lifecycle.
pub fn family_of(root: u32, table: &[ProcessRow]) -> HashSet<u32> {
    let mut family: HashSet<u32> = HashSet::new();
    family.insert(root);

    let mut remaining: Vec<ProcessRow> = table.to_vec();
    loop {
        let mut found_new = false;
        let mut buffer = Vec::with_capacity(remaining.len());
        for row in remaining {
            if family.contains(&row.ppid) {
                family.insert(row.pid);
                found_new = true;
            } else {
                buffer.push(row);
            }
        }
        remaining = buffer;
        if !found_new {
            break;
        }
    }
    family
}
