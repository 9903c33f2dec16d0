use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log rotation knobs for a task. Sizes are configured in megabytes and
/// applied to the rotators in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

fn default_max_files() -> usize {
    10
}
fn default_max_file_size_mb() -> u64 {
    10
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

impl LogConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Run by this executor, not by the registry agent.
    Script,
    Http,
    Tcp,
}

/// A health check attached to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CheckKind,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default = "default_check_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    10_000
}
fn default_check_timeout_ms() -> u64 {
    3_000
}

impl ServiceCheck {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A service the task exposes through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub port_label: Option<String>,
    #[serde(default)]
    pub checks: Vec<ServiceCheck>,
}

/// Task metadata the executor needs: name, log config and services.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub log_config: LogConfig,
    pub services: Vec<Service>,
}

/// Handle to the allocation directory layout.
///
/// Each task gets `<alloc>/<task>` as its task directory; logs for the
/// whole allocation live under `<alloc>/alloc/logs`.
#[derive(Debug, Clone)]
pub struct AllocDir {
    pub alloc_dir: PathBuf,
    pub task_dirs: HashMap<String, PathBuf>,
    log_dir: PathBuf,
}

impl AllocDir {
    pub fn new(alloc_dir: &Path, task_names: &[String]) -> Self {
        let task_dirs = task_names
            .iter()
            .map(|t| (t.clone(), alloc_dir.join(t)))
            .collect();
        Self {
            alloc_dir: alloc_dir.to_path_buf(),
            task_dirs,
            log_dir: alloc_dir.join("alloc").join("logs"),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn task_dir(&self, task: &str) -> Option<&PathBuf> {
        self.task_dirs.get(task)
    }
}

// ---------------- Task spec YAML (grouped; strict) ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub fs_isolation: bool,
    #[serde(default)]
    pub resource_limits: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyslogSection {
    #[serde(default = "default_syslog_port_lower")]
    pub port_lower_bound: u16,
    #[serde(default = "default_syslog_port_upper")]
    pub port_upper_bound: u16,
}

fn default_syslog_port_lower() -> u16 {
    10_000
}
fn default_syslog_port_upper() -> u16 {
    14_000
}

impl Default for SyslogSection {
    fn default() -> Self {
        Self {
            port_lower_bound: default_syslog_port_lower(),
            port_upper_bound: default_syslog_port_upper(),
        }
    }
}

/// On-disk description of a single task launch.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpecFile {
    pub task: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub alloc_id: Option<String>,
    pub alloc_dir: PathBuf,
    pub process: ProcessSection,
    #[serde(default)]
    pub environment: Vec<EnvironmentVar>,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub syslog: SyslogSection,
}

fn default_driver() -> String {
    "exec".to_string()
}

impl TaskSpecFile {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.task.trim().is_empty(), "task name must not be empty");
        anyhow::ensure!(
            !self.process.command.trim().is_empty(),
            "task {}: process.command must not be empty",
            self.task
        );
        anyhow::ensure!(
            self.syslog.port_lower_bound <= self.syslog.port_upper_bound,
            "task {}: syslog.port_lower_bound must be <= syslog.port_upper_bound",
            self.task
        );
        Ok(())
    }
}

pub fn load_task_spec(path: &Path) -> anyhow::Result<TaskSpecFile> {
    let raw = fs::read_to_string(path).with_context(|| format!("read task spec {}", path.display()))?;
    let spec: TaskSpecFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse task spec {}: {e}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
task: web
driver: exec
alloc_dir: /tmp/allocs/a1
process:
  command: ${TASK_DIR}/bin/server
  args: ["-p", "${PORT}"]
  user: nobody
  resource_limits: true
environment:
  - name: PORT
    value: "8080"
logs:
  max_files: 5
  max_file_size_mb: 2
services:
  - name: web
    tags: ["prod"]
    checks:
      - name: ok
        type: script
        command: /bin/true
        interval_ms: 1000
"#;

    #[test]
    fn parses_a_full_spec() {
        let spec: TaskSpecFile = serde_yaml::from_str(SPEC).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.task, "web");
        assert_eq!(spec.driver, "exec");
        assert!(spec.process.resource_limits);
        assert!(!spec.process.fs_isolation);
        assert_eq!(spec.logs.max_files, 5);
        assert_eq!(spec.logs.max_file_size_bytes(), 2 * 1024 * 1024);
        assert_eq!(spec.services[0].checks[0].kind, CheckKind::Script);
        assert_eq!(spec.services[0].checks[0].interval(), Duration::from_secs(1));
        assert_eq!(spec.services[0].checks[0].timeout(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = "task: web\nalloc_dir: /tmp\nprocess:\n  command: /bin/true\n  nope: 1\n";
        assert!(serde_yaml::from_str::<TaskSpecFile>(raw).is_err());
    }

    #[test]
    fn rejects_empty_command() {
        let raw = "task: web\nalloc_dir: /tmp\nprocess:\n  command: \"  \"\n";
        let spec: TaskSpecFile = serde_yaml::from_str(raw).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn alloc_dir_layout() {
        let ad = AllocDir::new(Path::new("/tmp/a1"), &["web".to_string()]);
        assert_eq!(ad.task_dir("web").unwrap(), &PathBuf::from("/tmp/a1/web"));
        assert_eq!(ad.log_dir(), Path::new("/tmp/a1/alloc/logs"));
        assert!(ad.task_dir("db").is_none());
    }
}
