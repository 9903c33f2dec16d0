use crate::tm::config::{self, AllocDir, Task};
use crate::tm::env::TaskEnv;
use crate::tm::executor::{ExecutorContext, LaunchRequest, TaskExecutor};
use crate::tm::logging::LogLevel;
use crate::tm::services::{NoopRegistry, RegistryContext};
use crate::tm::{build_info, logging};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "taskmaster", version, about = "supervised task executor")]
pub struct Args {
    /// Log level (error/warn/info/debug/trace)
    #[arg(long = "log-level")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Launch the task described by a spec file and supervise it to completion
    Run {
        /// Path to the task spec YAML
        #[arg(short = 's', long = "spec")]
        spec: PathBuf,
    },
    /// Print build information
    Version,
}

pub fn init_logging(args: &Args) {
    logging::init(args.log_level);
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    match args.cmd {
        Cmd::Version => {
            println!("{}", build_info::banner());
            Ok(())
        }
        Cmd::Run { spec } => run_task(&spec).await,
    }
}

async fn run_task(spec_path: &Path) -> anyhow::Result<()> {
    let spec = config::load_task_spec(spec_path)?;

    let vars: HashMap<String, String> = spec
        .environment
        .iter()
        .map(|v| (v.name.clone(), v.value.clone()))
        .collect();
    let task_env = TaskEnv::new(vars);

    let alloc_id = spec
        .alloc_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let alloc_dir = AllocDir::new(&spec.alloc_dir, std::slice::from_ref(&spec.task));
    let task = Task {
        name: spec.task.clone(),
        log_config: spec.logs.clone(),
        services: spec.services.clone(),
    };
    let has_services = !task.services.is_empty();

    let ctx = ExecutorContext {
        task_env,
        alloc_dir,
        task,
        alloc_id,
        driver: spec.driver.clone(),
        port_lower_bound: spec.syslog.port_lower_bound,
        port_upper_bound: spec.syslog.port_upper_bound,
    };
    let request = LaunchRequest {
        cmd: spec.process.command.clone(),
        args: spec.process.args.clone(),
        user: spec.process.user.clone(),
        fs_isolation: spec.process.fs_isolation,
        resource_limits: spec.process.resource_limits,
    };

    let mut executor = TaskExecutor::new();
    let initial = executor.launch(request, ctx)?;
    info!("task {} started with pid {}", spec.task, initial.pid);

    if has_services {
        executor.sync_services(RegistryContext {
            client: Arc::new(NoopRegistry),
            container_id: None,
        })?;
    }

    let state = tokio::select! {
        state = executor.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; forwarding to the task");
            executor.shutdown()?;
            executor.wait().await
        }
    };
    info!(
        "task {} exited with code {} (signal {})",
        spec.task, state.exit_code, state.signal
    );

    if let Err(e) = executor.exit() {
        anyhow::bail!("teardown finished with errors: {e}");
    }
    std::process::exit(state.exit_code);
}
