use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn hostname() -> Option<String> {
    let out = Command::new("hostname").output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Honor SOURCE_DATE_EPOCH for reproducible builds.
    let build_time = match env::var("SOURCE_DATE_EPOCH") {
        Ok(sde) => format!("epoch:{sde}"),
        Err(_) => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            format!("epoch:{secs}")
        }
    };

    let build_host = env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(hostname)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=TASKMASTER_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=TASKMASTER_BUILD_HOST={build_host}");
}
