pub fn build_host() -> &'static str {
    option_env!("TASKMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time() -> &'static str {
    option_env!("TASKMASTER_BUILD_TIME").unwrap_or("unknown")
}

pub fn banner() -> String {
    format!(
        "taskmaster {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time()
    )
}
