use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = taskmaster::tm::cli::Args::parse();
    taskmaster::tm::cli::init_logging(&args);
    taskmaster::tm::cli::run(args).await
}
