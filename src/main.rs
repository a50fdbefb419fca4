use clap::Parser;
use webterm::config::{self, Cli};
use webterm::error::TermResult;
use webterm::server;
use webterm::version;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    run_server(cli).await?;
    Ok(())
}

async fn run_server(args: Cli) -> TermResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    tracing::info!(
        version = version::LABEL,
        git_sha = version::git_sha().unwrap_or("unknown"),
        built = version::BUILD_TIME,
        "Starting webterm"
    );
    server::serve(&config).await
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
