use clap::Parser;
use llama_gateway::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llama_gateway=debug,llama_runtime=debug")),
        )
        .init();

    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Models(m)) => cli::models::execute(args.global, m).await,
        Some(cli::Commands::Config(c)) => cli::config_cmd::execute(args.global, c).await,
        Some(cli::Commands::Serve(serve_args)) => {
            cli::serve::execute(args.global, serve_args).await
        }
        // Default: start HTTP server
        None => cli::serve::execute(args.global, cli::ServeArgs::default()).await,
    }
}
