use clap::Parser;
use deploy_keeper_cli::{run_cli, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        let exit_code = e.exit_code();
        let report = anyhow::Error::new(e);
        error!(error = %format!("{:#}", report), exit_code, "Command failed");
        eprintln!("Error: {:#}", report);
        std::process::exit(exit_code);
    }
}
