use clap::Parser;

use mdflow::cli::{Cli, init_logging};

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let code = cli.run().await;
    std::process::exit(code);
}
