use clap::Parser;

use wandelscript::cli::{run_cli, Cli};
use wandelscript::logging;

#[tokio::main]
async fn main() {
    if dotenvy::dotenv().is_err() {
        // No .env file in the working directory; NOVA_API etc. still resolve from the real environment.
    }
    logging::init();

    let cli = Cli::parse();
    let exit_code = run_cli(cli).await;
    std::process::exit(exit_code);
}
