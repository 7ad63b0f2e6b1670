mod cli;
mod core;
mod logging;

use crate::core::error::Error;
use crate::core::terminal;

#[tokio::main]
async fn main() {
    logging::init();

    match cli::run_main().await {
        Ok(()) => {}
        Err(Error::Interrupted) => {
            terminal::print_warn("Run cancelled.");
            std::process::exit(130);
        }
        Err(e) => {
            terminal::print_error(&format!("{}", e));
            std::process::exit(1);
        }
    }
}
