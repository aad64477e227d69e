//! A terminal photo browser on top of the astronomy fetch pipeline.

mod browse;
mod catalog;
mod cli;
mod grid;
mod output;

use astronomy_service::logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
