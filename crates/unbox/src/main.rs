//! Unbox.
//!
//! Unbox lists and extracts single files from the archives of the IF Archive, without
//! downloading a whole archive for every request. Archives are fetched on demand and kept in a
//! local cache.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
