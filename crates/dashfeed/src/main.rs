//! Dashfeed.
//!
//! Dashfeed keeps the data behind a market dashboard warm. It polls the series of every configured
//! feed from the dashboard proxy, serves cached payloads while they are revalidated in the
//! background, and backs off when the proxy keeps failing.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod feeds;
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
