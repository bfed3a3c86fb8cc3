//! Companion relay server.
//! Run with: cargo run --bin companion-server

use std::process::ExitCode;

use companion_link::start_companion;

fn main() -> ExitCode {
    start_companion::run()
}
