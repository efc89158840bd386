//! pyro-cli/src/main.rs
//!
//! Entry point for the `pyro` binary. Sets up the environment (logging,
//! error reports) then hands off all logic to `pyro_cli::run()`.
//!
//! - `lib.rs` stays unit-testable (`cargo test -p pyro-cli`)
//! - `main.rs` stays minimal — global setup only

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: could not install color-eyre: {e}");
    }

    env_logger::init();

    if let Err(err) = pyro_cli::run() {
        eprintln!("error: {err}");

        if std::env::var("RUST_BACKTRACE").as_deref() == Ok("1") {
            eprintln!("\n{:?}", err);
        }

        std::process::exit(1);
    }
}
