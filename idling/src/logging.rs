use std::{env, io::Write, thread};

use env_logger;

/// Filter directives for the idling logger, in `env_logger` syntax.
pub const ENV_LOG: &str = "ESPRESSO_IDLING_LOG";

const DEFAULT_LOG: &str = "warn";

/// Installs a logger filtered by `ESPRESSO_IDLING_LOG`.
///
/// Does nothing if a logger is already installed.
pub fn init() {
    let filter = env::var(ENV_LOG).unwrap_or_else(|_| DEFAULT_LOG.to_owned());

    let installed = env_logger::Builder::new()
        .format(|fmt, record| {
            let thread = thread::current();
            writeln!(
                fmt,
                "{} [{}] {}: {}",
                record.level(),
                thread.name().unwrap_or("<unnamed>"),
                record.target(),
                record.args()
            )
        })
        .parse(&filter)
        .try_init();

    if installed.is_err() {
        debug!("logger already initialized");
    }
}
