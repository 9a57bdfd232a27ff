use chrono::Local;

/// Installs the process logger: `HH:MM:SS [LEVEL] [target] - message`.
///
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
