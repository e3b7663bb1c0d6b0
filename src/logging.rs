use std::io::Write;

use log::LevelFilter;

/// Initializes the logger with the CLI-selected verbosity. Messages go to
/// stderr so command output stays parseable.
pub fn init(verbosity: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(verbosity)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        })
        .init();
}
