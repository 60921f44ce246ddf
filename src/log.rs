use std::io::Write;

use env_logger::Builder;
use once_cell::sync::OnceCell;

static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Install the crate's logger. Safe to call more than once; only the first
/// call configures the builder.
pub fn init_log() {
    LOG_INIT.get_or_init(|| {
        let mut builder = Builder::from_default_env();
        builder
            .format_timestamp_secs()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}
