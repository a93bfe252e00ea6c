//! Logging setup for the daemon, plus the frame dump helper used on the
//! send and receive paths.

use std::fmt::Write;

use log::LevelFilter;

/// Configure stderr logging. `RUST_LOG` still wins when set, so a
/// specific module can be turned up without recompiling.
pub fn setup(verbosity: u64) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

/// Dump a frame at trace level, 16 bytes per line.
pub fn hexdump(prefix: &str, data: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }

    for (idx, chunk) in data.chunks(16).enumerate() {
        let mut line = String::with_capacity(3 * chunk.len());
        for byte in chunk {
            let _ = write!(line, "{:02x} ", byte);
        }
        log::trace!("{}: {:04x}: {}", prefix, idx * 16, line.trim_end());
    }
}
