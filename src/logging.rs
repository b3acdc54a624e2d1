use anyhow::{Context, Result};
use log::{LevelFilter, Record};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Sends all log output to `path` as `<timestamp> - <LEVEL> - <message>` lines.
///
/// INFO is the default level; `RUST_LOG` still takes precedence when set.
pub fn init(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .write_style(env_logger::WriteStyle::Never)
        .format(|buf, record| {
            let line = format_line(buf.timestamp_millis(), record);
            writeln!(buf, "{}", line)
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init()
        .context("logger already initialised")?;

    Ok(())
}

fn format_line(timestamp: impl Display, record: &Record) -> String {
    format!("{} - {} - {}", timestamp, record.level(), record.args())
}
