//! Logger initialization
//!
//! Builds the `tracing` subscriber from the `log` configuration section:
//! level filter, console or JSON formatting, and any mix of stdout,
//! stderr, and rotated file outputs.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::ConfigError;

pub mod rolling;

pub use rolling::RollingWriter;

/// One configured log output target
enum Target {
    Stdout,
    Stderr,
    File(Arc<Mutex<RollingWriter>>),
}

/// Writer fanning each record out to every configured target
pub struct MultiWriter {
    targets: Arc<Vec<Target>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for target in self.targets.iter() {
            match target {
                Target::Stdout => io::stdout().write_all(buf)?,
                Target::Stderr => io::stderr().write_all(buf)?,
                Target::File(writer) => {
                    let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
                    guard.write_all(buf)?;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for target in self.targets.iter() {
            match target {
                Target::Stdout => io::stdout().flush()?,
                Target::Stderr => io::stderr().flush()?,
                Target::File(writer) => {
                    let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
                    guard.flush()?;
                }
            }
        }
        Ok(())
    }
}

/// `MakeWriter` handing out [`MultiWriter`]s over the shared target list
#[derive(Clone)]
pub struct MultiMakeWriter {
    targets: Arc<Vec<Target>>,
}

impl<'a> MakeWriter<'a> for MultiMakeWriter {
    type Writer = MultiWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiWriter {
            targets: Arc::clone(&self.targets),
        }
    }
}

/// Build the output fan-out from the configured target names
fn build_targets(config: &LogConfig) -> Result<MultiMakeWriter, ConfigError> {
    let mut targets = Vec::with_capacity(config.output.len());
    for output in &config.output {
        match output.as_str() {
            "stdout" => targets.push(Target::Stdout),
            "stderr" => targets.push(Target::Stderr),
            path => {
                let writer = RollingWriter::open(path, &config.rotation)?;
                targets.push(Target::File(Arc::new(Mutex::new(writer))));
            }
        }
    }
    Ok(MultiMakeWriter {
        targets: Arc::new(targets),
    })
}

/// Initialize the global subscriber from the logger configuration
///
/// Idempotent: a second call (e.g. from tests) is a no-op.
///
/// # Errors
///
/// Returns `ConfigError` when a file output cannot be opened.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    let make_writer = build_targets(config)?;
    let filter = EnvFilter::new(config.level.clone());

    let result = if config.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .try_init()
    };
    // An already-installed subscriber (tests, embedding) is not an error
    drop(result);

    if config.rotation.compress {
        warn!("log.rotation.compress is not supported and will be ignored");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationConfig;

    #[test]
    fn test_build_targets_stdout_stderr() {
        let config = LogConfig {
            output: vec!["stdout".into(), "stderr".into()],
            ..LogConfig::default()
        };
        let make_writer = build_targets(&config).unwrap();
        assert_eq!(make_writer.targets.len(), 2);
    }

    #[test]
    fn test_build_targets_file() {
        let dir = std::env::temp_dir().join(format!(
            "socks5-bridge-loginit-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");

        let config = LogConfig {
            output: vec![path.display().to_string()],
            rotation: RotationConfig::default(),
            ..LogConfig::default()
        };
        let make_writer = build_targets(&config).unwrap();

        let mut writer = make_writer.make_writer();
        writer.write_all(b"record\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "record\n");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
