//! Publishing a provisioned endpoint to the surrounding environment.
//!
//! Exports are best effort. The controller calls [`EnvExporter::export`]
//! synchronously after provisioning and only logs a failure.

use std::process::Command;

use log::info;

use crate::error::{Error, Result};

pub const SECONDARY_ENDPOINT_VAR: &str = "SECONDARY_STREAM_ENDPOINT";

pub trait EnvExporter: Send + Sync {
    fn export(&self, key: &str, value: &str) -> Result<()>;
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExporter;

impl EnvExporter for NoopExporter {
    fn export(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Sets the variable in the current process, so child processes spawned
/// afterwards inherit it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvExporter;

impl EnvExporter for ProcessEnvExporter {
    fn export(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        std::env::set_var(key, value);
        info!("exported {key}={value} to process environment");
        Ok(())
    }
}

/// Persists the variable for the user's future sessions: `setx` on Windows,
/// a login-shell `export` elsewhere (which only reaches that shell's rc
/// hooks).
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExporter;

impl EnvExporter for ShellExporter {
    fn export(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        let status = if cfg!(windows) {
            Command::new("cmd").args(["/c", "setx", key, value]).status()?
        } else {
            // Passed as positional arguments so the value is never parsed by
            // the shell.
            Command::new("bash")
                .args(["-lc", "export \"$1\"=\"$2\"", "export", key, value])
                .status()?
        };
        if !status.success() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("export of {key} exited with {status}"),
            )));
        }
        info!("exported {key}={value} via shell");
        Ok(())
    }
}

fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(Error::Config(format!("invalid environment key {key:?}")));
    }
    if value.contains('\0') {
        return Err(Error::Config(format!("environment value for {key} contains NUL")));
    }
    Ok(())
}
