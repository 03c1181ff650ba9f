use std::{
    path::Path,
    process::{Command, Stdio},
};

pub const DEFAULT_ENGINE_BINARY: &str = "xray";

const ENGINE_CANDIDATES: [&str; 4] = [
    DEFAULT_ENGINE_BINARY,
    "/usr/local/bin/xray",
    "/usr/bin/xray",
    "/opt/xray/xray",
];

/// Returns the engine path and whether it was actually found.
pub fn find_engine_binary(configured: Option<&str>) -> (String, bool) {
    if let Some(configured) = configured.filter(|path| !path.trim().is_empty()) {
        let found = locate(configured).is_some();
        if !found {
            log::warn!("[binary] configured engine {configured} does not exist");
        }
        return (configured.to_string(), found);
    }

    for candidate in ENGINE_CANDIDATES {
        if let Some(path) = locate(candidate) {
            return (path, true);
        }
    }

    log::warn!("[binary] {DEFAULT_ENGINE_BINARY} not found in search paths");
    (DEFAULT_ENGINE_BINARY.to_string(), false)
}

fn locate(candidate: &str) -> Option<String> {
    if let Ok(output) = Command::new("which").arg(candidate).output()
        && output.status.success()
    {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            log::info!("[binary] found via which: {candidate} → {path}");
            return Some(path);
        }
    }
    if Path::new(candidate).exists() {
        log::info!("[binary] found on disk: {candidate}");
        return Some(candidate.to_string());
    }
    None
}

pub fn check_binary_works(binary: &str) -> Option<String> {
    log::debug!("[preflight] testing binary: {binary} version");

    match Command::new(binary)
        .arg("version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            match stdout.lines().chain(stderr.lines()).next() {
                Some(first_line) => log::info!("[preflight] binary OK: {first_line}"),
                None => log::warn!("[preflight] binary produced no output"),
            }
            None
        }
        Err(error) => {
            let message = format!("Cannot run '{binary}': {error}");
            log::error!("[preflight] {message}");
            Some(message)
        }
    }
}
