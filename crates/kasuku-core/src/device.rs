//! Best-effort device memory detection
//!
//! Feeds catalog filtering defaults and the memory hints attached to
//! out-of-memory classifications. Returns `None` when the platform gives
//! no answer; callers must treat the value as advisory.

use tracing::debug;

/// Total device memory in GB, when detectable.
pub fn detect_memory_gb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        return detect_memory_gb_linux();
    }

    #[cfg(target_os = "macos")]
    {
        return detect_memory_gb_macos();
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn detect_memory_gb_linux() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        // "MemTotal:    16315424 kB"
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            let gb = kb / 1024.0 / 1024.0;
            debug!("Detected {:.1}GB total memory", gb);
            return Some(gb);
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn detect_memory_gb_macos() -> Option<f64> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let bytes: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    let gb = bytes / 1024.0 / 1024.0 / 1024.0;
    debug!("Detected {:.1}GB total memory", gb);
    Some(gb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_does_not_panic() {
        // Platform dependent; only the shape is asserted.
        if let Some(gb) = detect_memory_gb() {
            assert!(gb > 0.0);
        }
    }
}
