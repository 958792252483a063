//! CUDA device probe used before any model work starts.

use std::fmt;
use std::process::{Command, Stdio};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub name: String,
    pub total_memory_bytes: u64,
}

impl GpuInfo {
    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / 1e9
    }
}

impl fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Using GPU: {}", self.name)?;
        write!(f, "GPU Memory: {:.2} GB", self.total_memory_gb())
    }
}

/// Device selector as seen by the CUDA runtime, or `None` when
/// `CUDA_VISIBLE_DEVICES` hides every device.
pub fn visible_device(cuda_visible_devices: Option<&str>) -> Option<String> {
    let Some(raw) = cuda_visible_devices else {
        return Some("0".to_string());
    };
    let first = raw.split(',').next().unwrap_or("").trim();
    if first.is_empty() || first == "NoDevFiles" || first.starts_with('-') {
        return None;
    }
    Some(first.to_string())
}

/// Parse one `nvidia-smi --format=csv,noheader,nounits` line of
/// `name,memory.total` (MiB).
pub fn parse_query_line(line: &str) -> Option<GpuInfo> {
    let (name, memory) = line.trim().rsplit_once(',')?;
    let name = name.trim();
    let mib: u64 = memory.trim().parse().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(GpuInfo {
        name: name.to_string(),
        total_memory_bytes: mib * MIB,
    })
}

/// First visible CUDA device, if any.
pub fn detect() -> Option<GpuInfo> {
    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    let device = visible_device(visible.as_deref())?;
    if !executable_in_path("nvidia-smi") {
        tracing::debug!("nvidia-smi not found on PATH");
        return None;
    }

    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
            "-i",
            &device,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::debug!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "nvidia-smi query failed"
        );
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(parse_query_line)
}

fn executable_in_path(command: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };

    for dir in std::env::split_paths(&path_var) {
        if dir.join(command).is_file() {
            return true;
        }
        #[cfg(windows)]
        {
            if dir.join(format!("{command}.exe")).is_file() {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_visibility_selects_device_zero() {
        assert_eq!(visible_device(None), Some("0".to_string()));
    }

    #[test]
    fn empty_or_negative_visibility_hides_gpus() {
        assert_eq!(visible_device(Some("")), None);
        assert_eq!(visible_device(Some("-1")), None);
        assert_eq!(visible_device(Some("NoDevFiles")), None);
    }

    #[test]
    fn visibility_picks_first_listed_device() {
        assert_eq!(visible_device(Some("2,3")), Some("2".to_string()));
        assert_eq!(
            visible_device(Some("GPU-8e1f0c2a, 1")),
            Some("GPU-8e1f0c2a".to_string())
        );
    }

    #[test]
    fn parse_query_line_reads_name_and_memory() {
        let info = parse_query_line("NVIDIA A100-SXM4-80GB, 81920").expect("parse");
        assert_eq!(info.name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(info.total_memory_bytes, 81920 * MIB);
        assert_eq!(
            info.to_string(),
            "Using GPU: NVIDIA A100-SXM4-80GB\nGPU Memory: 85.90 GB"
        );
    }

    #[test]
    fn parse_query_line_rejects_garbage() {
        assert!(parse_query_line("").is_none());
        assert!(parse_query_line("No devices were found").is_none());
        assert!(parse_query_line(", 1024").is_none());
        assert!(parse_query_line("Tesla T4, [N/A]").is_none());
    }
}
