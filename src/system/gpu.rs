//! GPU detection
//!
//! Best-effort discovery of a GPU usable for model acceleration.

use std::process::Command;

/// GPU information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub is_available: bool,
}

impl GpuInfo {
    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            vram_total_mb: 0,
            is_available: false,
        }
    }
}

/// Acceleration backend compiled into this binary, if any
pub fn compiled_backend() -> Option<&'static str> {
    if cfg!(feature = "cuda") {
        Some("CUDA")
    } else if cfg!(feature = "metal") {
        Some("Metal")
    } else if cfg!(feature = "vulkan") {
        Some("Vulkan")
    } else {
        None
    }
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    if let Some(info) = run_tool(
        "nvidia-smi",
        &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
    )
    .and_then(|out| parse_nvidia_smi(&out))
    {
        return info;
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(info) = run_tool("system_profiler", &["SPDisplaysDataType"])
            .and_then(|out| parse_system_profiler(&out))
        {
            return info;
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(info) = run_tool(
            "wmic",
            &["path", "Win32_VideoController", "get", "Name,AdapterRAM", "/Format:List"],
        )
        .and_then(|out| parse_wmic(&out))
        {
            return info;
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(info) = detect_drm_render_node() {
            return info;
        }
    }

    GpuInfo::not_detected()
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`
fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_mb: parts[1].parse::<u64>().unwrap_or(0),
        is_available: true,
    })
}

/// Parse `system_profiler SPDisplaysDataType`
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_system_profiler(stdout: &str) -> Option<GpuInfo> {
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        // "Chipset Model: Apple M2 Pro"
        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 4096 MB"
        if trimmed.starts_with("VRAM") {
            let after_colon = trimmed.split(':').nth(1).unwrap_or("").trim();
            let parts: Vec<&str> = after_colon.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(val) = parts[0].parse::<u64>() {
                    vram_mb = Some(match parts[1].to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    let name = gpu_name?;
    Some(GpuInfo {
        name: format!("{} (Metal)", name),
        vram_total_mb: vram_mb.unwrap_or(0),
        is_available: true,
    })
}

/// Parse `wmic path Win32_VideoController get Name,AdapterRAM /Format:List`
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_wmic(stdout: &str) -> Option<GpuInfo> {
    let mut name: Option<String> = None;
    let mut adapter_ram_bytes: Option<u64> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Name=") {
            if !value.trim().is_empty() {
                name = Some(value.trim().to_string());
            }
        } else if let Some(value) = line.strip_prefix("AdapterRAM=") {
            adapter_ram_bytes = value.trim().parse::<u64>().ok();
        }
    }

    Some(GpuInfo {
        name: name?,
        vram_total_mb: adapter_ram_bytes.unwrap_or(0) / 1024 / 1024,
        is_available: true,
    })
}

/// A DRM render node means some GPU driver is loaded (Vulkan-capable in practice)
#[cfg(target_os = "linux")]
fn detect_drm_render_node() -> Option<GpuInfo> {
    let entries = std::fs::read_dir("/dev/dri").ok()?;
    let node = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|name| name.starts_with("renderD"))?;

    Some(GpuInfo {
        name: format!("DRM render node {}", node),
        vram_total_mb: 0,
        is_available: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let info = parse_nvidia_smi("NVIDIA GeForce RTX 3070, 8192\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 3070");
        assert_eq!(info.vram_total_mb, 8192);
        assert!(info.is_available);

        assert!(parse_nvidia_smi("\n\n").is_none());
    }

    #[test]
    fn test_parse_system_profiler() {
        let out = "Graphics/Displays:\n\n    Apple M2 Pro:\n\n      Chipset Model: Apple M2 Pro\n      VRAM (Total): 16 GB\n";
        let info = parse_system_profiler(out).unwrap();
        assert_eq!(info.name, "Apple M2 Pro (Metal)");
        assert_eq!(info.vram_total_mb, 16 * 1024);

        assert!(parse_system_profiler("nothing here").is_none());
    }

    #[test]
    fn test_parse_wmic() {
        let out = "\r\nAdapterRAM=4293918720\r\nName=NVIDIA GeForce GTX 1650\r\n";
        let info = parse_wmic(out).unwrap();
        assert_eq!(info.name, "NVIDIA GeForce GTX 1650");
        assert_eq!(info.vram_total_mb, 4095);
    }
}
