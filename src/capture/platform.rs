//! Platform detection for camera sources

use std::env;
use std::path::Path;

/// Platform information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInfo {
    /// macOS (Darwin)
    MacOS,

    /// Raspberry Pi (detected via the device tree)
    RaspberryPi,

    /// Generic Linux
    Linux,
}

/// Detects current platform
pub fn detect_platform() -> PlatformInfo {
    match env::consts::OS {
        "macos" => PlatformInfo::MacOS,
        "linux" if is_raspberry_pi() => PlatformInfo::RaspberryPi,
        _ => PlatformInfo::Linux,
    }
}

fn is_raspberry_pi() -> bool {
    Path::new("/proc/device-tree/model").exists()
        || Path::new("/sys/firmware/devicetree/base/model").exists()
}

/// Default device identifier for the first camera on `platform`
pub fn default_device(platform: PlatformInfo) -> String {
    match platform {
        PlatformInfo::MacOS => "0".to_string(),
        PlatformInfo::RaspberryPi | PlatformInfo::Linux => "/dev/video0".to_string(),
    }
}
