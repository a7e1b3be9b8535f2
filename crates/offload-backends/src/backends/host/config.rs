//! Description of the emulated platforms and devices.

use crate::backend::{DeviceClass, DeviceLimits};

/// Platforms the [`HostBackend`](super::HostBackend) reports.
#[derive(Debug, Clone)]
pub struct HostBackendConfig {
    pub platforms: Vec<HostPlatformSpec>,
}

impl Default for HostBackendConfig {
    /// One platform with one GPU-class device.
    fn default() -> Self {
        Self {
            platforms: vec![HostPlatformSpec::new("Offload Host Emulation").with_device(HostDeviceSpec::gpu("Host Emulated GPU"))],
        }
    }
}

impl HostBackendConfig {
    /// A machine with no platforms installed.
    pub fn empty() -> Self {
        Self { platforms: Vec::new() }
    }

    /// One default platform carrying exactly `device`.
    pub fn single_device(device: HostDeviceSpec) -> Self {
        Self {
            platforms: vec![HostPlatformSpec::new("Offload Host Emulation").with_device(device)],
        }
    }

    pub fn with_platform(mut self, platform: HostPlatformSpec) -> Self {
        self.platforms.push(platform);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatformSpec {
    pub name: String,
    pub version: String,
    pub devices: Vec<HostDeviceSpec>,
}

impl HostPlatformSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: format!("OpenCL 1.2 offload-host {}", env!("CARGO_PKG_VERSION")),
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: HostDeviceSpec) -> Self {
        self.devices.push(device);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub class: DeviceClass,
    pub limits: DeviceLimits,
    /// Bytes the device hands out before allocations fail.
    pub global_mem_size: u64,
    /// When false the device is listed but rejects contexts.
    pub available: bool,
}

impl HostDeviceSpec {
    pub const DEFAULT_MEMORY: u64 = 256 * 1024 * 1024;

    pub fn new(name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            name: name.into(),
            class,
            limits: DeviceLimits::default(),
            global_mem_size: Self::DEFAULT_MEMORY,
            available: true,
        }
    }

    pub fn gpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceClass::Gpu)
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceClass::Cpu)
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.global_mem_size = bytes;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}
