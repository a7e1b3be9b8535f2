//! Platform and device discovery
//!
//! Platforms are walked in the order the runtime reports them, and the
//! first device of the preferred class wins. There is no fallback to another
//! class: asking for a GPU on a CPU-only machine is an error.

use crate::backend::SharedBackend;
use crate::error::{Error, Result};
use offload_backends::{Backend, DeviceClass, DeviceInfo, PlatformInfo};
use std::sync::OnceLock;

/// List every platform the backend exposes.
///
/// Each platform's name and version is logged at `info`.
///
/// # Errors
///
/// Returns [`Error::NoPlatformFound`] when the list is empty.
#[tracing::instrument(skip(backend), fields(backend = backend.name()))]
pub fn enumerate_platforms(backend: &dyn Backend) -> Result<Vec<PlatformInfo>> {
    let platforms = backend.platforms()?;
    if platforms.is_empty() {
        return Err(Error::NoPlatformFound {
            backend: backend.name(),
        });
    }
    for platform in &platforms {
        tracing::info!(platform = %platform.name, version = %platform.version, "platform_found");
    }
    Ok(platforms)
}

/// Pick the first device of `preferred` class across `platforms`.
///
/// # Errors
///
/// Returns [`Error::DeviceUnavailable`] if no platform has such a device.
#[tracing::instrument(skip(backend, platforms), fields(platforms = platforms.len()))]
pub fn select_device(backend: &dyn Backend, platforms: &[PlatformInfo], preferred: DeviceClass) -> Result<DeviceInfo> {
    for platform in platforms {
        if let Some(device) = backend.devices(platform.id, preferred)?.into_iter().next() {
            tracing::info!(device = %device.name, class = %device.class, platform = %platform.name, "device_selected");
            return Ok(device);
        }
    }
    Err(Error::DeviceUnavailable(format!(
        "no {preferred} device on any of {} platform(s)",
        platforms.len()
    )))
}

/// Every device of every class, for diagnostics.
pub fn probe_devices(backend: &dyn Backend) -> Result<Vec<(PlatformInfo, Vec<DeviceInfo>)>> {
    let platforms = enumerate_platforms(backend)?;
    platforms
        .into_iter()
        .map(|platform| {
            let mut devices = Vec::new();
            for class in DeviceClass::ALL {
                devices.extend(backend.devices(platform.id, class)?);
            }
            devices.sort_by_key(|d| d.id);
            Ok((platform, devices))
        })
        .collect()
}

/// Discovery bound to one backend, with the selected device cached for the run.
pub struct DeviceEnumerator {
    backend: SharedBackend,
    preferred: DeviceClass,
    selected: OnceLock<DeviceInfo>,
}

impl DeviceEnumerator {
    pub fn new(backend: SharedBackend, preferred: DeviceClass) -> Self {
        Self {
            backend,
            preferred,
            selected: OnceLock::new(),
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn preferred(&self) -> DeviceClass {
        self.preferred
    }

    pub fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        enumerate_platforms(self.backend.read().as_ref())
    }

    /// The selected device. Discovery runs on the first call only.
    pub fn device(&self) -> Result<&DeviceInfo> {
        if let Some(device) = self.selected.get() {
            return Ok(device);
        }
        let device = {
            let backend = self.backend.read();
            let platforms = enumerate_platforms(backend.as_ref())?;
            select_device(backend.as_ref(), &platforms, self.preferred)?
        };
        Ok(self.selected.get_or_init(|| device))
    }

    /// Platform owning the selected device.
    pub fn platform(&self) -> Result<PlatformInfo> {
        let device = self.device()?;
        self.platforms()?
            .into_iter()
            .find(|p| p.id == device.platform)
            .ok_or_else(|| Error::DeviceUnavailable(format!("platform of {} disappeared", device.name)))
    }

    pub fn probe(&self) -> Result<Vec<(PlatformInfo, Vec<DeviceInfo>)>> {
        probe_devices(self.backend.read().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::share;
    use offload_backends::{HostBackend, HostBackendConfig, HostDeviceSpec, HostPlatformSpec};

    fn backend(config: HostBackendConfig) -> HostBackend {
        HostBackend::with_config(config)
    }

    #[test]
    fn test_no_platform() {
        let host = backend(HostBackendConfig::empty());
        assert!(matches!(
            enumerate_platforms(&host),
            Err(Error::NoPlatformFound { backend: "host" })
        ));
    }

    #[test]
    fn test_first_gpu_across_platforms() {
        let config = HostBackendConfig::empty()
            .with_platform(HostPlatformSpec::new("cpu only").with_device(HostDeviceSpec::cpu("cpu0")))
            .with_platform(
                HostPlatformSpec::new("discrete")
                    .with_device(HostDeviceSpec::gpu("gpu0"))
                    .with_device(HostDeviceSpec::gpu("gpu1")),
            );
        let host = backend(config);
        let platforms = enumerate_platforms(&host).unwrap();
        assert_eq!(platforms.len(), 2);
        let device = select_device(&host, &platforms, DeviceClass::Gpu).unwrap();
        assert_eq!(device.name, "gpu0");
        assert_eq!(device.platform, platforms[1].id);
    }

    #[test]
    fn test_no_silent_cpu_fallback() {
        let host = backend(HostBackendConfig::single_device(HostDeviceSpec::cpu("cpu0")));
        let platforms = enumerate_platforms(&host).unwrap();
        assert!(matches!(
            select_device(&host, &platforms, DeviceClass::Gpu),
            Err(Error::DeviceUnavailable(_))
        ));
        assert_eq!(select_device(&host, &platforms, DeviceClass::Cpu).unwrap().name, "cpu0");
    }

    #[test]
    fn test_enumerator_caches_selection() {
        let enumerator = DeviceEnumerator::new(share(HostBackend::new()), DeviceClass::Gpu);
        let first = enumerator.device().unwrap().clone();
        let second = enumerator.device().unwrap();
        assert_eq!(&first, second);
        assert_eq!(enumerator.platform().unwrap().id, first.platform);
    }

    #[test]
    fn test_probe_lists_all_classes() {
        let config = HostBackendConfig::single_device(HostDeviceSpec::gpu("gpu0"))
            .with_platform(HostPlatformSpec::new("second").with_device(HostDeviceSpec::cpu("cpu0")));
        let probed = probe_devices(&backend(config)).unwrap();
        let names: Vec<_> = probed.iter().flat_map(|(_, d)| d.iter().map(|d| d.name.as_str())).collect();
        assert_eq!(names, vec!["gpu0", "cpu0"]);
    }
}
