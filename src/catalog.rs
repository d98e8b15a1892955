//! Device catalog
//!
//! Discovers platforms and devices once and answers selection queries. The
//! catalog is an explicit context object: construct it at startup and pass it
//! by reference to whatever needs to pick devices or build links.
//!
//! An API that reports no platforms (or fails while enumerating) yields an
//! empty catalog rather than an error; callers check `device_count()`.

use crate::api::{ComputeApi, DeviceHandle, DeviceInfo, DeviceType, PlatformHandle};
use crate::config::RuntimeConfig;
use serde::{Serialize, Serializer};
use std::rc::Rc;

/// Platforms considered during discovery
pub const MAX_PLATFORMS: usize = 4;
/// Devices considered per platform
pub const MAX_DEVICES_PER_PLATFORM: usize = 32;

fn type_name<S: Serializer>(ty: &DeviceType, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(ty)
}

/// A compute device with its static capabilities
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    #[serde(skip)]
    handle: DeviceHandle,
    #[serde(skip)]
    platform_index: usize,
    platform_name: String,
    name: String,
    vendor: String,
    #[serde(serialize_with = "type_name")]
    device_type: DeviceType,
    compute_units: u32,
    max_clock_mhz: u32,
    max_work_group_size: usize,
    global_mem_size: u64,
    local_mem_size: u64,
    max_mem_alloc_size: u64,
    fp16: bool,
    fp64: bool,
    global_atomics: bool,
    local_atomics: bool,
    performance_index: u64,
}

fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|e| e == name)
}

impl Device {
    fn from_info(
        handle: DeviceHandle,
        platform_index: usize,
        platform_name: &str,
        info: DeviceInfo,
    ) -> Self {
        let ext = info.extensions.as_str();
        let fp64 = has_extension(ext, "cl_khr_fp64") || has_extension(ext, "cl_amd_fp64");
        let fp16 = has_extension(ext, "cl_khr_fp16");
        let global_atomics = has_extension(ext, "cl_khr_global_int32_base_atomics")
            && has_extension(ext, "cl_khr_global_int32_extended_atomics");
        let local_atomics = has_extension(ext, "cl_khr_local_int32_base_atomics")
            && has_extension(ext, "cl_khr_local_int32_extended_atomics");

        Self {
            handle,
            platform_index,
            platform_name: platform_name.to_string(),
            performance_index: info.max_compute_units as u64 * info.max_clock_frequency as u64,
            name: info.name.trim().to_string(),
            vendor: info.vendor.trim().to_string(),
            device_type: info.device_type,
            compute_units: info.max_compute_units,
            max_clock_mhz: info.max_clock_frequency,
            max_work_group_size: info.max_work_group_size,
            global_mem_size: info.global_mem_size,
            local_mem_size: info.local_mem_size,
            max_mem_alloc_size: info.max_mem_alloc_size,
            fp16,
            fp64,
            global_atomics,
            local_atomics,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Position of the owning platform in the catalog
    pub fn platform_index(&self) -> usize {
        self.platform_index
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn is_cpu(&self) -> bool {
        self.device_type.is_cpu()
    }

    pub fn is_gpu(&self) -> bool {
        self.device_type.is_gpu()
    }

    pub fn is_accelerator(&self) -> bool {
        self.device_type.is_accelerator()
    }

    pub fn compute_units(&self) -> u32 {
        self.compute_units
    }

    pub fn max_clock_mhz(&self) -> u32 {
        self.max_clock_mhz
    }

    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    pub fn global_mem_size(&self) -> u64 {
        self.global_mem_size
    }

    pub fn local_mem_size(&self) -> u64 {
        self.local_mem_size
    }

    pub fn max_mem_alloc_size(&self) -> u64 {
        self.max_mem_alloc_size
    }

    pub fn half_precision(&self) -> bool {
        self.fp16
    }

    pub fn double_precision(&self) -> bool {
        self.fp64
    }

    pub fn global_atomics(&self) -> bool {
        self.global_atomics
    }

    pub fn local_atomics(&self) -> bool {
        self.local_atomics
    }

    pub fn atomics(&self) -> bool {
        self.global_atomics && self.local_atomics
    }

    /// Compute units times maximum clock
    pub fn performance_index(&self) -> u64 {
        self.performance_index
    }
}

/// A vendor implementation and its devices
#[derive(Debug, Clone)]
pub struct Platform {
    index: usize,
    handle: PlatformHandle,
    name: String,
    vendor: String,
    version: String,
    devices: Vec<Rc<Device>>,
}

impl Platform {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> PlatformHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn all_devices(&self) -> &[Rc<Device>] {
        &self.devices
    }

    /// Devices of the requested type, in enumeration order
    pub fn devices(&self, ty: DeviceType) -> Vec<Rc<Device>> {
        self.devices
            .iter()
            .filter(|d| d.device_type.matches(ty))
            .cloned()
            .collect()
    }

    pub fn best_device(&self, ty: DeviceType) -> Option<Rc<Device>> {
        DeviceCatalog::best_device(&self.devices(ty))
    }
}

/// Everything the compute API exposes, discovered once
pub struct DeviceCatalog {
    api: Rc<dyn ComputeApi>,
    config: RuntimeConfig,
    platforms: Vec<Platform>,
}

impl DeviceCatalog {
    pub fn new(api: Rc<dyn ComputeApi>, config: RuntimeConfig) -> Self {
        let platforms = discover(api.as_ref());
        if platforms.is_empty() {
            tracing::warn!("No compute platforms found on backend `{}`", api.name());
        }
        Self {
            api,
            config,
            platforms,
        }
    }

    pub fn api(&self) -> &Rc<dyn ComputeApi> {
        &self.api
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    pub fn platform(&self, index: usize) -> Option<&Platform> {
        self.platforms.get(index)
    }

    pub fn first_platform(&self) -> Option<&Platform> {
        self.platforms.first()
    }

    pub fn platform_count(&self) -> usize {
        self.platforms.len()
    }

    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }

    /// Every device of every platform
    pub fn devices(&self) -> impl Iterator<Item = &Rc<Device>> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }

    /// Devices matching `ty` whose name contains `pattern` (case-insensitive)
    ///
    /// Platforms are scanned in order and the scan stops at the first platform
    /// with any match, so the result never mixes platforms.
    pub fn filter_devices(&self, ty: DeviceType, pattern: &str) -> Vec<Rc<Device>> {
        let pattern = pattern.to_lowercase();
        for platform in &self.platforms {
            let found: Vec<Rc<Device>> = platform
                .devices
                .iter()
                .filter(|d| d.device_type.matches(ty))
                .filter(|d| d.name.to_lowercase().contains(&pattern))
                .cloned()
                .collect();
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    /// Device with the highest performance index; the first one wins ties
    pub fn best_device(devices: &[Rc<Device>]) -> Option<Rc<Device>> {
        let mut best: Option<&Rc<Device>> = None;
        for device in devices {
            if best.is_none_or(|b| device.performance_index > b.performance_index) {
                best = Some(device);
            }
        }
        best.cloned()
    }
}

fn discover(api: &dyn ComputeApi) -> Vec<Platform> {
    let handles = match api.platform_ids() {
        Ok(handles) => handles,
        Err(status) => {
            tracing::error!("{}", status);
            return Vec::new();
        }
    };

    let mut platforms = Vec::new();
    for handle in handles.into_iter().take(MAX_PLATFORMS) {
        let info = match api.platform_info(handle) {
            Ok(info) => info,
            Err(status) => {
                tracing::error!("{}", status);
                continue;
            }
        };
        let index = platforms.len();
        tracing::info!("Found platform: {} ({})", info.name, info.vendor);

        let device_handles = api.device_ids(handle).unwrap_or_else(|status| {
            tracing::error!("{}", status);
            Vec::new()
        });
        let mut devices = Vec::new();
        for device in device_handles.into_iter().take(MAX_DEVICES_PER_PLATFORM) {
            match api.device_info(device) {
                Ok(raw) => {
                    let device = Device::from_info(device, index, &info.name, raw);
                    tracing::info!(
                        "Found device: {} [{}], performance index {}",
                        device.name,
                        device.device_type,
                        device.performance_index
                    );
                    devices.push(Rc::new(device));
                }
                Err(status) => tracing::warn!("Skipping device {}: {}", device, status),
            }
        }

        platforms.push(Platform {
            index,
            handle,
            name: info.name,
            vendor: info.vendor,
            version: info.version,
            devices,
        });
    }
    platforms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SimDevice, SimPlatform, SimulatedApi};

    #[test]
    fn test_capabilities_from_extensions() {
        let api = SimulatedApi::new(vec![
            SimPlatform::new("P", "V")
                .with_device(SimDevice::gpu("full", 4, 100))
                .with_device(
                    SimDevice::gpu("partial", 4, 100)
                        .with_extensions("cl_khr_fp16 cl_khr_global_int32_base_atomics"),
                ),
        ]);
        let catalog = DeviceCatalog::new(Rc::new(api), RuntimeConfig::default());
        let devices: Vec<_> = catalog.devices().cloned().collect();

        assert!(devices[0].double_precision());
        assert!(devices[0].atomics());
        assert!(!devices[0].half_precision());

        assert!(devices[1].half_precision());
        assert!(!devices[1].double_precision());
        // base without extended is not enough
        assert!(!devices[1].global_atomics());
        assert!(!devices[1].atomics());
    }

    #[test]
    fn test_platform_limit() {
        let platforms = (0..6)
            .map(|i| {
                SimPlatform::new(format!("P{i}"), "V").with_device(SimDevice::cpu("c", 1, 1))
            })
            .collect();
        let catalog = DeviceCatalog::new(Rc::new(SimulatedApi::new(platforms)), Default::default());
        assert_eq!(catalog.platform_count(), MAX_PLATFORMS);
    }

    #[test]
    fn test_device_limit() {
        let mut platform = SimPlatform::new("P", "V");
        for i in 0..40 {
            platform = platform.with_device(SimDevice::cpu(format!("c{i}"), 1, 1));
        }
        let catalog =
            DeviceCatalog::new(Rc::new(SimulatedApi::new(vec![platform])), Default::default());
        assert_eq!(catalog.device_count(), MAX_DEVICES_PER_PLATFORM);
    }

    #[test]
    fn test_platform_best_device_by_type() {
        let api = SimulatedApi::new(vec![
            SimPlatform::new("P", "V")
                .with_device(SimDevice::cpu("cpu", 64, 3000))
                .with_device(SimDevice::gpu("gpu", 8, 1000)),
        ]);
        let catalog = DeviceCatalog::new(Rc::new(api), Default::default());
        let platform = catalog.first_platform().unwrap();
        assert_eq!(platform.best_device(DeviceType::ALL).unwrap().name(), "cpu");
        assert_eq!(platform.best_device(DeviceType::GPU).unwrap().name(), "gpu");
        assert!(platform.best_device(DeviceType::ACCELERATOR).is_none());
    }
}
