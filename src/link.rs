//! Device link
//!
//! A link binds a set of devices into one shared context with one in-order
//! command queue per device. Each device gets a performance factor (its share
//! of the summed performance indexes) used to split buffers across devices.
//!
//! Construction never fails outright: if the devices cannot be linked the
//! error is logged and the link reports zero devices. Programs refuse such
//! links in `set_link`.

use crate::api::{
    ComputeApi, ContextHandle, DeviceType, EventHandle, ProgramHandle, QueueHandle,
};
use crate::catalog::{Device, DeviceCatalog, Platform};
use crate::error::{ApiResultExt, Result, RuntimeError, fail};
use std::rc::Rc;

pub struct DeviceLink {
    api: Rc<dyn ComputeApi>,
    context: Option<ContextHandle>,
    devices: Vec<Rc<Device>>,
    queues: Vec<QueueHandle>,
    factors: Vec<f64>,
    profiling: bool,
    workgroup_cap: usize,
}

impl DeviceLink {
    /// Link a list of devices, logging and returning an empty link on failure
    pub fn new(catalog: &DeviceCatalog, devices: &[Rc<Device>]) -> Self {
        Self::connect(catalog, devices).unwrap_or_else(|_| Self::unlinked(catalog))
    }

    pub fn from_device(catalog: &DeviceCatalog, device: &Rc<Device>) -> Self {
        Self::new(catalog, std::slice::from_ref(device))
    }

    /// Link every device of a platform (the first platform when `None`)
    pub fn from_platform(catalog: &DeviceCatalog, platform: Option<&Platform>) -> Self {
        match platform.or_else(|| catalog.first_platform()) {
            Some(platform) => Self::new(catalog, platform.all_devices()),
            None => {
                tracing::error!("No platform to connect to");
                Self::unlinked(catalog)
            }
        }
    }

    /// Link a list of devices
    pub fn connect(catalog: &DeviceCatalog, devices: &[Rc<Device>]) -> Result<Self> {
        tracing::debug!("Connecting to {} device(s)", devices.len());
        if devices.is_empty() {
            return fail(RuntimeError::NoDevices);
        }

        let api = Rc::clone(catalog.api());
        let config = catalog.config();
        let handles: Vec<_> = devices.iter().map(|d| d.handle()).collect();
        let context = api.create_context(&handles).or_log("create context")?;

        // from here on Drop releases whatever was created
        let mut link = Self {
            api,
            context: Some(context),
            devices: Vec::with_capacity(devices.len()),
            queues: Vec::with_capacity(devices.len()),
            factors: performance_factors(devices),
            profiling: config.profiling,
            workgroup_cap: config.max_workgroup_size,
        };
        for device in devices {
            tracing::info!("Linking to device: {}", device.name());
            let queue = link
                .api
                .create_queue(context, device.handle(), link.profiling)
                .or_log("create command queue")?;
            link.queues.push(queue);
            link.devices.push(Rc::clone(device));
        }
        Ok(link)
    }

    fn unlinked(catalog: &DeviceCatalog) -> Self {
        Self {
            api: Rc::clone(catalog.api()),
            context: None,
            devices: Vec::new(),
            queues: Vec::new(),
            factors: Vec::new(),
            profiling: catalog.config().profiling,
            workgroup_cap: catalog.config().max_workgroup_size,
        }
    }

    pub fn api(&self) -> &Rc<dyn ComputeApi> {
        &self.api
    }

    pub fn context(&self) -> Option<ContextHandle> {
        self.context
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Rc<Device>] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Rc<Device>> {
        self.devices.get(index)
    }

    pub fn queue(&self, index: usize) -> Option<QueueHandle> {
        self.queues.get(index).copied()
    }

    pub fn queues(&self) -> &[QueueHandle] {
        &self.queues
    }

    pub fn performance_factor(&self, index: usize) -> Option<f64> {
        self.factors.get(index).copied()
    }

    pub fn performance_factors(&self) -> &[f64] {
        &self.factors
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Upper bound applied to per-kernel workgroup sizes
    pub fn workgroup_cap(&self) -> usize {
        self.workgroup_cap
    }

    /// Name of the platform the linked devices belong to
    pub fn platform_name(&self) -> Option<&str> {
        self.devices.first().map(|d| d.platform_name())
    }

    pub fn best_device(&self, ty: DeviceType) -> Option<Rc<Device>> {
        let candidates: Vec<_> = self
            .devices
            .iter()
            .filter(|d| d.device_type().matches(ty))
            .cloned()
            .collect();
        DeviceCatalog::best_device(&candidates)
    }

    /// Options used to build for device `index`: base options plus class flags
    pub fn device_build_options(&self, index: usize, base: &str) -> String {
        let mut options = base.to_string();
        let Some(device) = self.devices.get(index) else {
            return options;
        };
        if device.is_gpu() {
            options.push_str(" -D GPU");
            let platform = device.platform_name();
            if platform.contains("ATI") || platform.contains("AMD") {
                options.push_str(" -D ATI");
            } else if platform.to_lowercase().contains("intel") {
                options.push_str(" -D INTEL");
            } else {
                options.push_str(" -D NVIDIA");
            }
        } else if device.is_cpu() {
            options.push_str(" -D CPU");
        } else if device.is_accelerator() {
            options.push_str(" -D ACCELERATOR");
        }
        options
    }

    /// Compile `program` for every linked device
    ///
    /// The compiler log is always fetched: it is logged as an error when the
    /// build fails and at debug level otherwise.
    pub fn build_program(&self, program: ProgramHandle, base_options: &str) -> Result<()> {
        for (i, device) in self.devices.iter().enumerate() {
            let options = self.device_build_options(i, base_options);
            tracing::debug!("Building for {} with `{}`", device.name(), options);
            let status = self.api.build_program(program, device.handle(), &options);

            match self.api.build_log(program, device.handle()) {
                Err(_) => tracing::error!("Error while fetching compile log"),
                Ok(log) if status.is_err() => tracing::error!("{}", log),
                Ok(log) if !log.trim().is_empty() => tracing::debug!("{}", log),
                Ok(_) => {}
            }

            if let Err(status) = status {
                return fail(RuntimeError::BuildFailed {
                    device: device.name().to_string(),
                    status,
                });
            }
        }
        Ok(())
    }

    /// Block on every queue, still draining the rest when one fails
    pub fn finish(&self) -> Result<()> {
        let mut first_error = None;
        for queue in &self.queues {
            if let Err(err) = self.api.finish(*queue).or_log("finish") {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Complete a batch of per-device commands
    ///
    /// With profiling on, waits and logs each device's elapsed time; otherwise
    /// waits only when `wait` is set. The events are released either way.
    pub(crate) fn settle(&self, events: &[(usize, EventHandle)], wait: bool) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let handles: Vec<EventHandle> = events.iter().map(|(_, e)| *e).collect();
        let result = if self.profiling {
            let waited = self.api.wait_for_events(&handles).or_log("wait for events");
            if waited.is_ok() {
                for (device, event) in events {
                    if let Ok((start, end)) = self.api.event_profile(*event) {
                        let name = self.device(*device).map_or("?", |d| d.name());
                        tracing::debug!("{}: {} microsecs", name, end.saturating_sub(start) / 1000);
                    }
                }
            }
            waited
        } else if wait {
            self.api.wait_for_events(&handles).or_log("wait for events")
        } else {
            Ok(())
        };
        self.discard(events);
        result
    }

    /// Release events of a batch that is abandoned
    pub(crate) fn discard(&self, events: &[(usize, EventHandle)]) {
        for (_, event) in events {
            self.api.release_event(*event);
        }
    }

    /// Smallest of the linked devices' maximum workgroup sizes (0 if unlinked)
    pub fn min_max_workgroup_size(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.max_work_group_size())
            .min()
            .unwrap_or(0)
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        for queue in self.queues.drain(..) {
            self.api.release_queue(queue);
        }
        if let Some(context) = self.context.take() {
            self.api.release_context(context);
        }
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("backend", &self.api.name())
            .field("context", &self.context)
            .field(
                "devices",
                &self.devices.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("factors", &self.factors)
            .finish()
    }
}

/// Normalized performance indexes; equal shares when every index is zero
pub fn performance_factors(devices: &[Rc<Device>]) -> Vec<f64> {
    let total: u64 = devices.iter().map(|d| d.performance_index()).sum();
    if total == 0 {
        let share = 1.0 / devices.len().max(1) as f64;
        return vec![share; devices.len()];
    }
    devices
        .iter()
        .map(|d| d.performance_index() as f64 / total as f64)
        .collect()
}
