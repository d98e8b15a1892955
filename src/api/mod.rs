//! Downward interface to the compute API
//!
//! The runtime never talks to a driver directly. Everything it needs from the
//! context/queue/buffer/kernel model goes through [`ComputeApi`]:
//! - platform and device discovery
//! - context and command-queue lifetime
//! - program compilation with per-device build logs
//! - buffer create/read/write/copy
//! - kernel creation, argument binding and launch
//! - events for blocking and profiling
//!
//! Handles are plain integers owned by the backend. Every call reports failure
//! through an [`ApiStatus`] that can be translated with [`ApiStatus::description`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

#[cfg(feature = "opencl")]
pub mod opencl;
pub mod simulated;
pub mod status;

#[cfg(feature = "opencl")]
pub use opencl::OpenClApi;
pub use simulated::{SimDevice, SimLaunch, SimOp, SimPlatform, SimStats, SimulatedApi};
pub use status::ApiStatus;

/// Result of a single compute-API call
pub type ApiResult<T> = std::result::Result<T, ApiStatus>;

macro_rules! handle_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}#{:x}", stringify!($name), self.0)
                }
            }
        )*
    };
}

handle_type!(
    /// Vendor implementation
    PlatformHandle,
    /// Physical or virtual compute device
    DeviceHandle,
    /// Shared execution context spanning one or more devices
    ContextHandle,
    /// In-order command queue bound to one device
    QueueHandle,
    /// Program object created from source
    ProgramHandle,
    /// Compiled kernel entry point
    KernelHandle,
    /// Device memory object
    MemHandle,
    /// Completion marker of an enqueued command
    EventHandle,
);

/// Device type bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceType(pub u64);

impl DeviceType {
    pub const DEFAULT: DeviceType = DeviceType(1 << 0);
    pub const CPU: DeviceType = DeviceType(1 << 1);
    pub const GPU: DeviceType = DeviceType(1 << 2);
    pub const ACCELERATOR: DeviceType = DeviceType(1 << 3);
    pub const ALL: DeviceType = DeviceType(0xFFFF_FFFF);

    /// Does a device of this type satisfy the requested mask
    pub fn matches(self, mask: DeviceType) -> bool {
        mask == DeviceType::ALL || self.0 & mask.0 != 0
    }

    pub fn is_cpu(self) -> bool {
        self.0 & DeviceType::CPU.0 != 0
    }

    pub fn is_gpu(self) -> bool {
        self.0 & DeviceType::GPU.0 != 0
    }

    pub fn is_accelerator(self) -> bool {
        self.0 & DeviceType::ACCELERATOR.0 != 0
    }
}

impl BitOr for DeviceType {
    type Output = DeviceType;

    fn bitor(self, rhs: DeviceType) -> DeviceType {
        DeviceType(self.0 | rhs.0)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DeviceType::ALL {
            write!(f, "all")
        } else if self.is_gpu() {
            write!(f, "GPU")
        } else if self.is_cpu() {
            write!(f, "CPU")
        } else if self.is_accelerator() {
            write!(f, "accelerator")
        } else {
            write!(f, "default")
        }
    }
}

/// Platform attributes as reported by the compute API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// Raw device attributes as reported by the compute API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub max_compute_units: u32,
    /// MHz
    pub max_clock_frequency: u32,
    pub max_work_group_size: usize,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_mem_alloc_size: u64,
    /// Space separated extension names
    pub extensions: String,
}

/// Value passed to a kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg<'a> {
    /// Device memory object
    Buffer(MemHandle),
    /// Amount of local memory in bytes to reserve for the launch
    Local(usize),
    /// Raw host value, copied by the API at bind time
    Bytes(&'a [u8]),
}

/// The compute API as seen by the runtime
///
/// Release operations are infallible from the caller's perspective: a failing
/// release is logged by the backend and otherwise ignored.
pub trait ComputeApi {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    // === Discovery ===

    fn platform_ids(&self) -> ApiResult<Vec<PlatformHandle>>;
    fn platform_info(&self, platform: PlatformHandle) -> ApiResult<PlatformInfo>;
    fn device_ids(&self, platform: PlatformHandle) -> ApiResult<Vec<DeviceHandle>>;
    fn device_info(&self, device: DeviceHandle) -> ApiResult<DeviceInfo>;

    // === Context and queues ===

    fn create_context(&self, devices: &[DeviceHandle]) -> ApiResult<ContextHandle>;
    fn release_context(&self, context: ContextHandle);
    fn create_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        profiling: bool,
    ) -> ApiResult<QueueHandle>;
    fn release_queue(&self, queue: QueueHandle);
    /// Block until every command submitted to the queue has completed
    fn finish(&self, queue: QueueHandle) -> ApiResult<()>;

    // === Programs ===

    fn create_program(&self, context: ContextHandle, source: &str) -> ApiResult<ProgramHandle>;
    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceHandle,
        options: &str,
    ) -> ApiResult<()>;
    fn build_log(&self, program: ProgramHandle, device: DeviceHandle) -> ApiResult<String>;
    fn release_program(&self, program: ProgramHandle);

    // === Memory ===

    fn create_buffer(&self, context: ContextHandle, bytes: usize) -> ApiResult<MemHandle>;
    fn release_buffer(&self, buffer: MemHandle);
    fn enqueue_write(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &[u8],
        blocking: bool,
    ) -> ApiResult<EventHandle>;
    fn enqueue_read(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &mut [u8],
        blocking: bool,
    ) -> ApiResult<EventHandle>;
    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        bytes: usize,
    ) -> ApiResult<EventHandle>;

    // === Kernels ===

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> ApiResult<KernelHandle>;
    fn release_kernel(&self, kernel: KernelHandle);
    /// Largest workgroup the kernel can be launched with on the device
    fn kernel_work_group_size(&self, kernel: KernelHandle, device: DeviceHandle)
    -> ApiResult<usize>;
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: KernelArg<'_>)
    -> ApiResult<()>;
    /// One-dimensional NDRange launch
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_size: usize,
        local_size: usize,
    ) -> ApiResult<EventHandle>;

    // === Events ===

    fn wait_for_events(&self, events: &[EventHandle]) -> ApiResult<()>;
    /// Start and end timestamps in nanoseconds (requires a profiling queue)
    fn event_profile(&self, event: EventHandle) -> ApiResult<(u64, u64)>;
    fn release_event(&self, event: EventHandle);
}

impl fmt::Debug for dyn ComputeApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_mask() {
        assert!(DeviceType::GPU.matches(DeviceType::ALL));
        assert!(DeviceType::GPU.matches(DeviceType::GPU | DeviceType::CPU));
        assert!(!DeviceType::CPU.matches(DeviceType::GPU));
        assert!(DeviceType::ACCELERATOR.is_accelerator());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(MemHandle(255).to_string(), "MemHandle#ff");
    }
}
