//! Simulated compute API
//!
//! Everything lives in host memory and every command completes at submission,
//! so blocking and non-blocking calls behave the same. Kernels are executed by
//! host functions registered under the kernel's name; a kernel without a
//! registered function launches as a no-op.
//!
//! The backend also keeps call counters ([`SimStats`]) and supports one-shot
//! failure injection ([`SimulatedApi::inject_failure`]) so the runtime's error
//! paths can be exercised without hardware.

use super::{
    ApiResult, ApiStatus, ComputeApi, ContextHandle, DeviceHandle, DeviceInfo, DeviceType,
    EventHandle, KernelArg, KernelHandle, MemHandle, PlatformHandle, PlatformInfo, ProgramHandle,
    QueueHandle,
};
use bytemuck::Pod;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

const DEFAULT_EXTENSIONS: &str = "cl_khr_fp64 cl_khr_global_int32_base_atomics \
     cl_khr_global_int32_extended_atomics cl_khr_local_int32_base_atomics \
     cl_khr_local_int32_extended_atomics";

/// Simulated device description
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub max_work_group_size: usize,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_mem_alloc_size: u64,
    pub extensions: String,
}

impl SimDevice {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            vendor: "kernlink".to_string(),
            device_type,
            compute_units: 1,
            clock_mhz: 1000,
            max_work_group_size: 256,
            global_mem_size: 1024 * 1024 * 1024, // 1 GB
            local_mem_size: 32 * 1024,
            max_mem_alloc_size: 256 * 1024 * 1024,
            extensions: DEFAULT_EXTENSIONS.to_string(),
        }
    }

    pub fn gpu(name: impl Into<String>, compute_units: u32, clock_mhz: u32) -> Self {
        Self::new(name, DeviceType::GPU).with_compute(compute_units, clock_mhz)
    }

    pub fn cpu(name: impl Into<String>, compute_units: u32, clock_mhz: u32) -> Self {
        Self::new(name, DeviceType::CPU)
            .with_compute(compute_units, clock_mhz)
            .with_work_group_size(1024)
    }

    pub fn with_compute(mut self, compute_units: u32, clock_mhz: u32) -> Self {
        self.compute_units = compute_units;
        self.clock_mhz = clock_mhz;
        self
    }

    pub fn with_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn with_extensions(mut self, extensions: impl Into<String>) -> Self {
        self.extensions = extensions.into();
        self
    }
}

/// Simulated platform description
#[derive(Debug, Clone)]
pub struct SimPlatform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<SimDevice>,
}

impl SimPlatform {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            version: "OpenCL 1.2 kernlink-sim".to_string(),
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: SimDevice) -> Self {
        self.devices.push(device);
        self
    }
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub contexts: usize,
    pub queues: usize,
    pub programs: usize,
    pub builds: usize,
    pub buffers_created: usize,
    pub buffers_released: usize,
    pub writes: usize,
    pub reads: usize,
    pub copies: usize,
    pub kernels_created: usize,
    pub kernel_args: usize,
    pub launches: usize,
    pub finishes: usize,
    pub waits: usize,
}

impl SimStats {
    /// Number of calls that reached the simulated device at all
    pub fn native_calls(&self) -> usize {
        self.contexts
            + self.queues
            + self.programs
            + self.builds
            + self.buffers_created
            + self.writes
            + self.reads
            + self.copies
            + self.kernels_created
            + self.kernel_args
            + self.launches
            + self.finishes
            + self.waits
    }
}

/// Operations that accept an injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateContext,
    CreateQueue,
    CreateProgram,
    BuildProgram,
    CreateBuffer,
    Write,
    Read,
    Copy,
    CreateKernel,
    SetKernelArg,
    EnqueueKernel,
    Finish,
    Wait,
}

/// Host implementation of a kernel
pub type HostKernel = dyn Fn(&mut SimLaunch<'_>) -> ApiResult<()>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimArg {
    Buffer(u64),
    Local(usize),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct SimProgram {
    source: String,
    built: bool,
    logs: FxHashMap<DeviceHandle, String>,
}

#[derive(Debug)]
struct SimKernel {
    name: String,
    args: Vec<Option<SimArg>>,
}

#[derive(Debug, Clone, Copy)]
struct SimQueue {
    device: DeviceHandle,
    profiling: bool,
}

#[derive(Debug, Clone, Copy)]
struct SimEvent {
    start: u64,
    end: u64,
    profiling: bool,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    clock: u64,
    contexts: FxHashMap<u64, Vec<DeviceHandle>>,
    queues: FxHashMap<u64, SimQueue>,
    programs: FxHashMap<u64, SimProgram>,
    buffers: FxHashMap<u64, Vec<u8>>,
    kernels: FxHashMap<u64, SimKernel>,
    events: FxHashMap<u64, SimEvent>,
    failures: FxHashMap<SimOp, ApiStatus>,
    stats: SimStats,
    last_build_options: Vec<String>,
    last_source: Option<String>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn event(&mut self, queue: SimQueue, duration: u64) -> EventHandle {
        let start = self.clock;
        self.clock += duration.max(1);
        let id = self.handle();
        self.events.insert(
            id,
            SimEvent {
                start,
                end: self.clock,
                profiling: queue.profiling,
            },
        );
        EventHandle(id)
    }

    fn queue(&self, queue: QueueHandle) -> ApiResult<SimQueue> {
        self.queues
            .get(&queue.0)
            .copied()
            .ok_or(ApiStatus::INVALID_COMMAND_QUEUE)
    }
}

/// Arguments and memory visible to a host kernel during one launch
pub struct SimLaunch<'a> {
    pub global_size: usize,
    pub local_size: usize,
    pub device: DeviceHandle,
    args: Vec<SimArg>,
    buffers: &'a mut FxHashMap<u64, Vec<u8>>,
}

impl SimLaunch<'_> {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn buffer_id(&self, arg: usize) -> ApiResult<u64> {
        match self.args.get(arg) {
            Some(SimArg::Buffer(id)) => Ok(*id),
            _ => Err(ApiStatus::INVALID_ARG_INDEX),
        }
    }

    /// Copy a buffer argument out as typed elements
    pub fn read<T: Pod>(&self, arg: usize) -> ApiResult<Vec<T>> {
        let id = self.buffer_id(arg)?;
        let bytes = self.buffers.get(&id).ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        let size = std::mem::size_of::<T>();
        if size == 0 {
            return Ok(Vec::new());
        }
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Overwrite the start of a buffer argument
    pub fn write<T: Pod>(&mut self, arg: usize, data: &[T]) -> ApiResult<()> {
        let id = self.buffer_id(arg)?;
        let bytes = self
            .buffers
            .get_mut(&id)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        let src: &[u8] = bytemuck::cast_slice(data);
        if src.len() > bytes.len() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Read a by-value argument
    pub fn scalar<T: Pod>(&self, arg: usize) -> ApiResult<T> {
        let size = std::mem::size_of::<T>();
        match self.args.get(arg) {
            Some(SimArg::Bytes(bytes)) if bytes.len() >= size => {
                Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
            }
            Some(SimArg::Bytes(_)) => Err(ApiStatus::INVALID_ARG_SIZE),
            _ => Err(ApiStatus::INVALID_ARG_INDEX),
        }
    }

    /// Local memory reserved for an argument
    pub fn local_bytes(&self, arg: usize) -> ApiResult<usize> {
        match self.args.get(arg) {
            Some(SimArg::Local(bytes)) => Ok(*bytes),
            _ => Err(ApiStatus::INVALID_ARG_INDEX),
        }
    }
}

/// In-memory backend
pub struct SimulatedApi {
    platforms: Vec<SimPlatform>,
    host_kernels: RefCell<FxHashMap<String, Rc<HostKernel>>>,
    state: RefCell<SimState>,
}

impl SimulatedApi {
    pub fn new(platforms: Vec<SimPlatform>) -> Self {
        Self {
            platforms,
            host_kernels: RefCell::new(FxHashMap::default()),
            state: RefCell::new(SimState::default()),
        }
    }

    /// One platform with a single GPU
    pub fn single_gpu() -> Self {
        Self::new(vec![
            SimPlatform::new("Simulated Platform", "kernlink")
                .with_device(SimDevice::gpu("Simulated GPU", 8, 1000)),
        ])
    }

    /// Backend that reports no platforms at all
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Register the host function executed for kernels named `name`
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&mut SimLaunch<'_>) -> ApiResult<()> + 'static,
    {
        self.host_kernels
            .borrow_mut()
            .insert(name.into(), Rc::new(kernel));
    }

    /// Make the next call of `op` fail with `status`
    pub fn inject_failure(&self, op: SimOp, status: ApiStatus) {
        self.state.borrow_mut().failures.insert(op, status);
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }

    /// Options of every per-device build since the last program creation
    pub fn last_build_options(&self) -> Vec<String> {
        self.state.borrow().last_build_options.clone()
    }

    /// Source text of the most recently created program
    pub fn last_program_source(&self) -> Option<String> {
        self.state.borrow().last_source.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.state.borrow().kernels.len()
    }

    pub fn live_queues(&self) -> usize {
        self.state.borrow().queues.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.borrow().contexts.len()
    }

    pub fn buffer_contents(&self, buffer: MemHandle) -> Option<Vec<u8>> {
        self.state.borrow().buffers.get(&buffer.0).cloned()
    }

    pub fn buffer_size(&self, buffer: MemHandle) -> Option<usize> {
        self.state.borrow().buffers.get(&buffer.0).map(Vec::len)
    }

    /// Memory object currently bound to a kernel parameter
    pub fn kernel_buffer_arg(&self, kernel: KernelHandle, index: u32) -> Option<MemHandle> {
        let state = self.state.borrow();
        match state.kernels.get(&kernel.0)?.args.get(index as usize)? {
            Some(SimArg::Buffer(id)) => Some(MemHandle(*id)),
            _ => None,
        }
    }

    /// Local memory size currently bound to a kernel parameter
    pub fn kernel_local_arg(&self, kernel: KernelHandle, index: u32) -> Option<usize> {
        let state = self.state.borrow();
        match state.kernels.get(&kernel.0)?.args.get(index as usize)? {
            Some(SimArg::Local(bytes)) => Some(*bytes),
            _ => None,
        }
    }

    fn check(&self, op: SimOp) -> ApiResult<()> {
        match self.state.borrow_mut().failures.remove(&op) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn device(&self, device: DeviceHandle) -> ApiResult<&SimDevice> {
        let platform = (device.0 >> 32).checked_sub(1).ok_or(ApiStatus::INVALID_DEVICE)?;
        let index = device.0 & 0xFFFF_FFFF;
        self.platforms
            .get(platform as usize)
            .and_then(|p| p.devices.get(index as usize))
            .ok_or(ApiStatus::INVALID_DEVICE)
    }

    fn platform(&self, platform: PlatformHandle) -> ApiResult<&SimPlatform> {
        platform
            .0
            .checked_sub(1)
            .and_then(|i| self.platforms.get(i as usize))
            .ok_or(ApiStatus::INVALID_PLATFORM)
    }
}

impl Default for SimulatedApi {
    /// One platform with a CPU and a GPU
    fn default() -> Self {
        Self::new(vec![
            SimPlatform::new("Simulated Platform", "kernlink")
                .with_device(SimDevice::cpu("Simulated CPU", 4, 2400))
                .with_device(SimDevice::gpu("Simulated GPU", 16, 1200)),
        ])
    }
}

/// Does the source declare a kernel entry point named `name`
fn declares_kernel(source: &str, name: &str) -> bool {
    source.match_indices("__kernel").any(|(pos, _)| {
        let rest = &source[pos..];
        let Some(paren) = rest.find('(') else {
            return false;
        };
        let head = rest[..paren].trim_end();
        head.strip_suffix(name).is_some_and(|before| {
            before
                .chars()
                .last()
                .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
        })
    })
}

impl ComputeApi for SimulatedApi {
    fn name(&self) -> &str {
        "simulated"
    }

    fn platform_ids(&self) -> ApiResult<Vec<PlatformHandle>> {
        Ok((1..=self.platforms.len() as u64).map(PlatformHandle).collect())
    }

    fn platform_info(&self, platform: PlatformHandle) -> ApiResult<PlatformInfo> {
        let p = self.platform(platform)?;
        Ok(PlatformInfo {
            name: p.name.clone(),
            vendor: p.vendor.clone(),
            version: p.version.clone(),
        })
    }

    fn device_ids(&self, platform: PlatformHandle) -> ApiResult<Vec<DeviceHandle>> {
        let p = self.platform(platform)?;
        Ok((0..p.devices.len() as u64)
            .map(|d| DeviceHandle((platform.0 << 32) | d))
            .collect())
    }

    fn device_info(&self, device: DeviceHandle) -> ApiResult<DeviceInfo> {
        let d = self.device(device)?;
        Ok(DeviceInfo {
            name: d.name.clone(),
            vendor: d.vendor.clone(),
            device_type: d.device_type,
            max_compute_units: d.compute_units,
            max_clock_frequency: d.clock_mhz,
            max_work_group_size: d.max_work_group_size,
            global_mem_size: d.global_mem_size,
            local_mem_size: d.local_mem_size,
            max_mem_alloc_size: d.max_mem_alloc_size,
            extensions: d.extensions.clone(),
        })
    }

    fn create_context(&self, devices: &[DeviceHandle]) -> ApiResult<ContextHandle> {
        self.check(SimOp::CreateContext)?;
        if devices.is_empty() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        for device in devices {
            self.device(*device)?;
        }
        let mut state = self.state.borrow_mut();
        let id = state.handle();
        state.contexts.insert(id, devices.to_vec());
        state.stats.contexts += 1;
        Ok(ContextHandle(id))
    }

    fn release_context(&self, context: ContextHandle) {
        if self.state.borrow_mut().contexts.remove(&context.0).is_none() {
            tracing::warn!("Releasing unknown context {}", context);
        }
    }

    fn create_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        profiling: bool,
    ) -> ApiResult<QueueHandle> {
        self.check(SimOp::CreateQueue)?;
        let mut state = self.state.borrow_mut();
        let devices = state
            .contexts
            .get(&context.0)
            .ok_or(ApiStatus::INVALID_CONTEXT)?;
        if !devices.contains(&device) {
            return Err(ApiStatus::INVALID_DEVICE);
        }
        let id = state.handle();
        state.queues.insert(id, SimQueue { device, profiling });
        state.stats.queues += 1;
        Ok(QueueHandle(id))
    }

    fn release_queue(&self, queue: QueueHandle) {
        if self.state.borrow_mut().queues.remove(&queue.0).is_none() {
            tracing::warn!("Releasing unknown queue {}", queue);
        }
    }

    fn finish(&self, queue: QueueHandle) -> ApiResult<()> {
        self.check(SimOp::Finish)?;
        let mut state = self.state.borrow_mut();
        state.queue(queue)?;
        state.stats.finishes += 1;
        Ok(())
    }

    fn create_program(&self, context: ContextHandle, source: &str) -> ApiResult<ProgramHandle> {
        self.check(SimOp::CreateProgram)?;
        let mut state = self.state.borrow_mut();
        if !state.contexts.contains_key(&context.0) {
            return Err(ApiStatus::INVALID_CONTEXT);
        }
        if source.is_empty() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        let id = state.handle();
        state.programs.insert(
            id,
            SimProgram {
                source: source.to_string(),
                built: false,
                logs: FxHashMap::default(),
            },
        );
        state.last_source = Some(source.to_string());
        state.last_build_options.clear();
        state.stats.programs += 1;
        Ok(ProgramHandle(id))
    }

    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceHandle,
        options: &str,
    ) -> ApiResult<()> {
        self.check(SimOp::BuildProgram)?;
        self.device(device)?;
        let mut state = self.state.borrow_mut();
        state.stats.builds += 1;
        state.last_build_options.push(options.to_string());
        let p = state
            .programs
            .get_mut(&program.0)
            .ok_or(ApiStatus::INVALID_PROGRAM)?;

        // `#error` lines are the only thing the simulated compiler rejects
        let errors: Vec<String> = p
            .source
            .lines()
            .enumerate()
            .filter(|(_, line)| line.trim_start().starts_with("#error"))
            .map(|(n, line)| format!("<source>:{}: error: {}", n + 1, line.trim()))
            .collect();

        if errors.is_empty() {
            p.logs.insert(device, String::new());
            p.built = true;
            Ok(())
        } else {
            p.logs.insert(device, errors.join("\n"));
            Err(ApiStatus::BUILD_PROGRAM_FAILURE)
        }
    }

    fn build_log(&self, program: ProgramHandle, device: DeviceHandle) -> ApiResult<String> {
        let state = self.state.borrow();
        let p = state
            .programs
            .get(&program.0)
            .ok_or(ApiStatus::INVALID_PROGRAM)?;
        Ok(p.logs.get(&device).cloned().unwrap_or_default())
    }

    fn release_program(&self, program: ProgramHandle) {
        if self.state.borrow_mut().programs.remove(&program.0).is_none() {
            tracing::warn!("Releasing unknown program {}", program);
        }
    }

    fn create_buffer(&self, context: ContextHandle, bytes: usize) -> ApiResult<MemHandle> {
        self.check(SimOp::CreateBuffer)?;
        if bytes == 0 {
            return Err(ApiStatus::INVALID_BUFFER_SIZE);
        }
        let limit = {
            let state = self.state.borrow();
            let devices = state
                .contexts
                .get(&context.0)
                .ok_or(ApiStatus::INVALID_CONTEXT)?;
            devices
                .iter()
                .filter_map(|d| self.device(*d).ok())
                .map(|d| d.max_mem_alloc_size)
                .min()
                .unwrap_or(0)
        };
        if bytes as u64 > limit {
            return Err(ApiStatus::INVALID_BUFFER_SIZE);
        }
        let mut state = self.state.borrow_mut();
        let id = state.handle();
        state.buffers.insert(id, vec![0; bytes]);
        state.stats.buffers_created += 1;
        Ok(MemHandle(id))
    }

    fn release_buffer(&self, buffer: MemHandle) {
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(&buffer.0).is_some() {
            state.stats.buffers_released += 1;
        } else {
            tracing::warn!("Releasing unknown buffer {}", buffer);
        }
    }

    fn enqueue_write(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &[u8],
        _blocking: bool,
    ) -> ApiResult<EventHandle> {
        self.check(SimOp::Write)?;
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue)?;
        let mem = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        let end = offset + data.len();
        if end > mem.len() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        mem[offset..end].copy_from_slice(data);
        state.stats.writes += 1;
        Ok(state.event(q, data.len() as u64))
    }

    fn enqueue_read(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &mut [u8],
        _blocking: bool,
    ) -> ApiResult<EventHandle> {
        self.check(SimOp::Read)?;
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue)?;
        let mem = state
            .buffers
            .get(&buffer.0)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        let end = offset + data.len();
        if end > mem.len() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        data.copy_from_slice(&mem[offset..end]);
        state.stats.reads += 1;
        Ok(state.event(q, data.len() as u64))
    }

    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        bytes: usize,
    ) -> ApiResult<EventHandle> {
        self.check(SimOp::Copy)?;
        if src == dst {
            return Err(ApiStatus::MEM_COPY_OVERLAP);
        }
        let mut state = self.state.borrow_mut();
        let q = state.queue(queue)?;
        let chunk = {
            let from = state
                .buffers
                .get(&src.0)
                .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
            if bytes > from.len() {
                return Err(ApiStatus::INVALID_VALUE);
            }
            from[..bytes].to_vec()
        };
        let to = state
            .buffers
            .get_mut(&dst.0)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        if bytes > to.len() {
            return Err(ApiStatus::INVALID_VALUE);
        }
        to[..bytes].copy_from_slice(&chunk);
        state.stats.copies += 1;
        Ok(state.event(q, bytes as u64))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> ApiResult<KernelHandle> {
        self.check(SimOp::CreateKernel)?;
        let mut state = self.state.borrow_mut();
        let p = state
            .programs
            .get(&program.0)
            .ok_or(ApiStatus::INVALID_PROGRAM)?;
        if !p.built {
            return Err(ApiStatus::INVALID_PROGRAM_EXECUTABLE);
        }
        if !declares_kernel(&p.source, name) {
            return Err(ApiStatus::INVALID_KERNEL_NAME);
        }
        let id = state.handle();
        state.kernels.insert(
            id,
            SimKernel {
                name: name.to_string(),
                args: Vec::new(),
            },
        );
        state.stats.kernels_created += 1;
        Ok(KernelHandle(id))
    }

    fn release_kernel(&self, kernel: KernelHandle) {
        if self.state.borrow_mut().kernels.remove(&kernel.0).is_none() {
            tracing::warn!("Releasing unknown kernel {}", kernel);
        }
    }

    fn kernel_work_group_size(
        &self,
        kernel: KernelHandle,
        device: DeviceHandle,
    ) -> ApiResult<usize> {
        if !self.state.borrow().kernels.contains_key(&kernel.0) {
            return Err(ApiStatus::INVALID_KERNEL);
        }
        Ok(self.device(device)?.max_work_group_size)
    }

    fn set_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        arg: KernelArg<'_>,
    ) -> ApiResult<()> {
        self.check(SimOp::SetKernelArg)?;
        let mut state = self.state.borrow_mut();
        let value = match arg {
            KernelArg::Buffer(mem) => {
                if !state.buffers.contains_key(&mem.0) {
                    return Err(ApiStatus::INVALID_MEM_OBJECT);
                }
                SimArg::Buffer(mem.0)
            }
            KernelArg::Local(0) => return Err(ApiStatus::INVALID_ARG_SIZE),
            KernelArg::Local(bytes) => SimArg::Local(bytes),
            KernelArg::Bytes([]) => return Err(ApiStatus::INVALID_ARG_SIZE),
            KernelArg::Bytes(bytes) => SimArg::Bytes(bytes.to_vec()),
        };
        let k = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or(ApiStatus::INVALID_KERNEL)?;
        let slot = index as usize;
        if k.args.len() <= slot {
            k.args.resize(slot + 1, None);
        }
        k.args[slot] = Some(value);
        state.stats.kernel_args += 1;
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_size: usize,
        local_size: usize,
    ) -> ApiResult<EventHandle> {
        self.check(SimOp::EnqueueKernel)?;
        let (q, name, args) = {
            let state = self.state.borrow();
            let q = state.queue(queue)?;
            let k = state
                .kernels
                .get(&kernel.0)
                .ok_or(ApiStatus::INVALID_KERNEL)?;
            let args: Option<Vec<SimArg>> = k.args.iter().cloned().collect();
            (q, k.name.clone(), args.ok_or(ApiStatus::INVALID_KERNEL_ARGS)?)
        };
        if global_size == 0 {
            return Err(ApiStatus::INVALID_VALUE);
        }
        let max_local = self.device(q.device)?.max_work_group_size;
        if local_size == 0 || local_size > max_local || global_size % local_size != 0 {
            return Err(ApiStatus::INVALID_WORK_GROUP_SIZE);
        }

        let host = self.host_kernels.borrow().get(&name).cloned();
        let mut state = self.state.borrow_mut();
        if let Some(host) = host {
            let mut launch = SimLaunch {
                global_size,
                local_size,
                device: q.device,
                args,
                buffers: &mut state.buffers,
            };
            host(&mut launch)?;
        }
        state.stats.launches += 1;
        Ok(state.event(q, global_size as u64 * 10))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> ApiResult<()> {
        self.check(SimOp::Wait)?;
        let mut state = self.state.borrow_mut();
        if events.iter().any(|e| !state.events.contains_key(&e.0)) {
            return Err(ApiStatus::INVALID_EVENT);
        }
        state.stats.waits += 1;
        Ok(())
    }

    fn event_profile(&self, event: EventHandle) -> ApiResult<(u64, u64)> {
        let state = self.state.borrow();
        let e = state.events.get(&event.0).ok_or(ApiStatus::INVALID_EVENT)?;
        if !e.profiling {
            return Err(ApiStatus::PROFILING_INFO_NOT_AVAILABLE);
        }
        Ok((e.start, e.end))
    }

    fn release_event(&self, event: EventHandle) {
        self.state.borrow_mut().events.remove(&event.0);
    }
}
