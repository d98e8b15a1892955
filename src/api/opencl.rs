//! OpenCL backend over the `opencl3` crate
//!
//! Native objects are owned by handle tables keyed by the integers handed out
//! to the runtime. Host transfers are always submitted as blocking: the
//! runtime's slices are only borrowed for the duration of the call.

use super::{
    ApiResult, ApiStatus, ComputeApi, ContextHandle, DeviceHandle, DeviceInfo, DeviceType,
    EventHandle, KernelArg, KernelHandle, MemHandle, PlatformHandle, PlatformInfo, ProgramHandle,
    QueueHandle,
};
use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue};
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, Device};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_device_id};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::ptr;

fn status(err: ClError) -> ApiStatus {
    ApiStatus(err.0)
}

fn device_id(device: DeviceHandle) -> cl_device_id {
    device.0 as usize as cl_device_id
}

struct ClQueue {
    queue: CommandQueue,
    device: DeviceHandle,
}

/// Compute API backed by an installed OpenCL ICD
pub struct OpenClApi {
    platforms: Vec<Platform>,
    next: Cell<u64>,
    contexts: RefCell<FxHashMap<u64, Context>>,
    queues: RefCell<FxHashMap<u64, ClQueue>>,
    programs: RefCell<FxHashMap<u64, Program>>,
    buffers: RefCell<FxHashMap<u64, Buffer<u8>>>,
    kernels: RefCell<FxHashMap<u64, Kernel>>,
    events: RefCell<FxHashMap<u64, Event>>,
}

impl OpenClApi {
    pub fn new() -> ApiResult<Self> {
        let platforms = get_platforms().map_err(status)?;
        Ok(Self {
            platforms,
            next: Cell::new(0),
            contexts: RefCell::new(FxHashMap::default()),
            queues: RefCell::new(FxHashMap::default()),
            programs: RefCell::new(FxHashMap::default()),
            buffers: RefCell::new(FxHashMap::default()),
            kernels: RefCell::new(FxHashMap::default()),
            events: RefCell::new(FxHashMap::default()),
        })
    }

    fn handle(&self) -> u64 {
        let id = self.next.get() + 1;
        self.next.set(id);
        id
    }

    fn platform(&self, platform: PlatformHandle) -> ApiResult<&Platform> {
        platform
            .0
            .checked_sub(1)
            .and_then(|i| self.platforms.get(i as usize))
            .ok_or(ApiStatus::INVALID_PLATFORM)
    }

    fn track(&self, event: Event) -> EventHandle {
        let id = self.handle();
        self.events.borrow_mut().insert(id, event);
        EventHandle(id)
    }
}

impl ComputeApi for OpenClApi {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platform_ids(&self) -> ApiResult<Vec<PlatformHandle>> {
        Ok((1..=self.platforms.len() as u64).map(PlatformHandle).collect())
    }

    fn platform_info(&self, platform: PlatformHandle) -> ApiResult<PlatformInfo> {
        let p = self.platform(platform)?;
        Ok(PlatformInfo {
            name: p.name().map_err(status)?,
            vendor: p.vendor().map_err(status)?,
            version: p.version().map_err(status)?,
        })
    }

    fn device_ids(&self, platform: PlatformHandle) -> ApiResult<Vec<DeviceHandle>> {
        let p = self.platform(platform)?;
        let ids = p.get_devices(CL_DEVICE_TYPE_ALL).map_err(status)?;
        Ok(ids
            .into_iter()
            .map(|id| DeviceHandle(id as usize as u64))
            .collect())
    }

    fn device_info(&self, device: DeviceHandle) -> ApiResult<DeviceInfo> {
        let d = Device::new(device_id(device));
        Ok(DeviceInfo {
            name: d.name().map_err(status)?,
            vendor: d.vendor().map_err(status)?,
            device_type: DeviceType(d.dev_type().map_err(status)?),
            max_compute_units: d.max_compute_units().map_err(status)?,
            max_clock_frequency: d.max_clock_frequency().map_err(status)?,
            max_work_group_size: d.max_work_group_size().map_err(status)?,
            global_mem_size: d.global_mem_size().map_err(status)?,
            local_mem_size: d.local_mem_size().map_err(status)?,
            max_mem_alloc_size: d.max_mem_alloc_size().map_err(status)?,
            extensions: d.extensions().map_err(status)?,
        })
    }

    fn create_context(&self, devices: &[DeviceHandle]) -> ApiResult<ContextHandle> {
        let ids: Vec<cl_device_id> = devices.iter().copied().map(device_id).collect();
        let context =
            Context::from_devices(&ids, &[], None, ptr::null_mut()).map_err(status)?;
        let id = self.handle();
        self.contexts.borrow_mut().insert(id, context);
        Ok(ContextHandle(id))
    }

    fn release_context(&self, context: ContextHandle) {
        // dropping the wrapper releases the native object
        self.contexts.borrow_mut().remove(&context.0);
    }

    fn create_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        profiling: bool,
    ) -> ApiResult<QueueHandle> {
        let contexts = self.contexts.borrow();
        let ctx = contexts.get(&context.0).ok_or(ApiStatus::INVALID_CONTEXT)?;
        let properties = if profiling { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        #[allow(unused_unsafe)]
        let queue = unsafe {
            CommandQueue::create_with_properties(ctx, device_id(device), properties, 0)
        }
        .map_err(status)?;
        let id = self.handle();
        self.queues
            .borrow_mut()
            .insert(id, ClQueue { queue, device });
        Ok(QueueHandle(id))
    }

    fn release_queue(&self, queue: QueueHandle) {
        self.queues.borrow_mut().remove(&queue.0);
    }

    fn finish(&self, queue: QueueHandle) -> ApiResult<()> {
        let queues = self.queues.borrow();
        let q = queues.get(&queue.0).ok_or(ApiStatus::INVALID_COMMAND_QUEUE)?;
        q.queue.finish().map_err(status)
    }

    fn create_program(&self, context: ContextHandle, source: &str) -> ApiResult<ProgramHandle> {
        let contexts = self.contexts.borrow();
        let ctx = contexts.get(&context.0).ok_or(ApiStatus::INVALID_CONTEXT)?;
        let program = Program::create_from_source(ctx, source).map_err(status)?;
        let id = self.handle();
        self.programs.borrow_mut().insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn build_program(
        &self,
        program: ProgramHandle,
        device: DeviceHandle,
        options: &str,
    ) -> ApiResult<()> {
        let mut programs = self.programs.borrow_mut();
        let p = programs
            .get_mut(&program.0)
            .ok_or(ApiStatus::INVALID_PROGRAM)?;
        p.build(&[device_id(device)], options).map_err(status)
    }

    fn build_log(&self, program: ProgramHandle, device: DeviceHandle) -> ApiResult<String> {
        let programs = self.programs.borrow();
        let p = programs.get(&program.0).ok_or(ApiStatus::INVALID_PROGRAM)?;
        p.get_build_log(device_id(device)).map_err(status)
    }

    fn release_program(&self, program: ProgramHandle) {
        self.programs.borrow_mut().remove(&program.0);
    }

    fn create_buffer(&self, context: ContextHandle, bytes: usize) -> ApiResult<MemHandle> {
        let contexts = self.contexts.borrow();
        let ctx = contexts.get(&context.0).ok_or(ApiStatus::INVALID_CONTEXT)?;
        // SAFETY: no host pointer is handed to the driver
        let buffer = unsafe {
            Buffer::<u8>::create(ctx, CL_MEM_READ_WRITE, bytes, ptr::null_mut())
        }
        .map_err(status)?;
        let id = self.handle();
        self.buffers.borrow_mut().insert(id, buffer);
        Ok(MemHandle(id))
    }

    fn release_buffer(&self, buffer: MemHandle) {
        self.buffers.borrow_mut().remove(&buffer.0);
    }

    fn enqueue_write(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &[u8],
        _blocking: bool,
    ) -> ApiResult<EventHandle> {
        let queues = self.queues.borrow();
        let q = queues.get(&queue.0).ok_or(ApiStatus::INVALID_COMMAND_QUEUE)?;
        let mut buffers = self.buffers.borrow_mut();
        let mem = buffers
            .get_mut(&buffer.0)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        // SAFETY: blocking write, `data` outlives the transfer
        let event = unsafe { q.queue.enqueue_write_buffer(mem, CL_BLOCKING, offset, data, &[]) }
            .map_err(status)?;
        Ok(self.track(event))
    }

    fn enqueue_read(
        &self,
        queue: QueueHandle,
        buffer: MemHandle,
        offset: usize,
        data: &mut [u8],
        _blocking: bool,
    ) -> ApiResult<EventHandle> {
        let queues = self.queues.borrow();
        let q = queues.get(&queue.0).ok_or(ApiStatus::INVALID_COMMAND_QUEUE)?;
        let buffers = self.buffers.borrow();
        let mem = buffers.get(&buffer.0).ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        // SAFETY: blocking read, `data` outlives the transfer
        let event = unsafe { q.queue.enqueue_read_buffer(mem, CL_BLOCKING, offset, data, &[]) }
            .map_err(status)?;
        Ok(self.track(event))
    }

    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        bytes: usize,
    ) -> ApiResult<EventHandle> {
        if src == dst {
            return Err(ApiStatus::MEM_COPY_OVERLAP);
        }
        let queues = self.queues.borrow();
        let q = queues.get(&queue.0).ok_or(ApiStatus::INVALID_COMMAND_QUEUE)?;
        let mut buffers = self.buffers.borrow_mut();
        let from = buffers
            .remove(&src.0)
            .ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
        let result = match buffers.get_mut(&dst.0) {
            // SAFETY: both objects stay alive until the copy is enqueued
            Some(to) => unsafe { q.queue.enqueue_copy_buffer(&from, to, 0, 0, bytes, &[]) }
                .map_err(status),
            None => Err(ApiStatus::INVALID_MEM_OBJECT),
        };
        buffers.insert(src.0, from);
        Ok(self.track(result?))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> ApiResult<KernelHandle> {
        let programs = self.programs.borrow();
        let p = programs.get(&program.0).ok_or(ApiStatus::INVALID_PROGRAM)?;
        let kernel = Kernel::create(p, name).map_err(status)?;
        let id = self.handle();
        self.kernels.borrow_mut().insert(id, kernel);
        Ok(KernelHandle(id))
    }

    fn release_kernel(&self, kernel: KernelHandle) {
        self.kernels.borrow_mut().remove(&kernel.0);
    }

    fn kernel_work_group_size(
        &self,
        kernel: KernelHandle,
        device: DeviceHandle,
    ) -> ApiResult<usize> {
        let kernels = self.kernels.borrow();
        let k = kernels.get(&kernel.0).ok_or(ApiStatus::INVALID_KERNEL)?;
        k.get_work_group_size(device_id(device)).map_err(status)
    }

    fn set_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        arg: KernelArg<'_>,
    ) -> ApiResult<()> {
        let kernels = self.kernels.borrow();
        let k = kernels.get(&kernel.0).ok_or(ApiStatus::INVALID_KERNEL)?;

        macro_rules! set_bytes {
            ($bytes:expr, $($n:literal),*) => {
                match $bytes.len() {
                    $($n => {
                        let mut value = [0u8; $n];
                        value.copy_from_slice($bytes);
                        // SAFETY: the value is copied by the driver at bind time
                        unsafe { k.set_arg(index, &value) }
                    })*
                    _ => return Err(ApiStatus::INVALID_ARG_SIZE),
                }
            };
        }

        let result = match arg {
            KernelArg::Buffer(mem) => {
                let buffers = self.buffers.borrow();
                let b = buffers.get(&mem.0).ok_or(ApiStatus::INVALID_MEM_OBJECT)?;
                // SAFETY: the memory object outlives every launch it is bound to
                unsafe { k.set_arg(index, &b.get()) }
            }
            // SAFETY: local memory carries no host data
            KernelArg::Local(bytes) => unsafe { k.set_arg_local_buffer(index, bytes) },
            KernelArg::Bytes(bytes) => set_bytes!(bytes, 1, 2, 4, 8, 16, 32, 64),
        };
        result.map_err(status)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_size: usize,
        local_size: usize,
    ) -> ApiResult<EventHandle> {
        let queues = self.queues.borrow();
        let q = queues.get(&queue.0).ok_or(ApiStatus::INVALID_COMMAND_QUEUE)?;
        let kernels = self.kernels.borrow();
        let k = kernels.get(&kernel.0).ok_or(ApiStatus::INVALID_KERNEL)?;
        let global = [global_size];
        let local = [local_size];
        tracing::trace!("NDRange on {}: {} / {}", q.device, global_size, local_size);
        // SAFETY: size arrays outlive the call, arguments were bound beforehand
        let event = unsafe {
            q.queue.enqueue_nd_range_kernel(
                k.get(),
                1,
                ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                &[],
            )
        }
        .map_err(status)?;
        Ok(self.track(event))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> ApiResult<()> {
        let table = self.events.borrow();
        for handle in events {
            let event = table.get(&handle.0).ok_or(ApiStatus::INVALID_EVENT)?;
            event.wait().map_err(status)?;
        }
        Ok(())
    }

    fn event_profile(&self, event: EventHandle) -> ApiResult<(u64, u64)> {
        let table = self.events.borrow();
        let e = table.get(&event.0).ok_or(ApiStatus::INVALID_EVENT)?;
        let start = e.profiling_command_start().map_err(status)?;
        let end = e.profiling_command_end().map_err(status)?;
        Ok((start, end))
    }

    fn release_event(&self, event: EventHandle) {
        self.events.borrow_mut().remove(&event.0);
    }
}
