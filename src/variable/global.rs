//! Global buffers: device memory with a lazily created host shadow
//!
//! A buffer attached to a multi-device link is split into one partition per
//! device, sized by the devices' performance factors. Host/device
//! synchronization follows two flags:
//!
//! - `host_has_data`: the host shadow is current
//! - `host_data_changed`: the shadow was written and not yet uploaded
//!
//! Writes pull the device contents first when the shadow is stale, uploads
//! are skipped when nothing changed, and downloads are skipped when the
//! shadow is already current (unless forced).

use super::{Layout, read_scalar, read_vector, write_scalar, write_vector, BindTarget};
use crate::api::{EventHandle, KernelArg, MemHandle, QueueHandle};
use crate::error::{ApiResultExt, Result, RuntimeError, fail};
use crate::link::DeviceLink;
use bytemuck::Pod;
use std::rc::Rc;

/// Contiguous element range of a buffer living on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub offset: usize,
    pub len: usize,
    /// `None` for empty partitions
    pub mem: Option<MemHandle>,
}

/// Split `count` elements proportionally to `factors`
///
/// Every partition is rounded up; the last one absorbs the overshoot so the
/// lengths always sum to `count`. Returns `(offset, len)` pairs.
pub fn split_partitions(count: usize, factors: &[f64]) -> Vec<(usize, usize)> {
    let mut parts = Vec::with_capacity(factors.len());
    let mut offset = 0;
    for (i, factor) in factors.iter().enumerate() {
        let remaining = count - offset;
        let len = if i + 1 == factors.len() {
            remaining
        } else {
            ((factor.max(0.0) * count as f64).ceil() as usize).min(remaining)
        };
        parts.push((offset, len));
        offset += len;
    }
    parts
}

#[derive(Debug, Default)]
pub struct GlobalBuffer {
    link: Option<Rc<DeviceLink>>,
    split: bool,
    partitions: Vec<Partition>,
    host: Option<Vec<u8>>,
    host_has_data: bool,
    host_data_changed: bool,
}

impl GlobalBuffer {
    pub fn is_allocated(&self) -> bool {
        self.link.is_some()
    }

    /// Partitioned across the linked devices
    pub fn is_split(&self) -> bool {
        self.split
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn host_has_data(&self) -> bool {
        self.host_has_data
    }

    pub fn host_data_changed(&self) -> bool {
        self.host_data_changed
    }

    /// Host shadow, if one was created
    pub fn host_bytes(&self) -> Option<&[u8]> {
        self.host.as_deref()
    }

    /// Device memory objects in device order
    pub fn mem_handles(&self) -> impl Iterator<Item = MemHandle> + '_ {
        self.partitions.iter().filter_map(|p| p.mem)
    }

    pub(crate) fn element_count_on(&self, device: usize, layout: Layout) -> usize {
        if self.split {
            self.partitions.get(device).map_or(0, |p| p.len)
        } else {
            layout.element_count
        }
    }

    pub(crate) fn allocate(&mut self, link: &Rc<DeviceLink>, layout: Layout, name: &str) -> Result<()> {
        self.release_device();
        let Some(context) = link.context() else {
            return fail(RuntimeError::NoLink {
                action: "allocate variables",
            });
        };
        if layout.element_count == 0 {
            return fail(RuntimeError::EmptyVariable {
                semantic: name.to_string(),
            });
        }

        self.split = link.device_count() > 1;
        let ranges = if self.split {
            split_partitions(layout.element_count, link.performance_factors())
        } else {
            vec![(0, layout.element_count)]
        };

        let api = link.api();
        for (offset, len) in ranges {
            let mem = if len == 0 {
                None
            } else {
                match api
                    .create_buffer(context, len * layout.type_size())
                    .or_log("create buffer")
                {
                    Ok(mem) => Some(mem),
                    Err(err) => {
                        self.release_partitions(link);
                        return Err(err);
                    }
                }
            };
            self.partitions.push(Partition { offset, len, mem });
        }
        self.link = Some(Rc::clone(link));

        // values written before allocation
        let shadow_len = self.host.as_ref().map(Vec::len);
        if shadow_len.is_some_and(|len| len != layout.memory_size()) {
            self.drop_shadow();
        } else if shadow_len.is_some() && self.host_data_changed {
            BufferMut::new(name, layout, self).upload(true)?;
        }
        Ok(())
    }

    fn release_partitions(&mut self, link: &DeviceLink) {
        for mem in self.partitions.drain(..).filter_map(|p| p.mem) {
            link.api().release_buffer(mem);
        }
    }

    fn release_device(&mut self) {
        if let Some(link) = self.link.take() {
            self.release_partitions(&link);
        }
        self.partitions.clear();
        self.split = false;
    }

    fn drop_shadow(&mut self) {
        self.host = None;
        self.host_has_data = false;
        self.host_data_changed = false;
    }

    /// Free every partition and the host shadow
    pub(crate) fn release(&mut self) {
        self.release_device();
        self.drop_shadow();
    }

    pub(crate) fn bind(&self, target: &BindTarget<'_>, name: &str) -> Result<()> {
        if self.partitions.is_empty() {
            return fail(RuntimeError::Unallocated {
                semantic: name.to_string(),
            });
        }
        // unsplit buffers always hand out their single object
        let slot = if self.split { target.device } else { 0 };
        match self.partitions.get(slot).and_then(|p| p.mem) {
            Some(mem) => target
                .api
                .set_kernel_arg(target.kernel, target.index, KernelArg::Buffer(mem))
                .or_log("set kernel argument"),
            None => Ok(()),
        }
    }
}

impl Drop for GlobalBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Mutable view of a global buffer together with its name and layout
pub struct BufferMut<'a> {
    name: &'a str,
    layout: Layout,
    state: &'a mut GlobalBuffer,
}

impl<'a> BufferMut<'a> {
    pub(crate) fn new(name: &'a str, layout: Layout, state: &'a mut GlobalBuffer) -> Self {
        Self {
            name,
            layout,
            state,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn host_has_data(&self) -> bool {
        self.state.host_has_data
    }

    pub fn host_data_changed(&self) -> bool {
        self.state.host_data_changed
    }

    fn unallocated(&self) -> RuntimeError {
        RuntimeError::Unallocated {
            semantic: self.name.to_string(),
        }
    }

    /// Link of a buffer whose partitions cover the current layout
    fn link(&self) -> Result<Rc<DeviceLink>> {
        let covered: usize = self.state.partitions.iter().map(|p| p.len).sum();
        match &self.state.link {
            Some(link) if covered == self.layout.element_count => Ok(Rc::clone(link)),
            _ => fail(self.unallocated()),
        }
    }

    /// Queue serving each partition
    fn queues(&self, link: &DeviceLink) -> Result<Vec<QueueHandle>> {
        let queues: Option<Vec<_>> = (0..self.state.partitions.len())
            .map(|slot| link.queue(if self.state.split { slot } else { 0 }))
            .collect();
        match queues {
            Some(queues) => Ok(queues),
            None => fail(RuntimeError::NoLink {
                action: "transfer data",
            }),
        }
    }

    /// Push the host shadow to the device if it was changed
    pub fn upload(&mut self, wait: bool) -> Result<()> {
        if !self.state.host_data_changed {
            return Ok(());
        }
        let link = self.link()?;
        let Some(host) = self.state.host.as_deref() else {
            return fail(RuntimeError::NoHostData {
                semantic: self.name.to_string(),
            });
        };

        let queues = self.queues(&link)?;
        let size = self.layout.type_size();
        let mut events: Vec<(usize, EventHandle)> = Vec::new();
        for (slot, part) in self.state.partitions.iter().enumerate() {
            let Some(mem) = part.mem else { continue };
            let queue = queues[slot];
            let bytes = &host[part.offset * size..(part.offset + part.len) * size];
            match link.api().enqueue_write(queue, mem, 0, bytes, wait).or_log("write buffer") {
                Ok(event) => events.push((slot, event)),
                Err(err) => {
                    link.discard(&events);
                    return Err(err);
                }
            }
        }
        link.settle(&events, wait)?;

        tracing::trace!("Uploaded `{}`", self.name);
        self.state.host_has_data = false;
        self.state.host_data_changed = false;
        Ok(())
    }

    /// Pull device contents into the host shadow
    ///
    /// Skipped when the shadow is already current, unless `force` is set.
    pub fn download(&mut self, wait: bool, force: bool) -> Result<()> {
        if self.state.host_has_data && !force {
            return Ok(());
        }
        let link = self.link()?;
        let queues = self.queues(&link)?;
        let size = self.layout.type_size();
        let mut host = self
            .state
            .host
            .take()
            .filter(|h| h.len() == self.layout.memory_size())
            .unwrap_or_else(|| vec![0; self.layout.memory_size()]);

        let mut events: Vec<(usize, EventHandle)> = Vec::new();
        let mut result = Ok(());
        for (slot, part) in self.state.partitions.iter().enumerate() {
            let Some(mem) = part.mem else { continue };
            let queue = queues[slot];
            let bytes = &mut host[part.offset * size..(part.offset + part.len) * size];
            match link.api().enqueue_read(queue, mem, 0, bytes, wait).or_log("read buffer") {
                Ok(event) => events.push((slot, event)),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.state.host = Some(host);
        if let Err(err) = result {
            link.discard(&events);
            return Err(err);
        }
        link.settle(&events, wait)?;

        tracing::trace!("Downloaded `{}`", self.name);
        self.state.host_has_data = true;
        self.state.host_data_changed = false;
        Ok(())
    }

    /// Make the host shadow current, creating a zeroed one for buffers that
    /// have no device storage yet
    fn ensure_host(&mut self) -> Result<&mut Vec<u8>> {
        if !self.state.host_has_data {
            if self.state.is_allocated() {
                self.download(true, true)?;
            } else {
                self.state.host = Some(vec![0; self.layout.memory_size()]);
                self.state.host_has_data = true;
            }
        }
        let size = self.layout.memory_size();
        Ok(self.state.host.get_or_insert_with(|| vec![0; size]))
    }

    pub fn set_scalar(&mut self, index: usize, value: f64) -> Result<()> {
        let (layout, name) = (self.layout, self.name);
        write_scalar(layout, name, self.ensure_host()?, index, value)?;
        self.state.host_data_changed = true;
        Ok(())
    }

    pub fn get_scalar(&mut self, index: usize) -> Result<f64> {
        let (layout, name) = (self.layout, self.name);
        read_scalar(layout, name, self.ensure_host()?, index)
    }

    pub fn set_vector(&mut self, index: usize, value: [f64; 3]) -> Result<()> {
        let (layout, name) = (self.layout, self.name);
        write_vector(layout, name, self.ensure_host()?, index, value)?;
        self.state.host_data_changed = true;
        Ok(())
    }

    pub fn get_vector(&mut self, index: usize) -> Result<[f64; 3]> {
        let (layout, name) = (self.layout, self.name);
        read_vector(layout, name, self.ensure_host()?, index)
    }

    /// Replace the whole host shadow
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() != self.layout.memory_size() {
            return fail(RuntimeError::SizeMismatch {
                semantic: self.name.to_string(),
                expected: self.layout.memory_size(),
                found: bytes.len(),
            });
        }
        self.state.host = Some(bytes.to_vec());
        self.state.host_has_data = true;
        self.state.host_data_changed = true;
        Ok(())
    }

    /// Whole contents, downloading first if the shadow is stale
    pub fn read_vec<T: Pod>(&mut self) -> Result<Vec<T>> {
        let name = self.name;
        let total = self.layout.memory_size();
        let host = self.ensure_host()?;
        if total % size_of::<T>() != 0 {
            return fail(RuntimeError::SizeMismatch {
                semantic: name.to_string(),
                expected: total,
                found: size_of::<T>(),
            });
        }
        Ok(host
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Device-to-device copy from buffers with the same partitioning
    ///
    /// Invalidates the host shadow.
    pub fn copy_from(&mut self, src: &[Partition], wait: bool) -> Result<()> {
        let link = self.link()?;
        let size = self.layout.type_size();
        let same_shape = src.len() == self.state.partitions.len()
            && src
                .iter()
                .zip(&self.state.partitions)
                .all(|(s, d)| s.len == d.len);
        if !same_shape {
            let found = src.iter().map(|p| p.len).sum::<usize>() * size;
            return fail(RuntimeError::SizeMismatch {
                semantic: self.name.to_string(),
                expected: self.layout.memory_size(),
                found,
            });
        }

        let queues = self.queues(&link)?;
        let mut events: Vec<(usize, EventHandle)> = Vec::new();
        for (slot, (from, to)) in src.iter().zip(&self.state.partitions).enumerate() {
            let (Some(src_mem), Some(dst_mem)) = (from.mem, to.mem) else {
                continue;
            };
            let queue = queues[slot];
            match link
                .api()
                .enqueue_copy(queue, src_mem, dst_mem, to.len * size)
                .or_log("copy buffer")
            {
                Ok(event) => events.push((slot, event)),
                Err(err) => {
                    link.discard(&events);
                    return Err(err);
                }
            }
        }
        link.settle(&events, wait)?;

        self.state.host_has_data = false;
        self.state.host_data_changed = false;
        Ok(())
    }
}
