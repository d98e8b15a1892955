//! Named, typed storage addressable through semantics
//!
//! The four variable kinds form a closed set, so they are one enum with the
//! per-kind behavior (allocate, release, bind as kernel argument, per-device
//! element count) dispatched by `match`:
//!
//! | Kind | Lives on | Bound as |
//! |---|---|---|
//! | [`VariableKind::GlobalBuffer`] | device, optionally split across devices | memory object |
//! | [`VariableKind::LocalBuffer`] | device local memory, sized at launch | local size |
//! | [`VariableKind::KernelArgument`] | host, re-sent every launch | raw bytes |
//! | [`VariableKind::ProgramConstant`] | host, rendered into the source | not bound |

pub mod global;

pub use global::{BufferMut, GlobalBuffer, Partition, split_partitions};

use crate::api::{ComputeApi, KernelArg, KernelHandle};
use crate::error::{ApiResultExt, Result, RuntimeError, fail};
use crate::link::DeviceLink;
use crate::types::DataType;
use id_arena::Id;
use std::fmt;
use std::rc::Rc;

/// Handle of a variable inside its program
pub type VariableId = Id<Variable>;

/// Semantics containing this marker size local memory from the launch
pub const DYNAMIC_LOCAL_MARKER: &str = "LOCAL_SIZE_";

/// Element type plus element count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub data_type: DataType,
    pub element_count: usize,
}

impl Layout {
    pub fn new(data_type: DataType, element_count: usize) -> Self {
        Self {
            data_type,
            element_count,
        }
    }

    pub fn type_size(&self) -> usize {
        self.data_type.size()
    }

    pub fn memory_size(&self) -> usize {
        self.element_count * self.data_type.size()
    }
}

/// Discriminant of [`VariableKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableClass {
    GlobalBuffer,
    LocalBuffer,
    KernelArgument,
    ProgramConstant,
}

impl fmt::Display for VariableClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VariableClass::GlobalBuffer => "global buffer",
            VariableClass::LocalBuffer => "local buffer",
            VariableClass::KernelArgument => "kernel argument",
            VariableClass::ProgramConstant => "program constant",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum VariableKind {
    GlobalBuffer(GlobalBuffer),
    LocalBuffer,
    /// Host scratch holding the value
    KernelArgument(Vec<u8>),
    /// Host scratch holding the value
    ProgramConstant(Vec<u8>),
}

/// Everything needed to bind one kernel parameter
pub struct BindTarget<'a> {
    pub api: &'a dyn ComputeApi,
    pub kernel: KernelHandle,
    pub index: u32,
    /// Semantic of the parameter being bound
    pub semantic: &'a str,
    /// Slot of the device the launch targets
    pub device: usize,
    /// Local work size of the launch
    pub local_size: usize,
}

#[derive(Debug)]
pub struct Variable {
    semantics: Vec<String>,
    layout: Layout,
    pending: bool,
    kind: VariableKind,
}

impl Variable {
    /// Device buffer, allocated at the next build
    pub fn global_buffer(data_type: DataType, element_count: usize) -> Self {
        Self {
            semantics: Vec::new(),
            layout: Layout::new(data_type, element_count),
            pending: true,
            kind: VariableKind::GlobalBuffer(GlobalBuffer::default()),
        }
    }

    /// Local memory of `element_count` elements (or launch-sized, see
    /// [`DYNAMIC_LOCAL_MARKER`])
    pub fn local_buffer(data_type: DataType, element_count: usize) -> Self {
        Self {
            semantics: Vec::new(),
            layout: Layout::new(data_type, element_count),
            pending: true,
            kind: VariableKind::LocalBuffer,
        }
    }

    /// Single host value passed by value on every launch
    pub fn kernel_argument(data_type: DataType) -> Self {
        Self {
            semantics: Vec::new(),
            layout: Layout::new(data_type, 1),
            pending: false,
            kind: VariableKind::KernelArgument(vec![0; data_type.size()]),
        }
    }

    /// Single host value inlined into the program source
    pub fn program_constant(data_type: DataType) -> Self {
        Self {
            semantics: Vec::new(),
            layout: Layout::new(data_type, 1),
            pending: false,
            kind: VariableKind::ProgramConstant(vec![0; data_type.size()]),
        }
    }

    pub fn class(&self) -> VariableClass {
        match self.kind {
            VariableKind::GlobalBuffer(_) => VariableClass::GlobalBuffer,
            VariableKind::LocalBuffer => VariableClass::LocalBuffer,
            VariableKind::KernelArgument(_) => VariableClass::KernelArgument,
            VariableKind::ProgramConstant(_) => VariableClass::ProgramConstant,
        }
    }

    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    /// First semantic the variable answers to
    pub fn semantic(&self) -> &str {
        self.semantics.first().map_or("", String::as_str)
    }

    pub fn semantics(&self) -> &[String] {
        &self.semantics
    }

    pub(crate) fn add_semantic(&mut self, semantic: &str) {
        if !self.semantics.iter().any(|s| s == semantic) {
            self.semantics.push(semantic.to_string());
        }
    }

    pub(crate) fn remove_semantic(&mut self, semantic: &str) {
        self.semantics.retain(|s| s != semantic);
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn data_type(&self) -> DataType {
        self.layout.data_type
    }

    pub fn element_count(&self) -> usize {
        self.layout.element_count
    }

    pub fn type_size(&self) -> usize {
        self.layout.type_size()
    }

    pub fn memory_size(&self) -> usize {
        self.layout.memory_size()
    }

    pub fn is_scalar(&self) -> bool {
        self.layout.data_type.is_scalar()
    }

    /// Waiting for allocation at the next build
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn as_buffer(&self) -> Option<&GlobalBuffer> {
        match &self.kind {
            VariableKind::GlobalBuffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Transfer and element access for a global buffer
    pub fn as_buffer_mut(&mut self) -> Option<BufferMut<'_>> {
        let name = self.semantics.first().map_or("", String::as_str);
        match &mut self.kind {
            VariableKind::GlobalBuffer(state) => Some(BufferMut::new(name, self.layout, state)),
            _ => None,
        }
    }

    /// Change type and element count
    ///
    /// Host values are re-created zeroed right away; device storage is marked
    /// pending and re-allocated on the next build. A buffer whose layout
    /// changes loses its device storage and host shadow immediately.
    pub fn set_space(&mut self, data_type: DataType, element_count: usize) {
        let layout = Layout::new(data_type, element_count);
        let changed = layout != self.layout;
        self.layout = layout;
        match &mut self.kind {
            VariableKind::KernelArgument(data) | VariableKind::ProgramConstant(data) => {
                *data = vec![0; layout.memory_size()];
            }
            VariableKind::GlobalBuffer(buffer) => {
                if changed {
                    buffer.release();
                }
                self.pending = true;
            }
            VariableKind::LocalBuffer => self.pending = true,
        }
    }

    /// Create whatever storage the kind needs on `link`
    pub fn allocate(&mut self, link: &Rc<DeviceLink>) -> Result<()> {
        tracing::debug!("Allocating {} `{}`", self.class(), self.semantic());
        match &mut self.kind {
            VariableKind::GlobalBuffer(buffer) => {
                let name = self.semantics.first().map_or("", String::as_str);
                if let Err(err) = buffer.allocate(link, self.layout, name) {
                    // old storage is gone either way
                    self.pending = true;
                    return Err(err);
                }
            }
            VariableKind::LocalBuffer => {
                if link.context().is_none() {
                    return fail(RuntimeError::NoLink {
                        action: "allocate variables",
                    });
                }
            }
            VariableKind::KernelArgument(data) | VariableKind::ProgramConstant(data) => {
                data.resize(self.layout.memory_size(), 0);
            }
        }
        self.pending = false;
        Ok(())
    }

    /// Free storage; buffers become pending again
    pub fn release(&mut self) {
        match &mut self.kind {
            VariableKind::GlobalBuffer(buffer) => {
                buffer.release();
                self.pending = true;
            }
            VariableKind::LocalBuffer => self.pending = true,
            VariableKind::KernelArgument(data) | VariableKind::ProgramConstant(data) => {
                data.clear();
            }
        }
    }

    /// Bind as argument `target.index` of a kernel
    pub fn bind(&self, target: &BindTarget<'_>) -> Result<()> {
        match &self.kind {
            VariableKind::GlobalBuffer(buffer) => buffer.bind(target, self.semantic()),
            VariableKind::LocalBuffer => {
                let bytes = if target.semantic.contains(DYNAMIC_LOCAL_MARKER) {
                    self.type_size() * (target.local_size + 1)
                } else {
                    self.memory_size()
                };
                target
                    .api
                    .set_kernel_arg(target.kernel, target.index, KernelArg::Local(bytes))
                    .or_log("set kernel argument")
            }
            VariableKind::KernelArgument(data) => {
                let Some(value) = data.get(..self.type_size()) else {
                    return fail(RuntimeError::NoHostData {
                        semantic: self.semantic().to_string(),
                    });
                };
                target
                    .api
                    .set_kernel_arg(target.kernel, target.index, KernelArg::Bytes(value))
                    .or_log("set kernel argument")
            }
            // inlined as a #define
            VariableKind::ProgramConstant(_) => Ok(()),
        }
    }

    /// Elements addressable on device slot `device`
    pub fn element_count_on(&self, device: usize) -> usize {
        match &self.kind {
            VariableKind::GlobalBuffer(buffer) => buffer.element_count_on(device, self.layout),
            _ => 0,
        }
    }

    /// Value rendered as a source literal (constants only)
    pub fn literal(&self) -> Option<String> {
        match &self.kind {
            VariableKind::ProgramConstant(data) => data
                .get(..self.type_size())
                .map(|element| self.layout.data_type.literal(element)),
            _ => None,
        }
    }

    fn host_data(&self) -> Result<&[u8]> {
        match &self.kind {
            VariableKind::KernelArgument(data) | VariableKind::ProgramConstant(data)
                if !data.is_empty() =>
            {
                Ok(data)
            }
            _ => fail(self.no_host_data()),
        }
    }

    fn host_data_mut(&mut self) -> Result<&mut Vec<u8>> {
        let err = self.no_host_data();
        match &mut self.kind {
            VariableKind::KernelArgument(data) | VariableKind::ProgramConstant(data)
                if !data.is_empty() =>
            {
                Ok(data)
            }
            _ => fail(err),
        }
    }

    fn no_host_data(&self) -> RuntimeError {
        RuntimeError::NoHostData {
            semantic: self.semantic().to_string(),
        }
    }

    /// Scalar write; buffers go through their host shadow
    pub fn set_scalar(&mut self, index: usize, value: f64) -> Result<()> {
        if let Some(mut buffer) = self.as_buffer_mut() {
            return buffer.set_scalar(index, value);
        }
        let (layout, name) = (self.layout, self.semantic().to_string());
        let data = self.host_data_mut()?;
        write_scalar(layout, &name, data, index, value)
    }

    pub fn get_scalar(&mut self, index: usize) -> Result<f64> {
        if let Some(mut buffer) = self.as_buffer_mut() {
            return buffer.get_scalar(index);
        }
        read_scalar(self.layout, self.semantic(), self.host_data()?, index)
    }

    pub fn set_vector(&mut self, index: usize, value: [f64; 3]) -> Result<()> {
        if let Some(mut buffer) = self.as_buffer_mut() {
            return buffer.set_vector(index, value);
        }
        let (layout, name) = (self.layout, self.semantic().to_string());
        let data = self.host_data_mut()?;
        write_vector(layout, &name, data, index, value)
    }

    pub fn get_vector(&mut self, index: usize) -> Result<[f64; 3]> {
        if let Some(mut buffer) = self.as_buffer_mut() {
            return buffer.get_vector(index);
        }
        read_vector(self.layout, self.semantic(), self.host_data()?, index)
    }
}

fn element<'a>(layout: Layout, name: &str, data: &'a [u8], index: usize) -> Result<&'a [u8]> {
    let size = layout.type_size();
    match data.get(index * size..(index + 1) * size) {
        Some(bytes) if index < layout.element_count => Ok(bytes),
        _ => fail(RuntimeError::OutOfRange {
            semantic: name.to_string(),
            index,
            len: layout.element_count,
        }),
    }
}

fn element_mut<'a>(
    layout: Layout,
    name: &str,
    data: &'a mut [u8],
    index: usize,
) -> Result<&'a mut [u8]> {
    let size = layout.type_size();
    let len = data.len();
    if index >= layout.element_count || (index + 1) * size > len {
        return fail(RuntimeError::OutOfRange {
            semantic: name.to_string(),
            index,
            len: layout.element_count,
        });
    }
    Ok(&mut data[index * size..(index + 1) * size])
}

fn mismatch(layout: Layout, name: &str, access: &'static str) -> RuntimeError {
    RuntimeError::TypeMismatch {
        semantic: name.to_string(),
        data_type: layout.data_type,
        access,
    }
}

pub(crate) fn write_scalar(
    layout: Layout,
    name: &str,
    data: &mut [u8],
    index: usize,
    value: f64,
) -> Result<()> {
    let dst = element_mut(layout, name, data, index)?;
    match layout.data_type.encode_scalar(value, dst) {
        Some(()) => Ok(()),
        None => fail(mismatch(layout, name, "scalar")),
    }
}

pub(crate) fn read_scalar(layout: Layout, name: &str, data: &[u8], index: usize) -> Result<f64> {
    let src = element(layout, name, data, index)?;
    match layout.data_type.decode_scalar(src) {
        Some(value) => Ok(value),
        None => fail(mismatch(layout, name, "scalar")),
    }
}

pub(crate) fn write_vector(
    layout: Layout,
    name: &str,
    data: &mut [u8],
    index: usize,
    value: [f64; 3],
) -> Result<()> {
    let dst = element_mut(layout, name, data, index)?;
    match layout.data_type.encode_vector(value, dst) {
        Some(()) => Ok(()),
        None => fail(mismatch(layout, name, "vector")),
    }
}

pub(crate) fn read_vector(
    layout: Layout,
    name: &str,
    data: &[u8],
    index: usize,
) -> Result<[f64; 3]> {
    let src = element(layout, name, data, index)?;
    match layout.data_type.decode_vector(src) {
        Some(value) => Ok(value),
        None => fail(mismatch(layout, name, "vector")),
    }
}
