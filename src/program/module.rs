//! Named source fragments and their kernels

use super::parser::{self, KernelSignature};
use super::registry::VariableResolver;
use crate::api::{ComputeApi, KernelHandle, ProgramHandle};
use crate::error::{ApiResultExt, Result, RuntimeError, fail};
use crate::link::DeviceLink;
use crate::variable::{BindTarget, Variable, VariableClass};
use std::rc::Rc;

/// Launch dimensions; zero means "work it out"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Launch {
    /// Taken from the parallel semantic's element count when 0
    pub global_size: usize,
    /// Taken from the kernel's workgroup size when 0
    pub local_size: usize,
    /// Wait for the kernel to complete before returning
    pub blocking: bool,
}

impl Launch {
    pub fn sized(global_size: usize, local_size: usize) -> Self {
        Self {
            global_size,
            local_size,
            ..Self::default()
        }
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

/// Largest local size not above `local` that divides `global`
pub fn resolve_local_size(global: usize, local: usize) -> usize {
    let mut local = local.clamp(1, global.max(1));
    while global % local != 0 {
        local -= 1;
    }
    local
}

/// Kernel object of a built program
#[derive(Debug)]
struct CompiledKernel {
    api: Rc<dyn ComputeApi>,
    handle: KernelHandle,
    /// Per linked device, capped by the link
    workgroup_sizes: Vec<usize>,
}

impl Drop for CompiledKernel {
    fn drop(&mut self) {
        self.api.release_kernel(self.handle);
    }
}

/// A named piece of program source, optionally defining one kernel
#[derive(Debug)]
pub struct KernelModule {
    name: String,
    source: String,
    signature: Option<KernelSignature>,
    kernel: Option<CompiledKernel>,
}

impl KernelModule {
    pub fn new(name: &str, source: &str) -> Result<Self> {
        let mut module = Self {
            name: name.to_string(),
            source: String::new(),
            signature: None,
            kernel: None,
        };
        module.set_source(source)?;
        Ok(module)
    }

    /// Replace the source; drops any kernel created from the old one
    pub fn set_source(&mut self, source: &str) -> Result<()> {
        let parsed = parser::parse(&self.name, source)?;
        self.kernel = None;
        self.source = parsed.source;
        self.signature = parsed.kernel;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source with annotations stripped
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_kernel(&self) -> bool {
        self.signature.is_some()
    }

    pub fn kernel_name(&self) -> Option<&str> {
        self.signature.as_ref().map(|s| s.name.as_str())
    }

    pub fn semantics(&self) -> &[String] {
        self.signature.as_ref().map_or(&[], |s| s.semantics.as_slice())
    }

    pub fn semantic(&self, index: usize) -> Option<&str> {
        self.semantics().get(index).map(String::as_str)
    }

    pub fn semantic_count(&self) -> usize {
        self.semantics().len()
    }

    /// Parameter position of `semantic`
    pub fn semantic_index(&self, semantic: &str) -> Option<usize> {
        self.semantics().iter().position(|s| s == semantic)
    }

    pub fn references(&self, semantic: &str) -> bool {
        self.semantic_index(semantic).is_some()
    }

    pub fn parallel_semantic(&self) -> Option<&str> {
        self.signature.as_ref().and_then(|s| s.parallel.as_deref())
    }

    pub fn kernel_handle(&self) -> Option<KernelHandle> {
        self.kernel.as_ref().map(|k| k.handle)
    }

    /// Cached workgroup size for device slot `device`
    pub fn workgroup_size(&self, device: usize) -> Option<usize> {
        self.kernel
            .as_ref()
            .and_then(|k| k.workgroup_sizes.get(device).copied())
    }

    pub(crate) fn release_kernel(&mut self) {
        self.kernel = None;
    }

    fn display_name(&self) -> String {
        self.kernel_name().unwrap_or(&self.name).to_string()
    }

    fn lookup<'r>(&self, resolver: &'r dyn VariableResolver, semantic: &str) -> Result<&'r Variable> {
        match resolver.resolve(semantic) {
            Some(var) => Ok(var),
            None => fail(RuntimeError::UnresolvedSemantic {
                semantic: semantic.to_string(),
                kernel: self.display_name(),
            }),
        }
    }

    /// Create the kernel object, bind its buffers and cache workgroup sizes
    pub(crate) fn create_kernel(
        &mut self,
        link: &DeviceLink,
        program: ProgramHandle,
        resolver: &dyn VariableResolver,
    ) -> Result<()> {
        let Some(signature) = &self.signature else {
            return fail(RuntimeError::NotAKernel {
                name: self.name.clone(),
            });
        };
        tracing::debug!("Creating kernel: {}", signature.name);
        self.kernel = None;

        let api = Rc::clone(link.api());
        let handle = api
            .create_kernel(program, &signature.name)
            .or_log("create kernel")?;
        self.kernel = Some(CompiledKernel {
            api: Rc::clone(&api),
            handle,
            workgroup_sizes: Vec::new(),
        });

        self.set_persistent_arguments(link, resolver)?;

        let mut sizes = Vec::with_capacity(link.device_count());
        for device in link.devices() {
            let size = api
                .kernel_work_group_size(handle, device.handle())
                .or_log("query kernel workgroup size")?;
            sizes.push(size.min(link.workgroup_cap()).max(1));
        }
        if let Some(kernel) = &mut self.kernel {
            kernel.workgroup_sizes = sizes;
        }
        Ok(())
    }

    /// Bind every parameter backed by a global buffer
    ///
    /// Buffer bindings are retained by the kernel object, so this only runs
    /// after kernel creation and when a semantic is pointed at a different
    /// buffer.
    pub(crate) fn set_persistent_arguments(
        &self,
        link: &DeviceLink,
        resolver: &dyn VariableResolver,
    ) -> Result<()> {
        let Some(kernel) = &self.kernel else {
            return Ok(());
        };
        for (index, semantic) in self.semantics().iter().enumerate() {
            let var = self.lookup(resolver, semantic)?;
            if var.class() != VariableClass::GlobalBuffer {
                continue;
            }
            var.bind(&BindTarget {
                api: link.api().as_ref(),
                kernel: kernel.handle,
                index: index as u32,
                semantic,
                device: 0,
                local_size: 0,
            })?;
        }
        Ok(())
    }

    /// Launch on every linked device
    pub(crate) fn enqueue(
        &self,
        link: &DeviceLink,
        resolver: &dyn VariableResolver,
        launch: Launch,
    ) -> Result<()> {
        let Some(kernel) = &self.kernel else {
            return fail(RuntimeError::NotBuilt {
                kernel: self.display_name(),
            });
        };
        if link.device_count() == 0 {
            return fail(RuntimeError::NoLink {
                action: "run subprogram on",
            });
        }
        tracing::trace!("Enqueuing kernel: {}", self.display_name());

        let api = link.api().as_ref();
        let rebind_buffers = link.device_count() > 1;
        let mut events = Vec::with_capacity(link.device_count());
        for (device, queue) in link.queues().iter().enumerate() {
            let global = if launch.global_size > 0 {
                launch.global_size
            } else {
                let Some(parallel) = self.parallel_semantic() else {
                    link.discard(&events);
                    return fail(RuntimeError::NoGlobalSize {
                        kernel: self.display_name(),
                    });
                };
                match self.lookup(resolver, parallel) {
                    Ok(var) => var.element_count_on(device),
                    Err(_) => {
                        link.discard(&events);
                        return fail(RuntimeError::NoGlobalSize {
                            kernel: self.display_name(),
                        });
                    }
                }
            };
            if global == 0 {
                // nothing of this buffer lives on the device
                continue;
            }
            if launch.local_size > global {
                link.discard(&events);
                return fail(RuntimeError::LocalExceedsGlobal {
                    kernel: self.display_name(),
                    local: launch.local_size,
                    global,
                });
            }
            let requested = match launch.local_size {
                0 => self.workgroup_size(device).unwrap_or(1),
                n => n,
            };
            let local = resolve_local_size(global, requested);

            let bound =
                self.bind_arguments(kernel.handle, link, resolver, device, local, rebind_buffers);
            if let Err(err) = bound {
                link.discard(&events);
                return Err(err);
            }
            match api
                .enqueue_kernel(*queue, kernel.handle, global, local)
                .or_log("enqueue kernel")
            {
                Ok(event) => events.push((device, event)),
                Err(err) => {
                    link.discard(&events);
                    return Err(err);
                }
            }
        }
        link.settle(&events, launch.blocking)
    }

    /// Rebind values the kernel object does not retain
    fn bind_arguments(
        &self,
        kernel: KernelHandle,
        link: &DeviceLink,
        resolver: &dyn VariableResolver,
        device: usize,
        local_size: usize,
        rebind_buffers: bool,
    ) -> Result<()> {
        for (index, semantic) in self.semantics().iter().enumerate() {
            let var = self.lookup(resolver, semantic)?;
            if var.class() == VariableClass::GlobalBuffer && !rebind_buffers {
                continue;
            }
            var.bind(&BindTarget {
                api: link.api().as_ref(),
                kernel,
                index: index as u32,
                semantic,
                device,
                local_size,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_size_divides_global() {
        assert_eq!(resolve_local_size(4, 256), 4);
        assert_eq!(resolve_local_size(1000, 256), 250);
        assert_eq!(resolve_local_size(7, 4), 1);
        assert_eq!(resolve_local_size(12, 0), 1);
    }

    #[test]
    fn test_module_without_kernel() {
        let module = KernelModule::new("common", "#define TWO 2\n").unwrap();
        assert!(!module.is_kernel());
        assert_eq!(module.kernel_name(), None);
        assert_eq!(module.semantic_count(), 0);
    }

    #[test]
    fn test_set_source_reparses() {
        let mut module = KernelModule::new("step", "__kernel void a(global float* x :X) {}").unwrap();
        assert_eq!(module.semantic_index("X"), Some(0));
        module
            .set_source("__kernel void b(float dt :DT, global float* y :Y#) {}")
            .unwrap();
        assert_eq!(module.kernel_name(), Some("b"));
        assert_eq!(module.semantic(1), Some("Y"));
        assert_eq!(module.parallel_semantic(), Some("Y"));
        assert!(!module.references("X"));
    }
}
