//! Compiled programs
//!
//! A [`CompiledProgram`] owns named source fragments ([`KernelModule`]s) and
//! the variables their kernels are bound to. It is either built or not:
//!
//! ```text
//! Unbuilt ── build() ──► Built
//!    ▲                     │
//!    └── load_subprogram / clear_subprograms / set_link / set_optimizations
//! ```
//!
//! Building assembles one source text (constants as `#define`s, then every
//! fragment in load order), compiles it for every linked device, allocates
//! pending variables and creates the kernels.

pub mod module;
pub mod parser;
pub mod registry;

pub use module::{KernelModule, Launch, resolve_local_size};
pub use parser::{KernelSignature, ParsedSource};
pub use registry::{SemanticBinder, SemanticRegistry, VariableResolver};

use crate::api::{ComputeApi, ProgramHandle};
use crate::config::{MathOptions, RuntimeConfig};
use crate::error::{ApiResultExt, Result, RuntimeError, fail};
use crate::link::DeviceLink;
use crate::types::{DataType, HostValue};
use crate::variable::{BufferMut, Variable, VariableClass, VariableId};
use indexmap::IndexMap;
use std::rc::Rc;

/// Launch-sized local memory every program starts with
const DYNAMIC_LOCALS: [(&str, DataType); 6] = [
    ("LOCAL_SIZE_UINT", DataType::Uint),
    ("LOCAL_SIZE_UINT2", DataType::Uint2),
    ("LOCAL_SIZE_UINT4", DataType::Uint4),
    ("LOCAL_SIZE_INT", DataType::Int),
    ("LOCAL_SIZE_INT2", DataType::Int2),
    ("LOCAL_SIZE_INT4", DataType::Int4),
];

/// Program object on the device side
#[derive(Debug)]
struct ProgramObject {
    api: Rc<dyn ComputeApi>,
    handle: ProgramHandle,
}

impl Drop for ProgramObject {
    fn drop(&mut self) {
        self.api.release_program(self.handle);
    }
}

// Fields drop in order: kernels go before the program object they came from.
#[derive(Debug)]
pub struct CompiledProgram {
    modules: IndexMap<String, KernelModule>,
    registry: SemanticRegistry,
    program: Option<ProgramObject>,
    link: Option<Rc<DeviceLink>>,
    math: MathOptions,
    build_options: Vec<String>,
    source: String,
    built: bool,
}

impl Default for CompiledProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl CompiledProgram {
    pub fn new() -> Self {
        let mut program = Self {
            modules: IndexMap::new(),
            registry: SemanticRegistry::new(),
            program: None,
            link: None,
            math: MathOptions::default(),
            build_options: Vec::new(),
            source: String::new(),
            built: false,
        };
        for (semantic, data_type) in DYNAMIC_LOCALS {
            if let Err(err) = program
                .registry
                .register(semantic, Variable::local_buffer(data_type, 0))
            {
                tracing::warn!("{}", err);
            }
        }
        program
    }

    /// Math switches and extra options taken from `config`
    pub fn with_config(config: &RuntimeConfig) -> Self {
        let mut program = Self::new();
        program.math = config.math;
        program.build_options = config.build_options.clone();
        program
    }

    // === Link ===

    /// Attach the devices to build and run on
    ///
    /// Device storage of every variable is released and re-created on the
    /// new link by the next build.
    pub fn set_link(&mut self, link: Rc<DeviceLink>) -> Result<()> {
        tracing::debug!("Setting new link to devices for program");
        if link.device_count() == 0 {
            return fail(RuntimeError::EmptyLink);
        }
        self.unbuild();
        for (_, var) in self.registry.iter_mut() {
            if matches!(
                var.class(),
                VariableClass::GlobalBuffer | VariableClass::LocalBuffer
            ) {
                var.release();
            }
        }
        self.link = Some(link);
        Ok(())
    }

    pub fn link(&self) -> Option<&Rc<DeviceLink>> {
        self.link.as_ref()
    }

    fn require_link(&self, action: &'static str) -> Result<Rc<DeviceLink>> {
        match &self.link {
            Some(link) => Ok(Rc::clone(link)),
            None => fail(RuntimeError::NoLink { action }),
        }
    }

    fn unbuild(&mut self) {
        self.built = false;
        for module in self.modules.values_mut() {
            module.release_kernel();
        }
        self.program = None;
    }

    // === Subprograms ===

    /// Register a named source fragment, replacing one with the same name
    pub fn load_subprogram(&mut self, name: &str, source: &str) -> Result<()> {
        tracing::debug!("Loading subprogram: {}", name);
        let module = KernelModule::new(name, source)?;
        self.unbuild();
        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    pub fn clear_subprograms(&mut self) {
        tracing::debug!("Clearing program source");
        self.unbuild();
        self.modules.clear();
    }

    pub fn subprogram(&self, name: &str) -> Option<&KernelModule> {
        self.modules.get(name)
    }

    /// Fragments in load order
    pub fn subprograms(&self) -> impl Iterator<Item = &KernelModule> + '_ {
        self.modules.values()
    }

    /// Run a kernel-bearing fragment with sizes taken from its variables
    pub fn enqueue_subprogram(&self, name: &str) -> Result<()> {
        self.enqueue_subprogram_with(name, Launch::default())
    }

    pub fn enqueue_subprogram_with(&self, name: &str, launch: Launch) -> Result<()> {
        let Some(module) = self.modules.get(name) else {
            return fail(RuntimeError::UnknownSubprogram {
                name: name.to_string(),
            });
        };
        if !module.is_kernel() {
            return fail(RuntimeError::NotAKernel {
                name: name.to_string(),
            });
        }
        if !self.built {
            return fail(RuntimeError::NotBuilt {
                kernel: module.kernel_name().unwrap_or(name).to_string(),
            });
        }
        let link = self.require_link("run subprogram on")?;
        module.enqueue(&link, &self.registry, launch)
    }

    // === Variables ===

    /// Create or resize the global buffer behind `semantic`
    pub fn init_buffer(
        &mut self,
        semantic: &str,
        data_type: DataType,
        element_count: usize,
    ) -> Result<VariableId> {
        let existing = self
            .registry
            .resolve_id(semantic)
            .filter(|id| self.registry.variable(*id).map(Variable::class) == Some(VariableClass::GlobalBuffer));
        match existing {
            Some(id) => {
                if let Some(var) = self.registry.get_mut(id) {
                    var.set_space(data_type, element_count);
                }
                if self.built {
                    self.allocate_now(id)?;
                }
                Ok(id)
            }
            None => self.register(semantic, Variable::global_buffer(data_type, element_count)),
        }
    }

    /// Create or update the kernel argument (or program constant) behind
    /// `semantic`
    ///
    /// Constants are inlined into the source, so a new constant value is
    /// only seen by kernels after the next build.
    pub fn init_variable(
        &mut self,
        semantic: &str,
        data_type: DataType,
        value: HostValue,
        constant: bool,
    ) -> Result<VariableId> {
        let class = if constant {
            VariableClass::ProgramConstant
        } else {
            VariableClass::KernelArgument
        };
        let existing = self
            .registry
            .resolve_id(semantic)
            .filter(|id| self.registry.variable(*id).map(Variable::class) == Some(class));
        let id = match existing {
            Some(id) => id,
            None => {
                let var = if constant {
                    Variable::program_constant(data_type)
                } else {
                    Variable::kernel_argument(data_type)
                };
                self.register(semantic, var)?
            }
        };
        let Some(var) = self.registry.get_mut(id) else {
            return fail(RuntimeError::UnknownVariable {
                semantic: semantic.to_string(),
            });
        };
        var.set_space(data_type, 1);
        match value {
            HostValue::Scalar(v) => var.set_scalar(0, v)?,
            HostValue::Vector(v) => var.set_vector(0, v)?,
        }
        Ok(id)
    }

    /// Register any variable, allocating it right away on a built program
    pub fn declare_variable(&mut self, semantic: &str, variable: Variable) -> Result<VariableId> {
        self.register(semantic, variable)
    }

    /// Point `semantic` at another variable
    ///
    /// With `auto_update` on a built program, kernels using the semantic are
    /// rebound to the new buffer right away. Returns whether the mapping
    /// changed.
    pub fn connect_semantic(
        &mut self,
        semantic: &str,
        id: VariableId,
        auto_update: bool,
    ) -> Result<bool> {
        if self.registry.variable(id).is_none() {
            return fail(RuntimeError::UnknownVariable {
                semantic: semantic.to_string(),
            });
        }
        let changed = self.registry.connect(semantic, id)?;
        let is_buffer = self.registry.variable(id).map(Variable::class)
            == Some(VariableClass::GlobalBuffer);
        if changed && auto_update && self.built && is_buffer {
            let link = self.require_link("update kernels on")?;
            for module in self.modules.values().filter(|m| m.references(semantic)) {
                tracing::debug!("Rebinding `{}` of {}", semantic, module.name());
                module.set_persistent_arguments(&link, &self.registry)?;
            }
        }
        Ok(changed)
    }

    fn allocate_now(&mut self, id: VariableId) -> Result<()> {
        let link = self.require_link("allocate variables")?;
        if let Some(var) = self.registry.get_mut(id) {
            var.allocate(&link)?;
        }
        let semantics: Vec<String> = self
            .registry
            .variable(id)
            .map(|v| v.semantics().to_vec())
            .unwrap_or_default();
        for module in self
            .modules
            .values()
            .filter(|m| semantics.iter().any(|s| m.references(s)))
        {
            module.set_persistent_arguments(&link, &self.registry)?;
        }
        Ok(())
    }

    pub fn variable(&self, semantic: &str) -> Option<&Variable> {
        self.registry.resolve(semantic)
    }

    pub fn variable_mut(&mut self, semantic: &str) -> Option<&mut Variable> {
        self.registry.resolve_mut(semantic)
    }

    pub fn variable_id(&self, semantic: &str) -> Option<VariableId> {
        self.registry.resolve_id(semantic)
    }

    fn variable_of(&self, semantic: &str, class: VariableClass) -> Option<&Variable> {
        self.variable(semantic).filter(|v| v.class() == class)
    }

    pub fn buffer(&self, semantic: &str) -> Option<&Variable> {
        self.variable_of(semantic, VariableClass::GlobalBuffer)
    }

    pub fn local_buffer(&self, semantic: &str) -> Option<&Variable> {
        self.variable_of(semantic, VariableClass::LocalBuffer)
    }

    /// Host value passed to kernels, either as argument or as constant
    pub fn argument(&self, semantic: &str) -> Option<&Variable> {
        self.variable(semantic).filter(|v| {
            matches!(
                v.class(),
                VariableClass::KernelArgument | VariableClass::ProgramConstant
            )
        })
    }

    pub fn constant(&self, semantic: &str) -> Option<&Variable> {
        self.variable_of(semantic, VariableClass::ProgramConstant)
    }

    /// Semantics and the variables they name, in registration order
    pub fn variables(&self) -> impl Iterator<Item = (&str, &Variable)> + '_ {
        self.registry
            .semantics()
            .filter_map(|(name, id)| self.registry.variable(id).map(|v| (name, v)))
    }

    pub fn registry(&self) -> &SemanticRegistry {
        &self.registry
    }

    fn resolve_mut(&mut self, semantic: &str) -> Result<&mut Variable> {
        match self.registry.resolve_mut(semantic) {
            Some(var) => Ok(var),
            None => fail(RuntimeError::UnknownVariable {
                semantic: semantic.to_string(),
            }),
        }
    }

    /// Transfer access to the global buffer behind `semantic`
    pub fn buffer_mut(&mut self, semantic: &str) -> Result<BufferMut<'_>> {
        let var = self.resolve_mut(semantic)?;
        if var.class() != VariableClass::GlobalBuffer {
            return fail(RuntimeError::NotABuffer {
                semantic: semantic.to_string(),
            });
        }
        match var.as_buffer_mut() {
            Some(buffer) => Ok(buffer),
            None => fail(RuntimeError::NotABuffer {
                semantic: semantic.to_string(),
            }),
        }
    }

    pub fn set_scalar(&mut self, semantic: &str, index: usize, value: f64) -> Result<()> {
        self.resolve_mut(semantic)?.set_scalar(index, value)
    }

    pub fn get_scalar(&mut self, semantic: &str, index: usize) -> Result<f64> {
        self.resolve_mut(semantic)?.get_scalar(index)
    }

    pub fn set_vector(&mut self, semantic: &str, index: usize, value: [f64; 3]) -> Result<()> {
        self.resolve_mut(semantic)?.set_vector(index, value)
    }

    pub fn get_vector(&mut self, semantic: &str, index: usize) -> Result<[f64; 3]> {
        self.resolve_mut(semantic)?.get_vector(index)
    }

    /// Device-to-device copy of `src` into `dst`
    pub fn copy_buffer(&mut self, dst: &str, src: &str, wait: bool) -> Result<()> {
        let partitions = match self.buffer(src).and_then(Variable::as_buffer) {
            Some(buffer) => buffer.partitions().to_vec(),
            None => {
                return fail(RuntimeError::NotABuffer {
                    semantic: src.to_string(),
                });
            }
        };
        self.buffer_mut(dst)?.copy_from(&partitions, wait)
    }

    /// Bytes of storage declared by every variable of the program
    pub fn used_memory_size(&self) -> usize {
        self.registry.iter().map(|(_, v)| v.memory_size()).sum()
    }

    // === Build ===

    pub fn set_optimizations(&mut self, math: MathOptions) {
        self.math = math;
        self.unbuild();
    }

    pub fn math(&self) -> MathOptions {
        self.math
    }

    /// Extra compiler option, used from the next build on
    pub fn add_build_option(&mut self, option: &str) {
        tracing::debug!("Adding build option: {}", option);
        self.build_options.push(option.to_string());
    }

    pub fn clear_build_options(&mut self) {
        tracing::debug!("Clearing build options");
        self.build_options.clear();
    }

    /// Options handed to the compiler before device-class flags
    pub fn build_option_string(&self) -> String {
        let mut options = self.math.flags();
        for option in &self.build_options {
            options.push(' ');
            options.push_str(option);
        }
        options
    }

    /// Source text compiled by the last build
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Constants as `#define`s followed by every fragment in load order
    pub fn assemble_source(&self) -> String {
        let mut source = String::new();
        for (semantic, var) in self.variables() {
            if let Some(literal) = var.literal() {
                source.push_str(&format!("#define {semantic} ({literal})\n"));
            }
        }
        for module in self.modules.values() {
            source.push_str(module.source());
            if !module.source().ends_with('\n') {
                source.push('\n');
            }
        }
        source
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Compile and prepare every kernel; a failed build leaves the program
    /// unbuilt with no kernel or program objects left behind
    pub fn build(&mut self) -> Result<()> {
        tracing::debug!("Building program");
        self.unbuild();
        let link = self.require_link("build program on")?;
        let built = self.build_on(&link);
        if built.is_err() {
            self.unbuild();
        }
        built
    }

    fn build_on(&mut self, link: &Rc<DeviceLink>) -> Result<()> {
        let Some(context) = link.context() else {
            return fail(RuntimeError::EmptyLink);
        };

        self.source = self.assemble_source();
        let api = Rc::clone(link.api());
        let handle = api
            .create_program(context, &self.source)
            .or_log("create program")?;
        self.program = Some(ProgramObject {
            api: Rc::clone(&api),
            handle,
        });
        link.build_program(handle, &self.build_option_string())?;

        for (_, var) in self.registry.iter_mut() {
            if var.is_pending() {
                var.allocate(link)?;
            }
        }
        for module in self.modules.values_mut().filter(|m| m.is_kernel()) {
            module.create_kernel(link, handle, &self.registry)?;
        }

        self.built = true;
        tracing::info!(
            "Program built: {} subprogram(s), {} bytes of variables",
            self.modules.len(),
            self.used_memory_size()
        );
        Ok(())
    }

    /// Block until every linked device is idle
    pub fn finish(&self) -> Result<()> {
        self.require_link("finish work on")?.finish()
    }
}

impl SemanticBinder for CompiledProgram {
    fn register(&mut self, semantic: &str, variable: Variable) -> Result<VariableId> {
        let id = self.registry.register(semantic, variable)?;
        if self.built && self.registry.variable(id).is_some_and(Variable::is_pending) {
            self.allocate_now(id)?;
        }
        Ok(id)
    }

    fn connect(&mut self, semantic: &str, id: VariableId) -> Result<bool> {
        self.connect_semantic(semantic, id, true)
    }
}

impl VariableResolver for CompiledProgram {
    fn resolve_id(&self, semantic: &str) -> Option<VariableId> {
        self.registry.resolve_id(semantic)
    }

    fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.registry.variable(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_program_has_dynamic_locals() {
        let program = CompiledProgram::new();
        for (semantic, data_type) in DYNAMIC_LOCALS {
            let var = program.local_buffer(semantic).unwrap();
            assert_eq!(var.data_type(), data_type);
        }
        assert_eq!(program.used_memory_size(), 0);
        assert!(!program.is_built());
    }

    #[test]
    fn test_build_option_string() {
        let mut program = CompiledProgram::new();
        program.set_optimizations(MathOptions::strict());
        program.add_build_option("-D DIM=2");
        assert_eq!(program.build_option_string(), "-cl-no-signed-zeros -D DIM=2");
        program.clear_build_options();
        assert_eq!(program.build_option_string(), "-cl-no-signed-zeros");
    }

    #[test]
    fn test_assembled_source_defines_constants_first() {
        let mut program = CompiledProgram::new();
        program
            .load_subprogram("k", "__kernel void k(global float* x :X) {}")
            .unwrap();
        program
            .init_variable("H", DataType::Float, HostValue::Scalar(0.25), true)
            .unwrap();
        program
            .init_variable("N", DataType::Uint, HostValue::Scalar(8.0), true)
            .unwrap();
        program
            .init_variable("DT", DataType::Float, HostValue::Scalar(0.1), false)
            .unwrap();
        assert_eq!(
            program.assemble_source(),
            "#define H (0.25)\n#define N (8u)\n__kernel void k(global float* x ) {}\n"
        );
    }

    #[test]
    fn test_init_variable_updates_in_place() {
        let mut program = CompiledProgram::new();
        let first = program
            .init_variable("DT", DataType::Float, HostValue::Scalar(0.1), false)
            .unwrap();
        let second = program
            .init_variable("DT", DataType::Double, HostValue::Scalar(0.5), false)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(program.get_scalar("DT", 0).unwrap(), 0.5);
        assert_eq!(program.argument("DT").unwrap().data_type(), DataType::Double);
    }

    #[test]
    fn test_build_without_link_fails() {
        let mut program = CompiledProgram::new();
        let err = program.build().unwrap_err();
        assert_eq!(
            err,
            RuntimeError::NoLink {
                action: "build program on"
            }
        );
        assert!(!program.is_built());
    }
}
