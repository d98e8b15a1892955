//! kernlink: compute-resource orchestration over an OpenCL-style API
//!
//! The runtime discovers compute devices, links a set of them into one
//! context, builds programs out of named source fragments and binds kernel
//! parameters to variables through *semantic* names written into the kernel
//! source itself.
//!
//! # Architecture
//!
//! ```text
//! ComputeApi ─► DeviceCatalog ─► DeviceLink ─► CompiledProgram
//!                                                ├─ KernelModule (parsed fragments)
//!                                                └─ Variable (buffers, arguments, constants)
//! ```
//!
//! # Example
//!
//! ```
//! use kernlink::prelude::*;
//! use std::rc::Rc;
//!
//! let catalog = DeviceCatalog::new(Rc::new(SimulatedApi::default()), RuntimeConfig::default());
//! let link = Rc::new(DeviceLink::from_platform(&catalog, None));
//!
//! let mut program = CompiledProgram::new();
//! program.set_link(link)?;
//! program.init_buffer("POS", DataType::Float4, 1024)?;
//! program.init_variable("DT", DataType::Float, HostValue::Scalar(0.001), false)?;
//! program.load_subprogram(
//!     "integrate",
//!     "__kernel void integrate(__global float4* p :POS#, float dt :DT) { }",
//! )?;
//! program.build()?;
//! program.enqueue_subprogram("integrate")?;
//! # Ok::<(), kernlink::RuntimeError>(())
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod link;
pub mod program;
pub mod types;
pub mod variable;

// Re-exports for convenience
pub use catalog::{Device, DeviceCatalog, Platform};
pub use config::{MathOptions, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use link::DeviceLink;
pub use program::{CompiledProgram, KernelModule, Launch};
pub use types::{DataType, HostValue};
pub use variable::{Variable, VariableClass, VariableId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to drive a program
pub mod prelude {
    pub use crate::api::{ComputeApi, DeviceType, SimDevice, SimPlatform, SimulatedApi};
    pub use crate::catalog::{Device, DeviceCatalog, Platform};
    pub use crate::config::{MathOptions, RuntimeConfig};
    pub use crate::error::{Result, RuntimeError};
    pub use crate::link::DeviceLink;
    pub use crate::program::{CompiledProgram, Launch, SemanticBinder, VariableResolver};
    pub use crate::types::{DataType, HostValue};
    pub use crate::variable::{Variable, VariableClass};
}
