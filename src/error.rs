//! Runtime errors
//!
//! Every failure is logged where it happens and then returned, so callers can
//! either propagate it with `?` or just check `is_ok()`.

use crate::api::ApiStatus;
use crate::types::DataType;
use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum RuntimeError {
    // === Configuration errors ===
    #[error("No link to devices set to {action}")]
    #[diagnostic(
        code(kernlink::no_link),
        help("attach a link with `CompiledProgram::set_link` first")
    )]
    NoLink { action: &'static str },

    #[error("Link isn't connected to any device")]
    #[diagnostic(code(kernlink::empty_link))]
    EmptyLink,

    #[error("No devices to connect to")]
    #[diagnostic(code(kernlink::no_devices))]
    NoDevices,

    #[error("Cannot connect an empty semantic with a variable")]
    #[diagnostic(code(kernlink::empty_semantic))]
    EmptySemantic,

    #[error("Program doesn't contain variable `{semantic}`, needed by kernel `{kernel}`")]
    #[diagnostic(
        code(kernlink::unresolved_semantic),
        help("register the variable with `init_buffer`/`init_variable` before enqueueing")
    )]
    UnresolvedSemantic { semantic: String, kernel: String },

    #[error("Program doesn't contain variable `{semantic}`")]
    #[diagnostic(code(kernlink::unknown_variable))]
    UnknownVariable { semantic: String },

    #[error("Variable `{semantic}` is not a global buffer")]
    #[diagnostic(code(kernlink::not_a_buffer))]
    NotABuffer { semantic: String },

    #[error("Program doesn't contain subprogram `{name}`")]
    #[diagnostic(code(kernlink::unknown_subprogram))]
    UnknownSubprogram { name: String },

    #[error("Cannot run subprogram `{name}` with no kernel function in it")]
    #[diagnostic(code(kernlink::not_a_kernel))]
    NotAKernel { name: String },

    #[error("Kernel declaration in `{name}` has no parameter list")]
    #[diagnostic(code(kernlink::malformed_kernel))]
    MalformedKernel { name: String },

    #[error("Cannot run kernel `{kernel}` of a program that is not built")]
    #[diagnostic(code(kernlink::not_built), help("call `CompiledProgram::build` first"))]
    NotBuilt { kernel: String },

    #[error("Local size {local} of kernel `{kernel}` can't be greater than the global size {global}")]
    #[diagnostic(code(kernlink::launch_size))]
    LocalExceedsGlobal {
        kernel: String,
        local: usize,
        global: usize,
    },

    #[error("Cannot choose global size for kernel `{kernel}`")]
    #[diagnostic(code(kernlink::launch_size))]
    NoGlobalSize { kernel: String },

    // === Variable access errors ===
    #[error("Variable `{semantic}` of type {data_type} cannot be accessed as a {access}")]
    #[diagnostic(code(kernlink::type_mismatch))]
    TypeMismatch {
        semantic: String,
        data_type: DataType,
        access: &'static str,
    },

    #[error("Index {index} out of range for variable `{semantic}` with {len} elements")]
    #[diagnostic(code(kernlink::out_of_range))]
    OutOfRange {
        semantic: String,
        index: usize,
        len: usize,
    },

    #[error("Cannot transfer {found} bytes to variable `{semantic}` of {expected} bytes")]
    #[diagnostic(code(kernlink::size_mismatch))]
    SizeMismatch {
        semantic: String,
        expected: usize,
        found: usize,
    },

    #[error("Variable `{semantic}` has no host-side data")]
    #[diagnostic(code(kernlink::no_host_data))]
    NoHostData { semantic: String },

    #[error("Cannot allocate variable `{semantic}` without elements")]
    #[diagnostic(code(kernlink::empty_variable))]
    EmptyVariable { semantic: String },

    #[error("Cannot use uninitialized buffer `{semantic}`")]
    #[diagnostic(
        code(kernlink::unallocated),
        help("buffers get device memory during `CompiledProgram::build`")
    )]
    Unallocated { semantic: String },

    // === Compute API errors ===
    #[error("{status}")]
    #[diagnostic(code(kernlink::api))]
    Api { op: &'static str, status: ApiStatus },

    #[error("Building program for device `{device}` failed: {status}")]
    #[diagnostic(code(kernlink::build_failed), help("the compiler log was logged at error level"))]
    BuildFailed { device: String, status: ApiStatus },

    // === Setup errors ===
    #[error("Invalid runtime configuration: {message}")]
    #[diagnostic(code(kernlink::config))]
    Config { message: String },

    #[error("Cannot read `{path}`: {message}")]
    #[diagnostic(code(kernlink::io))]
    Io { path: String, message: String },

    #[error("Backend `{name}` is not available in this build")]
    #[diagnostic(code(kernlink::backend), help("rebuild with `--features opencl`"))]
    BackendUnavailable { name: String },
}

impl RuntimeError {
    /// Wrap a failed compute-API call
    pub fn api(op: &'static str, status: ApiStatus) -> Self {
        RuntimeError::Api { op, status }
    }

    /// Compute-API status behind the error, if any
    pub fn status(&self) -> Option<ApiStatus> {
        match self {
            RuntimeError::Api { status, .. } | RuntimeError::BuildFailed { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Log an error at the point of failure and hand it back for propagation
pub(crate) fn fail<T>(err: RuntimeError) -> Result<T> {
    tracing::error!("{}", err);
    Err(err)
}

/// Extension for compute-API results: translate, log, wrap
pub(crate) trait ApiResultExt<T> {
    fn or_log(self, op: &'static str) -> Result<T>;
}

impl<T> ApiResultExt<T> for std::result::Result<T, ApiStatus> {
    fn or_log(self, op: &'static str) -> Result<T> {
        self.or_else(|status| {
            tracing::error!(op, "{}", status);
            Err(RuntimeError::api(op, status))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_uses_status_table() {
        let err = RuntimeError::api("create kernel", ApiStatus::INVALID_KERNEL_NAME);
        assert_eq!(err.to_string(), "OpenCL - Invalid kernel name (-46)");
        assert_eq!(err.status(), Some(ApiStatus::INVALID_KERNEL_NAME));
    }

    #[test]
    fn test_unresolved_semantic_names_both() {
        let err = RuntimeError::UnresolvedSemantic {
            semantic: "VELOCITY".into(),
            kernel: "advect".into(),
        };
        let text = err.to_string();
        assert!(text.contains("VELOCITY"));
        assert!(text.contains("advect"));
    }

    #[test]
    fn test_or_log_wraps_status() {
        let res: std::result::Result<(), ApiStatus> = Err(ApiStatus::OUT_OF_RESOURCES);
        let err = res.or_log("finish").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Api {
                op: "finish",
                status: ApiStatus::OUT_OF_RESOURCES
            }
        );
    }
}
