//! Compute-API status codes and their human-readable descriptions

use std::fmt;

/// Raw status code returned by a compute-API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiStatus(pub i32);

impl ApiStatus {
    pub const SUCCESS: ApiStatus = ApiStatus(0);
    pub const DEVICE_NOT_FOUND: ApiStatus = ApiStatus(-1);
    pub const DEVICE_NOT_AVAILABLE: ApiStatus = ApiStatus(-2);
    pub const COMPILER_NOT_AVAILABLE: ApiStatus = ApiStatus(-3);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: ApiStatus = ApiStatus(-4);
    pub const OUT_OF_RESOURCES: ApiStatus = ApiStatus(-5);
    pub const OUT_OF_HOST_MEMORY: ApiStatus = ApiStatus(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: ApiStatus = ApiStatus(-7);
    pub const MEM_COPY_OVERLAP: ApiStatus = ApiStatus(-8);
    pub const IMAGE_FORMAT_MISMATCH: ApiStatus = ApiStatus(-9);
    pub const IMAGE_FORMAT_NOT_SUPPORTED: ApiStatus = ApiStatus(-10);
    pub const BUILD_PROGRAM_FAILURE: ApiStatus = ApiStatus(-11);
    pub const MAP_FAILURE: ApiStatus = ApiStatus(-12);
    pub const INVALID_VALUE: ApiStatus = ApiStatus(-30);
    pub const INVALID_DEVICE_TYPE: ApiStatus = ApiStatus(-31);
    pub const INVALID_PLATFORM: ApiStatus = ApiStatus(-32);
    pub const INVALID_DEVICE: ApiStatus = ApiStatus(-33);
    pub const INVALID_CONTEXT: ApiStatus = ApiStatus(-34);
    pub const INVALID_QUEUE_PROPERTIES: ApiStatus = ApiStatus(-35);
    pub const INVALID_COMMAND_QUEUE: ApiStatus = ApiStatus(-36);
    pub const INVALID_HOST_PTR: ApiStatus = ApiStatus(-37);
    pub const INVALID_MEM_OBJECT: ApiStatus = ApiStatus(-38);
    pub const INVALID_IMAGE_FORMAT_DESCRIPTOR: ApiStatus = ApiStatus(-39);
    pub const INVALID_IMAGE_SIZE: ApiStatus = ApiStatus(-40);
    pub const INVALID_SAMPLER: ApiStatus = ApiStatus(-41);
    pub const INVALID_BINARY: ApiStatus = ApiStatus(-42);
    pub const INVALID_BUILD_OPTIONS: ApiStatus = ApiStatus(-43);
    pub const INVALID_PROGRAM: ApiStatus = ApiStatus(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: ApiStatus = ApiStatus(-45);
    pub const INVALID_KERNEL_NAME: ApiStatus = ApiStatus(-46);
    pub const INVALID_KERNEL_DEFINITION: ApiStatus = ApiStatus(-47);
    pub const INVALID_KERNEL: ApiStatus = ApiStatus(-48);
    pub const INVALID_ARG_INDEX: ApiStatus = ApiStatus(-49);
    pub const INVALID_ARG_VALUE: ApiStatus = ApiStatus(-50);
    pub const INVALID_ARG_SIZE: ApiStatus = ApiStatus(-51);
    pub const INVALID_KERNEL_ARGS: ApiStatus = ApiStatus(-52);
    pub const INVALID_WORK_DIMENSION: ApiStatus = ApiStatus(-53);
    pub const INVALID_WORK_GROUP_SIZE: ApiStatus = ApiStatus(-54);
    pub const INVALID_WORK_ITEM_SIZE: ApiStatus = ApiStatus(-55);
    pub const INVALID_GLOBAL_OFFSET: ApiStatus = ApiStatus(-56);
    pub const INVALID_EVENT_WAIT_LIST: ApiStatus = ApiStatus(-57);
    pub const INVALID_EVENT: ApiStatus = ApiStatus(-58);
    pub const INVALID_OPERATION: ApiStatus = ApiStatus(-59);
    pub const INVALID_GL_OBJECT: ApiStatus = ApiStatus(-60);
    pub const INVALID_BUFFER_SIZE: ApiStatus = ApiStatus(-61);
    pub const INVALID_MIP_LEVEL: ApiStatus = ApiStatus(-62);

    pub fn is_success(self) -> bool {
        self == ApiStatus::SUCCESS
    }

    /// Human-readable description from the fixed status table
    pub fn description(self) -> &'static str {
        match self.0 {
            0 => "OpenCL - Success!",
            -1 => "OpenCL - Device not found.",
            -2 => "OpenCL - Device not available",
            -3 => "OpenCL - Compiler not available",
            -4 => "OpenCL - Memory object allocation failure",
            -5 => "OpenCL - Out of resources",
            -6 => "OpenCL - Out of host memory",
            -7 => "OpenCL - Profiling information not available",
            -8 => "OpenCL - Memory copy overlap",
            -9 => "OpenCL - Image format mismatch",
            -10 => "OpenCL - Image format not supported",
            -11 => "OpenCL - Program build failure",
            -12 => "OpenCL - Map failure",
            -30 => "OpenCL - Invalid value",
            -31 => "OpenCL - Invalid device type",
            -32 => "OpenCL - Invalid platform",
            -33 => "OpenCL - Invalid device",
            -34 => "OpenCL - Invalid context",
            -35 => "OpenCL - Invalid queue properties",
            -36 => "OpenCL - Invalid command queue",
            -37 => "OpenCL - Invalid host pointer",
            -38 => "OpenCL - Invalid memory object",
            -39 => "OpenCL - Invalid image format descriptor",
            -40 => "OpenCL - Invalid image size",
            -41 => "OpenCL - Invalid sampler",
            -42 => "OpenCL - Invalid binary",
            -43 => "OpenCL - Invalid build options",
            -44 => "OpenCL - Invalid program",
            -45 => "OpenCL - Invalid program executable",
            -46 => "OpenCL - Invalid kernel name",
            -47 => "OpenCL - Invalid kernel definition",
            -48 => "OpenCL - Invalid kernel",
            -49 => "OpenCL - Invalid argument index",
            -50 => "OpenCL - Invalid argument value",
            -51 => "OpenCL - Invalid argument size",
            -52 => "OpenCL - Invalid kernel arguments",
            -53 => "OpenCL - Invalid work dimension",
            -54 => "OpenCL - Invalid work group size",
            -55 => "OpenCL - Invalid work item size",
            -56 => "OpenCL - Invalid global offset",
            -57 => "OpenCL - Invalid event wait list",
            -58 => "OpenCL - Invalid event",
            -59 => "OpenCL - Invalid operation",
            -60 => "OpenCL - Invalid OpenGL object",
            -61 => "OpenCL - Invalid buffer size",
            -62 => "OpenCL - Invalid mip-map level",
            _ => "OpenCL - Unknown error",
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}

impl std::error::Error for ApiStatus {}
