//! kernlink CLI
//!
//! Main entry point for the `klink` command.

use clap::{Parser, Subcommand, ValueEnum};
use kernlink::api::{ComputeApi, DeviceType, SimulatedApi};
use kernlink::{
    CompiledProgram, DataType, DeviceCatalog, DeviceLink, RuntimeConfig, RuntimeError,
};
use miette::Result;
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "klink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect compute devices and run kernel programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime configuration (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Compute backend
    #[arg(long, global = true, value_enum, default_value = "simulated")]
    backend: Backend,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices of the catalog
    Devices {
        #[command(flatten)]
        filter: Filter,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the best device matching the filter
    Best {
        #[command(flatten)]
        filter: Filter,
    },

    /// Add two small buffers on the simulated backend
    Demo,

    /// Show information about the runtime
    Info,
}

#[derive(clap::Args)]
struct Filter {
    /// Device class
    #[arg(short = 't', long = "type", value_enum, default_value = "all")]
    device_type: DeviceKind,

    /// Case-insensitive substring of the device name
    #[arg(short, long, default_value = "")]
    name: String,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
    All,
}

impl From<DeviceKind> for DeviceType {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Cpu => DeviceType::CPU,
            DeviceKind::Gpu => DeviceType::GPU,
            DeviceKind::Accelerator => DeviceType::ACCELERATOR,
            DeviceKind::All => DeviceType::ALL,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-memory devices
    Simulated,
    /// Installed OpenCL platforms
    Opencl,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Devices { filter, json } => {
            devices(&catalog(cli.backend, config)?, &filter, json)
        }
        Commands::Best { filter } => best(&catalog(cli.backend, config)?, &filter),
        Commands::Demo => demo(config),
        Commands::Info => info(),
    }
}

fn backend(backend: Backend) -> Result<Rc<dyn ComputeApi>> {
    match backend {
        Backend::Simulated => Ok(Rc::new(SimulatedApi::default())),
        #[cfg(feature = "opencl")]
        Backend::Opencl => {
            let api = kernlink::api::OpenClApi::new()
                .map_err(|status| RuntimeError::api("initialize OpenCL", status))?;
            Ok(Rc::new(api))
        }
        #[cfg(not(feature = "opencl"))]
        Backend::Opencl => Err(RuntimeError::BackendUnavailable {
            name: "opencl".to_string(),
        }
        .into()),
    }
}

fn catalog(kind: Backend, config: RuntimeConfig) -> Result<DeviceCatalog> {
    Ok(DeviceCatalog::new(backend(kind)?, config))
}

fn devices(catalog: &DeviceCatalog, filter: &Filter, json: bool) -> Result<()> {
    let devices = catalog.filter_devices(filter.device_type.into(), &filter.name);

    if json {
        let list: Vec<_> = devices.iter().map(|d| d.as_ref()).collect();
        let text = serde_json::to_string_pretty(&list).map_err(|e| miette::miette!("{e}"))?;
        println!("{text}");
        return Ok(());
    }

    if devices.is_empty() {
        println!("No matching devices");
        return Ok(());
    }
    for device in &devices {
        println!(
            "[{}] {} ({}, {}): {} CU @ {} MHz, {} MiB",
            device.platform_index(),
            device.name(),
            device.device_type(),
            device.vendor(),
            device.compute_units(),
            device.max_clock_mhz(),
            device.global_mem_size() / (1024 * 1024)
        );
    }
    Ok(())
}

fn best(catalog: &DeviceCatalog, filter: &Filter) -> Result<()> {
    let devices = catalog.filter_devices(filter.device_type.into(), &filter.name);
    match DeviceCatalog::best_device(&devices) {
        Some(device) => {
            println!("{} (performance index {})", device.name(), device.performance_index());
            Ok(())
        }
        None => Err(RuntimeError::NoDevices.into()),
    }
}

fn demo(config: RuntimeConfig) -> Result<()> {
    let api = Rc::new(SimulatedApi::single_gpu());
    api.register_kernel("add", |launch| {
        let a: Vec<f32> = launch.read(0)?;
        let mut b: Vec<f32> = launch.read(1)?;
        for (x, y) in a.iter().zip(b.iter_mut()).take(launch.global_size) {
            *y += x;
        }
        launch.write(1, &b)
    });

    let catalog = DeviceCatalog::new(api, config.clone());
    let link = Rc::new(DeviceLink::from_platform(&catalog, None));

    let mut program = CompiledProgram::with_config(&config);
    program.set_link(link)?;
    program.init_buffer("A", DataType::Float, 4)?;
    program.init_buffer("B", DataType::Float, 4)?;
    program.load_subprogram(
        "add",
        "__kernel void add(__global const float* a :A, __global float* b :B#)\n\
         {\n    size_t i = get_global_id(0);\n    b[i] += a[i];\n}\n",
    )?;
    program.build()?;

    let a = [1.0f32, 2.0, 3.0, 4.0];
    let b = [10.0f32, 20.0, 30.0, 40.0];
    program.buffer_mut("A")?.write_slice(&a)?;
    program.buffer_mut("A")?.upload(true)?;
    program.buffer_mut("B")?.write_slice(&b)?;
    program.buffer_mut("B")?.upload(true)?;

    program.enqueue_subprogram("add")?;
    program.finish()?;

    let mut out = program.buffer_mut("B")?;
    out.download(true, true)?;
    let sum: Vec<f32> = out.read_vec()?;
    println!("A     = {a:?}");
    println!("B     = {b:?}");
    println!("A + B = {sum:?}");
    Ok(())
}

fn info() -> Result<()> {
    println!("kernlink runtime");
    println!("Version: {}", kernlink::VERSION);
    println!();
    println!("Backends:");
    println!("  - simulated (enabled)");
    #[cfg(feature = "opencl")]
    println!("  - OpenCL (enabled)");
    #[cfg(not(feature = "opencl"))]
    println!("  - OpenCL (disabled)");

    Ok(())
}
