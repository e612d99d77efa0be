use anyhow::Result;
use clap::{ArgAction, Parser};
use nvmodprobe_core::HostPaths;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

use commands::{Feature, ImexRange, Request};

#[derive(Parser, Debug)]
#[command(name = "nvidia-modprobe", version, disable_version_flag = true)]
#[command(
    about = "Load the NVIDIA kernel modules and create NVIDIA device files",
    long_about = "Creates NVIDIA device files and loads the NVIDIA kernel modules on behalf of \
                  driver components that lack the privileges to do so themselves."
)]
struct Cli {
    /// Create the device file with this minor number (repeatable)
    #[arg(
        short = 'c',
        long = "create-nvidia-device-file",
        value_name = "MINOR-NUMBER",
        allow_negative_numbers = true
    )]
    minors: Vec<i64>,

    /// Load the Unified Memory module and create its device files instead
    #[arg(short = 'u', long)]
    unified_memory: bool,

    /// Load the modeset module and create its device file
    #[arg(short = 'm', long)]
    modeset: bool,

    /// Create the NVSwitch device files for each minor given with -c
    #[arg(short = 's', long)]
    nvswitch: bool,

    /// Create the NVLink control device file
    #[arg(short = 'l', long)]
    nvlink: bool,

    /// Load the vGPU VFIO module and create its device files for each minor given with -c
    #[arg(long)]
    vgpu_vfio: bool,

    /// Create the capability device file described by this /proc file (repeatable)
    #[arg(short = 'f', long = "nvidia-capability-device-file", value_name = "PATH")]
    capability_files: Vec<PathBuf>,

    /// Create the IMEX channel device files for a range of minors
    #[arg(short = 'i', long = "nvidia-imex-channel-device-file", value_name = "START:COUNT")]
    imex_channels: Option<ImexRange>,

    /// Set the kernel's memory auto-onlining policy to online_movable
    #[arg(short = 'a', long)]
    auto_online_movable: bool,

    /// Kernel module instance for multi-module setups
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    module_instance: Option<i64>,

    /// Print the current state as JSON instead of changing anything
    #[arg(long)]
    query: bool,

    /// Report failures in detail
    #[arg(long)]
    verbose: bool,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

impl Cli {
    /// The first requested feature wins, in the order the flags are listed.
    fn request(&self) -> Request {
        let feature = if self.unified_memory {
            Feature::Uvm
        } else if self.modeset {
            Feature::Modeset
        } else if self.nvswitch {
            Feature::NvSwitch
        } else if self.nvlink {
            Feature::NvLink
        } else if self.vgpu_vfio {
            Feature::VgpuVfio
        } else if !self.capability_files.is_empty() {
            Feature::Capabilities(self.capability_files.clone())
        } else if let Some(range) = self.imex_channels {
            Feature::ImexChannels(range)
        } else {
            Feature::Gpu
        };

        Request {
            feature,
            minors: self.minors.clone(),
            module_instance: self.module_instance,
            auto_online_movable: self.auto_online_movable,
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let paths = HostPaths::default();
    let plan = cli.request().plan()?;

    if cli.query {
        commands::query(&plan, &paths)
    } else {
        commands::ensure(&plan, &paths, cli.verbose)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = nvmodprobe_core::init_observability(cli.verbose) {
        eprintln!("nvidia-modprobe: failed to initialize logging: {}", e);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
