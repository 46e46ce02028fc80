//! devmap CLI
//!
//! Thin command-line front end over the library: drives device lifecycles
//! from table files and reads or writes a table's data in userspace.
//!
//! ```text
//! devmap create table.yaml        # create + load + resume
//! devmap info joined --json
//! devmap read table.yaml --offset 0 --length 4096 --output out.bin
//! devmap remove joined
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use devmap::{
    open_userspace_volume, Access, ControlConfig, DevNo, DeviceMapper, DmFlags, TableFile, Volume,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// devmap - drive Linux device-mapper devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device-mapper control node
    #[arg(long, env = "DM_CONTROL_PATH", default_value = devmap::config::DEFAULT_CONTROL_PATH)]
    control_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the kernel's device-mapper interface version
    Version,

    /// List mapped devices
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show the status of one device
    Info {
        /// Device name
        #[arg(required_unless_present = "devno", conflicts_with = "devno")]
        name: Option<String>,

        /// Look the device up by MAJOR:MINOR instead
        #[arg(long)]
        devno: Option<DevNo>,

        #[arg(long)]
        json: bool,
    },

    /// Create a device from a table file and activate it
    Create {
        table: PathBuf,
    },

    /// Stage a table file as the inactive table of an existing device
    Load {
        name: String,
        table: PathBuf,

        #[arg(long)]
        read_only: bool,
    },

    /// Suspend a device
    Suspend { name: String },

    /// Resume a device, activating any staged table
    Resume { name: String },

    /// Remove a device
    Remove { name: String },

    /// Read mapped data in userspace without creating a device
    Read {
        table: PathBuf,

        /// Byte offset, a multiple of 512
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Bytes to read, a multiple of 512
        #[arg(long)]
        length: usize,

        /// Write data here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Write mapped data in userspace without creating a device
    Write {
        table: PathBuf,

        /// Byte offset, a multiple of 512
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// File holding the data; its length must be a multiple of 512
        #[arg(long)]
        input: PathBuf,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let dm = DeviceMapper::with_config(
        ControlConfig::default().with_control_path(&args.control_path),
    );

    match args.command {
        Cmd::Version => {
            println!("{}", dm.version().context("querying interface version")?);
        }
        Cmd::List { json } => {
            let devices = dm.list().context("listing devices")?;
            if json {
                print_json(&devices)?;
            } else {
                for device in &devices {
                    println!("{}\t({})", device.name, device.devno);
                }
            }
        }
        Cmd::Info { name, devno, json } => {
            let info = match (name, devno) {
                (Some(name), _) => dm.info_by_name(&name),
                (None, Some(devno)) => dm.info_by_devno(devno),
                (None, None) => bail!("either a name or --devno is required"),
            }
            .context("querying device status")?;
            if json {
                print_json(&info)?;
            } else {
                println!("Name:          {}", info.name);
                println!("State:         {}", info.state());
                println!("Read only:     {}", info.is_read_only());
                println!(
                    "Tables:        live {}, inactive {}",
                    info.has_active_table(),
                    info.has_inactive_table()
                );
                println!("Open count:    {}", info.open_count);
                println!("Event number:  {}", info.event_nr);
                println!("Major, minor:  {}, {}", info.devno.major, info.devno.minor);
                println!("Targets:       {}", info.target_count);
                if !info.uuid.is_empty() {
                    println!("UUID:          {}", info.uuid);
                }
            }
        }
        Cmd::Create { table } => {
            let table = TableFile::load(&table)?;
            let uuid = table
                .uuid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            dm.create_and_load(&table.name, &uuid, read_only_flags(table.read_only), &table.targets)
                .with_context(|| format!("creating device '{}'", table.name))?;
            info!(device = %table.name, %uuid, "device active");
            println!("{}", table.name);
        }
        Cmd::Load {
            name,
            table,
            read_only,
        } => {
            let table = TableFile::load(&table)?;
            dm.load(&name, read_only_flags(read_only || table.read_only), &table.targets)
                .with_context(|| format!("loading table into '{}'", name))?;
        }
        Cmd::Suspend { name } => {
            dm.suspend(&name)
                .with_context(|| format!("suspending '{}'", name))?;
        }
        Cmd::Resume { name } => {
            dm.resume(&name)
                .with_context(|| format!("resuming '{}'", name))?;
        }
        Cmd::Remove { name } => {
            dm.remove(&name)
                .with_context(|| format!("removing '{}'", name))?;
        }
        Cmd::Read {
            table,
            offset,
            length,
            output,
        } => {
            let table = TableFile::load(&table)?;
            let mut volume = open_userspace_volume(Access::ReadOnly, 0, &table.targets)?;
            let mut buf = vec![0u8; length];
            let read = volume.read_at(&mut buf, offset);
            volume.close()?;
            let read = read.context("reading mapped data")?;
            if read < length {
                info!(requested = length, read, "short read");
            }
            match output {
                Some(path) => fs::write(&path, &buf[..read])
                    .with_context(|| format!("writing {}", path.display()))?,
                None => io::stdout().lock().write_all(&buf[..read])?,
            }
        }
        Cmd::Write {
            table,
            offset,
            input,
        } => {
            let table = TableFile::load(&table)?;
            let data = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let mut volume = open_userspace_volume(Access::ReadWrite, 0, &table.targets)?;
            let written = volume.write_at(&data, offset);
            volume.close()?;
            let written = written.context("writing mapped data")?;
            if written < data.len() {
                bail!("short write: {} of {} bytes", written, data.len());
            }
        }
    }

    Ok(())
}

fn read_only_flags(read_only: bool) -> DmFlags {
    if read_only {
        DmFlags::READONLY
    } else {
        DmFlags::empty()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so `read` output on stdout stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}
