use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devbox")]
#[command(about = "devbox - GPU development containers with tunneled services")]
pub struct Cli {
    /// Config file path (defaults to devbox.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Working directory state files are resolved against
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the structured result object as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and start a container, publishing its services
    Create {
        /// Container name
        name: String,

        /// Image to create the container from
        #[arg(short, long)]
        image: String,

        /// Root password for ssh (generated when omitted)
        #[arg(long, env = "DEVBOX_ROOT_PASSWORD")]
        password: Option<String>,

        /// Notebook token (generated when omitted)
        #[arg(long, env = "DEVBOX_NOTEBOOK_TOKEN")]
        token: Option<String>,

        /// Memory limit, e.g. 16g
        #[arg(long)]
        memory: Option<String>,

        /// Host CPUs to pin to, e.g. 0-3
        #[arg(long)]
        cpuset: Option<String>,

        /// CPU quota, e.g. 4 or 2.5
        #[arg(long)]
        cpus: Option<String>,

        /// Shared memory size, e.g. 8g
        #[arg(long)]
        shm_size: Option<String>,

        /// Attach GPUs
        #[arg(long, conflicts_with = "no_gpu")]
        gpu: bool,

        /// Do not attach GPUs
        #[arg(long)]
        no_gpu: bool,

        /// Volume to mount, as SOURCE:TARGET[:ro] (can be repeated)
        #[arg(short = 'v', long = "volume", value_name = "SOURCE:TARGET[:ro]")]
        volumes: Vec<String>,
    },
    /// Start a stopped container on fresh public ports
    Start {
        name: String,
    },
    /// Tear down tunnels and stop a container
    Stop {
        name: String,

        /// Commit the stopped container to a snapshot
        #[arg(short, long)]
        keep_history: bool,

        /// Snapshot commit message
        #[arg(short, long, requires = "keep_history")]
        message: Option<String>,
    },
    /// Delete a container
    Delete {
        name: String,

        /// Also delete its snapshot history and images
        #[arg(long)]
        remove_snapshots: bool,
    },
    /// Show container status, refreshed against the runtime
    Status {
        name: String,
    },
    /// List containers
    List,
    /// Snapshot a stopped container
    Snapshot {
        name: String,

        /// Commit message
        #[arg(short, long, default_value = "Manual snapshot")]
        message: String,
    },
    /// List snapshots, newest first
    Snapshots {
        /// Container name (defaults to all containers)
        name: Option<String>,
    },
    /// Re-create a container from a snapshot and start it
    Restore {
        name: String,

        /// Version tag or image reference (defaults to the newest snapshot)
        tag: Option<String>,
    },
    /// Show public port pool usage
    Ports,
    /// Refresh every container against the runtime
    Reconcile,
    /// Validate the configuration file
    Validate,
}
