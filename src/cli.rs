use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kubeplorer",
    version,
    about = "Headless multi-cluster Kubernetes explorer."
)]
pub struct CliArgs {
    /// Config file (defaults to KUBEPLORER_CONFIG or the usual locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubeconfig file instead of KUBECONFIG / ~/.kube discovery
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long, global = true)]
    pub poll_ms: Option<u64>,

    /// Connectivity probe interval in milliseconds
    #[arg(long, global = true)]
    pub probe_ms: Option<u64>,

    /// Directory for groups, bookmarks and recent kinds
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List kubeconfig contexts with their reachability
    Clusters,
    /// List namespaces of a cluster
    Namespaces { cluster: String },
    /// Show the cluster's resource kinds, grouped
    Kinds { cluster: String },
    /// Poll a kind and print every change until interrupted
    Watch {
        cluster: String,
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(short, long, default_value = "pods")]
        kind: String,
        /// Only show rows matching this text
        #[arg(long)]
        filter: Option<String>,
    },
    /// Resolve owners, descendants and Argo CD applications of an object
    Deps(ObjectArgs),
    /// Print an object as YAML
    Yaml(ObjectArgs),
    /// Create or update an object from a YAML file
    Apply { cluster: String, file: PathBuf },
    /// Delete an object
    Delete(ObjectArgs),
    /// Show events of an object
    Events {
        #[command(flatten)]
        object: ObjectArgs,
        /// Print the JSON list instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print decoded secret values
    Secret {
        cluster: String,
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Print or follow container logs
    Logs {
        #[command(flatten)]
        container: ContainerArgs,
        #[arg(short, long)]
        follow: bool,
    },
    /// Open an interactive shell in a container
    Shell {
        #[command(flatten)]
        container: ContainerArgs,
        /// Comma separated command, defaults to /bin/sh
        #[arg(long)]
        command: Option<String>,
        /// Read one client frame per stdin line instead of raw keystrokes
        #[arg(long)]
        frames: bool,
    },
    /// Run a command without a TTY and print its stdout
    Exec {
        #[command(flatten)]
        container: ContainerArgs,
        /// Comma separated, e.g. curl,localhost:15000/config_dump
        command: String,
    },
    /// Manage bookmarks
    Bookmarks {
        #[command(subcommand)]
        action: Option<BookmarkAction>,
    },
    /// Manage kind groups
    Groups {
        #[command(subcommand)]
        action: Option<GroupAction>,
    },
    /// Send a JSON prompt file (or - for stdin) to the inference endpoint
    Ask { prompt: PathBuf },
}

#[derive(Debug, Clone, Args)]
pub struct ObjectArgs {
    pub cluster: String,
    pub kind: String,
    pub name: String,
    #[arg(short, long)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ContainerArgs {
    pub cluster: String,
    pub pod: String,
    #[arg(short, long)]
    pub namespace: Option<String>,
    /// Defaults to the pod's first container
    #[arg(short, long)]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum BookmarkAction {
    List,
    Add {
        cluster: String,
        namespace: String,
        kind: String,
    },
    Remove { id: u64 },
}

#[derive(Debug, Clone, Subcommand)]
pub enum GroupAction {
    List,
    Create {
        name: String,
        kinds: Vec<String>,
    },
    Update {
        name: String,
        #[arg(long)]
        rename: Option<String>,
        kinds: Vec<String>,
    },
    Delete { name: String },
}
