use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "irix-workbench",
    version,
    about = "Mirror a local project to an IRIX host and run remote builds"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "irix-workbench.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Print the ssh/rsync commands instead of running them.
    #[arg(long, default_value_t = false)]
    pub(crate) dry_run: bool,
    /// Comma-separated `name:role` entries for secondary hosts.
    #[arg(long, env = "IRIX_IDE_ADDITIONAL_HOSTS", default_value = "")]
    pub(crate) extra_hosts: String,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Probe every configured host.
    Hosts {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Mirror the project once, or keep mirroring until Ctrl-C.
    Sync {
        #[arg(long, default_value_t = false)]
        watch: bool,
    },
    /// Run the remote build, stream its output, then print its summary.
    Build {
        #[arg(long, default_value = "manual")]
        label: String,
    },
    /// Sync once, then build.
    All {
        #[arg(long, default_value = "manual")]
        label: String,
    },
}
