mod build;
mod events;
mod hosts;
mod sync;
#[cfg(all(test, unix))]
mod test_utils;

pub use build::{BuildLog, BuildOrchestrator, BUILD_SUCCEEDED_LINE};
pub use events::{EventStream, StateHub};
pub use hosts::{parse_host_entries, split_host_list, HostMonitor, HostSpec};
pub use sync::{sync_command, sync_workspace, SyncService};
