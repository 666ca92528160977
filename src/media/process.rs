//! External tools tied to the work that launched them.

use std::io;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `command` to completion, killing the child if `abandon` fires first
///
/// Blocks the calling thread. Inside a runtime this must be a blocking-pool
/// thread; without one a private current-thread runtime drives the child.
pub(crate) fn run_tool(mut command: Command, abandon: &CancellationToken) -> io::Result<Output> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    let program = command.as_std().get_program().to_os_string();
    let run = async {
        tokio::select! {
            output = command.output() => output,
            _ = abandon.cancelled() => {
                debug!("Killing {:?}", program);
                Err(io::Error::new(io::ErrorKind::Interrupted, "abandoned before the tool finished"))
            }
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(run),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(run),
    }
}
