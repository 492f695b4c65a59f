use anyhow::{Result, bail};

use crate::ipc::sessions;

/// Stops a session by name, or the sole running session if `name` is `None`.
pub fn run(name: Option<&str>) -> Result<()> {
    let Some(info) = sessions::find_session(name) else {
        match name {
            Some(name) => bail!("no running session named '{name}'"),
            None => bail!("no session specified and more than one session is running (or none at all)"),
        }
    };

    println!("Stopping '{}' (pid {})", info.name, info.pid);
    if sessions::stop_session(&info, std::time::Duration::from_secs(3))? {
        println!("Stopped.");
        Ok(())
    } else {
        bail!("session '{}' (pid {}) did not stop; it may need to be killed manually", info.name, info.pid)
    }
}
