use anyhow::Result;

use crate::ipc::sessions;

/// Shows the status of one named session, or every session if `name` is `None`.
pub fn run(name: Option<&str>) -> Result<()> {
    match name {
        Some(name) => match sessions::load_session(name) {
            Some(info) if info.is_alive() => {
                println!("{}  running  pid {}  {}:{}  config {}", info.name, info.pid, info.host, info.port, info.config);
            }
            Some(info) => {
                println!("{} not running (stale entry for pid {})", info.name, info.pid);
                println!("Run `capgate stop {}` to clean up.", info.name);
            }
            None => println!("No session named '{name}'"),
        },
        None => {
            let sessions = sessions::list_sessions(false);
            if sessions.is_empty() {
                println!("No sessions running");
                return Ok(());
            }
            for info in sessions {
                println!("{}  running  pid {}  {}:{}  config {}", info.name, info.pid, info.host, info.port, info.config);
            }
        }
    }
    Ok(())
}
