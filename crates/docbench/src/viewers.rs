//! Short-lived profile viewers started at the end of a session

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Lifetime granted to each started viewer
pub const VIEWER_LIFETIME: Duration = Duration::from_secs(5);

/// Start `viewer <profile>` for every profile, wait [`VIEWER_LIFETIME`] per
/// started viewer, then kill them all.
///
/// Viewers are cosmetic: spawn and kill failures are only logged. Returns the
/// number of viewers that were started.
pub async fn launch_viewers(viewer: &str, profiles: &[PathBuf]) -> usize {
    let mut children: Vec<Child> = Vec::with_capacity(profiles.len());

    for profile in profiles {
        match Command::new(viewer)
            .arg(profile)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => children.push(child),
            Err(e) => tracing::debug!(viewer, profile = %profile.display(), error = %e, "Could not start viewer"),
        }
    }

    if children.is_empty() {
        return 0;
    }

    let wait = VIEWER_LIFETIME * children.len() as u32;
    tracing::info!("Killing {} server in {} secs", viewer, wait.as_secs());
    tokio::time::sleep(wait).await;

    for child in &mut children {
        if let Err(e) = child.kill().await {
            tracing::debug!(viewer, error = %e, "Could not stop viewer");
        }
    }

    children.len()
}
