use super::*;

use std::path::Path;

/// Run an operator script with `cluster old new`. Failures are logged only.
pub async fn run(script: &Path, cluster: &str, old: &Endpoint, new: &Endpoint) {
    let out = tokio::process::Command::new(script)
        .arg(cluster)
        .arg(old.to_string())
        .arg(new.to_string())
        .kill_on_drop(true)
        .output()
        .await;
    match out {
        Ok(o) if o.status.success() => {
            info!("hook {} done", script.display());
        }
        Ok(o) => {
            warn!(
                "hook {} exited with {}: {}",
                script.display(),
                o.status,
                String::from_utf8_lossy(&o.stderr).trim()
            );
        }
        Err(e) => {
            warn!("hook {} failed to start: {e}", script.display());
        }
    }
}
