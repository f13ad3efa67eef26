use std::ffi::OsString;

use anyhow::{Context, Result};
use service_manager::*;
use tracing::info;

const LABEL: &str = "io.gpu-worker.provider";

fn user_manager() -> Result<Box<dyn ServiceManager>> {
    let mut manager =
        <dyn ServiceManager>::native().context("Failed to detect service management platform")?;
    // Not every platform has user-level services; fall back to the default level.
    _ = manager.set_level(ServiceLevel::User);
    Ok(manager)
}

/// Registers `gpu-worker serve` as a user service that starts on login.
pub fn install_service() -> Result<()> {
    let label: ServiceLabel = LABEL.parse()?;
    let manager = user_manager()?;

    manager
        .install(ServiceInstallCtx {
            label: label.clone(),
            program: std::env::current_exe()?,
            args: vec![OsString::from("serve")],
            contents: None,
        })
        .context("Failed to install service")?;
    manager
        .start(ServiceStartCtx { label })
        .context("Failed to start service")?;

    info!(label = LABEL, "service installed");
    Ok(())
}

pub fn uninstall_service() -> Result<()> {
    let label: ServiceLabel = LABEL.parse()?;
    let manager = user_manager()?;

    if let Err(e) = manager.stop(ServiceStopCtx {
        label: label.clone(),
    }) {
        info!("service was not running: {e}");
    }
    manager
        .uninstall(ServiceUninstallCtx { label })
        .context("Failed to uninstall service")?;

    info!(label = LABEL, "service uninstalled");
    Ok(())
}
