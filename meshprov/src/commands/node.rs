use anyhow::{Context, Result, bail};
use meshprov_core::MeshSession;
use std::time::Duration;

use crate::cli::ModelTarget;
use crate::output::{OutputFormat, print_report, print_uuids};
use crate::utils::{parse_uuid, print_success, print_warning, spinner};

pub async fn handle_scan(
    session: &MeshSession,
    duration: Duration,
    format: OutputFormat,
) -> Result<()> {
    session.start_scan()?;
    let progress = spinner(format!(
        "Scanning for {}",
        humantime::format_duration(duration)
    ));
    tokio::time::sleep(duration).await;
    progress.finish_and_clear();
    session.stop_scan()?;

    print_uuids(&session.unprovisioned_devices(), format);
    Ok(())
}

pub async fn handle_provision(
    session: &MeshSession,
    uuid: &str,
    scan: Duration,
    format: OutputFormat,
) -> Result<()> {
    let uuid = parse_uuid(uuid)?;

    session.start_scan()?;
    let progress = spinner(format!("Waiting for {} to advertise", hex::encode(uuid)));
    let deadline = tokio::time::Instant::now() + scan;
    while !session.unprovisioned_devices().contains(&uuid) {
        if tokio::time::Instant::now() >= deadline {
            progress.finish_and_clear();
            session.stop_scan()?;
            bail!("Device {} not seen while scanning", hex::encode(uuid));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    session.stop_scan()?;

    progress.set_message("Provisioning");
    let report = session.provision(uuid).await;
    progress.finish_and_clear();
    let report = report.context("Provisioning failed")?;

    if report.is_success() {
        print_success(&format!(
            "Provisioned {} at {:#06x}",
            hex::encode(uuid),
            report.unicast_address
        ));
    } else {
        print_warning("Provisioned with failures");
    }
    print_report(&report, format);
    Ok(())
}

pub async fn handle_unprovision(session: &MeshSession, address: u16) -> Result<()> {
    session
        .unprovision(address)
        .await
        .with_context(|| format!("Failed to unprovision {address:#06x}"))?;
    print_success(&format!("Unprovisioned {address:#06x}"));
    Ok(())
}

pub async fn handle_publish(session: &MeshSession, target: ModelTarget) -> Result<()> {
    session
        .client_set_publish(target.node, target.element, target.model_id, target.address)
        .await
        .context("Failed to set publication")?;
    print_success(&format!(
        "Model {:#06x} on {:#06x} publishes to {:#06x}",
        target.model_id,
        target.node.wrapping_add(target.element),
        target.address
    ));
    Ok(())
}

pub async fn handle_subscribe(session: &MeshSession, target: ModelTarget) -> Result<()> {
    session
        .server_set_subscribe(target.node, target.element, target.model_id, target.address)
        .await
        .context("Failed to set subscription")?;
    print_success(&format!(
        "Model {:#06x} on {:#06x} subscribes to {:#06x}",
        target.model_id,
        target.node.wrapping_add(target.element),
        target.address
    ));
    Ok(())
}
