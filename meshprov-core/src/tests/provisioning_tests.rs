use super::support::{DEVICE_KEY, Harness, composition_message, node_with_models};
use crate::aci::{Command, Event};
use crate::directory::ModelId;
use crate::orchestrator::ProvisioningStep;
use anyhow::{Context, Result};

const UUID: [u8; 16] = [0xC3; 16];

async fn advertise(harness: &Harness, uuid: [u8; 16]) {
    harness
        .device
        .inject(Event::ProvUnprovisionedReceived {
            uuid,
            rssi: -50,
            gatt_supported: false,
        })
        .await;
    harness.settle().await;
}

fn binds(commands: &[Command]) -> Vec<(u16, ModelId)> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::ModelAppBind {
                element_address,
                model,
                ..
            } => Some((*element_address, *model)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_run_completes_and_stores_once() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    advertise(&harness, UUID).await;
    assert_eq!(harness.session.unprovisioned_devices(), vec![UUID]);

    // first address after the local range 0x0001..0x0002
    harness
        .device
        .script_composition(0x0002, composition_message(&[&[0x0000, 0x1000]]));
    let report = harness.session.provision(UUID).await?;

    assert_eq!(report.unicast_address, 0x0002);
    assert!(report.composition_received);
    assert!(report.is_success());
    assert_eq!(harness.store.saves(), 1);

    let node = harness
        .session
        .directory()
        .find(0x0002)
        .context("node not added")?;
    assert_eq!(node.uuid, UUID);
    assert_eq!(node.device_key, DEVICE_KEY);
    assert_eq!(node.elements.len(), 1);
    assert!(harness.session.unprovisioned_devices().is_empty());
    assert!(harness.session.handles().outstanding().is_empty());

    // persisted state includes the composition
    let saved = harness.store.saved.lock().unwrap().clone();
    assert_eq!(saved, vec![node]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_application_models_are_bound() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    advertise(&harness, UUID).await;
    harness
        .device
        .script_composition(0x0002, composition_message(&[&[0x0001, 0x1000, 0x2000]]));

    harness.session.provision(UUID).await?;

    assert_eq!(
        binds(&harness.device.sent()),
        vec![(0x0002, ModelId::sig(0x1000)), (0x0002, ModelId::sig(0x2000))]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_binds_address_each_element() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    advertise(&harness, UUID).await;
    harness.device.script_composition(
        0x0002,
        composition_message(&[&[0x0000, 0x1000], &[0x1002], &[0x0002]]),
    );

    let report = harness.session.provision(UUID).await?;

    assert_eq!(
        binds(&harness.device.sent()),
        vec![(0x0002, ModelId::sig(0x1000)), (0x0003, ModelId::sig(0x1002))]
    );
    assert_eq!(report.bound_models.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_configuration_commands_follow_the_sequence() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    advertise(&harness, UUID).await;
    harness
        .device
        .script_composition(0x0002, composition_message(&[&[0x1000]]));

    harness.session.provision(UUID).await?;

    let names: Vec<String> = harness
        .device
        .sent()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        names,
        vec![
            "provision",
            "devkey_add",
            "addr_publication_add",
            "publish_set",
            "config_appkey_add",
            "composition_data_get",
            "model_app_bind",
            "devkey_delete",
            "addr_publication_remove",
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_still_completes() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    advertise(&harness, UUID).await;

    // no composition scripted: the node never answers
    let report = harness.session.provision(UUID).await?;

    assert!(!report.composition_received);
    let failure = report.failure.context("missing failure")?;
    assert_eq!(failure.step, ProvisioningStep::CompositionFetch);
    assert!(failure.unresponsive);
    assert!(binds(&harness.device.sent()).is_empty());
    assert_eq!(harness.store.saves(), 1);
    assert!(harness.session.handles().outstanding().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unknown_uuid_changes_nothing() -> Result<()> {
    let existing = node_with_models(0x10, 1, &[0x1000]);
    let harness = Harness::new(vec![existing.clone()])?;
    advertise(&harness, UUID).await;

    let err = harness.session.provision([0x99; 16]).await.unwrap_err();
    assert!(matches!(err, crate::MeshError::DeviceNotFound(_)));

    assert!(harness.device.sent().is_empty());
    assert_eq!(harness.session.nodes(), vec![existing]);
    assert_eq!(harness.session.unprovisioned_devices(), vec![UUID]);
    assert_eq!(harness.store.saves(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reprovisioning_replaces_stale_node() -> Result<()> {
    let stale = node_with_models(0x20, 0xC3, &[0x1000]);
    let harness = Harness::new(vec![stale])?;
    advertise(&harness, UUID).await;
    harness
        .device
        .script_composition(0x0002, composition_message(&[&[0x1000]]));

    let report = harness.session.provision(UUID).await?;

    // the stale entry no longer holds the address floor up
    assert_eq!(report.unicast_address, 0x0002);
    let nodes = harness.session.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].unicast_address, 0x0002);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_next_node_gets_next_address() -> Result<()> {
    let harness = Harness::new(vec![node_with_models(0x0002, 1, &[0x1000])])?;
    advertise(&harness, UUID).await;
    harness
        .device
        .script_composition(0x0003, composition_message(&[&[0x1000]]));

    let report = harness.session.provision(UUID).await?;
    assert_eq!(report.unicast_address, 0x0003);
    assert!(report.is_success());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unprovision_resets_and_forgets_node() -> Result<()> {
    let harness = Harness::new(vec![node_with_models(0x10, 1, &[0x1000])])?;

    harness.session.unprovision(0x10).await?;

    let names: Vec<String> = harness
        .device
        .sent()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        names,
        vec![
            "devkey_add",
            "addr_publication_add",
            "publish_set",
            "node_reset",
            "devkey_delete",
            "addr_publication_remove",
        ]
    );
    assert!(harness.session.nodes().is_empty());
    assert_eq!(harness.store.saves(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_filtered_events_are_not_captured() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    harness.session.event_filter_add([0xD2]);

    for event in [
        Event::MeshTxComplete { token: 1 },
        Event::Other {
            opcode: 0x8B,
            payload: vec![1],
        },
        Event::MeshTxComplete { token: 2 },
        Event::Other {
            opcode: 0x8B,
            payload: vec![2],
        },
    ] {
        harness.device.inject(event).await;
    }
    harness.settle().await;

    let captured = harness.session.events();
    assert_eq!(captured.len(), 2);
    assert!(captured.iter().all(|c| c.event.opcode() == 0x8B));

    harness.session.event_filter_disable();
    harness.device.inject(Event::MeshTxComplete { token: 3 }).await;
    harness.settle().await;
    assert_eq!(harness.session.events().len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_completion_adds_no_node() -> Result<()> {
    let harness = Harness::new(Vec::new())?;
    for address in [0x40, 0x50] {
        harness
            .device
            .inject(Event::ProvComplete {
                context_id: 0,
                iv_index: 0,
                net_key_index: 0,
                address,
                device_key: DEVICE_KEY,
            })
            .await;
    }
    harness.settle().await;

    assert!(harness.session.nodes().is_empty());
    assert_eq!(harness.store.saves(), 0);
    assert!(harness.device.sent().is_empty());
    Ok(())
}
