use anyhow::{Result, anyhow, bail};
use colored::*;
use meshprov_core::MeshSession;
use meshprov_core::aci::EventKind;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::output::{OutputFormat, print_events, print_nodes, print_report, print_uuids};
use crate::utils::{parse_u16, parse_uuid, print_error, print_info, print_success, spinner};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellCommand {
    Help,
    ScanStart,
    ScanStop,
    Devices,
    Provision(DeviceRef),
    Nodes,
    Publish([u16; 4]),
    Subscribe([u16; 4]),
    Unprovision(u16),
    Events,
    ClearEvents,
    FilterAdd(Vec<u8>),
    FilterEnable,
    FilterDisable,
    FilterShow,
    Quit,
}

/// A device picked by its position in the device list or by UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceRef {
    Index(usize),
    Uuid([u8; 16]),
}

fn print_help() {
    let commands = [
        ("scan start | scan stop", "scan for unprovisioned devices"),
        ("devices", "list unprovisioned devices"),
        ("provision <index|uuid>", "provision a device and configure it"),
        ("nodes", "list provisioned nodes"),
        ("publish <node> <element> <model> <address>", "set a client's publish address"),
        ("subscribe <node> <element> <model> <address>", "set a server's subscribe address"),
        ("unprovision <node>", "reset a node and forget it"),
        ("events [clear]", "show or clear captured events"),
        ("filter add <event>... | enable | disable | show", "suppress events by name or opcode"),
        ("quit", "leave the shell"),
    ];
    for (usage, what) in commands {
        println!("  {:<50} {what}", usage.bold());
    }
}

fn four_numbers(args: &[&str]) -> Result<[u16; 4]> {
    if args.len() != 4 {
        bail!("expected <node> <element> <model> <address>");
    }
    let mut values = [0u16; 4];
    for (value, arg) in values.iter_mut().zip(args) {
        *value = parse_u16(arg).map_err(|e| anyhow!(e))?;
    }
    Ok(values)
}

fn parse_line(line: &str) -> Result<Option<ShellCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(None);
    };

    let command = match (head, args) {
        ("help" | "?", _) => ShellCommand::Help,
        ("scan", ["start"]) => ShellCommand::ScanStart,
        ("scan", ["stop"]) => ShellCommand::ScanStop,
        ("devices", []) => ShellCommand::Devices,
        ("provision", [device]) => ShellCommand::Provision(match device.parse::<usize>() {
            Ok(index) => DeviceRef::Index(index),
            Err(_) => DeviceRef::Uuid(parse_uuid(device)?),
        }),
        ("nodes", []) => ShellCommand::Nodes,
        ("publish", args) => ShellCommand::Publish(four_numbers(args)?),
        ("subscribe", args) => ShellCommand::Subscribe(four_numbers(args)?),
        ("unprovision", [node]) => {
            ShellCommand::Unprovision(parse_u16(node).map_err(|e| anyhow!(e))?)
        }
        ("events", []) => ShellCommand::Events,
        ("events", ["clear"]) => ShellCommand::ClearEvents,
        ("filter", ["enable"]) => ShellCommand::FilterEnable,
        ("filter", ["disable"]) => ShellCommand::FilterDisable,
        ("filter", ["show"]) => ShellCommand::FilterShow,
        ("filter", ["add", events @ ..]) if !events.is_empty() => {
            let opcodes = events
                .iter()
                .map(|e| EventKind::parse_opcode(e).ok_or_else(|| anyhow!("unknown event '{e}'")))
                .collect::<Result<Vec<_>>>()?;
            ShellCommand::FilterAdd(opcodes)
        }
        ("quit" | "exit", []) => ShellCommand::Quit,
        _ => bail!("unrecognized command '{line}', try 'help'"),
    };
    Ok(Some(command))
}

pub async fn handle_shell(session: Arc<MeshSession>, format: OutputFormat) -> Result<()> {
    print_info("Type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "meshprov>".cyan().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                print_error(&e.to_string());
                continue;
            }
        };
        if command == ShellCommand::Quit {
            break;
        }
        if let Err(e) = run(&session, command, format).await {
            print_error(&format!("{e:#}"));
        }
    }
    Ok(())
}

async fn run(session: &MeshSession, command: ShellCommand, format: OutputFormat) -> Result<()> {
    match command {
        ShellCommand::Help => print_help(),
        ShellCommand::ScanStart => session.start_scan()?,
        ShellCommand::ScanStop => session.stop_scan()?,
        ShellCommand::Devices => print_uuids(&session.unprovisioned_devices(), format),
        ShellCommand::Provision(device) => {
            let uuid = match device {
                DeviceRef::Uuid(uuid) => uuid,
                DeviceRef::Index(index) => session
                    .unprovisioned_devices()
                    .get(index)
                    .copied()
                    .ok_or_else(|| anyhow!("Invalid index."))?,
            };
            let progress = spinner(format!("Provisioning {}", hex::encode(uuid)));
            let report = session.provision(uuid).await;
            progress.finish_and_clear();
            print_report(&report?, format);
        }
        ShellCommand::Nodes => print_nodes(&session.nodes(), format),
        ShellCommand::Publish([node, element, model, address]) => {
            session
                .client_set_publish(node, element, model, address)
                .await?;
            print_success("Publication set");
        }
        ShellCommand::Subscribe([node, element, model, address]) => {
            session
                .server_set_subscribe(node, element, model, address)
                .await?;
            print_success("Subscription set");
        }
        ShellCommand::Unprovision(node) => {
            session.unprovision(node).await?;
            print_success(&format!("Unprovisioned {node:#06x}"));
        }
        ShellCommand::Events => print_events(&session.events(), format),
        ShellCommand::ClearEvents => session.clear_events(),
        ShellCommand::FilterAdd(opcodes) => session.event_filter_add(opcodes),
        ShellCommand::FilterEnable => session.event_filter_enable(),
        ShellCommand::FilterDisable => session.event_filter_disable(),
        ShellCommand::FilterShow => {
            let names: Vec<String> = session
                .event_filter()
                .into_iter()
                .map(|op| match EventKind::from_opcode(op) {
                    Some(kind) => format!("{kind} ({op:#04x})"),
                    None => format!("{op:#04x}"),
                })
                .collect();
            println!("{}", names.join(", "));
        }
        ShellCommand::Quit => {}
    }
    Ok(())
}
