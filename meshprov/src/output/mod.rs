use comfy_table::{Cell, Table};
use meshprov_core::ProvisioningReport;
use meshprov_core::directory::Node;
use meshprov_core::dispatch::CapturedEvent;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

pub fn print_json<T: Serialize>(data: T) {
    if let Ok(json) = serde_json::to_string_pretty(&data) {
        println!("{json}");
    }
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

fn model_list(node: &Node, element: usize) -> String {
    node.elements[element]
        .models
        .iter()
        .map(|m| match m.company_id {
            Some(company) => format!("{company:#06x}:{id:#06x}", id = m.model_id),
            None => format!("{id:#06x}", id = m.model_id),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn print_nodes(nodes: &[Node], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(nodes),
        OutputFormat::Table => {
            if nodes.is_empty() {
                println!("No provisioned nodes");
                return;
            }
            let mut table = create_table();
            table.set_header(vec!["Address", "UUID", "Element", "Models"]);
            for node in nodes {
                if node.elements.is_empty() {
                    table.add_row(vec![
                        Cell::new(format!("{:#06x}", node.unicast_address)),
                        Cell::new(hex::encode(node.uuid)),
                        Cell::new("-"),
                        Cell::new("composition unknown"),
                    ]);
                }
                for (i, element) in node.elements.iter().enumerate() {
                    table.add_row(vec![
                        Cell::new(format!("{:#06x}", node.element_address(element.index))),
                        Cell::new(if i == 0 { hex::encode(node.uuid) } else { String::new() }),
                        Cell::new(element.index),
                        Cell::new(model_list(node, i)),
                    ]);
                }
            }
            println!("{table}");
        }
    }
}

pub fn print_uuids(uuids: &[[u8; 16]], format: OutputFormat) {
    let encoded: Vec<String> = uuids.iter().map(hex::encode).collect();
    match format {
        OutputFormat::Json => print_json(&encoded),
        OutputFormat::Table => {
            if encoded.is_empty() {
                println!("No unprovisioned devices seen");
                return;
            }
            let mut table = create_table();
            table.set_header(vec!["#", "UUID"]);
            for (i, uuid) in encoded.iter().enumerate() {
                table.add_row(vec![Cell::new(i), Cell::new(uuid)]);
            }
            println!("{table}");
        }
    }
}

pub fn print_events(events: &[CapturedEvent], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(events),
        OutputFormat::Table => {
            if events.is_empty() {
                println!("No events captured");
                return;
            }
            let mut table = create_table();
            table.set_header(vec!["Received", "Event", "Detail"]);
            for captured in events {
                table.add_row(vec![
                    Cell::new(captured.received_at.format("%H:%M:%S%.3f")),
                    Cell::new(&captured.name),
                    Cell::new(serde_json::to_string(&captured.event).unwrap_or_default()),
                ]);
            }
            println!("{table}");
        }
    }
}

pub fn print_report(report: &ProvisioningReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = create_table();
            table.set_header(vec!["Property", "Value"]);
            table.add_row(vec![
                Cell::new("Unicast Address"),
                Cell::new(format!("{:#06x}", report.unicast_address)),
            ]);
            table.add_row(vec![
                Cell::new("Composition Received"),
                Cell::new(report.composition_received),
            ]);
            table.add_row(vec![
                Cell::new("Bound Models"),
                Cell::new(report.bound_models.len()),
            ]);
            if let Some(failure) = &report.failure {
                table.add_row(vec![
                    Cell::new("Failed At"),
                    Cell::new(failure.step.to_string()),
                ]);
                table.add_row(vec![Cell::new("Reason"), Cell::new(&failure.reason)]);
            }
            println!("{table}");
        }
    }
}
