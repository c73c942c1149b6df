// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camstream::{
    engine::variant::variant_for,
    format::PixelFormat,
    manager::{ManagerConfig, StreamManager},
    role::StreamRole,
    sim::{VirtualAllocator, VirtualConsumer, VirtualDeviceProvider, VirtualScaler},
};
use clap::Args as ClapArgs;
use serde::Serialize;
use std::sync::Arc;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Resolve a single format (name such as YV12, NV21, BLOB or a 0x raw value)
    #[arg(short, long)]
    format: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoleEntry {
    format: String,
    raw: i32,
    /// Role with no live streams
    idle: String,
    /// Role while a preview stream is live
    with_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_buffers: Option<usize>,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing roles command: {:?}", args);

    let formats: Vec<PixelFormat> = match &args.format {
        Some(name) => vec![name.parse().map_err(CliError::InvalidArgs)?],
        None => PixelFormat::known().to_vec(),
    };

    let idle = virtual_manager();
    let live = virtual_manager();
    let (consumer, _probe) = VirtualConsumer::new();
    live.allocate_stream(
        640,
        480,
        PixelFormat::ImplementationDefined,
        Box::new(consumer),
        false,
    )?;

    let entries: Vec<RoleEntry> = formats
        .iter()
        .map(|&format| {
            let idle_role = idle.resolve_role(format);
            let variant = variant_for(idle_role, format);
            RoleEntry {
                format: format.to_string(),
                raw: format.raw(),
                idle: idle_role.to_string(),
                with_preview: live.resolve_role(format).to_string(),
                delivered_as: variant.as_ref().map(|v| v.pixel_format().to_string()),
                max_buffers: variant.as_ref().map(|v| v.max_buffers()),
            }
        })
        .collect();

    if json {
        let json_str = serde_json::to_string_pretty(&entries)
            .map_err(|e| CliError::General(format!("Failed to serialize JSON: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_roles(&entries);
    }

    if entries
        .iter()
        .all(|e| e.idle == StreamRole::Invalid.to_string())
    {
        return Err(CliError::InvalidArgs(
            "No supported stream role for the requested format".to_string(),
        ));
    }

    Ok(())
}

/// A manager on virtual hardware, only used to resolve roles
fn virtual_manager() -> StreamManager {
    StreamManager::new(
        ManagerConfig::default(),
        Arc::new(VirtualDeviceProvider::new()),
        Arc::new(VirtualAllocator::new()),
        Arc::new(VirtualScaler::new()),
    )
}

fn print_text_roles(entries: &[RoleEntry]) {
    println!(
        "{:<24} {:>6}  {:<10} {:<12} {:<16} {:>7}",
        "FORMAT", "RAW", "IDLE", "WITH PREVIEW", "DELIVERED AS", "BUFFERS"
    );
    for e in entries {
        println!(
            "{:<24} {:>6}  {:<10} {:<12} {:<16} {:>7}",
            e.format,
            e.raw,
            e.idle,
            e.with_preview,
            e.delivered_as.as_deref().unwrap_or("-"),
            e.max_buffers
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
