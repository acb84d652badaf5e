use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Where a received message came from.
#[derive(Debug, Clone, Copy)]
pub struct MessageSource<'a> {
    pub connection_id: u64,
    pub channel: &'a str,
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    event: &'static str,
    connection_id: u64,
    channel: &'a str,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_message(source: MessageSource<'_>, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                event: "message-received",
                connection_id: source.connection_id,
                channel: source.channel,
                payload_size: payload.len(),
                payload: payload_preview(payload),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CONNECTION", "CHANNEL", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    source.connection_id.to_string(),
                    source.channel.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "conn={} channel={} size={} payload={}",
                source.connection_id,
                source.channel,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

/// Result of probing a server with `info`.
#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub pipe: String,
    pub address: String,
    pub channel: String,
    pub connection_id: u64,
    pub connected: bool,
    pub peer_uid: Option<u32>,
    pub peer_pid: Option<u32>,
}

pub fn print_connection_info(info: &ConnectionInfo, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(info),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in info_rows(info) {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for (field, value) in info_rows(info) {
                println!("{field}: {value}");
            }
        }
    }
}

fn info_rows(info: &ConnectionInfo) -> Vec<(&'static str, String)> {
    let optional = |value: Option<u32>| value.map_or_else(|| "-".to_string(), |v| v.to_string());
    vec![
        ("pipe", info.pipe.clone()),
        ("address", info.address.clone()),
        ("channel", info.channel.clone()),
        ("connection_id", info.connection_id.to_string()),
        ("connected", info.connected.to_string()),
        ("peer_uid", optional(info.peer_uid)),
        ("peer_pid", optional(info.peer_pid)),
    ]
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
