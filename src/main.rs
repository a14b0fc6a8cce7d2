use regroup::{DemandProfileType, HostEntry, NodeConfig, NodeOptions, RecordStoreKind, SslMode};
use serde::Deserialize;
use slog::Drain;
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::time::Duration;

/// The daemon's node file: a host table plus options, shared verbatim by
/// every node in the deployment except for `my_node_id`.
#[derive(Deserialize)]
struct NodeFile {
    my_node_id: String,
    #[serde(default)]
    options: OptionsSection,
    #[serde(rename = "node")]
    nodes: Vec<NodeSection>,
}

#[derive(Deserialize, Default)]
struct OptionsSection {
    recon_timeout_ms: Option<u64>,
    client_port_offset: Option<u16>,
    client_ssl_mode: Option<String>,
    server_ssl_mode: Option<String>,
    demand_profile_type: Option<String>,
    demand_report_every: Option<u64>,
    record_store: Option<String>,
}

#[derive(Deserialize)]
struct NodeSection {
    id: String,
    address: Ipv4Addr,
    port: u16,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    reconfigurator: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config_path = std::env::args()
        .nth(1)
        .ok_or("usage: regroupd <node-file.toml>")?;
    let node_file: NodeFile = toml::from_str(&std::fs::read_to_string(&config_path)?)?;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!("NodeId" => node_file.my_node_id.clone()));

    let config = NodeConfig {
        my_node_id: node_file.my_node_id.clone(),
        hosts: node_file
            .nodes
            .into_iter()
            .map(|n| HostEntry {
                node_id: n.id,
                ip_addr: n.address,
                port: n.port,
                active: n.active,
                reconfigurator: n.reconfigurator,
            })
            .collect(),
        logger: logger.clone(),
        options: parse_options(node_file.options)?,
    };

    let handles = regroup::try_create_node(config).await?;
    slog::info!(
        logger,
        "Node '{}' up; roles: reconfigurator={} active={}",
        node_file.my_node_id,
        handles.reconfigurator.is_some(),
        handles.active_replica.is_some()
    );

    tokio::signal::ctrl_c().await?;
    slog::info!(logger, "Shutting down");
    drop(handles);

    Ok(())
}

fn parse_options(section: OptionsSection) -> Result<NodeOptions, Box<dyn Error>> {
    let client_ssl_mode = section.client_ssl_mode.as_deref().map(parse_ssl_mode).transpose()?;
    let server_ssl_mode = section.server_ssl_mode.as_deref().map(parse_ssl_mode).transpose()?;

    let demand_profile_type = match section.demand_profile_type.as_deref() {
        None => None,
        Some("NULL") => Some(DemandProfileType::Null),
        Some("REQUEST_COUNT") => Some(DemandProfileType::RequestCount {
            report_every: section.demand_report_every.unwrap_or(100),
        }),
        Some(other) => return Err(format!("unknown demand_profile_type '{}'", other).into()),
    };

    let record_store = match section.record_store.as_deref() {
        None => None,
        Some("MEMORY") => Some(RecordStoreKind::Memory),
        Some(other) => return Err(format!("unknown record_store '{}'", other).into()),
    };

    Ok(NodeOptions {
        recon_timeout: section.recon_timeout_ms.map(Duration::from_millis),
        client_port_offset: section.client_port_offset,
        client_ssl_mode,
        server_ssl_mode,
        demand_profile_type,
        record_store,
    })
}

fn parse_ssl_mode(value: &str) -> Result<SslMode, Box<dyn Error>> {
    match value {
        "NONE" => Ok(SslMode::None),
        "SERVER_AUTH" => Ok(SslMode::ServerAuth),
        "MUTUAL_AUTH" => Ok(SslMode::MutualAuth),
        other => Err(format!("unknown ssl mode '{}'", other).into()),
    }
}
