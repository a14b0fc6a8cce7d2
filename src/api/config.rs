use std::convert::TryFrom;
use tokio::time::Duration;

/// TLS policy for one side of the deployment. This build validates and
/// records the mode but wires only `None`; transport security is terminated
/// outside the core.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SslMode {
    #[default]
    None,
    ServerAuth,
    MutualAuth,
}

/// Which demand policy the node runs. Null is the default and never reports
/// nor requests reconfiguration.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DemandProfileType {
    #[default]
    Null,
    RequestCount {
        report_every: u64,
    },
}

/// Which record-store adapter backs the control collections.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RecordStoreKind {
    #[default]
    Memory,
}

#[derive(Clone, Default)]
pub struct NodeOptions {
    /// Cap of the bounded-exponential retransmit interval.
    pub recon_timeout: Option<Duration>,
    /// Added to the server port to form the client-facing port.
    pub client_port_offset: Option<u16>,
    pub client_ssl_mode: Option<SslMode>,
    pub server_ssl_mode: Option<SslMode>,
    pub demand_profile_type: Option<DemandProfileType>,
    pub record_store: Option<RecordStoreKind>,
}

pub(super) struct NodeOptionsValidated {
    pub recon_timeout: Duration,
    pub client_port_offset: u16,
    pub client_ssl_mode: SslMode,
    pub server_ssl_mode: SslMode,
    pub demand_profile_type: DemandProfileType,
    pub record_store: RecordStoreKind,
}

impl NodeOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.recon_timeout < Duration::from_millis(100) {
            return Err("Retransmit interval cap below 100ms would flood the network");
        }
        if let DemandProfileType::RequestCount { report_every } = self.demand_profile_type {
            if report_every == 0 {
                return Err("Demand report threshold must be at least 1");
            }
        }

        Ok(())
    }
}

impl TryFrom<NodeOptions> for NodeOptionsValidated {
    type Error = &'static str;

    fn try_from(options: NodeOptions) -> Result<Self, Self::Error> {
        let values = NodeOptionsValidated {
            recon_timeout: options.recon_timeout.unwrap_or(Duration::from_millis(2000)),
            client_port_offset: options.client_port_offset.unwrap_or(100),
            client_ssl_mode: options.client_ssl_mode.unwrap_or_default(),
            server_ssl_mode: options.server_ssl_mode.unwrap_or_default(),
            demand_profile_type: options.demand_profile_type.unwrap_or_default(),
            record_store: options.record_store.unwrap_or_default(),
        };

        values.validate()?;
        Ok(values)
    }
}
