use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;

const REFRESH_PERIOD: Duration = Duration::from_secs(30);

/// Resolves the set of sibling replica addresses from a DNS hostname and
/// figures out which of them is this instance. With no hostname configured
/// the component is inert and the instance behaves standalone.
pub struct ReplicaDiscovery {
    hostname: String,
    listen_port: u16,
    state: RwLock<ReplicaAddrs>,
}

#[derive(Debug, Clone, Default)]
struct ReplicaAddrs {
    my_addr: String,
    other_replica_addrs: Vec<String>,
}

impl ReplicaDiscovery {
    pub fn new(
        hostname: &str,
        listen_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let discovery = Arc::new(Self {
            hostname: hostname.to_string(),
            listen_port,
            state: RwLock::new(ReplicaAddrs::default()),
        });
        if !hostname.is_empty() {
            tokio::spawn(refresh_loop(discovery.clone(), shutdown_rx));
        }
        discovery
    }

    /// Fixed addresses, for tests and single-node setups.
    pub fn new_static(other_replica_addrs: Vec<String>, my_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            hostname: String::new(),
            listen_port: 0,
            state: RwLock::new(ReplicaAddrs {
                my_addr: my_addr.to_string(),
                other_replica_addrs,
            }),
        })
    }

    pub fn my_addr(&self) -> String {
        self.state.read().expect("replica state lock").my_addr.clone()
    }

    pub fn other_replica_addrs(&self) -> Vec<String> {
        self.state
            .read()
            .expect("replica state lock")
            .other_replica_addrs
            .clone()
    }

    async fn refresh_addrs(&self) -> anyhow::Result<()> {
        let all_ips = self.resolve_replica_ips().await?;
        let local_ips: Vec<IpAddr> = all_ips
            .iter()
            .copied()
            .filter(|ip| is_local_ip(*ip))
            .collect();

        let my_ip = local_ips
            .first()
            .copied()
            .context("failed to find my replica IP")?;
        let other_addrs = all_ips
            .iter()
            .filter(|ip| !local_ips.contains(ip))
            .map(|ip| format!("{ip}:{}", self.listen_port))
            .collect();

        let my_new_addr = format!("{my_ip}:{}", self.listen_port);
        let mut state = self.state.write().expect("replica state lock");
        if state.my_addr != my_new_addr {
            state.my_addr = my_new_addr.clone();
            tracing::info!(my_addr = %my_new_addr, "assigned instance address");
        }
        state.other_replica_addrs = other_addrs;
        Ok(())
    }

    async fn resolve_replica_ips(&self) -> anyhow::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((self.hostname.as_str(), self.listen_port))
            .await
            .context("failed to resolve replica DNS name")?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// An address is local when the host can bind a socket to it.
fn is_local_ip(ip: IpAddr) -> bool {
    UdpSocket::bind((ip, 0)).is_ok()
}

async fn refresh_loop(discovery: Arc<ReplicaDiscovery>, mut shutdown_rx: watch::Receiver<bool>) {
    tokio::time::sleep(Duration::from_secs(1)).await;
    loop {
        if let Err(err) = discovery.refresh_addrs().await {
            tracing::error!(error = %err, "failed to get replica addresses");
        }
        tokio::select! {
            _ = tokio::time::sleep(REFRESH_PERIOD) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}
