//! Veth pair and NAT wiring between the host and a container.
//!
//! The host end keeps the gateway address; the container end is moved into
//! the child's network namespace and routes everything through the gateway.
//! Outbound traffic is masqueraded by one rule in a dedicated nftables table,
//! so teardown is a single table deletion that leaves other rules alone.

use std::sync::Arc;

use minibox_core::error::{BoxError, Result};
use minibox_core::network::BridgeConfig;

use super::command::{CommandOutput, CommandRunner, SystemRunner};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// State of a wired container network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSetup {
    pub pid: u32,
    pub host_veth: String,
    pub container_veth: String,
    pub external_interface: String,
    pub nat_table: String,
}

/// Connects container network namespaces to the host.
#[derive(Clone)]
pub struct NetworkBridge {
    config: BridgeConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for NetworkBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkBridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetworkBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: BridgeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Wire the network namespace of `pid`.
    ///
    /// A failure part-way leaves whatever was created in place; `teardown`
    /// removes it.
    pub async fn connect(&self, pid: u32) -> Result<NetworkSetup> {
        let cfg = &self.config;
        let external = self.external_interface().await?;
        warn_if_forwarding_disabled().await;

        self.ip(&[
            "link", "add", &cfg.host_veth, "type", "veth", "peer", "name", &cfg.container_veth,
        ])
        .await?;
        self.ip(&["link", "set", &cfg.container_veth, "netns", &pid.to_string()])
            .await?;
        self.ip(&["addr", "add", &cfg.host_addr.to_string(), "dev", &cfg.host_veth])
            .await?;
        self.ip(&["link", "set", &cfg.host_veth, "up"]).await?;

        self.ip_in(pid, &["addr", "add", &cfg.container_addr.to_string(), "dev", &cfg.container_veth])
            .await?;
        self.ip_in(pid, &["link", "set", &cfg.container_veth, "up"]).await?;
        self.ip_in(pid, &["link", "set", "lo", "up"]).await?;
        self.ip_in(pid, &["route", "add", "default", "via", &cfg.gateway().to_string()])
            .await?;

        let script = nat_script(cfg, &external);
        let out = self
            .runner
            .run("nft", &["-f".to_string(), "-".to_string()], Some(&script))
            .await?;
        check("nft -f -", out)?;

        tracing::info!(
            pid,
            host_veth = %cfg.host_veth,
            container_addr = %cfg.container_addr,
            external = %external,
            "Container network connected"
        );

        Ok(NetworkSetup {
            pid,
            host_veth: cfg.host_veth.clone(),
            container_veth: cfg.container_veth.clone(),
            external_interface: external,
            nat_table: cfg.nat_table.clone(),
        })
    }

    /// Remove the NAT table and the host veth end. Already-absent resources
    /// are not errors.
    pub async fn teardown(&self) -> Result<()> {
        let cfg = &self.config;
        let mut failures = Vec::new();

        let steps = [
            (
                "nft delete table".to_string(),
                "nft",
                args(&["delete", "table", "ip", &cfg.nat_table]),
            ),
            // The pair vanishes with the container namespace; the host end
            // only lingers when the move into the namespace never happened.
            (
                format!("ip link del {}", cfg.host_veth),
                "ip",
                args(&["link", "del", &cfg.host_veth]),
            ),
        ];
        for (step, program, step_args) in &steps {
            match self.runner.run(program, step_args, None).await {
                Ok(out) if out.success || is_missing(&out) => {}
                Ok(out) => failures.push(format!("{}: {}", step, out.stderr.trim())),
                Err(e) => failures.push(format!("{}: {}", step, e)),
            }
        }

        if failures.is_empty() {
            tracing::debug!(table = %cfg.nat_table, "Container network removed");
            Ok(())
        } else {
            Err(BoxError::NetworkSetup(failures.join("; ")))
        }
    }

    /// Configured egress interface, or the device of the default route.
    async fn external_interface(&self) -> Result<String> {
        if let Some(iface) = &self.config.external_interface {
            return Ok(iface.clone());
        }
        let out = self
            .runner
            .run("ip", &args(&["route", "show", "default"]), None)
            .await?;
        let out = check("ip route show default", out)?;
        parse_default_route(&out.stdout).ok_or_else(|| {
            BoxError::NetworkSetup(
                "no default route; set network.external_interface".to_string(),
            )
        })
    }

    async fn ip(&self, ip_args: &[&str]) -> Result<CommandOutput> {
        let out = self.runner.run("ip", &args(ip_args), None).await?;
        check(&format!("ip {}", ip_args.join(" ")), out)
    }

    /// Run `ip` inside the network namespace of `pid`.
    async fn ip_in(&self, pid: u32, ip_args: &[&str]) -> Result<CommandOutput> {
        let pid = pid.to_string();
        let mut full = vec!["-t", pid.as_str(), "-n", "ip"];
        full.extend_from_slice(ip_args);
        let out = self.runner.run("nsenter", &args(&full), None).await?;
        check(&format!("ip {} (in container)", ip_args.join(" ")), out)
    }
}

/// nftables script creating the masquerade rule. Deleting a fresh empty
/// table first makes the script idempotent.
pub fn nat_script(cfg: &BridgeConfig, external_interface: &str) -> String {
    format!(
        "table ip {table}\n\
         delete table ip {table}\n\
         table ip {table} {{\n\
         \tchain postrouting {{\n\
         \t\ttype nat hook postrouting priority srcnat; policy accept;\n\
         \t\tip saddr {source} oifname \"{iface}\" masquerade\n\
         \t}}\n\
         }}\n",
        table = cfg.nat_table,
        source = cfg.container_addr.address,
        iface = external_interface,
    )
}

/// Device name of the first default route in `ip route show default` output.
pub fn parse_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "dev" {
                    return words.next().map(str::to_string);
                }
            }
            None
        })
}

async fn warn_if_forwarding_disabled() {
    if let Ok(value) = tokio::fs::read_to_string(IP_FORWARD_PATH).await {
        if value.trim() == "0" {
            tracing::warn!(
                "IPv4 forwarding is disabled ({}); the container will not reach external networks",
                IP_FORWARD_PATH
            );
        }
    }
}

fn check(what: &str, out: CommandOutput) -> Result<CommandOutput> {
    if out.success {
        Ok(out)
    } else {
        Err(BoxError::NetworkSetup(format!(
            "{} failed (exit {:?}): {}",
            what,
            out.code,
            out.stderr.trim()
        )))
    }
}

fn is_missing(out: &CommandOutput) -> bool {
    let stderr = out.stderr.to_ascii_lowercase();
    stderr.contains("no such file or directory") || stderr.contains("cannot find device")
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
