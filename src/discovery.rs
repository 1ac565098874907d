/*!
 # Bulb discovery

 Finds the bulb's address on the local network, either by looking its MAC
 address up in the system ARP table or by probing a range of hosts for an
 open Tuya port.
*/

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::{Error, Result};

/// Connect deadline for a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

// Probes in flight at once.

const SCAN_CONCURRENCY: usize = 32;

/// Reduces a MAC address to lowercase hex digits, so that
/// `50-8A-06-10-82-88`, `50:8a:06:10:82:88` and `508a.0610.8288` compare
/// equal. Returns `None` unless exactly twelve digits remain.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let digits: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digits)
    } else {
        None
    }
}

/// Searches `arp -a` output for `mac` and returns the address on the same
/// line. Understands both the BSD/Linux form
/// (`? (172.20.10.3) at 50:8a:06:10:82:88 [ether] on wlan0`) and the
/// Windows form (`172.20.10.3   50-8a-06-10-82-88   dynamic`).
pub fn find_mac_in_arp_table(table: &str, mac: &str) -> Option<Ipv4Addr> {
    let wanted = normalize_mac(mac)?;

    table.lines().find_map(|line| {
        let tokens: Vec<&str> = line
            .split_whitespace()
            .map(|t| t.trim_matches(|c| c == '(' || c == ')'))
            .collect();

        if !tokens
            .iter()
            .any(|t| normalize_mac(t).as_deref() == Some(wanted.as_str()))
        {
            return None;
        }
        tokens.iter().find_map(|t| t.parse::<Ipv4Addr>().ok())
    })
}

/// Looks the bulb up in the system ARP table.
#[instrument]
pub async fn arp_lookup(mac: &str) -> Result<Option<Ipv4Addr>> {
    let output = Command::new("arp").arg("-a").output().await?;

    if !output.status.success() {
        warn!("arp exited with {}", output.status);
    }

    let table = String::from_utf8_lossy(&output.stdout);
    let found = find_mac_in_arp_table(&table, mac);

    debug!("ARP lookup result: {:?}", found);
    Ok(found)
}

/// Parses a `/24` network prefix such as `172.20.10` (a trailing dot is
/// accepted).
pub fn parse_subnet(subnet: &str) -> Result<[u8; 3]> {
    let octets: Vec<u8> = subnet
        .trim_end_matches('.')
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::InvalidConfig(format!("invalid subnet '{subnet}'")))?;

    <[u8; 3]>::try_from(octets)
        .map_err(|_| Error::InvalidConfig(format!("subnet '{subnet}' must have three octets")))
}

/// Hosts `subnet.start..=subnet.end`, minus `skip`.
pub fn hosts(subnet: [u8; 3], start: u8, end: u8, skip: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let [a, b, c] = subnet;

    (start..=end)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| !skip.contains(ip))
        .collect()
}

/// Checks whether something accepts TCP connections at `addr`.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("{} refused: {}", addr, e);
            false
        }
        Err(_) => false,
    }
}

/// Probes every host on `port` and returns the ones that answered, in
/// ascending order.
#[instrument(skip(hosts), fields(hosts = hosts.len()))]
pub async fn scan(hosts: Vec<Ipv4Addr>, port: u16, timeout: Duration) -> Vec<Ipv4Addr> {
    let mut found: Vec<Ipv4Addr> = stream::iter(hosts)
        .map(|ip| async move {
            probe(SocketAddr::from((ip, port)), timeout)
                .await
                .then_some(ip)
        })
        .buffer_unordered(SCAN_CONCURRENCY)
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

    found.sort();
    debug!("Scan found {} responders", found.len());
    found
}

/// Tries the ARP table first (when a MAC is given), then the port scan.
/// Returns the first hit.
pub async fn find_bulb(
    mac: Option<&str>,
    hosts: Vec<Ipv4Addr>,
    port: u16,
    timeout: Duration,
) -> Option<Ipv4Addr> {
    if let Some(mac) = mac {
        match arp_lookup(mac).await {
            Ok(Some(ip)) => {
                info!("Found bulb {} in ARP table at {}", mac, ip);
                return Some(ip);
            }
            Ok(None) => debug!("MAC {} not in ARP table", mac),
            Err(e) => warn!("ARP lookup failed: {}", e),
        }
    }

    info!("Scanning {} hosts on port {}", hosts.len(), port);
    scan(hosts, port, timeout).await.into_iter().next()
}
