//! System resolver discovery.
//!
//! Scripts that use the network must reach the host's DNS servers, so the
//! resolved capability set always grants `net` on `<server>:53`. Discovery
//! failures are logged and yield an empty list: the script then simply
//! cannot resolve names.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::capabilities::{CapabilitySet, Grant};

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Nameserver addresses from `resolv.conf` contents, interface suffixes
/// (`fe80::1%eth0`) stripped, duplicates removed, file order kept.
pub fn parse_resolv_conf(contents: &str) -> Vec<String> {
    let mut servers = Vec::new();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            continue;
        };
        if !keyword.eq_ignore_ascii_case("nameserver") {
            continue;
        }
        if let Some(address) = parts.next() {
            let address = address.split('%').next().unwrap_or(address).trim();
            push_unique(&mut servers, address);
        }
    }
    servers
}

/// DNS servers listed by `ipconfig /all`.
///
/// The `DNS Servers` entry carries the first address after its colon;
/// continuation lines hold one address each until a blank line or the
/// next `Key : value` line.
pub fn parse_ipconfig(output: &str) -> Vec<String> {
    let mut servers = Vec::new();
    let mut collecting = false;

    for line in output.lines().map(str::trim) {
        if line.starts_with("DNS Servers") {
            if let Some((_, rest)) = line.split_once(':') {
                for address in rest.split_whitespace() {
                    push_unique(&mut servers, address);
                }
            }
            collecting = true;
        } else if collecting {
            if line.is_empty() || is_section_line(line) {
                collecting = false;
                continue;
            }
            for address in line.split_whitespace() {
                push_unique(&mut servers, address);
            }
        }
    }
    servers
}

/// A `Key . . . : value` line. IPv6 continuation lines also contain
/// colons, so only a colon followed by whitespace or end of line counts.
fn is_section_line(line: &str) -> bool {
    line.match_indices(':').any(|(i, _)| {
        i > 0
            && line[i + 1..]
                .chars()
                .next()
                .map_or(true, char::is_whitespace)
    })
}

fn push_unique(servers: &mut Vec<String>, address: &str) {
    if !address.is_empty() && !servers.iter().any(|s| s == address) {
        servers.push(address.to_string());
    }
}

/// Reads the platform's resolver configuration.
pub async fn system_dns_servers() -> Vec<String> {
    let servers = if cfg!(windows) {
        match tokio::process::Command::new("ipconfig").arg("/all").output().await {
            Ok(output) => parse_ipconfig(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("Failed to run ipconfig: {e}");
                Vec::new()
            }
        }
    } else {
        match tokio::fs::read_to_string(RESOLV_CONF).await {
            Ok(contents) => parse_resolv_conf(&contents),
            Err(e) => {
                warn!("Failed to read {RESOLV_CONF}: {e}");
                Vec::new()
            }
        }
    };
    debug!("System DNS servers: {servers:?}");
    servers
}

/// `net` grants for port 53 on every server; IPv6 addresses are bracketed.
pub fn dns_capabilities(servers: &[String]) -> CapabilitySet {
    if servers.is_empty() {
        return CapabilitySet::default();
    }
    let scopes: BTreeSet<String> = servers
        .iter()
        .map(|server| {
            if server.contains(':') {
                format!("[{server}]:53")
            } else {
                format!("{server}:53")
            }
        })
        .collect();
    CapabilitySet {
        allow_net: Some(Grant::Scopes(scopes)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolv_conf() {
        let conf = "\
# Generated by NetworkManager
search example.com
nameserver 192.168.1.1
NAMESERVER 8.8.8.8
nameserver fe80::1%eth0
; old entry
nameserver 192.168.1.1
options edns0
";
        assert_eq!(
            parse_resolv_conf(conf),
            vec!["192.168.1.1", "8.8.8.8", "fe80::1"]
        );
    }

    #[test]
    fn test_parse_resolv_conf_empty() {
        assert!(parse_resolv_conf("").is_empty());
        assert!(parse_resolv_conf("# nothing\nnameserver\n").is_empty());
    }

    #[test]
    fn test_parse_ipconfig() {
        let output = "\
Ethernet adapter Ethernet:\r
\r
   Connection-specific DNS Suffix  . : home\r
   IPv4 Address. . . . . . . . . . . : 192.168.1.20(Preferred)\r
   DNS Servers . . . . . . . . . . . : 192.168.1.1\r
                                       2001:4860:4860::8888\r
                                       8.8.4.4\r
   NetBIOS over Tcpip. . . . . . . . : Enabled\r
\r
Wireless LAN adapter Wi-Fi:\r
   DNS Servers . . . . . . . . . . . : 192.168.1.1\r
";
        assert_eq!(
            parse_ipconfig(output),
            vec!["192.168.1.1", "2001:4860:4860::8888", "8.8.4.4"]
        );
    }

    #[test]
    fn test_parse_ipconfig_stops_at_blank_line() {
        let output = "DNS Servers . . . : 1.1.1.1\n\n   9.9.9.9\n";
        assert_eq!(parse_ipconfig(output), vec!["1.1.1.1"]);
    }

    #[test]
    fn test_dns_capabilities() {
        let caps = dns_capabilities(&["1.1.1.1".to_string(), "::1".to_string()]);
        assert_eq!(caps.to_flags(), vec!["--allow-net=1.1.1.1:53,[::1]:53"]);
    }

    #[test]
    fn test_dns_capabilities_empty() {
        assert_eq!(dns_capabilities(&[]), CapabilitySet::default());
    }
}
