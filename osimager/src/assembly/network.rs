//! Derived network defs: CIDR decomposition, DNS/NTP list expansion, and
//! host name resolution for the instance under construction.

use super::{error, Result};
use crate::config::value_to_string;
use serde_json::{Map, Value};
use snafu::OptionExt;
use std::net::{IpAddr, Ipv4Addr};

/// A `subnet/prefix` network split into the pieces installer templates ask
/// for individually.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub subnet: Ipv4Addr,
    pub prefix: u8,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Parses `10.1.2.0/24` into subnet, prefix length, dotted netmask, and the
/// conventional first-host gateway.
pub fn parse_cidr(value: &str) -> Result<Network> {
    let (addr, prefix) = value
        .split_once('/')
        .context(error::BadNetworkSnafu { value })?;
    let subnet: Ipv4Addr = addr
        .trim()
        .parse()
        .ok()
        .context(error::BadNetworkSnafu { value })?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .context(error::BadNetworkSnafu { value })?;

    let mask_bits: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let netmask = Ipv4Addr::from(mask_bits);
    let base = u32::from(subnet) & mask_bits;
    let gateway = if prefix < 31 {
        Ipv4Addr::from(base + 1)
    } else {
        Ipv4Addr::from(base)
    };

    Ok(Network {
        subnet: Ipv4Addr::from(base),
        prefix,
        netmask,
        gateway,
    })
}

/// Expands the network-shaped defs in place:
///
/// * `network` ("subnet/prefix") becomes `subnet`, `prefix`, `netmask`, and
///   `gateway` (each only when not already set by a layer);
/// * the `dns` and `ntp` lists become numbered scalars (`dns1`, `dns2`, ...)
///   for installer templates that can only take one value per slot.
pub(super) fn derive(defs: &mut Map<String, Value>) -> Result<()> {
    if let Some(network) = defs.get("network").map(value_to_string) {
        let net = parse_cidr(&network)?;
        defs.entry("subnet".to_string())
            .or_insert_with(|| Value::String(net.subnet.to_string()));
        defs.entry("prefix".to_string())
            .or_insert_with(|| Value::from(net.prefix as i64));
        defs.entry("netmask".to_string())
            .or_insert_with(|| Value::String(net.netmask.to_string()));
        defs.entry("gateway".to_string())
            .or_insert_with(|| Value::String(net.gateway.to_string()));
    }

    for list_key in ["dns", "ntp"] {
        let items = match defs.get(list_key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(value_to_string)
                .collect::<Vec<_>>(),
            Some(Value::String(joined)) => joined
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            _ => continue,
        };
        for (i, item) in items.iter().enumerate() {
            defs.insert(format!("{}{}", list_key, i + 1), Value::String(item.clone()));
        }
    }

    Ok(())
}

/// Resolves the instance's address: the caller-supplied IP wins, otherwise
/// the FQDN is looked up in DNS.  An unresolvable name yields no address and
/// the defs value stays empty for validation downstream to judge.
pub(super) fn resolve_instance_ip(fqdn: &str, supplied: Option<&str>) -> String {
    if let Some(ip) = supplied {
        return ip.to_string();
    }
    match dns_lookup::lookup_host(fqdn) {
        Ok(addrs) => addrs
            .iter()
            .find(|a| matches!(a, IpAddr::V4(_)))
            .or_else(|| addrs.first())
            .map(|a| a.to_string())
            .unwrap_or_default(),
        Err(e) => {
            log::debug!("No DNS address for '{}': {}", fqdn, e);
            String::new()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn cidr_decomposition() {
        let net = parse_cidr("10.1.2.0/24").unwrap();
        assert_eq!(net.subnet, Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(net.prefix, 24);
        assert_eq!(net.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(net.gateway, Ipv4Addr::new(10, 1, 2, 1));
    }

    #[test]
    fn cidr_normalizes_host_bits() {
        let net = parse_cidr("192.168.10.57/20").unwrap();
        assert_eq!(net.subnet, Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(net.netmask, Ipv4Addr::new(255, 255, 240, 0));
    }

    #[test]
    fn bad_cidr_rejected() {
        assert!(parse_cidr("10.1.2.0").is_err());
        assert!(parse_cidr("10.1.2.0/40").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
    }

    #[test]
    fn derive_expands_lists_and_network() {
        let mut defs = json!({
            "network": "10.1.2.0/24",
            "dns": ["10.1.2.53", "10.1.3.53"],
            "ntp": "0.pool.ntp.org, 1.pool.ntp.org",
        })
        .as_object()
        .unwrap()
        .clone();

        derive(&mut defs).unwrap();
        assert_eq!(defs["netmask"], json!("255.255.255.0"));
        assert_eq!(defs["gateway"], json!("10.1.2.1"));
        assert_eq!(defs["prefix"], json!(24));
        assert_eq!(defs["dns1"], json!("10.1.2.53"));
        assert_eq!(defs["dns2"], json!("10.1.3.53"));
        assert_eq!(defs["ntp1"], json!("0.pool.ntp.org"));
        assert_eq!(defs["ntp2"], json!("1.pool.ntp.org"));
    }

    #[test]
    fn layer_set_gateway_wins() {
        let mut defs = json!({
            "network": "10.1.2.0/24",
            "gateway": "10.1.2.254",
        })
        .as_object()
        .unwrap()
        .clone();
        derive(&mut defs).unwrap();
        assert_eq!(defs["gateway"], json!("10.1.2.254"));
    }

    #[test]
    fn supplied_ip_wins_over_dns() {
        assert_eq!(
            resolve_instance_ip("doesnt.matter.example", Some("10.9.8.7")),
            "10.9.8.7"
        );
    }
}
