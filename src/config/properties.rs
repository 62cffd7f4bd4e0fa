//! Special config properties with their own value types
//!
//! Most config keys hold plain scalars; the properties in this module own
//! structured values that are parsed on set so invalid input never reaches
//! the config file: per-nic address maps, interface/bridge pairs, the
//! resolver mode and resource limits.

use crate::config::value::{parse_none, split_list};
use crate::error::{Error, Result};
use crate::network::{BridgeInterface, InterfaceAddress};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::fmt;

/// Address family of an address map property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Parsed `ip4_addr`/`ip6_addr`: nic name to address list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressesProp {
    entries: BTreeMap<String, Vec<InterfaceAddress>>,
}

impl AddressesProp {
    /// Parse `nic|addr/plen` pairs separated by comma or whitespace
    pub fn parse(value: &str, family: AddressFamily) -> Result<Self> {
        let mut prop = Self::default();
        if parse_none(value) {
            return Ok(prop);
        }

        for pair in value
            .split([',', ' '])
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let (nic, address) = pair
                .split_once('|')
                .ok_or_else(|| Error::InvalidAddress(pair.to_string()))?;
            let address = InterfaceAddress::parse(address)?;
            Self::check_family(&address, family, pair)?;
            prop.entries
                .entry(nic.to_string())
                .or_default()
                .push(address);
        }
        Ok(prop)
    }

    fn check_family(
        address: &InterfaceAddress,
        family: AddressFamily,
        raw: &str,
    ) -> Result<()> {
        let ok = match (address, family) {
            (InterfaceAddress::Dhcp, AddressFamily::Inet) => true,
            (InterfaceAddress::AcceptRtadv, AddressFamily::Inet6) => true,
            (InterfaceAddress::Static(IpNet::V4(_)), AddressFamily::Inet) => true,
            (InterfaceAddress::Static(IpNet::V6(_)), AddressFamily::Inet6) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidAddress(raw.to_string()))
        }
    }

    pub fn nics(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn addresses(&self, nic: &str) -> &[InterfaceAddress] {
        self.entries.get(nic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any entry requests router advertisements
    pub fn accepts_rtadv(&self) -> bool {
        self.entries
            .values()
            .flatten()
            .any(|a| *a == InterfaceAddress::AcceptRtadv)
    }

    /// Flat list of all static networks across nics
    pub fn networks(&self) -> Vec<IpNet> {
        self.entries
            .values()
            .flatten()
            .filter_map(|a| match a {
                InterfaceAddress::Static(net) => Some(*net),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for AddressesProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs = Vec::new();
        for (nic, addresses) in &self.entries {
            for address in addresses {
                pairs.push(format!("{}|{}", nic, address));
            }
        }
        write!(f, "{}", pairs.join(","))
    }
}

/// Parsed `interfaces`: nic name to bridge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfacesProp {
    entries: BTreeMap<String, BridgeInterface>,
}

impl InterfacesProp {
    /// Parse `nic:bridge` pairs separated by comma or whitespace
    ///
    /// A bridge name starting with a second colon (`vnet0::bridge0`)
    /// switches that interface into secure VNET mode.
    pub fn parse(value: &str) -> Result<Self> {
        let mut prop = Self::default();
        if parse_none(value) {
            return Ok(prop);
        }

        for pair in value
            .split([',', ' '])
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let (nic, bridge) = pair.split_once(':').ok_or_else(|| {
                Error::InvalidConfigValue {
                    property: "interfaces".into(),
                    reason: format!("invalid NIC pair '{}' (expected <nic>:<bridge>)", pair),
                }
            })?;
            if nic.is_empty() || bridge.trim_start_matches(':').is_empty() {
                return Err(Error::InvalidConfigValue {
                    property: "interfaces".into(),
                    reason: format!("invalid NIC pair '{}'", pair),
                });
            }
            prop.entries
                .insert(nic.to_string(), BridgeInterface::parse(bridge));
        }
        Ok(prop)
    }

    pub fn contains(&self, nic: &str) -> bool {
        self.entries.contains_key(nic)
    }

    pub fn bridge(&self, nic: &str) -> Option<&BridgeInterface> {
        self.entries.get(nic)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BridgeInterface)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for InterfacesProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .entries
            .iter()
            .map(|(nic, bridge)| format!("{}:{}", nic, bridge))
            .collect();
        write!(f, "{}", pairs.join(","))
    }
}

/// Nameserver configuration of a jail
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverProp {
    /// Copy /etc/resolv.conf from the host
    Copy,
    /// Leave resolv.conf alone
    Skip,
    /// Write the given lines
    Manual(Vec<String>),
}

impl ResolverProp {
    /// `/etc/resolv.conf` means copy, `/dev/null` means skip, anything
    /// else is a semicolon separated list of resolv.conf lines
    pub fn parse(value: &str) -> Self {
        match value {
            "/etc/resolv.conf" => ResolverProp::Copy,
            "/dev/null" => ResolverProp::Skip,
            _ => ResolverProp::Manual(
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
            ),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            ResolverProp::Copy => "copy",
            ResolverProp::Skip => "skip",
            ResolverProp::Manual(_) => "manual",
        }
    }
}

impl fmt::Display for ResolverProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverProp::Copy => write!(f, "/etc/resolv.conf"),
            ResolverProp::Skip => write!(f, "/dev/null"),
            ResolverProp::Manual(lines) => write!(f, "{}", lines.join(";")),
        }
    }
}

/// Resource names rctl(8) can constrain
pub const RESOURCE_LIMIT_NAMES: &[&str] = &[
    "cputime",
    "datasize",
    "stacksize",
    "coredumpsize",
    "memoryuse",
    "memorylocked",
    "maxproc",
    "openfiles",
    "vmemoryuse",
    "pseudoterminals",
    "swapuse",
    "nthr",
    "msgqqueued",
    "msgqsize",
    "nmsgq",
    "nsem",
    "nsemop",
    "nshm",
    "shmsize",
    "wallclock",
    "pcpu",
    "readbps",
    "writebps",
    "readiops",
    "writeiops",
];

/// A single resource limit value: `amount[:action[/per]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimitProp {
    pub amount: String,
    pub action: String,
    pub per: Option<String>,
}

impl ResourceLimitProp {
    pub fn parse(value: &str) -> Result<Self> {
        let (amount, rest) = match value.split_once(':') {
            Some((amount, rest)) => (amount, Some(rest)),
            None => (value, None),
        };
        if amount.is_empty() {
            return Err(Error::InvalidConfigValue {
                property: "rlimit".into(),
                reason: format!("invalid limit '{}'", value),
            });
        }

        let (action, per) = match rest {
            Some(rest) => match rest.split_once('/') {
                Some((action, per)) => (action.to_string(), Some(per.to_string())),
                None => (rest.to_string(), None),
            },
            None => ("deny".to_string(), None),
        };

        Ok(Self {
            amount: amount.to_string(),
            action,
            per,
        })
    }

    /// The rule fragment passed to `rctl -a jail:<id>:<resource>:<...>`
    pub fn limit_string(&self) -> String {
        match &self.per {
            Some(per) => format!("{}={}/{}", self.action, self.amount, per),
            None => format!("{}={}", self.action, self.amount),
        }
    }
}

impl fmt::Display for ResourceLimitProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.amount, self.action)?;
        if let Some(per) = &self.per {
            write!(f, "/{}", per)?;
        }
        Ok(())
    }
}

/// Parse the `depends` property into filter terms
pub fn parse_depends(value: &str) -> Vec<String> {
    split_list(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_parse_pairs() {
        let prop = AddressesProp::parse(
            "vnet23|172.16.79.4/24,vnet23|172.16.81.5/24",
            AddressFamily::Inet,
        )
        .unwrap();
        assert_eq!(prop.addresses("vnet23").len(), 2);
        assert_eq!(
            prop.to_string(),
            "vnet23|172.16.79.4/24,vnet23|172.16.81.5/24"
        );
    }

    #[test]
    fn test_addresses_reject_missing_nic() {
        assert!(AddressesProp::parse("172.16.79.4/24", AddressFamily::Inet).is_err());
    }

    #[test]
    fn test_addresses_reject_wrong_family() {
        assert!(AddressesProp::parse("vnet0|2001:db8::1/64", AddressFamily::Inet).is_err());
        assert!(AddressesProp::parse("vnet0|10.0.0.1/24", AddressFamily::Inet6).is_err());
        assert!(AddressesProp::parse("vnet0|dhcp", AddressFamily::Inet6).is_err());
    }

    #[test]
    fn test_addresses_none_is_empty() {
        assert!(AddressesProp::parse("none", AddressFamily::Inet)
            .unwrap()
            .is_empty());
        assert!(AddressesProp::parse("-", AddressFamily::Inet)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_accepts_rtadv_detection() {
        let prop = AddressesProp::parse("vnet0|accept_rtadv", AddressFamily::Inet6).unwrap();
        assert!(prop.accepts_rtadv());

        let prop = AddressesProp::parse("vnet0|2001:db8::2/64", AddressFamily::Inet6).unwrap();
        assert!(!prop.accepts_rtadv());
    }

    #[test]
    fn test_interfaces_parse() {
        let prop = InterfacesProp::parse("vnet0:bridge0,vnet1:bridge1").unwrap();
        assert!(prop.contains("vnet0"));
        assert_eq!(prop.bridge("vnet1").unwrap().name, "bridge1");
        assert_eq!(prop.to_string(), "vnet0:bridge0,vnet1:bridge1");
    }

    #[test]
    fn test_interfaces_secure_mode_round_trip() {
        let prop = InterfacesProp::parse("vnet0::bridge0").unwrap();
        let bridge = prop.bridge("vnet0").unwrap();
        assert!(bridge.secure_vnet);
        assert_eq!(bridge.name, "bridge0");
        assert_eq!(prop.to_string(), "vnet0::bridge0");
    }

    #[test]
    fn test_interfaces_reject_bare_nic() {
        assert!(InterfacesProp::parse("vnet0").is_err());
        assert!(InterfacesProp::parse("vnet0:").is_err());
    }

    #[test]
    fn test_resolver_methods() {
        assert_eq!(ResolverProp::parse("/etc/resolv.conf").method(), "copy");
        assert_eq!(ResolverProp::parse("/dev/null").method(), "skip");

        let manual = ResolverProp::parse("nameserver 10.0.0.1;search example.com");
        assert_eq!(manual.method(), "manual");
        assert_eq!(
            manual.to_string(),
            "nameserver 10.0.0.1;search example.com"
        );
    }

    #[test]
    fn test_resource_limit_parse_and_rule() {
        let limit = ResourceLimitProp::parse("16g").unwrap();
        assert_eq!(limit.limit_string(), "deny=16g");

        let limit = ResourceLimitProp::parse("50:throttle/jail").unwrap();
        assert_eq!(limit.limit_string(), "throttle=50/jail");
        assert_eq!(limit.to_string(), "50:throttle/jail");
    }

    #[test]
    fn test_known_resource_names() {
        assert!(RESOURCE_LIMIT_NAMES.contains(&"vmemoryuse"));
        assert!(RESOURCE_LIMIT_NAMES.contains(&"pcpu"));
    }
}
