//! VNET network engine
//!
//! Builds the epair/bridge topology for VNET jails as *queued shell
//! commands*: interface names assigned by the kernel are only known when
//! the hook scripts run, so the engine emits `ifconfig` command lines that
//! capture those names into well-known shell variables instead of
//! executing anything itself.
//!
//! Two command lists are produced per interface: `created` runs on the
//! host after the jail exists, `start` runs inside the jail. Teardown
//! reverses the host-side changes on stop.

pub mod firewall;
pub mod ioctl;
pub mod mac;

use crate::error::{Error, Result};
use crate::network::firewall::QueuingFirewall;
use crate::network::mac::MacAddressPair;
use ipnet::IpNet;
use sha2::{Digest, Sha224};
use std::fmt;
use std::net::IpAddr;

const IFCONFIG_COMMAND: &str = "/sbin/ifconfig";
const DHCLIENT_COMMAND: &str = "/sbin/dhclient";
const RTSOLD_COMMAND: &str = "/usr/sbin/rtsold";

/// A host bridge a VNET interface attaches to
///
/// A leading colon in the configured name enables secure VNET mode: an
/// additional per-jail bridge plus IPFW rules sit between the jail and
/// this bridge to prevent address spoofing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInterface {
    pub name: String,
    pub secure_vnet: bool,
}

impl BridgeInterface {
    pub fn parse(value: &str) -> Self {
        match value.strip_prefix(':') {
            Some(name) => Self {
                name: name.to_string(),
                secure_vnet: true,
            },
            None => Self {
                name: value.to_string(),
                secure_vnet: false,
            },
        }
    }
}

impl fmt::Display for BridgeInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secure_vnet {
            write!(f, ":{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// One address entry of `ip4_addr`/`ip6_addr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceAddress {
    /// Literal address with prefix length
    Static(IpNet),
    /// Lease via dhclient
    Dhcp,
    /// IPv6 router advertisements via rtsold
    AcceptRtadv,
}

impl InterfaceAddress {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dhcp" => return Ok(InterfaceAddress::Dhcp),
            "accept_rtadv" => return Ok(InterfaceAddress::AcceptRtadv),
            _ => {}
        }
        if let Ok(net) = value.parse::<IpNet>() {
            return Ok(InterfaceAddress::Static(net));
        }
        // a bare address takes its host prefix length
        if let Ok(addr) = value.parse::<IpAddr>() {
            let plen = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            let net = IpNet::new(addr, plen).map_err(|_| Error::InvalidAddress(value.into()))?;
            return Ok(InterfaceAddress::Static(net));
        }
        Err(Error::InvalidAddress(value.to_string()))
    }

    /// The bare IP for firewall rules; None for dynamic modes
    pub fn ip_string(&self) -> Option<String> {
        match self {
            InterfaceAddress::Static(net) => Some(net.addr().to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceAddress::Static(net) => write!(f, "{}", net),
            InterfaceAddress::Dhcp => write!(f, "dhcp"),
            InterfaceAddress::AcceptRtadv => write!(f, "accept_rtadv"),
        }
    }
}

/// Network configuration of one VNET interface
#[derive(Debug, Clone)]
pub struct Network {
    /// Interface name inside the jail (e.g. `vnet0`)
    pub nic: String,
    /// Host bridge, optionally in secure mode
    pub bridge: Option<BridgeInterface>,
    pub ipv4_addresses: Vec<InterfaceAddress>,
    pub ipv6_addresses: Vec<InterfaceAddress>,
    /// Explicit MTU; autodetected from the bridge when unset
    pub mtu: Option<u32>,
    /// Explicit MAC pair; derived from jail name and nic when unset
    pub mac_pair: Option<MacAddressPair>,
    /// Human readable jail name (MAC derivation, device description)
    pub jail_name: String,
    /// Full resource name (epair id derivation)
    pub jail_full_name: String,
    /// Kernel-visible jail identifier (vnet assignment target)
    pub jail_identifier: String,
    /// Prefix of generated MAC addresses
    pub mac_prefix: String,
}

impl Network {
    /// Hash of the nic name used in shell variable names
    ///
    /// Interface names may contain characters that are invalid in shell
    /// variables, so scripts address each nic through this hash.
    pub fn nic_hash(&self) -> String {
        let mut hasher = Sha224::new();
        hasher.update(self.nic.as_bytes());
        let digest = hasher.finalize();
        // low 33 bits of the digest, matching the name-mangling scheme of
        // existing hook scripts
        let mut low: u64 = 0;
        for byte in &digest[digest.len() - 8..] {
            low = (low << 8) | u64::from(*byte);
        }
        format!("{:X}", low & ((1 << 33) - 1))
    }

    /// Stable numeric id of the (jail, nic) combination
    pub fn epair_id(&self) -> u16 {
        let mut hasher = Sha224::new();
        hasher.update(self.jail_full_name.as_bytes());
        hasher.update(self.nic.as_bytes());
        let digest = hasher.finalize();
        let mut low: u64 = 0;
        for byte in &digest[digest.len() - 8..] {
            low = (low << 8) | u64::from(*byte);
        }
        (low & ((1 << 15) - 1)) as u16
    }

    fn require_bridge(&self) -> Result<&BridgeInterface> {
        self.bridge.as_ref().ok_or(Error::VnetBridgeMissing {
            nic: self.nic.clone(),
        })
    }

    fn is_secure(&self) -> bool {
        self.bridge.as_ref().is_some_and(|b| b.secure_vnet)
    }

    /// The MTU to apply: explicit config or the bridge's current MTU
    pub fn resolve_mtu(&self) -> Result<u32> {
        if let Some(mtu) = self.mtu {
            return Ok(mtu);
        }
        let bridge = self.require_bridge()?;
        ioctl::get_interface_mtu(&bridge.name)
    }

    /// Resolve the interface MAC pair (configured or derived)
    pub fn resolve_mac_pair(&self) -> Result<MacAddressPair> {
        match &self.mac_pair {
            Some(pair) => Ok(pair.clone()),
            None => MacAddressPair::generate(&self.jail_name, &self.nic, &self.mac_prefix),
        }
    }

    fn var(&self, half: &str) -> String {
        format!("IOCAGE_NIC_{}_{}", half, self.nic_hash())
    }

    /// Emit commands creating an epair whose halves are renamed to
    /// `<nic>:$IOCAGE_JID<suffix>`, capturing the names in shell variables
    fn create_epair_commands(
        &self,
        variable_a: &str,
        variable_b: &str,
        suffix_a: &str,
        suffix_b: &str,
        mtu: Option<u32>,
    ) -> Vec<String> {
        let mut commands = Vec::new();
        commands.push(format!(
            "export {}=\"$({} epair create)\"",
            variable_a, IFCONFIG_COMMAND
        ));
        commands.push(format!(
            "export {}=$(echo ${} | sed 's/.$/b/')",
            variable_b, variable_a
        ));

        for (variable, suffix) in [(variable_a, suffix_a), (variable_b, suffix_b)] {
            let mut rename = format!(
                "{} ${} name {}:$IOCAGE_JID{}",
                IFCONFIG_COMMAND, variable, self.nic, suffix
            );
            if let Some(mtu) = mtu {
                rename = format!(
                    "{} ${} mtu {} name {}:$IOCAGE_JID{}",
                    IFCONFIG_COMMAND, variable, mtu, self.nic, suffix
                );
            }
            commands.push(format!("export {}=\"$({})\"", variable, rename));
        }
        commands
    }

    /// Build the `created` (host side) and `start` (jail side) command
    /// lists for this interface
    pub fn setup(&self) -> Result<(Vec<String>, Vec<String>)> {
        let bridge = self.require_bridge()?.clone();
        if self.is_secure() {
            firewall::ensure_firewall_enabled()?;
        }

        let mtu = self.resolve_mtu()?;
        let mac_pair = self.resolve_mac_pair()?;

        let epair_a = self.var("EPAIR_A");
        let epair_b = self.var("EPAIR_B");

        let mut created = Vec::new();
        let mut start = Vec::new();

        created.extend(self.create_epair_commands(&epair_a, &epair_b, "", ":j", None));

        // host half: MAC, MTU and a description pointing back at the jail
        created.push(format!(
            "{} ${} link {} mtu {} description 'associated with jail: {}'",
            IFCONFIG_COMMAND, epair_a, mac_pair.a, mtu, self.jail_name
        ));

        if !self.is_secure() {
            created.push(format!(
                "{} {} addm ${}",
                IFCONFIG_COMMAND, bridge.name, epair_a
            ));
        } else {
            let epair_c = self.var("EPAIR_C");
            let epair_d = self.var("EPAIR_D");
            let sec_bridge = self.var("BRIDGE");

            created.extend(self.create_epair_commands(
                &epair_c,
                &epair_d,
                ":a",
                ":b",
                Some(mtu),
            ));

            let mut fw = QueuingFirewall::new();
            let ipv4: Vec<String> = self
                .ipv4_addresses
                .iter()
                .filter_map(InterfaceAddress::ip_string)
                .collect();
            let ipv6: Vec<String> = self
                .ipv6_addresses
                .iter()
                .filter_map(InterfaceAddress::ip_string)
                .collect();
            firewall::secure_vnet_rules(
                &mut fw,
                &self.nic,
                &mac_pair.b.to_string(),
                &ipv4,
                &ipv6,
            );
            created.extend(fw.read_commands());

            // the secondary bridge between jail and target bridge
            created.push(format!(
                "export {}=\"$({} bridge create name {}:$IOCAGE_JID:net)\"",
                sec_bridge, IFCONFIG_COMMAND, self.nic
            ));
            created.push(format!(
                "{} ${} addm ${} addm ${}",
                IFCONFIG_COMMAND, sec_bridge, epair_a, epair_d
            ));
            created.push(format!(
                "{} {} addm ${}",
                IFCONFIG_COMMAND, bridge.name, epair_c
            ));
        }

        created.push(format!("{} ${} up", IFCONFIG_COMMAND, epair_a));

        // move the jail half into the jail's vnet
        created.push(format!(
            "{} ${} vnet {}",
            IFCONFIG_COMMAND, epair_b, self.jail_identifier
        ));

        // inside the jail: rename to the plain nic name, then configure
        start.push(format!(
            "{} '{}:'$IOCAGE_JID':j' link {} mtu {} name {}",
            IFCONFIG_COMMAND, self.nic, mac_pair.b, mtu, self.nic
        ));
        start.extend(self.address_commands(&self.ipv4_addresses, "inet"));
        start.extend(self.address_commands(&self.ipv6_addresses, "inet6"));

        Ok((created, start))
    }

    fn address_commands(&self, addresses: &[InterfaceAddress], family: &str) -> Vec<String> {
        let mut commands = Vec::new();
        for (i, address) in addresses.iter().enumerate() {
            match address {
                InterfaceAddress::Dhcp => {
                    commands.push(format!("{} {}", DHCLIENT_COMMAND, self.nic));
                }
                InterfaceAddress::AcceptRtadv => {
                    commands.push(format!("{} {}", RTSOLD_COMMAND, self.nic));
                }
                InterfaceAddress::Static(net) => {
                    let alias = if i > 0 { " alias" } else { "" };
                    commands.push(format!(
                        "{} {} {}{} {}",
                        IFCONFIG_COMMAND, self.nic, family, alias, net
                    ));
                }
            }
        }
        commands
    }

    /// Host-side teardown commands run in the poststop hook
    pub fn teardown(&self) -> Vec<String> {
        let mut commands = Vec::new();

        commands.push(format!(
            "{} '{}:'$IOCAGE_JID destroy",
            IFCONFIG_COMMAND, self.nic
        ));

        if self.is_secure() {
            for suffix in [":a", ":net"] {
                commands.push(format!(
                    "{} '{}:'$IOCAGE_JID'{}' destroy",
                    IFCONFIG_COMMAND, self.nic, suffix
                ));
            }
            let mut fw = QueuingFirewall::new();
            fw.delete_rule();
            commands.extend(fw.read_commands());
        }

        commands
    }

    /// Environment variables the hook scripts expect for this interface
    pub fn env(&self) -> Vec<(String, String)> {
        let hash = self.nic_hash();
        vec![
            (
                format!("IOCAGE_NIC_EPAIR_A_{}", hash),
                format!("{}:$IOCAGE_JID", self.nic),
            ),
            (format!("IOCAGE_NIC_EPAIR_B_{}", hash), self.nic.clone()),
            (
                format!("IOCAGE_NIC_EPAIR_C_{}", hash),
                format!("{}:$IOCAGE_JID:a", self.nic),
            ),
            (
                format!("IOCAGE_NIC_EPAIR_D_{}", hash),
                format!("{}:$IOCAGE_JID:b", self.nic),
            ),
            (
                format!("IOCAGE_NIC_BRIDGE_{}", hash),
                format!("{}:$IOCAGE_JID:net", self.nic),
            ),
            (format!("IOCAGE_NIC_ID_{}", hash), self.epair_id().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(bridge: &str) -> Network {
        Network {
            nic: "vnet0".into(),
            bridge: Some(BridgeInterface::parse(bridge)),
            ipv4_addresses: vec![InterfaceAddress::parse("172.16.79.4/24").unwrap()],
            ipv6_addresses: vec![],
            mtu: Some(1500),
            mac_pair: None,
            jail_name: "web01".into(),
            jail_full_name: "web01".into(),
            jail_identifier: "ioc-web01".into(),
            mac_prefix: "02ff60".into(),
        }
    }

    #[test]
    fn test_bridge_parse_secure_prefix() {
        let plain = BridgeInterface::parse("bridge0");
        assert!(!plain.secure_vnet);
        assert_eq!(plain.to_string(), "bridge0");

        let secure = BridgeInterface::parse(":bridge0");
        assert!(secure.secure_vnet);
        assert_eq!(secure.name, "bridge0");
        assert_eq!(secure.to_string(), ":bridge0");
    }

    #[test]
    fn test_interface_address_parse() {
        assert_eq!(
            InterfaceAddress::parse("dhcp").unwrap(),
            InterfaceAddress::Dhcp
        );
        assert_eq!(
            InterfaceAddress::parse("accept_rtadv").unwrap(),
            InterfaceAddress::AcceptRtadv
        );
        assert!(matches!(
            InterfaceAddress::parse("172.16.79.4/24").unwrap(),
            InterfaceAddress::Static(_)
        ));
        assert!(InterfaceAddress::parse("not-an-address").is_err());
    }

    #[test]
    fn test_nic_hash_is_stable_and_shell_safe() {
        let net = network("bridge0");
        let h1 = net.nic_hash();
        let h2 = net.nic_hash();
        assert_eq!(h1, h2);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_epair_id_depends_on_jail_and_nic() {
        let a = network("bridge0");
        let mut b = network("bridge0");
        b.jail_full_name = "db01".into();
        assert_ne!(a.epair_id(), b.epair_id());
    }

    #[test]
    fn test_setup_plain_bridge_commands() {
        let net = network("bridge0");
        let (created, start) = net.setup().unwrap();

        // epair created and captured into shell variables
        assert!(created[0].contains("epair create"));
        assert!(created.iter().any(|c| c.contains("addm $IOCAGE_NIC_EPAIR_A_")));
        // no firewall rules outside secure mode
        assert!(!created.iter().any(|c| c.contains("ipfw")));

        // jail side renames the moved half to the plain nic name
        assert!(start[0].contains("name vnet0"));
        assert!(start.iter().any(|c| c.contains("inet 172.16.79.4/24")));
    }

    #[test]
    #[ignore] // Requires IPFW enabled on the host (secure mode sysctl check)
    fn test_setup_secure_bridge_adds_firewall_and_second_bridge() {
        let net = network(":bridge0");
        let (created, _start) = net.setup().unwrap();
        assert!(created.iter().any(|c| c.contains("bridge create")));
        assert!(created.iter().any(|c| c.contains("ipfw")));
        assert!(created.iter().any(|c| c.contains("EPAIR_C")));
    }

    #[test]
    fn test_second_address_is_alias() {
        let mut net = network("bridge0");
        net.ipv4_addresses
            .push(InterfaceAddress::parse("172.16.81.5/24").unwrap());
        let (_created, start) = net.setup().unwrap();
        let inet: Vec<&String> = start.iter().filter(|c| c.contains(" inet")).collect();
        assert_eq!(inet.len(), 2);
        assert!(!inet[0].contains("alias"));
        assert!(inet[1].contains("alias"));
    }

    #[test]
    fn test_dhcp_and_rtadv_commands() {
        let mut net = network("bridge0");
        net.ipv4_addresses = vec![InterfaceAddress::Dhcp];
        net.ipv6_addresses = vec![InterfaceAddress::AcceptRtadv];
        let (_created, start) = net.setup().unwrap();
        assert!(start.iter().any(|c| c.starts_with("/sbin/dhclient")));
        assert!(start.iter().any(|c| c.starts_with("/usr/sbin/rtsold")));
    }

    #[test]
    fn test_teardown_plain_and_secure() {
        let net = network("bridge0");
        let commands = net.teardown();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("destroy"));

        let net = network(":bridge0");
        let commands = net.teardown();
        assert!(commands.iter().any(|c| c.contains(":net' destroy")));
        assert!(commands.iter().any(|c| c.contains("ipfw")));
    }

    #[test]
    fn test_env_variables_cover_all_halves() {
        let net = network("bridge0");
        let env = net.env();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        for half in ["EPAIR_A", "EPAIR_B", "EPAIR_C", "EPAIR_D", "BRIDGE", "ID"] {
            assert!(keys.iter().any(|k| k.contains(half)), "missing {}", half);
        }
    }

    #[test]
    fn test_missing_bridge_is_rejected() {
        let mut net = network("bridge0");
        net.bridge = None;
        assert!(matches!(
            net.setup(),
            Err(Error::VnetBridgeMissing { .. })
        ));
    }
}
