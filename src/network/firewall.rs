//! IPFW rules for secure VNET mode
//!
//! Secure VNET interposes a per-jail bridge between the jail and its target
//! bridge and pins traffic to the jail's known addresses and MAC, so
//! neither can be spoofed from inside. The rules live under a per-jail rule
//! number (JID + offset) and are removed on stop.
//!
//! Rules are either queued as shell command lines for hook scripts (the
//! JID is only known at script runtime) or executed directly.

use crate::error::{Error, Result};
use crate::host::{sysctl_get_i32, Host};
use std::process::Command;

const IPFW_COMMAND: &str = "/sbin/ipfw";

/// Offset added to the JID to form the jail's firewall rule number
pub const IPFW_RULE_OFFSET: u32 = 10000;

/// Raise `FirewallDisabled` unless every required sysctl is 1
pub fn ensure_firewall_enabled() -> Result<()> {
    for name in Host::firewall_sysctls() {
        match sysctl_get_i32(name) {
            Ok(1) => continue,
            _ => return Err(Error::FirewallDisabled),
        }
    }
    Ok(())
}

/// Queues ipfw invocations as shell source for hook scripts
///
/// Rule numbers reference the JID through `$IOCAGE_JID`, resolved when the
/// generated script runs.
#[derive(Debug, Default)]
pub struct QueuingFirewall {
    commands: Vec<String>,
}

impl QueuingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule_number(&self) -> String {
        format!("$(expr $IOCAGE_JID + {})", IPFW_RULE_OFFSET)
    }

    /// Queue an `ipfw add` under the jail's rule number
    pub fn add_rule(&mut self, rule_arguments: &[&str]) {
        let mut command = vec![
            IPFW_COMMAND.to_string(),
            "-q".to_string(),
            "add".to_string(),
            self.rule_number(),
        ];
        command.extend(rule_arguments.iter().map(|s| s.to_string()));
        self.commands.push(command.join(" "));
    }

    /// Queue deletion of the jail's rule number, tolerating absence
    pub fn delete_rule(&mut self) {
        self.commands.push(format!(
            "{} -q delete {} || true",
            IPFW_COMMAND,
            self.rule_number()
        ));
    }

    /// Drain the queued command lines
    pub fn read_commands(&mut self) -> Vec<String> {
        std::mem::take(&mut self.commands)
    }
}

/// Immediately executing counterpart, used for host-side cleanup outside
/// of hook scripts
pub struct FirewallRules;

impl FirewallRules {
    /// Delete the rule set of a jail by its JID
    pub fn delete_for_jid(jid: i32) -> Result<()> {
        let rule_number = (jid as u32 + IPFW_RULE_OFFSET).to_string();
        let status = Command::new(IPFW_COMMAND)
            .args(["-q", "delete", &rule_number])
            .status()
            .map_err(|e| Error::FirewallCommandFailure(e.to_string()))?;
        // ipfw returns non-zero when the rule is already gone
        let _ = status;
        Ok(())
    }
}

/// Build the secure VNET rule set for one interface
///
/// Per jail address: three allow rules (egress by source address pinned to
/// the jail MAC, ingress to the address by destination MAC at layer2,
/// ingress to the address at L3). Per protocol: two terminal deny-log
/// rules for everything else on the jail's host-side device.
pub fn secure_vnet_rules(
    firewall: &mut QueuingFirewall,
    nic: &str,
    jail_mac: &str,
    ipv4_addresses: &[String],
    ipv6_addresses: &[String],
) {
    let epair_host = format!("{}:$IOCAGE_JID", nic);
    let epair_jail = format!("{}:$IOCAGE_JID:b", nic);

    for (protocol, addresses) in [("ipv4", ipv4_addresses), ("ipv6", ipv6_addresses)] {
        for address in addresses {
            firewall.add_rule(&[
                "allow", protocol, "from", address, "to", "any", "layer2", "MAC", "any",
                jail_mac, "via", &epair_jail, "out",
            ]);
            firewall.add_rule(&[
                "allow", protocol, "from", "any", "to", address, "layer2", "MAC", jail_mac,
                "any", "via", &epair_host, "out",
            ]);
            firewall.add_rule(&[
                "allow", protocol, "from", "any", "to", address, "via", &epair_host, "out",
            ]);
        }
        firewall.add_rule(&[
            "deny", "log", protocol, "from", "any", "to", "any", "layer2", "via", &epair_jail,
            "out",
        ]);
        firewall.add_rule(&[
            "deny", "log", protocol, "from", "any", "to", "any", "via", &epair_host, "out",
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_number_references_jid() {
        let mut fw = QueuingFirewall::new();
        fw.add_rule(&["allow", "ipv4", "from", "any", "to", "any"]);
        let commands = fw.read_commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("$(expr $IOCAGE_JID + 10000)"));
        assert!(commands[0].starts_with("/sbin/ipfw -q add"));
    }

    #[test]
    fn test_delete_rule_tolerates_absence() {
        let mut fw = QueuingFirewall::new();
        fw.delete_rule();
        assert!(fw.read_commands()[0].ends_with("|| true"));
    }

    #[test]
    fn test_secure_vnet_rule_counts() {
        let mut fw = QueuingFirewall::new();
        secure_vnet_rules(
            &mut fw,
            "vnet0",
            "02:ff:60:00:00:ab",
            &["172.16.79.4".to_string()],
            &[],
        );
        let commands = fw.read_commands();
        // one address: 3 allows, plus 2 deny-log per protocol
        assert_eq!(commands.len(), 3 + 2 + 2);
        assert_eq!(commands.iter().filter(|c| c.contains("deny log")).count(), 4);
    }

    #[test]
    fn test_read_commands_drains_queue() {
        let mut fw = QueuingFirewall::new();
        fw.delete_rule();
        assert_eq!(fw.read_commands().len(), 1);
        assert!(fw.read_commands().is_empty());
    }
}
