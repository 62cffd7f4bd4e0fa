//! Devfs ruleset resolution
//!
//! Jails start with a devfs ruleset derived from their configured base
//! ruleset: DHCP needs `bpf*` unhidden, ZFS mounts need `zfs` unhidden.
//! When the derived rule combination does not exist on the host yet it is
//! assigned a fresh number, appended to `/etc/devfs.rules` and the devfs
//! service is restarted.

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEVFS_RULES_FILE: &str = "/etc/devfs.rules";

/// One named and numbered ruleset of devfs.rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevfsRuleset {
    pub name: Option<String>,
    pub number: Option<u32>,
    pub rules: Vec<String>,
}

impl DevfsRuleset {
    pub fn new() -> Self {
        Self {
            name: None,
            number: None,
            rules: Vec::new(),
        }
    }

    /// A detached copy carrying only the rules (base for derivation)
    pub fn clone_rules(&self) -> Self {
        Self {
            name: None,
            number: None,
            rules: self.rules.clone(),
        }
    }

    pub fn append(&mut self, rule: impl Into<String>) {
        self.rules.push(rule.into());
    }
}

impl Default for DevfsRuleset {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DevfsRuleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("");
        match self.number {
            Some(number) => writeln!(f, "[{}={}]", name, number)?,
            None => writeln!(f, "[{}]", name)?,
        }
        for rule in &self.rules {
            writeln!(f, "{}", rule)?;
        }
        Ok(())
    }
}

/// The host's devfs.rules file
#[derive(Debug, Clone)]
pub struct DevfsRules {
    path: PathBuf,
    rulesets: Vec<DevfsRuleset>,
}

impl DevfsRules {
    /// Load and parse the host rules file; missing file yields no rules
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut rules = Self {
            path: path.clone(),
            rulesets: Vec::new(),
        };
        if path.is_file() {
            let content = fs::read_to_string(&path).map_err(|e| Error::DevfsRuleRead {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            rules.parse(&content);
        }
        Ok(rules)
    }

    fn parse(&mut self, content: &str) {
        let mut current: Option<DevfsRuleset> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                if let Some(ruleset) = current.take() {
                    self.rulesets.push(ruleset);
                }
                let header = &line[1..line.len() - 1];
                let (name, number) = match header.split_once('=') {
                    Some((name, number)) => (name.trim(), number.trim().parse().ok()),
                    None => (header.trim(), None),
                };
                current = Some(DevfsRuleset {
                    name: if name.is_empty() {
                        None
                    } else {
                        Some(name.to_string())
                    },
                    number,
                    rules: Vec::new(),
                });
            } else if let Some(ruleset) = current.as_mut() {
                ruleset.rules.push(line.to_string());
            }
        }

        if let Some(ruleset) = current.take() {
            self.rulesets.push(ruleset);
        }
    }

    pub fn find_by_number(&self, number: u32) -> Option<&DevfsRuleset> {
        self.rulesets.iter().find(|r| r.number == Some(number))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&DevfsRuleset> {
        self.rulesets.iter().find(|r| r.name.as_deref() == Some(name))
    }

    /// Find a ruleset with exactly the given rules
    pub fn find_by_rules(&self, rules: &[String]) -> Option<&DevfsRuleset> {
        self.rulesets.iter().find(|r| r.rules == rules)
    }

    fn next_free_number(&self) -> u32 {
        self.rulesets
            .iter()
            .filter_map(|r| r.number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Register a new ruleset under a fresh number
    pub fn add_ruleset(&mut self, mut ruleset: DevfsRuleset) -> u32 {
        let number = self.next_free_number();
        ruleset.number = Some(number);
        if ruleset.name.is_none() {
            ruleset.name = Some(format!("devfsrules_ioc_{}", number));
        }
        self.rulesets.push(ruleset);
        number
    }

    /// Write the rules file back and reload the devfs service
    pub fn save(&self) -> Result<()> {
        let mut output = String::new();
        for ruleset in &self.rulesets {
            output.push_str(&ruleset.to_string());
            output.push('\n');
        }
        fs::write(&self.path, output).map_err(|e| Error::DevfsRuleWrite(e.to_string()))?;

        let status = Command::new("/usr/sbin/service")
            .args(["devfs", "restart"])
            .status()
            .map_err(|e| Error::DevfsRuleWrite(e.to_string()))?;
        if !status.success() {
            return Err(Error::DevfsRuleWrite("service devfs restart failed".into()));
        }
        Ok(())
    }

    /// Resolve the ruleset number a jail starts with
    ///
    /// The configured base ruleset (by number or name) is cloned and
    /// extended; an existing matching combination is reused, otherwise a
    /// new ruleset is appended to the host file.
    pub fn resolve(
        &mut self,
        configured: &str,
        dhcp_enabled: bool,
        allow_mount_zfs: bool,
    ) -> Result<u32> {
        let base = match configured.parse::<u32>() {
            Ok(number) => self.find_by_number(number),
            Err(_) => self.find_by_name(configured),
        };

        let mut derived = match base {
            Some(base) => base.clone_rules(),
            None => {
                // numeric rulesets may exist in the kernel without a
                // devfs.rules entry (e.g. the stock jail ruleset)
                if let Ok(number) = configured.parse::<u32>() {
                    if !dhcp_enabled && !allow_mount_zfs {
                        return Ok(number);
                    }
                    DevfsRuleset {
                        name: None,
                        number: None,
                        rules: vec![format!("add include ${}", ruleset_variable(number))],
                    }
                } else {
                    return Err(Error::DevfsRulesetNotFound(configured.to_string()));
                }
            }
        };

        if dhcp_enabled {
            derived.append("add path 'bpf*' unhide");
        }
        if allow_mount_zfs {
            derived.append("add path zfs unhide");
        }

        if let Some(existing) = self.find_by_rules(&derived.rules) {
            if let Some(number) = existing.number {
                return Ok(number);
            }
        }

        let number = self.add_ruleset(derived);
        self.save()?;
        Ok(number)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ruleset_variable(number: u32) -> String {
    match number {
        1 => "devfsrules_hide_all".to_string(),
        2 => "devfsrules_unhide_basic".to_string(),
        3 => "devfsrules_unhide_login".to_string(),
        4 => "devfsrules_jail".to_string(),
        other => format!("devfsrules_{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[devfsrules_hide_all=1]
add hide

[devfsrules_jail=4]
add include $devfsrules_hide_all
add path 'random' unhide
";

    fn rules_from(content: &str) -> DevfsRules {
        let mut rules = DevfsRules {
            path: PathBuf::from("/etc/devfs.rules"),
            rulesets: Vec::new(),
        };
        rules.parse(content);
        rules
    }

    #[test]
    fn test_parse_sections() {
        let rules = rules_from(SAMPLE);
        let jail = rules.find_by_number(4).unwrap();
        assert_eq!(jail.name.as_deref(), Some("devfsrules_jail"));
        assert_eq!(jail.rules.len(), 2);
        assert!(rules.find_by_name("devfsrules_hide_all").is_some());
    }

    #[test]
    fn test_find_by_rules_matches_combination() {
        let rules = rules_from(SAMPLE);
        let derived = rules.find_by_number(4).unwrap().clone_rules();
        assert!(rules.find_by_rules(&derived.rules).is_some());
    }

    #[test]
    fn test_add_ruleset_assigns_next_number() {
        let mut rules = rules_from(SAMPLE);
        let mut derived = rules.find_by_number(4).unwrap().clone_rules();
        derived.append("add path 'bpf*' unhide");
        let number = rules.add_ruleset(derived);
        assert_eq!(number, 5);
        assert!(rules.find_by_number(5).is_some());
    }

    #[test]
    fn test_render_round_trip() {
        let rules = rules_from(SAMPLE);
        let rendered: String = rules
            .rulesets
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let reparsed = rules_from(&rendered);
        assert_eq!(reparsed.rulesets, rules.rulesets);
    }
}
