//! Jail lifecycle state machine and runtime state
//!
//! The declarative machine guards lifecycle transitions; the [`JailState`]
//! snapshot mirrors what jls(8) reports about a running jail and is
//! discarded on any lifecycle transition.

use crate::error::Error;
use crate::host::OsVersion;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;

use state_machines::state_machine;

state_machine! {
    name: JailMachine,
    dynamic: true,  // runtime dispatch for externally driven transitions
    initial: Stopped,
    states: [Stopped, Starting, Running, Stopping, Failed],
    events {
        start {
            transition: { from: Stopped, to: Starting }
        }
        started {
            transition: { from: Starting, to: Running }
        }
        stop {
            transition: { from: Running, to: Stopping }
        }
        stopped {
            transition: { from: Stopping, to: Stopped }
        }
        fail {
            transition: { from: [Starting, Running, Stopping], to: Failed }
        }
        recover {
            transition: { from: Failed, to: Stopped }
        }
    }
}

/// Runtime attributes of a jail as reported by jls(8)
///
/// `jid` is set iff the jail is currently running.
#[derive(Debug, Clone, Default)]
pub struct JailState {
    /// Kernel-visible jail name queried for
    pub name: String,
    /// The jail id, present while running
    pub jid: Option<i32>,
    /// Remaining jls attributes (path, host.hostname, ...)
    pub attributes: HashMap<String, String>,
}

impl JailState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jid: None,
            attributes: HashMap::new(),
        }
    }

    /// Query jls for the current state
    ///
    /// Returns a cleared state when the jail is not running. FreeBSD 11+
    /// serves structured libxo JSON; older hosts fall back to the
    /// name=value listing.
    pub fn query(name: &str, os_version: &OsVersion) -> crate::error::Result<Self> {
        let output = if os_version.supports_libxo() {
            Command::new("/usr/sbin/jls")
                .args(["-j", name, "-v", "--libxo=json"])
                .output()
        } else {
            Command::new("/usr/sbin/jls")
                .args(["-j", name, "-v", "-n", "-q"])
                .output()
        };

        let output = output.map_err(|e| Error::JailStateUpdateFailed {
            jail: name.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            // not running
            return Ok(Self::new(name));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if os_version.supports_libxo() {
            Self::parse_libxo(name, &stdout)
        } else {
            Ok(Self::parse_list(name, &stdout))
        }
    }

    fn parse_libxo(name: &str, stdout: &str) -> crate::error::Result<Self> {
        let output: JlsOutput =
            serde_json::from_str(stdout).map_err(|e| Error::JailStateUpdateFailed {
                jail: name.to_string(),
                reason: e.to_string(),
            })?;

        let mut state = Self::new(name);
        for jail in output.jail_information.jail {
            if jail.get("name").and_then(|n| n.as_str()) == Some(name) {
                state.jid = jail.get("jid").and_then(|jid| jid.as_i64()).map(|j| j as i32);
                for (key, value) in jail {
                    let rendered = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    state.attributes.insert(key, rendered);
                }
            }
        }
        Ok(state)
    }

    fn parse_list(name: &str, stdout: &str) -> Self {
        let mut state = Self::new(name);
        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }
            let mut attributes = HashMap::new();
            for item in line.split_whitespace() {
                match item.split_once('=') {
                    Some((key, value)) => {
                        attributes.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        attributes.insert(item.to_string(), String::new());
                    }
                }
            }
            if attributes.get("name").map(String::as_str) == Some(name) {
                state.jid = attributes.get("jid").and_then(|jid| jid.parse().ok());
                state.attributes = attributes;
            }
        }
        state
    }

    pub fn running(&self) -> bool {
        self.jid.is_some()
    }
}

/// Shape of `jls --libxo=json` output
#[derive(Deserialize)]
struct JlsOutput {
    #[serde(rename = "jail-information")]
    jail_information: JlsJailList,
}

#[derive(Deserialize)]
struct JlsJailList {
    #[serde(default)]
    jail: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_initial_state() {
        let machine = JailMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Stopped");
    }

    #[test]
    fn test_machine_full_lifecycle() {
        let mut machine = JailMachine::new(()).into_dynamic();
        machine.handle(JailMachineEvent::Start).unwrap();
        machine.handle(JailMachineEvent::Started).unwrap();
        assert_eq!(machine.current_state(), "Running");
        machine.handle(JailMachineEvent::Stop).unwrap();
        machine.handle(JailMachineEvent::Stopped).unwrap();
        assert_eq!(machine.current_state(), "Stopped");
    }

    #[test]
    fn test_machine_fail_and_recover() {
        let mut machine = JailMachine::new(()).into_dynamic();
        machine.handle(JailMachineEvent::Start).unwrap();
        machine.handle(JailMachineEvent::Fail).unwrap();
        assert_eq!(machine.current_state(), "Failed");
        machine.handle(JailMachineEvent::Recover).unwrap();
        assert_eq!(machine.current_state(), "Stopped");
    }

    #[test]
    fn test_machine_rejects_stop_from_stopped() {
        let mut machine = JailMachine::new(()).into_dynamic();
        assert!(machine.handle(JailMachineEvent::Stop).is_err());
    }

    #[test]
    fn test_parse_list_output() {
        let stdout = "jid=23 name=ioc-web01 path=/pool/ioc/jails/web01/root\n";
        let state = JailState::parse_list("ioc-web01", stdout);
        assert_eq!(state.jid, Some(23));
        assert!(state.running());
        assert_eq!(
            state.attributes.get("path").map(String::as_str),
            Some("/pool/ioc/jails/web01/root")
        );
    }

    #[test]
    fn test_parse_libxo_output() {
        let stdout = r#"{"jail-information": {"jail": [{"jid": 23, "name": "ioc-web01", "path": "/pool/ioc/jails/web01/root"}]}}"#;
        let state = JailState::parse_libxo("ioc-web01", stdout).unwrap();
        assert_eq!(state.jid, Some(23));
        assert_eq!(
            state.attributes.get("path").map(String::as_str),
            Some("/pool/ioc/jails/web01/root")
        );
    }

    #[test]
    fn test_parse_list_ignores_other_jails() {
        let stdout = "jid=9 name=other path=/x\n";
        let state = JailState::parse_list("ioc-web01", stdout);
        assert_eq!(state.jid, None);
        assert!(!state.running());
    }
}
