//! Jail configuration model
//!
//! A `Config` maps property names to typed values. Keys under the `user.`
//! namespace are free-form; every other key must be recognised. Unset keys
//! fall back to the host defaults resource and finally to the built-in
//! defaults. Special properties (addresses, interfaces, resolver, MACs,
//! resource limits) validate their input on set.

pub mod persist;
pub mod properties;
pub mod ucl;
pub mod value;

use crate::config::persist::{split_user_namespace, ConfigHandler};
use crate::config::properties::{
    AddressFamily, AddressesProp, InterfacesProp, ResolverProp, ResourceLimitProp,
    RESOURCE_LIMIT_NAMES,
};
use crate::config::value::Value;
use crate::error::{Error, Result};
use crate::network::mac::MacAddressPair;
use crate::rcconf::RcConf;
use crate::zfs::Zfs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Recognised scalar properties and their built-in defaults
///
/// The host defaults resource (`defaults.json` at the source root) is
/// layered between these and the per-jail values.
const DEFAULTS: &[(&str, &str)] = &[
    ("id", ""),
    ("release", ""),
    ("boot", "no"),
    ("template", "no"),
    ("basejail", "no"),
    ("basejail_type", ""),
    ("vnet", "no"),
    ("interfaces", ""),
    ("ip4", "new"),
    ("ip4_addr", ""),
    ("ip4_saddrsel", "yes"),
    ("ip6", "new"),
    ("ip6_addr", ""),
    ("ip6_saddrsel", "yes"),
    ("defaultrouter", ""),
    ("defaultrouter6", ""),
    ("resolver", "/etc/resolv.conf"),
    ("host_hostname", ""),
    ("host_hostuuid", ""),
    ("host_domainname", ""),
    ("mac_prefix", "02ff60"),
    ("devfs_ruleset", "4"),
    ("enforce_statfs", "2"),
    ("children_max", "0"),
    ("securelevel", "2"),
    ("sysvmsg", "new"),
    ("sysvsem", "new"),
    ("sysvshm", "new"),
    ("exec_clean", "yes"),
    ("exec_fib", "0"),
    ("exec_prestart", ""),
    ("exec_created", ""),
    ("exec_start", "/bin/sh /etc/rc"),
    ("exec_poststart", ""),
    ("exec_prestop", ""),
    ("exec_stop", "/bin/sh /etc/rc.shutdown"),
    ("exec_poststop", ""),
    ("exec_timeout", "600"),
    ("exec_jail_user", "root"),
    ("stop_timeout", "30"),
    ("login_flags", "-f root"),
    ("priority", "99"),
    ("depends", ""),
    ("start_dependant_jails", "yes"),
    ("rlimits", "no"),
    ("mount_devfs", "yes"),
    ("mount_fdescfs", "yes"),
    ("host_time", "yes"),
    ("jail_zfs", "no"),
    ("jail_zfs_dataset", ""),
    ("allow_chflags", "no"),
    ("allow_mlock", "no"),
    ("allow_mount", "no"),
    ("allow_mount_devfs", "no"),
    ("allow_mount_fdescfs", "no"),
    ("allow_mount_fusefs", "no"),
    ("allow_mount_nullfs", "no"),
    ("allow_mount_procfs", "no"),
    ("allow_mount_tmpfs", "no"),
    ("allow_mount_zfs", "no"),
    ("allow_quotas", "no"),
    ("allow_raw_sockets", "no"),
    ("allow_set_hostname", "yes"),
    ("allow_socket_af", "no"),
    ("allow_sysvipc", "no"),
    ("allow_tun", "no"),
    ("allow_vmm", "no"),
    ("provision.method", ""),
    ("provision.source", ""),
    ("provision.rev", ""),
];

/// Check a jail id: 2-32 chars of alphanumerics, dot, dash, underscore
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid_chars || name.len() < 2 || name.len() > 32 {
        return Err(Error::InvalidJailName(name.to_string()));
    }
    Ok(())
}

/// Typed property map of a jail or of the host defaults resource
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Explicitly set recognised properties
    data: BTreeMap<String, Value>,
    /// Free-form `user.` namespace (stored without the prefix)
    user: BTreeMap<String, Value>,
    /// Host defaults layered over the built-in table
    defaults: BTreeMap<String, Value>,
    handler: Option<ConfigHandler>,
    /// Root path of the bound jail, used for rc.conf side effects
    jail_root: Option<PathBuf>,
    changed: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a resource's config by probing the persistence handlers
    pub fn load(resource_dir: &Path, dataset: &str, zfs: &Zfs) -> Result<Self> {
        let (handler, raw) = ConfigHandler::probe(resource_dir, dataset, zfs)?;
        let (data, user) = split_user_namespace(raw);

        let mut config = Self {
            handler: Some(handler),
            user,
            ..Self::default()
        };
        // interfaces first: `<nic>_mac` keys are only recognised for
        // configured nics
        let mut data = data;
        if let Some(value) = data.remove("interfaces") {
            config.set_value("interfaces", value, true)?;
        }
        for (key, value) in data {
            config.set_value(&key, value, true)?;
        }
        config.changed = false;
        Ok(config)
    }

    /// Attach the host defaults resource (values from `defaults.json`)
    pub fn set_defaults(&mut self, defaults: BTreeMap<String, Value>) {
        self.defaults = defaults;
    }

    /// Bind the jail root path so address properties can maintain the
    /// jail's rc.conf
    pub fn bind_jail_root(&mut self, root: impl Into<PathBuf>) {
        self.jail_root = Some(root.into());
    }

    /// Bind a persistence handler (used when creating a fresh resource)
    pub fn bind_handler(&mut self, handler: ConfigHandler) {
        self.handler = Some(handler);
    }

    fn is_known(&self, key: &str) -> bool {
        if DEFAULTS.iter().any(|(name, _)| *name == key) {
            return true;
        }
        if RESOURCE_LIMIT_NAMES.contains(&key) {
            return true;
        }
        // `<nic>_mac` becomes recognised once the nic is configured
        if let Some(nic) = key.strip_suffix("_mac") {
            return self.interfaces().map(|i| i.contains(nic)).unwrap_or(false);
        }
        false
    }

    /// Get the effective value of a property
    ///
    /// Falls back from the user value to the host defaults and the
    /// built-in defaults. `user.` keys resolve to `Null` when unset.
    pub fn get(&self, key: &str) -> Result<Value> {
        if let Some(user_key) = key.strip_prefix("user.") {
            return Ok(self.user.get(user_key).cloned().unwrap_or(Value::Null));
        }

        if let Some(value) = self.data.get(key) {
            return Ok(value.clone());
        }

        // hostname and uuid default to the jail id
        if matches!(key, "host_hostname" | "host_hostuuid") {
            if let Some(id) = self.data.get("id") {
                return Ok(id.clone());
            }
        }

        if let Some(value) = self.defaults.get(key) {
            return Ok(value.clone());
        }

        if let Some((_, fallback)) = DEFAULTS.iter().find(|(name, _)| *name == key) {
            return Ok(Value::parse_user_input(fallback));
        }

        if RESOURCE_LIMIT_NAMES.contains(&key) || key.ends_with("_mac") {
            if self.is_known(key) {
                return Ok(Value::Null);
            }
        }

        Err(Error::UnknownConfigProperty(key.to_string()))
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        Ok(self.get(key)?.to_config_string())
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.as_bool().unwrap_or(false))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get(key)?
            .as_int()
            .ok_or_else(|| Error::InvalidConfigValue {
                property: key.to_string(),
                reason: "not an integer".into(),
            })
    }

    /// Set a property from user input. Returns whether the stored value
    /// changed.
    pub fn set(&mut self, key: &str, input: &str) -> Result<bool> {
        self.set_value(key, Value::parse_user_input(input), false)
    }

    fn set_value(&mut self, key: &str, value: Value, loading: bool) -> Result<bool> {
        if let Some(user_key) = key.strip_prefix("user.") {
            let changed = self.user.get(user_key) != Some(&value);
            self.user.insert(user_key.to_string(), value);
            self.changed |= changed;
            return Ok(changed);
        }

        let validated = self.validate(key, value)?;

        let changed = self.data.get(key) != Some(&validated);
        if key == "ip6_addr" && !loading {
            self.sync_rtsold(&validated)?;
        }
        self.data.insert(key.to_string(), validated);
        self.changed |= changed;
        Ok(changed)
    }

    /// Validate and canonicalise a property value
    fn validate(&self, key: &str, value: Value) -> Result<Value> {
        match key {
            "id" => {
                let name = value.to_config_string();
                validate_name(&name)?;
                Ok(Value::String(name))
            }
            "ip4_addr" => {
                let parsed =
                    AddressesProp::parse(&value.to_config_string(), AddressFamily::Inet)?;
                Ok(canonical_or_null(parsed.to_string()))
            }
            "ip6_addr" => {
                let parsed =
                    AddressesProp::parse(&value.to_config_string(), AddressFamily::Inet6)?;
                Ok(canonical_or_null(parsed.to_string()))
            }
            "interfaces" => {
                let parsed = InterfacesProp::parse(&value.to_config_string())?;
                Ok(canonical_or_null(parsed.to_string()))
            }
            "resolver" => Ok(Value::String(
                ResolverProp::parse(&value.to_config_string()).to_string(),
            )),
            "basejail_type" => match value.to_config_string().as_str() {
                "" => Ok(Value::Null),
                "nullfs" | "zfs" => Ok(value),
                other => Err(Error::InvalidConfigValue {
                    property: key.to_string(),
                    reason: format!("unknown basejail type '{}'", other),
                }),
            },
            "ip4" | "ip6" => match value.to_config_string().as_str() {
                "new" | "inherit" | "disable" => Ok(value),
                other => Err(Error::InvalidConfigValue {
                    property: key.to_string(),
                    reason: format!("expected new|inherit|disable, got '{}'", other),
                }),
            },
            _ if key.ends_with("_mac") => {
                let nic = key.trim_end_matches("_mac");
                if !self.interfaces()?.contains(nic) {
                    return Err(Error::InvalidConfigValue {
                        property: key.to_string(),
                        reason: format!("nic '{}' is not configured in interfaces", nic),
                    });
                }
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let pair = MacAddressPair::parse(&value.to_config_string())?;
                Ok(Value::String(pair.to_string()))
            }
            _ if RESOURCE_LIMIT_NAMES.contains(&key) => {
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let limit = ResourceLimitProp::parse(&value.to_config_string())?;
                Ok(Value::String(limit.to_string()))
            }
            _ if self.is_known(key) => Ok(value),
            _ => Err(Error::UnknownConfigProperty(key.to_string())),
        }
    }

    /// Toggle rtsold in the jail's rc.conf to match `accept_rtadv` usage
    fn sync_rtsold(&self, ip6_value: &Value) -> Result<()> {
        let Some(root) = &self.jail_root else {
            return Ok(());
        };
        let rc_path = root.join("etc/rc.conf");
        if !rc_path.parent().is_some_and(Path::is_dir) {
            return Ok(());
        }

        let accepts = AddressesProp::parse(&ip6_value.to_config_string(), AddressFamily::Inet6)
            .map(|prop| prop.accepts_rtadv())
            .unwrap_or(false);

        let mut rc_conf = RcConf::load(&rc_path)?;
        rc_conf.set_enabled("rtsold_enable", accepts);
        rc_conf.save()
    }

    /// Remove a user-set value so the fallback applies again
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if let Some(user_key) = key.strip_prefix("user.") {
            self.user.remove(user_key);
            self.changed = true;
            return Ok(());
        }
        if !self.is_known(key) {
            return Err(Error::UnknownConfigProperty(key.to_string()));
        }
        if self.data.remove(key).is_some() {
            self.changed = true;
        }
        Ok(())
    }

    /// Bulk-set a mapping of raw values
    ///
    /// With `skip_on_error`, invalid values are logged and dropped
    /// instead of failing the whole clone.
    pub fn clone_data(
        &mut self,
        data: &BTreeMap<String, Value>,
        skip_on_error: bool,
    ) -> Result<()> {
        for (key, value) in data {
            match self.set_value(key, value.clone(), false) {
                Ok(_) => {}
                Err(error) if skip_on_error => {
                    log::warn!("skipping config property '{}': {}", key, error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// The explicitly set data including the user namespace
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        let mut map = self.data.clone();
        for (key, value) in &self.user {
            map.insert(format!("user.{}", key), value.clone());
        }
        map
    }

    /// Environment variables exposed to hook scripts: every known
    /// property with a non-null effective value
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for (key, _) in DEFAULTS {
            if let Ok(value) = self.get(key) {
                if !value.is_null() {
                    let name = key.to_uppercase().replace('.', "_");
                    env.push((format!("IOCAGE_{}", name), value.to_config_string()));
                }
            }
        }
        env
    }

    /// Persist via the active handler
    pub fn save(&mut self) -> Result<()> {
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| Error::MissingFeature("config has no persistence handler".into()))?;
        handler.write(&self.data, &self.user)?;
        self.changed = false;
        Ok(())
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    // Typed accessors for the special properties

    pub fn ip4_addr(&self) -> Result<AddressesProp> {
        AddressesProp::parse(&self.get_string("ip4_addr")?, AddressFamily::Inet)
    }

    pub fn ip6_addr(&self) -> Result<AddressesProp> {
        AddressesProp::parse(&self.get_string("ip6_addr")?, AddressFamily::Inet6)
    }

    pub fn interfaces(&self) -> Result<InterfacesProp> {
        InterfacesProp::parse(&self.get_string("interfaces")?)
    }

    pub fn resolver(&self) -> Result<ResolverProp> {
        Ok(ResolverProp::parse(&self.get_string("resolver")?))
    }

    /// The configured MAC pair of a nic, if any
    pub fn mac_pair(&self, nic: &str) -> Result<Option<MacAddressPair>> {
        let key = format!("{}_mac", nic);
        if !self.is_known(&key) {
            return Ok(None);
        }
        match self.get(&key)? {
            Value::Null => Ok(None),
            value => Ok(Some(MacAddressPair::parse(&value.to_config_string())?)),
        }
    }

    /// All set resource limits as (resource, limit) pairs
    pub fn resource_limits(&self) -> Vec<(String, ResourceLimitProp)> {
        let mut limits = Vec::new();
        for name in RESOURCE_LIMIT_NAMES {
            if let Some(value) = self.data.get(*name) {
                if value.is_null() {
                    continue;
                }
                if let Ok(limit) = ResourceLimitProp::parse(&value.to_config_string()) {
                    limits.push((name.to_string(), limit));
                }
            }
        }
        limits
    }

    /// Jail filters the `depends` property names
    pub fn depends(&self) -> Vec<String> {
        self.get_string("depends")
            .map(|value| properties::parse_depends(&value))
            .unwrap_or_default()
    }
}

fn canonical_or_null(rendered: String) -> Value {
    if rendered.is_empty() {
        Value::Null
    } else {
        Value::String(rendered)
    }
}

/// Load the host defaults resource from `defaults.json` at a source root
pub fn load_defaults(source_root_dir: &Path) -> Result<BTreeMap<String, Value>> {
    let path = source_root_dir.join("defaults.json");
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let json: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)?;
    Ok(json
        .iter()
        .map(|(key, value)| (key.clone(), Value::from_json(value)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_id(id: &str) -> Config {
        let mut config = Config::new();
        config.set("id", id).unwrap();
        config
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web01").is_ok());
        assert!(validate_name("my.jail_2-x").is_ok());
        assert!(validate_name("a").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_defaults_fallback() {
        let config = Config::new();
        assert_eq!(config.get_string("exec_start").unwrap(), "/bin/sh /etc/rc");
        assert!(!config.get_bool("vnet").unwrap());
        assert_eq!(config.get_int("stop_timeout").unwrap(), 30);
    }

    #[test]
    fn test_host_defaults_layer() {
        let mut config = Config::new();
        let mut defaults = BTreeMap::new();
        defaults.insert("vnet".to_string(), Value::Bool(true));
        config.set_defaults(defaults);
        assert!(config.get_bool("vnet").unwrap());
    }

    #[test]
    fn test_unknown_property_rejected() {
        let mut config = Config::new();
        assert!(matches!(
            config.get("no_such_prop"),
            Err(Error::UnknownConfigProperty(_))
        ));
        assert!(config.set("no_such_prop", "x").is_err());
    }

    #[test]
    fn test_user_namespace_is_free_form() {
        let mut config = Config::new();
        assert!(config.set("user.anything", "value").unwrap());
        assert_eq!(config.get_string("user.anything").unwrap(), "value");
        assert_eq!(config.get("user.unset").unwrap(), Value::Null);
    }

    #[test]
    fn test_set_returns_changed_flag() {
        let mut config = Config::new();
        assert!(config.set("vnet", "yes").unwrap());
        assert!(!config.set("vnet", "on").unwrap());
        assert!(config.set("vnet", "no").unwrap());
    }

    #[test]
    fn test_delete_restores_fallback() {
        let mut config = Config::new();
        config.set("stop_timeout", "60").unwrap();
        assert_eq!(config.get_int("stop_timeout").unwrap(), 60);
        config.delete("stop_timeout").unwrap();
        assert_eq!(config.get_int("stop_timeout").unwrap(), 30);
    }

    #[test]
    fn test_hostname_falls_back_to_id() {
        let config = config_with_id("web01");
        assert_eq!(config.get_string("host_hostname").unwrap(), "web01");
        assert_eq!(config.get_string("host_hostuuid").unwrap(), "web01");
    }

    #[test]
    fn test_address_properties_validate() {
        let mut config = Config::new();
        assert!(config
            .set("ip4_addr", "vnet0|192.168.1.2/24")
            .unwrap());
        assert!(config.set("ip4_addr", "garbage").is_err());
        assert!(config.set("ip6_addr", "vnet0|192.168.1.2/24").is_err());
    }

    #[test]
    fn test_mac_requires_configured_nic() {
        let mut config = Config::new();
        assert!(config
            .set("vnet0_mac", "02ff600000aa,02ff600000ab")
            .is_err());

        config.set("interfaces", "vnet0:bridge0").unwrap();
        assert!(config
            .set("vnet0_mac", "02ff600000aa,02ff600000ab")
            .unwrap());
        assert!(config.mac_pair("vnet0").unwrap().is_some());
    }

    #[test]
    fn test_basejail_type_validation() {
        let mut config = Config::new();
        assert!(config.set("basejail_type", "nullfs").is_ok());
        assert!(config.set("basejail_type", "zfs").is_ok());
        assert!(config.set("basejail_type", "overlay").is_err());
    }

    #[test]
    fn test_rlimit_values() {
        let mut config = Config::new();
        config.set("vmemoryuse", "16g").unwrap();
        let limits = config.resource_limits();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].0, "vmemoryuse");
        assert_eq!(limits[0].1.limit_string(), "deny=16g");
    }

    #[test]
    fn test_clone_data_skip_on_error() {
        let mut config = Config::new();
        let mut data = BTreeMap::new();
        data.insert("vnet".to_string(), Value::Bool(true));
        data.insert("bogus_key".to_string(), Value::Int(1));

        assert!(config.clone_data(&data, false).is_err());
        config.clone_data(&data, true).unwrap();
        assert!(config.get_bool("vnet").unwrap());
    }

    #[test]
    fn test_clone_round_trip() {
        let mut original = config_with_id("web01");
        original.set("vnet", "yes").unwrap();
        original.set("interfaces", "vnet0:bridge0").unwrap();
        original.set("user.note", "kept").unwrap();

        let mut copy = Config::new();
        copy.clone_data(&original.to_map(), false).unwrap();
        assert_eq!(copy.to_map(), original.to_map());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let zfs = Zfs::new();

        let mut config = Config::load(dir.path(), "", &zfs).unwrap();
        config.set("id", "web01").unwrap();
        config.set("release", "13.2-RELEASE").unwrap();
        config.set("vnet", "yes").unwrap();
        config.set("user.note", "imported").unwrap();
        config.save().unwrap();

        let reread = Config::load(dir.path(), "", &zfs).unwrap();
        assert_eq!(reread.to_map(), config.to_map());
    }

    #[test]
    fn test_depends_list() {
        let mut config = Config::new();
        config.set("depends", "db01,cache01").unwrap();
        assert_eq!(config.depends(), vec!["db01", "cache01"]);
    }

    #[test]
    fn test_interfaces_round_trip_secure() {
        let mut config = Config::new();
        config.set("interfaces", "vnet0::bridge0").unwrap();
        let interfaces = config.interfaces().unwrap();
        assert!(interfaces.bridge("vnet0").unwrap().secure_vnet);
        assert_eq!(config.get_string("interfaces").unwrap(), "vnet0::bridge0");
    }
}
