//! Config persistence handlers
//!
//! Three handlers are probed in order when the format is `auto`: JSON
//! (`config.json`), UCL (`config`) and legacy ZFS user properties
//! (`org.freebsd.iocage:<key>`). Probing never mutates anything; saving
//! always goes through the active handler, and the ZFS handler is kept
//! for reading old resources only.

use crate::config::ucl;
use crate::config::value::Value;
use crate::error::{Error, Result};
use crate::zfs::Zfs;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// ZFS user property namespace of the legacy config
pub const ZFS_PROPERTY_PREFIX: &str = "org.freebsd.iocage:";

/// The active persistence format of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Ucl,
    ZfsProperties,
}

/// A probed config location bound to one resource
#[derive(Debug, Clone)]
pub struct ConfigHandler {
    pub format: ConfigFormat,
    resource_dir: PathBuf,
    dataset: String,
}

impl ConfigHandler {
    pub fn json_path(resource_dir: &Path) -> PathBuf {
        resource_dir.join("config.json")
    }

    pub fn ucl_path(resource_dir: &Path) -> PathBuf {
        resource_dir.join("config")
    }

    /// Probe the handlers in order and load whatever is found
    ///
    /// A resource without any config data gets the JSON handler with an
    /// empty map, so the first save creates `config.json`.
    pub fn probe(
        resource_dir: &Path,
        dataset: &str,
        zfs: &Zfs,
    ) -> Result<(Self, BTreeMap<String, Value>)> {
        let json_path = Self::json_path(resource_dir);
        if json_path.is_file() {
            let handler = Self {
                format: ConfigFormat::Json,
                resource_dir: resource_dir.to_path_buf(),
                dataset: dataset.to_string(),
            };
            let data = handler.read()?;
            return Ok((handler, data));
        }

        let ucl_path = Self::ucl_path(resource_dir);
        if ucl_path.is_file() {
            let handler = Self {
                format: ConfigFormat::Ucl,
                resource_dir: resource_dir.to_path_buf(),
                dataset: dataset.to_string(),
            };
            let data = handler.read()?;
            return Ok((handler, data));
        }

        if !dataset.is_empty() {
            let properties = zfs.user_properties(dataset, ZFS_PROPERTY_PREFIX)?;
            if !properties.is_empty() {
                let handler = Self {
                    format: ConfigFormat::ZfsProperties,
                    resource_dir: resource_dir.to_path_buf(),
                    dataset: dataset.to_string(),
                };
                let data = properties
                    .into_iter()
                    .map(|(key, value)| (key, Value::parse_user_input(&value)))
                    .collect();
                return Ok((handler, data));
            }
        }

        Ok((
            Self {
                format: ConfigFormat::Json,
                resource_dir: resource_dir.to_path_buf(),
                dataset: dataset.to_string(),
            },
            BTreeMap::new(),
        ))
    }

    /// Bind a handler of a known format without probing
    pub fn with_format(format: ConfigFormat, resource_dir: &Path, dataset: &str) -> Self {
        Self {
            format,
            resource_dir: resource_dir.to_path_buf(),
            dataset: dataset.to_string(),
        }
    }

    /// Read the config data through this handler
    pub fn read(&self) -> Result<BTreeMap<String, Value>> {
        match self.format {
            ConfigFormat::Json => {
                let content = fs::read_to_string(Self::json_path(&self.resource_dir))?;
                let json: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(&content)?;
                let mut data = BTreeMap::new();
                for (key, value) in &json {
                    // the nested `user` object is flattened to user.* keys
                    if key == "user" {
                        if let serde_json::Value::Object(object) = value {
                            for (user_key, user_value) in object {
                                data.insert(
                                    format!("user.{}", user_key),
                                    Value::from_json(user_value),
                                );
                            }
                            continue;
                        }
                    }
                    data.insert(key.clone(), Value::from_json(value));
                }
                Ok(data)
            }
            ConfigFormat::Ucl => {
                let content = fs::read_to_string(Self::ucl_path(&self.resource_dir))?;
                Ok(ucl::parse(&content)?
                    .into_iter()
                    .map(|(key, value)| (key, Value::parse_user_input(&value)))
                    .collect())
            }
            ConfigFormat::ZfsProperties => {
                let zfs = Zfs::new();
                Ok(zfs
                    .user_properties(&self.dataset, ZFS_PROPERTY_PREFIX)?
                    .into_iter()
                    .map(|(key, value)| (key, Value::parse_user_input(&value)))
                    .collect())
            }
        }
    }

    /// Persist the config data through this handler
    ///
    /// Writes are whole-file replacements; a partially written config is
    /// never observable at the final path.
    pub fn write(
        &self,
        data: &BTreeMap<String, Value>,
        user: &BTreeMap<String, Value>,
    ) -> Result<()> {
        match self.format {
            ConfigFormat::Json => {
                let mut json = serde_json::Map::new();
                for (key, value) in data {
                    json.insert(key.clone(), value.to_json());
                }
                if !user.is_empty() {
                    let mut user_obj = serde_json::Map::new();
                    for (key, value) in user {
                        user_obj.insert(key.clone(), value.to_json());
                    }
                    json.insert("user".to_string(), serde_json::Value::Object(user_obj));
                }
                let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(json))?;
                atomic_write(&Self::json_path(&self.resource_dir), &rendered)
            }
            ConfigFormat::Ucl => {
                let mut entries = BTreeMap::new();
                for (key, value) in data {
                    entries.insert(key.clone(), value.to_config_string());
                }
                for (key, value) in user {
                    entries.insert(format!("user.{}", key), value.to_config_string());
                }
                atomic_write(&Self::ucl_path(&self.resource_dir), &ucl::render(&entries))
            }
            ConfigFormat::ZfsProperties => Err(Error::ConfigZfsIsNotAllowed),
        }
    }
}

/// Replace a file's content in one step via a sibling temp file
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Split `user.*` keys off into their own map
pub fn split_user_namespace(
    mut data: BTreeMap<String, Value>,
) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
    let mut user = BTreeMap::new();

    let user_keys: Vec<String> = data
        .keys()
        .filter(|key| key.starts_with("user."))
        .cloned()
        .collect();
    for key in user_keys {
        if let Some(value) = data.remove(&key) {
            user.insert(key.trim_start_matches("user.").to_string(), value);
        }
    }

    (data, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_prefers_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"release": "13.2-RELEASE", "vnet": "yes"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("config"), "release = \"other\";\n").unwrap();

        let (handler, data) = ConfigHandler::probe(dir.path(), "", &Zfs::new()).unwrap();
        assert_eq!(handler.format, ConfigFormat::Json);
        assert_eq!(data["release"], Value::String("13.2-RELEASE".into()));
        assert_eq!(data["vnet"], Value::Bool(true));
    }

    #[test]
    fn test_probe_falls_back_to_ucl() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config"), "release = \"12.1-RELEASE\";\n").unwrap();

        let (handler, data) = ConfigHandler::probe(dir.path(), "", &Zfs::new()).unwrap();
        assert_eq!(handler.format, ConfigFormat::Ucl);
        assert_eq!(data["release"], Value::String("12.1-RELEASE".into()));
    }

    #[test]
    fn test_probe_empty_resource_defaults_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, data) = ConfigHandler::probe(dir.path(), "", &Zfs::new()).unwrap();
        assert_eq!(handler.format, ConfigFormat::Json);
        assert!(data.is_empty());
    }

    #[test]
    fn test_json_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConfigHandler::with_format(ConfigFormat::Json, dir.path(), "");

        let mut data = BTreeMap::new();
        data.insert("release".to_string(), Value::String("13.2-RELEASE".into()));
        data.insert("vnet".to_string(), Value::Bool(true));
        data.insert("priority".to_string(), Value::Int(10));
        let mut user = BTreeMap::new();
        user.insert("comment".to_string(), Value::String("hello".into()));

        handler.write(&data, &user).unwrap();
        let reread = handler.read().unwrap();
        assert_eq!(reread["release"], Value::String("13.2-RELEASE".into()));
        assert_eq!(reread["vnet"], Value::Bool(true));
        assert_eq!(reread["priority"], Value::Int(10));
    }

    #[test]
    fn test_zfs_handler_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let handler =
            ConfigHandler::with_format(ConfigFormat::ZfsProperties, dir.path(), "zroot/x");
        assert!(matches!(
            handler.write(&BTreeMap::new(), &BTreeMap::new()),
            Err(Error::ConfigZfsIsNotAllowed)
        ));
    }

    #[test]
    fn test_split_user_namespace() {
        let mut data = BTreeMap::new();
        data.insert("release".to_string(), Value::String("x".into()));
        data.insert("user.note".to_string(), Value::String("flat".into()));

        let (data, user) = split_user_namespace(data);

        assert!(data.contains_key("release"));
        assert!(!data.keys().any(|k| k.starts_with("user")));
        assert_eq!(user["note"], Value::String("flat".into()));
    }

    #[test]
    fn test_json_nested_user_object_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"release": "13.2-RELEASE", "user": {"note": "hello"}}"#,
        )
        .unwrap();

        let (_, data) = ConfigHandler::probe(dir.path(), "", &Zfs::new()).unwrap();
        assert_eq!(data["user.note"], Value::String("hello".into()));
    }
}
