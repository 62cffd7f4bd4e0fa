//! Jail lifecycle engine
//!
//! A `Jail` is a dataset under `jails/` with a config, an fstab, a storage
//! backend and zero or more VNET interfaces. This module owns the state
//! machine around it: create from a release or another jail, start with
//! hook scripts and rollback, execute commands inside, stop with full
//! teardown, rename, back up and destroy.

pub mod devfs;
pub mod jexec;
pub mod launch;
pub mod state;

use crate::config::properties::ResolverProp;
use crate::config::value::Value;
use crate::config::{validate_name, Config};
use crate::error::{Error, Result};
use crate::events::{EventType, Scope};
use crate::fstab::{BasejailSource, Fstab};
use crate::host::{sysctl_get_i32, Host};
use crate::jail::devfs::{DevfsRules, DEVFS_RULES_FILE};
use crate::jail::jexec::{jexec_passthru, jexec_with_output, ExecOutput};
use crate::jail::launch::{LaunchCommand, LaunchScripts, RELATIVE_HOOK_SCRIPT_DIR};
use crate::jail::state::JailState;
use crate::network::Network;
use crate::release::Release;
use crate::storage::{Storage, StorageBackend};
use crate::zfs::SnapshotId;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// Options of a start operation
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Skip persisting unchanged generated files
    pub quick: bool,
    /// Launch non-persistent and run this single command
    pub single_command: Option<String>,
    /// Start jails named in `depends` first
    pub start_dependant_jails: bool,
}

/// A jail bound to its host context
pub struct Jail<'a> {
    pub host: &'a Host,
    /// Source root the jail lives under
    pub source: String,
    pub config: Config,
    state: JailState,
    /// Set for jails living outside `jails/` (e.g. the throwaway update
    /// jail rooted at a release dataset)
    dataset_override: Option<String>,
}

impl<'a> Jail<'a> {
    /// Open an existing jail by identifier (id, full name or UUID prefix)
    pub fn open(host: &'a Host, identifier: &str) -> Result<Self> {
        let (source, id) = resolve_name(host, identifier)?;
        let root = host.datasets.source(&source)?;
        let dataset = root.jail_dataset(&id);
        if !host.zfs.dataset_exists(&dataset) {
            return Err(Error::JailDoesNotExist(id));
        }
        let dataset_path = host.zfs.mountpoint(&dataset)?;

        let mut config = Config::load(&dataset_path, &dataset, &host.zfs)?;
        config.set_defaults(crate::config::load_defaults(
            &host.zfs.mountpoint(&root.root)?,
        )?);
        if config.get_string("id").unwrap_or_default().is_empty() {
            config.set("id", &id)?;
        }
        config.bind_jail_root(dataset_path.join("root"));

        let mut jail = Self {
            host,
            source,
            config,
            state: JailState::new(""),
            dataset_override: None,
        };
        jail.state = JailState::new(jail.identifier());
        jail.update_state()?;
        Ok(jail)
    }

    /// Bind a new (not yet created) jail with the given id
    pub fn new(host: &'a Host, id: &str) -> Result<Self> {
        validate_name(id)?;
        let source = host
            .datasets
            .iter()
            .next()
            .map(|(name, _)| name.clone())
            .ok_or(Error::NotActivated)?;

        let mut config = Config::new();
        config.set("id", id)?;

        let mut jail = Self {
            host,
            source,
            config,
            state: JailState::new(""),
            dataset_override: None,
        };
        jail.state = JailState::new(jail.identifier());
        Ok(jail)
    }

    /// Bind a jail rooted at an arbitrary dataset (must hold a `root`
    /// child). Used for throwaway jails such as the release updater's.
    pub fn with_dataset(host: &'a Host, id: &str, dataset: &str) -> Result<Self> {
        let mut jail = Self::new(host, id)?;
        jail.dataset_override = Some(dataset.to_string());
        jail.state = JailState::new(jail.identifier());
        Ok(jail)
    }

    // Naming

    /// The configured jail id
    pub fn name(&self) -> String {
        self.config.get_string("id").unwrap_or_default()
    }

    /// `<source>/<id>` when several sources exist, else the id
    pub fn full_name(&self) -> String {
        self.host.datasets.full_name(&self.source, &self.name())
    }

    /// Shortened name for logs; UUID ids collapse to their first 8 chars
    pub fn humanreadable_name(&self) -> String {
        to_humanreadable_name(&self.name())
    }

    /// Kernel-visible name: `<source>-<id>` with dots replaced, since
    /// jail(8) treats dotted names as hierarchical
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.source, self.name()).replace('.', "*")
    }

    // Datasets and paths

    pub fn dataset(&self) -> Result<String> {
        if let Some(dataset) = &self.dataset_override {
            return Ok(dataset.clone());
        }
        Ok(self
            .host
            .datasets
            .source(&self.source)?
            .jail_dataset(&self.name()))
    }

    pub fn root_dataset(&self) -> Result<String> {
        Ok(format!("{}/root", self.dataset()?))
    }

    pub fn dataset_path(&self) -> Result<PathBuf> {
        self.host.zfs.mountpoint(&self.dataset()?)
    }

    pub fn root_path(&self) -> Result<PathBuf> {
        self.host.zfs.mountpoint(&self.root_dataset()?)
    }

    pub fn launch_script_dir(&self) -> Result<PathBuf> {
        Ok(self.dataset_path()?.join("launch-scripts"))
    }

    fn launch_scripts(&self) -> Result<LaunchScripts> {
        Ok(LaunchScripts::new(
            self.launch_script_dir()?,
            self.identifier(),
        ))
    }

    // State

    pub fn exists(&self) -> bool {
        self.dataset()
            .map(|dataset| self.host.zfs.dataset_exists(&dataset))
            .unwrap_or(false)
    }

    /// Refresh the cached jls snapshot
    pub fn update_state(&mut self) -> Result<()> {
        self.state = JailState::query(&self.identifier(), &self.host.os_version)?;
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.state.running()
    }

    pub fn jid(&self) -> Option<i32> {
        self.state.jid
    }

    fn require_existing(&self) -> Result<()> {
        if self.exists() {
            Ok(())
        } else {
            Err(Error::JailDoesNotExist(self.humanreadable_name()))
        }
    }

    fn require_not_existing(&self) -> Result<()> {
        if self.exists() {
            Err(Error::JailAlreadyExists(self.humanreadable_name()))
        } else {
            Ok(())
        }
    }

    fn require_stopped(&self) -> Result<()> {
        if self.running() {
            Err(Error::JailAlreadyRunning(self.humanreadable_name()))
        } else {
            Ok(())
        }
    }

    fn require_running(&self) -> Result<()> {
        if self.running() {
            Ok(())
        } else {
            Err(Error::JailNotRunning(self.humanreadable_name()))
        }
    }

    fn require_not_template(&self) -> Result<()> {
        if self.config.get_bool("template")? {
            Err(Error::JailIsTemplate(self.humanreadable_name()))
        } else {
            Ok(())
        }
    }

    // Collaborators

    /// The release this jail was created from, if configured
    pub fn release(&self) -> Result<Option<Release<'a>>> {
        let name = self.config.get_string("release")?;
        if name.is_empty() {
            return Ok(None);
        }
        Ok(Some(Release::new(self.host, &name)?))
    }

    pub fn is_basejail(&self) -> Result<bool> {
        self.config.get_bool("basejail")
    }

    pub fn storage(&self) -> Result<Storage<'a>> {
        let backend = StorageBackend::from_config(
            self.is_basejail()?,
            &self.config.get_string("basejail_type")?,
        )?;
        Ok(Storage {
            zfs: &self.host.zfs,
            jail_dataset: self.dataset()?,
            root_path: self.root_path()?,
            backend,
            basedirs: self
                .host
                .distribution
                .basedirs()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    /// The jail's fstab with the basejail auto block configured
    pub fn fstab(&self) -> Result<Fstab> {
        let mut fstab = Fstab::new(self.dataset_path()?);
        if self.is_basejail()?
            && self.storage()?.backend == StorageBackend::NullfsBasejail
        {
            if let Some(release) = self.release()? {
                let snapshot = release.current_snapshot()?;
                let release_root = release.root_path()?;
                fstab.set_basejail_source(Some(BasejailSource {
                    snapshot_root: release_root.join(".zfs/snapshot").join(&snapshot.name),
                    basedirs: self
                        .host
                        .distribution
                        .basedirs()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                }));
            }
        }
        fstab.read_file()?;
        Ok(fstab)
    }

    /// The configured VNET interfaces
    pub fn networks(&self) -> Result<Vec<Network>> {
        let interfaces = self.config.interfaces()?;
        let ip4 = self.config.ip4_addr()?;
        let ip6 = self.config.ip6_addr()?;
        let mac_prefix = self.config.get_string("mac_prefix")?;

        let mut networks = Vec::new();
        for (nic, bridge) in interfaces.iter() {
            networks.push(Network {
                nic: nic.clone(),
                bridge: Some(bridge.clone()),
                ipv4_addresses: ip4.addresses(nic).to_vec(),
                ipv6_addresses: ip6.addresses(nic).to_vec(),
                mtu: None,
                mac_pair: self.config.mac_pair(nic)?,
                jail_name: self.humanreadable_name(),
                jail_full_name: self.full_name(),
                jail_identifier: self.identifier(),
                mac_prefix: mac_prefix.clone(),
            });
        }
        Ok(networks)
    }

    /// Environment exposed to hook scripts and in-jail commands
    pub fn env(&self) -> Result<Vec<(String, String)>> {
        let mut env = self.config.env();
        env.push((
            "IOCAGE_JID".to_string(),
            self.jid().map(|j| j.to_string()).unwrap_or("-1".into()),
        ));
        env.push((
            "IOCAGE_JAIL_PATH".to_string(),
            self.root_path()?.to_string_lossy().to_string(),
        ));
        for network in self.networks()? {
            env.extend(network.env());
        }
        Ok(env)
    }

    // Creation

    /// Create the jail from a release's current snapshot
    pub fn create_from_release(&mut self, scope: &mut Scope, release: &Release) -> Result<()> {
        if !release.fetched() {
            return Err(Error::ReleaseNotFetched(release.name.clone()));
        }
        self.config.set("release", &release.full_name())?;
        let snapshot = release.current_snapshot()?;
        self.create_from_snapshot(scope, &snapshot)
    }

    /// Create the jail by snapshotting and cloning another jail's root
    pub fn create_from_jail(&mut self, scope: &mut Scope, source: &Jail) -> Result<()> {
        source.require_stopped()?;
        let snapshot_name = format!("clone-{}", self.name());
        let source_root = source.root_dataset()?;
        self.host.zfs.snapshot(&source_root, &snapshot_name, false)?;

        for (key, value) in source.config.to_map() {
            if key != "id" && key != "template" {
                let _ = self.config.set_value_raw(&key, value);
            }
        }

        self.create_from_snapshot(
            scope,
            &SnapshotId {
                dataset: source_root,
                name: snapshot_name,
            },
        )
    }

    /// Create the jail with an empty root dataset
    pub fn create_from_scratch(&mut self, scope: &mut Scope) -> Result<()> {
        scope.run(
            EventType::JailClone,
            Some(self.humanreadable_name()),
            |_, event| {
                self.create_skeleton(event)?;
                self.host.zfs.create_dataset(&self.root_dataset()?)?;
                self.save()
            },
        )
    }

    fn create_from_snapshot(&mut self, scope: &mut Scope, snapshot: &SnapshotId) -> Result<()> {
        scope.run(
            EventType::JailClone,
            Some(self.humanreadable_name()),
            |_, event| {
                self.create_skeleton(event)?;
                self.storage()?.setup(snapshot)?;
                self.save()
            },
        )
    }

    fn create_skeleton(&mut self, event: &mut crate::events::Event) -> Result<()> {
        self.require_not_existing()?;
        validate_name(&self.name())?;

        let dataset = self.dataset()?;
        let zfs = self.host.zfs.clone();
        self.host.zfs.create_dataset(&dataset)?;
        event.add_rollback_step(move || zfs.destroy_recursive(&dataset));

        let dataset_path = self.dataset_path()?;
        self.config.bind_jail_root(dataset_path.join("root"));
        self.config.bind_handler(crate::config::persist::ConfigHandler::with_format(
            crate::config::persist::ConfigFormat::Json,
            &dataset_path,
            &self.dataset()?,
        ));
        Ok(())
    }

    /// Persist config and fstab
    pub fn save(&mut self) -> Result<()> {
        self.config.save()?;
        self.fstab()?.save()
    }

    // Start

    /// Start the jail
    ///
    /// Every side effect registers a rollback step; a failed launch leaves
    /// no mounts, epairs, firewall rules or jail instances behind.
    pub fn start(&mut self, scope: &mut Scope, options: &StartOptions) -> Result<()> {
        let mut seen = vec![self.full_name()];
        self.start_with_seen(scope, options, &mut seen)
    }

    fn start_with_seen(
        &mut self,
        scope: &mut Scope,
        options: &StartOptions,
        dependant_jails_seen: &mut Vec<String>,
    ) -> Result<()> {
        self.require_existing()?;
        self.require_not_template()?;
        self.require_stopped()?;

        self.apply_resolver()?;

        let mut started_dependants: Vec<String> = Vec::new();
        if options.start_dependant_jails {
            started_dependants =
                self.start_dependant_jails(scope, dependant_jails_seen)?;
        }

        self.ensure_script_dir()?;
        let jail_hook_dir = self.root_path()?.join(RELATIVE_HOOK_SCRIPT_DIR.trim_start_matches('/'));
        if !jail_hook_dir.is_dir() {
            fs::create_dir_all(&jail_hook_dir)?;
        }

        let scripts = self.launch_scripts()?;

        // assemble the four start-phase command lists
        let mut exec_prestart: Vec<String> = self.resource_limit_commands();
        let mut exec_created: Vec<String> = vec![
            format!(
                "echo \"export IOCAGE_JID=$IOCAGE_JID\" > {}",
                scripts.env_path().display()
            ),
            "set -eu".to_string(),
        ];
        let mut exec_start: Vec<String> =
            vec![format!(". {}/.env", RELATIVE_HOOK_SCRIPT_DIR)];
        let mut exec_poststart: Vec<String> = Vec::new();

        if self.config.get_bool("vnet")? {
            for network in self.networks()? {
                let (created, start) = network.setup()?;
                exec_created.extend(created);
                exec_start.extend(start);
            }
            exec_start.push("/sbin/ifconfig lo0 localhost".to_string());
            exec_start.extend(self.route_commands()?);
            if host_ipfw_enabled() {
                exec_start.push("service ipfw onestop".to_string());
            }
        }

        if self.config.get_bool("jail_zfs")? {
            let (created, start) = self.zfs_share_commands()?;
            exec_created.extend(created);
            exec_start.extend(start);
        }

        for (list, key) in [
            (&mut exec_prestart, "exec_prestart"),
            (&mut exec_created, "exec_created"),
            (&mut exec_poststart, "exec_poststart"),
        ] {
            let value = self.config.get_string(key)?;
            if !value.is_empty() {
                list.push(value);
            }
        }
        if options.single_command.is_none() {
            let value = self.config.get_string("exec_start")?;
            if !value.is_empty() {
                exec_start.push(value);
            }
        }

        scripts.write_hook_script("prestart", &exec_prestart)?;
        scripts.write_hook_script("created", &exec_created)?;
        scripts.write_hook_script("start", &exec_start)?;
        scripts.write_hook_script(
            "poststart",
            &[
                vec![
                    "set -eu".to_string(),
                    "/bin/echo running exec.created hook on the host".to_string(),
                    format!("/bin/sh {} 2>&1", scripts.hook_script_path("created").display()),
                    "/bin/echo running exec.start hook in the jail".to_string(),
                    format!(
                        "/usr/sbin/jexec {} {}/start.sh",
                        self.identifier(),
                        RELATIVE_HOOK_SCRIPT_DIR
                    ),
                    "/bin/echo running exec.poststart hook on the host".to_string(),
                ],
                exec_poststart,
            ]
            .concat(),
        )?;

        let identifier = self.identifier();
        scope.run(
            EventType::JailLaunch,
            Some(self.humanreadable_name()),
            |_, event| {
                // rollback: stop this jail and every dependant started for it
                let conf_path = scripts.jail_conf_path();
                let prestop = scripts.hook_script_path("prestop");
                let poststop = scripts.hook_script_path("poststop");
                let rollback_identifier = identifier.clone();
                event.add_rollback_step(move || {
                    force_stop_by_paths(&rollback_identifier, &conf_path, &prestop, &poststop)
                });

                if self.is_basejail()? {
                    let base_dataset = match self.release()? {
                        Some(release) => Some(release.base_dataset()?),
                        None => None,
                    };
                    self.storage()?.apply(base_dataset.as_deref())?;
                }

                if !options.quick {
                    self.fstab()?.save()?;
                }

                self.prepare_stop()?;

                let result = match &options.single_command {
                    None => self.launch_persistent(&scripts),
                    Some(command) => self.launch_single_command(&scripts, command),
                };

                match result {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        // dependants started for this jail roll back too
                        for name in started_dependants.iter().rev() {
                            if let Ok(mut dependant) = Jail::open(self.host, name) {
                                let mut quiet = Scope::new();
                                let _ = dependant.stop(&mut quiet, true);
                            }
                        }
                        Err(error)
                    }
                }
            },
        )
    }

    fn start_dependant_jails(
        &self,
        scope: &mut Scope,
        dependant_jails_seen: &mut Vec<String>,
    ) -> Result<Vec<String>> {
        let depends = self.config.depends();
        if depends.is_empty() {
            return Ok(Vec::new());
        }

        scope.run(
            EventType::JailDependantsStart,
            Some(self.humanreadable_name()),
            |scope, _| {
                let mut started = Vec::new();
                let mut candidates: Vec<(i64, String)> = Vec::new();

                for name in list_jails(self.host)? {
                    if !depends.iter().any(|term| matches_filter(&name, term)) {
                        continue;
                    }
                    if dependant_jails_seen.contains(&name) {
                        log::warn!(
                            "Circular dependency on jail '{}' - skipping recursion",
                            name
                        );
                        continue;
                    }
                    let jail = Jail::open(self.host, &name)?;
                    let priority = jail.config.get_int("priority").unwrap_or(99);
                    candidates.push((priority, name));
                }

                candidates.sort();
                let names: Vec<String> =
                    candidates.into_iter().map(|(_, name)| name).collect();
                for name in dependency_order(self.host, &names)? {
                    dependant_jails_seen.push(name.clone());
                    let mut dependant = Jail::open(self.host, &name)?;
                    if dependant.running() {
                        continue;
                    }
                    dependant.start_with_seen(
                        scope,
                        &StartOptions {
                            start_dependant_jails: true,
                            ..StartOptions::default()
                        },
                        dependant_jails_seen,
                    )?;
                    started.push(name);
                }
                Ok(started)
            },
        )
    }

    /// Write the jail's resolv.conf according to the resolver property
    fn apply_resolver(&self) -> Result<()> {
        let resolver = self.config.resolver()?;
        let destination = self.root_path()?.join("etc/resolv.conf");
        match resolver {
            ResolverProp::Copy => {
                fs::copy("/etc/resolv.conf", &destination)?;
                log::debug!("resolv.conf copied from host");
            }
            ResolverProp::Manual(lines) => {
                fs::write(&destination, lines.join("\n") + "\n")?;
                log::debug!("resolv.conf written manually");
            }
            ResolverProp::Skip => {
                log::debug!("resolv.conf not touched");
            }
        }
        Ok(())
    }

    /// The launch-scripts directory must stay inside the jail dataset
    fn ensure_script_dir(&self) -> Result<()> {
        let dir = self.launch_script_dir()?;
        let dataset_path = self.dataset_path()?;
        let real = dir.canonicalize().unwrap_or(dir.clone());
        if !real.starts_with(&dataset_path) {
            return Err(Error::JailEscape {
                path: real,
                root: dataset_path,
            });
        }
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn resource_limit_commands(&self) -> Vec<String> {
        if !self.config.get_bool("rlimits").unwrap_or(false) {
            log::debug!("Resource limits disabled");
            return Vec::new();
        }
        let identifier = self.identifier();
        self.config
            .resource_limits()
            .iter()
            .map(|(resource, limit)| {
                format!(
                    "/usr/bin/rctl -a jail:{}:{}:{}",
                    identifier,
                    resource,
                    limit.limit_string()
                )
            })
            .collect()
    }

    fn clear_resource_limit_commands(&self) -> Vec<String> {
        if !self.config.get_bool("rlimits").unwrap_or(false) {
            return Vec::new();
        }
        vec![format!(
            "/usr/bin/rctl -r jail:{} 2>/dev/null || true",
            self.identifier()
        )]
    }

    fn route_commands(&self) -> Result<Vec<String>> {
        let mut commands = Vec::new();
        let defaultrouter = self.config.get_string("defaultrouter")?;
        if !defaultrouter.is_empty() {
            commands.push(format!("/sbin/route add default {}", defaultrouter));
        }
        let defaultrouter6 = self.config.get_string("defaultrouter6")?;
        if !defaultrouter6.is_empty() {
            commands.push(format!("/sbin/route add -6 default {}", defaultrouter6));
        }
        Ok(commands)
    }

    /// Commands attaching and mounting the shared ZFS dataset
    fn zfs_share_commands(&self) -> Result<(Vec<String>, Vec<String>)> {
        let dataset = self.config.get_string("jail_zfs_dataset")?;
        if dataset.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        if !self.host.zfs.dataset_exists(&dataset) {
            return Err(Error::DatasetNotAvailable(dataset));
        }
        self.host.zfs.set_property(&dataset, "jailed", "on")?;
        let created = vec![format!("/sbin/zfs jail $IOCAGE_JID {}", dataset)];
        let start = vec![format!("/sbin/zfs mount {} || true", dataset)];
        Ok((created, start))
    }

    fn zfs_share_stop_commands(&self) -> Result<(Vec<String>, Vec<String>)> {
        let dataset = self.config.get_string("jail_zfs_dataset")?;
        if dataset.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let stop = vec![format!("/sbin/zfs umount {} || true", dataset)];
        let poststop = vec![format!(
            "/sbin/zfs unjail $IOCAGE_JID {} 2>/dev/null || true",
            dataset
        )];
        Ok((stop, poststop))
    }

    /// Resolve the devfs ruleset the jail starts with
    fn resolve_devfs_ruleset(&self) -> Result<u32> {
        let configured = self.config.get_string("devfs_ruleset")?;
        let dhcp = self
            .config
            .get_string("ip4_addr")?
            .to_ascii_lowercase()
            .contains("dhcp");
        let zfs = self.config.get_bool("jail_zfs")?
            || self.config.get_bool("allow_mount_zfs")?;
        let mut rules = DevfsRules::load(DEVFS_RULES_FILE)?;
        rules.resolve(&configured, dhcp, zfs)
    }

    fn launch_persistent(&mut self, scripts: &LaunchScripts) -> Result<()> {
        let devfs_ruleset = self.resolve_devfs_ruleset()?;
        let root_path = self.root_path()?;
        let fstab_path = self.dataset_path()?.join("fstab");
        let identifier = self.identifier();

        let command = LaunchCommand {
            config: &self.config,
            identifier: &identifier,
            root_path: &root_path,
            fstab_path: &fstab_path,
            devfs_ruleset,
            scripts,
        }
        .persistent()?;

        self.exec_host_command(&command)?;
        self.update_state()?;
        log::info!(
            "Jail '{}' started with JID {}",
            self.humanreadable_name(),
            self.jid().unwrap_or(-1)
        );
        Ok(())
    }

    fn launch_single_command(
        &mut self,
        scripts: &LaunchScripts,
        jail_command: &str,
    ) -> Result<()> {
        let identifier = self.identifier();

        scripts.write_hook_script(
            "host_command",
            &[
                format!(
                    "IOCAGE_JID=$(/usr/sbin/jls -j {} jid 2>&1 || echo -1)",
                    identifier
                ),
                "set -e".to_string(),
                format!("/bin/sh {}", scripts.hook_script_path("created").display()),
                format!(
                    "/usr/sbin/jexec {} {}/command.sh 2>&1",
                    identifier, RELATIVE_HOOK_SCRIPT_DIR
                ),
                format!("/bin/sh {}", scripts.hook_script_path("poststop").display()),
            ],
        )?;

        let mut command_body = Vec::new();
        if host_ipfw_enabled() {
            command_body.push("set +e".to_string());
            command_body.push("service ipfw onestop".to_string());
        }
        command_body.push("set -e".to_string());
        command_body.push(format!(". {}/start.sh", RELATIVE_HOOK_SCRIPT_DIR));
        command_body.push(jail_command.to_string());
        scripts.write_hook_script("command", &command_body)?;

        let devfs_ruleset = self.resolve_devfs_ruleset()?;
        let root_path = self.root_path()?;
        let fstab_path = self.dataset_path()?.join("fstab");
        let command = LaunchCommand {
            config: &self.config,
            identifier: &identifier,
            root_path: &root_path,
            fstab_path: &fstab_path,
            devfs_ruleset,
            scripts,
        }
        .single_command()?;

        self.exec_host_command(&command)
    }

    fn exec_host_command(&self, command: &[String]) -> Result<()> {
        let mut process = Command::new(&command[0]);
        process.args(&command[1..]);
        for (key, value) in self.env()? {
            process.env(key, value);
        }

        let output = process.output().map_err(|e| Error::CommandFailure {
            command: command[0].clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::JailLaunchFailed {
                jail: self.humanreadable_name(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    // Stop

    /// Write the stop-phase hook scripts and jail.conf
    fn prepare_stop(&self) -> Result<()> {
        self.ensure_script_dir()?;
        let scripts = self.launch_scripts()?;

        let mut exec_prestop: Vec<String> = Vec::new();
        let mut exec_stop: Vec<String> = Vec::new();
        let mut exec_poststop: Vec<String> = self.teardown_mount_commands()?;
        exec_poststop.extend(self.clear_resource_limit_commands());

        let prestop_value = self.config.get_string("exec_prestop")?;
        if !prestop_value.is_empty() {
            exec_prestop.push(prestop_value);
        }
        let stop_value = self.config.get_string("exec_stop")?;
        if !stop_value.is_empty() {
            exec_stop.push(stop_value);
        }
        let poststop_value = self.config.get_string("exec_poststop")?;
        if !poststop_value.is_empty() {
            exec_poststop.push(poststop_value);
        }

        if self.config.get_bool("vnet")? {
            let mut teardown: Vec<String> = Vec::new();
            for network in self.networks()? {
                teardown.extend(network.teardown());
            }
            teardown.extend(exec_poststop);
            exec_poststop = teardown;
        }

        if self.config.get_bool("jail_zfs")? {
            let (stop, poststop) = self.zfs_share_stop_commands()?;
            exec_stop.extend(stop);
            exec_poststop.extend(poststop);
        }

        scripts.write_hook_script("prestop", &exec_prestop)?;
        scripts.write_hook_script("stop", &exec_stop)?;
        scripts.write_hook_script("poststop", &exec_poststop)?;
        scripts.write_jail_conf(&self.config.get_string("exec_jail_user")?, false)?;
        Ok(())
    }

    /// Commands unmounting everything the jail mounted
    fn teardown_mount_commands(&self) -> Result<Vec<String>> {
        let root_path = self.root_path()?;
        let fstab = self.fstab()?;

        let mut mountpoints: Vec<String> = fstab
            .entries()
            .iter()
            .filter_map(|entry| entry.destination())
            .map(|path| path.to_string_lossy().to_string())
            .collect();

        for asset in [
            "/dev/fd",
            "/dev",
            "/proc",
            "/root/compat/linux/proc",
            "/root/etcupdate",
            "/root/usr/ports",
            "/root/usr/src",
            "/tmp",
        ] {
            let path = PathBuf::from(format!("{}{}", root_path.display(), asset));
            if path.is_dir() {
                mountpoints.push(path.to_string_lossy().to_string());
            }
        }

        let mut commands = Vec::new();
        if !mountpoints.is_empty() {
            commands.push(format!(
                "/sbin/umount -f {} 2>/dev/null || true",
                mountpoints.join(" ")
            ));
        }
        commands.push(format!(
            "/sbin/umount -a -F {} -f 2>/dev/null || true",
            fstab.path().display()
        ));
        Ok(commands)
    }

    /// Stop the jail
    ///
    /// With `force`, failures of `jail -r` fall back to running the
    /// prestop and poststop scripts manually so teardown still happens.
    pub fn stop(&mut self, scope: &mut Scope, force: bool) -> Result<()> {
        if !force {
            self.require_existing()?;
            self.require_running()?;
        }

        self.prepare_stop()?;
        let scripts = self.launch_scripts()?;
        scripts.write_jail_conf(&self.config.get_string("exec_jail_user")?, force)?;

        let result = scope.run(
            EventType::JailDestroy,
            Some(self.humanreadable_name()),
            |_, _| self.destroy_jail_process(&scripts),
        );

        if let Err(error) = result {
            if force {
                log::debug!("Manually executing prestop and poststop hooks");
                for hook in ["prestop", "poststop"] {
                    let path = scripts.hook_script_path(hook);
                    let status = Command::new("/bin/sh").arg(&path).status();
                    if let Err(e) = status {
                        log::warn!("{} hook failed: {}", hook, e);
                    }
                }
            } else {
                return Err(error);
            }
        }

        self.update_state()?;
        Ok(())
    }

    fn destroy_jail_process(&self, scripts: &LaunchScripts) -> Result<()> {
        let status = Command::new("/usr/sbin/jail")
            .args(["-v", "-r", "-f"])
            .arg(scripts.jail_conf_path())
            .arg(self.identifier())
            .output()
            .map_err(|e| Error::CommandFailure {
                command: "jail -r".into(),
                message: e.to_string(),
            })?;

        if !status.status.success() {
            return Err(Error::JailDestructionFailed {
                jail: self.humanreadable_name(),
                reason: String::from_utf8_lossy(&status.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    // Exec

    /// Execute a command inside the running jail, capturing output
    pub fn exec(&self, command: &[String]) -> Result<ExecOutput> {
        self.require_running()?;
        let jid = self.jid().ok_or_else(|| {
            Error::JailNotRunning(self.humanreadable_name())
        })?;
        jexec_with_output(jid, command, &self.env()?)
    }

    /// Execute a command inside the running jail on the caller's tty
    pub fn passthru(&self, command: &[String]) -> Result<i32> {
        self.require_running()?;
        let jid = self.jid().ok_or_else(|| {
            Error::JailNotRunning(self.humanreadable_name())
        })?;
        jexec_passthru(jid, command, &self.env()?)
    }

    /// Start the jail non-persistently, run one command and tear it down
    ///
    /// `config_override` entries are applied to a deep copy of the config;
    /// the stored config is untouched.
    pub fn fork_exec(
        &mut self,
        scope: &mut Scope,
        command: &str,
        config_override: &BTreeMap<String, Value>,
    ) -> Result<()> {
        self.require_existing()?;
        self.require_stopped()?;

        let original_config = self.config.clone();

        let result = (|| {
            self.config.clone_data(config_override, false)?;
            self.start(
                scope,
                &StartOptions {
                    quick: true,
                    single_command: Some(command.to_string()),
                    start_dependant_jails: false,
                },
            )
        })();

        self.config = original_config;
        result
    }

    // Rename / destroy

    /// Rename a stopped jail: config, dataset, origin snapshot and fstab
    /// paths all move together
    pub fn rename(&mut self, scope: &mut Scope, new_name: &str) -> Result<()> {
        self.require_existing()?;
        self.require_stopped()?;
        validate_name(new_name)?;

        let old_mountpoint = self.dataset_path()?;
        let storage = self.storage()?;
        let new_dataset = self
            .host
            .datasets
            .source(&self.source)?
            .jail_dataset(new_name);

        scope.run(
            EventType::JailRename,
            Some(self.humanreadable_name()),
            |scope, _| {
                storage.rename(scope, &new_dataset, new_name)?;
                self.config.set("id", new_name)?;

                let new_mountpoint = self.host.zfs.mountpoint(&new_dataset)?;
                let mut fstab = self.fstab()?;
                fstab.replace_path(
                    &old_mountpoint.to_string_lossy(),
                    &new_mountpoint.to_string_lossy(),
                );
                fstab.save()?;
                self.config.save()
            },
        )
    }

    /// Destroy the jail and its datasets
    pub fn destroy(&mut self, scope: &mut Scope, force: bool) -> Result<()> {
        self.require_existing()?;
        if self.running() {
            if !force {
                return Err(Error::JailAlreadyRunning(self.humanreadable_name()));
            }
            self.stop(scope, true)?;
        }

        let dataset = self.dataset()?;
        scope.run(
            EventType::ZfsDatasetDestroy,
            Some(dataset.clone()),
            |_, _| self.host.zfs.destroy_recursive(&dataset),
        )
    }
}

impl Config {
    /// Raw value set used when copying between configs
    pub(crate) fn set_value_raw(&mut self, key: &str, value: Value) -> Result<bool> {
        self.set(key, &value.to_config_string())
    }
}

/// Stop a jail knowing only its identifier and generated file paths
///
/// Used as a rollback step of the launch event, where no borrowed jail
/// may be captured.
fn force_stop_by_paths(
    identifier: &str,
    jail_conf: &PathBuf,
    prestop: &PathBuf,
    poststop: &PathBuf,
) -> Result<()> {
    let status = Command::new("/usr/sbin/jail")
        .args(["-v", "-r", "-f"])
        .arg(jail_conf)
        .arg(identifier)
        .status();

    if !status.map(|s| s.success()).unwrap_or(false) {
        for hook in [prestop, poststop] {
            if hook.is_file() {
                let _ = Command::new("/bin/sh").arg(hook).status();
            }
        }
    }
    Ok(())
}

fn host_ipfw_enabled() -> bool {
    sysctl_get_i32("net.inet.ip.fw.enable").unwrap_or(0) == 1
}

/// List jail ids across all attached sources
pub fn list_jails(host: &Host) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for (source, root) in host.datasets.iter() {
        let jails_dataset = root.jails();
        if !host.zfs.dataset_exists(&jails_dataset) {
            continue;
        }
        for child in host.zfs.list_children(&jails_dataset)? {
            let id = child
                .rsplit('/')
                .next()
                .unwrap_or(&child)
                .to_string();
            names.push(host.datasets.full_name(source, &id));
        }
    }
    names.sort();
    Ok(names)
}

/// Resolve a user-supplied identifier to `(source, id)`
///
/// Accepts `<source>/<id>`, a plain id, or the 8-char prefix of a
/// UUID-shaped id. A prefix matching more than one jail is rejected.
pub fn resolve_name(host: &Host, text: &str) -> Result<(String, String)> {
    if text.is_empty() {
        return Err(Error::JailNotFound(text.to_string()));
    }

    let (source_filter, name) = match text.split_once('/') {
        Some((source, name)) => (Some(source.to_string()), name.to_string()),
        None => (None, text.to_string()),
    };

    let mut matches: Vec<(String, String)> = Vec::new();
    for (source, root) in host.datasets.iter() {
        if let Some(filter) = &source_filter {
            if filter != source {
                continue;
            }
        }
        let jails_dataset = root.jails();
        if !host.zfs.dataset_exists(&jails_dataset) {
            continue;
        }
        for child in host.zfs.list_children(&jails_dataset)? {
            let id = child.rsplit('/').next().unwrap_or(&child).to_string();
            if id == name || to_humanreadable_name(&id) == name {
                matches.push((source.clone(), id));
            }
        }
    }

    match matches.len() {
        0 => Err(Error::JailNotFound(text.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::JailUnknownIdentifier(text.to_string())),
    }
}

/// Order jails so their mutual dependencies come first
///
/// Builds the `depends` graph over the given names and sorts it
/// topologically; the input order (priority) breaks ties because nodes
/// are inserted in that order. A cycle degrades to the input order with
/// a warning.
pub fn dependency_order(host: &Host, names: &[String]) -> Result<Vec<String>> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut indices = HashMap::new();

    for name in names {
        let index = graph.add_node(name.clone());
        indices.insert(name.clone(), index);
    }

    for name in names {
        let jail = Jail::open(host, name)?;
        for term in jail.config.depends() {
            for other in names {
                if other != name && matches_filter(other, &term) {
                    graph.add_edge(indices[other], indices[name], ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.iter().map(|index| graph[*index].clone()).collect()),
        Err(cycle) => {
            log::warn!(
                "Cyclic dependency involving jail '{}' - keeping priority order",
                graph[cycle.node_id()]
            );
            Ok(names.to_vec())
        }
    }
}

/// Match a jail name against a filter term (`*` wildcards allowed)
pub fn matches_filter(name: &str, term: &str) -> bool {
    if !term.contains('*') {
        return name == term;
    }

    let mut remainder = name;
    let mut fragments = term.split('*').peekable();
    let mut first = true;

    while let Some(fragment) = fragments.next() {
        if fragment.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(fragment) {
            Some(index) => {
                if first && index != 0 {
                    return false;
                }
                remainder = &remainder[index + fragment.len()..];
            }
            None => return false,
        }
        if fragments.peek().is_none() && !term.ends_with('*') && !remainder.is_empty() {
            return false;
        }
        first = false;
    }
    true
}

fn is_uuid(text: &str) -> bool {
    let parts: Vec<&str> = text.split('-').collect();
    parts.len() == 5
        && [8, 4, 4, 4, 12]
            .iter()
            .zip(&parts)
            .all(|(len, part)| part.len() == *len && part.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Shorten UUID-shaped names to their first 8 characters
pub fn to_humanreadable_name(name: &str) -> String {
    if is_uuid(name) {
        name[..8].to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_detection_and_shortening() {
        assert!(is_uuid("0d7ecb63-31c7-11e8-b770-0800279f6b55"));
        assert!(!is_uuid("web01"));
        assert_eq!(
            to_humanreadable_name("0d7ecb63-31c7-11e8-b770-0800279f6b55"),
            "0d7ecb63"
        );
        assert_eq!(to_humanreadable_name("web01"), "web01");
    }

    #[test]
    fn test_matches_filter_globs() {
        assert!(matches_filter("web01", "web01"));
        assert!(!matches_filter("web01", "web02"));
        assert!(matches_filter("web01", "web*"));
        assert!(matches_filter("web01", "*01"));
        assert!(matches_filter("web01", "*"));
        assert!(matches_filter("backend-db", "*end*"));
        assert!(!matches_filter("web01", "db*"));
    }
}
