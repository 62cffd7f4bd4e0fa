//! Hook script generation and the jail(8) launch command
//!
//! Every start writes a set of `#!/bin/sh` scripts into the jail's
//! `launch-scripts` directory plus a `jail.conf` wiring them to the
//! `exec.*` parameters. The scripts source a generated `.env` file so the
//! JID and the shell variables holding renamed interface names survive
//! between hooks.

use crate::config::Config;
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Hook script directory as seen from inside the jail
pub const RELATIVE_HOOK_SCRIPT_DIR: &str = "/.iocage";

/// Hooks that need the current JID resolved before running
const JID_QUERY_HOOKS: &[&str] = &["created", "poststart", "prestop"];

/// Render a config value the way jail(8) parameters expect it
/// (`1`/`0` booleans, empty string for null)
pub fn jail_value(config: &Config, key: &str) -> String {
    match config.get(key) {
        Ok(value) => match value.as_bool() {
            Some(true) => "1".to_string(),
            Some(false) => "0".to_string(),
            None => value.to_config_string(),
        },
        Err(_) => String::new(),
    }
}

/// Paths of one jail's generated launch assets
#[derive(Debug, Clone)]
pub struct LaunchScripts {
    /// `<jail dataset>/launch-scripts`
    pub script_dir: PathBuf,
    /// Kernel-visible jail name
    pub identifier: String,
}

impl LaunchScripts {
    pub fn new(script_dir: impl Into<PathBuf>, identifier: impl Into<String>) -> Self {
        Self {
            script_dir: script_dir.into(),
            identifier: identifier.into(),
        }
    }

    pub fn hook_script_path(&self, hook_name: &str) -> PathBuf {
        self.script_dir.join(format!("{}.sh", hook_name))
    }

    pub fn env_path(&self) -> PathBuf {
        self.script_dir.join(".env")
    }

    pub fn jail_conf_path(&self) -> PathBuf {
        self.script_dir.join("jail.conf")
    }

    /// Write a hook script (mode 0755, root:wheel)
    ///
    /// Hooks that run after jail creation are prefixed with a jls query
    /// capturing the JID; poststop additionally sources the `.env` file
    /// so teardown scripts see the interface variables.
    pub fn write_hook_script(&self, hook_name: &str, commands: &[String]) -> Result<()> {
        let path = self.hook_script_path(hook_name);
        let mut body: Vec<String> = vec!["#!/bin/sh".to_string()];

        if JID_QUERY_HOOKS.contains(&hook_name) {
            body.push(format!(
                "IOCAGE_JID=$(/usr/sbin/jls -j {} jid 2>&1 || echo -1)",
                self.identifier
            ));
        }
        if hook_name == "poststop" {
            body.push(
                "[ -f \"$(dirname $0)/.env\" ] && . \"$(dirname $0)/.env\"".to_string(),
            );
        }
        body.extend(commands.iter().cloned());

        fs::write(&path, body.join("\n") + "\n")?;
        let mut permissions = fs::metadata(&path)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions)?;
        chown_root_wheel(&path)?;
        Ok(())
    }

    /// Write the `.env` file holding exported variables for hook scripts
    pub fn write_env(&self, env: &[(String, String)]) -> Result<()> {
        let mut body = String::new();
        for (key, value) in env {
            body.push_str(&format!("export {}=\"{}\"\n", key, value));
        }
        fs::write(self.env_path(), body)?;
        Ok(())
    }

    /// Write jail.conf
    ///
    /// `exec.stop` dispatches to `stop.sh` only when the script exists, so
    /// a jail stopped without a prior prepare pass still shuts down.
    pub fn write_jail_conf(&self, exec_jail_user: &str, force: bool) -> Result<()> {
        let stop_command = if force {
            "/usr/bin/true".to_string()
        } else {
            format!(
                "[ -f \"{dir}/stop.sh\" ] || exit 0; . {dir}/stop.sh",
                dir = RELATIVE_HOOK_SCRIPT_DIR
            )
        };

        let content = [
            format!("{} {{", self.identifier),
            format!(
                "exec.prestop = \"/bin/sh {}\";",
                self.hook_script_path("prestop").display()
            ),
            format!(
                "exec.poststop = \"/bin/sh {}\";",
                self.hook_script_path("poststop").display()
            ),
            format!("exec.stop = \"{}\";", stop_command),
            format!("exec.jail_user = {};", exec_jail_user),
            "}".to_string(),
        ]
        .join("\n");

        fs::write(self.jail_conf_path(), content)?;
        Ok(())
    }
}

fn chown_root_wheel(path: &Path) -> Result<()> {
    let rc = unsafe {
        let cpath = std::ffi::CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::InsecureJailPath(path.to_path_buf()))?;
        libc::chown(cpath.as_ptr(), 0, 0)
    };
    // non-root test runs cannot chown; the started jail requires root
    // anyway, so a permission error here is not fatal
    if rc != 0 {
        log::debug!("chown root:wheel on {} failed", path.display());
    }
    Ok(())
}

/// Parameters for assembling the `jail -c` command
pub struct LaunchCommand<'a> {
    pub config: &'a Config,
    pub identifier: &'a str,
    pub root_path: &'a Path,
    pub fstab_path: &'a Path,
    pub devfs_ruleset: u32,
    pub scripts: &'a LaunchScripts,
}

impl<'a> LaunchCommand<'a> {
    fn value(&self, key: &str) -> String {
        jail_value(self.config, key)
    }

    fn allow_mount_zfs(&self) -> String {
        if self.config.get_bool("jail_zfs").unwrap_or(false) {
            "1".to_string()
        } else {
            self.value("allow_mount_zfs")
        }
    }

    fn allow_mount(&self) -> String {
        if self.allow_mount_zfs() == "1" {
            "1".to_string()
        } else {
            self.value("allow_mount")
        }
    }

    /// The full `jail -c` argument vector, without the persistence mode
    pub fn build(&self) -> Result<Vec<String>> {
        let config = self.config;
        let mut command = vec!["/usr/sbin/jail".to_string(), "-c".to_string()];

        if config.get_bool("vnet")? {
            command.push("vnet".to_string());
        } else {
            let ip4_addr = config.ip4_addr()?;
            if !ip4_addr.is_empty() {
                command.push(format!("ip4.addr={}", ip4_addr));
                command.push(format!("ip4.saddrsel={}", self.value("ip4_saddrsel")));
                command.push(format!("ip4={}", self.value("ip4")));
            }
            let ip6_addr = config.ip6_addr()?;
            if !ip6_addr.is_empty() {
                command.push(format!("ip6.addr={}", ip6_addr));
                command.push(format!("ip6.saddrsel={}", self.value("ip6_saddrsel")));
                command.push(format!("ip6={}", self.value("ip6")));
            }
        }

        command.extend([
            format!("name={}", self.identifier),
            format!("host.hostname={}", self.value("host_hostname")),
            format!("host.domainname={}", self.value("host_domainname")),
            format!("path={}", self.root_path.display()),
            format!("securelevel={}", self.value("securelevel")),
            format!("host.hostuuid={}", self.value("host_hostuuid")),
            format!("devfs_ruleset={}", self.devfs_ruleset),
            format!("enforce_statfs={}", self.value("enforce_statfs")),
            format!("children.max={}", self.value("children_max")),
            format!("allow.set_hostname={}", self.value("allow_set_hostname")),
            format!("allow.sysvipc={}", self.value("allow_sysvipc")),
            format!(
                "exec.prestart=\"{}\"",
                self.scripts.hook_script_path("prestart").display()
            ),
            format!(
                "exec.prestop=\"{}\"",
                self.scripts.hook_script_path("prestop").display()
            ),
            format!(
                "exec.poststop=\"{}\"",
                self.scripts.hook_script_path("poststop").display()
            ),
            format!("exec.jail_user={}", self.value("exec_jail_user")),
            format!("sysvmsg={}", self.value("sysvmsg")),
            format!("sysvsem={}", self.value("sysvsem")),
            format!("sysvshm={}", self.value("sysvshm")),
            format!("allow.raw_sockets={}", self.value("allow_raw_sockets")),
            format!("allow.chflags={}", self.value("allow_chflags")),
            format!("allow.mount={}", self.allow_mount()),
            format!("allow.mount.devfs={}", self.value("allow_mount_devfs")),
            format!("allow.mount.nullfs={}", self.value("allow_mount_nullfs")),
            format!("allow.mount.procfs={}", self.value("allow_mount_procfs")),
            format!("allow.mount.fdescfs={}", self.value("allow_mount_fdescfs")),
            format!("allow.mount.zfs={}", self.allow_mount_zfs()),
            format!("allow.mount.tmpfs={}", self.value("allow_mount_tmpfs")),
            format!("allow.quotas={}", self.value("allow_quotas")),
            format!("allow.socket_af={}", self.value("allow_socket_af")),
            format!("exec.timeout={}", self.value("exec_timeout")),
            format!("stop.timeout={}", self.value("stop_timeout")),
            format!("mount.fstab={}", self.fstab_path.display()),
            format!("mount.devfs={}", self.value("mount_devfs")),
            format!("mount.fdescfs={}", self.value("mount_fdescfs")),
            "allow.dying".to_string(),
        ]);

        Ok(command)
    }

    /// Arguments launching a persistent jail
    pub fn persistent(&self) -> Result<Vec<String>> {
        let mut command = self.build()?;
        command.push("persist".to_string());
        command.push(format!(
            "exec.poststart=\"{}\"",
            self.scripts.hook_script_path("poststart").display()
        ));
        Ok(command)
    }

    /// Arguments launching a single-command jail that auto-destroys
    pub fn single_command(&self) -> Result<Vec<String>> {
        let mut command = self.build()?;
        command.push("nopersist".to_string());
        command.push(format!(
            "exec.poststart=\"{}\"",
            self.scripts.hook_script_path("host_command").display()
        ));
        command.push("command=/usr/bin/true".to_string());
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::new();
        config.set("id", "web01").unwrap();
        config
    }

    fn scripts(dir: &Path) -> LaunchScripts {
        LaunchScripts::new(dir, "ioc-web01")
    }

    #[test]
    fn test_hook_script_is_executable_with_shebang() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts(dir.path());
        scripts
            .write_hook_script("prestart", &["/usr/bin/true".to_string()])
            .unwrap();

        let path = scripts.hook_script_path("prestart");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#!/bin/sh\n"));
        assert!(content.contains("/usr/bin/true"));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_created_hook_queries_jid() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts(dir.path());
        scripts.write_hook_script("created", &[]).unwrap();
        let content = fs::read_to_string(scripts.hook_script_path("created")).unwrap();
        assert!(content.contains("IOCAGE_JID=$(/usr/sbin/jls -j ioc-web01 jid"));
    }

    #[test]
    fn test_poststop_sources_env() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts(dir.path());
        scripts.write_hook_script("poststop", &[]).unwrap();
        let content = fs::read_to_string(scripts.hook_script_path("poststop")).unwrap();
        assert!(content.contains(". \"$(dirname $0)/.env\""));
    }

    #[test]
    fn test_jail_conf_stop_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts(dir.path());
        scripts.write_jail_conf("root", false).unwrap();
        let content = fs::read_to_string(scripts.jail_conf_path()).unwrap();
        assert!(content.starts_with("ioc-web01 {"));
        assert!(content.contains("[ -f \"/.iocage/stop.sh\" ] || exit 0"));
        assert!(content.contains("exec.jail_user = root;"));

        scripts.write_jail_conf("root", true).unwrap();
        let content = fs::read_to_string(scripts.jail_conf_path()).unwrap();
        assert!(content.contains("exec.stop = \"/usr/bin/true\";"));
    }

    #[test]
    fn test_launch_command_without_vnet_or_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let scripts = scripts(dir.path());
        let launch = LaunchCommand {
            config: &config,
            identifier: "ioc-web01",
            root_path: Path::new("/pool/ioc/jails/web01/root"),
            fstab_path: Path::new("/pool/ioc/jails/web01/fstab"),
            devfs_ruleset: 4,
            scripts: &scripts,
        };
        let command = launch.build().unwrap();

        // unset ip4_addr yields no ip4.addr argument
        assert!(!command.iter().any(|arg| arg.starts_with("ip4.addr=")));
        assert!(!command.contains(&"vnet".to_string()));
        assert!(command.contains(&"name=ioc-web01".to_string()));
        assert!(command.contains(&"devfs_ruleset=4".to_string()));
        assert!(command.contains(&"allow.dying".to_string()));
    }

    #[test]
    fn test_launch_command_vnet_replaces_ip_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.set("vnet", "yes").unwrap();
        config.set("interfaces", "vnet0:bridge0").unwrap();
        config.set("ip4_addr", "vnet0|10.0.0.2/24").unwrap();

        let scripts = scripts(dir.path());
        let launch = LaunchCommand {
            config: &config,
            identifier: "ioc-web01",
            root_path: Path::new("/root"),
            fstab_path: Path::new("/fstab"),
            devfs_ruleset: 4,
            scripts: &scripts,
        };
        let command = launch.build().unwrap();
        assert!(command.contains(&"vnet".to_string()));
        assert!(!command.iter().any(|arg| arg.starts_with("ip4.addr=")));
    }

    #[test]
    fn test_launch_command_static_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.set("ip4_addr", "em0|10.0.0.2/24").unwrap();

        let scripts = scripts(dir.path());
        let launch = LaunchCommand {
            config: &config,
            identifier: "ioc-web01",
            root_path: Path::new("/root"),
            fstab_path: Path::new("/fstab"),
            devfs_ruleset: 4,
            scripts: &scripts,
        };
        let command = launch.build().unwrap();
        assert!(command.contains(&"ip4.addr=em0|10.0.0.2/24".to_string()));
        assert!(command.contains(&"ip4=new".to_string()));
    }

    #[test]
    fn test_persistence_modes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let scripts = scripts(dir.path());
        let launch = LaunchCommand {
            config: &config,
            identifier: "ioc-web01",
            root_path: Path::new("/root"),
            fstab_path: Path::new("/fstab"),
            devfs_ruleset: 4,
            scripts: &scripts,
        };

        let persistent = launch.persistent().unwrap();
        assert!(persistent.contains(&"persist".to_string()));
        assert!(persistent.iter().any(|arg| arg.contains("poststart.sh")));

        let single = launch.single_command().unwrap();
        assert!(single.contains(&"nopersist".to_string()));
        assert!(single.contains(&"command=/usr/bin/true".to_string()));
        assert!(single.iter().any(|arg| arg.contains("host_command.sh")));
    }

    #[test]
    fn test_jail_zfs_forces_mount_allowances() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.set("jail_zfs", "yes").unwrap();

        let scripts = scripts(dir.path());
        let launch = LaunchCommand {
            config: &config,
            identifier: "ioc-web01",
            root_path: Path::new("/root"),
            fstab_path: Path::new("/fstab"),
            devfs_ruleset: 4,
            scripts: &scripts,
        };
        let command = launch.build().unwrap();
        assert!(command.contains(&"allow.mount=1".to_string()));
        assert!(command.contains(&"allow.mount.zfs=1".to_string()));
    }
}
