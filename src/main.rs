//! ioc - FreeBSD jail manager
//!
//! Thin CLI shell over the ioc library: parse arguments, run one library
//! operation, stream its events and map errors to exit codes.

mod cli;

use cli::{Cli, Commands};
use ioc::events::{EventRecord, EventStatus, Scope};
use ioc::{BackupFormat, FetchOptions, Host, Jail, JailBackup, Release, Result, StartOptions};

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn event_scope() -> Scope {
    Scope::with_observer(|record: &EventRecord| {
        let status = match record.status {
            EventStatus::Pending => return,
            EventStatus::Done => "done",
            EventStatus::Skipped => "skip",
            EventStatus::Failed => "fail",
        };
        let indent = "  ".repeat(record.parent_count);
        let identifier = record.identifier.as_deref().unwrap_or("-");
        println!(
            "[{:4}] {}{} {} ({:.1}s)",
            status,
            indent,
            record.event_type,
            identifier,
            record.elapsed.as_secs_f64()
        );
    })
}

fn parse_properties(pairs: &[String]) -> Result<Vec<(String, String)>> {
    let mut properties = Vec::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) => properties.push((key.to_string(), value.to_string())),
            None => {
                return Err(ioc::Error::InvalidConfigValue {
                    property: pair.clone(),
                    reason: "expected key=value".into(),
                })
            }
        }
    }
    Ok(properties)
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completions { shell } = &cli.command {
        Cli::print_completions(*shell);
        return Ok(());
    }

    let mut host = Host::new()?;
    let mut scope = event_scope();

    match cli.command {
        Commands::Completions { .. } => {}

        Commands::Activate { pool } => {
            host.activate(&pool)?;
            println!("Pool '{}' activated", pool);
        }

        Commands::Deactivate { pool } => {
            host.deactivate(&pool)?;
            println!("Pool '{}' deactivated", pool);
        }

        Commands::Fetch {
            release,
            lib32,
            fetch_updates,
            update,
            update_base,
        } => {
            let release = Release::new(&host, &release)?;
            release.fetch(
                &mut scope,
                &FetchOptions {
                    fetch_lib32: lib32,
                    fetch_updates,
                    apply_updates: update,
                    update_base,
                },
            )?;
        }

        Commands::Update { release } => {
            let release = Release::new(&host, &release)?;
            let updater = ioc::release::updater::Updater::for_host(&host, &release);
            updater.fetch(&mut scope)?;
            updater.apply(&mut scope)?;
        }

        Commands::Create {
            name,
            release,
            from_jail,
            empty,
            options,
        } => {
            let mut jail = Jail::new(&host, &name)?;
            for (key, value) in parse_properties(&options)? {
                jail.config.set(&key, &value)?;
            }

            if let Some(release_name) = release {
                let release = Release::new(&host, &release_name)?;
                jail.create_from_release(&mut scope, &release)?;
            } else if let Some(source_name) = from_jail {
                let source = Jail::open(&host, &source_name)?;
                jail.create_from_jail(&mut scope, &source)?;
            } else if empty {
                jail.create_from_scratch(&mut scope)?;
            } else {
                return Err(ioc::Error::DefaultReleaseNotFound);
            }
            println!("Jail '{}' created", name);
        }

        Commands::Start { jail, no_depends } => {
            let mut jail = Jail::open(&host, &jail)?;
            jail.start(
                &mut scope,
                &StartOptions {
                    start_dependant_jails: !no_depends,
                    ..StartOptions::default()
                },
            )?;
        }

        Commands::Stop { jail, force } => {
            let mut jail = Jail::open(&host, &jail)?;
            jail.stop(&mut scope, force)?;
        }

        Commands::Restart { jail } => {
            let mut jail = Jail::open(&host, &jail)?;
            jail.stop(&mut scope, false)?;
            jail.start(
                &mut scope,
                &StartOptions {
                    quick: true,
                    start_dependant_jails: true,
                    ..StartOptions::default()
                },
            )?;
        }

        Commands::Destroy { jail, force } => {
            let mut jail = Jail::open(&host, &jail)?;
            jail.destroy(&mut scope, force)?;
        }

        Commands::Rename { jail, new_name } => {
            let mut jail = Jail::open(&host, &jail)?;
            jail.rename(&mut scope, &new_name)?;
        }

        Commands::List => {
            for name in ioc::jail::list_jails(&host)? {
                let mut jail = Jail::open(&host, &name)?;
                jail.update_state()?;
                let state = if jail.running() { "up" } else { "down" };
                let jid = jail
                    .jid()
                    .map(|j| j.to_string())
                    .unwrap_or_else(|| "-".into());
                let release = jail.config.get_string("release").unwrap_or_default();
                println!("{}\t{}\t{}\t{}", jid, name, state, release);
            }
        }

        Commands::Exec { jail, command } => {
            let jail = Jail::open(&host, &jail)?;
            let output = jail.exec(&command)?;
            print!("{}", String::from_utf8_lossy(&output.stdout));
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
        }

        Commands::Console { jail } => {
            let jail = Jail::open(&host, &jail)?;
            let login_flags = jail.config.get_string("login_flags")?;
            let mut command = vec!["/usr/bin/login".to_string()];
            command.extend(login_flags.split_whitespace().map(String::from));
            let code = jail.passthru(&command)?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Get { jail, key } => {
            let jail = Jail::open(&host, &jail)?;
            match key {
                Some(key) => println!("{}", jail.config.get_string(&key)?),
                None => {
                    for (key, value) in jail.config.to_map() {
                        println!("{}={}", key, value.to_config_string());
                    }
                }
            }
        }

        Commands::Set { jail, properties } => {
            let mut jail = Jail::open(&host, &jail)?;
            for (key, value) in parse_properties(&properties)? {
                let changed = jail.config.set(&key, &value)?;
                if changed {
                    println!("{} set to {}", key, value);
                } else {
                    println!("{} unchanged", key);
                }
            }
            jail.config.save()?;
        }

        Commands::Export {
            jail,
            destination,
            directory,
            standalone,
            recursive,
        } => {
            let mut jail = Jail::open(&host, &jail)?;
            let format = if directory {
                BackupFormat::Directory
            } else {
                BackupFormat::Tar
            };
            JailBackup::new(&mut jail).export(
                &mut scope,
                &destination,
                format,
                standalone.then_some(true),
                recursive,
            )?;
        }

        Commands::Import { source, name } => {
            let mut jail = Jail::new(&host, &name)?;
            JailBackup::new(&mut jail).restore(&mut scope, &source)?;
            println!("Jail '{}' imported", name);
        }
    }

    Ok(())
}
