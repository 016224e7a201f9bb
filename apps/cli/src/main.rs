//! stashctl - Command line interface for encrypted stashes.
//!
//! Every command maps to one lifecycle operation. `all` in place of a stash
//! name runs the operation for every applicable stash and keeps going past
//! failures.

mod logging;
mod table;
mod watch;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use stashctl_core::config::ConfigStore;
use stashctl_core::error::IoResultExt;
use stashctl_core::{
    Controller, CreateOptions, ListFilter, MountOptions, Outcome, OutputMode, ProcMounts,
    RegistryPolicy, Result, Settings, SyncOptions, SystemExecutor, UnmountOptions, WatchMode,
};
use tracing::warn;

/// Stash name selecting every applicable stash.
const ALL: &str = "all";

/// Manage encfs stashes and mirror them with rsync.
#[derive(Parser)]
#[command(name = "stashctl", version)]
#[command(about = "Manage encrypted stashes and their remote mirrors", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/stashctl/stashctl.conf)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Leave out stashes whose files are missing instead of failing
    #[arg(long, global = true)]
    skip_invalid: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Stash(StashCommand),

    /// Watch a mounted stash in the foreground
    #[command(hide = true)]
    Watch { stash: String },
}

#[derive(Subcommand)]
enum StashCommand {
    /// List stashes
    List {
        #[arg(value_enum, default_value_t = StateArg::Mounted)]
        state: StateArg,

        /// Print names only
        #[arg(short, long)]
        raw: bool,
    },

    /// Mount a stash
    Mount {
        /// Stash name, or "all" for every unmounted stash
        stash: String,

        /// Check preconditions and show what would run
        #[arg(short, long)]
        test: bool,

        /// Do not watch the stash for changes
        #[arg(long)]
        nosync: bool,

        /// Command printing the passphrase when none is saved
        #[arg(long, value_name = "CMD")]
        pass_cmd: Option<String>,
    },

    /// Unmount a stash, pushing pending changes
    Unmount {
        /// Stash name, or "all" for every mounted stash
        stash: String,

        #[arg(short, long)]
        test: bool,

        /// Skip the automatic push
        #[arg(long)]
        nosync: bool,
    },

    /// Mirror the remote into the stash
    Pull {
        /// Stash name, or "all" for every unmounted stash
        stash: String,

        #[arg(short, long)]
        test: bool,
    },

    /// Mirror the stash to its remote
    Push {
        /// Stash name, or "all" for every stash with a remote
        stash: String,

        #[arg(short, long)]
        test: bool,
    },

    /// Create a new stash in ROOTDIR
    Create {
        rootdir: PathBuf,

        /// Mount the stash once created
        #[arg(short, long)]
        mount: bool,

        /// Save the passphrase encrypted with gpg
        #[arg(short, long)]
        save_pass: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Mounted,
    Unmounted,
    All,
}

impl From<StateArg> for ListFilter {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Mounted => ListFilter::Mounted,
            StateArg::Unmounted => ListFilter::Unmounted,
            StateArg::All => ListFilter::All,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns false when any item of the command failed.
fn run(cli: Cli) -> Result<bool> {
    let config_path = match cli.config {
        Some(path) => std::path::absolute(&path).file_context(&path)?,
        None => ConfigStore::default_path()?,
    };
    let store = ConfigStore::new(&config_path);
    let policy = cli.skip_invalid.then_some(RegistryPolicy::SkipInvalid);

    let command = match cli.command {
        Commands::Watch { stash } => {
            watch::run(store, &stash, cli.verbose, policy)?;
            return Ok(true);
        }
        Commands::Stash(command) => command,
    };

    if let Err(e) = logging::init(cli.verbose, None) {
        eprintln!("Warning: logging unavailable: {}", e);
    }

    let watch = match std::env::current_exe() {
        Ok(program) => WatchMode::Process {
            program,
            config: config_path,
        },
        Err(e) => {
            warn!("cannot locate own executable, stashes will not be watched: {}", e);
            WatchMode::Off
        }
    };
    let settings = Settings {
        policy,
        watch,
        ..Settings::default()
    };
    let controller = Controller::open(
        store,
        Arc::new(SystemExecutor::new()),
        Arc::new(ProcMounts::default()),
        settings,
    )?;

    match command {
        StashCommand::List { state, raw } => {
            let filter = ListFilter::from(state);
            let entries = controller.list(filter)?;
            if raw {
                print!("{}", table::render_raw(&entries));
            } else {
                let home = dirs::home_dir();
                print!("{}", table::render(&entries, filter, home.as_deref()));
            }
            Ok(true)
        }
        StashCommand::Mount {
            stash,
            test,
            nosync,
            pass_cmd,
        } => {
            let opts = MountOptions {
                test,
                nosync,
                passphrase_command: pass_cmd,
            };
            let names = targets(&controller, &stash, ListFilter::Unmounted, false)?;
            Ok(for_each(&names, |name| controller.mount(name, &opts)))
        }
        StashCommand::Unmount {
            stash,
            test,
            nosync,
        } => {
            let opts = UnmountOptions { test, nosync };
            let names = targets(&controller, &stash, ListFilter::Mounted, false)?;
            Ok(for_each(&names, |name| controller.unmount(name, &opts)))
        }
        StashCommand::Pull { stash, test } => {
            let opts = sync_options(test);
            let names = targets(&controller, &stash, ListFilter::Unmounted, false)?;
            Ok(for_each(&names, |name| controller.pull(name, &opts)))
        }
        StashCommand::Push { stash, test } => {
            let opts = sync_options(test);
            let names = targets(&controller, &stash, ListFilter::All, true)?;
            Ok(for_each(&names, |name| controller.push(name, &opts)))
        }
        StashCommand::Create {
            rootdir,
            mount,
            save_pass,
        } => {
            let name = controller.create(&CreateOptions {
                root_dir: rootdir,
                mount,
                save_pass,
            })?;
            println!("Created stash {}", name);
            Ok(true)
        }
    }
}

fn sync_options(test: bool) -> SyncOptions {
    SyncOptions {
        test,
        output: OutputMode::Passthrough,
    }
}

/// Expands `all` to the stashes matching `filter`.
fn targets(
    controller: &Controller,
    stash: &str,
    filter: ListFilter,
    needs_remote: bool,
) -> Result<Vec<String>> {
    if stash != ALL {
        return Ok(vec![stash.to_string()]);
    }
    Ok(controller
        .list_brief(filter)?
        .into_iter()
        .filter(|e| !needs_remote || e.remote.is_some())
        .map(|e| e.name)
        .collect())
}

/// Runs `op` for every name, reporting failures without stopping.
fn for_each(names: &[String], op: impl Fn(&str) -> Result<Outcome>) -> bool {
    let mut ok = true;
    for name in names {
        match op(name) {
            Ok(Outcome::Applied) => {}
            Ok(Outcome::WouldRun(commands)) => {
                for command in commands {
                    println!("{}: would run {}", name, command);
                }
            }
            Err(e) => {
                eprintln!("{}: {}", name, e);
                ok = false;
            }
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mount_flags() {
        let cli = Cli::try_parse_from([
            "stashctl", "-c", "/tmp/s.conf", "mount", "vault1", "--test", "--pass-cmd", "pass x",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.conf")));
        match cli.command {
            Commands::Stash(StashCommand::Mount {
                stash,
                test,
                nosync,
                pass_cmd,
            }) => {
                assert_eq!(stash, "vault1");
                assert!(test);
                assert!(!nosync);
                assert_eq!(pass_cmd.as_deref(), Some("pass x"));
            }
            _ => panic!("expected mount"),
        }
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from(["stashctl", "create", "/tmp/notes", "-m", "-s"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stash(StashCommand::Create {
                mount: true,
                save_pass: true,
                ..
            })
        ));

        let cli = Cli::try_parse_from(["stashctl", "pull", "all", "-t"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stash(StashCommand::Pull { test: true, .. })
        ));

        let cli = Cli::try_parse_from(["stashctl", "list", "all", "-r"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stash(StashCommand::List {
                state: StateArg::All,
                raw: true
            })
        ));
    }

    #[test]
    fn test_list_defaults_to_mounted() {
        let cli = Cli::try_parse_from(["stashctl", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stash(StashCommand::List {
                state: StateArg::Mounted,
                raw: false
            })
        ));
    }

    #[test]
    fn test_hidden_watch_command() {
        let cli = Cli::try_parse_from(["stashctl", "watch", "vault1"]).unwrap();
        assert!(matches!(cli.command, Commands::Watch { ref stash } if stash == "vault1"));
        assert!(!cli.skip_invalid);

        let cli = Cli::try_parse_from([
            "stashctl", "--config", "/tmp/s.conf", "--skip-invalid", "watch", "vault1",
        ])
        .unwrap();
        assert!(cli.skip_invalid);
    }

    #[test]
    fn test_for_each_continues_past_failures() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let seen = std::cell::RefCell::new(Vec::new());
        let ok = for_each(&names, |name| {
            seen.borrow_mut().push(name.to_string());
            if name == "b" {
                Err(stashctl_core::Error::NotAStash {
                    name: name.to_string(),
                })
            } else {
                Ok(Outcome::Applied)
            }
        });
        assert!(!ok);
        assert_eq!(seen.into_inner(), names);
    }

    #[test]
    fn test_for_each_empty_batch_succeeds() {
        assert!(for_each(&[], |_| Ok(Outcome::Applied)));
    }
}
