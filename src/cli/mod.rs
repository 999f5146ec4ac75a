mod render;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::ext::ExtensionRegistry;
use crate::kill::KillOutcome;
use crate::logger::init_logger;
use crate::prelude::*;
use crate::snapshot::Pid;
use crate::tree::{ProcessTree, ProcessTreeOps};

#[derive(Parser, Debug)]
#[command(version, about = "Inspect and terminate trees of OS processes")]
pub struct Cli {
    /// Seconds to wait between the graceful termination request and the
    /// forced kill
    #[arg(long, env = "TREEKILL_SOFT_KILL_WAIT_SECONDS", global = true)]
    wait: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the process tree
    #[command(alias = "ls")]
    List(ListArgs),
    /// Kill a process, optionally with all of its descendants
    Kill(KillArgs),
    /// Kill every process whose environment carries all the given variables
    Killall(KillallArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Only print the subtree rooted at this pid
    pid: Option<Pid>,

    /// Emit the table as JSON instead of an indented tree
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct KillArgs {
    pid: Pid,

    /// Also kill all descendants, children first
    #[arg(short, long)]
    recursive: bool,
}

#[derive(Args, Debug)]
struct KillallArgs {
    /// Environment fingerprint entry, `NAME=value`; may be repeated and all
    /// entries must match
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair, required = true)]
    env: Vec<(String, String)>,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected NAME=value, got `{raw}`"));
    };
    if key.is_empty() {
        return Err("the variable name must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger()?;

    let mut config = Config::from_env();
    if let Some(seconds) = cli.wait {
        config.soft_kill_wait = Duration::from_secs(seconds);
    }
    let tree = ProcessTree::capture_with(config, Arc::new(ExtensionRegistry::new()));

    match cli.command {
        Commands::List(args) => render::render(&tree, args.pid, args.json)?,
        Commands::Kill(args) => {
            let outcome = if args.recursive {
                tree.kill_recursively(args.pid)?
            } else {
                tree.kill(args.pid)?
            };
            report_outcome(args.pid, &outcome);
        }
        Commands::Killall(args) => {
            let fingerprint: BTreeMap<String, String> = args.env.into_iter().collect();
            tree.kill_all(&fingerprint)?;
            info!("Swept the process table for matching environments");
        }
    }
    Ok(())
}

fn report_outcome(pid: Pid, outcome: &KillOutcome) {
    match outcome {
        KillOutcome::Attempted => {
            info!("Kill of pid {pid} attempted; take a fresh listing to verify")
        }
        KillOutcome::Vetoed(cause) => warn!("Kill of pid {pid} was vetoed: {}", cause.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("JOB=x").unwrap(),
            ("JOB".to_string(), "x".to_string())
        );
        assert_eq!(
            parse_env_pair("JOB=a=b").unwrap(),
            ("JOB".to_string(), "a=b".to_string())
        );
        assert!(parse_env_pair("JOB").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["treekill", "kill", "--recursive", "42"]).unwrap();
        match cli.command {
            Commands::Kill(args) => {
                assert_eq!(args.pid, 42);
                assert!(args.recursive);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli =
            Cli::try_parse_from(["treekill", "killall", "-e", "JOB=x", "-e", "BUILD=1"]).unwrap();
        match cli.command {
            Commands::Killall(args) => assert_eq!(args.env.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["treekill", "killall"]).is_err());
    }
}
