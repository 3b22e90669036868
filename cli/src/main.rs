//! Inspect and maintain a mixnet client store.

use clap::{Arg, ArgAction, Command};
use mixclient_storage::egress::BlockId;
use std::{path::PathBuf, process::ExitCode};
use tracing::error;

mod commands;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

fn id_arg() -> Arg {
    Arg::new("id")
        .long("id")
        .required(true)
        .help("Block identifier (hex)")
        .value_parser(clap::value_parser!(BlockId))
}

fn account_arg() -> Arg {
    Arg::new("account")
        .long("account")
        .required(true)
        .help("Account name")
        .value_parser(clap::value_parser!(String))
}

/// Entrypoint for the mixclient CLI
fn main() -> ExitCode {
    // Define application
    let matches = Command::new("mixclient")
        .version(crate_version())
        .about("Inspect and maintain a mixnet client store.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(config_arg())
        .subcommand(Command::new(commands::BUCKETS_CMD).about("List all buckets."))
        .subcommand(
            Command::new(commands::EGRESS_CMD)
                .about("Inspect fragments awaiting delivery.")
                .subcommand(
                    Command::new(commands::LIST_CMD).about("List all pending egress records."),
                )
                .subcommand(
                    Command::new(commands::SHOW_CMD)
                        .about("Show a single egress record.")
                        .arg(id_arg()),
                )
                .subcommand(
                    Command::new(commands::REMOVE_CMD)
                        .about("Remove an egress record (it will not be sent again).")
                        .arg(id_arg()),
                ),
        )
        .subcommand(
            Command::new(commands::MAILBOX_CMD)
                .about("Inspect reassembled messages.")
                .subcommand(
                    Command::new(commands::LIST_CMD)
                        .about("List all messages of an account.")
                        .arg(account_arg()),
                ),
        )
        .subcommand(
            Command::new(commands::ACCOUNTS_CMD)
                .about("Manage accounts.")
                .subcommand(
                    Command::new(commands::REGISTER_CMD)
                        .about("Create the partitions of a new account.")
                        .arg(account_arg()),
                ),
        )
        .subcommand(
            Command::new(commands::COMPACT_CMD)
                .about("Rebuild the database, dropping all free pages."),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    let config = matches.get_one::<PathBuf>("config").unwrap();
    let result = match matches.subcommand() {
        Some((commands::BUCKETS_CMD, _)) => commands::buckets(config).map(|_| ()),
        Some((commands::EGRESS_CMD, matches)) => match matches.subcommand() {
            Some((commands::LIST_CMD, _)) => commands::egress_list(config).map(|_| ()),
            Some((commands::SHOW_CMD, matches)) => {
                let id = *matches.get_one::<BlockId>("id").unwrap();
                commands::egress_show(config, id).map(|_| ())
            }
            Some((commands::REMOVE_CMD, matches)) => {
                let id = *matches.get_one::<BlockId>("id").unwrap();
                commands::egress_remove(config, id)
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
                return ExitCode::FAILURE;
            }
            None => {
                error!("no subcommand provided");
                return ExitCode::FAILURE;
            }
        },
        Some((commands::MAILBOX_CMD, matches)) => match matches.subcommand() {
            Some((commands::LIST_CMD, matches)) => {
                let account = matches.get_one::<String>("account").unwrap();
                commands::mailbox_list(config, account).map(|_| ())
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
                return ExitCode::FAILURE;
            }
            None => {
                error!("no subcommand provided");
                return ExitCode::FAILURE;
            }
        },
        Some((commands::ACCOUNTS_CMD, matches)) => match matches.subcommand() {
            Some((commands::REGISTER_CMD, matches)) => {
                let account = matches.get_one::<String>("account").unwrap();
                commands::accounts_register(config, account)
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
                return ExitCode::FAILURE;
            }
            None => {
                error!("no subcommand provided");
                return ExitCode::FAILURE;
            }
        },
        Some((commands::COMPACT_CMD, _)) => commands::compact(config),
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = result {
        error!(error=?e, "command failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
