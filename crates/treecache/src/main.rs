#![warn(missing_docs)]

//! Interactive shell over an in-process TreeCache cluster.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use treecache::{
    CacheConfig, CacheMode, Fqn, LocalGroup, Transaction, TreeCache,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "treecache", version, about = "Shell over an in-process TreeCache cluster")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "TREECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of cluster members to start.
    #[arg(short, long, default_value_t = 1)]
    members: usize,

    /// Cache mode, overriding the configuration (e.g. REPL_SYNC).
    #[arg(long)]
    mode: Option<CacheMode>,
}

/// One shell line.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct Line {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
    /// Store a value.
    Put { fqn: Fqn, key: String, value: String },
    /// Read a value.
    Get { fqn: Fqn, key: String },
    /// Remove a key, or the whole node when no key is given.
    Remove { fqn: Fqn, key: Option<String> },
    /// List the children of a node.
    Ls {
        #[arg(default_value = "/")]
        fqn: Fqn,
    },
    /// Print the whole tree.
    Tree,
    /// Start a transaction on the current member.
    Begin,
    /// Commit the current member's transaction.
    Commit,
    /// Roll back the current member's transaction.
    Rollback,
    /// Activate a region.
    Activate { fqn: Fqn },
    /// Inactivate a region.
    Inactivate { fqn: Fqn },
    /// Evict a node from the current member.
    Evict { fqn: Fqn },
    /// Switch to another member.
    Use { member: usize },
    /// Show a path in the configured wire format.
    Encode { fqn: Fqn },
    /// List the members and their statistics.
    Members,
    /// Leave the shell.
    Quit,
}

struct Member {
    cache: TreeCache,
    tx: Option<Transaction>,
}

struct Shell {
    members: Vec<Member>,
    current: usize,
}

impl Shell {
    fn start(config: CacheConfig, count: usize) -> Result<Self> {
        let group = LocalGroup::new();
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let mut builder = TreeCache::builder(config.clone());
            if config.cache_mode.is_clustered() {
                builder = builder.transport(group.transport());
            }
            let cache = builder.build().context("building cache")?;
            cache.start().context("starting cache")?;
            members.push(Member { cache, tx: None });
        }
        Ok(Self {
            members,
            current: 0,
        })
    }

    fn member(&mut self) -> &mut Member {
        &mut self.members[self.current]
    }

    /// Runs one command. Returns false when the shell should exit.
    fn run(&mut self, command: ShellCommand) -> Result<bool> {
        let member = self.member();
        match command {
            ShellCommand::Put { fqn, key, value } => {
                let previous = match &member.tx {
                    Some(tx) => tx.cache().put(&fqn, key, value)?,
                    None => member.cache.put(&fqn, key, value)?,
                };
                println!("{}", previous.unwrap_or_else(|| "(none)".into()));
            }
            ShellCommand::Get { fqn, key } => {
                let value = match &member.tx {
                    Some(tx) => tx.cache().get(&fqn, &key)?,
                    None => member.cache.get(&fqn, &key)?,
                };
                println!("{}", value.unwrap_or_else(|| "(none)".into()));
            }
            ShellCommand::Remove { fqn, key: Some(key) } => {
                let removed = match &member.tx {
                    Some(tx) => tx.cache().remove(&fqn, &key)?,
                    None => member.cache.remove(&fqn, &key)?,
                };
                println!("{}", removed.unwrap_or_else(|| "(none)".into()));
            }
            ShellCommand::Remove { fqn, key: None } => {
                let removed = match &member.tx {
                    Some(tx) => tx.cache().remove_node(&fqn)?,
                    None => member.cache.remove_node(&fqn)?,
                };
                println!("{}", removed);
            }
            ShellCommand::Ls { fqn } => {
                let names = match &member.tx {
                    Some(tx) => tx.cache().children_names(&fqn)?,
                    None => member.cache.children_names(&fqn)?,
                };
                match names {
                    Some(names) => names.iter().for_each(|n| println!("{}", n)),
                    None => println!("(no such node)"),
                }
            }
            ShellCommand::Tree => print!("{}", member.cache.print_details()),
            ShellCommand::Begin => {
                if member.tx.is_some() {
                    bail!("a transaction is already open on this member");
                }
                let tx = member.cache.begin();
                println!("{}", tx.gtx());
                member.tx = Some(tx);
            }
            ShellCommand::Commit => match member.tx.take() {
                Some(tx) => tx.commit()?,
                None => bail!("no open transaction"),
            },
            ShellCommand::Rollback => match member.tx.take() {
                Some(tx) => tx.rollback()?,
                None => bail!("no open transaction"),
            },
            ShellCommand::Activate { fqn } => member.cache.activate_region(&fqn)?,
            ShellCommand::Inactivate { fqn } => member.cache.inactivate_region(&fqn)?,
            ShellCommand::Evict { fqn } => println!("{}", member.cache.evict(&fqn)?),
            ShellCommand::Use { member } => {
                if member >= self.members.len() {
                    bail!("member {} out of range (0..{})", member, self.members.len());
                }
                self.current = member;
            }
            ShellCommand::Encode { fqn } => {
                let bytes = member.cache.encode_fqn(&fqn)?;
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{}", hex.join(" "));
            }
            ShellCommand::Members => {
                for (i, m) in self.members.iter().enumerate() {
                    let marker = if i == self.current { "*" } else { " " };
                    println!(
                        "{} {} {} nodes={} locks={} txs={}",
                        marker,
                        i,
                        m.cache.local_address(),
                        m.cache.number_of_nodes(),
                        m.cache.number_of_locks_held(),
                        m.cache.transaction_count(),
                    );
                }
            }
            ShellCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn stop(&mut self) {
        for member in &mut self.members {
            if let Some(tx) = member.tx.take() {
                if let Err(e) = tx.rollback() {
                    tracing::warn!(error = %e, "rollback on exit failed");
                }
            }
            member.cache.stop();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.cache_mode = mode;
    } else if args.members > 1 && !config.cache_mode.is_clustered() {
        tracing::info!("more than one member, using REPL_SYNC");
        config.cache_mode = CacheMode::ReplSync;
    }
    if args.members == 0 {
        bail!("at least one member is required");
    }

    let mut shell = Shell::start(config, args.members)?;
    tracing::info!(members = args.members, "shell ready");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("[{}]> ", shell.current);
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let command = match Line::try_parse_from(words) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match shell.run(command) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {:#}", e),
        }
    }
    shell.stop();
    Ok(())
}
