//! solrcl command line
//!
//! ```bash
//! solrcl --core products ping
//! solrcl --core products load docs.xml --parallel 4 --commit
//! solrcl --core products --blockjoin "_is_parent:true" delete A B C
//! solrcl --host slave1 --core products replicate --master-url http://master:8983/solr/products
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use solrcl::{ConnectionConfig, CoreSpec, LoadOptions, ReplicationPolicy, SolrAdmin, SolrCore};

#[derive(Parser)]
#[command(name = "solrcl", version, about = "Solr core client")]
struct Cli {
    #[arg(long, default_value = solrcl::config::DEFAULT_SOLR_DOMAIN)]
    host: String,

    #[arg(long, default_value_t = solrcl::config::DEFAULT_SOLR_PORT)]
    port: u16,

    /// Core to work on. Required by every command except `cores`.
    #[arg(long)]
    core: Option<String>,

    /// Query selecting block-join parents, e.g. `_is_parent:true`.
    #[arg(long)]
    blockjoin: Option<String>,

    /// JSON file with `ConnectionConfig` keys. `--host` and `--port` win.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cores, or create, reload, swap and unload them.
    Cores {
        #[command(subcommand)]
        action: Option<CoreAction>,
    },
    #[command(flatten)]
    Core(CoreCommand),
}

#[derive(Subcommand)]
enum CoreCommand {
    /// Ping the core.
    Ping,
    /// Show server versions, directories and schema size.
    Info,
    /// Count documents, optionally matching a query.
    Count { query: Option<String> },
    /// Load `<add>` markup from a file, or stdin when omitted.
    Load {
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Merge child documents by id instead of replacing them.
        #[arg(long)]
        merge_children: bool,
        #[arg(long)]
        commit: bool,
    },
    /// Delete documents (whole blocks with --blockjoin) by id.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete documents matching a query.
    DeleteQuery { query: String },
    Commit,
    Optimize,
    /// Delete every document and commit.
    DropIndex,
    /// Pull the index from the master and wait for it.
    Replicate {
        #[arg(long)]
        master_url: Option<String>,
        #[arg(long, default_value_t = 10)]
        max_attempts: u32,
    },
    /// Print index version and generation.
    IndexVersion,
}

#[derive(Subcommand)]
enum CoreAction {
    Create { name: String, instance_dir: String },
    Reload { name: String },
    Swap { name: String, other: String },
    Unload {
        name: String,
        #[arg(long)]
        delete_instance_dir: bool,
    },
}

fn connection(cli: &Cli) -> Result<ConnectionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ConnectionConfig::default(),
    };
    config.domain = cli.host.clone();
    config.port = cli.port;
    Ok(config)
}

async fn open_core(cli: &Cli, config: &ConnectionConfig) -> Result<SolrCore> {
    let Some(core) = &cli.core else {
        bail!("--core is required for this command");
    };
    Ok(SolrCore::open(config, core.clone(), cli.blockjoin.clone()).await?)
}

async fn run_admin(config: &ConnectionConfig, action: Option<&CoreAction>) -> Result<()> {
    let admin = SolrAdmin::open(config).await?;
    match action {
        None => {
            for core in admin.cores().await? {
                println!("{}", core);
            }
        }
        Some(CoreAction::Create { name, instance_dir }) => {
            admin.create(&CoreSpec::new(name.clone(), instance_dir.clone())).await?;
        }
        Some(CoreAction::Reload { name }) => {
            admin.reload(name).await?;
        }
        Some(CoreAction::Swap { name, other }) => {
            admin.swap(name, other).await?;
        }
        Some(CoreAction::Unload {
            name,
            delete_instance_dir,
        }) => {
            admin.unload(name, *delete_instance_dir).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = connection(&cli)?;

    match &cli.command {
        Command::Cores { action } => run_admin(&config, action.as_ref()).await,
        Command::Core(command) => run_core(&cli, &config, command).await,
    }
}

async fn run_core(cli: &Cli, config: &ConnectionConfig, command: &CoreCommand) -> Result<()> {
    let core = open_core(cli, config).await?;
    match command {
        CoreCommand::Ping => {
            let response = core.ping().await?;
            println!("{}", response.get("status").and_then(|s| s.as_str()).unwrap_or("?"));
        }
        CoreCommand::Info => {
            let server = core.server_info();
            let dirs = core.directories();
            println!("solr:      {}", server.solr_version);
            println!("lucene:    {}", server.lucene_version);
            println!("instance:  {}", dirs.instance_dir);
            println!("data:      {}", dirs.data_dir);
            println!("id field:  {}", core.id_field());
            println!("fields:    {}", core.schema().fields.len());
        }
        CoreCommand::Count { query } => match query {
            None => println!("{}", core.num_records().await?),
            Some(query) => {
                let response = core
                    .select(solrcl::transport::params(&[("q", query), ("rows", "0")]))
                    .await?;
                println!("{}", response["response"]["numFound"]);
            }
        },
        CoreCommand::Load {
            file,
            parallel,
            merge_children,
            commit,
        } => {
            let options = LoadOptions::default()
                .with_parallel(*parallel)
                .with_merge_child_docs(*merge_children);
            let report = match file {
                Some(path) => {
                    let input = File::open(path).with_context(|| format!("opening {}", path.display()))?;
                    core.load_xml(BufReader::new(input), &options).await?
                }
                None => core.load_xml(io::stdin().lock(), &options).await?,
            };
            for warning in &report.warnings {
                eprintln!("skipped {}", warning);
            }
            println!("{} loaded, {} skipped", report.enqueued, report.warnings.len());
            if *commit {
                core.commit().await?;
            }
        }
        CoreCommand::Delete { ids } => {
            core.delete_by_parent_ids(ids).await?;
        }
        CoreCommand::DeleteQuery { query } => {
            core.delete_by_query(query).await?;
        }
        CoreCommand::Commit => {
            core.commit().await?;
        }
        CoreCommand::Optimize => {
            core.optimize().await?;
        }
        CoreCommand::DropIndex => {
            core.drop_index().await?;
        }
        CoreCommand::Replicate {
            master_url,
            max_attempts,
        } => {
            let policy = ReplicationPolicy {
                max_attempts: *max_attempts,
                ..ReplicationPolicy::default()
            };
            let status = core
                .start_and_wait_replication(master_url.as_deref(), &policy)
                .await?;
            println!("replicated at {}", status.last_replication);
        }
        CoreCommand::IndexVersion => {
            let version = core.get_index_version().await?;
            println!(
                "index {} replicable {} generation {}",
                version.index_version, version.replication_version, version.generation
            );
        }
    }
    Ok(())
}
