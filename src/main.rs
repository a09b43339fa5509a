//! # Schema Linker CLI (`slink`)
//!
//! Embeds a relational schema into a local SQLite index and filters it down
//! to the tables and columns relevant to a natural language question.
//!
//! ## Usage
//!
//! ```bash
//! slink --config ./config/slink.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `slink init` | Create the SQLite index database |
//! | `slink check` | Validate config and schema document |
//! | `slink precompute` | Embed tables that have no records yet |
//! | `slink update` | Re-embed one table or the whole schema |
//! | `slink filter "<question>"` | Print the relevant part of the schema |
//! | `slink stats` | Show schema and index status |
//! | `slink clear` | Delete every stored embedding |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use schema_linker::filter_cmd::FilterOverrides;
use schema_linker::{config, filter_cmd, index_cmd, logging, migrate, schema, stats};

/// Schema Linker: query-driven schema filtering for text-to-SQL.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/slink.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "slink",
    about = "Schema Linker: keep only the tables and columns relevant to a question",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/slink.toml")]
    config: PathBuf,

    /// More log output on stderr (-v info, -vv debug). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database.
    ///
    /// Creates the SQLite file and its tables. Safe to run repeatedly.
    Init,

    /// Validate the config file and the schema document.
    Check,

    /// Embed every table and column that is not in the index yet.
    ///
    /// Records of tables no longer in the schema are deleted. Tables that
    /// fail to embed are listed and the command exits non-zero; rerun it to
    /// retry them.
    Precompute {
        /// Re-embed every table, not only the missing ones.
        #[arg(long)]
        force: bool,
    },

    /// Re-embed one table after its description or columns changed.
    ///
    /// Without `--table`, re-embeds the whole schema.
    Update {
        #[arg(long)]
        table: Option<String>,
    },

    /// Print the part of the schema relevant to a question.
    Filter {
        /// Natural language question.
        query: String,

        #[arg(long)]
        top_k_tables: Option<usize>,

        /// Columns kept per retrieved table.
        #[arg(long)]
        top_k_columns: Option<usize>,

        /// Minimum cosine similarity in [0, 1]; 0 disables the threshold.
        #[arg(long)]
        threshold: Option<f32>,

        /// Foreign-key hops to expand; 0 disables expansion.
        #[arg(long)]
        hops: Option<usize>,

        /// Skip the reranker even if one is configured.
        #[arg(long)]
        no_rerank: bool,

        /// Print the filtered schema as M-Schema JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show schema and index status.
    Stats,

    /// Delete every stored embedding and the recorded schema version.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Check => {
            let graph = schema::load_schema(&cfg)?;
            println!("config ok: {}", cli.config.display());
            println!(
                "schema ok: {} tables, {} columns, {} foreign keys",
                graph.table_count(),
                graph.column_count(),
                graph.foreign_keys().len()
            );
        }
        Commands::Precompute { force } => {
            index_cmd::run_precompute(&cfg, force).await?;
        }
        Commands::Update { table } => {
            index_cmd::run_update(&cfg, table.as_deref()).await?;
        }
        Commands::Filter {
            query,
            top_k_tables,
            top_k_columns,
            threshold,
            hops,
            no_rerank,
            json,
        } => {
            let overrides = FilterOverrides {
                top_k_tables,
                top_k_columns,
                threshold,
                hops,
                no_rerank,
            };
            filter_cmd::run_filter(&cfg, &query, &overrides, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Clear => {
            index_cmd::run_clear(&cfg).await?;
        }
    }

    Ok(())
}
