use clap::{Parser, Subcommand, ValueEnum};
use contractdb::patch::parse_patch;
use contractdb::{ContractDbError, Kernel, KernelConfig, QueryOptions, Schema, SelectMap, SortDir, SqliteBackend};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

/// contractdb CLI - query and change a contract store from the command line
#[derive(Parser)]
#[command(name = "contractdb", version, about)]
struct Cli {
    /// SQLite database file (default: contractdb.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Kernel configuration file (YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Asc,
    Desc,
}

#[derive(clap::Args)]
struct PageArgs {
    /// Maximum number of results
    #[arg(long)]
    limit: Option<usize>,
    /// Number of results to skip
    #[arg(long)]
    skip: Option<usize>,
    /// Property path to sort by (e.g. data.timestamp)
    #[arg(long)]
    sort_by: Option<String>,
    #[arg(long, default_value = "asc")]
    sort_dir: SortArg,
}

impl PageArgs {
    fn options(&self) -> QueryOptions {
        QueryOptions {
            limit: self.limit,
            skip: self.skip,
            sort_by: self
                .sort_by
                .as_ref()
                .map(|path| path.split('.').map(str::to_string).collect()),
            sort_dir: match self.sort_dir {
                SortArg::Asc => SortDir::Asc,
                SortArg::Desc => SortDir::Desc,
            },
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create the built-in contracts and print the admin session
    Init,

    /// Print the SQL a schema compiles to
    Compile {
        /// Schema file
        schema: PathBuf,
        #[command(flatten)]
        page: PageArgs,
        /// Contracts table name
        #[arg(long)]
        table: Option<String>,
    },

    /// Run a query
    Query {
        /// Schema or view file
        schema: PathBuf,
        /// Session to query as (default: the admin session)
        #[arg(long)]
        session: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },

    /// Get a contract by slug@version or id
    Get {
        reference: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// Insert a contract
    Insert {
        /// Contract file
        contract: PathBuf,
        /// Replace the contract with the same slug@version if there is one
        #[arg(long)]
        replace: bool,
        #[arg(long)]
        session: Option<String>,
    },

    /// Apply a JSON Patch to a contract
    Patch {
        /// slug@version of the contract
        reference: String,
        /// File holding the patch operations
        patch: PathBuf,
        #[arg(long)]
        session: Option<String>,
    },

    /// Print changes to the contracts matching a schema until interrupted
    Watch {
        schema: PathBuf,
        #[arg(long)]
        session: Option<String>,
    },

    /// Show table counts
    Status,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref(), cli.db)?;

    match &cli.command {
        Command::Init => {
            let (kernel, admin) = open_kernel(&config)?;
            let status = kernel.status()?;
            print_output(&serde_json::json!({ "session": admin, "status": status }), &cli.format)?;
        }

        Command::Compile { schema, page, table } => {
            let mut tables = config.tables();
            if let Some(table) = table {
                tables.contracts = table.clone();
            }
            let schema = Schema::from_value(read_document(schema)?)?;
            let select = SelectMap::from_schema(&schema);
            let query = contractdb::compile(&tables, &select, &schema, &page.options())?;
            print_output(
                &serde_json::json!({ "sql": query.text, "params": query.params }),
                &cli.format,
            )?;
        }

        Command::Query { schema, session, page } => {
            let (kernel, admin) = open_kernel(&config)?;
            let query = read_document(schema)?;
            let results = kernel.query(session.as_ref().unwrap_or(&admin), &query, &page.options())?;
            print_output(&Value::Array(results), &cli.format)?;
        }

        Command::Get { reference, session } => {
            let (kernel, admin) = open_kernel(&config)?;
            let session = session.as_ref().unwrap_or(&admin);
            let found = if reference.contains('@') {
                kernel.get_by_slug(session, reference)?
            } else {
                kernel.get_by_id(session, reference)?
            };
            let contract = found.ok_or_else(|| ContractDbError::NoElement(reference.clone()))?;
            print_output(&contract, &cli.format)?;
        }

        Command::Insert { contract, replace, session } => {
            let (kernel, admin) = open_kernel(&config)?;
            let session = session.as_ref().unwrap_or(&admin);
            let partial = read_document(contract)?;
            let stored = if *replace {
                kernel.replace_contract(session, partial)?
            } else {
                kernel.insert_contract(session, partial)?
            };
            print_output(&stored.to_value()?, &cli.format)?;
        }

        Command::Patch { reference, patch, session } => {
            let (kernel, admin) = open_kernel(&config)?;
            let operations = parse_patch(read_document(patch)?)?;
            let patched = kernel.patch_by_slug(session.as_ref().unwrap_or(&admin), reference, &operations)?;
            print_output(&patched, &cli.format)?;
        }

        Command::Watch { schema, session } => {
            let (kernel, admin) = open_kernel(&config)?;
            let query = read_document(schema)?;
            let stream = kernel.stream(session.as_ref().unwrap_or(&admin), &query, QueryOptions::default())?;
            while let Some(event) = stream.recv() {
                print_output(&serde_json::to_value(&event)?, &OutputFormat::Json)?;
                std::io::stdout().flush()?;
            }
        }

        Command::Status => {
            let (kernel, _) = open_kernel(&config)?;
            print_output(&kernel.status()?, &cli.format)?;
        }
    }

    Ok(())
}

/// Open the store and make sure it is bootstrapped. Returns the admin
/// session alongside the kernel.
fn open_kernel(config: &KernelConfig) -> Result<(Kernel<SqliteBackend>, String), ContractDbError> {
    let kernel = Kernel::open(config.clone())?;
    let admin = kernel.initialize()?;
    Ok((kernel, admin))
}

/// Configuration from `--config`, with `--db` taking precedence for the
/// database file.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<KernelConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => KernelConfig::from_value(read_document(path)?)?,
        None => KernelConfig::default(),
    };
    if let Some(db) = db {
        config.database_path = Some(db);
    } else if config.database_path.is_none() {
        config.database_path = Some(PathBuf::from("contractdb.db"));
    }
    Ok(config)
}

/// Read a YAML or JSON file.
fn read_document(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {e}", path.display()))?;
    let value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };
    Ok(value)
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
