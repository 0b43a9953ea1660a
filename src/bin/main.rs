//! `phant` command-line tool.
//!
//! Settings are read from `config/default.toml`, `config/local.toml` and
//! `PHANT_*` environment variables (a `.env` file is honoured), or from a
//! keys file passed with `--keys`. Command-line flags override both.
//!
//! ```text
//! phant append 21.5 kitchen
//! phant query --limit 10 --filter gt:temp:20 --sort-by temp
//! phant stats --refresh
//! ```

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use phant_client::{ClientSettings, FilterOp, QueryOptions, StreamClient, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct CliArgs {
    /// Directory holding default.toml and local.toml
    #[arg(short, long, value_name = "DIR", default_value = "config")]
    config: PathBuf,

    /// JSON keys file returned on stream creation
    #[arg(short, long, value_name = "FILE")]
    keys: Option<PathBuf>,

    #[arg(long, env = "PHANT_PUBLIC_KEY")]
    public_key: Option<String>,

    #[arg(long, env = "PHANT_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "PHANT_BASE_URL")]
    base_url: Option<String>,

    /// Comma separated field names
    #[arg(long, value_delimiter = ',')]
    fields: Option<Vec<String>>,

    /// Encrypt field values with this passphrase
    #[arg(long, env = "PHANT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append one row, values in field order
    Append { values: Vec<String> },
    /// Print rows as JSON lines
    Query {
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        sample: Option<u64>,
        #[arg(long)]
        timezone: Option<String>,
        /// Filter as op:field:value, op one of grep, eq, ne, gt, lt, gte, lte
        #[arg(long = "filter", value_name = "OP:FIELD:VALUE")]
        filters: Vec<String>,
        #[arg(long)]
        sort_by: Option<String>,
        /// Keep timestamps as server text
        #[arg(long)]
        raw_timestamps: bool,
    },
    /// Delete every row of the stream
    Clear,
    /// Show storage usage
    Stats {
        #[arg(long)]
        refresh: bool,
    },
    /// List the stream's field names
    Fields,
}

fn load_settings(cli: &CliArgs) -> Result<ClientSettings, Box<dyn std::error::Error>> {
    let mut settings = match cli.keys {
        Some(ref path) => ClientSettings::from_keys_file(path)?,
        None => ClientSettings::load(&cli.config, cli.public_key.as_deref())?,
    };

    if let Some(ref public_key) = cli.public_key {
        settings.public_key = public_key.clone();
    }
    if let Some(ref private_key) = cli.private_key {
        settings.private_key = Some(private_key.clone());
    }
    if let Some(ref base_url) = cli.base_url {
        settings.base_url = base_url.clone();
    }
    if let Some(ref fields) = cli.fields {
        settings.fields = fields.clone();
    }
    if let Some(ref passphrase) = cli.passphrase {
        settings.passphrase = Some(passphrase.clone());
    }
    Ok(settings)
}

fn parse_filter(arg: &str) -> Result<(FilterOp, String, String), String> {
    let mut parts = arg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(op), Some(field), Some(value)) => {
            let op = FilterOp::parse(op).ok_or_else(|| format!("unknown filter operator '{}'", op))?;
            Ok((op, field.to_string(), value.to_string()))
        }
        _ => Err(format!("filter '{}' is not OP:FIELD:VALUE", arg)),
    }
}

// Command-line values are JSON when they parse as JSON, text otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::from(raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = CliArgs::parse();
    let settings = load_settings(&cli)?;
    let client = StreamClient::from_settings(&settings)?;

    match cli.command {
        Command::Append { values } => {
            let values: Vec<Value> = values.iter().map(|v| parse_value(v)).collect();
            client.append(&values).await?;
            println!("Appended to {}", client);
            println!("Remaining requests: {}", client.remaining_requests().await);
        }
        Command::Query {
            limit,
            offset,
            sample,
            timezone,
            filters,
            sort_by,
            raw_timestamps,
        } => {
            let mut options = QueryOptions::new();
            options.limit = limit;
            options.offset = offset;
            options.sample = sample;
            options.timezone = timezone;
            options.sort_by = sort_by;
            options.convert_timestamp = !raw_timestamps;
            for arg in &filters {
                let (op, field, value) = parse_filter(arg)?;
                options = options.filter(op, field, value);
            }

            for record in client.query(&options).await? {
                println!("{}", record.to_json());
            }
        }
        Command::Clear => {
            client.clear().await?;
            println!("Cleared {}", client);
        }
        Command::Stats { refresh } => {
            let stats = client.stats(refresh).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Fields => {
            for field in client.fields().await? {
                println!("{}", field);
            }
        }
    }

    Ok(())
}
