//! Small demo CLI exercising the kernel end to end: open a database,
//! create a collection, insert/get/scan/checkpoint against it directly.
//! Stands in for the query-language/planner surface the spec explicitly
//! excludes (see SPEC_FULL.md, "CLI demo").

use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use clap::{Parser, Subcommand};
use ferrokv::{Config, Database, IsolationLevel, StorageResult};
use log::info;

#[derive(Parser)]
#[command(name = "ferrokv-cli", about = "Exercise the ferrokv storage kernel")]
struct Cli {
    /// Directory holding the database's on-disk files.
    #[arg(long, default_value = "./ferrokv-data")]
    path: PathBuf,

    /// Optional TOML config file; falls back to defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert a `key value` record (key parsed as u64) into `users`.
    Insert { key: u64, value: String },
    /// Look up a key in `users`.
    Get { key: u64 },
    /// List every record in `users`.
    Scan,
    /// Force a WAL checkpoint, printing the resulting LSN.
    Checkpoint,
}

fn init_log() {
    use std::io::Write;
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(buf, "[{} - {}] {}", record.level(), record.target(), record.args())
        })
        .try_init()
        .ok();
}

fn user_key_extractor() -> ferrokv::KeyExtractor<u64> {
    Arc::new(|bytes: &[u8]| LittleEndian::read_u64(bytes))
}

fn encode(key: u64, value: &str) -> Vec<u8> {
    let mut buf = key.to_le_bytes().to_vec();
    buf.extend_from_slice(value.as_bytes());
    buf
}

fn decode(bytes: &[u8]) -> (u64, String) {
    let key = LittleEndian::read_u64(&bytes[0..8]);
    (key, String::from_utf8_lossy(&bytes[8..]).into_owned())
}

#[tokio::main]
async fn main() -> StorageResult<()> {
    init_log();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_toml_str(&tokio::fs::read_to_string(path).await?)?,
        None => Config::default(),
    };

    let db = Database::open(&cli.path, config).await?;
    let users = match db.get_collection::<u64>("users", user_key_extractor()).await {
        Ok(c) => c,
        Err(_) => db.create_collection::<u64>("users", 1, user_key_extractor()).await?,
    };

    match cli.command {
        Command::Insert { key, value } => {
            let txn = db.begin_transaction(IsolationLevel::ReadCommitted).await?;
            users.insert(&txn, encode(key, &value)).await?;
            db.commit(txn).await?;
            db.flush().await?;
            info!("inserted key={key}");
        }
        Command::Get { key } => match users.select(&key).await? {
            Some(bytes) => {
                let (_, value) = decode(&bytes);
                println!("{key} -> {value}");
            }
            None => println!("{key} not found"),
        },
        Command::Scan => {
            for bytes in users.scan().await? {
                let (key, value) = decode(&bytes);
                println!("{key}\t{value}");
            }
        }
        Command::Checkpoint => {
            let lsn = db.create_checkpoint().await?;
            println!("checkpoint lsn={lsn}");
        }
    }

    db.close().await?;
    Ok(())
}
