mod config;

use anyhow::Context;
use cfs_core::{Backends, Cfs, CfsError, InodeInfo, OpenFlags};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Write size used when copying a local file into a volume.
const PUT_BUFFER_SIZE: usize = 10 * 1024;

#[derive(Parser)]
#[command(name = "cfs")]
#[command(about = "Client for a chunked, replicated distributed file store")]
struct Cli {
    /// Path to configuration file (defaults to ./cfs.{yaml,toml,json} if present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Volume the command works on
    #[arg(short, long, global = true)]
    volume: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a volume and its namespace
    #[command(name = "createvol")]
    CreateVolume { name: String, quota_gb: u32 },

    /// Show a volume's quota and usage
    #[command(name = "getvolinfo")]
    VolumeInfo { volume_id: String },

    #[command(name = "createdir")]
    CreateDir { path: String },

    Stat { path: String },

    /// List names in a directory
    Ls { path: String },

    /// List a directory with type, size and modification time
    Ll { path: String },

    #[command(name = "deletedir")]
    DeleteDir { path: String },

    Mv { from: String, to: String },

    /// Create an empty file
    Touch { path: String },

    #[command(name = "deletefile")]
    DeleteFile { path: String },

    /// Append an empty chunk to a file and print its replica group
    #[command(name = "allocatechunk")]
    AllocateChunk { path: String },

    /// Copy a file of the volume to a local path
    Get { remote: String, local: String },

    /// Copy a local file into the volume
    Put { local: String, remote: String },

    /// Copy a byte range of a file to a local path; zero length reads to the end
    Read {
        remote: String,
        local: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 0)]
        length: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cfs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        tracing::error!("{:#}", error);
        let code = error
            .downcast_ref::<CfsError>()
            .map(|error| error.code())
            .filter(|code| *code > 0)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = config::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::CreateVolume { name, quota_gb } => {
            let backends = Backends::http(&settings)?;
            let volume_id = backends.create_volume(&name, quota_gb).await?;
            println!("{}", volume_id);
            return Ok(());
        }
        Commands::VolumeInfo { volume_id } => {
            let backends = Backends::http(&settings)?;
            let info = backends.volume_info(&volume_id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }
        _ => {}
    }

    let volume_id = cli
        .volume
        .context("this command needs a volume, pass --volume <id>")?;
    let cfs = Cfs::connect(settings, volume_id)?;

    match cli.command {
        Commands::CreateVolume { .. } | Commands::VolumeInfo { .. } => {}
        Commands::CreateDir { path } => cfs.create_dir(&path).await?,
        Commands::Stat { path } => {
            let inode = cfs.stat(&path).await?;
            println!("{}", serde_json::to_string_pretty(&inode)?);
        }
        Commands::Ls { path } => {
            for inode in cfs.list(&path).await? {
                println!("{}", inode.name);
            }
        }
        Commands::Ll { path } => {
            for inode in cfs.list(&path).await? {
                println!("{}", long_listing(&inode));
            }
        }
        Commands::DeleteDir { path } => cfs.delete_dir(&path).await?,
        Commands::Mv { from, to } => cfs.rename(&from, &to).await?,
        Commands::Touch { path } => cfs.create_file(&path).await?,
        Commands::DeleteFile { path } => cfs.delete_file(&path).await?,
        Commands::AllocateChunk { path } => {
            let chunk = cfs.allocate_chunk(&path).await?;
            println!("{}", serde_json::to_string_pretty(&chunk)?);
        }
        Commands::Get { remote, local } => {
            let copied = cfs.get_local(&remote, &local).await?;
            tracing::info!("Read {} bytes of {}", copied, remote);
        }
        Commands::Put { local, remote } => {
            let copied = cfs.put_local(&local, &remote, PUT_BUFFER_SIZE).await?;
            tracing::info!("Wrote {} bytes to {}", copied, remote);
        }
        Commands::Read {
            remote,
            local,
            offset,
            length,
        } => {
            let mut file = cfs.open_file(&remote, OpenFlags::read_only()).await?;
            let copied = file.read_to_file(&local, offset, length).await?;
            tracing::info!("Read {} bytes of {} at offset {}", copied, remote, offset);
        }
    }

    cfs.wait_flushes().await;
    Ok(())
}

fn long_listing(inode: &InodeInfo) -> String {
    format!(
        "{} {:>12} {} {}",
        if inode.is_dir { "d" } else { "-" },
        inode.size,
        inode.modified_at.format("%Y-%m-%d %H:%M:%S"),
        inode.name
    )
}
