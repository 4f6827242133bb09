//! Strand CLI - main entry point.

use strand::cli::{Cli, Commands, FsCommands};
use strand::client::StrandClient;
use strand::config::StrandConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Master { config, bind, metadata_dir, replication_factor, chunk_size } => {
            let mut config = load_config(config.as_deref())?;
            config.observability.log_level = cli.log_level;
            if let Some(bind) = bind {
                config.master.bind_addr = bind;
            }
            if let Some(dir) = metadata_dir {
                config.master.metadata_dir = dir;
            }
            if let Some(rf) = replication_factor {
                config.master.replication_factor = rf;
            }
            if let Some(size) = chunk_size {
                config.master.chunk_size = size;
            }
            config.validate()?;

            strand::observability::init(&config.observability)?;
            strand::master::run_master_server(config).await?;
        }

        Commands::Chunkserver { config, bind, master, data_dir, rack, advertise, id } => {
            let mut config = load_config(config.as_deref())?;
            config.observability.log_level = cli.log_level;
            if let Some(bind) = bind {
                config.chunkserver.bind_addr = bind;
            }
            if let Some(master) = master {
                config.chunkserver.master_addr = master;
            }
            if let Some(dir) = data_dir {
                config.chunkserver.data_dir = dir;
            }
            if let Some(rack) = rack {
                config.node.rack_id = rack;
            }
            if let Some(advertise) = advertise {
                config.chunkserver.advertise_addr = Some(advertise);
            }
            if let Some(id) = id {
                config.node.id = id;
            }
            config.validate()?;

            strand::observability::init(&config.observability)?;
            strand::chunkserver::run_chunk_server(config).await?;
        }

        Commands::Fs { master, command } => {
            let config = StrandConfig::default();
            let client = StrandClient::new(&master, &config);
            run_fs_command(&client, command).await?;
        }

        Commands::Status { master } => {
            let url = format!("{}/system_state", master.trim_end_matches('/'));
            let state: strand::protocol::SystemStateResponse =
                reqwest::get(&url).await?.json().await?;

            println!("Cluster at {}", master);
            println!("  Files:             {}", state.files);
            println!("  Chunks:            {}", state.chunks);
            println!("  Chunkservers:      {} alive, {} dead", state.chunkservers_alive, state.chunkservers_dead);
            println!("  Under-replicated:  {}", state.under_replicated);
            println!("  Replication:       {}x", state.replication_factor);
            println!("  Chunk size:        {} bytes", state.chunk_size);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<StrandConfig> {
    Ok(match path {
        Some(path) => StrandConfig::from_file(path)?,
        None => StrandConfig::default(),
    })
}

async fn run_fs_command(client: &StrandClient, command: FsCommands) -> anyhow::Result<()> {
    match command {
        FsCommands::Create { path } => {
            client.create_file(&path).await?;
            println!("Created {}", path);
        }
        FsCommands::Write { path, offset, data, input } => {
            let bytes = match (data, input) {
                (Some(data), _) => data.into_bytes(),
                (None, Some(input)) => std::fs::read(input)?,
                (None, None) => anyhow::bail!("provide --data or --input"),
            };
            let len = bytes.len();
            client.write(&path, offset, &bytes).await?;
            println!("Wrote {} bytes to {} at offset {}", len, path, offset);
        }
        FsCommands::Read { path, offset, length, output } => {
            let bytes = client.read(&path, offset, length).await?;
            match output {
                Some(output) => {
                    std::fs::write(&output, &bytes)?;
                    println!("Read {} bytes into {}", bytes.len(), output.display());
                }
                None => {
                    println!("{}", String::from_utf8_lossy(&bytes));
                }
            }
        }
        FsCommands::Append { path, data } => {
            let offset = client.append(&path, data.as_bytes()).await?;
            println!("Appended {} bytes to {} at offset {}", data.len(), path, offset);
        }
        FsCommands::Rm { path } => {
            client.delete_file(&path).await?;
            println!("Deleted {}", path);
        }
        FsCommands::Mv { old, new } => {
            client.rename_file(&old, &new).await?;
            println!("Renamed {} to {}", old, new);
        }
        FsCommands::Snapshot { src, dst } => {
            client.snapshot_file(&src, &dst).await?;
            println!("Snapshotted {} to {}", src, dst);
        }
        FsCommands::Ls { prefix } => {
            for path in client.list_directory(&prefix).await? {
                println!("{}", path);
            }
        }
        FsCommands::Stat { path } => {
            let info = client.get_file_info(&path).await?;
            println!("  Path:   {}", info.path);
            println!("  Size:   {} bytes", info.size);
            println!("  Chunks: {}", info.chunk_handles.len());
            for (i, handle) in info.chunk_handles.iter().enumerate() {
                println!("    [{}] {}", i, handle);
            }
        }
    }
    Ok(())
}
