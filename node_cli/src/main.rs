use anyhow::anyhow;
use clap::Parser;
use hashnet_cli::config::{
    CliCommand, Config, FetchCommand, GlobalOptions, IdCommand, PeersCommand, PublishCommand, ServerCommand,
};
use hashnet_cli::id_management::LocalIdentitySet;
use hashnet_cli::server::{run_server, Node};
use hashnet_p2p::{NodeIdentity, PeerDirectory, PeerRecord, YamlPeerDirectory};
use log::*;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config: Config = Config::parse();
    let (global_options, command) = config.to_parts();

    let result = match command {
        CliCommand::Id(id_command) => exec_id_command(id_command, global_options),
        CliCommand::Serve(serve_command) => start_server(serve_command, global_options).await,
        CliCommand::Fetch(fetch_command) => exec_fetch_command(fetch_command, global_options).await,
        CliCommand::Publish(publish_command) => exec_publish_command(publish_command, global_options).await,
        CliCommand::Peers(peers_command) => exec_peers_command(peers_command, global_options),
    };

    match result {
        Ok(()) => {
            info!("Bye :)")
        }
        Err(err) => {
            eprintln!("** Error ** \n {err}");
            std::process::exit(1);
        }
    }
}

fn exec_id_command(cmd: IdCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.node_config()?.identities_path;
    let mut local_identities = LocalIdentitySet::load_or_default(&path)?;
    match cmd {
        IdCommand::Create { name } => {
            let identity = match name {
                Some(name) => NodeIdentity::new(name),
                None => NodeIdentity::random(),
            };
            if local_identities.contains(identity.name()) {
                return Err(anyhow!("Identity with name {} already exists.", identity.name()));
            }
            println!("Identity created: {identity}");
            local_identities.insert(identity);
            println!("Saving identities to {}", path.display());
            local_identities.save(&path)?;
        }
        IdCommand::List => {
            println!("{} Local identities found.", local_identities.len());
            for id in local_identities.identities.values() {
                println!("{id}");
            }
        }
        IdCommand::Delete { id } => match local_identities.remove(&id) {
            Some(identity) => {
                println!("Identity deleted: {identity}");
                local_identities.save(&path)?;
            }
            None => {
                return Err(anyhow!("Identity with name {id} not found."));
            }
        },
    }
    Ok(())
}

fn assign_identity(path: &Path, id_name: Option<&str>) -> Result<NodeIdentity, anyhow::Error> {
    info!("Loading identities from {}", path.display());
    let local_identities = LocalIdentitySet::load_or_default(path)?;
    if local_identities.is_empty() {
        return Err(anyhow!("No identities found. Use `hashnet id new` to create one."));
    }
    let identity = local_identities
        .take(id_name)
        .ok_or_else(|| anyhow!("Identity not found: {}", id_name.unwrap_or_default()))?;
    if !identity.check() {
        return Err(anyhow!("Identity {identity} does not match its key. Refusing to use it."));
    }
    Ok(identity)
}

async fn start_server(cmd: ServerCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let mut config = options.node_config()?;
    if let Some(addr) = cmd.listen_address {
        config.listen_address = addr;
    }
    if let Some(topic) = cmd.topic {
        config.topic = topic;
    }
    let identity = assign_identity(&config.identities_path, options.id_name.as_deref())?;
    run_server(identity, config).await?;
    Ok(())
}

async fn exec_fetch_command(cmd: FetchCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let config = options.node_config()?;
    let identity = assign_identity(&config.identities_path, options.id_name.as_deref())?;
    let mut node = Node::start(identity.take_keypair(), &config)?;
    let peer = node.connect(cmd.peer).await?;
    info!("Connected to {peer}. Waiting for streams.");
    let result = if node.protocol().wait_for_streams(&peer, Duration::from_secs(cmd.timeout)).await {
        node.protocol().fetch_by_hash(&cmd.hash).await.ok_or_else(|| anyhow!("Content {} not found.", cmd.hash))
    } else {
        Err(anyhow!("Could not open any streams to {peer}."))
    };
    node.shutdown().await;

    let content = result?;
    match cmd.output {
        Some(path) => {
            std::fs::write(&path, &content)?;
            println!("Wrote {} bytes to {}", content.len(), path.display());
        }
        None => std::io::stdout().write_all(&content)?,
    }
    Ok(())
}

async fn exec_publish_command(cmd: PublishCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let config = options.node_config()?;
    let data = std::fs::read(&cmd.file)?;
    let identity = assign_identity(&config.identities_path, options.id_name.as_deref())?;
    let mut node = Node::start(identity.take_keypair(), &config)?;
    let connected = match cmd.peer {
        Some(addr) => node.connect(addr).await.map(|_| 1)?,
        None => {
            let directory = YamlPeerDirectory::load(&config.peers_path)?;
            node.connect_known_peers(&directory, config.peer_type.as_deref()).await
        }
    };
    if connected == 0 {
        node.shutdown().await;
        return Err(anyhow!("No peers to publish to."));
    }
    // Gossipsub needs a few heartbeats before peers show up in the topic mesh.
    tokio::time::sleep(Duration::from_secs(cmd.wait)).await;
    let result = node.client().publish(&cmd.topic, data).await;
    node.shutdown().await;
    result?;
    println!("Published {} to {}", cmd.file.display(), cmd.topic);
    Ok(())
}

fn exec_peers_command(cmd: PeersCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.node_config()?.peers_path;
    let mut directory = YamlPeerDirectory::load(&path)?;
    match cmd {
        PeersCommand::List { peer_type } => {
            println!("{} known peers.", directory.len());
            for addr in directory.peers(peer_type.as_deref()) {
                println!("{addr}");
            }
        }
        PeersCommand::Add { address, peer_type } => {
            directory.upsert(PeerRecord::new(address.clone(), peer_type));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            directory.save(&path)?;
            println!("Added {address} to {}", path.display());
        }
    }
    Ok(())
}
