use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadmesh::{
    Address, AddressResolver, Contact, Dht, DhtConfig, ExactResolver, MemoryStorage, NodeId,
    Origin, RoutingContext, RpcRegistry, UdpTransport,
};

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address and port to bind.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    addr: String,

    /// IP address and port of a node to bootstrap against.
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Number of identities to participate under.
    #[arg(long, default_value_t = 1)]
    identities: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let transport = Arc::new(
        UdpTransport::bind(&args.addr)
            .await
            .context("failed to bind transport")?,
    );
    let public = ExactResolver
        .resolve(transport.local_address())
        .await
        .context("failed to resolve public address")?;

    let ids: Vec<NodeId> = (0..args.identities.max(1)).map(|_| NodeId::random()).collect();
    let origin = Origin::new(ids, public);

    let mut config = DhtConfig::default();
    if let Some(bootstrap) = &args.bootstrap {
        let seed = Address::new(bootstrap).context("invalid bootstrap address")?;
        config.bootstrap_nodes.push(Contact::seed(seed));
    }

    let mut rpc = RpcRegistry::default();
    rpc.register("s", |sender, args| {
        let mut out = sender
            .id
            .map(|id| id.to_base58())
            .unwrap_or_else(|| sender.address.to_string())
            .into_bytes();
        for arg in args {
            out.push(b' ');
            out.extend_from_slice(arg);
        }
        println!("{}", String::from_utf8_lossy(&out));
        Ok(out)
    });

    let storage = Arc::new(MemoryStorage::new(config.replicate_time));
    let dht = Dht::new(storage, origin, transport, rpc, config.clone());

    let node = dht.clone();
    tokio::spawn(async move {
        if let Err(e) = node.listen().await {
            warn!(error = %e, "listen failed");
        }
    });

    if !config.bootstrap_nodes.is_empty() {
        dht.bootstrap().await.context("bootstrap failed")?;
        info!("bootstrap complete");
    }

    let ctx = dht.default_context();
    info!(id = %dht.origin_id(&ctx), addr = %public, "node ready");

    repl(&dht, &ctx).await?;

    dht.disconnect();
    Ok(())
}

async fn repl(dht: &Dht, ctx: &RoutingContext) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input: Vec<&str> = line.split_whitespace().collect();
                match input.split_first() {
                    None => continue,
                    Some((&"help", _)) => print_help(),
                    Some((&"info", _)) => {
                        println!("id: {}", dht.origin_id(ctx));
                        println!("known nodes: {}", dht.num_nodes(ctx).await);
                    }
                    Some((&"findnode", rest)) => do_find_node(dht, ctx, rest).await,
                    Some((&"store", rest)) => do_store(dht, ctx, rest).await,
                    Some((&"get", rest)) => do_get(dht, ctx, rest).await,
                    Some((_, _)) => do_rpc(dht, ctx, &input).await,
                }
            }
        }
    }
    Ok(())
}

async fn do_find_node(dht: &Dht, ctx: &RoutingContext, rest: &[&str]) {
    let [key] = rest else {
        print_help();
        return;
    };
    println!("searching for {key}");
    match dht.find_node(ctx, key).await {
        Ok(Some(found)) => println!("found: {found:?}"),
        Ok(None) => println!("nothing found for this id"),
        Err(e) => println!("{e}"),
    }
}

async fn do_store(dht: &Dht, ctx: &RoutingContext, rest: &[&str]) {
    if rest.is_empty() {
        print_help();
        return;
    }
    match dht.store(ctx, rest.join(" ").into_bytes()).await {
        Ok(key) => println!("stored under {key}"),
        Err(e) => println!("{e}"),
    }
}

async fn do_get(dht: &Dht, ctx: &RoutingContext, rest: &[&str]) {
    let [key] = rest else {
        print_help();
        return;
    };
    match dht.get(ctx, key).await {
        Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
        Ok(None) => println!("not found"),
        Err(e) => println!("{e}"),
    }
}

async fn do_rpc(dht: &Dht, ctx: &RoutingContext, input: &[&str]) {
    let [method, target, args @ ..] = input else {
        print_help();
        return;
    };
    let args: Vec<Vec<u8>> = args.iter().map(|a| a.as_bytes().to_vec()).collect();
    println!("running {method} on {target}");
    match dht.remote_procedure_call(ctx, target, method, args).await {
        Ok(result) => println!("{}", String::from_utf8_lossy(&result)),
        Err(e) => println!("{e}"),
    }
}

fn print_help() {
    println!(
        "
help - this message
info - display information about this node
findnode <key> - find a node's real network address
store <text...> - publish a value, printing its key
get <key> - fetch a published value

<method> <target> <args...> - remote procedure call"
    );
}
