//! Sum server/client example.
//!
//! Starts a server exposing `Foo.Sum`, then dials it and issues a handful of
//! concurrent calls.
//!
//! ```text
//! cargo run -p tern-rpc --example sum_server -- --calls 5 --codec application/json
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tern_rpc::{CodecType, Options, Server, Service, dial};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sum service over tern-rpc", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "TERN_ADDR", default_value = "127.0.0.1:0")]
    addr: String,

    /// Codec to negotiate
    #[arg(long, env = "TERN_CODEC", default_value = "application/cbor")]
    codec: CodecType,

    /// Server-side handle timeout in milliseconds (0 waits indefinitely)
    #[arg(long, env = "TERN_HANDLE_TIMEOUT_MS", default_value_t = 0)]
    handle_timeout_ms: u64,

    /// Number of concurrent calls
    #[arg(short, long, default_value_t = 5)]
    calls: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

impl Foo {
    async fn sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
        Ok(args.num1 + args.num2)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = Server::new();
    server.register(Service::from_receiver(Foo).method("Sum", Foo::sum))?;

    let listener = TcpListener::bind(&cli.addr).await?;
    let addr = listener.local_addr()?.to_string();
    info!("Sum server listening on {}", addr);
    tokio::spawn(async move { server.accept(listener).await });

    let options = Options::default()
        .with_codec(cli.codec)
        .with_handle_timeout(Duration::from_millis(cli.handle_timeout_ms));
    let client = Arc::new(dial(&addr, options).await?);

    let mut tasks = Vec::new();
    for i in 0..cli.calls {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let args = Args { num1: i, num2: i * i };
            match client.call::<_, i64>("Foo.Sum", &args).await {
                Ok(reply) => info!("{} + {} = {}", args.num1, args.num2, reply),
                Err(e) => error!("call Foo.Sum error: {}", e),
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    client.close().await?;
    Ok(())
}
