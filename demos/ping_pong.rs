//! Ping pong over TCP.
//!
//! Starts an acceptor on a local port, dials it, and exchanges a few
//! requests in both directions.
//!
//! ```text
//! RUST_LOG=gofast=debug cargo run --example ping_pong
//! ```

use gofast::{connect_tcp, Config, Message, Role, Stream, Transport};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Ping(String);

impl Message for Ping {
    const ID: u64 = 100;
}

#[derive(Serialize, Deserialize, Debug)]
struct Pong(String);

impl Message for Pong {
    const ID: u64 = 101;
}

async fn pong(ping: Ping, mut stream: Stream) -> gofast::Result<()> {
    stream.response(&Pong(ping.0.replace("ping", "pong")), true).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let transport = Transport::builder()
            .config(Config::default().name("server").role(Role::Acceptor))
            .handle(pong)
            .connect(socket)
            .await?;
        transport.closed().await;
        Ok::<_, gofast::GofastError>(transport.stats())
    });

    let client = Transport::builder()
        .config(Config::default().name("client").role(Role::Dialer))
        .handle(pong)
        .connect(connect_tcp(addr).await?)
        .await?;

    for i in 0..3 {
        let reply: Pong = client.request(&Ping(format!("ping {i}")), true).await?;
        println!("{} <- {:?}", client.name(), reply);
    }
    println!("rtt {:?}", client.ping().await?);
    client.close().await;

    let server_stats = server.await??;
    println!("server stats: {:?}", server_stats.to_map());
    Ok(())
}
