//! Bidirectional stream over TCP.
//!
//! The acceptor sums numbers as they arrive and reports a running total
//! for each; the dialer sends a handful, closes its side, and reads the
//! totals until the acceptor closes its own.

use gofast::{connect_tcp, Config, Message, Role, Stream, Transport};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Number(i64);

impl Message for Number {
    const ID: u64 = 300;
}

async fn running_total(first: Number, mut stream: Stream) -> gofast::Result<()> {
    let mut total = first.0;
    stream.stream(&Number(total), false).await?;
    while let Some(msg) = stream.recv().await {
        total += msg.decode::<Number>()?.0;
        stream.stream(&Number(total), false).await?;
    }
    stream.close().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let transport = Transport::builder()
            .config(Config::default().name("summer").role(Role::Acceptor))
            .handle(running_total)
            .connect(socket)
            .await?;
        transport.closed().await;
        Ok::<_, gofast::GofastError>(())
    });

    let client = Transport::builder()
        .config(Config::default().name("client").role(Role::Dialer))
        .connect(connect_tcp(addr).await?)
        .await?;

    let mut stream = client.stream(&Number(1), true).await?;
    for n in 2..=5 {
        stream.stream(&Number(n), false).await?;
    }
    stream.close().await?;

    while let Some(msg) = stream.recv().await {
        println!("total {}", msg.decode::<Number>()?.0);
    }
    client.close().await;
    Ok(())
}
