//! TCP echo server demonstrating `wirebridge`.
//!
//! Each accepted connection is moved onto the event loop, wrapped in an
//! [`AsyncChannel`] and echoed back chunk by chunk until the peer closes its
//! sending side.

mod cli;

use bytes::Bytes;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use wirebridge::{
    AsyncChannel,
    ChannelError,
    EventLoop,
    EventLoopConfig,
    EventLoopHandle,
    SocketConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Enable structured logging for the demo server.
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let config = EventLoopConfig::builder()
        .events_capacity(cli.events_capacity)
        .build()?;
    let event_loop = EventLoop::with_config(config)?;
    let listener = TcpListener::bind(cli.listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let handle = event_loop.handle().clone();
                tokio::spawn(async move {
                    if let Err(e) = echo(handle, stream).await {
                        warn!(%peer, error = %e, "connection failed");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    tokio::task::spawn_blocking(move || event_loop.shutdown()).await?;
    Ok(())
}

async fn echo(event_loop: EventLoopHandle, stream: TcpStream) -> wirebridge::Result<()> {
    let stream = stream.into_std().map_err(ChannelError::io)?;
    let channel = event_loop
        .register_stream(stream, SocketConfig::default())
        .await?;
    let (_channel, inbound, outbound) = AsyncChannel::<Bytes, Bytes>::wrap(channel)
        .await?
        .into_parts();
    while let Some(chunk) = inbound.next().await? {
        outbound.write_and_flush(chunk).await?;
    }
    Ok(())
}
