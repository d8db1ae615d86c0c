//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    time::Duration,
};

use wirebridge::{
    ChannelHandle,
    bridge::{OUTBOUND_ADAPTER, OutboundAdapter},
};

/// Boxed error result used by integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Upper bound on how long a test waits for the loop to reach a state.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a TCP listener bound to a free local port.
#[expect(
    clippy::expect_used,
    reason = "binding to an ephemeral localhost port must abort the test immediately"
)]
pub fn unused_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("failed to bind port")
}

/// Writes parked in the channel's outbound adapter.
pub async fn queued_writes(channel: &ChannelHandle) -> TestResult<usize> {
    let queued = channel
        .submit(|channel| {
            channel.invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |adapter, _| {
                adapter.queued()
            })
        })
        .await?;
    Ok(queued.unwrap_or(0))
}

/// Wait until at least `count` writes are parked in the outbound adapter.
pub async fn wait_for_queued(channel: &ChannelHandle, count: usize) -> TestResult {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while queued_writes(channel).await? < count {
            tokio::task::yield_now().await;
        }
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })
    .await??;
    Ok(())
}
