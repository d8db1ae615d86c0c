//! Tests for the inbound half of the async bridge.
//!
//! Messages are injected through an embedded transport and read back through
//! [`InboundStream`](wirebridge::InboundStream).

mod common;

use common::{SETTLE_TIMEOUT, TestResult};
use futures::StreamExt;
use proptest::prelude::*;
use rstest::rstest;
use wirebridge::{AsyncChannel, BridgeError, EventLoop, bridge::INBOUND_ADAPTER};
use wirebridge_testing::{TestError, event_loop, read_expect};

fn bang(error: &BridgeError) -> bool {
    error
        .as_channel_error()
        .and_then(|e| e.downcast_ref::<TestError>())
        == Some(&TestError::Bang)
}

#[rstest]
#[tokio::test]
async fn reads_arrive_then_end_of_input(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    embedded.write_inbound(1_u32)?;
    embedded.write_inbound(2_u32)?;
    embedded.fire_input_closed()?;

    assert_eq!(read_expect!(bridged.next()), Some(1));
    assert_eq!(read_expect!(bridged.next()), Some(2));
    assert_eq!(read_expect!(bridged.next()), None);
    assert_eq!(read_expect!(bridged.next()), None);
    Ok(())
}

#[rstest]
#[case::none(0)]
#[case::one(1)]
#[case::several(5)]
#[tokio::test]
async fn errors_follow_buffered_reads(event_loop: EventLoop, #[case] buffered: u32) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    for n in 0..buffered {
        embedded.write_inbound(n)?;
    }
    embedded.fire_error(TestError::Bang)?;

    for n in 0..buffered {
        assert_eq!(read_expect!(bridged.next()), Some(n));
    }
    let err = bridged.next().await.expect_err("error after buffered reads");
    assert!(bang(&err), "unexpected error: {err}");
    let again = bridged.next().await.expect_err("error is sticky");
    assert!(bang(&again), "unexpected error: {again}");
    Ok(())
}

#[rstest]
#[tokio::test]
async fn a_parked_read_wakes_on_arrival(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    let reader = bridged.inbound().clone();
    let pending = tokio::spawn(async move { reader.next().await });
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while embedded.read_demand().await? == 0 {
            tokio::task::yield_now().await;
        }
        Ok::<_, BridgeError>(())
    })
    .await??;

    embedded.write_inbound(42_u32)?;
    assert_eq!(pending.await??, Some(42));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn a_second_concurrent_reader_is_rejected(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    let reader = bridged.inbound().clone();
    let pending = tokio::spawn(async move { reader.next().await });
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while embedded.read_demand().await? == 0 {
            tokio::task::yield_now().await;
        }
        Ok::<_, BridgeError>(())
    })
    .await??;

    let err = bridged.next().await.expect_err("second reader rejected");
    assert!(matches!(err, BridgeError::ConcurrentConsumptionNotAllowed));

    embedded.write_inbound(4_u32)?;
    assert_eq!(pending.await??, Some(4));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn removing_the_adapter_ends_the_stream_after_buffered_reads(
    event_loop: EventLoop,
) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    embedded.write_inbound(1_u32)?;
    embedded.write_inbound(2_u32)?;
    bridged.channel().remove_handler(INBOUND_ADAPTER).await?;
    embedded.write_inbound(3_u32)?;

    assert_eq!(read_expect!(bridged.next()), Some(1));
    assert_eq!(read_expect!(bridged.next()), Some(2));
    assert_eq!(read_expect!(bridged.next()), None);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn mistyped_messages_fail_the_stream(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    embedded.write_inbound("seven")?;
    let err = bridged.next().await.expect_err("type mismatch");
    assert_eq!(
        err.as_channel_error().map(wirebridge::ChannelError::kind),
        Some(wirebridge::ChannelErrorKind::UnexpectedMessage)
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn into_stream_yields_the_error_once(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;

    embedded.write_inbound(1_u32)?;
    embedded.fire_error(TestError::Bang)?;

    let (_channel, inbound, _outbound) = bridged.into_parts();
    let items: Vec<_> = inbound.into_stream().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(*items[0].as_ref().expect("first message"), 1);
    assert!(bang(items[1].as_ref().expect_err("then the error")));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn wrapping_a_closed_channel_fails(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    embedded.close(wirebridge::CloseMode::All).await?;

    let err = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone())
        .await
        .expect_err("inactive channel");
    assert!(err.as_channel_error().is_some_and(wirebridge::ChannelError::is_closed));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn wrapping_twice_fails(event_loop: EventLoop) -> TestResult {
    let embedded = event_loop.handle().embedded_channel().await?;
    let _bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;
    assert!(
        AsyncChannel::<u32, u32>::wrap(embedded.handle().clone())
            .await
            .is_err()
    );
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn reads_keep_arrival_order(values in proptest::collection::vec(any::<u32>(), 0..64)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime");
        let event_loop = EventLoop::new().expect("failed to start event loop");

        let received = rt.block_on(async {
            let embedded = event_loop
                .handle()
                .embedded_channel()
                .await
                .expect("embedded channel");
            let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone())
                .await
                .expect("wrap");
            for value in &values {
                embedded.write_inbound(*value).expect("inject");
            }
            embedded.fire_input_closed().expect("inject");
            let mut received = Vec::new();
            while let Some(value) = read_expect!(bridged.next()) {
                received.push(value);
            }
            received
        });
        prop_assert_eq!(received, values);
    }
}
