//! Tests for channel lifecycle log messages.

use rstest::rstest;
use serial_test::serial;
use wirebridge::{CloseMode, EventLoop};
use wirebridge_testing::{LoggerHandle, event_loop, logger};

#[rstest]
#[tokio::test]
#[serial]
async fn attach_and_reap_are_logged(
    event_loop: EventLoop,
    mut logger: LoggerHandle,
) -> wirebridge::Result<()> {
    let embedded = event_loop.handle().embedded_channel().await?;
    let id = embedded.handle().id();
    embedded.close(CloseMode::All).await?;
    drop(embedded);
    assert_eq!(event_loop.handle().submit(|cx| cx.channel_count()).await?, 0);

    assert!(logger.saw(&format!("channel attached: id={id}")));
    assert!(logger.saw(&format!("channel closed: id={id}")));
    Ok(())
}

#[rstest]
#[serial]
fn loop_start_and_stop_are_logged(mut logger: LoggerHandle) {
    let event_loop = EventLoop::new().expect("failed to start event loop");
    event_loop.shutdown();

    assert!(logger.saw("event loop started"));
    assert!(logger.saw("event loop stopped"));
}
