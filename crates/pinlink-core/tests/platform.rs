//! Platform adapter end to end over scripted boards

mod common;

use common::{fast_config, wire, PATIENCE};
use pinlink_core::platform::{PlatformAdapter, ReceivedMessage};
use pinlink_core::protocol::{LinkState, Processor, ProtocolError};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;

async fn next_message(messages: &mut UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(PATIENCE, messages.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("message channel closed")
}

#[tokio::test]
async fn test_net_link_end_to_end() {
    let (mut platform, mut messages) = PlatformAdapter::new(fast_config());
    let (host, mut board) = wire();

    let script = async {
        board.identify_as("ID:NET FP-CPU-2000 2.00").await;
        board.boot_net("2000").await;
        board.expect("NN:00").await;
        board.reply("NN:00,FP-I/O-3208-2,01.09,08,20,00,00,00,00,00,00").await;
        board.expect("NN:01").await;
        board.reply("NN:F").await;
    };
    let (result, ()) = tokio::join!(platform.connect_stream("net0", host), script);
    assert_eq!(result.unwrap(), Processor::Net);

    assert_eq!(platform.link_state(Processor::Net), LinkState::Operational);
    assert_eq!(platform.link_state(Processor::Rgb), LinkState::Disconnected);
    assert_eq!(
        platform.identification(Processor::Net).unwrap().model,
        "FP-CPU-2000"
    );

    let boards = platform.boards();
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].switch_count, 0x20);

    // the snapshot taken during discovery arrives first
    let snapshot = next_message(&mut messages).await;
    assert_eq!(snapshot.message, "SA:0E,2900000000000000");

    platform.send(Processor::Net, "DL:01,81").unwrap();
    board.expect("DL:01,81").await;
    board.reply("DL:P").await;
    board.reply("-N:05").await;

    assert_eq!(
        next_message(&mut messages).await,
        ReceivedMessage {
            processor: Processor::Net,
            message: "-N:05".to_string(),
        }
    );
}

#[tokio::test]
async fn test_send_to_unconnected_processor() {
    let (platform, _messages) = PlatformAdapter::new(fast_config());
    assert!(matches!(
        platform.send(Processor::Dmd, "BM:00"),
        Err(ProtocolError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_duplicate_processor_is_rejected() {
    let (mut platform, _messages) = PlatformAdapter::new(fast_config());

    let (host, mut board) = wire();
    let (result, ()) = tokio::join!(
        platform.connect_stream("rgb0", host),
        board.identify_as("ID:RGB FP-CPU-2000 2.00"),
    );
    assert_eq!(result.unwrap(), Processor::Rgb);

    let (host, mut second) = wire();
    let (result, ()) = tokio::join!(
        platform.connect_stream("rgb1", host),
        second.identify_as("ID:RGB FP-CPU-2000 2.00"),
    );
    assert!(matches!(result, Err(ProtocolError::InvalidState(_))));

    // the first link is untouched
    assert_eq!(platform.link_state(Processor::Rgb), LinkState::Operational);
    assert_eq!(platform.communicator(Processor::Rgb).unwrap().port(), "rgb0");
}

#[tokio::test]
async fn test_link_loss_is_reported() {
    let (mut platform, _messages) = PlatformAdapter::new(fast_config());

    let (rgb_host, mut rgb) = wire();
    let (result, ()) = tokio::join!(
        platform.connect_stream("rgb0", rgb_host),
        rgb.identify_as("ID:RGB FP-CPU-2000 2.00"),
    );
    result.unwrap();

    let (seg_host, mut seg) = wire();
    let (result, ()) = tokio::join!(
        platform.connect_stream("seg0", seg_host),
        seg.identify_as("ID:SEG FP-SEG-6 0.10"),
    );
    result.unwrap();

    drop(seg);
    let (processor, reason) = tokio::time::timeout(PATIENCE, platform.wait_for_link_loss())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(processor, Processor::Seg);
    assert!(reason.is_some());
    assert_eq!(platform.link_state(Processor::Seg), LinkState::Stopped);
    assert_eq!(platform.link_state(Processor::Rgb), LinkState::Operational);

    platform.stop();
    assert_eq!(platform.link_state(Processor::Rgb), LinkState::Stopped);
}

#[tokio::test]
async fn test_old_firmware_is_not_registered() {
    let (mut platform, _messages) = PlatformAdapter::new(fast_config());
    let (host, mut board) = wire();

    let (result, ()) = tokio::join!(
        platform.connect_stream("dmd0", host),
        board.identify_as("ID:DMD FP-CPU-2000 0.80"),
    );
    assert!(matches!(
        result,
        Err(ProtocolError::FirmwareMismatch { processor: Processor::Dmd, .. })
    ));
    assert_eq!(platform.link_state(Processor::Dmd), LinkState::Disconnected);
}
