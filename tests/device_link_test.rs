//! Device link tests over real TCP sockets on localhost.
//!
//! Each test starts a link on an ephemeral port and plays the device side
//! with a plain `TcpStream`.

use bytes::Bytes;
use ct_scan::hardware::{
    CaptureDevice, CaptureListener, CaptureLink, CaptureParams, Positioner, PositionerLink,
    PositionerListener,
};
use ct_scan::network::protocol::{self, CaptureMessage, PositionerMessage, Token, FRAME_SIZE};
use ct_scan::network::LinkState;
use ct_scan::DeviceRole;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    MoveDone(f64, Token),
    Status(f64),
    CaptureDone(Option<Bytes>, u32, u32, u32, Token),
    TestCapture(Option<Bytes>, Token),
    LinkLost(DeviceRole),
}

struct Forward(mpsc::UnboundedSender<Event>);

impl PositionerListener for Forward {
    fn on_position_done(&self, angle: f64, token: Token) {
        let _ = self.0.send(Event::MoveDone(angle, token));
    }

    fn on_status(&self, angle: f64) {
        let _ = self.0.send(Event::Status(angle));
    }

    fn on_link_lost(&self, role: DeviceRole) {
        let _ = self.0.send(Event::LinkLost(role));
    }
}

impl CaptureListener for Forward {
    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        stride_pixel: u32,
        stride_row: u32,
        sensor: u32,
        token: Token,
    ) {
        let _ = self
            .0
            .send(Event::CaptureDone(data, stride_pixel, stride_row, sensor, token));
    }

    fn on_test_capture(&self, data: Option<Bytes>, token: Token) {
        let _ = self.0.send(Event::TestCapture(data, token));
    }

    fn on_link_lost(&self, role: DeviceRole) {
        let _ = self.0.send(Event::LinkLost(role));
    }
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn positioner_link() -> (PositionerLink, mpsc::UnboundedReceiver<Event>) {
    let link = PositionerLink::new(localhost());
    let (tx, rx) = mpsc::unbounded_channel();
    link.add_listener(Arc::new(Forward(tx)));
    link.start().await.unwrap();
    (link, rx)
}

async fn capture_link(max_payload: usize) -> (CaptureLink, mpsc::UnboundedReceiver<Event>) {
    let link = CaptureLink::with_max_payload(localhost(), max_payload);
    let (tx, rx) = mpsc::unbounded_channel();
    link.add_listener(Arc::new(Forward(tx)));
    link.start().await.unwrap();
    (link, rx)
}

async fn connect<P: ct_scan::network::LinkProtocol>(
    link: &ct_scan::network::DeviceLink<P>,
) -> TcpStream {
    let stream = TcpStream::connect(link.local_addr().unwrap()).await.unwrap();
    assert!(link.wait_ready(WAIT).await, "link never became ready");
    stream
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener channel closed")
}

async fn read_frame(stream: &mut TcpStream) -> [u8; FRAME_SIZE] {
    let mut buf = [0u8; FRAME_SIZE];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for frame")
        .unwrap();
    buf
}

async fn wait_for_state<P: ct_scan::network::LinkProtocol>(
    link: &ct_scan::network::DeviceLink<P>,
    expected: LinkState,
) {
    let mut rx = link.subscribe();
    timeout(WAIT, rx.wait_for(|s| *s == expected))
        .await
        .expect("timed out waiting for link state")
        .unwrap();
}

#[tokio::test]
async fn test_link_ready_follows_connection() {
    let (link, mut events) = positioner_link().await;
    assert_eq!(link.state(), LinkState::Listening);
    assert!(!link.is_ready());
    assert!(link.is_running());

    let stream = connect(&link).await;
    assert!(matches!(link.state(), LinkState::Connected(_)));

    drop(stream);
    assert_eq!(next_event(&mut events).await, Event::LinkLost(DeviceRole::Positioner));
    wait_for_state(&link, LinkState::Listening).await;
    assert!(!link.is_ready());

    link.stop().await;
}

#[tokio::test]
async fn test_move_request_wire_layout() {
    let (link, _events) = positioner_link().await;
    let mut device = connect(&link).await;

    link.move_to(45.5, Token(0x12_3456)).unwrap();

    let frame = read_frame(&mut device).await;
    assert_eq!(frame[0], 0x0A);
    assert_eq!(&frame[1..5], &0x12_3456u32.to_be_bytes());
    assert_eq!(&frame[5..9], &4550u32.to_be_bytes());
    assert!(frame[9..].iter().all(|b| *b == 0));

    link.stop().await;
}

#[tokio::test]
async fn test_move_without_device_is_dropped() {
    let (link, _events) = positioner_link().await;

    assert!(link.move_to(10.0, Token(7)).is_ok());
    assert!(link.move_to(-1.0, Token(7)).is_err());

    // A device connecting later does not receive the dropped request.
    let mut device = connect(&link).await;
    link.request_status().unwrap();
    let frame = read_frame(&mut device).await;
    assert_eq!(frame[0], 0x0F);

    link.stop().await;
}

#[tokio::test]
async fn test_move_done_split_across_writes() {
    let (link, mut events) = positioner_link().await;
    let mut device = connect(&link).await;

    let reply = PositionerMessage::MoveDone {
        token: Token(0xABCDEF),
        angle: 90.0,
    }
    .encode()
    .unwrap();
    device.write_all(&reply[..5]).await.unwrap();
    device.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.write_all(&reply[5..]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::MoveDone(90.0, Token(0xABCDEF))
    );

    link.stop().await;
}

#[tokio::test]
async fn test_unknown_opcode_keeps_connection() {
    let (link, mut events) = positioner_link().await;
    let mut device = connect(&link).await;

    let mut junk = [0u8; FRAME_SIZE];
    junk[0] = 0x55;
    device.write_all(&junk).await.unwrap();

    // A capture opcode on the positioner link is skipped too.
    let capture_done = CaptureMessage::CaptureDone {
        token: Token(1),
        stride_pixel: 2,
        stride_row: 8,
        sensor: 0,
        payload_len: 0,
    }
    .encode()
    .unwrap();
    device.write_all(&capture_done).await.unwrap();

    let status = PositionerMessage::Status { angle: 12.25 }.encode().unwrap();
    device.write_all(&status).await.unwrap();

    assert_eq!(next_event(&mut events).await, Event::Status(12.25));
    assert!(link.is_ready());

    link.stop().await;
}

#[tokio::test]
async fn test_status_request_and_reply() {
    let (link, mut events) = positioner_link().await;
    let mut device = connect(&link).await;

    link.request_status().unwrap();
    let request = read_frame(&mut device).await;
    let frame = protocol::decode(&request).unwrap();
    assert_eq!(
        PositionerMessage::from_frame(&frame),
        Some(PositionerMessage::RequestStatus)
    );

    let reply = protocol::encode(0xAF, &[0, 27_000]).unwrap();
    device.write_all(&reply).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Status(270.0));

    link.stop().await;
}

#[tokio::test]
async fn test_new_device_replaces_lost_one() {
    let (link, mut events) = positioner_link().await;

    let first = connect(&link).await;
    drop(first);
    assert_eq!(next_event(&mut events).await, Event::LinkLost(DeviceRole::Positioner));
    wait_for_state(&link, LinkState::Listening).await;

    let mut second = connect(&link).await;
    link.move_to(1.0, Token(99)).unwrap();
    let frame = read_frame(&mut second).await;
    assert_eq!(&frame[1..5], &99u32.to_be_bytes());

    link.stop().await;
}

#[tokio::test]
async fn test_capture_request_wire_layout() {
    let (link, _events) = capture_link(1024).await;
    let mut device = connect(&link).await;

    let params = CaptureParams {
        shutter_ms: 10,
        exposure_ms: 20,
        focus_ms: 30,
    };
    link.capture(&params, Token(0x42)).unwrap();

    let frame = read_frame(&mut device).await;
    assert_eq!(frame[0], 0x1B);
    assert_eq!(&frame[1..5], &0x42u32.to_be_bytes());
    assert_eq!(&frame[5..9], &10u32.to_be_bytes());
    assert_eq!(&frame[9..13], &20u32.to_be_bytes());
    assert_eq!(&frame[13..17], &30u32.to_be_bytes());

    link.stop().await;
}

#[tokio::test]
async fn test_capture_done_with_and_without_payload() {
    let (link, mut events) = capture_link(1024).await;
    let mut device = connect(&link).await;

    let header = CaptureMessage::CaptureDone {
        token: Token(5),
        stride_pixel: 2,
        stride_row: 4,
        sensor: 3,
        payload_len: 8,
    }
    .encode()
    .unwrap();
    device.write_all(&header).await.unwrap();
    device.write_all(&[1, 2, 3, 4]).await.unwrap();
    device.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.write_all(&[5, 6, 7, 8]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::CaptureDone(
            Some(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])),
            2,
            4,
            3,
            Token(5)
        )
    );

    let header = CaptureMessage::CaptureDone {
        token: Token(6),
        stride_pixel: 0,
        stride_row: 0,
        sensor: 0,
        payload_len: 0,
    }
    .encode()
    .unwrap();
    device.write_all(&header).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::CaptureDone(None, 0, 0, 0, Token(6))
    );

    let test = CaptureMessage::TestCapture {
        token: Token(7),
        payload_len: 2,
    }
    .encode()
    .unwrap();
    device.write_all(&test).await.unwrap();
    device.write_all(&[9, 9]).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::TestCapture(Some(Bytes::from_static(&[9, 9])), Token(7))
    );

    link.stop().await;
}

#[tokio::test]
async fn test_oversized_payload_closes_connection() {
    let (link, mut events) = capture_link(16).await;
    let mut device = connect(&link).await;

    let header = CaptureMessage::CaptureDone {
        token: Token(1),
        stride_pixel: 2,
        stride_row: 64,
        sensor: 0,
        payload_len: 1024,
    }
    .encode()
    .unwrap();
    device.write_all(&header).await.unwrap();

    assert_eq!(next_event(&mut events).await, Event::LinkLost(DeviceRole::Capture));
    wait_for_state(&link, LinkState::Listening).await;

    let mut rest = Vec::new();
    let read = timeout(WAIT, device.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    assert!(read.map(|n| n == 0).unwrap_or(true));

    link.stop().await;
}

#[tokio::test]
async fn test_stop_and_restart() {
    let (link, mut events) = positioner_link().await;
    let _device = connect(&link).await;

    link.stop().await;
    assert_eq!(link.state(), LinkState::Stopped);
    assert!(!link.is_running());
    assert!(!link.is_ready());
    assert!(link.local_addr().is_none());
    assert_eq!(next_event(&mut events).await, Event::LinkLost(DeviceRole::Positioner));

    // Stopping twice is harmless.
    link.stop().await;

    link.start().await.unwrap();
    assert_eq!(link.state(), LinkState::Listening);
    let _device = connect(&link).await;
    assert!(link.is_ready());

    link.stop().await;
}

#[tokio::test]
async fn test_connectivity_callback_sees_transitions() {
    let link = PositionerLink::new(localhost());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    link.set_connectivity_callback(Arc::new(move |role, state| {
        sink.lock().unwrap().push((role, state.is_connected()));
    }));

    link.start().await.unwrap();
    let device = connect(&link).await;
    drop(device);
    wait_for_state(&link, LinkState::Listening).await;
    link.stop().await;

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (DeviceRole::Positioner, false),
            (DeviceRole::Positioner, true),
            (DeviceRole::Positioner, false),
            (DeviceRole::Positioner, false),
        ]
    );
}

#[tokio::test]
async fn test_listener_removed_is_not_notified() {
    let link = PositionerLink::new(localhost());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn PositionerListener> = Arc::new(Forward(tx));
    link.add_listener(listener.clone());
    link.start().await.unwrap();
    let mut device = connect(&link).await;

    assert!(link.remove_listener(&listener));
    assert!(!link.remove_listener(&listener));

    let reply = PositionerMessage::MoveDone {
        token: Token(3),
        angle: 3.0,
    }
    .encode()
    .unwrap();
    device.write_all(&reply).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err());
    link.stop().await;
}
