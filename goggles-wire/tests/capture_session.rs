//! End-to-end capture protocol sessions over the real abstract socket.
//!
//! The socket name is process-global, so every test takes the same lock
//! and tears its server down before releasing it.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Mutex;

use goggles_wire::protocol::TextureDesc;
use goggles_wire::{CaptureClient, CaptureServer};

static SOCKET_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt::try_init();
    SOCKET_LOCK.lock().unwrap()
}

const VK_FORMAT_B8G8R8A8_UNORM: u32 = 44;

fn test_fd() -> OwnedFd {
    OwnedFd::from(File::open("/dev/null").unwrap())
}

fn poll_until<F: Fn(&CaptureServer) -> bool>(server: &mut CaptureServer, pred: F) {
    for _ in 0..200 {
        server.poll();
        if pred(server) {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("server never reached expected state");
}

fn desc_640x480() -> TextureDesc {
    TextureDesc {
        width: 640,
        height: 480,
        stride: 640 * 4,
        offset: 0,
        format: VK_FORMAT_B8G8R8A8_UNORM,
        modifier: 0,
    }
}

#[test]
fn legacy_texture_desc_produces_a_frame() {
    let _guard = lock();
    let mut server = CaptureServer::bind().unwrap();

    let mut client = CaptureClient::connect("vkcube").unwrap();
    poll_until(&mut server, |s| s.is_connected());

    // The server greets with a capturing control message.
    client.poll_control();
    assert!(client.is_capturing());

    let fd = test_fd();
    client.send_texture(desc_640x480(), fd.as_fd()).unwrap();

    poll_until(&mut server, |s| s.has_frame());

    let frame = server.latest(0).expect("frame should be available");
    assert_eq!(frame.image.width, 640);
    assert_eq!(frame.image.height, 480);
    assert_eq!(frame.image.format, VK_FORMAT_B8G8R8A8_UNORM);
    assert!(frame.image.is_importable());
}

#[test]
fn frame_numbers_are_monotone() {
    let _guard = lock();
    let mut server = CaptureServer::bind().unwrap();

    let client = CaptureClient::connect("game").unwrap();
    poll_until(&mut server, |s| s.is_connected());

    let desc = desc_640x480();
    client.send_frame(desc, 1, test_fd().as_fd()).unwrap();
    poll_until(&mut server, |s| s.has_frame());

    let first = server.latest(0).unwrap();
    assert_eq!(first.frame_number, 1);
    // Already consumed: nothing newer than 1 yet.
    assert!(server.latest(1).is_none());

    client.send_frame(desc, 2, test_fd().as_fd()).unwrap();
    poll_until(&mut server, |s| s.latest(1).is_some());

    let second = server.latest(1).unwrap();
    assert_eq!(second.frame_number, 2);
    assert!(server.latest(2).is_none());
}

#[test]
fn disconnect_releases_frame_and_keeps_listener() {
    let _guard = lock();
    let mut server = CaptureServer::bind().unwrap();

    {
        let client = CaptureClient::connect("one-shot").unwrap();
        poll_until(&mut server, |s| s.is_connected());
        client
            .send_frame(desc_640x480(), 1, test_fd().as_fd())
            .unwrap();
        poll_until(&mut server, |s| s.has_frame());
    } // client dropped: peer close

    poll_until(&mut server, |s| !s.is_connected());
    assert!(!server.has_frame());
    assert!(server.latest(0).is_none());

    // The listener survives for a reconnect.
    let _client = CaptureClient::connect("second").unwrap();
    poll_until(&mut server, |s| s.is_connected());
}

#[test]
fn semaphore_init_hands_over_both_fds_and_drops_stale_image() {
    let _guard = lock();
    let mut server = CaptureServer::bind().unwrap();

    let client = CaptureClient::connect("synced").unwrap();
    poll_until(&mut server, |s| s.is_connected());

    let desc = desc_640x480();
    client.send_frame(desc, 7, test_fd().as_fd()).unwrap();
    poll_until(&mut server, |s| s.has_frame());

    let ready = test_fd();
    let consumed = test_fd();
    client
        .send_semaphores(0, ready.as_fd(), consumed.as_fd())
        .unwrap();

    poll_until(&mut server, |_| true);
    let mut pair = None;
    for _ in 0..200 {
        server.poll();
        if let Some(p) = server.take_semaphores() {
            pair = Some(p);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let (_ready_fd, _consumed_fd) = pair.expect("semaphore pair should arrive");

    // Handing over the pair is one-shot.
    assert!(server.take_semaphores().is_none());

    // The previous image handle belonged to the old sync regime.
    assert!(!server.has_frame());

    // The next announced frame is served as usual.
    client.send_frame(desc, 8, test_fd().as_fd()).unwrap();
    poll_until(&mut server, |s| s.has_frame());
    assert_eq!(server.latest(7).unwrap().frame_number, 8);
}

#[test]
fn second_connection_is_rejected() {
    let _guard = lock();
    let mut server = CaptureServer::bind().unwrap();

    let _first = CaptureClient::connect("first").unwrap();
    poll_until(&mut server, |s| s.is_connected());

    // A second producer connects; the server accepts then closes it. The
    // first connection keeps working.
    let second = CaptureClient::connect("second").unwrap();
    for _ in 0..50 {
        server.poll();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    drop(second);

    assert!(server.is_connected());
    _first
        .send_frame(desc_640x480(), 1, test_fd().as_fd())
        .unwrap();
    poll_until(&mut server, |s| s.has_frame());
}

#[test]
fn bind_twice_reports_address_in_use() {
    let _guard = lock();
    let _server = CaptureServer::bind().unwrap();
    let err = CaptureServer::bind().unwrap_err();
    assert_eq!(err.kind, goggles_core::ErrorKind::CaptureInitFailed);
    assert!(err.message.contains("already in use"));
}
