//! Console relay over in-memory and TCP consoles

use serialcal_core::core::transport::{BufferedTransport, DirectTransport};
use serialcal_core::{ConsoleRelay, RelayExit, RelayOptions, RuntimeContext};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_relay_round_trip_and_quit_key() {
    let (dev_ours, mut dev_peer) = tokio::io::duplex(1024);
    let (con_ours, mut con_peer) = tokio::io::duplex(1024);
    let mut device = BufferedTransport::from_stream(dev_ours, "device");
    let mut console = BufferedTransport::from_stream(con_ours, "console");
    let ctx = RuntimeContext::default();

    let operator = tokio::spawn(async move {
        con_peer.write_all(b"I\r").await.unwrap();

        let mut line = [0u8; 3];
        dev_peer.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"I\r\n");
        dev_peer.write_all(b"ok\r\n").await.unwrap();

        let expected = b"ok[CR][LF]\n";
        let mut rendered = vec![0u8; expected.len()];
        con_peer.read_exact(&mut rendered).await.unwrap();
        assert_eq!(rendered, expected);

        con_peer.write_all(&[0x04]).await.unwrap();
        (dev_peer, con_peer)
    });

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        ConsoleRelay::new(&mut device, &mut console, &ctx, RelayOptions::default()).run(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(exit, RelayExit::Quit);
    assert!(ctx.should_quit());
    let _peers = operator.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_ends_only_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let (dev_ours, _dev_peer) = tokio::io::duplex(1024);
    let mut device = BufferedTransport::from_stream(dev_ours, "device");
    let mut console = DirectTransport::tcp(server);

    let process = RuntimeContext::default();
    let session = process.for_session();
    drop(client);

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        ConsoleRelay::new(&mut device, &mut console, &session, RelayOptions::default()).run(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(exit, RelayExit::PeerClosed);
    assert!(session.should_quit());
    assert!(!process.should_quit());
}

#[tokio::test]
async fn test_process_quit_stops_relay() {
    let (dev_ours, _dev_peer) = tokio::io::duplex(64);
    let (con_ours, _con_peer) = tokio::io::duplex(64);
    let mut device = BufferedTransport::from_stream(dev_ours, "device");
    let mut console = BufferedTransport::from_stream(con_ours, "console");

    let process = RuntimeContext::default();
    let session = process.for_session();
    let quitter = process.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        quitter.request_quit();
    });

    let exit = ConsoleRelay::new(&mut device, &mut console, &session, RelayOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(exit, RelayExit::Quit);
}
