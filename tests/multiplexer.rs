//! Listen-mode console multiplexing over loopback TCP

use serialcal_core::core::multiplexer::resolve;
use serialcal_core::core::transport::TransportError;
use serialcal_core::{ByteTransport, ConsoleListener, ConsoleSpec, RuntimeContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Greets the client with its session number, then waits for it to leave
async fn greet_until_closed(
    mut console: Box<dyn ByteTransport>,
    ctx: RuntimeContext,
    number: usize,
) -> Result<(), TransportError> {
    console.write(format!("session {number}\n").as_bytes()).await?;
    let mut buf = [0u8; 64];
    loop {
        if ctx.should_quit() {
            break;
        }
        if !console.poll_for_input(Duration::from_millis(50)).await? {
            continue;
        }
        if console.read(&mut buf).await? == 0 {
            break;
        }
    }
    console.shutdown().await
}

async fn read_greeting(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 32];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test]
async fn test_sessions_are_served_one_at_a_time() {
    let spec = ConsoleSpec::parse("127.0.0.1:0").unwrap();
    let listener = ConsoleListener::bind(&spec).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = RuntimeContext::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let server = {
        let ctx = ctx.clone();
        let counter = Arc::clone(&counter);
        tokio::spawn(async move {
            listener
                .serve(&ctx, move |console, session_ctx| {
                    let number = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    greet_until_closed(console, session_ctx, number)
                })
                .await
        })
    };

    let mut first = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_greeting(&mut first).await, "session 1\n");

    // queued in the backlog until the first session ends
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 32];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), second.read(&mut buf))
            .await
            .is_err()
    );

    drop(first);
    let greeting = tokio::time::timeout(Duration::from_secs(5), read_greeting(&mut second))
        .await
        .unwrap();
    assert_eq!(greeting, "session 2\n");

    ctx.request_quit();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served, 2);
    drop(second);
}

#[tokio::test]
async fn test_session_quit_does_not_stop_listener() {
    let spec = ConsoleSpec::parse("127.0.0.1:0").unwrap();
    let listener = ConsoleListener::bind(&spec).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = RuntimeContext::default();
    let server = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            listener
                .serve(&ctx, |mut console: Box<dyn ByteTransport>, session_ctx: RuntimeContext| async move {
                    session_ctx.request_quit();
                    console.write(b"bye\n").await?;
                    console.shutdown().await
                })
                .await
        })
    };

    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, "bye\n");
    }
    assert!(!ctx.should_quit());

    ctx.request_quit();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served, 2);
}

#[tokio::test]
async fn test_resolve_connects_to_tcp_console() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let spec = ConsoleSpec::parse(&format!("127.0.0.1:{port}")).unwrap();
    let mut console = resolve(&spec).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    peer.write_all(b"hi").await.unwrap();
    assert!(console.poll_for_input(Duration::from_secs(2)).await.unwrap());
    let mut buf = [0u8; 8];
    let n = console.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hi");
    assert!(console.kind().is_network());
}
