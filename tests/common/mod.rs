//! Shared helpers for integration tests

#![allow(dead_code)]

use serialcal_core::core::transport::BufferedTransport;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A simulated device on the far end of a duplex pipe.
///
/// Every non-empty line the device receives is passed to `respond` with the
/// number of times that same line was seen before; whatever it returns is
/// written back. The device stays attached until the transport is dropped.
pub fn fake_device<F>(mut respond: F) -> BufferedTransport
where
    F: FnMut(&str, usize) -> Option<Vec<u8>> + Send + 'static,
{
    let (ours, mut theirs) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut line = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match theirs.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &b in &buf[..n] {
                if b != b'\r' && b != b'\n' {
                    line.push(b);
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                let count = seen.entry(text.clone()).or_insert(0);
                let reply = respond(&text, *count);
                *count += 1;
                if let Some(reply) = reply {
                    if theirs.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    BufferedTransport::from_stream(ours, "fake-device")
}
