//! Stream fan-out: one producer, two independently buffered consumers.
//!
//! Both sinks see identical byte sequences and an identical EOF. Each side
//! has its own bounded buffer; the producer blocks on whichever open buffer
//! fills first, so the slower sink slows the faster one instead of growing
//! memory. A sink that goes away (receiver dropped) stops receiving without
//! disturbing the other side; the producer stops only when both are gone.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use amargo_domain::stream::ByteStream;

/// Split `src` into two streams carrying the same bytes.
///
/// `buffer` is the per-sink chunk capacity (clamped to at least 1).
pub fn split(src: ByteStream, buffer: usize) -> (ByteStream, ByteStream) {
    let buffer = buffer.max(1);
    let (tx_a, rx_a) = mpsc::channel::<std::io::Result<Bytes>>(buffer);
    let (tx_b, rx_b) = mpsc::channel::<std::io::Result<Bytes>>(buffer);

    tokio::spawn(async move {
        let mut src = src;
        let mut a_open = true;
        let mut b_open = true;
        while let Some(item) = src.next().await {
            match item {
                Ok(chunk) => {
                    if a_open && tx_a.send(Ok(chunk.clone())).await.is_err() {
                        a_open = false;
                    }
                    if b_open && tx_b.send(Ok(chunk)).await.is_err() {
                        b_open = false;
                    }
                }
                Err(e) => {
                    // io::Error is not Clone; surface the same kind/message
                    // to both sides and stop.
                    let kind = e.kind();
                    let msg = e.to_string();
                    if a_open {
                        let _ = tx_a.send(Err(std::io::Error::new(kind, msg.clone()))).await;
                    }
                    if b_open {
                        let _ = tx_b.send(Err(std::io::Error::new(kind, msg))).await;
                    }
                    return;
                }
            }
            if !a_open && !b_open {
                return;
            }
        }
    });

    (receiver_stream(rx_a), receiver_stream(rx_b))
}

fn receiver_stream(mut rx: mpsc::Receiver<std::io::Result<Bytes>>) -> ByteStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}
