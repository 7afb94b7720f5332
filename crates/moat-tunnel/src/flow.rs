//! Packet Flow
//!
//! Everything routed into the airlock ends up here and is thrown away.
//! The flow must be drained for the tunnel's whole lifetime: if nobody
//! reads, the transport buffer fills and stalls all traffic through the
//! interface, excluded LAN traffic included.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Source of packets delivered to the virtual interface
#[async_trait]
pub trait PacketFlow: Send + 'static {
    /// Read the next batch of packets; `None` once the flow is closed
    async fn read_packets(&mut self) -> Option<Vec<Vec<u8>>>;
}

#[async_trait]
impl PacketFlow for mpsc::Receiver<Vec<u8>> {
    async fn read_packets(&mut self) -> Option<Vec<Vec<u8>>> {
        let first = self.recv().await?;

        let mut batch = vec![first];
        while let Ok(packet) = self.try_recv() {
            batch.push(packet);
        }
        Some(batch)
    }
}

/// Totals for one drain loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Batches read
    pub batches: u64,
    /// Packets discarded
    pub packets: u64,
}

/// Read and discard packets until the flow closes or `shutdown` fires.
///
/// Pending packets are always read before the shutdown signal is honoured.
pub async fn drain<F: PacketFlow>(mut flow: F, mut shutdown: oneshot::Receiver<()>) -> DrainStats {
    let mut stats = DrainStats::default();

    loop {
        tokio::select! {
            biased;

            batch = flow.read_packets() => {
                let Some(batch) = batch else {
                    debug!("Packet flow closed");
                    break;
                };
                stats.batches += 1;
                stats.packets += batch.len() as u64;
            }
            _ = &mut shutdown => {
                debug!("Drain loop stopping");
                break;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_until_closed() {
        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = oneshot::channel();

        for i in 0..5u8 {
            tx.send(vec![i; 64]).await.unwrap();
        }
        drop(tx);

        let stats = drain(rx, stop_rx).await;
        assert_eq!(stats.packets, 5);
        assert!(stats.batches >= 1);
    }

    #[tokio::test]
    async fn test_drain_keeps_small_buffer_moving() {
        let (tx, rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(drain(rx, stop_rx));

        // Would block forever on a 2-slot buffer if nothing drained
        for _ in 0..50 {
            tx.send(vec![0u8; 1400]).await.unwrap();
        }

        stop_tx.send(()).unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.packets, 50);
    }
}
