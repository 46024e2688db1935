use crate::config::CollectorConfig;
use crate::netflow::decoder::Decoder;
use crate::netflow::record::FlowMessage;
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// A datagram as handed over to the decoder
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub payload: Vec<u8>,
    pub source: IpAddr,
}

/// Receives NetFlow datagrams and spreads them over decoding workers
pub struct Collector {
    config: CollectorConfig,
    decoder: Arc<Decoder>,
}

impl Collector {
    pub fn new(config: CollectorConfig, decoder: Arc<Decoder>) -> Result<Self> {
        if config.workers == 0 {
            anyhow::bail!("collector needs at least one worker");
        }
        if config.queue_size == 0 {
            anyhow::bail!("collector queue size must be at least 1");
        }
        Ok(Self { config, decoder })
    }

    pub async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen))?;
        tracing::info!(
            "Listening for NetFlow v9 on {} ({} workers)",
            self.config.listen,
            self.config.workers
        );

        let (flow_tx, flow_rx) = mpsc::channel(self.config.queue_size);
        let sink = tokio::spawn(write_flows(flow_rx));

        let mut senders = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let (tx, rx) = mpsc::channel(self.config.queue_size);
            tokio::spawn(worker(id, rx, self.decoder.clone(), flow_tx.clone()));
            senders.push(tx);
        }
        drop(flow_tx);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut next = 0;
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("Failed to receive datagram: {}", e);
                            continue;
                        }
                    };
                    let packet = RawPacket {
                        payload: buf[..len].to_vec(),
                        source: source.ip(),
                    };
                    if senders[next].send(packet).await.is_err() {
                        tracing::error!("Worker {} stopped, shutting down", next);
                        break;
                    }
                    next = (next + 1) % senders.len();
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down collector");
                    break;
                }
            }
        }

        // Workers drain their queues, then the sink exits once they are gone
        drop(senders);
        sink.await.context("Flow writer panicked")??;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Decode one packet and stamp the reception time on its flows.
/// Decoding errors are already counted by the decoder.
pub fn decode_packet(decoder: &Decoder, packet: &RawPacket, time_received: u64) -> Vec<FlowMessage> {
    match decoder.decode(&packet.payload, packet.source) {
        Ok(mut flows) => {
            for flow in &mut flows {
                flow.time_received = time_received;
            }
            flows
        }
        Err(_) => Vec::new(),
    }
}

async fn worker(
    id: usize,
    mut packets: mpsc::Receiver<RawPacket>,
    decoder: Arc<Decoder>,
    flows: mpsc::Sender<Vec<FlowMessage>>,
) {
    tracing::debug!("Worker {} started", id);
    while let Some(packet) = packets.recv().await {
        let decoded = decode_packet(&decoder, &packet, now_secs());
        if decoded.is_empty() {
            continue;
        }
        if flows.send(decoded).await.is_err() {
            break;
        }
    }
    tracing::debug!("Worker {} stopped", id);
}

/// Write flows to stdout, one JSON document per line
async fn write_flows(mut flows: mpsc::Receiver<Vec<FlowMessage>>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(batch) = flows.recv().await {
        let mut buf = Vec::new();
        for flow in &batch {
            serde_json::to_writer(&mut buf, flow)?;
            buf.push(b'\n');
        }
        stdout.write_all(&buf).await?;
    }
    stdout.flush().await?;
    Ok(())
}
