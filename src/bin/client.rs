//! Minimal client launcher: connect to a relay server, run the network
//! poll / talker tick / heartbeat tasks, and stream silence frames as a
//! placeholder for the (external) microphone capture device.
//!
//! Usage: `voxcore-client <user_id> <server_addr>`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voxcore::config::{ClientConfig, SAMPLES_PER_FRAME};
use voxcore::client::SessionEndpoint;
use voxcore::traits::SpeechCodec;
use voxcore::transport::{Transport, UdpTransport};

/// Stand-in for the external speech codec: ships PCM samples as raw
/// little-endian bytes. A production deployment swaps this for a real
/// encoder; the transport core only depends on [`SpeechCodec`]'s shape.
#[derive(Clone)]
struct PcmPassthroughCodec;

impl SpeechCodec for PcmPassthroughCodec {
    fn encode(&mut self, pcm: &[f32]) -> Vec<u8> {
        pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn decode(&mut self, payload: &[u8], out: &mut [f32]) -> usize {
        let mut n = 0;
        for (i, chunk) in payload.chunks_exact(4).enumerate() {
            if i >= out.len() {
                break;
            }
            out[i] = f32::from_le_bytes(chunk.try_into().unwrap());
            n += 1;
        }
        n
    }

    fn conceal(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        out.len()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let user_id = args.next().unwrap_or_else(|| "anonymous".to_string());
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:9050".to_string())
        .parse()?;

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind("0.0.0.0:0".parse().unwrap()).await?);
    let config = ClientConfig::new(user_id, server_addr);
    let endpoint = SessionEndpoint::connect(config, transport.clone(), || PcmPassthroughCodec).await?;
    tracing::info!(entity_id = endpoint.entity_id(), "joined relay server");

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let network = tokio::spawn(endpoint.clone().network_poll_loop(transport.clone()));
    let talkers = tokio::spawn(endpoint.clone().talker_tick_loop());
    let heartbeat = tokio::spawn(endpoint.clone().heartbeat_loop(transport.clone(), shutdown_rx));

    let silence = vec![0.0f32; SAMPLES_PER_FRAME as usize];
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    loop {
        tick.tick().await;
        let mut codec = PcmPassthroughCodec;
        endpoint.write_audio(transport.as_ref(), 0.0, codec.encode(&silence)).await;
        if network.is_finished() || talkers.is_finished() || heartbeat.is_finished() {
            break;
        }
    }

    endpoint.stop();
    Ok(())
}
