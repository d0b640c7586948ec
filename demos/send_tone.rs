//! Transmits a 440 Hz tone as an AES67 stream to a multicast group.
//!
//! Usage: send_tone [group] [port] [interface]
//! Defaults: 239.1.15.52 5004 (default interface)
//!
//! Without a PTP stack the gate is forced open and packet pacing follows the
//! system clock.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ravenna_rtp::audio::{AudioEncoding, AudioFormat, ByteOrder, ChannelOrdering};
use ravenna_rtp::net::NetworkRuntime;
use ravenna_rtp::rtp::{AudioSender, WriterParameters};
use ravenna_rtp::util::Id;

const SAMPLE_RATE: u32 = 48_000;
const FRAMES_PER_BLOCK: usize = 48;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let mut args = std::env::args().skip(1);
    let group: Ipv4Addr = args
        .next()
        .map(|s| s.parse().expect("invalid group address"))
        .unwrap_or(Ipv4Addr::new(239, 1, 15, 52));
    let port: u16 = args
        .next()
        .map(|s| s.parse().expect("invalid port"))
        .unwrap_or(5004);
    let interface: Ipv4Addr = args
        .next()
        .map(|s| s.parse().expect("invalid interface address"))
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let params = WriterParameters {
        audio_format: AudioFormat {
            byte_order: ByteOrder::Be,
            encoding: AudioEncoding::PcmS24,
            ordering: ChannelOrdering::Interleaved,
            sample_rate: SAMPLE_RATE,
            num_channels: 2,
        },
        destinations: [
            SocketAddrV4::new(group, port),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        ],
        packet_time_frames: FRAMES_PER_BLOCK as u32,
        ttl: 15,
        payload_type: 96,
    };

    let sender = Arc::new(AudioSender::new());
    let runtime = NetworkRuntime::new();
    runtime.add_task(sender.clone());

    let id = Id::generate();
    sender
        .add_writer(id, &params, [interface, Ipv4Addr::UNSPECIFIED])
        .expect("failed to add writer");
    sender.set_ptp_stable(true);

    log::info!("sending 440 Hz to {group}:{port}");

    let mut left = [0.0f32; FRAMES_PER_BLOCK];
    let mut right = [0.0f32; FRAMES_PER_BLOCK];
    let mut phase = 0.0f64;
    let phase_step = 440.0 * std::f64::consts::TAU / SAMPLE_RATE as f64;
    let mut timestamp = 0u32;

    let block_duration = Duration::from_nanos(1_000_000_000 * FRAMES_PER_BLOCK as u64 / SAMPLE_RATE as u64);
    let mut next_block = Instant::now();

    loop {
        for i in 0..FRAMES_PER_BLOCK {
            let sample = (phase.sin() * 0.25) as f32;
            left[i] = sample;
            right[i] = sample;
            phase = (phase + phase_step) % std::f64::consts::TAU;
        }

        if !sender.send_audio_data_realtime(id, &[&left, &right], timestamp) {
            log::warn!("block not accepted");
        }
        timestamp = timestamp.wrapping_add(FRAMES_PER_BLOCK as u32);

        next_block += block_duration;
        let now = Instant::now();
        if next_block > now {
            std::thread::sleep(next_block - now);
        } else if now > next_block + 20 * block_duration {
            // Fell far behind; resynchronize the pacing.
            next_block = now;
        }
    }
}
