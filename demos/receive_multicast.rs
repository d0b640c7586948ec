//! Receives an AES67 stream from a multicast group and prints level and
//! statistics once per second.
//!
//! Usage: receive_multicast [group] [port] [interface]
//! Defaults: 239.1.15.52 5004 (default interface)

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ravenna_rtp::audio::{AudioEncoding, AudioFormat, ByteOrder, ChannelOrdering};
use ravenna_rtp::net::NetworkRuntime;
use ravenna_rtp::rtp::{AudioReceiver, Filter, ReaderParameters, Session, StreamInfo};
use ravenna_rtp::util::Id;

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

    let format = AudioFormat {
        byte_order: ByteOrder::Be,
        encoding: AudioEncoding::PcmS24,
        ordering: ChannelOrdering::Interleaved,
        sample_rate: 48_000,
        num_channels: 2,
    };

    let params = ReaderParameters {
        audio_format: format,
        streams: [
            StreamInfo {
                session: Session::new(group, port),
                filter: Filter::new(group),
                packet_time_frames: 48,
            },
            StreamInfo::default(),
        ],
    };

    let receiver = Arc::new(AudioReceiver::new());
    let runtime = NetworkRuntime::new();
    runtime.add_task(receiver.clone());

    let id = Id::generate();
    receiver
        .add_reader(id, &params, [interface, Ipv4Addr::UNSPECIFIED])
        .expect("failed to add reader");

    log::info!("listening on {group}:{port}");

    // Pull 1 ms blocks and require half the ring buffer as delay, since this
    // demo has no PTP clock and follows the RTP timeline.
    let mut left = [0.0f32; 48];
    let mut right = [0.0f32; 48];
    let delay_frames = 48 * 100;

    loop {
        let mut peak = 0.0f32;
        let mut reads = 0u32;
        let deadline = std::time::Instant::now() + Duration::from_secs(1);

        while std::time::Instant::now() < deadline {
            let read = receiver.read_audio_data_realtime(
                id,
                &mut [&mut left, &mut right],
                None,
                Some(delay_frames),
            );
            match read {
                Some(_) => {
                    reads += 1;
                    for sample in left.iter().chain(right.iter()) {
                        peak = peak.max(sample.abs());
                    }
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }

        let stats = receiver.packet_stats(id, 0).unwrap_or_default();
        let state = receiver.stream_state(id, 0);
        log::info!(
            "state {state:?} reads/s {reads} peak {peak:.3} dropped {} ooo {} late {} jitter {:.3} ms",
            stats.dropped,
            stats.out_of_order,
            stats.too_late,
            stats.jitter * 1000.0
        );
    }
}
