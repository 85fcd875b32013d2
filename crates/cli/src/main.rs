use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use mediastream::media::{RtpDecoder, RtpPacket, TrackDemuxer};
use mediastream::transport::SockInfo;
use mediastream::{
    EventPollerPool, ReceiverConfig, RtpReceiver, SockSender, Socket, SocketConfig, SocketHelper,
    TrackType,
};

#[derive(Parser)]
#[command(
    name = "rtp-relay",
    about = "Relay RTP received over UDP to TCP clients as interleaved frames"
)]
struct Args {
    /// Local IP for every socket
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: String,

    /// TCP port clients connect to
    #[arg(long, short, default_value_t = 8554)]
    listen: u16,

    /// UDP port receiving the video RTP stream
    #[arg(long, default_value_t = 5004)]
    video_port: u16,

    /// UDP port receiving the audio RTP stream
    #[arg(long)]
    audio_port: Option<u16>,

    /// Video RTP clock rate (Hz)
    #[arg(long, default_value_t = 90_000)]
    video_rate: u32,

    /// Audio RTP clock rate (Hz)
    #[arg(long, default_value_t = 8_000)]
    audio_rate: u32,

    /// Number of event poller threads
    #[arg(long, short, default_value_t = 2)]
    workers: usize,

    /// Reorder window per track, in packets
    #[arg(long, default_value_t = 256)]
    jitter: usize,

    /// Drop a client whose queued data is not flushed within this many seconds
    #[arg(long, default_value_t = 10)]
    send_timeout: u32,
}

type Clients = Arc<Mutex<HashMap<String, SocketHelper>>>;

/// Counts packets and frames of one track. Reports frame ends as key
/// positions since the payload format is not inspected.
struct FrameCounter {
    track: TrackType,
    packets: u64,
    frames: u64,
}

impl FrameCounter {
    fn new(track: TrackType) -> Self {
        Self {
            track,
            packets: 0,
            frames: 0,
        }
    }
}

impl RtpDecoder for FrameCounter {
    fn input_rtp(&mut self, packet: &RtpPacket, key_pos: bool) -> bool {
        self.packets += 1;
        if packet.mark {
            self.frames += 1;
            if self.frames % 500 == 0 {
                tracing::info!(
                    track = ?self.track,
                    frames = self.frames,
                    packets = self.packets,
                    ts = packet.timestamp_ms,
                    "relay progress"
                );
            }
        }
        key_pos && packet.mark
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Failed to start relay: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> mediastream::Result<()> {
    let pool = EventPollerPool::new(args.workers)?;
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let sock_config = SocketConfig {
        max_send_buffer_ms: args.send_timeout.saturating_mul(1000),
        ..SocketConfig::default()
    };

    // One listener per poller, all servicing the same descriptor.
    let mut listeners: Vec<Arc<Socket>> = Vec::with_capacity(pool.len());
    for (i, poller) in pool.pollers().iter().enumerate() {
        let listener = Socket::with_config(poller.clone(), sock_config.clone());
        listener.set_on_accept(accept_handler(clients.clone()));
        if i == 0 {
            listener.listen(args.listen, &args.bind_ip, sock_config.backlog)?;
        } else {
            listener.clone_from_listen_socket(&listeners[0])?;
        }
        listeners.push(listener);
    }

    let mut receiver = RtpReceiver::new(ReceiverConfig {
        max_sort_depth: args.jitter,
        ..ReceiverConfig::default()
    });
    let mut demuxer = TrackDemuxer::new();
    demuxer.set_decoder(TrackType::Video, Box::new(FrameCounter::new(TrackType::Video)));
    demuxer.set_decoder(TrackType::Audio, Box::new(FrameCounter::new(TrackType::Audio)));

    let fan_out = clients.clone();
    receiver.set_on_sorted(move |_track, packet| {
        demuxer.input_rtp(&packet);
        let frame = Bytes::copy_from_slice(packet.data());
        for (id, client) in fan_out.lock().iter() {
            if client.is_socket_busy() {
                tracing::trace!(client = %id, seq = packet.sequence, "client busy, frame skipped");
                continue;
            }
            if let Err(err) = client.send(frame.clone()) {
                tracing::debug!(client = %id, error = %err, "send failed");
            }
        }
    });
    let receiver = Arc::new(Mutex::new(receiver));

    let ingest_poller = pool.get_first_poller();
    let mut inputs = vec![(0, TrackType::Video, args.video_port, args.video_rate)];
    if let Some(port) = args.audio_port {
        inputs.push((1, TrackType::Audio, port, args.audio_rate));
    }
    let mut udp_sockets = Vec::with_capacity(inputs.len());
    for (track_index, track_type, port, rate) in inputs {
        let sock = Socket::with_config(ingest_poller.clone(), sock_config.clone());
        let receiver = receiver.clone();
        sock.set_on_read(move |data, from| {
            let res = receiver
                .lock()
                .handle_one_packet(track_index, track_type, rate, data);
            match res {
                Ok(_) => {}
                Err(err) if err.is_protocol_violation() => {
                    tracing::warn!(%from, error = %err, "protocol violation from sender");
                }
                Err(err) => tracing::debug!(%from, error = %err, "RTP packet dropped"),
            }
        });
        sock.set_on_err(move |err| tracing::error!(port, error = %err, "RTP input closed"));
        sock.bind_udp_sock(port, &args.bind_ip)?;
        tracing::info!(track = ?track_type, port, rate, "receiving RTP");
        udp_sockets.push(sock);
    }

    println!(
        "Relaying RTP to tcp://{}:{}, press Enter to stop",
        args.bind_ip, args.listen
    );
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    for sock in udp_sockets.iter().chain(listeners.iter()) {
        sock.close_sock();
    }
    clients.lock().clear();
    tracing::info!("relay stopped");
    Ok(())
}

fn accept_handler(clients: Clients) -> impl Fn(Arc<Socket>) + Send + Sync + 'static {
    move |child| {
        let helper = SocketHelper::new(child.clone());
        let id = helper.identifier();
        let peer = helper.peer_addr();
        tracing::info!(client = %id, ?peer, poller = %child.poller().name(), "client connected");

        child.set_on_read(|data, _| tracing::trace!(len = data.len(), "ignoring client data"));
        let registry = Arc::downgrade(&clients);
        let key = id.clone();
        child.set_on_err(move |err| {
            tracing::info!(client = %key, error = %err, "client disconnected");
            if let Some(clients) = registry.upgrade() {
                clients.lock().remove(&key);
            }
        });
        clients.lock().insert(id, helper);
    }
}
