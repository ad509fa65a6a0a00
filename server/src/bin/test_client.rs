//! Headless bot for exercising a running server.
//!
//! Wanders around the world the way a keyboard-driven client would and reports
//! its state every tick. Snapshots are read continuously in the background so
//! the bot never falls behind the server.

use clap::Parser;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::connection::{FrameSink, FrameSource};
use server::{transport, TransportKind};
use shared::{
    ClientState, StateSnapshot, StateUpdate, DIRECTIONS, PLAYER_SPEED, WORLD_HEIGHT, WORLD_WIDTH,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8765")]
    server: String,
    /// Wire framing the server was started with
    #[clap(short, long, value_enum, default_value_t = TransportKind::WebSocket)]
    transport: TransportKind,
    /// Updates per second
    #[clap(short, long, default_value = "60")]
    rate: u32,
    /// Stop after this many updates
    #[clap(long)]
    ticks: Option<u64>,
    /// Seed for the random walk
    #[clap(long)]
    seed: Option<u64>,
}

/// Random walk with the movement rules of the interactive client
struct Walker {
    state: ClientState,
    rng: StdRng,
}

impl Walker {
    fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: ClientState::default(),
            rng,
        }
    }

    fn step(&mut self) -> ClientState {
        if self.rng.gen_bool(0.1) {
            self.state.direction = DIRECTIONS[self.rng.gen_range(0..DIRECTIONS.len())];
        }

        match self.state.direction as u32 {
            0 => self.state.x += PLAYER_SPEED,
            90 => self.state.y -= PLAYER_SPEED,
            180 => self.state.x -= PLAYER_SPEED,
            _ => self.state.y += PLAYER_SPEED,
        }
        self.state.x = self.state.x.clamp(0.0, WORLD_WIDTH);
        self.state.y = self.state.y.clamp(0.0, WORLD_HEIGHT);

        self.state
    }
}

/// Reads snapshots as fast as the server sends them and publishes the newest.
async fn read_snapshots<S: FrameSource>(
    mut source: S,
    latest: watch::Sender<StateSnapshot>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    while let Some(frame) = source.next_frame().await? {
        latest.send_replace(StateSnapshot::decode(&frame)?);
    }
    Ok(())
}

async fn run_bot<S, K>(source: S, mut sink: K, args: &Args) -> Result<(), Box<dyn std::error::Error>>
where
    S: FrameSource + 'static,
    K: FrameSink,
{
    let (latest_tx, mut latest) = watch::channel(StateSnapshot::default());
    let mut reader = tokio::spawn(read_snapshots(source, latest_tx));

    let mut walker = Walker::new(args.seed);
    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sent: u64 = 0;
    loop {
        if args.ticks.is_some_and(|limit| sent >= limit) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            finished = &mut reader => {
                match finished {
                    Ok(Ok(())) => warn!("Server closed the connection"),
                    Ok(Err(e)) => warn!("Connection lost: {}", e),
                    Err(e) => warn!("Reader task failed: {}", e),
                }
                return Ok(());
            }
        }

        let state = walker.step();
        sink.send_frame(&StateUpdate::from(state).encode()?).await?;
        sent += 1;

        if sent % 60 == 0 {
            let clients = latest.borrow_and_update().len();
            info!(
                "Tick {}: at ({:.0}, {:.0}) facing {}, {} client(s) connected",
                sent, state.x, state.y, state.direction, clients
            );
        }
    }

    sink.close().await?;
    reader.abort();
    info!("Sent {} updates, disconnecting", sent);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.transport {
        TransportKind::WebSocket => {
            let url = format!("ws://{}", args.server);
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            info!("Connected to {}", url);
            let (source, sink) = transport::split_websocket(ws_stream);
            run_bot(source, sink, &args).await
        }
        TransportKind::Lines => {
            let stream = TcpStream::connect(&args.server).await?;
            info!("Connected to {}", args.server);
            let (source, sink) = transport::lines(stream);
            run_bot(source, sink, &args).await
        }
    }
}
