//! Reference node binary: wires [`freakmesh::engine::MeshEngine`] to a
//! real or simulated radio and a line-oriented stdin/stdout console.
//!
//! Grounded on the `clap`+`tracing_subscriber` setup in
//! `efir369999-junomontanaagibot`'s `montana` binary (`#[tokio::main]`,
//! `EnvFilter::from_default_env`, a `Parser`-derived `Args` struct), and
//! on the concurrency model SPEC_FULL.md §5 adds: the engine lives
//! behind a `tokio::sync::Mutex`, shared by a small set of cooperative
//! tasks (radio-event pump, send-queue drain cron, HELLO emitter, stdin
//! console) in place of the reference firmware's single-threaded
//! `while True` loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use freakmesh::command::{radio_config_from_settings, CommandController, CommandPaths, NoBattery};
use freakmesh::config::Settings;
use freakmesh::engine::{MeshEngine, Surfaced};
use freakmesh::identity::NodeId;
use freakmesh::journal::Journal;
use freakmesh::keychain::Keychain;
use freakmesh::radio::mock::MockRadio;
use freakmesh::radio::RadioDriver;
use freakmesh::serial_radio::SerialRadio;

const SEND_QUEUE_TICK: Duration = Duration::from_millis(100);
const HELLO_INTERVAL: Duration = Duration::from_secs(60);
const JOURNAL_RECORD_SIZE: usize = 256;
const JOURNAL_RECORDS_PER_FILE: usize = 200;

#[derive(Parser)]
#[command(name = "freakmesh-node", version, about = "FreakMesh reference mesh node")]
struct Args {
    /// Directory holding persisted state: keys/, hist1, hist2, settings.toml, node_id.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Serial device the LoRa companion module is attached to. Omit to
    /// run against an in-memory radio with nothing to talk to (useful
    /// for exercising the command console without hardware).
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate.
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(%info, "panic");
        default_hook(info);
    }));
}

async fn radio_pump<R: RadioDriver>(engine: Arc<Mutex<MeshEngine<R>>>) {
    loop {
        let keep_going = match engine.lock().await.poll_radio_event().await {
            Ok(keep_going) => keep_going,
            Err(e) => {
                error!(error = %e, "error handling radio event");
                true
            }
        };
        if !keep_going {
            info!("radio event channel closed, pump exiting");
            return;
        }
    }
}

async fn send_queue_cron<R: RadioDriver>(engine: Arc<Mutex<MeshEngine<R>>>) {
    let mut ticker = tokio::time::interval(SEND_QUEUE_TICK);
    loop {
        ticker.tick().await;
        if let Err(e) = engine.lock().await.drain_send_queue(Instant::now()) {
            error!(error = %e, "send queue drain failed");
        }
    }
}

async fn hello_emitter<R: RadioDriver>(engine: Arc<Mutex<MeshEngine<R>>>) {
    let mut ticker = tokio::time::interval(HELLO_INTERVAL);
    loop {
        ticker.tick().await;
        engine.lock().await.emit_hello(Instant::now());
    }
}

async fn console<R: RadioDriver>(
    engine: Arc<Mutex<MeshEngine<R>>>,
    paths: CommandPaths,
) {
    let mut controller = CommandController::new(NoBattery, paths);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = controller.exec(&line, &mut *engine.lock().await);
                if !reply.is_empty() {
                    println!("{reply}");
                }
            }
            Ok(None) => {
                info!("stdin closed, console task exiting");
                return;
            }
            Err(e) => {
                error!(error = %e, "error reading console input");
                return;
            }
        }
    }
}

async fn surfaced_printer(mut rx: mpsc::Receiver<Surfaced>) {
    while let Some(event) = rx.recv().await {
        match event {
            Surfaced::Text { sender, nick, text, rssi } => println!("<{nick}/{sender}> {text} ({rssi} dBm)"),
            Surfaced::Media { sender, nick, media_type, data, rssi } => {
                println!("<{nick}/{sender}> [{media_type:?}, {} bytes] ({rssi} dBm)", data.len())
            }
            Surfaced::NewNode { sender } => println!("* new node {sender}"),
            Surfaced::Raw { bytes } => println!("* promiscuous: {} raw bytes", bytes.len()),
        }
    }
}

async fn run<R: RadioDriver + 'static>(engine: MeshEngine<R>, paths: CommandPaths) {
    let engine = Arc::new(Mutex::new(engine));
    tokio::join!(
        radio_pump(engine.clone()),
        send_queue_cron(engine.clone()),
        hello_emitter(engine.clone()),
        console(engine, paths),
    );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("freakmesh=info".parse().unwrap()),
        )
        .init();
    install_panic_hook();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir).expect("failed to create data directory");

    let settings_path = args.data_dir.join("settings.toml");
    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            return;
        }
    };
    let node_id = match NodeId::load_or_create(&args.data_dir.join("node_id")) {
        Ok(node_id) => node_id,
        Err(e) => {
            error!("Failed to load node id: {}", e);
            return;
        }
    };
    let keychain = match Keychain::open(args.data_dir.join("keys")) {
        Ok(keychain) => keychain,
        Err(e) => {
            error!("Failed to open keychain: {}", e);
            return;
        }
    };
    let journal = match Journal::open(&args.data_dir, JOURNAL_RECORD_SIZE, JOURNAL_RECORDS_PER_FILE) {
        Ok(journal) => journal,
        Err(e) => {
            error!("Failed to open journal: {}", e);
            return;
        }
    };
    let radio_config = radio_config_from_settings(&settings);

    info!(node_id = %node_id, nick = %settings.nick, "starting freakmesh node");

    let (surfaced_tx, surfaced_rx) = mpsc::channel(64);
    tokio::spawn(surfaced_printer(surfaced_rx));

    let paths = CommandPaths { settings_path };

    match args.serial_port {
        Some(port) => {
            let radio = match SerialRadio::open(&port, args.baud_rate) {
                Ok(radio) => radio,
                Err(e) => {
                    error!("Failed to open serial radio: {}", e);
                    return;
                }
            };
            let engine = match MeshEngine::new(radio, radio_config, node_id, settings, keychain, journal, surfaced_tx) {
                Ok(engine) => engine,
                Err(e) => {
                    error!("Failed to initialize engine: {}", e);
                    return;
                }
            };
            run(engine, paths).await;
        }
        None => {
            info!("no --serial-port given, running against an in-memory radio");
            let radio = MockRadio::new();
            let engine = match MeshEngine::new(radio, radio_config, node_id, settings, keychain, journal, surfaced_tx) {
                Ok(engine) => engine,
                Err(e) => {
                    error!("Failed to initialize engine: {}", e);
                    return;
                }
            };
            run(engine, paths).await;
        }
    }
}
