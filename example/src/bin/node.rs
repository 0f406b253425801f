use anyhow::Result;
use clap::Parser;
use simple_mesh::media::{capture_microphone, CpalAudioOutput, MicrophoneSource};
use simple_mesh::testing::*;
use simple_mesh::{
    normalize_room_code, Controller, EmittedEvents, InitArgs, LocalSettings, MediaStream,
    MeshConfig, MeshHandle, PeerId, SignalEnvelope, SignalingClient, TransportEvent,
    WebRtcTransport,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mesh_node::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// the server address for this process. other nodes call this address
    local: String,
    /// display name, remembered for next time
    #[arg(long)]
    name: Option<String>,
    /// json file with MeshConfig overrides
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };
    let settings_path = cli.settings.clone().unwrap_or_else(LocalSettings::default_path);
    let mut settings = LocalSettings::load(&settings_path);
    if let Some(name) = &cli.name {
        settings.label = name.clone();
        if let Err(e) = settings.save(&settings_path) {
            log::warn!("{}", e);
        }
    }

    let address = PeerId::from(cli.local.as_str());
    // transport -> controller
    let (transport_tx, transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
    // controller -> terminal
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EmittedEvents>();
    // transport -> relay
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
    // relay -> transport
    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SignalEnvelope>();

    let transport = Arc::new(WebRtcTransport::init(
        address,
        &config,
        transport_tx.clone(),
        outbox_tx,
    )?);
    let id = transport.allocate_identifier().await?;
    let controller = Controller::init(InitArgs {
        id: id.clone(),
        profile: settings.profile(),
        config,
        signaling: transport.clone(),
        audio_output: Arc::new(CpalAudioOutput::new()),
        transport_event_chan: transport_tx,
        emitted_event_chan: event_tx,
    })?;
    let mesh = simple_mesh::spawn(controller, transport_rx);

    println!(
        "listening on {} as {}. /help for commands",
        id,
        settings.profile().display_label()
    );

    tokio::select! {
        _ = signaling_server(&cli.local, signal_tx) => {
            println!("signaling terminated");
        }
        r = forward_outbox(outbox_rx) => {
            println!("outbox terminated: {:?}", r);
        }
        r = handle_signals(transport.clone(), signal_rx) => {
            println!("handle_signals terminated: {:?}", r);
        }
        r = handle_events(event_rx) => {
            println!("handle_events terminated: {:?}", r);
        }
        r = handle_input(mesh.clone(), &id, settings, settings_path) => {
            if let Err(e) = r {
                println!("input terminated: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    if let Err(e) = mesh.shutdown().await {
        log::warn!("{}", e);
    }
    transport.close_all().await;
    Ok(())
}

/// posts every outgoing signal to the relay of its destination, in order
async fn forward_outbox(mut outbox_rx: mpsc::UnboundedReceiver<SignalEnvelope>) -> Result<()> {
    while let Some(envelope) = outbox_rx.recv().await {
        if let Err(e) = send_signal(&envelope).await {
            log::error!("failed to deliver signal to {}: {}", envelope.dest, e);
        }
    }
    Ok(())
}

async fn handle_signals(
    transport: Arc<WebRtcTransport>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
) -> Result<()> {
    while let Some(envelope) = signal_rx.recv().await {
        let src = envelope.src.clone();
        if let Err(e) = transport.recv_signal(envelope).await {
            log::error!("bad signal from {}: {}", src, e);
        }
    }
    Ok(())
}

async fn handle_events(mut event_rx: mpsc::UnboundedReceiver<EmittedEvents>) -> Result<()> {
    while let Some(evt) = event_rx.recv().await {
        println!("{}", describe_event(&evt));
    }
    Ok(())
}

async fn handle_input(
    mesh: MeshHandle,
    id: &PeerId,
    mut settings: LocalSettings,
    settings_path: PathBuf,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // the microphone is opened by the first call and kept until /end
    let mut microphone: Option<(MediaStream, MicrophoneSource)> = None;

    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_command(&line) {
            Ok(c) => c,
            Err(e) => {
                println!("! {}", e);
                continue;
            }
        };
        match cmd {
            Command::Call(peer) => {
                if microphone.is_none() {
                    match capture_microphone(&format!("{}-audio", id)) {
                        Ok(m) => microphone = Some(m),
                        Err(e) => {
                            println!("! {}", e);
                            continue;
                        }
                    }
                }
                if let Some((stream, _)) = &microphone {
                    match mesh.call_peer(peer.clone(), stream.clone()).await {
                        Ok(edge) => println!("* calling {} ({})", edge.peer, edge.state),
                        Err(e) => println!("! {}", e),
                    }
                    if let Err(e) = mesh.connect_data(peer).await {
                        println!("! {}", e);
                    }
                }
            }
            Command::Chat(peer) => {
                if let Err(e) = mesh.connect_data(peer).await {
                    println!("! {}", e);
                }
            }
            Command::Hangup(peer) => mesh.remove_peer(peer).await?,
            Command::End => {
                mesh.end_call().await?;
                microphone = None;
            }
            Command::Say(text) => {
                if mesh.send_message(&text).await? == 0 {
                    println!("! nobody is listening");
                }
            }
            Command::React(emoji) => {
                mesh.send_reaction(&emoji).await?;
            }
            Command::Status(status) => {
                mesh.set_status(status).await?;
                settings.status = status;
                save(&settings, &settings_path);
            }
            Command::Name(label) => {
                mesh.set_label(&label).await?;
                settings.label = label;
                save(&settings, &settings_path);
            }
            Command::Room(code) => {
                let code = code.as_deref().and_then(normalize_room_code);
                match mesh.set_room_code(code).await? {
                    Some(code) => {
                        println!("* joined room {}", code);
                        settings.remember_room(&code);
                        save(&settings, &settings_path);
                    }
                    None => println!("* left the room"),
                }
            }
            Command::CreateRoom => {
                let code = mesh.create_room().await?;
                println!("* created room {}", code);
                settings.remember_room(&code);
                save(&settings, &settings_path);
            }
            Command::Volume(peer, volume) => mesh.set_volume(peer, volume)?,
            Command::Mute(peer) => {
                let muted = mesh.toggle_mute(peer.clone()).await?;
                println!("* {} {}", peer, if muted { "muted" } else { "unmuted" });
            }
            Command::Resume => {
                let resumed = mesh.resume_playback().await?;
                println!("* resumed {} streams", resumed);
            }
            Command::Peers => println!("{}", describe_states(&mesh.connection_states().await?)),
            Command::Roster => println!("{}", describe_roster(&mesh.roster().await?)),
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
        }
    }
    Ok(())
}

fn save(settings: &LocalSettings, path: &PathBuf) {
    if let Err(e) = settings.save(path) {
        log::warn!("{}", e);
    }
}
