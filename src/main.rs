//! Terminal client for a broadcast session.
//!
//! Usage: `broadcast-client <session-id> <instructor|student> [config.toml]`
//!
//! Lines typed on stdin are chat messages, except for the commands
//! `/camera`, `/mic`, `/record`, `/mute-all`, `/status` and `/leave`.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use broadcast_session_lib::{
    logger, CoordinatorHandle, Identity, ParticipantId, Role, SessionConfig, SessionNotice,
};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(session_id), Some(role)) = (args.next(), args.next()) else {
        bail!("usage: broadcast-client <session-id> <instructor|student> [config.toml]");
    };
    let role = Role::parse(&role).with_context(|| format!("unknown role {role:?}"))?;
    let config_path = args.next().map(PathBuf::from);

    let config = SessionConfig::load(config_path.as_deref()).context("loading config")?;
    logger::init(&config.log_filter);

    let identity = Identity::new(ParticipantId::generate(), role);
    println!(
        "joining {session_id} as {} ({})",
        identity.display_name(),
        identity.participant_id
    );

    let client = broadcast_session_lib::start(config, &session_id, identity)
        .await
        .context("joining session")?;

    let mut notices = client.notices;
    let printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "notice stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = client.handle.clone();
    let input = tokio::spawn(async move { read_commands(handle).await });

    let outcome = client.task.await.context("coordinator task panicked")?;
    input.abort();
    printer.abort();
    outcome?;
    Ok(())
}

async fn read_commands(handle: CoordinatorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/camera" => handle.toggle_camera().await?,
            "/mic" => handle.toggle_mic().await?,
            "/record" => handle.toggle_recording().await?,
            "/mute-all" => handle.mute_all().await?,
            "/status" => {
                let status = handle.status().await?;
                println!("{}", serde_json::to_string_pretty(&status.session)?);
                println!(
                    "camera={} mic={} links={:?}",
                    status.media.camera_enabled, status.media.mic_enabled, status.links
                );
            }
            "/leave" => {
                handle.leave().await?;
                break;
            }
            text => handle.send_chat(text).await?,
        }
    }
    Ok(())
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::ChatMessage(msg) => println!("[{}] {}", msg.name, msg.text),
        SessionNotice::BroadcastStarted => println!("* broadcast started"),
        SessionNotice::SessionEnded => println!("* session ended"),
        SessionNotice::InstructorDisconnected => println!("* instructor left the broadcast"),
        SessionNotice::LinkConnected(id) => println!("* connected to {id}"),
        SessionNotice::LinkLost(id) => println!("* lost link to {id}"),
        SessionNotice::RemoteMediaAvailable(kind) => println!("* receiving {}", kind.as_str()),
        SessionNotice::RemoteMediaCleared => println!("* remote media cleared"),
        SessionNotice::MediaError(e) => println!("! media error: {e}"),
        SessionNotice::Muted => println!("* the instructor muted your microphone"),
        SessionNotice::RecordingChanged(on) => {
            println!("* recording {}", if *on { "started" } else { "stopped" })
        }
        SessionNotice::ParticipantsChanged(n) => println!("* {n} participant(s)"),
        SessionNotice::ChannelLost => println!("! disconnected from the relay"),
        SessionNotice::ActionRejected(e) => println!("! {e}"),
    }
}
