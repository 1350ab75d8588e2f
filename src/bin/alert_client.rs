//! Opsboard alert client
//!
//! Terminal counterpart of the dashboard tab: polls the upstream source on a
//! foreground timer, posts every batch to the server's save endpoints and
//! alerts the operator about messages it has not shown before. Notifications
//! alert only once the server routed them to `ALERT_USER_ID`; cancellations
//! alert for everyone.
//!
//! Keys (followed by Enter): empty line = "I'm here" (unlocks sound),
//! `s` sound, `b` bell, `d` desktop notifications, `a` acknowledge,
//! `r` recent alerts, `q` quit.

use opsboard_notify::{
    alerts::{
        AudioOutput, CommandAudioOutput, NoAudioOutput, Permission, SoundChain, TerminalNotifier,
    },
    delivery::{DeliveryChannels, DeliveryClient, DeliverySettings},
    models::{Notification, StreamKind, UserId},
    poller::{ErrorSlot, PollOutcome, Poller, Scheduler},
    save_client::SaveEndpointClient,
    upstream::UpstreamClient,
    Config,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Operator input
#[derive(Debug, Clone, Copy)]
enum Command {
    Interaction,
    ToggleSound,
    ToggleBell,
    ToggleDesktop,
    Acknowledge,
    ShowRecent,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "" => Some(Command::Interaction),
            "s" => Some(Command::ToggleSound),
            "b" => Some(Command::ToggleBell),
            "d" => Some(Command::ToggleDesktop),
            "a" => Some(Command::Acknowledge),
            "r" => Some(Command::ShowRecent),
            "q" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env();

    let audio: Box<dyn AudioOutput> = match config
        .alert_audio_player
        .as_deref()
        .and_then(CommandAudioOutput::parse)
    {
        Some(player) => Box::new(player),
        None => Box::new(NoAudioOutput),
    };
    // A previous run that enabled desktop notifications already holds permission
    let granted = DeliverySettings::load(&config.alert_settings_path)
        .map(|s| s.desktop_notifications_enabled)
        .unwrap_or(false);
    let desktop = if granted {
        TerminalNotifier::stderr().with_permission(Permission::Granted)
    } else {
        TerminalNotifier::stderr()
    };
    let channels = DeliveryChannels {
        sound: SoundChain::new(audio),
        desktop: Box::new(desktop),
    };
    let mut client = DeliveryClient::init(&config.alert_settings_path, channels);

    // Settings saved by the operator win over the environment
    let settings = client.settings().clone();
    let Some(base_url) = settings
        .upstream_base_url
        .clone()
        .or_else(|| config.upstream_base_url.clone())
    else {
        error!("No upstream URL: set UPSTREAM_BASE_URL or upstreamBaseUrl in the settings file");
        return;
    };
    let api_key = settings
        .api_key
        .clone()
        .unwrap_or_else(|| config.upstream_api_key.clone());
    let interval = match settings.poll_interval_secs {
        0 => config.poll_interval,
        secs => Duration::from_secs(secs),
    };

    let upstream = match UpstreamClient::new(&base_url, &api_key, config.fetch_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Cannot build upstream client");
            return;
        }
    };
    let sink = match SaveEndpointClient::new(
        &config.server_url,
        config.ingest_api_key.clone(),
        config.fetch_timeout,
    ) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "Cannot build save-endpoint client");
            return;
        }
    };

    let user_id = config.alert_user_id;
    if user_id.is_none() {
        warn!("ALERT_USER_ID not set, only cancellations will alert");
    }

    info!(
        server = %config.server_url,
        user_id,
        interval_secs = interval.as_secs(),
        settings = %config.alert_settings_path.display(),
        "Starting alert client"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outcome_tx, mut outcomes) = mpsc::channel::<PollOutcome>(16);
    let errors = ErrorSlot::new();
    let mut error_rx = errors.subscribe();

    let mut handles = Vec::new();
    for (stream, window) in [
        (StreamKind::Notifications, config.notification_window_hours),
        (StreamKind::Cancellations, config.cancellation_window_hours),
    ] {
        let poller = Poller::new(stream, upstream.clone(), sink.clone(), window, errors.clone())
            .with_checkpoint(client.checkpoint(stream));
        handles.push(poller.spawn(
            Scheduler::Foreground { interval },
            Some(outcome_tx.clone()),
            shutdown_rx.clone(),
        ));
    }
    drop(outcome_tx);

    let mut commands = spawn_stdin_reader();

    loop {
        tokio::select! {
            Some(outcome) = outcomes.recv() => {
                let routed = routed_notifications(&sink, user_id, &outcome).await;
                client.deliver_outcome(&outcome, &routed);
            }
            Some(command) = commands.recv() => {
                if matches!(command, Command::Quit) {
                    break;
                }
                handle_command(&mut client, command);
            }
            Ok(()) = error_rx.changed() => {
                if let Some(failure) = error_rx.borrow_and_update().clone() {
                    eprintln!("! {} polling failed: {}", failure.stream, failure.message);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(true);
    drop(outcomes);
    for handle in handles {
        let _ = handle.await;
    }
    if let Err(e) = client.dispose() {
        warn!(error = %e, "Failed to save alert settings");
    }
}

/// The operator's unread copies after a notification poll; empty otherwise.
async fn routed_notifications(
    server: &SaveEndpointClient,
    user_id: Option<UserId>,
    outcome: &PollOutcome,
) -> Vec<Notification> {
    let Some(user_id) = user_id else {
        return Vec::new();
    };
    if outcome.stream != StreamKind::Notifications {
        return Vec::new();
    }
    server.unread_notifications(user_id).await.unwrap_or_else(|e| {
        warn!(user_id, error = %e, "Cannot read routed notifications");
        Vec::new()
    })
}

fn handle_command(client: &mut DeliveryClient, command: Command) {
    client.record_interaction();
    let settings = client.settings().clone();

    match command {
        Command::Interaction | Command::Quit => {}
        Command::ToggleSound => {
            client.set_sound_enabled(!settings.sound_enabled);
            eprintln!("sound: {}", on_off(!settings.sound_enabled));
        }
        Command::ToggleBell => {
            client.set_pc_beep_enabled(!settings.pc_beep_enabled);
            eprintln!("bell: {}", on_off(!settings.pc_beep_enabled));
        }
        Command::ToggleDesktop => {
            let permission =
                client.set_desktop_notifications_enabled(!settings.desktop_notifications_enabled);
            eprintln!(
                "desktop notifications: {} (permission {permission:?})",
                on_off(client.settings().desktop_notifications_enabled)
            );
        }
        Command::Acknowledge => {
            client.acknowledge(StreamKind::Notifications);
            client.acknowledge(StreamKind::Cancellations);
        }
        Command::ShowRecent => {
            for alert in client.recent().take(10) {
                eprintln!(
                    "{} [{}] {}",
                    alert.received_at.format("%H:%M:%S"),
                    alert.title,
                    alert.body
                );
            }
            eprintln!(
                "unread: {} notifications, {} cancellations",
                client.unread_badge(StreamKind::Notifications),
                client.unread_badge(StreamKind::Cancellations)
            );
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

/// Forward operator input lines as commands
fn spawn_stdin_reader() -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match Command::parse(&line) {
                Some(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                None => eprintln!("keys: <enter> s b d a r q"),
            }
        }
    });
    rx
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("opsboard_notify=info")),
        )
        .init();
}
