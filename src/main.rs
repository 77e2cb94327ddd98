use roomsync_core_lib::{
    attachment::AttachmentSource,
    backend::{HttpRoomBackend, RoomBackend, ScriptedBackend},
    export::ExportFormat,
    quota::UnlockEvent,
    room::{QuickAction, RoomId},
    session::EntryDecision,
    state::{ControllerParts, RoomController, RoomEvent},
    timeline::TimelineEntry,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("roomsync failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let scripted = args.iter().any(|arg| arg == "--scripted");
    let parts = ControllerParts::with_default_stores(|settings| -> Arc<dyn RoomBackend> {
        if scripted {
            Arc::new(ScriptedBackend::echoing())
        } else {
            Arc::new(HttpRoomBackend::new(&settings.api_base_url))
        }
    })
    .map_err(|err| err.to_string())?;
    let controller = Arc::new(RoomController::new(parts));
    spawn_printer(&controller);

    let entry = match parse_arg_value(&args, "--room") {
        Some(room) => EntryDecision::Resume {
            room_id: RoomId::parse(room)
                .ok_or_else(|| "--room must not be blank".to_string())?,
            display_name: parse_arg_value(&args, "--name").unwrap_or("Guest").to_string(),
        },
        None => controller
            .resolve_entry(parse_arg_value(&args, "--join"))
            .map_err(|err| err.to_string())?,
    };
    if controller
        .enter_resolved(&entry)
        .await
        .map_err(|err| err.to_string())?
        .is_none()
    {
        return Err("no room to enter; pass --room <id> --name <name> or --join <link>".into());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(|err| err.to_string())? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&controller, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("{err}"),
        }
    }

    controller.exit_room().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(controller: &RoomController, line: &str) -> Result<bool, String> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let result = match command {
        "/quit" => return Ok(false),
        "/leave" => {
            controller.sign_out().await.map_err(|err| err.to_string())?;
            return Ok(false);
        }
        "/resend" => {
            let id = parse_correlation_id(rest)?;
            controller.resend(id).await.map(|_| ())
        }
        "/abandon" => {
            let id = parse_correlation_id(rest)?;
            controller.abandon(id).await
        }
        "/attach" => {
            controller
                .stage_attachment(AttachmentSource::from_path(rest))
                .await
        }
        "/detach" => {
            controller.discard_attachment();
            Ok(())
        }
        "/export" => {
            let format = rest.parse::<ExportFormat>().map_err(|err| err.to_string())?;
            controller.export(format).await.map(|result| {
                println!(
                    "exported {} records to {}",
                    result.record_count, result.file_path
                );
            })
        }
        "/import" => controller
            .import_bundle(rest)
            .await
            .map(|count| println!("imported {count} messages")),
        "/clear" => controller.clear_room().await,
        "/refresh" => controller.refresh_now().await,
        "/invite" => controller
            .invite_link()
            .await
            .map(|url| println!("invite: {url}")),
        "/unlock" => {
            controller.unlock_quota(UnlockEvent::OperatorOverride);
            Ok(())
        }
        "/idea" => prefill(controller, QuickAction::Ideas),
        "/risks" => prefill(controller, QuickAction::Risks),
        "/plan" => prefill(controller, QuickAction::Plan),
        "/speak" => controller.narrate(rest).map(|_| ()),
        _ if command.starts_with('/') => return Err(format!("unknown command: {command}")),
        _ => controller.submit(line).await.map(|_| ()),
    };
    result.map_err(|err| err.to_string())?;
    Ok(true)
}

fn prefill(
    controller: &RoomController,
    action: QuickAction,
) -> Result<(), roomsync_core_lib::state::ControllerError> {
    let _ = controller.quick_action(action);
    Ok(())
}

fn spawn_printer(controller: &Arc<RoomController>) {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        let mut printed = 0usize;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                RoomEvent::Entered {
                    room_id,
                    display_name,
                    invite_link,
                    ..
                } => {
                    printed = 0;
                    println!("joined {room_id} as {display_name}");
                    if let Some(link) = invite_link {
                        println!("invite: {link}");
                    }
                }
                RoomEvent::Exited { room_id } => println!("left {room_id}"),
                RoomEvent::Timeline { entries, .. } => {
                    if entries.len() < printed {
                        printed = 0;
                    }
                    for entry in entries.iter().skip(printed) {
                        println!("{}", render_entry(entry));
                    }
                    printed = entries.len();
                }
                RoomEvent::Sync(health) => {
                    if let Some(fault) = health.fault {
                        eprintln!(
                            "sync trouble ({} in a row): {}",
                            health.consecutive_failures, fault.message
                        );
                    }
                }
                RoomEvent::Quota(snapshot) => {
                    if snapshot.locked {
                        println!(
                            "{}",
                            snapshot
                                .message
                                .unwrap_or_else(|| "message limit reached".to_string())
                        );
                    }
                }
                RoomEvent::DraftPrefilled(draft) => println!("draft> {draft}"),
                RoomEvent::Capabilities(snapshot) => {
                    if let Some(message) = snapshot.message {
                        eprintln!("{message}");
                    }
                }
                RoomEvent::Dictation(_) => {}
            }
        }
    });
}

fn render_entry(entry: &TimelineEntry) -> String {
    match entry {
        TimelineEntry::Confirmed { message } => {
            format!("[{}] {}: {}", message.sequence, message.sender, message.body)
        }
        TimelineEntry::Pending { message } => format!(
            "(#{} {}) {}: {}",
            message.correlation_id,
            message.state.label(),
            message.sender,
            message.body
        ),
    }
}

fn parse_correlation_id(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("expected a message number, got '{raw}'"))
}

fn parse_arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == key)
        .and_then(|idx| args.get(idx + 1))
        .map(String::as_str)
}
