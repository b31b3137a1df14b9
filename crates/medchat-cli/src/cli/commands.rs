use anyhow::{bail, Context, Result};
use medchat_core::events::CoreEvent;
use medchat_core::store::views;
use medchat_core::{ChatRuntime, Profile};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// CLI command parsed from arguments
#[derive(Debug, Clone)]
pub enum CliCommand {
    /// List threads visible to the profile
    ListThreads,
    /// Pull and list messages of a thread
    ListMessages { thread_id: String },
    SendMessage { thread_id: String, text: String },
    CreateThread { topic: String },
    MarkRead { thread_id: String, message_id: String },
}

pub fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("Failed to serialize output")?;
    println!("{}", output);
    Ok(())
}

/// JSON line for one listener event
pub fn event_json(event: &CoreEvent, profile: &Profile) -> Value {
    match event {
        CoreEvent::Error(message) => json!({ "event": "error", "message": message }),
        CoreEvent::WebsocketClose => json!({ "event": "websocketClose" }),
        CoreEvent::WebsocketOpen => json!({ "event": "websocketOpen" }),
        CoreEvent::SubscriptionConnect => json!({ "event": "subscriptionConnect" }),
        CoreEvent::MessageReceived(message) => json!({
            "event": "messageReceived",
            "threadId": message.thread_id(),
            "message": views::chat_message(message, &profile.reference),
        }),
        CoreEvent::MessageUpdated(message) => json!({
            "event": "messageUpdated",
            "threadId": message.thread_id(),
            "message": views::chat_message(message, &profile.reference),
        }),
    }
}

/// Print errors the core reported while a one-shot command ran
fn drain_errors(events: &mut mpsc::UnboundedReceiver<CoreEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Error(message) = event {
            eprintln!("Error: {}", message);
            count += 1;
        }
    }
    count
}

/// Load the profile's threads without a live feed, run one command and
/// print its result. Backend errors the core reported fail the command.
pub async fn run_command(
    command: CliCommand,
    runtime: &ChatRuntime,
    profile: Profile,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
    pretty: bool,
) -> Result<()> {
    runtime.load_profile(profile).await;
    let store = runtime.store();

    let output = match command {
        CliCommand::ListThreads => serde_json::to_value(store.thread_views())?,
        CliCommand::ListMessages { thread_id } => {
            store.receive_thread(&thread_id).await;
            let view = store
                .thread_view(&thread_id)
                .with_context(|| format!("Thread not found: {}", thread_id))?;
            serde_json::to_value(view.messages)?
        }
        CliCommand::SendMessage { thread_id, text } => {
            let id = store.send_message(&thread_id, &text).await?;
            json!({ "id": id })
        }
        CliCommand::CreateThread { topic } => {
            let id = store.create_thread(&topic).await?;
            json!({ "id": id })
        }
        CliCommand::MarkRead { thread_id, message_id } => {
            store.receive_thread(&thread_id).await;
            let updated = store.mark_message_as_read(&thread_id, &message_id).await?;
            json!({ "updated": updated })
        }
    };

    let failures = drain_errors(&mut events);
    print_json(&output, pretty)?;
    if failures > 0 {
        bail!("{} backend error(s) reported", failures);
    }
    Ok(())
}

/// Subscribe for `profile` and print live events until interrupted
pub async fn watch(
    runtime: &ChatRuntime,
    profile: Profile,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
    pretty: bool,
) -> Result<()> {
    runtime.set_profile(Some(profile.clone())).await;
    print_json(&json!({ "event": "threads", "threads": runtime.store().thread_views() }), pretty)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_json(&event_json(&event, &profile), pretty)?;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use medchat_core::models::{Communication, Payload, Reference};
    use medchat_core::{ChannelListener, CoreConfig, MemoryBackend};
    use std::sync::Arc;

    #[test]
    fn test_event_json_shapes() {
        let profile = Profile::patient("p1");
        let mut message = Communication::message(
            "T",
            Reference::new("Practitioner/dr"),
            Payload::text("hello"),
            chrono::Utc::now(),
        );
        message.id = Some("m1".to_string());

        let value = event_json(&CoreEvent::MessageReceived(message), &profile);
        assert_eq!(value["event"], "messageReceived");
        assert_eq!(value["threadId"], "T");
        assert_eq!(value["message"]["text"], "hello");
        assert_eq!(value["message"]["outgoing"], false);

        let value = event_json(&CoreEvent::Error("boom".to_string()), &profile);
        assert_eq!(value, json!({ "event": "error", "message": "boom" }));
    }

    #[tokio::test]
    async fn test_practitioner_create_thread_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let (listener, events) = ChannelListener::new();
        let runtime = ChatRuntime::new(backend.clone(), Arc::new(listener), &CoreConfig::default());

        let result = run_command(
            CliCommand::CreateThread { topic: "Question".to_string() },
            &runtime,
            Profile::practitioner("dr"),
            events,
            false,
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("not permitted"));
        assert!(backend.writes().is_empty());
    }
}
