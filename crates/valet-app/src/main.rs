//! Valet application binary - composition root.
//!
//! Ties together the Valet crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Open storage (SQLite repositories + OS keyring, falling back to a key file)
//! 3. Build the completion client and calendar sink
//! 4. Start the orchestrator and its store sync
//! 5. Run the line REPL on stdin

mod cli;

use std::error::Error;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use valet_chat::context::format_date_time;
use valet_chat::{
    CalendarSink, Collaborators, CompletionClient, DisabledCalendar, IcsCalendar, Orchestrator,
    ReqwestTransport, SubmitOutcome,
};
use valet_core::config::ValetConfig;
use valet_core::store::CredentialStore;
use valet_core::types::ScheduleItem;
use valet_storage::{
    open_credential_store, Database, SqliteProfileStore, SqliteScheduleStore, SqliteSessionStore,
};

use cli::{CliArgs, ProfileEdit, ReplCommand, HELP};

/// Tracks how much of the conversation has been printed.
#[derive(Default)]
struct Printed {
    generation: u64,
    messages: usize,
}

/// Print messages added since the last call, then any error.
fn print_delta(orch: &Orchestrator, printed: &mut Printed) {
    let state = orch.conversation().borrow().clone();
    if state.generation != printed.generation || state.messages.len() < printed.messages {
        printed.generation = state.generation;
        printed.messages = 0;
    }
    for message in &state.messages[printed.messages..] {
        let speaker = if message.is_user_message { "you" } else { "valet" };
        println!("{}> {}", speaker, message.content);
    }
    printed.messages = state.messages.len();

    if let Some(error) = state.error {
        println!("error: {}", error);
        orch.clear_error();
    }
}

fn print_history(orch: &Orchestrator) {
    let sessions = orch.history().borrow().clone();
    if sessions.is_empty() {
        println!("No saved chats.");
    }
    for session in sessions {
        println!(
            "{}  {}  ({} messages, {})",
            session.id,
            session.title,
            session.messages.len(),
            format_date_time(session.updated_at)
        );
    }
}

fn print_items(items: &[ScheduleItem]) {
    if items.is_empty() {
        println!("Schedule is empty.");
    }
    for item in items {
        let mark = if item.is_completed { "x" } else { " " };
        println!(
            "[{}] {}  {}  {}",
            mark,
            item.id,
            format_date_time(item.date_time),
            item.title
        );
    }
}

fn print_schedule(orch: &Orchestrator) {
    let state = orch.schedule().borrow().clone();
    print_items(&state.items);
    if let Some(error) = state.error {
        println!("error: {}", error);
    }
}

async fn add_item(orch: &Orchestrator, when: NaiveDateTime, title: &str) {
    // Skipped or ambiguous local times resolve to the earliest instant.
    let Some(local) = when.and_local_timezone(Local).earliest() else {
        println!("error: {} does not exist in the local time zone", when);
        return;
    };
    match orch
        .add_schedule_item(title, "", local.with_timezone(&Utc))
        .await
    {
        Ok(item) => println!("Added {}.", item.id),
        Err(e) => println!("error: {}", e),
    }
}

async fn rename_item(orch: &Orchestrator, id: uuid::Uuid, title: String) {
    let found = orch
        .schedule()
        .borrow()
        .items
        .iter()
        .find(|item| item.id == id)
        .cloned();
    let Some(mut item) = found else {
        println!("error: no schedule item {}", id);
        return;
    };
    item.title = title;
    match orch.update_schedule_item(&item).await {
        Ok(()) => println!("Renamed {}.", id),
        Err(e) => println!("error: {}", e),
    }
}

async fn apply_profile_edit(orch: &Orchestrator, edit: ProfileEdit) {
    if edit.has_basic_fields() {
        let current = orch.profile().borrow().profile.clone();
        let result = orch
            .update_profile(
                edit.name.as_deref().unwrap_or(&current.name),
                edit.birthday.as_deref().unwrap_or(&current.birthday),
                edit.occupation.as_deref().unwrap_or(&current.occupation),
                edit.hobbies.as_deref().unwrap_or(&current.hobbies),
            )
            .await;
        if let Err(e) = result {
            println!("error: {}", e);
            return;
        }
    }
    for (key, value) in &edit.preferences {
        if let Err(e) = orch.set_preference(key, value).await {
            println!("error: {}", e);
            return;
        }
    }
    println!("Profile updated.");
}

async fn store_api_key(
    client: &CompletionClient,
    credentials: &dyn CredentialStore,
    key: &str,
) {
    match client.validate_key(key).await {
        Ok(()) => match credentials.set(key) {
            Ok(()) => println!("API key saved."),
            Err(e) => println!("error: {}", e),
        },
        Err(e) => println!("error: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let config = ValetConfig::load_or_default(&config_file);
    let log_level = args.resolve_log_level(&config.general.log_level);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Valet v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    // Storage.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = data_dir.join("valet.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let sessions = Arc::new(
        SqliteSessionStore::new(Arc::clone(&db)).with_title_chars(config.chat.session_title_chars),
    );
    let schedule = Arc::new(SqliteScheduleStore::new(Arc::clone(&db)));
    let profiles = Arc::new(SqliteProfileStore::new(Arc::clone(&db)));
    let credentials = open_credential_store(&data_dir);

    // Completion service.
    let transport = Arc::new(ReqwestTransport::new(&config.completion)?);
    let client = Arc::new(CompletionClient::new(transport, config.completion.clone()));
    tracing::info!(
        endpoint = %config.completion.endpoint,
        model = %config.completion.model,
        "Completion client ready"
    );

    // Calendar.
    let calendar: Arc<dyn CalendarSink> = if config.calendar.enabled {
        let path = data_dir.join("calendar.ics");
        tracing::info!(path = %path.display(), "Calendar mirroring enabled");
        Arc::new(IcsCalendar::new(path))
    } else {
        Arc::new(DisabledCalendar)
    };

    let orch = Orchestrator::new(
        Collaborators {
            sessions,
            schedule,
            profiles,
            credentials: credentials.clone(),
            completion: client.clone(),
            calendar,
        },
        config.chat.clone(),
    );
    orch.set_api_key_override(args.resolve_api_key());
    orch.initialize().await;
    let sync = orch.start_sync();

    if !credentials.has().unwrap_or(false) && args.resolve_api_key().is_none() {
        println!("No API key configured. Use /key <value> or set OPENAI_API_KEY.");
    }
    println!("Valet ready. Type /help for commands.");

    // REPL.
    let mut printed = Printed::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ReplCommand::parse(&line) {
            ReplCommand::Say(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                match orch.submit(&text).await {
                    Ok(SubmitOutcome::Discarded) => tracing::debug!("Reply discarded"),
                    Ok(_) => {}
                    Err(e) => println!("error: {}", e),
                }
            }
            ReplCommand::New => {
                orch.create_new_chat();
                println!("Started a new chat.");
            }
            ReplCommand::History => print_history(&orch),
            ReplCommand::Load(id) => {
                if let Err(e) = orch.load_chat_session(id).await {
                    println!("error: {}", e);
                }
            }
            ReplCommand::Delete(id) => match orch.delete_chat_session(id).await {
                Ok(()) => println!("Deleted {}.", id),
                Err(e) => println!("error: {}", e),
            },
            ReplCommand::Schedule(None) => print_schedule(&orch),
            ReplCommand::Schedule(Some(day)) => match orch.schedule_for_date(day).await {
                Ok(items) => print_items(&items),
                Err(e) => println!("error: {}", e),
            },
            ReplCommand::Add { when, title } => add_item(&orch, when, &title).await,
            ReplCommand::Rename(id, title) => rename_item(&orch, id, title).await,
            ReplCommand::Remove(id) => match orch.delete_schedule_item(id).await {
                Ok(()) => println!("Removed {}.", id),
                Err(e) => println!("error: {}", e),
            },
            ReplCommand::Done(id) => match orch.mark_schedule_item_completed(id, true).await {
                Ok(()) => println!("Marked {} completed.", id),
                Err(e) => println!("error: {}", e),
            },
            ReplCommand::Undone(id) => match orch.mark_schedule_item_completed(id, false).await {
                Ok(()) => println!("Marked {} not completed.", id),
                Err(e) => println!("error: {}", e),
            },
            ReplCommand::Profile(edit) => apply_profile_edit(&orch, edit).await,
            ReplCommand::Key(key) => store_api_key(&client, credentials.as_ref(), &key).await,
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Quit => break,
            ReplCommand::Invalid(reason) => println!("{}", reason),
        }
        print_delta(&orch, &mut printed);
    }

    sync.stop();
    tracing::info!("Valet stopped");
    Ok(())
}
