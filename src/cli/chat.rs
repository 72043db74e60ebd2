use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::store::BoxedSessionStore;
use crate::chat::{
    ChatError, ChatSession, InMemorySessionStore, ModelConfig, ModelConfigState, SessionEvent,
    SessionStatus, SqliteSessionStore, StopHandle, SubmitOutcome,
};
use crate::connectivity::{ConnectivityWatcher, CheckTargets};
use crate::core::AppConfig;
use crate::core::db::{async_db, initialize_db};
use crate::core::logging::{LogLevel, global_log_buffer, init_tracing};
use crate::openai::OpenAiBackend;

const HELP: &str = r#"Commands:
  /edit <n> <text>      Replace message n and regenerate from there
  /retry [n]            Regenerate the last answer or message n
  /dismiss              Dismiss the last error
  /clear                Start a new conversation
  /config               Show the generation settings
  /set <field> <value>  Change a generation setting
  /metrics              Show token estimates
  /logs [level]         Show recent log entries
  /history              Show the conversation
  /update               Apply a pending update
  /quit                 Exit
Press Ctrl-C while a response streams to stop it."#;

#[derive(Debug, PartialEq)]
enum ReplCommand {
    Submit(String),
    Edit(usize, String),
    Retry(Option<usize>),
    Dismiss,
    Clear,
    Config,
    Set(String, String),
    Metrics,
    Logs(Option<LogLevel>),
    History,
    Update,
    Help,
    Quit,
    Invalid(String),
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return ReplCommand::Submit(line.to_string());
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    match name {
        "edit" => {
            let (n, text) = args.split_once(' ').unwrap_or((args, ""));
            match n.parse::<usize>() {
                Ok(n) if n > 0 && !text.trim().is_empty() => {
                    ReplCommand::Edit(n, text.trim().to_string())
                }
                _ => ReplCommand::Invalid("Usage: /edit <n> <text>".to_string()),
            }
        }
        "retry" if args.is_empty() => ReplCommand::Retry(None),
        "retry" => match args.parse::<usize>() {
            Ok(n) if n > 0 => ReplCommand::Retry(Some(n)),
            _ => ReplCommand::Invalid("Usage: /retry [n]".to_string()),
        },
        "dismiss" => ReplCommand::Dismiss,
        "clear" => ReplCommand::Clear,
        "config" => ReplCommand::Config,
        "set" => match args.split_once(' ') {
            Some((field, value)) => ReplCommand::Set(field.to_string(), value.trim().to_string()),
            None => ReplCommand::Invalid("Usage: /set <field> <value>".to_string()),
        },
        "metrics" => ReplCommand::Metrics,
        "logs" => match args {
            "" => ReplCommand::Logs(None),
            "info" => ReplCommand::Logs(Some(LogLevel::Info)),
            "warn" => ReplCommand::Logs(Some(LogLevel::Warn)),
            "error" => ReplCommand::Logs(Some(LogLevel::Error)),
            _ => ReplCommand::Invalid("Usage: /logs [info|warn|error]".to_string()),
        },
        "history" => ReplCommand::History,
        "update" => ReplCommand::Update,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => ReplCommand::Invalid(format!("Unknown command /{}. Try /help", other)),
    }
}

/// Request a pending update. The conversation in memory is left alone.
fn apply_update(watcher: &ConnectivityWatcher) -> &'static str {
    if watcher.trigger_update() {
        "Updated. Restart to pick up the new version."
    } else {
        "Already up to date"
    }
}

/// Print streamed tokens as they arrive.
fn spawn_printer(mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Token { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::TurnFinished { .. } => println!("\n"),
                SessionEvent::Stopped { .. } => println!("\n[stopped]\n"),
                SessionEvent::TurnStarted { .. } | SessionEvent::Failed { .. } => {}
            }
        }
    });
}

/// Run `fut` and stop the exchange if Ctrl-C is pressed meanwhile.
async fn stop_on_ctrl_c<F: Future>(stop: StopHandle, fut: F) -> F::Output {
    let listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });
    let output = fut.await;
    listener.abort();
    output
}

fn report(session: &ChatSession, result: Result<SubmitOutcome, ChatError>) {
    match result {
        Ok(SubmitOutcome::Finished { .. }) | Ok(SubmitOutcome::Stopped { .. }) => {}
        Ok(SubmitOutcome::Busy) => println!("Still waiting for the last response"),
        Ok(SubmitOutcome::Blocked) => {
            println!("The last response failed. Use /retry, /edit or /dismiss first")
        }
        Err(_) if session.status() == SessionStatus::Error => {
            if let Some(turn) = session.transcript().last() {
                println!("\nError: {}\n", turn.content);
            }
        }
        Err(e) => println!("Error: {}", e),
    }
}

fn turn_id(session: &ChatSession, n: usize) -> Option<String> {
    session.transcript().get(n - 1).map(|t| t.id.clone())
}

fn print_history(session: &ChatSession) {
    if session.transcript().is_empty() {
        println!("No messages yet");
        return;
    }
    for (i, turn) in session.transcript().iter().enumerate() {
        println!("[{}] {:?}:\n{}\n", i + 1, turn.role, turn.content);
    }
}

async fn open_store(config: &AppConfig, ephemeral: bool) -> Result<BoxedSessionStore> {
    if ephemeral {
        return Ok(Arc::new(InMemorySessionStore::new()));
    }
    let db = async_db(&config.db_path).await?;
    db.call(|conn| {
        initialize_db(conn)?;
        Ok(())
    })
    .await?;
    Ok(Arc::new(SqliteSessionStore::new(&db)))
}

pub async fn run(config: AppConfig, ephemeral: bool) -> Result<()> {
    // Logs only go to the buffer so they don't interleave with the
    // streamed output. Use /logs to see them.
    init_tracing(false);

    let mut rl = DefaultEditor::new()?;

    let store = open_store(&config, ephemeral).await?;
    let backend = Arc::new(OpenAiBackend::new(
        &config.openai_api_hostname,
        &config.openai_api_key,
    ));
    let model_config = ModelConfigState::new(ModelConfig::new(&config.openai_model));
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_printer(rx);

    let mut session = ChatSession::builder(backend, model_config)
        .store(store)
        .stream_timeout(config.stream_timeout)
        .streaming(tx)
        .build();
    session.load().await;
    if !session.transcript().is_empty() {
        println!(
            "Restored {} messages. /history to show them, /clear to start over.",
            session.transcript().len()
        );
    }

    let watcher = ConnectivityWatcher::new();
    let checks_cancel = CancellationToken::new();
    watcher.spawn_checks(CheckTargets::from_config(&config), checks_cancel.clone());

    loop {
        let readline = rl.readline(">>> ");
        let line = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line.as_str());

        let command = parse_command(&line);
        let sends_request = matches!(
            command,
            ReplCommand::Submit(_) | ReplCommand::Edit(..) | ReplCommand::Retry(_)
        );
        if sends_request && watcher.is_offline() {
            println!("You're offline, try again once the connection is back");
            continue;
        }

        let stop = session.stop_handle();
        match command {
            ReplCommand::Submit(text) => {
                let result = stop_on_ctrl_c(stop, session.submit(&text)).await;
                report(&session, result);
            }
            ReplCommand::Edit(n, text) => {
                let Some(id) = turn_id(&session, n) else {
                    println!("No message {}", n);
                    continue;
                };
                let result = stop_on_ctrl_c(stop, session.edit_message(&id, &text)).await;
                report(&session, result);
            }
            ReplCommand::Retry(None) => {
                let result = stop_on_ctrl_c(stop, session.retry_last()).await;
                report(&session, result);
            }
            ReplCommand::Retry(Some(n)) => {
                let Some(id) = turn_id(&session, n) else {
                    println!("No message {}", n);
                    continue;
                };
                let result = stop_on_ctrl_c(stop, session.retry_message(&id)).await;
                report(&session, result);
            }
            ReplCommand::Dismiss => session.clear_error().await,
            ReplCommand::Clear => {
                session.clear().await;
                println!("Started a new conversation");
            }
            ReplCommand::Config => {
                println!("{}", serde_json::to_string_pretty(&session.config().get())?);
            }
            ReplCommand::Set(field, value) => {
                let mut next = session.config().get();
                match next.set_field(&field, &value).and_then(|_| next.validate()) {
                    Ok(()) => {
                        session.config().set(next);
                        if let Err(e) = session.save().await {
                            tracing::warn!(error = %e, "Failed to save chat session");
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            ReplCommand::Metrics => {
                let metrics = session.metrics();
                println!(
                    "~{} tokens, {:.1} tokens/s, ~{:.1}s to generate",
                    metrics.total_tokens,
                    metrics.tokens_per_second,
                    metrics.estimated_completion_time
                );
            }
            ReplCommand::Logs(level) => {
                for entry in global_log_buffer().entries(level) {
                    println!(
                        "{} {:?} {}: {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.level,
                        entry.target,
                        entry.message
                    );
                }
            }
            ReplCommand::History => print_history(&session),
            ReplCommand::Update => println!("{}", apply_update(&watcher)),
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Quit => break,
            ReplCommand::Invalid(message) => println!("{}", message),
        }
    }

    checks_cancel.cancel();
    Ok(())
}
