// Interactive interview in the terminal. Drives the same conversation
// handler as the WebSocket endpoint and prints its events to stdout.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::conversation::{ConfirmOutcome, ConversationEvent, ConversationHandler, TurnOutcome};
use crate::evaluator::EvaluatorService;
use crate::llm::LlmClient;
use crate::locale::Locale;
use crate::store::FileSessionStore;

// How long queued output may take to reach the terminal on exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ChatOptions {
    pub config: ApiConfig,
    pub threshold: f32,
    pub session_name: Option<String>,
}

/// Run one interview until the final prompt is written or the user quits.
/// Returns the final prompt when one was produced.
pub async fn run_chat(
    options: ChatOptions,
    store: FileSessionStore,
    evaluator: Arc<EvaluatorService>,
    locale: Arc<Locale>,
) -> Result<Option<String>> {
    let client = LlmClient::from_config(&options.config)
        .map_err(|e| anyhow::anyhow!(locale.t_with("API_CONFIG_FAILED", minijinja::context! { error => e.to_string() })))?;

    if options.config.nsfw_mode {
        for key in [
            "NSFW_MODE_ACTIVE_WARNING_HEADER",
            "NSFW_MODE_ACTIVE_WARNING_FILTERS",
            "NSFW_MODE_ACTIVE_WARNING_CONTENT",
        ] {
            println!("{}", locale.t(key));
        }
    }

    let mut handler = ConversationHandler::create(
        options.session_name,
        None,
        store,
        client,
        evaluator,
        locale.clone(),
        options.threshold,
    )
    .await
    .context("Failed to create session")?;
    info!(session_id = %handler.session().id, "Starting terminal interview");

    let (events_tx, events_rx) = mpsc::channel::<ConversationEvent>(256);
    let printer = tokio::spawn(print_events(events_rx));

    print!("{}", locale.t("AI_PROMPT"));
    flush();
    handler.greet(&events_tx).await?;
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut final_prompt = None;

    loop {
        print!("{}", locale.t("YOU_PROMPT"));
        flush();
        let Some(line) = next_line(&mut lines).await? else { break };
        let input = line.trim();
        if matches!(input.to_lowercase().as_str(), "quit" | "exit") {
            break;
        }

        print!("{}", locale.t("AI_PROMPT"));
        flush();
        let outcome = handler.handle_message(input, &events_tx).await?;
        println!();
        if outcome != TurnOutcome::ConfirmationRequested {
            continue;
        }

        // Ask until the user answers or the writer succeeds
        loop {
            print!("{}", locale.t("CONFIRM_GENERATION_PROMPT"));
            flush();
            let Some(answer) = next_line(&mut lines).await? else { break };
            let accepted = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "是");
            match handler.confirm(accepted, &events_tx).await? {
                ConfirmOutcome::Completed { path, prompt } => {
                    println!();
                    info!(path = %path.display(), "Final prompt saved");
                    final_prompt = Some(prompt);
                    break;
                }
                ConfirmOutcome::Continue => {
                    println!();
                    break;
                }
                ConfirmOutcome::WriterFailed => continue,
            }
        }
        if final_prompt.is_some() {
            break;
        }
    }

    handler.close();
    drop(handler);
    drop(events_tx);
    finish_printer(printer).await;
    println!("{}", locale.t("EXITING"));
    Ok(final_prompt)
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    lines.next_line().await.context("Failed to read from stdin")
}

/// Let the printer drain what is already queued. Pending evaluation tasks may
/// still hold a sender, so the printer is stopped after `FLUSH_TIMEOUT`.
/// Returns the number of events printed, if the printer finished.
async fn finish_printer(mut printer: JoinHandle<usize>) -> Option<usize> {
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut printer).await {
        Ok(Ok(printed)) => Some(printed),
        Ok(Err(e)) => {
            debug!("Printer task failed: {:?}", e);
            None
        }
        Err(_) => {
            printer.abort();
            None
        }
    }
}

async fn print_events(mut events: mpsc::Receiver<ConversationEvent>) -> usize {
    let mut printed = 0;
    while let Some(event) = events.recv().await {
        printed += 1;
        match event {
            ConversationEvent::AiResponseChunk { chunk } | ConversationEvent::FinalPromptChunk { chunk } => {
                print!("{chunk}");
                flush();
            }
            ConversationEvent::SystemMessage { message } | ConversationEvent::SessionEnd { message } => {
                println!("\n{message}");
            }
            ConversationEvent::EvaluationUpdate { message, .. } => println!("\n{message}"),
            ConversationEvent::ConfirmationRequest { reason } => println!("\n{reason}"),
            ConversationEvent::Error { message } => eprintln!("\n{message}"),
            ConversationEvent::ApiConfigResult { .. } | ConversationEvent::SessionStarted { .. } => {}
        }
    }
    printed
}

fn flush() {
    let _ = std::io::stdout().flush();
}
