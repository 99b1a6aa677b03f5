use std::sync::Arc;

use fanmux::prelude::*;
use fanmux::vendors::openai::{OpenAiClientConfig, OpenAiProvider};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), OrchestratorError> {
    fanmux::init_observability();

    let orchestrator = Orchestrator::builder()
        .register_provider(Arc::new(OpenAiProvider::from_env("gpt-5-nano")?))
        .register_provider(Arc::new(OpenAiProvider::new(
            OpenAiClientConfig::from_env("gpt-5-mini")?.provider_id("openai-mini"),
        )?))
        .build()?;

    let mut turn = orchestrator
        .conversation(ConversationConfig::named("stream").system_prompt("Reply briefly."))
        .ask("Stream a greeting.")
        .start()
        .await?;

    while let Some(event) = turn.next_event().await {
        match event {
            StreamEvent::Token { provider, text } => print!("[{provider}] {text}"),
            StreamEvent::Thinking { .. } | StreamEvent::Item { .. } => {}
            StreamEvent::Done { provider, stats } => {
                println!();
                println!("{provider} done ({} chars)", stats.content_chars);
            }
            StreamEvent::Error {
                provider, message, ..
            } => eprintln!("{provider} failed: {message}"),
            StreamEvent::AllDone => println!("all providers finished"),
        }
    }

    let report = turn.finish().await?;
    println!("turn {} complete", report.request_id);
    Ok(())
}
