//! Smoke-test client for a running recap API.
//!
//! Starts a session for one student, sends one or more messages, and prints
//! each reply with its disposition.

use anyhow::{Context, Result};
use clap::Parser;
use recap_api::models::{ErrorResponse, ReplyView, SendMessagePayload, SessionView};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

#[derive(Parser, Debug)]
#[command(name = "recap-eval", version)]
#[command(about = "Send messages to a running recap API and print the replies", long_about = None)]
struct Args {
    /// Base URL of the recap API.
    #[arg(long, default_value = "http://localhost:3000")]
    base_url: String,

    /// Student ID sent as the x-user-id header.
    #[arg(long, default_value = "123")]
    user_id: String,

    /// Message to send. Repeat to send several turns in one session.
    #[arg(long = "message", default_value = "Recap")]
    messages: Vec<String>,
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("Failed to decode response body");
    }
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.message)
        .unwrap_or_else(|_| "no error body".to_string());
    anyhow::bail!("{status}: {message}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let base = args.base_url.trim_end_matches('/');

    let session: SessionView = parse(
        client
            .post(format!("{base}/sessions"))
            .header("x-user-id", &args.user_id)
            .send()
            .await
            .context("Failed to reach the recap API")?,
    )
    .await
    .context("Failed to start a session")?;

    println!(
        "Session {} | {} | class {} | {} ({})",
        session.id, session.topic, session.class_name, session.subject, session.teacher
    );

    for text in &args.messages {
        let reply: ReplyView = parse(
            client
                .post(format!("{base}/sessions/{}/messages", session.id))
                .header("x-user-id", &args.user_id)
                .json(&SendMessagePayload { text: text.clone() })
                .send()
                .await?,
        )
        .await
        .with_context(|| format!("Failed to send '{text}'"))?;

        println!("\n> {text}");
        println!("[{:?}] {}", reply.disposition, reply.text);
    }
    Ok(())
}
