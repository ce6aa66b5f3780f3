//
// Copyright 2026 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::{io::Write, sync::Arc};

use anyhow::Context;
use clap::Parser;
use enclave_attestation::HttpAttestationFetcher;
use enclave_session::{
    streaming::{ChatMessage, ChatRequest, StreamEvent},
    EnclaveClient,
};
use futures::StreamExt;
use url::Url;

use crate::config::{ChatConfig, StaticRpc};

mod config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, value_parser = crate::config::load_toml::<ChatConfig>)]
    config: ChatConfig,

    /// The WebSocket URL of the enclave.
    /// This will override the value in the config file.
    #[arg(long, env = "ENCLAVE_WS_ENDPOINT")]
    ws_endpoint: Option<Url>,

    /// The URL serving the enclave's attestation document.
    /// This will override the value in the config file.
    #[arg(long, env = "ENCLAVE_ATTESTATION_ENDPOINT")]
    attestation_endpoint: Option<Url>,

    /// Overrides the model named in the config file.
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    prompt: String,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Allow fetching attestation documents over plain HTTP.
    #[arg(long)]
    allow_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Args {
        mut config,
        ws_endpoint,
        attestation_endpoint,
        model,
        system,
        prompt,
        max_tokens,
        temperature,
        allow_http,
    } = Args::parse();

    // The command-line arguments override the values from the config file.
    if let Some(ws_endpoint) = ws_endpoint {
        config.enclave.ws_endpoint = ws_endpoint.to_string();
    }
    if let Some(attestation_endpoint) = attestation_endpoint {
        config.enclave.attestation_endpoint = attestation_endpoint.to_string();
    }
    if let Some(model) = model {
        config.model = model;
    }

    let fetcher = HttpAttestationFetcher::new(!allow_http)
        .context("couldn't create attestation fetcher")?;
    let client = EnclaveClient::new(
        config.session.clone(),
        Arc::new(StaticRpc::new(&config)),
        Arc::new(fetcher),
    );

    let session_id = format!("enclave-chat-{}", std::process::id());
    client
        .connect_model(&config.model, &session_id)
        .await
        .with_context(|| format!("couldn't connect to enclave {}", config.enclave.id))?;
    log::info!("[Chat] Secure channel open to {}", config.enclave.ws_endpoint);

    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));
    let mut request = ChatRequest::new(config.model.clone(), messages);
    if let Some(max_tokens) = max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = temperature {
        request = request.with_temperature(temperature);
    }

    let result = print_completion(&client, &request).await;
    client.shutdown().await;
    result
}

async fn print_completion(client: &EnclaveClient, request: &ChatRequest) -> anyhow::Result<()> {
    let mut events = client.stream_chat(request).await.context("couldn't send request")?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TextDelta(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Reasoning(text) => eprint!("{text}"),
            StreamEvent::ToolCall { name, args } => {
                writeln!(stdout, "\n[tool call] {name}({args})")?;
            }
            StreamEvent::Finish { reason, prompt_tokens, completion_tokens } => {
                writeln!(stdout)?;
                log::info!(
                    "[Chat] Finished ({}), prompt tokens: {:?}, completion tokens: {:?}",
                    reason.as_deref().unwrap_or("unknown"),
                    prompt_tokens,
                    completion_tokens
                );
            }
            StreamEvent::Error(message) => {
                writeln!(stdout)?;
                anyhow::bail!("stream failed: {message}");
            }
        }
    }
    Ok(())
}
