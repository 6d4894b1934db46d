// Example: interactive terminal chat driven through the full C1-C4 stack.
//
// This is a thin convenience wrapper, not part of the core library — it exists so
// the crate is runnable end to end, mirroring the interactive driver that ships
// alongside most multi-provider chat engines.
//
// Run with:
//   OPENAI_API_KEY=... cargo run --bin ark -- --model gpt-4o-mini

use ark_core::config::{CoreConfig, EndpointConfig};
use ark_core::message::{Message, Role};
use ark_core::tools::ToolRegistry;
use ark_core::transport::{HttpTransport, RequestParams};
use ark_core::worker::{ApiRequest, ApiResponse, WorkerCoordinator};
use clap::Parser;
use std::env;
use std::io::{self, Write};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ark")]
#[command(author, version, about = "Interactive terminal LLM assistant", long_about = None)]
struct Cli {
    /// Model name passed through to the chat-completions endpoint.
    #[arg(short, long, default_value = "gpt-4o-mini")]
    model: String,

    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Maximum tool-call turns before the conversation aborts (§max_turns).
    #[arg(long, default_value_t = 30)]
    max_turns: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let api_key = env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!("Warning: OPENAI_API_KEY not set; requests will be rejected upstream.");
        String::new()
    });

    let endpoint = EndpointConfig::new(cli.base_url, api_key, cli.model.clone());
    let transport: Arc<dyn ark_core::transport::Transport> =
        Arc::new(HttpTransport::new(endpoint, RequestParams::default()));
    let tools = Arc::new(ToolRegistry::new().register_all_builtin());
    let config = CoreConfig::default().with_max_turns(cli.max_turns);

    let (worker, mut responses) = WorkerCoordinator::spawn(config, transport, tools.clone());
    let requests = worker.requests();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              ark — interactive LLM assistant                ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("Model: {}", cli.model);
    println!("Type 'exit' or 'quit' to stop.\n");

    let mut history: Vec<Message> = Vec::new();
    let mut turn = 0u32;

    loop {
        turn += 1;
        print!("\n──── Turn {} ────\n👤 You: ", turn);
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).unwrap_or(0) == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            turn -= 1;
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("\n👋 Goodbye!");
            break;
        }

        history.push(Message::user(input));
        let request_id = format!("turn-{turn}");

        if requests
            .send(ApiRequest::ChatRequest {
                request_id: request_id.clone(),
                messages: history.clone(),
                tools: tools.get_tools_for_llm(),
            })
            .await
            .is_err()
        {
            eprintln!("worker queue closed, exiting");
            break;
        }

        println!("\n🤖 Assistant:");
        if !drive_turn(&mut responses, &request_id, &mut history).await {
            break;
        }
    }

    worker.shutdown().await;
}

/// Drains `ApiResponse` events for one request id until it completes or errors.
/// Returns `false` if the worker pipeline has gone away and the session should stop.
async fn drive_turn(
    responses: &mut tokio::sync::mpsc::Receiver<ApiResponse>,
    request_id: &str,
    history: &mut Vec<Message>,
) -> bool {
    let mut assistant_content = String::new();
    while let Some(event) = responses.recv().await {
        match event {
            ApiResponse::Ready { .. } => {}
            ApiResponse::StreamChunk {
                request_id: id,
                content,
                done,
                ..
            } if id == request_id => {
                if !content.is_empty() {
                    print!("{content}");
                    let _ = io::stdout().flush();
                    assistant_content.push_str(&content);
                }
                if done {
                    println!();
                }
            }
            ApiResponse::ToolCallRequest {
                request_id: id,
                tool_name,
                args,
                icon,
                ..
            } if id == request_id => {
                println!("\n{icon} Calling {tool_name}({args})...");
            }
            ApiResponse::ToolCallResult {
                request_id: id,
                tool_name,
                success,
                summary,
                execution_time,
                ..
            } if id == request_id => {
                let mark = if success { "✅" } else { "❌" };
                println!("{mark} {tool_name} ({:.1}s): {summary}", execution_time.as_secs_f32());
            }
            ApiResponse::StreamComplete {
                request_id: id,
                usage,
                ..
            } if id == request_id => {
                if !assistant_content.is_empty() {
                    history.push(Message::assistant(assistant_content));
                }
                println!("\n(turn complete — {} tokens used)", usage.total_tokens);
                return true;
            }
            ApiResponse::StreamError {
                request_id: id,
                error,
            } if id == request_id => {
                println!("\n❌ Error: {error}");
                return true;
            }
            _ => {}
        }
    }
    false
}
