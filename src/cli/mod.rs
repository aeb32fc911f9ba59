mod ask;
mod pairing;
mod server;
mod worker;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Run")
        .command("server", "Start the relay server (pairing, sessions, event hub)")
        .command("worker", "Start a worker that runs coding agents for the relay")
        .print();

    GuideSection::new("Pairing")
        .command("pairing", "Show pairing status, code and QR payload")
        .command("unpair", "Forget the paired device (stop the server first)")
        .print();

    GuideSection::new("Agent tools")
        .command("ask", "Ask the user a question from inside an agent task")
        .command("request-file", "Ask the user to upload a file")
        .print();

    GuideSection::new("Options")
        .text("server        --host <addr> --port <port>")
        .text("worker        --server <url> --join-token <token> --agent claude|amp --workdir <dir>")
        .text("ask           --task <id> --question <text> [--option <text>]... [--timeout <secs>]")
        .text("request-file  --task <id> [--prompt <text>] [--timeout <secs>]")
        .blank()
        .hint("voicepilot server --port 8787", "")
        .hint("voicepilot worker --join-token 3f9c...", "")
        .text("Data lives in ~/.voicepilot (override with VOICEPILOT_DATA_DIR).")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("voicepilot").green()
    );
}

/// Value following the flag at `i`, if any.
fn flag_value(args: &[String], i: usize) -> Option<String> {
    args.get(i + 1).cloned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_server_args(args: &[String], start: usize) -> ServerArgs {
    let mut parsed = ServerArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                parsed.host = flag_value(args, i);
                i += 2;
            }
            "--port" | "-p" => {
                parsed.port = flag_value(args, i).and_then(|p| p.parse().ok());
                i += 2;
            }
            _ => i += 1,
        }
    }
    parsed
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WorkerArgs {
    pub server: Option<String>,
    pub join_token: Option<String>,
    pub agent: Option<String>,
    pub workdir: Option<String>,
}

pub(crate) fn parse_worker_args(args: &[String], start: usize) -> WorkerArgs {
    let mut parsed = WorkerArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                parsed.server = flag_value(args, i);
                i += 2;
            }
            "--join-token" | "-t" => {
                parsed.join_token = flag_value(args, i);
                i += 2;
            }
            "--agent" | "-a" => {
                parsed.agent = flag_value(args, i);
                i += 2;
            }
            "--workdir" | "-w" => {
                parsed.workdir = flag_value(args, i);
                i += 2;
            }
            _ => i += 1,
        }
    }
    parsed
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AskArgs {
    pub task: Option<String>,
    pub question: String,
    pub options: Vec<String>,
    pub prompt: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Shared by `ask` and `request-file`.
pub(crate) fn parse_ask_args(args: &[String], start: usize) -> AskArgs {
    let mut parsed = AskArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--task" => {
                parsed.task = flag_value(args, i);
                i += 2;
            }
            "--question" | "-q" => {
                parsed.question = flag_value(args, i).unwrap_or_default();
                i += 2;
            }
            "--option" | "-o" => {
                if let Some(option) = flag_value(args, i) {
                    parsed.options.push(option);
                }
                i += 2;
            }
            "--prompt" => {
                parsed.prompt = flag_value(args, i);
                i += 2;
            }
            "--timeout" => {
                parsed.timeout_secs = flag_value(args, i).and_then(|t| t.parse().ok());
                i += 2;
            }
            _ => i += 1,
        }
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();

    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    match cmd {
        "server" => server::run(&data_dir, parse_server_args(&args, 2)).await,
        "worker" => worker::run(&data_dir, parse_worker_args(&args, 2)).await,
        "pairing" => pairing::show(&data_dir).await,
        "unpair" => pairing::unpair(&data_dir).await,
        "ask" => ask::run_ask(&data_dir, parse_ask_args(&args, 2)).await,
        "request-file" => ask::run_request_file(&data_dir, parse_ask_args(&args, 2)).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}
