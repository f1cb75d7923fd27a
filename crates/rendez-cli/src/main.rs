use clap::Parser;
use rendez_cli::{run_chat, ChatArgs};
use tracing_subscriber::EnvFilter;

/// rendezllama: turn-based chat with a local language model
#[derive(Parser)]
#[command(name = "rendezllama", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Chat on stdin/stdout.
    Chat(ChatArgs),
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Chat(args) => {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let result = run_chat(
                &args,
                &mut input,
                Box::new(std::io::stdout()),
                Box::new(std::io::stderr()),
            );
            if let Err(e) = result {
                eprintln!("error: {e}");
                std::process::exit(e.exit_code());
            }
        }
    }
}
