//! groupclaw - command-line entry point.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use groupclaw::{
    auth::{CredentialProvisioner, FallbackStatus},
    config::Config,
    groups::Group,
    orchestrator::{ContainerInput, ContainerOutput, ContainerRunner, OutputSink},
};

#[derive(Parser, Debug)]
#[command(name = "groupclaw")]
#[command(about = "Run agent sandboxes for chat groups")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent once for a group and print its output
    Run {
        /// Group folder (namespaces all of the group's directories)
        #[arg(long)]
        group: String,

        /// Human-readable group name (defaults to the folder)
        #[arg(long)]
        name: Option<String>,

        /// Run as the privileged main group
        #[arg(long)]
        main: bool,

        /// Chat identifier passed through to the agent
        #[arg(long, default_value = "cli")]
        chat_jid: String,

        /// Resume an existing agent session
        #[arg(long)]
        session_id: Option<String>,

        /// Mark the run as a scheduled task
        #[arg(long)]
        scheduled: bool,

        /// Parse a single result after exit instead of streaming units
        #[arg(long)]
        legacy: bool,

        /// Prompt for the agent
        prompt: String,
    },

    /// Pull and warm the sandbox image
    Prewarm,

    /// Show which credential the next run would use
    AuthStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("groupclaw=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let config = Config::from_env()?;

    match args.command {
        Command::Run {
            group,
            name,
            main,
            chat_jid,
            session_id,
            scheduled,
            legacy,
            prompt,
        } => {
            let runner = ContainerRunner::from_config(&config)?;
            let group = Group::new(name.unwrap_or_else(|| group.clone()), group);

            let mut input = ContainerInput::new(prompt, &group.folder, chat_jid, main);
            if let Some(id) = session_id {
                input = input.with_session_id(id);
            }
            if scheduled {
                input = input.scheduled();
            }

            let sink: Option<Arc<dyn OutputSink>> = if legacy {
                None
            } else {
                let print = |output: ContainerOutput| async move {
                    print_json(&output);
                };
                Some(Arc::new(print) as Arc<dyn OutputSink>)
            };

            let result = runner
                .run(
                    &group,
                    input,
                    |spawned| {
                        tracing::info!(
                            container_name = %spawned.container_name,
                            pid = ?spawned.pid,
                            "Sandbox started"
                        );
                    },
                    sink,
                )
                .await?;

            print_json(&result);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Prewarm => {
            let runner = ContainerRunner::from_config(&config)?;
            runner.prewarm().await?;
        }
        Command::AuthStatus => {
            let credentials = CredentialProvisioner::from_config(&config)?;
            match credentials.fallback_store().status_at(Utc::now()) {
                FallbackStatus::Inactive => println!("oauth (no fallback recorded)"),
                FallbackStatus::Active { since, remaining } => println!(
                    "fallback since {} ({} min remaining)",
                    since.to_rfc3339(),
                    remaining.as_secs().div_ceil(60)
                ),
                FallbackStatus::Expired { since } => println!(
                    "oauth (fallback from {} has expired and clears on the next run)",
                    since.to_rfc3339()
                ),
            }
        }
    }

    Ok(())
}

fn print_json(output: &ContainerOutput) {
    match serde_json::to_string(output) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
        Err(e) => tracing::error!("Failed to encode output: {}", e),
    }
}
