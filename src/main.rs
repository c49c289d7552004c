//! Armada sandbox agent entry point.
//!
//! The controller starts this binary inside each provisioned sandbox:
//! `armada agent <sandbox-dir>`. The agent reads its manifest from the
//! sandbox's protocol directory and drives the group pipeline to a
//! terminal status.

use armada::SandboxAgent;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args[1] != "agent" {
        eprintln!("Usage: {} agent <sandbox-dir>", args[0]);
        eprintln!("\nRuns the sandbox agent for one group inside <sandbox-dir>.");
        eprintln!("The controller writes the group manifest into <sandbox-dir>/proto.");
        std::process::exit(1);
    }

    let sandbox_dir = &args[2];
    tracing::info!(dir = %sandbox_dir, "sandbox agent starting");

    let mut agent = match SandboxAgent::new(sandbox_dir) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("failed to open sandbox directory: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = agent.run().await {
        eprintln!("agent failed: {}", e);
        std::process::exit(1);
    }
}
