// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agentuse_config::{find_project_root, parse_agent_file};
use agentuse_core::{run_agent, ExecEvent, RunRequest};
use agentuse_server::{list_servers, serve, ServerConfig};
use agentuse_worker::worker_main;
use cli::{Cli, Commands, ServeCommands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // The worker's stdout is the IPC channel; it must be entered before any
    // other output path.
    if cli.internal_worker {
        return exit_code(worker_main().await);
    }

    match cli.command {
        Some(Commands::Run { agent, prompt, model, timeout, max_steps, no_session }) => {
            exit_code(run_cmd(agent, prompt, model, timeout, max_steps, no_session).await)
        }
        Some(Commands::Serve { command: Some(ServeCommands::Ps), .. }) => {
            ps_cmd();
            ExitCode::SUCCESS
        }
        Some(Commands::Serve {
            command: None,
            port,
            host,
            directory,
            debug,
            no_auth,
            auth_token,
        }) => {
            if debug {
                std::env::set_var("RUST_LOG", "debug");
            }
            let start = directory.unwrap_or_else(|| std::path::PathBuf::from("."));
            let project_root = find_project_root(&start);
            let config = ServerConfig {
                host,
                port,
                project_root,
                auth_token,
                no_auth,
            };
            match serve(config).await {
                Ok(code) => ExitCode::from(code as u8),
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
        None => {
            eprintln!("no command given; try `agentuse run <agent.agentuse>` or `agentuse serve`");
            ExitCode::FAILURE
        }
    }
}

async fn run_cmd(
    agent_path: std::path::PathBuf,
    prompt: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
    max_steps: Option<u32>,
    no_session: bool,
) -> anyhow::Result<()> {
    let agent = parse_agent_file(&agent_path)
        .with_context(|| format!("cannot load agent {}", agent_path.display()))?;
    let project_root = find_project_root(&agent.source_path);

    let mut request = RunRequest::new(agent, project_root.clone());
    request.env = agentuse_server::env_snapshot(&project_root);
    request.prompt = prompt;
    request.model_override = model;
    request.timeout_override = timeout;
    request.max_steps_override = max_steps;
    request.persist_session = !no_session;

    // Stream text to stdout as it arrives; everything else goes to the log.
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        let mut failure: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                ExecEvent::Text(delta) => {
                    let _ = stdout.write_all(delta.as_bytes());
                    let _ = stdout.flush();
                }
                ExecEvent::ToolCall { name, .. } => {
                    tracing::info!(tool = %name, "tool call");
                }
                ExecEvent::ToolError { name, error, .. } => {
                    tracing::warn!(tool = %name, %error, "tool error");
                }
                ExecEvent::Error { message, aborted } => {
                    if !aborted {
                        failure = Some(message);
                    }
                }
                _ => {}
            }
        }
        let _ = stdout.write_all(b"\n");
        failure
    });

    // Ctrl-C cancels the run; the executor winds down and the session is
    // marked aborted.
    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    let summary = run_agent(request, tx, cancel_rx).await?;
    let failure = printer.await.ok().flatten();

    match summary.finish_reason.as_str() {
        "stop" | "step-limit" => Ok(()),
        "aborted" => std::process::exit(agentuse_server::EXIT_INTERRUPTED),
        _ => anyhow::bail!(failure.unwrap_or_else(|| "execution failed".into())),
    }
}

fn ps_cmd() {
    let servers = list_servers();
    if servers.is_empty() {
        println!("no running servers");
        return;
    }
    println!(
        "{:<8} {:<22} {:<8} {:<10} {}",
        "PID", "ADDRESS", "AGENTS", "SCHEDULES", "PROJECT"
    );
    for server in servers {
        println!(
            "{:<8} {:<22} {:<8} {:<10} {}",
            server.pid,
            format!("{}:{}", server.host, server.port),
            server.agent_count,
            server.schedule_count,
            server.project_root.display()
        );
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    // stderr: stdout belongs to agent output (and, in worker mode, to the
    // IPC protocol).
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
