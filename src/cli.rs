// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "agentuse",
    version,
    about = "Run markdown agent files as autonomous tool-using programs"
)]
pub struct Cli {
    /// Run as the internal execution worker (spawned by `serve`).
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    /// Verbose logging to stderr (repeat for more detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one agent file to completion, streaming text to stdout.
    Run {
        /// Path to the .agentuse file.
        agent: PathBuf,

        /// Extra prompt appended to the agent's instructions.
        #[arg(long, short)]
        prompt: Option<String>,

        /// Override the agent's model (`provider:model-id`).
        #[arg(long)]
        model: Option<String>,

        /// Whole-run timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Cap on executed tool calls.
        #[arg(long = "max-steps")]
        max_steps: Option<u32>,

        /// Skip writing a session log.
        #[arg(long)]
        no_session: bool,
    },

    /// Run the HTTP service: /run endpoint, schedules, hot reload.
    Serve {
        #[command(subcommand)]
        command: Option<ServeCommands>,

        #[arg(long, default_value_t = 3789)]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Project directory (default: walk up from the current directory).
        #[arg(long, short)]
        directory: Option<PathBuf>,

        #[arg(long)]
        debug: bool,

        /// Allow serving without a bearer token on non-loopback binds.
        #[arg(long)]
        no_auth: bool,

        /// Bearer token clients must present.
        #[arg(long, env = "AGENTUSE_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServeCommands {
    /// List running server instances.
    Ps,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
