mod bridge;
mod config;
mod input;
mod logging;
mod presentation;
mod render;
mod state;

use std::{
    io::{self, Write},
    ops::ControlFlow,
    process::ExitCode,
    sync::Arc,
};

use backend_core::{BackendError, LoopbackBackend};
use backend_platform::{IdentityStore, JsonFileKeyValueStore};
use backend_runtime::{RuntimeConfig, spawn_runtime};
use backend_supabase::SupabaseBackend;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::{
    bridge::{TerminalBridge, UiUpdateCallback},
    config::{BackendMode, TerminalConfig},
    input::{CHAT_HELP, InputAction, USERNAME_HELP, parse_input},
    render::{RenderOptions, input_width, render_frame},
    state::{AppState, Screen},
};

fn main() -> ExitCode {
    logging::init();

    let config = match TerminalConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid terminal configuration");
            eprintln!("chatroom-terminal: {err}");
            return ExitCode::from(2);
        }
    };
    info!(
        offline = config.is_offline(),
        data_dir = %config.data_dir.display(),
        width = config.terminal_width,
        "loaded terminal config"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("chatroom-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "chat session failed to start");
            eprintln!("chatroom-terminal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: TerminalConfig) -> Result<(), BackendError> {
    let identity = IdentityStore::new(JsonFileKeyValueStore::new(config.identity_path()));
    let runtime_config = RuntimeConfig {
        subscription_ready_timeout: config.subscription_ready_timeout,
        ..RuntimeConfig::default()
    };

    let chat_runtime = match &config.backend {
        BackendMode::Offline => {
            info!("running offline with an in-process message store");
            spawn_runtime(Arc::new(LoopbackBackend::new()), identity, runtime_config)
        }
        BackendMode::Supabase(supabase) => {
            info!(
                project = %supabase.project_url(),
                table = supabase.table(),
                "connecting to Supabase"
            );
            let backend = SupabaseBackend::new(supabase.clone())?;
            spawn_runtime(Arc::new(backend), identity, runtime_config)
        }
    };

    let render_options = RenderOptions {
        width: config.terminal_width,
    };
    let ui_update: UiUpdateCallback = Arc::new(move |snapshot| {
        draw(&render_frame(&snapshot, &render_options));
    });
    let bridge = TerminalBridge::spawn(
        chat_runtime,
        AppState::new(config.utc_offset, config.viewport_messages)
            .with_input_width(input_width(config.terminal_width)),
        tokio::runtime::Handle::current(),
        ui_update,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if apply_input(&bridge, &line).is_break() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed reading stdin");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed listening for ctrl-c");
                    break;
                }
                // Ctrl-C steps back from the room; on the username screen it exits.
                if !bridge.back() {
                    break;
                }
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}

fn apply_input(bridge: &TerminalBridge, line: &str) -> ControlFlow<()> {
    match parse_input(bridge.screen(), line) {
        InputAction::Join(username) => bridge.join(&username),
        InputAction::Send(text) => {
            bridge.send_line(&text);
        }
        InputAction::ContinueDraft(text) => bridge.continue_draft(&text),
        InputAction::Back => {
            bridge.back();
        }
        InputAction::Reload => bridge.reload(),
        InputAction::Resend(index) => {
            bridge.retry_send(index);
        }
        InputAction::ScrollUp => bridge.scroll_up(),
        InputAction::ScrollDown => bridge.scroll_down(),
        InputAction::ScrollToTail => bridge.scroll_to_tail(),
        InputAction::Help => bridge.show_error(match bridge.screen() {
            Screen::ChatRoom => CHAT_HELP,
            Screen::Booting | Screen::Username => USERNAME_HELP,
        }),
        InputAction::Quit => return ControlFlow::Break(()),
        InputAction::Invalid(reason) => bridge.show_error(reason),
    }
    ControlFlow::Continue(())
}

fn draw(frame: &[String]) {
    let mut stdout = io::stdout().lock();
    let mut output = String::from("\x1b[2J\x1b[H");
    for line in frame {
        output.push_str(line);
        output.push('\n');
    }
    if let Err(err) = stdout
        .write_all(output.as_bytes())
        .and_then(|()| stdout.flush())
    {
        warn!(error = %err, "failed drawing frame");
    }
}
