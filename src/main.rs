// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use calloop::{
    generic::Generic,
    ping,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
    EventLoop, Interest, Mode, PostAction,
};
use std::{io, process, time::Instant};
use tracing::{error, info, warn};

use crate::{
    backend::DisplayEvents,
    config::{Command, Config},
    decoder::WakeupFlag,
    input::RawTerminal,
    state::{Exit, State},
};

pub mod backend;
pub mod config;
pub mod decoder;
pub mod input;
pub mod keystone;
mod logger;
pub mod pipeline;
pub mod state;
pub mod utils;

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

fn main() {
    let code = match main_inner() {
        Ok(code) => code,
        Err(err) => {
            error!("Error occured in main(): {:?}", err);
            1
        }
    };
    process::exit(code);
}

fn main_inner() -> Result<i32> {
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let config = match Config::parse(std::env::args_os(), |name| std::env::var(name).ok()) {
        Ok(Command::Play(config)) => config,
        Ok(Command::Help) => {
            print_help(env!("CARGO_PKG_VERSION"), git_hash);
            return Ok(0);
        }
        Ok(Command::Version) => {
            println!(
                "warpplay {} (git commit {})",
                env!("CARGO_PKG_VERSION"),
                git_hash
            );
            return Ok(0);
        }
        Err(err) => {
            eprintln!("warpplay: {}\nTry 'warpplay --help' for more information.", err);
            return Ok(1);
        }
    };

    // setup logger
    logger::init_logger()?;
    info!(?config, "warpplay starting up!");

    profiling::register_thread!("Main Thread");
    #[cfg(feature = "profile-with-tracy")]
    tracy_client::Client::start();

    // init event loop
    let mut event_loop: EventLoop<State> =
        EventLoop::try_new().with_context(|| "Failed to initialize event loop")?;
    let handle = event_loop.handle();

    let (decoder_ping, decoder_source) =
        ping::make_ping().with_context(|| "Failed to init decoder wakeup")?;
    handle
        .insert_source(decoder_source, |_, _, state| state.tick(Instant::now()))
        .map_err(|err| err.error)
        .with_context(|| "Failed to init decoder wakeup source")?;

    // init state and backend
    let (mut state, events) = State::new(&config, WakeupFlag::with_ping(decoder_ping))?;

    match events {
        DisplayEvents::Drm(fd) => {
            handle
                .insert_source(
                    Generic::new(fd, Interest::READ, Mode::Level),
                    |_, _, state| {
                        state.display_readable(Instant::now());
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|err| err.error)
                .with_context(|| "Failed to init the drm event source")?;
        }
        DisplayEvents::Vblank(interval) => {
            handle
                .insert_source(Timer::from_duration(interval), move |_, _, state| {
                    state.display_readable(Instant::now());
                    TimeoutAction::ToDuration(interval)
                })
                .map_err(|err| err.error)
                .with_context(|| "Failed to init the vblank timer")?;
        }
    }

    match RawTerminal::new(io::stdin()) {
        Ok(Some(terminal)) => {
            state.terminal = Some(terminal);
            handle
                .insert_source(
                    Generic::new(io::stdin(), Interest::READ, Mode::Level),
                    |_, _, state| {
                        state.terminal_readable(Instant::now());
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|err| err.error)
                .with_context(|| "Failed to init the keyboard source")?;
        }
        Ok(None) => info!("stdin is not a terminal, keyboard control disabled."),
        Err(err) => warn!(?err, "Failed to set up the terminal, keyboard control disabled."),
    }

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .with_context(|| "Failed to init signal handling")?;
    handle
        .insert_source(signals, |event, _, state| {
            info!(signal = ?event.signal(), "Shutting down");
            state.handle_action(input::Action::Quit, Instant::now());
        })
        .map_err(|err| err.error)
        .with_context(|| "Failed to init the signal source")?;

    // run the event loop
    while !state.should_stop() {
        let timeout = state.backend.player_ref().poll_timeout();
        event_loop
            .dispatch(Some(timeout), &mut state)
            .with_context(|| "Failed to dispatch events")?;
        state.tick(Instant::now());
    }

    state.shutdown();
    let code = state.exit.as_ref().map_or(0, Exit::code);

    // drop eventloop & state before exiting
    std::mem::drop(event_loop);
    std::mem::drop(state);

    Ok(code)
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"warpplay {version} (git commit {git_rev})

Plays video straight to a DRM/KMS display, with keystone correction.

Usage: warpplay [OPTIONS] [FILE]

Options:
      --loop                   Restart playback at the end of the file
      --vsync                  Synchronize flips to vertical blanking (default)
      --no-vsync               Flip as soon as a frame is ready
      --high-performance       Disable vsync and triple buffer, render continuously at up to 60 fps
      --triple-buffer          Allow two flips in flight
      --device PATH            DRM device to use, e.g. /dev/dri/card1
      --keystone-config PATH   Where keystone settings are loaded from and saved to
      --headless               Render without a display
      --frames N               Stop after N frames
  -h, --help                   Show this message
  -V, --version                Show the version of warpplay

Keys:
  k toggle keystone, 1-4 select corner, arrows/wasd move it, +/- step size,
  r reset, b border, [ ] border width, m markers, p save, l load,
  space pause, q/Esc quit

Environment:
  WARPPLAY_BACKEND=kms|headless, WARPPLAY_ATOMIC, WARPPLAY_ZERO_COPY,
  WARPPLAY_DECODERS=y4m,pattern, WARPPLAY_MAX_RECOVERY=N, RUST_LOG"#
    );
}
