mod render;
mod selection;
mod session;
mod surface;

use clap::Parser;
use crossterm::{
    cursor::{Hide, Show},
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use hamon_core::{load_targets, resolve_config_path, Target};
use selection::{Direction, SelectionController};
use session::{Session, SessionTiming};
use std::{
    error::Error,
    fs::OpenOptions,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use surface::{partition, Surface, TerminalSurface};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "hamon-monitor.log";
const LOG_FILE_ENV: &str = "HAMON_LOG_FILE";

#[derive(Parser, Debug)]
#[command(name = "hamon-monitor")]
struct Args {
    /// Target list; falls back to $HAMON_CONFIG, ./haproxy-monitor.conf and
    /// ~/.haproxy-monitor.conf.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    log_file: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputAction {
    Move(Direction),
    Toggle,
    Quit,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args);

    let config_path = resolve_config_path(args.config.as_deref())?;
    let targets = load_targets(&config_path)?;
    info!(
        event = "monitor_start",
        config = %config_path.display(),
        targets = targets.len()
    );

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    if let Err(err) = execute!(stdout, EnterAlternateScreen, Hide) {
        let _ = disable_raw_mode();
        return Err(err.into());
    }

    let outcome = run(targets).await;

    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, Show)?;
    if let Err(err) = &outcome {
        error!(event = "monitor_error", error = %err);
    }
    info!(event = "monitor_stop");
    outcome
}

async fn run(targets: Vec<Target>) -> Result<(), Box<dyn Error>> {
    let surface = TerminalSurface::new()?;
    let regions = partition(surface.size(), targets.len());
    let (render, coordinator) = render::spawn(surface);

    let mut sessions = Vec::with_capacity(targets.len());
    let mut tasks = Vec::with_capacity(targets.len());
    for (region_id, (target, region)) in targets.iter().zip(regions).enumerate() {
        let (session, commands) =
            Session::new(target, region_id, region, SessionTiming::default());
        tasks.push(tokio::spawn(session.clone().run(render.clone(), commands)));
        sessions.push(session);
    }

    let outcome = input_loop(&sessions, &render).await;

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    drop(sessions);
    drop(render);
    let _surface = coordinator.await?;
    outcome
}

async fn input_loop(
    sessions: &[Arc<Session>],
    render: &render::RenderHandle,
) -> Result<(), Box<dyn Error>> {
    let mut selection = SelectionController::new();
    let mut events = EventStream::new();
    while let Some(event) = events.next().await {
        let Event::Key(key) = event? else {
            continue;
        };
        match key_action(key) {
            Some(InputAction::Quit) => break,
            Some(InputAction::Move(direction)) => {
                for idx in selection.step(sessions, direction) {
                    sessions[idx].redraw(render).await;
                }
            }
            Some(InputAction::Toggle) => {
                let Some(session) = sessions.get(selection.active()) else {
                    continue;
                };
                if session.toggle_selected().is_none() {
                    debug!(
                        event = "monitor_toggle_ignored",
                        session = %session.name(),
                        cursor = session.cursor(),
                        rows = session.row_count(),
                        phase = ?session.phase()
                    );
                }
            }
            None => {}
        }
    }
    Ok(())
}

fn key_action(key: KeyEvent) -> Option<InputAction> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(InputAction::Quit);
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(InputAction::Quit),
        KeyCode::Up | KeyCode::Char('k') => Some(InputAction::Move(Direction::Up)),
        KeyCode::Down | KeyCode::Char('j') => Some(InputAction::Move(Direction::Down)),
        KeyCode::Enter | KeyCode::Char(' ') => Some(InputAction::Toggle),
        _ => None,
    }
}

fn resolve_log_file(arg: &str) -> PathBuf {
    if !arg.trim().is_empty() {
        return PathBuf::from(arg);
    }
    if let Ok(value) = std::env::var(LOG_FILE_ENV) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(DEFAULT_LOG_FILE)
}

/// The terminal belongs to the panels, so records only ever go to a file.
fn init_logging(args: &Args) {
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let path = resolve_log_file(&args.log_file);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}
