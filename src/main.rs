use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveTime};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use intervalclock::alarm::fire::{FireHandler, FireOutcome};
use intervalclock::alarm::lifecycle::{LifecycleCoordinator, LifecycleError};
use intervalclock::alarm::model::{AlarmConfig, AlarmDraft, AlarmId, parse_time_of_day};
use intervalclock::alarm::scheduler::AlarmScheduler;
use intervalclock::alarm::time_set::compute_trigger_times;
use intervalclock::effects::{LogEffects, Ringer};
use intervalclock::platform::AlarmTable;
use intervalclock::store::JsonFileAlarmStore;

type Coordinator = LifecycleCoordinator<Arc<JsonFileAlarmStore>, Arc<AlarmTable>>;
type Handler = FireHandler<Arc<JsonFileAlarmStore>, Arc<AlarmTable>, LogEffects>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(value: Switch) -> Self {
        value == Switch::On
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "intervalclock",
    version,
    about = "Interval alarms that ring every N minutes between two times"
)]
struct Cli {
    #[arg(long, global = true, default_value = "alarms.json")]
    alarms: PathBuf,

    /// Log filter, overrides RUST_LOG.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the trigger times for a range without storing anything.
    Times {
        #[arg(long, value_parser = parse_time_of_day)]
        start: NaiveTime,
        #[arg(long, value_parser = parse_time_of_day)]
        end: NaiveTime,
        #[arg(long)]
        interval: u32,
    },
    /// Create an alarm and arm it.
    Add {
        #[arg(long, value_parser = parse_time_of_day)]
        start: NaiveTime,
        #[arg(long, value_parser = parse_time_of_day)]
        end: NaiveTime,
        #[arg(long)]
        interval: u32,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        disabled: bool,
        #[arg(long)]
        no_vibration: bool,
        #[arg(long)]
        sound: Option<String>,
    },
    Edit {
        id: String,
        #[arg(long, value_parser = parse_time_of_day)]
        start: Option<NaiveTime>,
        #[arg(long, value_parser = parse_time_of_day)]
        end: Option<NaiveTime>,
        #[arg(long)]
        interval: Option<u32>,
        #[arg(long, value_enum)]
        vibration: Option<Switch>,
        #[arg(long)]
        sound: Option<String>,
    },
    Toggle {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Cancel every registration and disable every alarm.
    StopAll,
    List,
    /// Restore registrations and deliver them as they come due. While
    /// running, `stop [id]` on stdin ends the ringing alarm.
    Run {
        #[arg(long, default_value_t = 1_000)]
        tick_ms: u64,
        /// Exit after this many seconds; runs until killed when omitted.
        #[arg(long)]
        for_secs: Option<u64>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if let Command::Times {
        start,
        end,
        interval,
    } = cli.command
    {
        let times = compute_trigger_times(start, end, interval)?;
        for time in times {
            println!("{}", time.format("%H:%M"));
        }
        return Ok(());
    }

    let store = Arc::new(
        JsonFileAlarmStore::open(&cli.alarms)
            .with_context(|| format!("failed to load {}", cli.alarms.display()))?,
    );
    let table = Arc::new(AlarmTable::new());
    let coordinator =
        LifecycleCoordinator::new(Arc::clone(&store), AlarmScheduler::new(Arc::clone(&table)));

    match cli.command {
        Command::Times { .. } => {}
        Command::Add {
            start,
            end,
            interval,
            id,
            disabled,
            no_vibration,
            sound,
        } => {
            let config = AlarmConfig {
                id: AlarmId::new(id.unwrap_or_default()),
                enabled: !disabled,
                vibration_enabled: !no_vibration,
                alarm_sound_uri: sound.unwrap_or_default(),
                ..AlarmConfig::new(start, end, interval)
            };
            let created = coordinator.create(config).map_err(user_error)?;
            println!("{}", created.id);
        }
        Command::Edit {
            id,
            start,
            end,
            interval,
            vibration,
            sound,
        } => {
            let draft = AlarmDraft {
                start_time: start,
                end_time: end,
                interval_minutes: interval,
                vibration_enabled: vibration.map(bool::from),
                alarm_sound_uri: sound,
                ..AlarmDraft::default()
            };
            if draft.is_empty() {
                bail!("nothing to edit for alarm {id}");
            }
            let updated = coordinator
                .edit(&AlarmId::new(id), &draft)
                .map_err(user_error)?;
            print_config(&updated);
        }
        Command::Toggle { id } => {
            let toggled = coordinator
                .toggle(&AlarmId::new(id))
                .map_err(user_error)?;
            print_config(&toggled);
        }
        Command::Delete { id } => {
            coordinator
                .delete(&AlarmId::new(id.clone()))
                .map_err(user_error)?;
            println!("deleted {id}");
        }
        Command::StopAll => {
            let disabled = coordinator.stop_all().map_err(user_error)?;
            println!("stopped {disabled} alarm(s)");
        }
        Command::List => {
            for config in coordinator.list().map_err(user_error)? {
                print_config(&config);
            }
        }
        Command::Run { tick_ms, for_secs } => {
            if tick_ms == 0 {
                bail!("--tick-ms must be greater than zero");
            }
            run_loop(
                &coordinator,
                &store,
                &table,
                Duration::from_millis(tick_ms),
                for_secs.map(Duration::from_secs),
            )?;
        }
    }
    Ok(())
}

fn run_loop(
    coordinator: &Coordinator,
    store: &Arc<JsonFileAlarmStore>,
    table: &Arc<AlarmTable>,
    tick: Duration,
    limit: Option<Duration>,
) -> Result<()> {
    restore(coordinator)?;
    let mut last_seen = modified_at(store.path());
    let mut reported_unreadable = None;

    let mut handler: Handler = FireHandler::new(
        Arc::clone(store),
        AlarmScheduler::new(Arc::clone(table)),
        Ringer::new(LogEffects),
    );
    let commands = spawn_command_reader();
    let mut commands_open = true;
    let started = Instant::now();

    loop {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        let modified = modified_at(store.path());
        if modified != last_seen {
            if reported_unreadable != Some(modified) {
                tracing::info!(path = %store.path().display(), "alarm file changed, restoring");
            }
            match restore(coordinator) {
                Ok(()) => {
                    last_seen = modified_at(store.path());
                    reported_unreadable = None;
                }
                Err(err) => {
                    if reported_unreadable != Some(modified) {
                        tracing::warn!(
                            path = %store.path().display(),
                            error = %format!("{err:#}"),
                            "alarm file unreadable, keeping current registrations"
                        );
                        reported_unreadable = Some(modified);
                    }
                }
            }
        }

        for delivery in handler.deliver_due(table, &Local::now()) {
            match delivery.result {
                Ok(FireOutcome::Effected { config, rearmed_at }) => {
                    println!(
                        "{} fired {} ({})",
                        Local::now().format("%H:%M:%S"),
                        config.id,
                        config.describe()
                    );
                    tracing::debug!(alarm_id = %config.id, ?rearmed_at, "delivery handled");
                }
                Ok(FireOutcome::Suppressed(reason)) => {
                    tracing::debug!(alarm_id = %delivery.event.alarm_id, ?reason, "delivery suppressed");
                }
                Err(err) => {
                    tracing::error!(
                        alarm_id = %delivery.event.alarm_id,
                        error = %err,
                        retry_at = ?delivery.retry_at,
                        "delivery failed"
                    );
                }
            }
        }

        if commands_open {
            match commands.recv_timeout(tick) {
                Ok(line) => handle_command(&mut handler, &line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => commands_open = false,
            }
        } else {
            thread::sleep(tick);
        }
    }
    Ok(())
}

/// Lines typed on stdin while `run` is active.
fn spawn_command_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn handle_command(handler: &mut Handler, line: &str) {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => {}
        (Some("stop"), Some(id)) => {
            if handler.stop(&AlarmId::new(id)) {
                println!("stopped {id}");
            } else {
                println!("{id} is not ringing");
            }
        }
        (Some("stop"), None) => match handler.ringer().active_alarm().cloned() {
            Some(id) => {
                handler.stop(&id);
                println!("stopped {id}");
            }
            None => println!("nothing is ringing"),
        },
        _ => {
            tracing::warn!(command = line.trim(), "unknown command, expected `stop [id]`");
        }
    }
}

fn restore(coordinator: &Coordinator) -> Result<()> {
    let report = coordinator.restore_all().map_err(user_error)?;
    for (id, error) in &report.failed {
        eprintln!("warning: alarm {id} not armed: {}", error.user_message());
    }
    let next = coordinator.scheduler().platform().next_due();
    println!(
        "armed {} alarm(s), next fire {}",
        report.armed.len(),
        next.map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn print_config(config: &AlarmConfig) {
    let state = if config.enabled { "on" } else { "off" };
    let triggers = config.trigger_times().map(|times| times.len()).unwrap_or(0);
    println!(
        "{}\t{state}\t{}\t{triggers} trigger(s)",
        config.id,
        config.describe()
    );
}

fn user_error(err: LifecycleError) -> anyhow::Error {
    let message = err.user_message();
    if message == err.to_string() {
        anyhow::Error::new(err)
    } else {
        anyhow::Error::new(err).context(message)
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
