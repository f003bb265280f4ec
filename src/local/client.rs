use crate::config::Config;
use crate::ingest::{IngestEvent, IngestLoop};
use crate::processing::conditioner::SignalConditioner;
use crate::processing::stages::{StageContext, StageKind, StageSelector};
use crate::processing::triggers::NullStimulator;
use crate::session::message::{ChannelSink, ConsoleSink, NotificationSink, StageEvent};
use crate::session::{SessionController, SessionStorage};
use crate::stream::ZmqBus;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::log::FileSink;

use colored::Colorize;
use crossbeam_channel::{select, unbounded, Receiver};
use std::error::Error;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What the operator typed, once the client's own words are taken out.
#[derive(Debug, Clone, PartialEq)]
enum OperatorInput {
    Quit,
    Pause,
    Resume,
    Stage(String),
}

fn parse_input(line: &str) -> Option<OperatorInput> {
    let line = line.trim();
    match line.to_lowercase().as_str() {
        "" => None,
        "quit" | "exit" | "stop" => Some(OperatorInput::Quit),
        "pause" => Some(OperatorInput::Pause),
        "resume" => Some(OperatorInput::Resume),
        _ => Some(OperatorInput::Stage(line.to_string())),
    }
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to read operator input: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn print_event(event: StageEvent) {
    match event {
        StageEvent::NewMessage(message) => ConsoleSink.notify(message),
        StageEvent::SessionComplete {
            stage_name,
            trial_count,
        } => println!(
            "{}",
            format!("{} complete: {} trials", stage_name, trial_count)
                .green()
                .bold()
        ),
    }
}

// -----------------------------------------------------------------------------
// RUN CODE
// -----------------------------------------------------------------------------

pub fn run(subject_id: &str, selector: StageSelector, config: Config) -> Result<(), Box<dyn Error>> {
    let storage = SessionStorage::resolve(
        config.application.data_dir.as_deref(),
        &config.application.name,
    );
    log::info!("Session data directory: {}", storage.root().display());

    let (events_tx, events_rx) = unbounded::<StageEvent>();
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(ChannelSink::new(events_tx.clone()))];
    if let Some(filename) = config.application.message_log.as_deref() {
        sinks.push(Box::new(FileSink::new(filename)));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (markers_tx, markers_rx) = unbounded();
    let context = StageContext {
        clock: clock.clone(),
        notifier: Arc::new(sinks),
        stimulator: Some(Box::new(NullStimulator)),
        storage,
        seed: None,
        markers: Some(markers_tx),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut controller = SessionController::new(events_tx, stop.clone());
    let stage = StageKind::new(selector, &config, context);
    if let Err(e) = controller.start(stage, subject_id) {
        println!("{}", e.to_string().red());
        return Ok(());
    }
    println!(
        "{}",
        format!("{} running for {}. Type 'quit' to finish.", selector, subject_id).cyan()
    );

    let conditioner = SignalConditioner::new(config.conditioner.clone())?;
    let stream = config.stream.clone();
    let bus_config = stream.clone();
    let ingest = IngestLoop::spawn_with_markers(
        move || {
            ZmqBus::new(
                &bus_config.data_endpoint,
                &bus_config.control_endpoint,
                Duration::from_millis(bus_config.socket_timeout_ms),
            )
        },
        stream,
        clock,
        conditioner,
        markers_rx,
    )?;
    let operator = spawn_stdin_reader()?;

    loop {
        let keep_going = select! {
            recv(ingest.events()) -> event => match event {
                Ok(IngestEvent::FrameReady(frame)) => {
                    controller.on_frame(&frame);
                    controller.is_running()
                }
                Ok(IngestEvent::Stopped) | Err(_) => {
                    log::warn!("Ingest stopped, ending session");
                    false
                }
            },
            recv(operator) -> line => match line.ok().as_deref().map(parse_input) {
                Some(Some(OperatorInput::Quit)) | None => false,
                Some(Some(OperatorInput::Pause)) => {
                    controller.pause();
                    true
                }
                Some(Some(OperatorInput::Resume)) => {
                    controller.resume();
                    true
                }
                Some(Some(OperatorInput::Stage(command))) => {
                    if let Err(e) = controller.command(&command) {
                        log::debug!("Command '{}' rejected: {}", command, e);
                    }
                    true
                }
                Some(None) => true,
            },
            recv(events_rx) -> event => {
                if let Ok(event) = event {
                    print_event(event);
                }
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    stop.store(true, Ordering::SeqCst);
    let result = controller.stop();
    ingest.join();
    for event in events_rx.try_iter() {
        print_event(event);
    }
    result?;
    Ok(())
}
