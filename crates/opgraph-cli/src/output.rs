//! Event and report output: human-readable lines, or JSON lines on stdout.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use opgraph_core::{UnitEvent, UnitEventType, UnitReport};

/// Global flag to enable JSON output mode.
static JSON_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_json_mode() {
    JSON_MODE_ENABLED.store(true, Ordering::SeqCst);
}

pub fn is_json_mode() -> bool {
    JSON_MODE_ENABLED.load(Ordering::SeqCst)
}

/// One JSON line.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonLine<'a> {
    Event(&'a UnitEvent),
    Report(&'a UnitReport),
    Summary { command: &'a str, submitted: u64, failed: bool },
}

fn write_json(line: &JsonLine<'_>) {
    if let Ok(json) = serde_json::to_string(line) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", json);
        let _ = stdout.flush();
    }
}

pub fn emit_event(event: &UnitEvent) {
    if is_json_mode() {
        write_json(&JsonLine::Event(event));
        return;
    }

    let label = match event.event_type {
        UnitEventType::Started => "started",
        UnitEventType::Produced => "produced",
        UnitEventType::Finished => "finished",
        UnitEventType::Failed => "FAILED",
        UnitEventType::Cancelled => "cancelled",
    };
    let detail = match event.event_type {
        UnitEventType::Produced => event
            .metadata
            .get("produced_name")
            .map(|name| format!(" -> {name}"))
            .unwrap_or_default(),
        UnitEventType::Failed | UnitEventType::Cancelled => event
            .metadata
            .get("errors")
            .map(|errors| format!(" ({errors})"))
            .unwrap_or_default(),
        _ => String::new(),
    };
    println!(
        "{:<10} {:<9} {}{}",
        event.unit_id.short(),
        label,
        event.unit_name,
        detail
    );
}

pub fn emit_report(report: &UnitReport) {
    if is_json_mode() {
        write_json(&JsonLine::Report(report));
        return;
    }

    println!();
    println!("Unit:     {}", report.name);
    println!("ID:       {}", report.unit_id);
    println!("State:    {}", report.state);
    println!("Priority: {:?}", report.priority);
    if let Some(ms) = report.duration_ms() {
        println!("Duration: {} ms", ms);
    }
    if report.failed {
        println!("Errors:");
        for error in &report.errors {
            println!("  - {}", error);
        }
    } else {
        println!("Result:   ok");
    }
}

pub fn emit_summary(command: &str, submitted: u64, failed: bool) {
    if is_json_mode() {
        write_json(&JsonLine::Summary {
            command,
            submitted,
            failed,
        });
        return;
    }
    println!(
        "{}: {} unit(s) submitted, {}",
        command,
        submitted,
        if failed { "with failures" } else { "all succeeded" }
    );
}

/// Print events as they arrive. Once `stop` fires, print whatever is
/// already queued and return.
pub async fn drain_events(mut rx: mpsc::UnboundedReceiver<UnitEvent>, stop: oneshot::Receiver<()>) {
    tokio::pin!(stop);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => emit_event(&event),
                None => return,
            },
            _ = &mut stop => break,
        }
    }
    while let Ok(event) = rx.try_recv() {
        emit_event(&event);
    }
}

/// Spawn [`drain_events`]. Send on the returned sender to stop it.
pub fn spawn_printer(
    rx: mpsc::UnboundedReceiver<UnitEvent>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop_tx, stop_rx) = oneshot::channel();
    (stop_tx, tokio::spawn(drain_events(rx, stop_rx)))
}
