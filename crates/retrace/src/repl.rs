use retrace_engine::api::RecorderService;
use retrace_engine::error::Mutation;
use retrace_engine::event::{EventKind, SessionEvent};
use retrace_engine::protocol::{Session, SessionDraft};
use tokio::io::{AsyncBufReadExt, BufReader};

const BANNER: &[&str] = &[
    "Recording. Interact with the browser window; captured steps are printed below.",
    "Commands: pause, resume, status, stop (or Ctrl-C).",
];

fn print_warnings<T>(mutation: &Mutation<T>) {
    for warning in &mutation.warnings {
        eprintln!("Warning: {}", warning);
    }
}

fn print_event(event: &SessionEvent) {
    match &event.kind {
        EventKind::StepAdded { step } => println!("+ {:>3}  {}", step.order, step.description),
        EventKind::StepRemoved { step_id } => println!("- {}", step_id),
        EventKind::StatusChanged { status } => println!("status: {}", status),
        EventKind::DriverError { message } => eprintln!("browser: {}", message),
        EventKind::PersistenceWarning { error } => eprintln!("Warning: {}", error.detail),
        _ => {}
    }
}

/// Create, start and drive one recording from stdin until stopped.
pub async fn record(service: &RecorderService, draft: SessionDraft) -> anyhow::Result<()> {
    let created = service.create_session(draft).await?;
    print_warnings(&created);
    let session_id = created.value.id.clone();
    let mut events = service.subscribe(&session_id);

    let started = service.start(&session_id).await?;
    print_warnings(&started);
    println!("session: {}", session_id);
    for line in BANNER {
        println!("{}", line);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let outcome = match line.trim() {
                    "" => continue,
                    "pause" => service.pause(&session_id).await.map(|m| print_warnings(&m)),
                    "resume" => service.resume(&session_id).await.map(|m| print_warnings(&m)),
                    "status" => service.get_session(&session_id).await.map(|s| {
                        println!("{} ({} steps)", s.status, s.steps.len());
                    }),
                    "stop" | "exit" | "quit" => break,
                    other => {
                        eprintln!("Unknown command: {}", other);
                        Ok(())
                    }
                };
                if let Err(e) = outcome {
                    eprintln!("Error: {}", e);
                }
            }
        }
    }

    let stopped = service.stop(&session_id).await?;
    print_warnings(&stopped);
    summarize(&stopped.value);
    service.unsubscribe(events);
    Ok(())
}

fn summarize(session: &Session) {
    println!(
        "stopped {} with {} steps; export with `retrace export {}`",
        session.name,
        session.steps.len(),
        session.id
    );
}
