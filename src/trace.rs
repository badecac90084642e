//! Chrome trace output.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

enum EventType {
    Complete(Instant),
}

struct Event<'a> {
    name: &'a str,
    /// Track the event is drawn on.
    tid: usize,
    timestamp: Instant,
    event_type: EventType,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {},",
            event.tid,
            event.name,
            event.timestamp.duration_since(self.start).as_micros(),
        )?;
        match event.event_type {
            EventType::Complete(end) => {
                write!(
                    self.w,
                    "\"ph\": \"X\", \"dur\": {} }}",
                    end.duration_since(event.timestamp).as_micros()
                )
            }
        }
    }

    fn write(&mut self, event: Event) -> std::io::Result<()> {
        self.write_event(event)?;
        writeln!(self.w, ",")
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.write_event(Event {
            name: "main",
            tid: 0,
            timestamp: self.start,
            event_type: EventType::Complete(Instant::now()),
        })?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

fn with_trace(f: impl FnOnce(&mut Trace) -> std::io::Result<()>) -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_mut() {
        Some(t) => f(t),
        None => Ok(()),
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    Ok(())
}

/// Runs `f`, recording how long it took as a trace event.
#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    let _ = with_trace(|t| {
        t.write(Event {
            name,
            tid: 0,
            timestamp: start,
            event_type: EventType::Complete(Instant::now()),
        })
    });
    result
}

/// Records an already-finished span, e.g. a build task on a worker.
pub fn span(name: &str, tid: usize, start: Instant, end: Instant) {
    let _ = with_trace(|t| {
        t.write(Event {
            name,
            tid: tid + 1,
            timestamp: start,
            event_type: EventType::Complete(end),
        })
    });
}

pub fn close() -> std::io::Result<()> {
    let result = with_trace(|t| t.close());
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = None;
    result
}
