//! Background loops around the merge store.
//!
//! - writer: feeds the input channel into `Histfile::submit` until a
//!   shutdown signal arrives, then drains and acknowledges.
//! - session GC: flushes halves of sessions reported as ended, until told
//!   to stop at shutdown.
//! - signal forwarder: turns SIGINT/SIGTERM into shutdown-channel messages.

use crossbeam_channel::{select, Receiver, Sender};
use histd_protocol::Record;
use signal_hook::iterator::{Handle, Signals};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::histfile::Histfile;

pub const SHUTDOWN_TOKEN: &str = "histfile";

pub fn spawn_writer(
    store: Arc<Histfile>,
    input: Receiver<Record>,
    signals: Receiver<i32>,
    shutdown_done: Sender<&'static str>,
) -> JoinHandle<()> {
    thread::spawn(move || run_writer(&store, input, &signals, &shutdown_done))
}

fn run_writer(
    store: &Histfile,
    input: Receiver<Record>,
    signals: &Receiver<i32>,
    shutdown_done: &Sender<&'static str>,
) {
    loop {
        select! {
            recv(input) -> message => match message {
                Ok(record) => {
                    store.submit(record);
                }
                Err(_) => {
                    info!("Record input closed; shutting down");
                    break;
                }
            },
            recv(signals) -> message => {
                match message {
                    Ok(signal) => info!(signal, "Got shutdown signal"),
                    Err(_) => info!("Signal channel closed; shutting down"),
                }
                break;
            }
        }
    }

    // Records already queued were accepted before the signal was observed.
    let queued: Vec<Record> = input.try_iter().collect();
    drop(input);
    if !queued.is_empty() {
        debug!(count = queued.len(), "Submitting records queued before shutdown");
    }
    for record in queued {
        store.submit(record);
    }

    let flushed = store.flush_pending();
    info!(flushed, "Shutdown drain complete");
    if shutdown_done.send(SHUTDOWN_TOKEN).is_err() {
        warn!("Shutdown acknowledgement receiver is gone");
    }
}

/// Flushes ended sessions until `stop` fires or disconnects. Sessions
/// already queued when it stops are still flushed, so joining the returned
/// handle means every reported session has been written.
pub fn spawn_session_gc(
    store: Arc<Histfile>,
    sessions_to_drop: Receiver<String>,
    stop: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            select! {
                recv(sessions_to_drop) -> message => match message {
                    Ok(session) => {
                        info!(session = %session, "Got session to drop");
                        store.drop_session(&session);
                    }
                    Err(_) => {
                        debug!("Session GC channel closed");
                        return;
                    }
                },
                recv(stop) -> _ => break,
            }
        }
        for session in sessions_to_drop.try_iter() {
            info!(session = %session, "Dropping session queued before shutdown");
            store.drop_session(&session);
        }
        debug!("Session GC stopped");
    })
}

/// Forwards SIGINT and SIGTERM into `sender` until the returned handle is
/// closed or the receiver goes away.
pub fn spawn_signal_forwarder(sender: Sender<i32>) -> std::io::Result<Handle> {
    let mut signals = Signals::new([libc::SIGINT, libc::SIGTERM])?;
    let handle = signals.handle();
    thread::spawn(move || {
        for signal in signals.forever() {
            if sender.send(signal).is_err() {
                break;
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histfile::tests::{post_exec, pre_exec, read_log};
    use crate::record_log::LogWriterPool;
    use crossbeam_channel::{bounded, unbounded};
    use std::time::Duration;

    struct Harness {
        store: Arc<Histfile>,
        input: Sender<Record>,
        signals: Sender<i32>,
        done: Receiver<&'static str>,
        path: std::path::PathBuf,
        writer: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.json");
        let store = Arc::new(Histfile::new(LogWriterPool::new(path.clone(), 2, 8), 100));
        let (input, input_rx) = unbounded();
        let (signals, signals_rx) = unbounded();
        let (done_tx, done) = bounded(1);
        let writer = spawn_writer(Arc::clone(&store), input_rx, signals_rx, done_tx);
        Harness {
            store,
            input,
            signals,
            done,
            path,
            writer,
            _dir: dir,
        }
    }

    #[test]
    fn shutdown_flushes_pending_halves_before_ack() {
        let harness = harness();
        harness.input.send(pre_exec("s1", 1, "ls -la")).expect("send");
        harness.input.send(post_exec("s1", 1)).expect("send");
        harness.input.send(pre_exec("s2", 1, "sleep 10")).expect("send");
        harness.input.send(pre_exec("s3", 1, "top")).expect("send");

        harness.signals.send(libc::SIGTERM).expect("signal");
        let token = harness
            .done
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown ack");
        assert_eq!(token, SHUTDOWN_TOKEN);
        assert!(harness.store.pending_merge_ids().is_empty());

        let records = read_log(&harness.path);
        assert_eq!(records.len(), 3);
        let incomplete: Vec<&str> = records
            .iter()
            .filter(|record| record.incomplete)
            .map(|record| record.cmd_line.as_str())
            .collect();
        assert_eq!(incomplete.len(), 2);
        assert!(incomplete.contains(&"sleep 10"));
        assert!(incomplete.contains(&"top"));
        assert!(records
            .iter()
            .any(|record| record.parts_merged && record.cmd_line == "ls -la"));

        harness.writer.join().expect("writer thread");
        assert!(harness.input.send(pre_exec("s4", 1, "late")).is_err());
    }

    #[test]
    fn closed_input_also_drains() {
        let harness = harness();
        harness.input.send(pre_exec("s1", 1, "vim")).expect("send");
        drop(harness.input);

        harness
            .done
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown ack");
        let records = read_log(&harness.path);
        assert_eq!(records.len(), 1);
        assert!(records[0].incomplete);
        drop(harness.signals);
    }

    #[test]
    fn session_gc_flushes_orphans_and_ignores_unknown_sessions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.json");
        let store = Arc::new(Histfile::new(LogWriterPool::new(path.clone(), 1, 8), 100));
        store.submit(pre_exec("s1", 1, "sleep 100"));

        let (drop_tx, drop_rx) = unbounded();
        let (_stop_tx, stop_rx) = bounded::<()>(1);
        let gc = spawn_session_gc(Arc::clone(&store), drop_rx, stop_rx);
        drop_tx.send("ghost".to_string()).expect("send");
        drop_tx.send("s1_1".to_string()).expect("send");
        drop(drop_tx);
        gc.join().expect("gc thread");

        assert!(store.pending_merge_ids().is_empty());
        let records = read_log(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cmd_line, "sleep 100");
        assert!(records[0].incomplete);
    }

    #[test]
    fn stopped_session_gc_finishes_queued_sessions_before_exit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.json");
        let store = Arc::new(Histfile::new(LogWriterPool::new(path.clone(), 1, 8), 100));
        for session in ["s1", "s2", "s3"] {
            store.submit(pre_exec(session, 1, &format!("{} job", session)));
        }

        let (drop_tx, drop_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        for session in ["s1", "s2", "s3"] {
            drop_tx.send(session.to_string()).expect("send");
        }
        let gc = spawn_session_gc(Arc::clone(&store), drop_rx, stop_rx);
        // The sender stays alive, as it does in the daemon's request context.
        drop(stop_tx);
        gc.join().expect("gc thread");

        assert!(store.pending_merge_ids().is_empty());
        let records = read_log(&path);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.incomplete));
        drop(drop_tx);
    }
}
