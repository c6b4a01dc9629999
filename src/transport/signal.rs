//! QF-016: Termination signals — SIGINT and SIGTERM cancel the running pass.
//!
//! The first signal sets the [`CancelToken`]; the supervisor then kills the
//! running stage's process group and no further task starts. A second signal
//! exits immediately with status 130.

use super::CancelToken;
use tokio::signal::unix::{signal, SignalKind};

/// Exit status after a second signal.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Start the signal watcher thread. Returns once both handlers are
/// registered, so a signal arriving afterwards is never lost.
pub fn install(cancel: CancelToken) -> Result<(), String> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    std::thread::Builder::new()
        .name("qtlflow-signal".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("cannot start signal runtime: {e}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let streams = signal(SignalKind::interrupt())
                    .and_then(|interrupt| Ok((interrupt, signal(SignalKind::terminate())?)));
                let (mut interrupt, mut terminate) = match streams {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("cannot register signal handlers: {e}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let mut received = 0;
                loop {
                    let name = tokio::select! {
                        s = interrupt.recv() => s.map(|_| "SIGINT"),
                        s = terminate.recv() => s.map(|_| "SIGTERM"),
                    };
                    let Some(name) = name else {
                        return;
                    };
                    received += 1;
                    if received > 1 {
                        tracing::warn!(signal = name, "second signal; exiting now");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                    tracing::warn!(signal = name, "stopping: killing the running stage, no further tasks start");
                    cancel.cancel();
                }
            });
        })
        .map_err(|e| format!("cannot start signal thread: {e}"))?;

    ready_rx
        .recv()
        .map_err(|_| "signal thread exited before registering handlers".to_string())?
}
