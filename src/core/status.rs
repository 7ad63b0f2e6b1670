//! Operator-facing progress reporting.
//!
//! Every long operation takes a [`StatusSink`] and emits human-readable
//! progress lines through it. The sink never influences control flow: sends
//! that fail are dropped. Each sink also keeps an in-memory transcript of
//! everything emitted so the orchestrator can persist it as the run log.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

#[derive(Clone)]
pub struct StatusSink {
    kind: SinkKind,
    log: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
enum SinkKind {
    /// Print each line to stdout (the CLI default)
    Stdout,
    /// Forward each line to a channel, for callers that render progress
    /// somewhere other than the terminal
    Channel(mpsc::Sender<String>),
    /// Record only
    Silent,
}

impl StatusSink {
    pub fn stdout() -> Self {
        Self::with_kind(SinkKind::Stdout)
    }

    #[allow(dead_code)]
    pub fn channel(tx: mpsc::Sender<String>) -> Self {
        Self::with_kind(SinkKind::Channel(tx))
    }

    #[allow(dead_code)]
    pub fn silent() -> Self {
        Self::with_kind(SinkKind::Silent)
    }

    fn with_kind(kind: SinkKind) -> Self {
        Self {
            kind,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.log.lock().await.push(line.clone());
        match &self.kind {
            SinkKind::Stdout => println!("{}", line),
            SinkKind::Channel(tx) => {
                let _ = tx.send(line).await; // Receiver gone is not our problem
            }
            SinkKind::Silent => {}
        }
    }

    /// A `====`/`----` style separator line, matching the transcript format
    /// the analysis flows print.
    pub async fn rule(&self, ch: char) {
        self.emit(ch.to_string().repeat(60)).await;
    }

    /// Same destination, empty transcript. The orchestrator takes one of
    /// these per run so each run log starts clean.
    pub fn fresh(&self) -> Self {
        Self::with_kind(self.kind.clone())
    }

    /// Everything emitted so far, in order.
    pub async fn transcript(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}
