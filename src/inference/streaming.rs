//! Token streaming
//!
//! Completions arrive as a channel of tokens with a shared stop signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// One event of a streaming completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Incremental text
    Token(String),
    /// Completion finished; runtimes that do not stream may report the full text here
    Done(Option<String>),
    /// Completion failed
    Error(String),
}

/// Producer side of a token stream. `send` never blocks, so worker threads can use it.
#[derive(Debug, Clone)]
pub struct TokenSender {
    tx: UnboundedSender<StreamToken>,
    stop_signal: Arc<AtomicBool>,
}

impl TokenSender {
    /// Returns false once the consumer is gone
    pub fn send(&self, token: StreamToken) -> bool {
        self.tx.send(token).is_ok()
    }

    /// True once the consumer asked to stop
    pub fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }
}

/// Consumer side of a token stream
#[derive(Debug)]
pub struct TokenStream {
    rx: UnboundedReceiver<StreamToken>,
    stop_signal: Arc<AtomicBool>,
}

impl TokenStream {
    pub fn channel() -> (TokenSender, TokenStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop_signal = Arc::new(AtomicBool::new(false));
        (
            TokenSender {
                tx,
                stop_signal: stop_signal.clone(),
            },
            TokenStream { rx, stop_signal },
        )
    }

    /// Next event, or `None` once the producer is gone
    pub async fn next(&mut self) -> Option<StreamToken> {
        self.rx.recv().await
    }

    /// Signal the producer to stop
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }
}
