//! Answers the sudo password prompt on a PTY session.
//!
//! The session reader is the only writer of output; it forwards each chunk to
//! the watcher over a channel instead of sharing a buffer. The watcher exits
//! after answering the prompt, on the completion signal, or when the reader
//! goes away.

use async_trait::async_trait;
use shellbeat_core::ShellError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const SUDO_PROMPT: &str = "[sudo] password for ";

/// Where the password gets written: the session's stdin.
#[async_trait]
pub trait PromptReply: Send + Sync + 'static {
    async fn send(&self, data: &[u8]) -> Result<(), ShellError>;
}

pub struct PasswordWatcher {
    chunks: mpsc::UnboundedSender<Vec<u8>>,
    done: oneshot::Sender<()>,
    task: JoinHandle<bool>,
}

impl PasswordWatcher {
    pub fn spawn<R: PromptReply>(reply: R, password: String) -> Self {
        let (chunks, rx) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let task = tokio::spawn(watch(rx, done_rx, reply, password));
        Self { chunks, done, task }
    }

    /// Forward a chunk of session output.
    pub fn feed(&self, chunk: &[u8]) {
        // The watcher may already have answered and exited.
        let _ = self.chunks.send(chunk.to_vec());
    }

    /// Signal completion and wait for the watcher to stop.
    /// Returns whether the prompt was answered.
    pub async fn finish(self) -> bool {
        let _ = self.done.send(());
        self.task.await.unwrap_or(false)
    }
}

async fn watch<R: PromptReply>(
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    mut done: oneshot::Receiver<()>,
    reply: R,
    password: String,
) -> bool {
    let prompt = SUDO_PROMPT.as_bytes();
    let mut window: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            biased;
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { return false };
                window.extend_from_slice(&chunk);
                if window.windows(prompt.len()).any(|w| w == prompt) {
                    if let Err(e) = reply.send(format!("{}\n", password).as_bytes()).await {
                        tracing::warn!("Failed to answer sudo prompt: {}", e);
                    }
                    return true;
                }
                // Keep just enough tail to match a prompt split across chunks.
                let keep = prompt.len() - 1;
                if window.len() > keep {
                    window.drain(..window.len() - keep);
                }
            }
            _ = &mut done => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    #[async_trait]
    impl PromptReply for Captured {
        async fn send(&self, data: &[u8]) -> Result<(), ShellError> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_answers_prompt_once() {
        let captured = Captured::default();
        let watcher = PasswordWatcher::spawn(captured.clone(), "s3cret".into());

        watcher.feed(b"[sudo] password for ops: ");
        tokio::task::yield_now().await;
        watcher.feed(b"[sudo] password for ops: ");

        assert!(watcher.finish().await);
        assert_eq!(captured.0.lock().unwrap().as_slice(), b"s3cret\n");
    }

    #[tokio::test]
    async fn test_prompt_split_across_chunks() {
        let captured = Captured::default();
        let watcher = PasswordWatcher::spawn(captured.clone(), "pw".into());

        watcher.feed(b"noise\n[sudo] pass");
        watcher.feed(b"word for o");
        watcher.feed(b"ps:");

        assert!(watcher.finish().await);
        assert_eq!(captured.0.lock().unwrap().as_slice(), b"pw\n");
    }

    #[tokio::test]
    async fn test_completion_stops_watcher_without_prompt() {
        let captured = Captured::default();
        let watcher = PasswordWatcher::spawn(captured.clone(), "pw".into());

        watcher.feed(b"root\n");

        assert!(!watcher.finish().await);
        assert!(captured.0.lock().unwrap().is_empty());
    }
}
