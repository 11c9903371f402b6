use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel payloads are encoded messages.
pub type Payload = Vec<u8>;

pub type Sender = mpsc::Sender<Payload>;
pub type Receiver = mpsc::Receiver<Payload>;

/// Create a bounded channel with the specified buffer size
pub fn create_channel(buffer_size: usize) -> (Sender, Receiver) {
    mpsc::channel(buffer_size.max(1))
}

/// Shared receiving end of the work channel.
///
/// Clones compete for messages: every payload is handed to exactly one
/// holder.
#[derive(Clone)]
pub struct WorkReceiver {
    inner: Arc<Mutex<Receiver>>,
}

impl WorkReceiver {
    pub fn new(receiver: Receiver) -> Self {
        Self {
            inner: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Next payload, or `None` once every sender is gone and the buffer is
    /// drained.
    pub async fn recv(&self) -> Option<Payload> {
        self.inner.lock().await.recv().await
    }
}

/// Create the work channel: a publishing end and a competing-consumer end.
pub fn create_work_channel(buffer_size: usize) -> (Sender, WorkReceiver) {
    let (tx, rx) = create_channel(buffer_size);
    (tx, WorkReceiver::new(rx))
}
