//! Threads that own a device stream
//!
//! Backends whose streams cannot leave the thread that created them run the
//! stream on a [DeviceWorker]. Releasing the worker returns only after the
//! thread has finished, so the device is free again before anyone can
//! acquire it a second time.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::thread;
use std::time::Duration;

/// How long a release waits for the thread to let go of its device
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

enum Message<C> {
    Command(C),
    Release,
}

/// Commands as seen from the worker thread
pub struct Inbox<C> {
    rx: Receiver<Message<C>>,
}

impl<C> Inbox<C> {
    /// Next command, or `None` once the worker is released or its handle is
    /// gone
    pub fn recv(&self) -> Option<C> {
        match self.rx.recv() {
            Ok(Message::Command(command)) => Some(command),
            Ok(Message::Release) | Err(_) => None,
        }
    }

    /// Blocks until the worker is released, discarding any commands
    pub fn wait_for_release(&self) {
        while self.recv().is_some() {}
    }
}

pub struct DeviceWorker<C> {
    name: String,
    tx: Sender<Message<C>>,

    /// Never carries a value. Disconnects when the thread exits.
    finished: Receiver<()>,
    released: bool,
}

impl<C: Send + 'static> DeviceWorker<C> {
    /// Runs `body` on a new named thread. The thread ends when `body`
    /// returns.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Inbox<C>) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let (finished_tx, finished) = bounded::<()>(0);

        thread::Builder::new().name(name.to_string()).spawn(move || {
            body(Inbox { rx });
            drop(finished_tx);
        })?;

        Ok(Self {
            name: name.to_string(),
            tx,
            finished,
            released: false,
        })
    }
}

impl<C> DeviceWorker<C> {
    /// Sends a command. Returns false if the thread has already exited.
    pub fn send(&self, command: C) -> bool {
        self.tx.send(Message::Command(command)).is_ok()
    }

    /// Asks the thread to stop and waits for it to finish. Returns false if
    /// it is still running after [RELEASE_TIMEOUT]. Later calls do nothing.
    pub fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        let _ = self.tx.send(Message::Release);

        match self.finished.recv_timeout(RELEASE_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} did not release its device in time", self.name);
                false
            }
            _ => {
                trace!("{} released", self.name);
                true
            }
        }
    }
}

impl<C> Drop for DeviceWorker<C> {
    fn drop(&mut self) {
        self.release();
    }
}
