use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Formatter};
use tokio::sync::oneshot;

/// One-shot reply channel handed through an actor's event queue. The caller
/// awaits the receiving half; a dropped callback just means the caller gave
/// up waiting.
pub struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Debug for Callback<O, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn new() -> (Self, oneshot::Receiver<Result<O, E>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }

    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}
