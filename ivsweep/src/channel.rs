//! The two queues between the producers and the instrument worker.
//!
//! [`CommandSender`] may be cloned into any number of producer threads. [`CommandReceiver`] is
//! not clonable and lives inside the worker, which is what makes the execution order a total
//! order over all producers. Responses flow back through [`ResultSender`] / [`ResultReceiver`].

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{Error, Operation, Response};

enum Command {
    Op(Operation),
    Stop,
}

#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

pub struct CommandReceiver {
    rx: Receiver<Command>,
    stopped: bool,
}

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = channel::unbounded();
    (CommandSender { tx }, CommandReceiver { rx, stopped: false })
}

impl CommandSender {
    /// Queue an operation. Never blocks; fails only once the worker is gone.
    pub fn enqueue(&self, op: Operation) -> crate::Result<()> {
        self.tx.send(Command::Op(op)).map_err(|_| Error::Disconnected)
    }

    pub fn write<T: Into<String>>(&self, cmd: T) -> crate::Result<()> {
        self.enqueue(Operation::write(cmd))
    }

    pub fn write_all<I, T>(&self, cmds: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for cmd in cmds {
            self.write(cmd)?;
        }
        Ok(())
    }

    /// Queue the terminal sentinel. Everything queued before it is still executed.
    pub fn stop(&self) -> crate::Result<()> {
        self.tx.send(Command::Stop).map_err(|_| Error::Disconnected)
    }

    /// Approximate number of operations waiting for the worker. Only good for flow control.
    pub fn size(&self) -> usize {
        self.tx.len()
    }
}

impl CommandReceiver {
    /// Block until the next operation is available.
    ///
    /// Returns `None` once the stop sentinel was dequeued (or every producer is gone) and keeps
    /// returning `None` afterwards without touching the queue again.
    pub fn dequeue(&mut self) -> Option<Operation> {
        if self.stopped {
            return None;
        }
        match self.rx.recv() {
            Ok(Command::Op(op)) => Some(op),
            Ok(Command::Stop) | Err(_) => {
                self.stopped = true;
                None
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn size(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Clone)]
pub struct ResultSender {
    tx: Sender<Response>,
}

#[derive(Clone)]
pub struct ResultReceiver {
    rx: Receiver<Response>,
}

pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = channel::unbounded();
    (ResultSender { tx }, ResultReceiver { rx })
}

impl ResultSender {
    pub fn push(&self, resp: Response) -> crate::Result<()> {
        self.tx.send(resp).map_err(|_| Error::Disconnected)
    }
}

impl ResultReceiver {
    /// Block until a result arrives. Fails with [`Error::Disconnected`] once the worker has
    /// exited and every pending result was consumed.
    pub fn recv(&self) -> crate::Result<Response> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> crate::Result<Response> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => Error::protocol_timeout(),
            RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }

    pub fn try_recv(&self) -> crate::Result<Option<Response>> {
        match self.rx.try_recv() {
            Ok(x) => Ok(Some(x)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Throw away whatever is pending and return how many results that were.
    pub fn discard_pending(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn size(&self) -> usize {
        self.rx.len()
    }
}
