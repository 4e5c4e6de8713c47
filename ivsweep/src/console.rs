//! Event path towards the operator console.
//!
//! The drivers run on plain threads and must never block on a slow console, so events go through
//! an unbounded tokio channel. Sending is synchronous, the console receives from async code or
//! polls without blocking.

use tokio::sync::mpsc;

use crate::Event;

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Deliver `event`. A console that went away is not an error for the sender.
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            log::debug!("Console is gone, dropping event");
        }
    }

    pub fn progress(&self, percent: f64) {
        self.send(Event::Progress(percent))
    }

    pub fn status<T: Into<String>>(&self, msg: T) {
        self.send(Event::Status(msg.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Everything delivered so far.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut ret = Vec::new();
        while let Some(x) = self.try_recv() {
            ret.push(x);
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[tokio::test]
    async fn events_from_threads_arrive_in_order() {
        let (tx, mut rx) = event_channel();
        let worker = thread::spawn(move || {
            for k in 0..3 {
                tx.progress(k as f64 * 50.0);
            }
            tx.send(Event::SweepComplete { aborted: false });
        });
        assert_eq!(rx.recv().await, Some(Event::Progress(0.0)));
        assert_eq!(rx.recv().await, Some(Event::Progress(50.0)));
        assert_eq!(rx.recv().await, Some(Event::Progress(100.0)));
        assert_eq!(rx.recv().await, Some(Event::SweepComplete { aborted: false }));
        // all senders are gone
        assert_eq!(rx.recv().await, None);
        worker.join().unwrap();
    }

    #[test]
    fn closed_console_is_ignored() {
        let (tx, rx) = event_channel();
        drop(rx);
        assert!(tx.is_closed());
        tx.status("nobody listens");
    }

    #[test]
    fn drain_collects_pending() {
        let (tx, mut rx) = event_channel();
        tx.status("a");
        tx.send(Event::MeasurementCount(3));
        assert_eq!(
            rx.drain(),
            vec![Event::Status("a".to_string()), Event::MeasurementCount(3)]
        );
        assert!(rx.try_recv().is_none());
    }
}
