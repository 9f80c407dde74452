//! Outbound signal channel.
//!
//! Notifications, extended events and missing-event alerts all leave the
//! denormalizer through one unbounded channel so a slow consumer never blocks
//! denormalization. A component built without a channel drops its signals.

use denormalizer_core::DenormalizerSignal;
use tokio::sync::mpsc;

/// Cloneable sending half of the signal channel.
#[derive(Clone, Debug, Default)]
pub struct SignalSender {
    tx: Option<mpsc::UnboundedSender<DenormalizerSignal>>,
}

impl SignalSender {
    /// Create a connected sender and its receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DenormalizerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Send a signal. A dropped receiver is logged, not an error.
    pub fn emit(&self, signal: DenormalizerSignal) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(signal).is_err() {
            tracing::debug!("Signal receiver dropped, discarding signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use denormalizer_core::Event;
    use serde_json::json;

    #[test]
    fn emitted_signals_reach_receiver() {
        let (sender, mut rx) = SignalSender::channel();
        let event = Event::new(json!({ "name": "a" }));
        sender.emit(DenormalizerSignal::EventExtended(event.clone()));

        assert_eq!(rx.try_recv().ok(), Some(DenormalizerSignal::EventExtended(event)));
    }

    #[test]
    fn disabled_and_closed_senders_do_not_fail() {
        let event = Event::new(json!({ "name": "a" }));
        SignalSender::disabled().emit(DenormalizerSignal::EventExtended(event.clone()));

        let (sender, rx) = SignalSender::channel();
        drop(rx);
        sender.emit(DenormalizerSignal::EventExtended(event));
    }
}
