//! Channel adapter: write work items in, read resolved envelopes out.
//!
//! The reader sees every `Resolved` emission of the engine from the moment
//! the pipe is opened, including results of items admitted by other
//! callers. Failed resolutions are surfaced as `Err(envelope)` rather than
//! dropped.

use tokio::sync::mpsc;

use crate::emitter::SubscriptionId;
use crate::engine::Engine;
use crate::envelope::ResultEnvelope;
use crate::error::Result;
use crate::event::Event;
use crate::resolvee::WorkItem;

/// Error-first delivery of one envelope.
pub type Delivery<T> = std::result::Result<ResultEnvelope<T>, ResultEnvelope<T>>;

/// Writing half: every write is admitted with [`Engine::resolve`].
pub struct PipeWriter<T> {
    engine: Engine<T>,
}

impl<T> PipeWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn write(&self, item: impl Into<Option<WorkItem<T>>>) -> Result<()> {
        self.engine.resolve(item).map(drop)
    }

    pub fn write_value(&self, value: T) -> Result<()> {
        self.write(WorkItem::value(value))
    }
}

/// Reading half. Dropping it detaches from the engine.
pub struct PipeReader<T> {
    engine: Engine<T>,
    handle: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Delivery<T>>,
}

impl<T> PipeReader<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The next resolved envelope. `None` once the reader's listener has
    /// been removed from the engine, e.g. by `unsubscribe(Resolved, None)`.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        self.rx.recv().await
    }

    /// A delivery that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for PipeReader<T> {
    fn drop(&mut self) {
        self.engine.detach(self.handle);
    }
}

impl<T> Engine<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Open a pipe onto this engine.
    pub fn pipe(&self) -> (PipeWriter<T>, PipeReader<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.on(Event::Resolved, move |delivery| {
            let delivery = match delivery {
                Ok(notice) => match notice.envelope() {
                    Some(envelope) => Ok(envelope.clone()),
                    None => return,
                },
                Err(envelope) => Err(envelope.clone()),
            };
            let _ = tx.send(delivery);
        });

        (
            PipeWriter {
                engine: self.clone(),
            },
            PipeReader {
                engine: self.clone(),
                handle,
                rx,
            },
        )
    }
}
