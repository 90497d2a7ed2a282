use super::stage::{Stage, StageError};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Notifications published to pipeline observers.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    InputImagesChanged,
    RectifiedImagesChanged,
    DisparityChanged,
    VisualizationChanged,
    PointsChanged,
    /// The pipeline has nothing further to do for the current trigger.
    ProcessingCompleted,
    StageStateChanged { stage: Stage, enabled: bool },
    DroppedFrames { stage: Stage, count: u64 },
    FrameRate { stage: Stage, fps: f64 },
    Error(StageError),
}

/// Fan-out of events to every live subscriber. Subscribers whose receiver has
/// been dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Vec<Sender<PipelineEvent>>,
}

impl EventBus {
    pub(crate) fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: PipelineEvent) {
        tracing::trace!(?event, "pipeline event");
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut bus = EventBus::default();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        drop(gone);

        bus.publish(PipelineEvent::DisparityChanged);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), PipelineEvent::DisparityChanged);
    }
}
