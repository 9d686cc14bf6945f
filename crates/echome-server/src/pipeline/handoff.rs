//! Bounded, ordered queue from the generation leg to the synthesis leg.

use super::PipelineError;
use echome_voice::TtsProfile;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One piece of text to speak.
#[derive(Debug, Clone)]
pub struct SynthesisTask {
    /// Position within the turn, starting at zero.
    pub seq: u64,
    pub text: String,
    pub voice: Arc<TtsProfile>,
    pub cancel: CancellationToken,
}

/// Creates the queue for one turn. Dropping the sender closes it.
pub fn channel(
    capacity: usize,
    voice: Arc<TtsProfile>,
    cancel: CancellationToken,
) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        HandoffSender {
            tx,
            next_seq: 0,
            voice,
            cancel,
        },
        HandoffReceiver::new(rx),
    )
}

/// Producer side; numbers tasks as they are pushed.
pub struct HandoffSender {
    tx: mpsc::Sender<SynthesisTask>,
    next_seq: u64,
    voice: Arc<TtsProfile>,
    cancel: CancellationToken,
}

impl HandoffSender {
    /// Queues `text`, waiting while the synthesizer is behind.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Cancelled`] when the turn was cancelled or the
    /// consumer went away.
    pub async fn push(&mut self, text: String) -> Result<(), PipelineError> {
        let task = SynthesisTask {
            seq: self.next_seq,
            text,
            voice: self.voice.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            sent = self.tx.send(task) => {
                sent.map_err(|_| PipelineError::Cancelled)?;
                self.next_seq += 1;
                Ok(())
            }
        }
    }

    /// Number of tasks queued so far.
    pub fn pushed(&self) -> u64 {
        self.next_seq
    }
}

/// Consumer side; hands tasks out strictly by sequence number.
pub struct HandoffReceiver {
    rx: mpsc::Receiver<SynthesisTask>,
    next_seq: u64,
    deferred: BTreeMap<u64, SynthesisTask>,
}

impl HandoffReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<SynthesisTask>) -> Self {
        Self {
            rx,
            next_seq: 0,
            deferred: BTreeMap::new(),
        }
    }

    /// Next task in sequence, or `None` once the queue closed.
    ///
    /// A task that arrives ahead of its turn is held back until every
    /// earlier one was handed out. Duplicates of already consumed numbers
    /// are discarded.
    pub async fn recv(&mut self) -> Option<SynthesisTask> {
        loop {
            if let Some(task) = self.deferred.remove(&self.next_seq) {
                self.next_seq += 1;
                return Some(task);
            }

            let Some(task) = self.rx.recv().await else {
                if !self.deferred.is_empty() {
                    tracing::warn!(
                        expected = self.next_seq,
                        stranded = self.deferred.len(),
                        "handoff closed with a gap, dropping later tasks"
                    );
                }
                return None;
            };

            if task.seq == self.next_seq {
                self.next_seq += 1;
                return Some(task);
            }
            if task.seq < self.next_seq {
                tracing::warn!(seq = task.seq, "discarding already consumed synthesis task");
                continue;
            }
            tracing::debug!(seq = task.seq, expected = self.next_seq, "deferring synthesis task");
            self.deferred.insert(task.seq, task);
        }
    }
}
