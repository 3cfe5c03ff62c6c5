//! Per-task typed event channel.
//!
//! One bounded SPSC channel per pipeline run. The producer never blocks
//! and never fails: a full buffer sheds the oldest low-value event
//! (`code_chunk` first, then `test_progress`), and a dropped receiver
//! turns every emit into a silent no-op — the pipeline keeps running when
//! the subscriber walks away.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use mend_core::types::{
    Analysis, ErrorKind, FeedbackStatus, Plan, PrRecord, TaskOutcome, TestReport,
};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

/// Everything a subscriber can observe about one pipeline run, in emission
/// order: `connected` first, `done` last, exactly one of `complete` or
/// `error` in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Connected {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        #[serde(rename = "feedbackId")]
        feedback_id: Uuid,
    },
    Stage {
        phase: FeedbackStatus,
    },
    Intent {
        analysis: Analysis,
    },
    CodeChunk {
        content: String,
    },
    Suggestion {
        plan: Plan,
    },
    TestProgress {
        current: usize,
        total: usize,
        name: String,
    },
    TestResult {
        report: TestReport,
    },
    Pr {
        pr: PrRecord,
    },
    Complete {
        result: TaskOutcome,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Done,
}

impl TaskEvent {
    /// Wire name, doubling as the SSE event type.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Connected { .. } => "connected",
            TaskEvent::Stage { .. } => "stage",
            TaskEvent::Intent { .. } => "intent",
            TaskEvent::CodeChunk { .. } => "code_chunk",
            TaskEvent::Suggestion { .. } => "suggestion",
            TaskEvent::TestProgress { .. } => "test_progress",
            TaskEvent::TestResult { .. } => "test_result",
            TaskEvent::Pr { .. } => "pr",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Error { .. } => "error",
            TaskEvent::Done => "done",
        }
    }

    /// Whether the event may be shed under backpressure. Everything that
    /// changes what the subscriber concludes about the run is protected.
    fn droppable(&self) -> bool {
        matches!(self, TaskEvent::CodeChunk { .. } | TaskEvent::TestProgress { .. })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct Shared {
    queue: Mutex<VecDeque<TaskEvent>>,
    notify: Notify,
    capacity: usize,
    receiver_alive: AtomicBool,
    sender_done: AtomicBool,
}

/// Create one task's event channel.
pub fn task_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        capacity: capacity.max(1),
        receiver_alive: AtomicBool::new(true),
        sender_done: AtomicBool::new(false),
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

#[derive(Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Enqueue an event. Infallible by design: disconnected subscribers
    /// make this a no-op, and overflow sheds droppable events only.
    pub fn emit(&self, event: TaskEvent) {
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock().expect("event queue poisoned");
            if queue.len() >= self.shared.capacity {
                if let Some(idx) = queue
                    .iter()
                    .position(|e| matches!(e, TaskEvent::CodeChunk { .. }))
                    .or_else(|| {
                        queue
                            .iter()
                            .position(|e| matches!(e, TaskEvent::TestProgress { .. }))
                    })
                {
                    queue.remove(idx);
                } else if event.droppable() {
                    // Buffer full of protected events: shed the newcomer.
                    return;
                }
                // Protected events go in even past capacity.
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        // Last sender gone: the receiver drains and then sees end-of-stream.
        if Arc::strong_count(&self.shared) <= 2 {
            self.shared.sender_done.store(true, Ordering::Release);
            self.shared.notify.notify_one();
        }
    }
}

pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Next event in emission order; `None` once the producer is done and
    /// the buffer is drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            {
                let mut queue = self.shared.queue.lock().expect("event queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.sender_done.load(Ordering::Acquire) {
                // Re-check: an emit may have raced the done flag.
                let mut queue = self.shared.queue.lock().expect("event queue poisoned");
                return queue.pop_front();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Adapt the receiver into a `Stream` for SSE responses.
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> {
        futures_util::stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: usize) -> TaskEvent {
        TaskEvent::CodeChunk {
            content: format!("chunk-{i}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (tx, mut rx) = task_channel(16);
        let task_id = Uuid::new_v4();
        let feedback_id = Uuid::new_v4();

        tx.emit(TaskEvent::Connected {
            task_id,
            feedback_id,
        });
        tx.emit(TaskEvent::Stage {
            phase: FeedbackStatus::Analyzing,
        });
        tx.emit(TaskEvent::Done);
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().kind(), "connected");
        assert_eq!(rx.recv().await.unwrap().kind(), "stage");
        assert_eq!(rx.recv().await.unwrap().kind(), "done");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_code_chunks_first() {
        let (tx, mut rx) = task_channel(4);
        tx.emit(TaskEvent::Stage {
            phase: FeedbackStatus::Generating,
        });
        for i in 0..3 {
            tx.emit(chunk(i));
        }
        // Buffer full; a protected event must evict the oldest chunk.
        tx.emit(TaskEvent::Done);
        drop(tx);

        let mut kinds = Vec::new();
        let mut contents = Vec::new();
        while let Some(event) = rx.recv().await {
            if let TaskEvent::CodeChunk { content } = &event {
                contents.push(content.clone());
            }
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["stage", "code_chunk", "code_chunk", "done"]);
        assert_eq!(contents, vec!["chunk-1", "chunk-2"]);
    }

    #[tokio::test]
    async fn protected_events_are_never_dropped() {
        let (tx, mut rx) = task_channel(2);
        tx.emit(TaskEvent::Stage {
            phase: FeedbackStatus::Testing,
        });
        tx.emit(TaskEvent::Error {
            kind: ErrorKind::QualityGateFailed,
            message: "gate".into(),
        });
        // Full of protected events: they still go in past capacity.
        tx.emit(TaskEvent::Done);
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["stage", "error", "done"]);
    }

    #[tokio::test]
    async fn new_droppable_event_is_shed_when_full_of_protected() {
        let (tx, mut rx) = task_channel(2);
        tx.emit(TaskEvent::Stage {
            phase: FeedbackStatus::Testing,
        });
        tx.emit(TaskEvent::Done);
        tx.emit(chunk(0));
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["stage", "done"]);
    }

    #[tokio::test]
    async fn emit_after_receiver_drop_is_silent() {
        let (tx, rx) = task_channel(4);
        drop(rx);
        // Must neither panic nor block.
        tx.emit(TaskEvent::Done);
        tx.emit(chunk(0));
    }

    #[tokio::test]
    async fn receiver_wakes_on_late_emission() {
        let (tx, mut rx) = task_channel(4);
        let handle = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.emit(TaskEvent::Done);

        let event = handle.await.unwrap().unwrap();
        assert_eq!(event.kind(), "done");
    }

    #[tokio::test]
    async fn stream_adapter_yields_until_close() {
        use futures_util::StreamExt;

        let (tx, rx) = task_channel(8);
        tx.emit(TaskEvent::Stage {
            phase: FeedbackStatus::Publishing,
        });
        tx.emit(TaskEvent::Done);
        drop(tx);

        let kinds: Vec<&str> = rx.into_stream().map(|e| e.kind()).collect().await;
        assert_eq!(kinds, vec!["stage", "done"]);
    }

    #[test]
    fn event_payloads_serialize_camel_case() {
        let event = TaskEvent::Complete {
            result: TaskOutcome {
                needs_human: true,
                summary: "handoff".into(),
                analysis: None,
                pr: None,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["result"]["needsHuman"], true);

        let event = TaskEvent::Error {
            kind: ErrorKind::BreakerBlocked,
            message: "daily budget".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "breaker-blocked");
    }
}
