use nfq::Queue;
use std::io;
use thiserror::Error;

/// The queue number every interception rule targets; read by the orchestrator
pub const TRIGGER_QUEUE: u16 = 0;

/// The kernel packet queues the engine runs on, bound at startup
///
/// Queue 0 is the trigger queue; queues 1..N each back one waiter slot.
/// The engine cannot run degraded, so any open or bind failure is fatal
/// to the caller.
pub struct QueueSet {
    queues: Vec<Queue>,
}

impl QueueSet {
    pub fn open(count: u16) -> Result<Self, QueueOpenError> {
        let mut queues = Vec::with_capacity(usize::from(count));
        for num in 0..count {
            let mut queue = Queue::open().map_err(QueueOpenError::Open)?;
            queue.bind(num).map_err(|err| QueueOpenError::Bind(num, err))?;
            queues.push(queue);
        }
        Ok(QueueSet { queues })
    }

    pub fn into_queues(self) -> Vec<Queue> {
        self.queues
    }
}

#[derive(Debug, Error)]
pub enum QueueOpenError {
    #[error("error opening netfilter queue: {0}")]
    Open(io::Error),
    #[error("error binding netfilter queue {0}: {1}")]
    Bind(u16, io::Error),
}
