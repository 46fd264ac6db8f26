//! The per-connection operation queue.
//!
//! All work for a connection funnels through this queue and is executed by
//! whichever worker thread drains it; the first enqueue onto an empty queue
//! is the signal to schedule the connection. Two sub-queues provide the
//! priority lane, and a single preallocated backup slot guarantees that an
//! emergency shutdown can always be queued even under allocation failure.

use std::collections::VecDeque;
use std::net::SocketAddrV6;

use timer::TimerType;
use StreamId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ApiCall(ApiCall),
    FlushRecv,
    FlushSend,
    FlushStreamRecv(StreamId),
    TimerExpired(TimerType),
    Unreachable(SocketAddrV6),
    /// Route resolution finished for a path; failure silently aborts
    RouteCompletion {
        path_remote: SocketAddrV6,
        succeeded: bool,
    },
    TraceRundown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Shutdown {
        flags: u32,
        error_code: u64,
    },
    SendResumptionTicket {
        app_data: Vec<u8>,
        final_ticket: bool,
    },
    CompleteResumptionTicketValidation {
        accepted: bool,
    },
    CompleteCertificateValidation {
        accepted: bool,
        tls_alert: u8,
    },
}

#[derive(Debug, Default)]
pub struct OperQueue {
    queue: VecDeque<Operation>,
    priority: VecDeque<Operation>,
    /// Reserved shutdown operation; present until consumed
    backup: Option<Operation>,
}

impl OperQueue {
    pub fn new(backup: Operation) -> Self {
        OperQueue {
            queue: VecDeque::new(),
            priority: VecDeque::new(),
            backup: Some(backup),
        }
    }

    fn was_empty(&self) -> bool {
        self.queue.is_empty() && self.priority.is_empty()
    }

    /// Returns true when the queue was empty, i.e. the connection must be
    /// scheduled on its worker.
    pub fn enqueue(&mut self, oper: Operation) -> bool {
        let first = self.was_empty();
        self.queue.push_back(oper);
        first
    }

    /// Queue ahead of normal operations but behind earlier priority ones.
    pub fn enqueue_priority(&mut self, oper: Operation) -> bool {
        let first = self.was_empty();
        self.priority.push_back(oper);
        first
    }

    /// Queue ahead of everything, for emergency shutdown paths.
    pub fn enqueue_front(&mut self, oper: Operation) -> bool {
        let first = self.was_empty();
        self.priority.push_front(oper);
        first
    }

    /// Consume the preallocated backup slot to force an operation through
    /// when nothing else may be allocated.
    pub fn enqueue_backup(&mut self) -> bool {
        match self.backup.take() {
            Some(oper) => self.enqueue_front(oper),
            None => false,
        }
    }

    pub fn dequeue(&mut self) -> Option<Operation> {
        self.priority.pop_front().or_else(|| self.queue.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.was_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.priority.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_priority_lane() {
        let mut q = OperQueue::new(Operation::TraceRundown);
        assert!(q.enqueue(Operation::FlushRecv));
        assert!(!q.enqueue(Operation::FlushSend));
        assert!(!q.enqueue_priority(Operation::TimerExpired(TimerType::Idle)));
        assert_eq!(q.dequeue(), Some(Operation::TimerExpired(TimerType::Idle)));
        assert_eq!(q.dequeue(), Some(Operation::FlushRecv));
        assert_eq!(q.dequeue(), Some(Operation::FlushSend));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn front_enqueue_preempts_priority() {
        let mut q = OperQueue::new(Operation::TraceRundown);
        q.enqueue_priority(Operation::FlushSend);
        q.enqueue_front(Operation::FlushRecv);
        assert_eq!(q.dequeue(), Some(Operation::FlushRecv));
        assert_eq!(q.dequeue(), Some(Operation::FlushSend));
    }

    #[test]
    fn backup_fires_once() {
        let mut q = OperQueue::new(Operation::ApiCall(ApiCall::Shutdown {
            flags: 0,
            error_code: 0,
        }));
        assert!(q.enqueue_backup());
        assert!(!q.enqueue_backup());
        assert_matches!(q.dequeue(), Some(Operation::ApiCall(ApiCall::Shutdown { .. })));
    }

    #[test]
    fn first_enqueue_signals_scheduling() {
        let mut q = OperQueue::new(Operation::TraceRundown);
        assert!(q.enqueue(Operation::FlushRecv));
        q.dequeue();
        assert!(q.enqueue(Operation::FlushSend));
    }
}
