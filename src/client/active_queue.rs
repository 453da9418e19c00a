use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument, Span};

use crate::comms::message::Message;
use crate::util::wildcard::wildcard_match;

/// Callback of an active mail queue, called on the queue's own worker task one message at a
///  time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ActiveMailHandler: Send + Sync + 'static {
    async fn on_message(&self, msg: Message);
}

enum QueueItem {
    Mail(Message),
    Terminate,
}

pub struct ActiveMailQueue {
    name: String,
    sender: mpsc::UnboundedSender<QueueItem>,
    worker: JoinHandle<()>,
}

impl ActiveMailQueue {
    pub fn start(name: &str, handler: Arc<dyn ActiveMailHandler>) -> ActiveMailQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(name.to_string(), receiver, handler).instrument(Span::current()));
        ActiveMailQueue {
            name: name.to_string(),
            sender,
            worker,
        }
    }

    async fn run(name: String, mut receiver: mpsc::UnboundedReceiver<QueueItem>, handler: Arc<dyn ActiveMailHandler>) {
        while let Some(item) = receiver.recv().await {
            match item {
                QueueItem::Mail(msg) => handler.on_message(msg).await,
                QueueItem::Terminate => break,
            }
        }
        debug!(queue = %name, "active queue terminated");
    }

    /// false if the worker has terminated
    pub fn push(&self, msg: Message) -> bool {
        self.sender.send(QueueItem::Mail(msg)).is_ok()
    }

    /// Mail pushed before this is still handled
    pub fn stop(&self) {
        debug!(queue = %self.name, "stopping active queue");
        let _ = self.sender.send(QueueItem::Terminate);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

/// Wildcard match results are cached for at most this many distinct keys. Beyond that the
///  cache starts over, which only costs re-matching.
const MAX_CHECKED_KEYS: usize = 10_000;

/// Decides which active queues claim an incoming message. Routes are looked up by exact key;
///  wildcard queue patterns are matched once per key and the result is cached in the route
///  table.
#[derive(Default)]
pub struct ActiveQueueRouter {
    queues: FxHashMap<String, ActiveMailQueue>,
    routes: FxHashMap<String, BTreeSet<String>>,
    /// (pattern, queue name)
    wildcard_queues: Vec<(String, String)>,
    /// keys already matched against all wildcard patterns
    checked_keys: FxHashSet<String>,
}

impl ActiveQueueRouter {
    pub fn new() -> ActiveQueueRouter {
        Default::default()
    }

    /// false if a queue of that name already exists
    pub fn add_queue(&mut self, name: &str, handler: Arc<dyn ActiveMailHandler>) -> bool {
        if self.queues.contains_key(name) {
            return false;
        }
        self.queues.insert(name.to_string(), ActiveMailQueue::start(name, handler));
        true
    }

    /// A queue that claims every message whose key matches `pattern`
    pub fn add_wildcard_queue(&mut self, name: &str, pattern: &str, handler: Arc<dyn ActiveMailHandler>) -> bool {
        if !self.add_queue(name, handler) {
            return false;
        }
        self.wildcard_queues.push((pattern.to_string(), name.to_string()));
        self.checked_keys.clear();
        true
    }

    /// false if there is no queue of that name
    pub fn add_route(&mut self, key: &str, queue: &str) -> bool {
        if !self.queues.contains_key(queue) {
            warn!(key, queue, "no active queue of that name - not adding route");
            return false;
        }
        self.routes.entry(key.to_string())
            .or_default()
            .insert(queue.to_string());
        true
    }

    pub fn remove_route(&mut self, key: &str, queue: &str) -> bool {
        let Some(queues) = self.routes.get_mut(key) else {
            return false;
        };
        let removed = queues.remove(queue);
        if queues.is_empty() {
            self.routes.remove(key);
        }
        removed
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn has_route(&self, key: &str) -> bool {
        self.routes.get(key).map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub fn remove_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.queues.remove(name) else {
            return false;
        };
        queue.stop();

        for queues in self.routes.values_mut() {
            queues.remove(name);
        }
        self.routes.retain(|_, queues| !queues.is_empty());
        self.wildcard_queues.retain(|(_, q)| q != name);
        true
    }

    /// Hands each message to every queue routed for its key, and returns the messages no queue
    ///  claimed
    pub fn route(&mut self, messages: Vec<Message>) -> Vec<Message> {
        if self.queues.is_empty() {
            return messages;
        }

        let mut unclaimed = Vec::new();
        for msg in messages {
            self.match_wildcards(&msg.key);

            let Some(targets) = self.routes.get(&msg.key) else {
                unclaimed.push(msg);
                continue;
            };

            let mut claimed = false;
            for queue_name in targets {
                if let Some(queue) = self.queues.get(queue_name) {
                    claimed |= queue.push(msg.clone());
                }
            }
            if !claimed {
                unclaimed.push(msg);
            }
        }
        unclaimed
    }

    fn match_wildcards(&mut self, key: &str) {
        if self.wildcard_queues.is_empty() || self.checked_keys.contains(key) {
            return;
        }
        if self.checked_keys.len() >= MAX_CHECKED_KEYS {
            debug!(num_keys = self.checked_keys.len(), "resetting wildcard match cache");
            self.checked_keys.clear();
        }
        for (pattern, queue) in &self.wildcard_queues {
            if wildcard_match(pattern, key) {
                self.routes.entry(key.to_string())
                    .or_default()
                    .insert(queue.clone());
            }
        }
        self.checked_keys.insert(key.to_string());
    }

    pub fn stop_all(&mut self) {
        for queue in self.queues.values() {
            queue.stop();
        }
        self.queues.clear();
        self.routes.clear();
        self.wildcard_queues.clear();
        self.checked_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::time;

    use crate::comms::message::MessageType;
    use super::*;

    fn msg(key: &str) -> Message {
        Message::new_double(MessageType::Notify, key, 1.0, 0.0)
    }

    /// a handler that records the keys it was called with
    fn recording_handler() -> (Arc<dyn ActiveMailHandler>, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut handler = MockActiveMailHandler::new();
        let recorder = received.clone();
        handler.expect_on_message()
            .returning(move |m| recorder.lock().unwrap().push(m.key));
        (Arc::new(handler), received)
    }

    /// waits for the workers to catch up, then returns what they got
    async fn received_after_delay(received: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        time::sleep(Duration::from_millis(50)).await;
        received.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_exact_route_claims_message() {
        let mut router = ActiveQueueRouter::new();
        let (handler, received) = recording_handler();
        assert!(router.add_queue("q", handler));
        assert!(router.add_route("X", "q"));

        let unclaimed = router.route(vec![msg("X"), msg("Y")]);
        assert_eq!(unclaimed.iter().map(|m| m.key.as_str()).collect::<Vec<_>>(), vec!["Y"]);

        assert_eq!(received_after_delay(&received).await, vec!["X"]);
        router.stop_all();
    }

    #[tokio::test]
    async fn test_queue_without_matching_mail_stays_idle() {
        let mut router = ActiveQueueRouter::new();
        let (handler, received) = recording_handler();
        assert!(router.add_queue("q", handler));
        assert!(router.add_route("X", "q"));

        assert_eq!(router.route(vec![msg("Y"), msg("XX")]).len(), 2);

        assert!(received_after_delay(&received).await.is_empty());
        router.stop_all();
    }

    #[tokio::test]
    async fn test_route_to_unknown_queue_is_rejected() {
        let mut router = ActiveQueueRouter::new();
        assert!(!router.add_route("X", "nope"));
        assert!(!router.has_route("X"));
    }

    #[tokio::test]
    async fn test_duplicate_queue_name() {
        let mut router = ActiveQueueRouter::new();
        assert!(router.add_queue("q", recording_handler().0));
        assert!(!router.add_queue("q", recording_handler().0));
    }

    #[tokio::test]
    async fn test_wildcard_queue() {
        let mut router = ActiveQueueRouter::new();
        let (handler, received) = recording_handler();
        assert!(router.add_wildcard_queue("nav", "NAV_*", handler));

        let unclaimed = router.route(vec![msg("NAV_X"), msg("NAV_Y"), msg("DEPTH"), msg("NAV_X")]);
        assert_eq!(unclaimed.len(), 1);
        assert!(router.has_route("NAV_X"));
        assert!(!router.has_route("DEPTH"));

        assert_eq!(received_after_delay(&received).await, vec!["NAV_X", "NAV_Y", "NAV_X"]);
        router.stop_all();
    }

    #[tokio::test]
    async fn test_new_wildcard_queue_rechecks_cached_keys() {
        let mut router = ActiveQueueRouter::new();
        let (handler_a, received_a) = recording_handler();
        let (handler_b, received_b) = recording_handler();
        assert!(router.add_wildcard_queue("a", "A*", handler_a));
        assert_eq!(router.route(vec![msg("BX")]).len(), 1);

        assert!(router.add_wildcard_queue("b", "B*", handler_b));
        assert!(router.route(vec![msg("BX")]).is_empty());

        assert_eq!(received_after_delay(&received_b).await, vec!["BX"]);
        assert!(received_a.lock().unwrap().is_empty());
        router.stop_all();
    }

    #[tokio::test]
    async fn test_wildcard_cache_is_bounded() {
        let mut router = ActiveQueueRouter::new();
        let (handler, received) = recording_handler();
        assert!(router.add_wildcard_queue("nav", "NAV_*", handler));
        router.route(vec![msg("NAV_X")]);

        let unmatched = (0..MAX_CHECKED_KEYS + 10)
            .map(|i| msg(&format!("KEY_{}", i)))
            .collect::<Vec<_>>();
        assert_eq!(router.route(unmatched).len(), MAX_CHECKED_KEYS + 10);
        assert!(router.checked_keys.len() <= MAX_CHECKED_KEYS);

        // routes found before the reset survive it, new keys are still matched
        assert!(router.route(vec![msg("NAV_X"), msg("NAV_Y")]).is_empty());
        assert_eq!(received_after_delay(&received).await, vec!["NAV_X", "NAV_X", "NAV_Y"]);
        router.stop_all();
    }

    #[tokio::test]
    async fn test_message_goes_to_every_routed_queue() {
        let mut router = ActiveQueueRouter::new();
        let (handler_1, received_1) = recording_handler();
        let (handler_2, received_2) = recording_handler();
        router.add_queue("q1", handler_1);
        router.add_queue("q2", handler_2);
        router.add_route("X", "q1");
        router.add_route("X", "q2");

        assert!(router.route(vec![msg("X")]).is_empty());

        assert_eq!(received_after_delay(&received_1).await, vec!["X"]);
        assert_eq!(*received_2.lock().unwrap(), vec!["X"]);
        router.stop_all();
    }

    #[tokio::test]
    async fn test_remove_queue() {
        let mut router = ActiveQueueRouter::new();
        let (handler, received) = recording_handler();
        router.add_queue("q", handler);
        router.add_route("X", "q");

        assert!(router.remove_queue("q"));
        assert!(!router.has_queue("q"));
        assert!(!router.has_route("X"));
        assert_eq!(router.route(vec![msg("X")]).len(), 1);
        assert!(received_after_delay(&received).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_stops_worker() {
        let (handler, received) = recording_handler();
        let queue = ActiveMailQueue::start("q", handler);
        assert!(queue.push(msg("X")));
        queue.stop();

        assert_eq!(received_after_delay(&received).await, vec!["X"]);
        assert!(queue.is_finished());
        assert!(!queue.push(msg("Y")));
    }
}
