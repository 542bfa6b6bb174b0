//! Message router and notification hub
//!
//! The dispatcher owns:
//! - a registry of attached agents, each with a bounded inbox
//! - a single routing worker draining an intake queue, which keeps delivery
//!   FIFO per sender/recipient pair
//! - pending request slots keyed by request id, completed by the RESULT whose
//!   `reply_to` matches, or failed when the recipient cannot take the request
//!
//! The routing worker never waits on an inbox. A REQUEST for a full or
//! closed inbox fails its pending slot with `InboxFull` or
//! `UnknownRecipient`, so one agent that stops reading cannot stall routing
//! for the others.
//! - the shared state-change notification queue
//!
//! Messages dispatched before [`Dispatcher::start`] are queued and delivered
//! once the worker runs. After [`Dispatcher::stop`] every dispatch fails with
//! `DispatchClosed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use troupe_core::{
    with_deadline, AgentId, AgentType, DispatcherConfig, Message, MessageKind, Result,
    TroupeConfig, TroupeError,
};
use uuid::Uuid;

use crate::notifications::{NotificationQueue, StateChangeReceiver, StateNotifier};

/// Wiring handed to an agent when it is attached
pub struct AgentChannels {
    pub inbox: mpsc::Receiver<Message>,
    pub notifier: StateNotifier,
    pub dispatcher: Dispatcher,
}

/// Anything the dispatcher can route messages to
pub trait Agent: Send {
    fn id(&self) -> &AgentId;
    fn agent_type(&self) -> AgentType;

    /// Receive inbox, notifier and dispatcher handle on attach
    fn connect(&mut self, channels: AgentChannels);
}

struct Registration {
    agent_type: AgentType,
    inbox: mpsc::Sender<Message>,
}

struct Inner {
    config: DispatcherConfig,
    request_timeout: Option<Duration>,
    registry: RwLock<HashMap<AgentId, Registration>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Message>>>>,
    intake: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    intake_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    notifications: Arc<NotificationQueue>,
    routed: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn registry(&self) -> RwLockReadGuard<'_, HashMap<AgentId, Registration>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<AgentId, Registration>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, message: Message) {
        self.routed.fetch_add(1, Ordering::Relaxed);

        if message.kind() == MessageKind::Result {
            if let Some(request_id) = message.reply_to() {
                let slot = lock(&self.pending).remove(&request_id);
                if let Some(slot) = slot {
                    debug!("Completing request {} from {}", request_id, message.from());
                    if slot.send(Ok(message)).is_err() {
                        debug!("Requester for {} went away before the reply", request_id);
                    }
                    return;
                }
            }
        }

        let inbox = self
            .registry()
            .get(message.to())
            .map(|r| r.inbox.clone());
        let Some(inbox) = inbox else {
            warn!(
                "Dropping message {} for {}: recipient detached",
                message.id(),
                message.to()
            );
            return;
        };

        debug!(
            "Routing {} {} -> {}",
            message.kind(),
            message.from(),
            message.to()
        );

        match message.kind() {
            // Nobody awaits this result; never let it stall routing
            MessageKind::Result => {
                if let Err(e) = inbox.try_send(message) {
                    warn!("Dropping unclaimed RESULT: {}", e);
                }
            }
            MessageKind::Request => match inbox.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    let recipient = message.to().to_string();
                    self.refuse(&message, TroupeError::InboxFull(recipient));
                }
                Err(TrySendError::Closed(message)) => {
                    let recipient = message.to().to_string();
                    self.refuse(&message, TroupeError::UnknownRecipient(recipient));
                }
            },
        }
    }

    /// Fail the requester waiting on `message`, if any
    fn refuse(&self, message: &Message, error: TroupeError) {
        warn!(
            "Refusing {} {} -> {}: {}",
            message.kind(),
            message.from(),
            message.to(),
            error
        );
        let slot = lock(&self.pending).remove(&message.id());
        if let Some(slot) = slot {
            if slot.send(Err(error)).is_err() {
                debug!("Requester for {} went away before the refusal", message.id());
            }
        }
    }

    /// Drop every pending slot so waiting requesters see `DispatchClosed`
    fn fail_pending(&self) {
        let mut pending = lock(&self.pending);
        if !pending.is_empty() {
            warn!("Dispatcher stopped with {} pending requests", pending.len());
        }
        pending.clear();
    }
}

async fn route_loop(inner: Arc<Inner>, mut intake: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = intake.recv().await {
        inner.deliver(message);
    }
    inner.fail_pending();
    debug!("Routing worker drained");
}

/// Removes a pending slot when the requester stops waiting
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: Uuid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

/// Process-scoped router; clones share the same registry and queues
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, request_timeout: Option<Duration>) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let notifications = NotificationQueue::new(config.notification_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                request_timeout,
                registry: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                intake: Mutex::new(Some(intake_tx)),
                intake_rx: Mutex::new(Some(intake_rx)),
                worker: Mutex::new(None),
                notifications,
                routed: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &TroupeConfig) -> Self {
        Self::new(config.dispatcher.clone(), config.agents.request_timeout())
    }

    /// Spawn the routing worker; calling it again while running is a no-op
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TroupeError::Canceled);
        }
        if self.is_closed() {
            return Err(TroupeError::DispatchClosed);
        }

        let Some(intake) = lock(&self.inner.intake_rx).take() else {
            debug!("Dispatcher already started");
            return Ok(());
        };
        let handle = tokio::spawn(route_loop(Arc::clone(&self.inner), intake));
        *lock(&self.inner.worker) = Some(handle);
        info!("Dispatcher started");
        Ok(())
    }

    /// Close intake and wait for queued messages to be routed
    ///
    /// If `cancel` fires first this returns `Canceled`; the worker keeps
    /// draining in the background and a later `stop` waits for it again.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        if lock(&self.inner.intake).take().is_some() {
            info!("Dispatcher stopping, intake closed");
        }

        let handle = lock(&self.inner.worker).take();
        match handle {
            Some(mut handle) => {
                tokio::select! {
                    biased;
                    joined = &mut handle => {
                        if let Err(e) = joined {
                            warn!("Routing worker ended abnormally: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => {
                        *lock(&self.inner.worker) = Some(handle);
                        return Err(TroupeError::Canceled);
                    }
                }
            }
            None => {
                // Never started: queued messages have nowhere to go
                if let Some(mut intake) = lock(&self.inner.intake_rx).take() {
                    intake.close();
                    let mut discarded = 0;
                    while intake.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        warn!("Discarded {} messages queued before start", discarded);
                    }
                }
                self.inner.fail_pending();
            }
        }

        self.inner.notifications.close();
        info!(
            "Dispatcher stopped after routing {} messages",
            self.inner.routed.load(Ordering::Relaxed)
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.worker).is_some()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.intake).is_none()
    }

    /// Register `agent` and hand it its channels
    ///
    /// Returns `false` without rewiring anything if the id is already attached.
    pub fn attach<A: Agent + ?Sized>(&self, agent: &mut A) -> Result<bool> {
        if self.is_closed() {
            return Err(TroupeError::DispatchClosed);
        }

        let inbox = {
            let mut registry = self.inner.registry_mut();
            if registry.contains_key(agent.id()) {
                debug!("Agent {} already attached", agent.id());
                return Ok(false);
            }
            let (tx, rx) = mpsc::channel(self.inner.config.inbox_capacity.max(1));
            registry.insert(
                agent.id().clone(),
                Registration {
                    agent_type: agent.agent_type(),
                    inbox: tx,
                },
            );
            rx
        };

        info!("Attached {} agent {}", agent.agent_type(), agent.id());
        agent.connect(AgentChannels {
            inbox,
            notifier: self.notifier(),
            dispatcher: self.clone(),
        });
        Ok(true)
    }

    /// Remove an agent; its inbox closes once drained
    pub fn detach(&self, agent_id: &AgentId) -> bool {
        let removed = self.inner.registry_mut().remove(agent_id).is_some();
        if removed {
            info!("Detached agent {}", agent_id);
        }
        removed
    }

    pub fn is_attached(&self, agent_id: &AgentId) -> bool {
        self.inner.registry().contains_key(agent_id)
    }

    pub fn attached(&self) -> Vec<(AgentId, AgentType)> {
        let mut agents: Vec<_> = self
            .inner
            .registry()
            .iter()
            .map(|(id, r)| (id.clone(), r.agent_type))
            .collect();
        agents.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        agents
    }

    /// Queue `message` for delivery to its recipient
    pub fn dispatch_message(&self, message: Message) -> Result<()> {
        let intake = lock(&self.inner.intake);
        let Some(intake) = intake.as_ref() else {
            return Err(TroupeError::DispatchClosed);
        };
        if !self.is_attached(message.to()) {
            return Err(TroupeError::UnknownRecipient(message.to().to_string()));
        }
        intake
            .send(message)
            .map_err(|_| TroupeError::DispatchClosed)
    }

    /// Send a REQUEST and wait for the RESULT that answers it
    ///
    /// The pending slot is released on every exit path: reply, cancellation,
    /// timeout, or dispatch failure.
    pub async fn request(&self, message: Message, cancel: &CancellationToken) -> Result<Message> {
        if message.kind() != MessageKind::Request {
            return Err(TroupeError::Protocol(format!(
                "request() needs a REQUEST, got {}",
                message.kind()
            )));
        }

        let id = message.id();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        let _slot = PendingSlot {
            inner: &self.inner,
            id,
        };

        debug!(
            "{} awaiting {:?} reply from {}",
            message.from(),
            message.request_type(),
            message.to()
        );
        self.dispatch_message(message)?;

        let reply = async { rx.await.unwrap_or_else(|_| Err(TroupeError::DispatchClosed)) };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TroupeError::Canceled),
            reply = with_deadline(self.inner.request_timeout, reply) => reply,
        }
    }

    /// Number of requests still awaiting a RESULT
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Handle onto the shared notification queue
    pub fn state_changes(&self) -> StateChangeReceiver {
        StateChangeReceiver::new(Arc::clone(&self.inner.notifications))
    }

    pub fn notifier(&self) -> StateNotifier {
        StateNotifier::new(Arc::clone(&self.inner.notifications))
    }

    pub fn notification_queue(&self) -> &Arc<NotificationQueue> {
        &self.inner.notifications
    }

    pub fn routed(&self) -> u64 {
        self.inner.routed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("attached", &self.inner.registry().len())
            .field("pending", &self.pending_requests())
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::{Request, ReviewDecision};

    struct FakeAgent {
        id: AgentId,
        channels: Option<AgentChannels>,
        connects: usize,
    }

    impl FakeAgent {
        fn new(id: &str) -> Self {
            Self {
                id: AgentId::new(id),
                channels: None,
                connects: 0,
            }
        }

        fn inbox(&mut self) -> &mut mpsc::Receiver<Message> {
            &mut self.channels.as_mut().unwrap().inbox
        }
    }

    impl Agent for FakeAgent {
        fn id(&self) -> &AgentId {
            &self.id
        }

        fn agent_type(&self) -> AgentType {
            AgentType::Architect
        }

        fn connect(&mut self, channels: AgentChannels) {
            self.connects += 1;
            self.channels = Some(channels);
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::default(), None)
    }

    fn merge_request(from: &str, to: &str, branch: &str) -> Message {
        Message::request(
            AgentId::new(from),
            AgentId::new(to),
            Request::Merge {
                branch: branch.to_string(),
                target_branch: "main".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let d = dispatcher();
        let mut agent = FakeAgent::new("architect");
        assert!(d.attach(&mut agent).unwrap());
        assert!(!d.attach(&mut agent).unwrap());
        assert_eq!(agent.connects, 1);
        assert_eq!(d.attached().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_synchronous() {
        let d = dispatcher();
        let err = d
            .dispatch_message(merge_request("coder-001", "nobody", "b"))
            .unwrap_err();
        assert!(matches!(err, TroupeError::UnknownRecipient(ref id) if id == "nobody"));
    }

    #[tokio::test]
    async fn test_dispatch_after_stop_is_closed() {
        let d = dispatcher();
        let mut agent = FakeAgent::new("architect");
        d.attach(&mut agent).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();
        d.stop(&cancel).await.unwrap();

        let err = d
            .dispatch_message(merge_request("coder-001", "architect", "b"))
            .unwrap_err();
        assert!(matches!(err, TroupeError::DispatchClosed));
        assert!(matches!(d.start(&cancel).await, Err(TroupeError::DispatchClosed)));
        assert!(d.stop(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_fifo_per_sender_and_drain_on_stop() {
        let d = dispatcher();
        let mut agent = FakeAgent::new("architect");
        d.attach(&mut agent).unwrap();

        // Queued before start, delivered once the worker runs
        for i in 0..10 {
            d.dispatch_message(merge_request("coder-001", "architect", &format!("b{}", i)))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();
        d.stop(&cancel).await.unwrap();

        let mut branches = Vec::new();
        while let Ok(message) = agent.inbox().try_recv() {
            branches.push(message.payload_str("branch").unwrap().to_string());
        }
        let expected: Vec<_> = (0..10).map(|i| format!("b{}", i)).collect();
        assert_eq!(branches, expected);
        assert_eq!(d.routed(), 10);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let d = dispatcher();
        let mut architect = FakeAgent::new("architect");
        let mut coder = FakeAgent::new("coder-001");
        d.attach(&mut architect).unwrap();
        d.attach(&mut coder).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();

        let responder = d.clone();
        let mut channels = architect.channels.take().unwrap();
        tokio::spawn(async move {
            let request = channels.inbox.recv().await.unwrap();
            let reply = Message::result(&request, &ReviewDecision::approved("ship it"));
            responder.dispatch_message(reply).unwrap();
        });

        let reply = d
            .request(merge_request("coder-001", "architect", "story-1"), &cancel)
            .await
            .unwrap();
        assert!(reply.decision().unwrap().is_approved());
        assert_eq!(d.pending_requests(), 0);
        d.stop(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_slot() {
        let d = dispatcher();
        let mut architect = FakeAgent::new("architect");
        d.attach(&mut architect).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();

        let request_cancel = CancellationToken::new();
        let waiter = {
            let d = d.clone();
            let token = request_cancel.clone();
            tokio::spawn(async move {
                d.request(merge_request("coder-001", "architect", "b"), &token)
                    .await
            })
        };

        // Wait until the request reached the architect
        let _ = architect.inbox().recv().await.unwrap();
        assert_eq!(d.pending_requests(), 1);
        request_cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(TroupeError::Canceled)));
        assert_eq!(d.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let d = Dispatcher::new(DispatcherConfig::default(), Some(Duration::from_secs(5)));
        let mut architect = FakeAgent::new("architect");
        d.attach(&mut architect).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();

        let result = d
            .request(merge_request("coder-001", "architect", "b"), &cancel)
            .await;
        assert!(matches!(result, Err(TroupeError::DeadlineExceeded(_))));
        assert_eq!(d.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_full_inbox_does_not_stall_routing() {
        let config = DispatcherConfig {
            inbox_capacity: 1,
            ..DispatcherConfig::default()
        };
        let d = Dispatcher::new(config, None);
        let mut stuck = FakeAgent::new("architect");
        let mut lively = FakeAgent::new("architect-2");
        d.attach(&mut stuck).unwrap();
        d.attach(&mut lively).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();

        // Takes the only slot of an inbox nobody reads
        d.dispatch_message(merge_request("coder-001", "architect", "b0"))
            .unwrap();
        let refused = d
            .request(merge_request("coder-001", "architect", "b1"), &cancel)
            .await;
        assert!(matches!(refused, Err(TroupeError::InboxFull(ref id)) if id == "architect"));
        assert_eq!(d.pending_requests(), 0);

        let responder = d.clone();
        let mut channels = lively.channels.take().unwrap();
        tokio::spawn(async move {
            let request = channels.inbox.recv().await.unwrap();
            let reply = Message::result(&request, &ReviewDecision::approved("ok"));
            responder.dispatch_message(reply).unwrap();
        });
        let reply = d
            .request(merge_request("coder-002", "architect-2", "b2"), &cancel)
            .await
            .unwrap();
        assert!(reply.decision().unwrap().is_approved());

        let queued = stuck.inbox().try_recv().unwrap();
        assert_eq!(queued.payload_str("branch"), Some("b0"));
        d.stop(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_to_unknown_recipient_releases_slot() {
        let d = dispatcher();
        let result = d
            .request(merge_request("coder-001", "nobody", "b"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TroupeError::UnknownRecipient(_))));
        assert_eq!(d.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_requests() {
        let d = dispatcher();
        let mut architect = FakeAgent::new("architect");
        d.attach(&mut architect).unwrap();
        let cancel = CancellationToken::new();
        d.start(&cancel).await.unwrap();

        let waiter = {
            let d = d.clone();
            tokio::spawn(async move {
                d.request(merge_request("coder-001", "architect", "b"), &CancellationToken::new())
                    .await
            })
        };
        let _ = architect.inbox().recv().await.unwrap();
        d.stop(&cancel).await.unwrap();

        assert!(matches!(waiter.await.unwrap(), Err(TroupeError::DispatchClosed)));
    }

    #[tokio::test]
    async fn test_state_changes_share_one_queue() {
        let d = dispatcher();
        let a = d.state_changes();
        let b = d.state_changes();
        assert!(a.same_queue(&b));
    }

    #[tokio::test]
    async fn test_detach_closes_inbox() {
        let d = dispatcher();
        let mut agent = FakeAgent::new("architect");
        d.attach(&mut agent).unwrap();
        assert!(d.detach(&AgentId::new("architect")));
        assert!(!d.detach(&AgentId::new("architect")));
        assert!(agent.inbox().recv().await.is_none());
        assert!(matches!(
            d.dispatch_message(merge_request("coder-001", "architect", "b")),
            Err(TroupeError::UnknownRecipient(_))
        ));
    }
}
