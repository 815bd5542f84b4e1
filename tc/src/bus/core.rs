//! MessageBus - directional routing between cells
//!
//! The bus holds one mailbox per registered cell, peer-group memberships and
//! topic subscriptions behind a single lock, so concurrent senders never
//! interleave inside a recipient's tier. Cells learn about new mail through a
//! per-cell `Notify` and pull it with [`MessageBus::drain`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BusConfig;
use super::envelope::{Direction, Envelope, Payload};
use super::mailbox::Mailbox;
use crate::domain::{Budget, CellId, PeerGroupId};
use crate::error::KernelError;
use crate::events::{EventBus, KernelEvent};

/// Charges messaging cost to a sender's budget
pub trait CommunicationMeter: Send + Sync {
    fn meter(&self, unit: &CellId, cost: Budget, direction: Direction) -> Result<(), KernelError>;
}

/// Result of a send
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Every recipient has the envelope in its mailbox
    Delivered { recipients: Vec<CellId> },
    /// Delivered, but at least one recipient's backlog is above the high-water mark
    Queued { recipients: Vec<CellId>, backlog: usize },
    /// Some recipients were gone; a delivery-failure notice went back to the sender
    Undeliverable {
        delivered: Vec<CellId>,
        undeliverable: Vec<CellId>,
    },
    /// Nothing was delivered
    Rejected { reason: String },
}

impl SendOutcome {
    /// Whether at least one recipient got the envelope (or there was nobody to reach)
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn delivered_to(&self) -> &[CellId] {
        match self {
            Self::Delivered { recipients } | Self::Queued { recipients, .. } => recipients,
            Self::Undeliverable { delivered, .. } => delivered,
            Self::Rejected { .. } => &[],
        }
    }
}

/// Bus metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusMetrics {
    pub registered: usize,
    pub subscriptions: usize,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub queued_over_high_water: u64,
    pub undeliverable: u64,
    pub rejected: u64,
    pub rate_limit_violations: u64,

    /// Envelopes still queued when their owner deregistered, returned to sender
    pub bounced: u64,
}

/// Sliding window rate limiter for message sends
struct RateLimiter {
    counters: HashMap<CellId, VecDeque<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            counters: HashMap::new(),
            limit,
            window,
        }
    }

    fn check_and_record(&mut self, unit: &CellId) -> bool {
        let now = Instant::now();
        let counter = self.counters.entry(unit.clone()).or_default();

        while let Some(&timestamp) = counter.front() {
            if now.duration_since(timestamp) > self.window {
                counter.pop_front();
            } else {
                break;
            }
        }

        if counter.len() < self.limit {
            counter.push_back(now);
            true
        } else {
            false
        }
    }

    fn clear(&mut self, unit: &CellId) {
        self.counters.remove(unit);
    }
}

struct Member {
    mailbox: Mailbox,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

struct BusInner {
    members: HashMap<CellId, Member>,
    /// Outlives registration; cleared when the episode dissolves the group
    groups: HashMap<CellId, PeerGroupId>,
    subscriptions: HashMap<String, BTreeSet<CellId>>,
    rate_limiter: RateLimiter,
    metrics: BusMetrics,
}

/// Routes envelopes between registered cells
pub struct MessageBus {
    config: BusConfig,
    meter: Arc<dyn CommunicationMeter>,
    events: Arc<EventBus>,
    inner: Mutex<BusInner>,
}

/// Live registration; deregisters the cell when dropped
pub struct Registration {
    unit: CellId,
    wake: Arc<Notify>,
    bus: Arc<MessageBus>,
}

impl Registration {
    pub fn unit(&self) -> &CellId {
        &self.unit
    }

    /// Resolves once new mail arrives (or immediately if some arrived since the last wait)
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.bus.deregister(&self.unit);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("unit", &self.unit).finish()
    }
}

impl MessageBus {
    pub fn new(config: BusConfig, meter: Arc<dyn CommunicationMeter>, events: Arc<EventBus>) -> Self {
        debug!(?config, "MessageBus::new: called");
        let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, Duration::from_secs(1));
        Self {
            config,
            meter,
            events,
            inner: Mutex::new(BusInner {
                members: HashMap::new(),
                groups: HashMap::new(),
                subscriptions: HashMap::new(),
                rate_limiter,
                metrics: BusMetrics::default(),
            }),
        }
    }

    /// Give `unit` a mailbox. A downward abort will cancel `cancel`.
    pub fn register(
        self: &Arc<Self>,
        unit: &CellId,
        group: Option<PeerGroupId>,
        cancel: CancellationToken,
    ) -> Result<Registration, KernelError> {
        debug!(%unit, ?group, "MessageBus::register: called");
        let wake = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock();
            if inner.members.contains_key(unit) {
                return Err(KernelError::AdmissionRejected {
                    unit: unit.clone(),
                    reason: "already registered on the bus".to_string(),
                });
            }
            inner.members.insert(
                unit.clone(),
                Member {
                    mailbox: Mailbox::new(unit.clone()),
                    wake: wake.clone(),
                    cancel,
                },
            );
            if let Some(group) = group {
                inner.groups.insert(unit.clone(), group);
            }
        }
        info!(%unit, "Registered cell on bus");
        Ok(Registration {
            unit: unit.clone(),
            wake,
            bus: self.clone(),
        })
    }

    /// Remove `unit`'s mailbox and subscriptions; anything still queued is returned to its senders
    pub fn deregister(&self, unit: &CellId) {
        debug!(%unit, "MessageBus::deregister: called");
        let mut inner = self.inner.lock();
        let Some(mut member) = inner.members.remove(unit) else {
            return;
        };
        for subscribers in inner.subscriptions.values_mut() {
            subscribers.remove(unit);
        }
        inner.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        inner.rate_limiter.clear(unit);

        for envelope in member.mailbox.drain() {
            if matches!(envelope.payload(), Payload::DeliveryFailure { .. }) {
                continue;
            }
            let notice = Arc::new(Envelope::delivery_failure(
                &envelope,
                vec![unit.clone()],
                format!("{} terminated before reading it", unit),
            ));
            if let Some(sender) = inner.members.get_mut(envelope.sender())
                && sender.mailbox.push(notice).is_ok()
            {
                sender.wake.notify_one();
            }
            inner.metrics.bounced += 1;
        }
        info!(%unit, "Deregistered cell from bus");
    }

    /// Route an envelope according to its direction
    pub fn send(&self, envelope: Envelope) -> SendOutcome {
        debug!(
            sender = %envelope.sender(),
            direction = %envelope.direction(),
            kind = envelope.payload().kind(),
            "MessageBus::send: called"
        );
        let envelope = Arc::new(envelope);
        let outcome = self.route(&envelope);

        match &outcome {
            SendOutcome::Rejected { reason } => {
                warn!(sender = %envelope.sender(), kind = envelope.payload().kind(), %reason, "Send rejected");
            }
            _ => {
                if matches!(
                    envelope.payload(),
                    Payload::Progress { .. }
                        | Payload::Insight { .. }
                        | Payload::Escalate { .. }
                        | Payload::Blocked { .. }
                        | Payload::ConflictReport { .. }
                ) {
                    self.events.emit(KernelEvent::Message {
                        envelope: Box::new((*envelope).clone()),
                    });
                }
            }
        }
        outcome
    }

    fn route(&self, envelope: &Arc<Envelope>) -> SendOutcome {
        let mut inner = self.inner.lock();
        let sender = envelope.sender();

        if let Err(reason) = envelope.payload().validate(envelope.direction()) {
            inner.metrics.rejected += 1;
            return SendOutcome::Rejected { reason };
        }
        // Calls for help from a starving child are never throttled
        let distress = envelope.direction() == Direction::Upward
            && matches!(envelope.payload(), Payload::Escalate { .. } | Payload::Blocked { .. });
        let payer = envelope.payer();
        if !distress && !inner.rate_limiter.check_and_record(payer) {
            inner.metrics.rate_limit_violations += 1;
            inner.metrics.rejected += 1;
            return SendOutcome::Rejected {
                reason: format!("rate limit exceeded for {}", payer),
            };
        }

        let recipients = match resolve_recipients(&inner, envelope) {
            Ok(recipients) => recipients,
            Err(reason) => {
                inner.metrics.rejected += 1;
                return SendOutcome::Rejected { reason };
            }
        };
        if recipients.is_empty() {
            inner.metrics.messages_sent += 1;
            return SendOutcome::Delivered { recipients };
        }

        let cost = Budget::from_millis(self.config.message_cost.millis().saturating_mul(recipients.len() as u64));
        if let Err(e) = self.meter.meter(payer, cost, envelope.direction()) {
            inner.metrics.rejected += 1;
            return SendOutcome::Rejected { reason: e.to_string() };
        }
        inner.metrics.messages_sent += 1;

        let is_abort = matches!(envelope.payload(), Payload::Abort { .. });
        let mut delivered = Vec::with_capacity(recipients.len());
        let mut undeliverable = Vec::new();
        let mut max_backlog = 0;
        for recipient in recipients {
            match inner.members.get_mut(&recipient) {
                Some(member) => match member.mailbox.push(envelope.clone()) {
                    Ok(backlog) => {
                        max_backlog = max_backlog.max(backlog);
                        member.wake.notify_one();
                        if is_abort && envelope.direction() == Direction::Downward {
                            member.cancel.cancel();
                        }
                        delivered.push(recipient);
                    }
                    Err(reason) => {
                        warn!(%recipient, %reason, "Mailbox refused envelope");
                        undeliverable.push(recipient);
                    }
                },
                None => undeliverable.push(recipient),
            }
        }
        inner.metrics.messages_delivered += delivered.len() as u64;

        if !undeliverable.is_empty() {
            inner.metrics.undeliverable += undeliverable.len() as u64;
            if !matches!(envelope.payload(), Payload::DeliveryFailure { .. }) {
                let notice = Arc::new(Envelope::delivery_failure(
                    envelope,
                    undeliverable.clone(),
                    "recipient not registered".to_string(),
                ));
                if let Some(member) = inner.members.get_mut(sender)
                    && member.mailbox.push(notice).is_ok()
                {
                    member.wake.notify_one();
                }
            }
            warn!(%sender, ?undeliverable, "Envelope partly undeliverable");
            return SendOutcome::Undeliverable {
                delivered,
                undeliverable,
            };
        }

        if max_backlog > self.config.mailbox_high_water {
            inner.metrics.queued_over_high_water += 1;
            return SendOutcome::Queued {
                recipients: delivered,
                backlog: max_backlog,
            };
        }
        SendOutcome::Delivered { recipients: delivered }
    }

    /// Take everything queued for `unit` without blocking
    pub fn drain(&self, unit: &CellId) -> Vec<Arc<Envelope>> {
        let mut inner = self.inner.lock();
        match inner.members.get_mut(unit) {
            Some(member) => member.mailbox.drain(),
            None => Vec::new(),
        }
    }

    pub fn backlog(&self, unit: &CellId) -> usize {
        self.inner.lock().members.get(unit).map(|m| m.mailbox.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, unit: &CellId) -> bool {
        self.inner.lock().members.contains_key(unit)
    }

    pub fn subscribe(&self, unit: &CellId, topic: &str) -> Result<(), KernelError> {
        debug!(%unit, %topic, "MessageBus::subscribe: called");
        let mut inner = self.inner.lock();
        if !inner.members.contains_key(unit) {
            return Err(KernelError::UnknownUnit(unit.clone()));
        }
        inner.subscriptions.entry(topic.to_string()).or_default().insert(unit.clone());
        Ok(())
    }

    pub fn unsubscribe(&self, unit: &CellId, topic: &str) {
        debug!(%unit, %topic, "MessageBus::unsubscribe: called");
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscriptions.get_mut(topic) {
            subscribers.remove(unit);
            if subscribers.is_empty() {
                inner.subscriptions.remove(topic);
            }
        }
    }

    /// Registered members of `unit`'s peer group, excluding `unit`
    pub fn live_peers(&self, unit: &CellId) -> Vec<CellId> {
        let inner = self.inner.lock();
        let Some(group) = inner.groups.get(unit) else {
            return Vec::new();
        };
        let mut peers: Vec<CellId> = inner
            .groups
            .iter()
            .filter(|(id, g)| *g == group && *id != unit && inner.members.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Forget every membership of `group`
    pub fn dissolve_group(&self, group: PeerGroupId) {
        debug!(%group, "MessageBus::dissolve_group: called");
        self.inner.lock().groups.retain(|_, g| *g != group);
    }

    pub fn metrics(&self) -> BusMetrics {
        let inner = self.inner.lock();
        BusMetrics {
            registered: inner.members.len(),
            subscriptions: inner.subscriptions.values().map(BTreeSet::len).sum(),
            ..inner.metrics.clone()
        }
    }
}

fn resolve_recipients(inner: &BusInner, envelope: &Envelope) -> Result<Vec<CellId>, String> {
    let sender = envelope.sender();
    match envelope.direction() {
        Direction::Downward | Direction::Upward => {
            if envelope.recipients().is_empty() {
                return Err(format!("{} envelope has no recipient", envelope.direction()));
            }
            Ok(envelope.recipients().to_vec())
        }
        Direction::Lateral => {
            let group = inner
                .groups
                .get(sender)
                .ok_or_else(|| format!("{} belongs to no peer group", sender))?;
            if envelope.recipients().is_empty() {
                return Err("lateral envelope has no recipients".to_string());
            }
            for recipient in envelope.recipients() {
                if recipient == sender || inner.groups.get(recipient) != Some(group) {
                    return Err(format!("{} is not a peer of {}", recipient, sender));
                }
            }
            Ok(envelope.recipients().to_vec())
        }
        Direction::Broadcast => {
            let topic = envelope.topic().ok_or_else(|| "broadcast envelope has no topic".to_string())?;
            Ok(inner
                .subscriptions
                .get(topic)
                .map(|subscribers| subscribers.iter().filter(|id| *id != sender).cloned().collect())
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Admission, GovernorConfig, ResourceGovernor};
    use crate::collab::StaticPressure;
    use crate::domain::CorrelationId;

    struct Fixture {
        bus: Arc<MessageBus>,
        governor: Arc<ResourceGovernor>,
        events: Arc<EventBus>,
    }

    fn fixture(config: BusConfig) -> Fixture {
        let governor = Arc::new(ResourceGovernor::new(
            GovernorConfig::default(),
            Arc::new(StaticPressure::new(0.0)),
        ));
        let events = Arc::new(EventBus::new(64));
        let bus = Arc::new(MessageBus::new(config, governor.clone(), events.clone()));
        Fixture { bus, governor, events }
    }

    fn id(s: &str) -> CellId {
        CellId::from_string(s)
    }

    fn open(fx: &Fixture, unit: &str, parent: Option<&str>, units: f64) {
        let parent = parent.map(id);
        assert_eq!(
            fx.governor.admit(&id(unit), parent.as_ref(), Budget::from_units(units), 0),
            Admission::Admitted
        );
    }

    fn insight(text: &str) -> Payload {
        Payload::Insight { text: text.into() }
    }

    #[test]
    fn test_upward_delivery_and_drain() {
        let fx = fixture(BusConfig::default());
        open(&fx, "parent", None, 100.0);
        open(&fx, "child", Some("parent"), 20.0);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let _c = fx.bus.register(&id("child"), None, CancellationToken::new()).unwrap();

        let outcome = fx.bus.send(Envelope::upward(
            id("child"),
            id("parent"),
            Payload::Progress {
                fraction: 0.5,
                note: "halfway".into(),
            },
            CorrelationId::new(),
        ));
        assert_eq!(outcome, SendOutcome::Delivered { recipients: vec![id("parent")] });

        let drained = fx.bus.drain(&id("parent"));
        assert_eq!(drained.len(), 1);
        assert!(fx.bus.drain(&id("parent")).is_empty());

        let ledger = fx.governor.snapshot(&id("child")).unwrap();
        assert_eq!(ledger.communication_spent(), Budget::from_millis(50));
    }

    #[test]
    fn test_downward_abort_cancels_recipient() {
        let fx = fixture(BusConfig::default());
        open(&fx, "parent", None, 100.0);
        let token = CancellationToken::new();
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let _c = fx.bus.register(&id("child"), None, token.clone()).unwrap();

        let outcome = fx.bus.send(Envelope::downward(
            id("parent"),
            id("child"),
            Payload::Abort { reason: "deadline".into() },
            CorrelationId::new(),
        ));
        assert!(outcome.is_accepted());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_lateral_requires_shared_group() {
        let fx = fixture(BusConfig::default());
        open(&fx, "a", None, 10.0);
        let group = PeerGroupId::new();
        let _a = fx.bus.register(&id("a"), Some(group), CancellationToken::new()).unwrap();
        let _b = fx.bus.register(&id("b"), Some(group), CancellationToken::new()).unwrap();
        let _x = fx.bus.register(&id("x"), Some(PeerGroupId::new()), CancellationToken::new()).unwrap();

        let ok = fx.bus.send(Envelope::lateral(id("a"), vec![id("b")], insight("shared"), CorrelationId::new()));
        assert_eq!(ok.delivered_to(), &[id("b")]);

        let bad = fx.bus.send(Envelope::lateral(id("a"), vec![id("x")], insight("leak"), CorrelationId::new()));
        assert!(matches!(bad, SendOutcome::Rejected { .. }));
        assert!(fx.bus.drain(&id("x")).is_empty());
    }

    #[test]
    fn test_relay_is_charged_to_relaying_cell() {
        let config = BusConfig {
            message_cost: Budget::from_units(1.0),
            ..Default::default()
        };
        let fx = fixture(config);
        open(&fx, "parent", None, 100.0);
        open(&fx, "a", Some("parent"), 2.0);
        let group = PeerGroupId::new();
        let _a = fx.bus.register(&id("a"), Some(group), CancellationToken::new()).unwrap();
        let _b = fx.bus.register(&id("b"), Some(group), CancellationToken::new()).unwrap();

        let direct = fx.bus.send(Envelope::lateral(id("a"), vec![id("b")], insight("costly"), CorrelationId::new()));
        assert!(matches!(direct, SendOutcome::Rejected { .. }));

        let relayed = fx.bus.send(
            Envelope::lateral(id("a"), vec![id("b")], insight("relayed"), CorrelationId::new()).relayed_by(id("parent")),
        );
        assert_eq!(relayed.delivered_to(), &[id("b")]);
        assert_eq!(fx.governor.snapshot(&id("a")).unwrap().communication_spent(), Budget::ZERO);
        assert_eq!(
            fx.governor.snapshot(&id("parent")).unwrap().communication_spent(),
            Budget::from_units(1.0)
        );
        assert_eq!(fx.bus.drain(&id("b"))[0].sender(), &id("a"));
    }

    #[test]
    fn test_undeliverable_reported_and_returned() {
        let fx = fixture(BusConfig::default());
        open(&fx, "a", None, 10.0);
        let group = PeerGroupId::new();
        let _a = fx.bus.register(&id("a"), Some(group), CancellationToken::new()).unwrap();
        let b = fx.bus.register(&id("b"), Some(group), CancellationToken::new()).unwrap();
        let _c = fx.bus.register(&id("c"), Some(group), CancellationToken::new()).unwrap();
        drop(b);

        let outcome = fx.bus.send(Envelope::lateral(
            id("a"),
            vec![id("b"), id("c")],
            insight("late"),
            CorrelationId::new(),
        ));
        assert_eq!(
            outcome,
            SendOutcome::Undeliverable {
                delivered: vec![id("c")],
                undeliverable: vec![id("b")],
            }
        );

        let returned = fx.bus.drain(&id("a"));
        assert_eq!(returned.len(), 1);
        assert!(matches!(returned[0].payload(), Payload::DeliveryFailure { undeliverable, .. } if undeliverable == &vec![id("b")]));
    }

    #[test]
    fn test_broadcast_to_subscribers_except_sender() {
        let fx = fixture(BusConfig::default());
        open(&fx, "root", None, 10.0);
        let _r = fx.bus.register(&id("root"), None, CancellationToken::new()).unwrap();
        let _a = fx.bus.register(&id("a"), None, CancellationToken::new()).unwrap();
        let _b = fx.bus.register(&id("b"), None, CancellationToken::new()).unwrap();
        fx.bus.subscribe(&id("root"), "pressure").unwrap();
        fx.bus.subscribe(&id("a"), "pressure").unwrap();
        fx.bus.subscribe(&id("b"), "pressure").unwrap();
        fx.bus.unsubscribe(&id("b"), "pressure");

        let outcome = fx.bus.send(Envelope::broadcast(
            id("root"),
            "pressure",
            Payload::PressureWarning { pressure: 0.9 },
            CorrelationId::new(),
        ));
        assert_eq!(outcome.delivered_to(), &[id("a")]);
        assert!(fx.bus.drain(&id("b")).is_empty());
        assert!(fx.bus.subscribe(&id("ghost"), "pressure").is_err());
    }

    #[test]
    fn test_reserve_exhaustion_rejects_except_upward() {
        let config = BusConfig {
            message_cost: Budget::from_units(1.0),
            ..Default::default()
        };
        let fx = fixture(config);
        open(&fx, "parent", None, 100.0);
        open(&fx, "child", Some("parent"), 10.0);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let _c = fx.bus.register(&id("child"), None, CancellationToken::new()).unwrap();

        let up = || {
            Envelope::upward(
                id("child"),
                id("parent"),
                Payload::Escalate { reason: "stuck".into() },
                CorrelationId::new(),
            )
        };
        assert!(fx.bus.send(up()).is_accepted());
        assert!(fx.bus.send(up()).is_accepted());
        assert!(fx.bus.send(up()).is_accepted());

        fx.bus.subscribe(&id("parent"), "notes").unwrap();
        let broadcast = fx.bus.send(Envelope::broadcast(
            id("child"),
            "notes",
            insight("no reserve left"),
            CorrelationId::new(),
        ));
        assert!(matches!(broadcast, SendOutcome::Rejected { .. }));
    }

    #[test]
    fn test_queued_above_high_water() {
        let config = BusConfig {
            mailbox_high_water: 2,
            message_cost: Budget::ZERO,
            ..Default::default()
        };
        let fx = fixture(config);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let send = || fx.bus.send(Envelope::upward(id("child"), id("parent"), insight("n"), CorrelationId::new()));

        assert!(matches!(send(), SendOutcome::Delivered { .. }));
        assert!(matches!(send(), SendOutcome::Delivered { .. }));
        assert!(matches!(send(), SendOutcome::Queued { backlog: 3, .. }));
        assert_eq!(fx.bus.backlog(&id("parent")), 3);
    }

    #[test]
    fn test_rate_limit() {
        let config = BusConfig {
            rate_limit_per_sec: 2,
            message_cost: Budget::ZERO,
            ..Default::default()
        };
        let fx = fixture(config);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let send = || fx.bus.send(Envelope::upward(id("child"), id("parent"), insight("n"), CorrelationId::new()));

        assert!(send().is_accepted());
        assert!(send().is_accepted());
        assert!(!send().is_accepted());
        assert_eq!(fx.bus.metrics().rate_limit_violations, 1);
    }

    #[test]
    fn test_rate_limit_never_blocks_escalation() {
        let config = BusConfig {
            rate_limit_per_sec: 1,
            message_cost: Budget::ZERO,
            ..Default::default()
        };
        let fx = fixture(config);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let up = |payload| fx.bus.send(Envelope::upward(id("child"), id("parent"), payload, CorrelationId::new()));

        assert!(up(insight("first")).is_accepted());
        assert!(!up(insight("second")).is_accepted());
        assert!(matches!(
            up(Payload::Escalate { reason: "starving".into() }),
            SendOutcome::Delivered { .. }
        ));
        assert!(matches!(
            up(Payload::Blocked { reason: "no access".into() }),
            SendOutcome::Delivered { .. }
        ));
        assert_eq!(fx.bus.metrics().rate_limit_violations, 1);
        assert_eq!(fx.bus.drain(&id("parent")).len(), 3);
    }

    #[test]
    fn test_drop_registration_bounces_pending_mail() {
        let config = BusConfig {
            message_cost: Budget::ZERO,
            ..Default::default()
        };
        let fx = fixture(config);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();
        let child = fx.bus.register(&id("child"), None, CancellationToken::new()).unwrap();
        fx.bus.subscribe(&id("child"), "notes").unwrap();

        fx.bus.send(Envelope::downward(
            id("parent"),
            id("child"),
            Payload::Instruction { text: "also check Q4".into() },
            CorrelationId::new(),
        ));
        drop(child);

        assert!(!fx.bus.is_registered(&id("child")));
        let metrics = fx.bus.metrics();
        assert_eq!(metrics.bounced, 1);
        assert_eq!(metrics.subscriptions, 0);
        let returned = fx.bus.drain(&id("parent"));
        assert!(matches!(returned[0].payload(), Payload::DeliveryFailure { .. }));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let fx = fixture(BusConfig::default());
        let _a = fx.bus.register(&id("a"), None, CancellationToken::new()).unwrap();
        assert!(fx.bus.register(&id("a"), None, CancellationToken::new()).is_err());
    }

    #[test]
    fn test_live_peers_and_dissolve() {
        let fx = fixture(BusConfig::default());
        let group = PeerGroupId::new();
        let _a = fx.bus.register(&id("a"), Some(group), CancellationToken::new()).unwrap();
        let _b = fx.bus.register(&id("b"), Some(group), CancellationToken::new()).unwrap();
        let c = fx.bus.register(&id("c"), Some(group), CancellationToken::new()).unwrap();
        drop(c);

        assert_eq!(fx.bus.live_peers(&id("a")), vec![id("b")]);
        fx.bus.dissolve_group(group);
        assert!(fx.bus.live_peers(&id("a")).is_empty());
    }

    #[tokio::test]
    async fn test_mirrors_progress_to_events() {
        let fx = fixture(BusConfig::default());
        let mut rx = fx.events.subscribe();
        open(&fx, "child", None, 10.0);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();

        fx.bus.send(Envelope::upward(
            id("child"),
            id("parent"),
            Payload::Progress {
                fraction: 1.0,
                note: "done".into(),
            },
            CorrelationId::new(),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "message");
        assert_eq!(event.cell_id(), &id("child"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_keep_per_sender_order() {
        let config = BusConfig {
            message_cost: Budget::ZERO,
            rate_limit_per_sec: 10_000,
            mailbox_high_water: 10_000,
            ..Default::default()
        };
        let fx = fixture(config);
        let _p = fx.bus.register(&id("parent"), None, CancellationToken::new()).unwrap();

        let mut handles = Vec::new();
        for sender in 0..4 {
            let bus = fx.bus.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..100 {
                    let env = Envelope::upward(
                        id(&format!("child-{}", sender)),
                        id("parent"),
                        insight(&n.to_string()),
                        CorrelationId::new(),
                    );
                    assert!(bus.send(env).is_accepted());
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = fx.bus.drain(&id("parent"));
        assert_eq!(drained.len(), 400);
        let mut last: HashMap<CellId, i64> = HashMap::new();
        for env in drained {
            let Payload::Insight { text } = env.payload() else {
                panic!("unexpected payload");
            };
            let n: i64 = text.parse().unwrap();
            let prev = last.insert(env.sender().clone(), n).unwrap_or(-1);
            assert_eq!(n, prev + 1);
        }
    }
}
