//! Host-driven API: NodeCore receives events from the host, returns actions.
//!
//! The host owns sockets, timers and the script engine. The core owns the peer
//! registry and the job ledger and decides what goes on the wire.

use crate::cookie::Cookie;
use crate::ledger::{
    ExecutionRequest, JobLedger, JobPayload, LedgerError, DEFAULT_MAX_RUNNING_JOBS,
    DEFAULT_OFFER_TIMEOUT_TICKS,
};
use crate::protocol::{JobKind, JobStatus, Message, PeerAddress};
use crate::reassembly::Progress;
use crate::registry::{addresses_equal, PeerId, PeerRecord, PeerRegistry};
use crate::wire::{self, DecodeError};

/// Settings the core needs about this node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address and listening port advertised in QueryJobResources and Hello.
    pub advertised: PeerAddress,
    pub max_running_jobs: usize,
    pub offer_timeout_ticks: u64,
}

impl NodeConfig {
    pub fn new(advertised: PeerAddress) -> Self {
        Self {
            advertised,
            max_running_jobs: DEFAULT_MAX_RUNNING_JOBS,
            offer_timeout_ticks: DEFAULT_OFFER_TIMEOUT_TICKS,
        }
    }
}

/// What to send on a new outbound connection after Hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectIntent {
    pub request_peers: bool,
    pub offer: Option<Cookie>,
}

/// Action for host to perform.
#[derive(Debug)]
pub enum OutboundAction<C> {
    /// Write encoded bytes to the peer's connection.
    SendMessage(PeerId, Vec<u8>),
    /// Open a connection, then report it with `on_connected` (or `on_connect_failed`).
    Connect {
        target: PeerAddress,
        intent: ConnectIntent,
    },
    /// Close a connection the core already dropped from its registry.
    Disconnect(C),
    /// A job this node originated has finished.
    JobFinished {
        cookie: Cookie,
        status: JobStatus,
        result: f64,
    },
}

/// Main coordinator. Host passes events; core returns actions.
pub struct NodeCore<C> {
    config: NodeConfig,
    registry: PeerRegistry<C>,
    ledger: JobLedger,
    tick_count: u64,
}

impl<C> NodeCore<C> {
    pub fn new(config: NodeConfig) -> Self {
        let ledger = JobLedger::new(config.max_running_jobs);
        Self {
            config,
            registry: PeerRegistry::new(),
            ledger,
            tick_count: 0,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry<C> {
        &self.registry
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    /// Connection handle for a peer, if it is still registered.
    pub fn connection(&self, peer: PeerId) -> Option<&C> {
        self.registry.get(peer).map(|r| &r.conn)
    }

    /// Inbound connection accepted. The peer's port is learnt from its Hello.
    pub fn on_accepted(&mut self, conn: C, address: &str) -> PeerId {
        let id = self.registry.add(conn, address);
        tracing::info!(peer = %id, addr = %address, "peer connected");
        id
    }

    /// Outbound connection established: say hello, then whatever the intent asks for.
    pub fn on_connected(
        &mut self,
        conn: C,
        target: &PeerAddress,
        intent: ConnectIntent,
    ) -> (PeerId, Vec<OutboundAction<C>>) {
        let id = self.registry.add(conn, target.address.as_str());
        self.registry.update_port(id, target.port);
        tracing::info!(peer = %id, addr = %target, "connected to peer");

        let mut actions = Vec::new();
        self.push_message(
            &mut actions,
            id,
            &Message::Hello {
                port: self.config.advertised.port,
            },
        );
        if intent.request_peers {
            self.push_message(&mut actions, id, &Message::GetPeers);
        }
        if let Some(cookie) = intent.offer {
            tracing::info!(peer = %id, cookie = %cookie.short(), "offering to take job");
            self.push_message(&mut actions, id, &Message::OfferJobResources { cookie });
        }
        (id, actions)
    }

    /// Outbound connection could not be opened.
    pub fn on_connect_failed(&mut self, target: &PeerAddress, intent: ConnectIntent) {
        tracing::warn!(addr = %target, "failed to connect to peer");
        if let Some(cookie) = intent.offer {
            self.ledger.release(&cookie);
        }
    }

    /// Connections closed by the host (hang-up or read error), handled as one batch.
    /// Partial messages on those connections are abandoned.
    pub fn on_closed(&mut self, peers: &[PeerId]) -> Vec<PeerRecord<C>> {
        let removed = self.registry.remove(peers);
        for r in &removed {
            tracing::info!(peer = %r.id, addr = %r.address, "peer closed the connection");
        }
        removed
    }

    /// Bytes read from a peer's connection. Completed messages are routed in order.
    /// A protocol violation drops the peer and returns `Disconnect` with its connection.
    pub fn on_data(&mut self, peer: PeerId, mut bytes: &[u8]) -> Vec<OutboundAction<C>> {
        let mut actions = Vec::new();
        while !bytes.is_empty() {
            let Some(record) = self.registry.get_mut(peer) else {
                tracing::debug!(peer = %peer, "data for unknown peer dropped");
                break;
            };
            match record.reassembler.feed(&mut bytes) {
                Ok(Progress::Complete(msg)) => self.on_message(peer, msg, &mut actions),
                Ok(Progress::WouldBlock) => break,
                Err(e) => {
                    self.drop_peer(peer, &e, &mut actions);
                    break;
                }
            }
        }
        actions
    }

    fn drop_peer(&mut self, peer: PeerId, err: &DecodeError, actions: &mut Vec<OutboundAction<C>>) {
        for r in self.registry.remove(&[peer]) {
            tracing::warn!(peer = %peer, addr = %r.address, error = %err, "protocol violation, dropping peer");
            actions.push(OutboundAction::Disconnect(r.conn));
        }
    }

    /// Route one decoded message.
    pub fn on_message(&mut self, from: PeerId, msg: Message, actions: &mut Vec<OutboundAction<C>>) {
        tracing::debug!(peer = %from, kind = %msg.kind(), "received message");
        match msg {
            Message::Hello { port } => {
                self.registry.update_port(from, port);
            }
            Message::GetPeers => {
                let peers = self.registry.known_addresses(Some(from));
                self.push_message(actions, from, &Message::PeerList { peers });
            }
            Message::PeerList { peers } => {
                for entry in peers {
                    self.discover(entry, actions);
                }
            }
            Message::QueryJobResources {
                kind,
                cookie,
                origin,
            } => self.on_query(from, kind, cookie, origin, actions),
            Message::OfferJobResources { cookie } => self.on_offer(from, cookie, actions),
            Message::Job {
                cookie,
                arg,
                source,
            } => self.on_job(from, cookie, JobPayload { source, arg }, actions),
            Message::JobResult {
                cookie,
                status,
                result,
            } => match self.ledger.record_result(&cookie, status, result) {
                Ok(()) => {
                    tracing::info!(cookie = %cookie.short(), %status, result, "job finished");
                    actions.push(OutboundAction::JobFinished {
                        cookie,
                        status,
                        result,
                    });
                }
                Err(e) => {
                    tracing::debug!(peer = %from, cookie = %cookie.short(), error = %e, "result ignored");
                }
            },
        }
    }

    fn is_self(&self, target: &PeerAddress) -> bool {
        target.port == self.config.advertised.port
            && addresses_equal(&target.address, &self.config.advertised.address)
    }

    fn discover(&mut self, entry: PeerAddress, actions: &mut Vec<OutboundAction<C>>) {
        if self.is_self(&entry) || self.registry.find(&entry.address, entry.port).is_some() {
            return;
        }
        let request_peers = rand::random::<bool>();
        tracing::debug!(addr = %entry, request_peers, "discovered new peer");
        actions.push(OutboundAction::Connect {
            target: entry,
            intent: ConnectIntent {
                request_peers,
                offer: None,
            },
        });
    }

    fn on_query(
        &mut self,
        from: PeerId,
        kind: JobKind,
        cookie: Cookie,
        origin: PeerAddress,
        actions: &mut Vec<OutboundAction<C>>,
    ) {
        if self.ledger.has_capacity() {
            if self.ledger.emitted(&cookie).is_some() || self.is_self(&origin) {
                return;
            }
            // Already offered for or running this job: no second offer.
            if self.ledger.received(&cookie).is_some() || self.ledger.is_reserved(&cookie) {
                return;
            }
            self.ledger.reserve(cookie, self.tick_count);
            match self.registry.find(&origin.address, origin.port) {
                Some(id) => {
                    tracing::info!(peer = %id, cookie = %cookie.short(), "offering to take job");
                    self.push_message(actions, id, &Message::OfferJobResources { cookie });
                }
                None => {
                    tracing::info!(addr = %origin, cookie = %cookie.short(), "connecting to job origin");
                    actions.push(OutboundAction::Connect {
                        target: origin,
                        intent: ConnectIntent {
                            request_peers: false,
                            offer: Some(cookie),
                        },
                    });
                }
            }
            return;
        }

        // At capacity: pass the query on to everyone but the sender.
        let query = Message::QueryJobResources {
            kind,
            cookie,
            origin,
        };
        let frame = match wire::encode(&query) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "cannot re-encode query");
                return;
            }
        };
        for id in self.registry.ids() {
            if id == from {
                continue;
            }
            tracing::debug!(peer = %id, cookie = %cookie.short(), "spreading query");
            actions.push(OutboundAction::SendMessage(id, frame.clone()));
        }
    }

    fn on_offer(&mut self, from: PeerId, cookie: Cookie, actions: &mut Vec<OutboundAction<C>>) {
        let payload = match self.ledger.accept_offer(&cookie, from) {
            Ok(p) => p.clone(),
            Err(LedgerError::AlreadyDispatched) => {
                tracing::debug!(peer = %from, cookie = %cookie.short(), "late offer ignored");
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %from, cookie = %cookie.short(), error = %e, "offer ignored");
                return;
            }
        };
        tracing::info!(peer = %from, cookie = %cookie.short(), "sending job to peer");
        self.push_message(
            actions,
            from,
            &Message::Job {
                cookie,
                arg: payload.arg,
                source: payload.source,
            },
        );
    }

    fn on_job(
        &mut self,
        from: PeerId,
        cookie: Cookie,
        payload: JobPayload,
        actions: &mut Vec<OutboundAction<C>>,
    ) {
        match self.ledger.take(cookie, from, payload) {
            Ok(()) => {
                tracing::info!(peer = %from, cookie = %cookie.short(), "job accepted");
            }
            Err(LedgerError::NoCapacity) => {
                tracing::warn!(peer = %from, cookie = %cookie.short(), "no capacity, rejecting job");
                self.push_message(
                    actions,
                    from,
                    &Message::JobResult {
                        cookie,
                        status: JobStatus::Rejected,
                        result: 0.0,
                    },
                );
            }
            Err(e) => {
                tracing::debug!(peer = %from, cookie = %cookie.short(), error = %e, "job ignored");
            }
        }
    }

    /// Originate a job: record it and ask every known peer for capacity.
    pub fn submit_job(&mut self, source: String, arg: f64) -> (Cookie, Vec<OutboundAction<C>>) {
        let cookie = Cookie::generate();
        self.ledger.emit(cookie, JobPayload { source, arg });
        tracing::info!(cookie = %cookie.short(), peers = self.registry.len(), "created job");

        let mut actions = Vec::new();
        if self.registry.is_empty() {
            tracing::warn!(cookie = %cookie.short(), "no peers to ask for resources");
        }
        let query = Message::QueryJobResources {
            kind: JobKind::Script,
            cookie,
            origin: self.config.advertised.clone(),
        };
        for id in self.registry.ids() {
            self.push_message(&mut actions, id, &query);
        }
        (cookie, actions)
    }

    /// Next job to hand to the script engine. None while one is executing.
    pub fn next_execution(&mut self) -> Option<ExecutionRequest> {
        let req = self.ledger.next_execution()?;
        tracing::info!(cookie = %req.cookie.short(), "running job");
        Some(req)
    }

    /// Script engine finished a job: send the result to the requester if it is still connected.
    pub fn on_execution_finished(
        &mut self,
        cookie: Cookie,
        status: JobStatus,
        result: f64,
    ) -> Vec<OutboundAction<C>> {
        let mut actions = Vec::new();
        let job = match self.ledger.finish_execution(&cookie) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(cookie = %cookie.short(), error = %e, "execution finished for unknown job");
                return actions;
            }
        };
        tracing::info!(cookie = %cookie.short(), %status, result, "job executed");
        if !self.registry.contains(job.requester) {
            tracing::warn!(
                peer = %job.requester,
                cookie = %cookie.short(),
                "requester gone, result not delivered"
            );
            return actions;
        }
        self.push_message(
            &mut actions,
            job.requester,
            &Message::JobResult {
                cookie,
                status,
                result,
            },
        );
        actions
    }

    /// Periodic tick: expire offers nobody answered.
    pub fn tick(&mut self) {
        self.tick_count = self.tick_count.saturating_add(1);
        let expired = self
            .ledger
            .expire_reservations(self.tick_count, self.config.offer_timeout_ticks);
        for cookie in expired {
            tracing::debug!(cookie = %cookie.short(), "offer expired");
        }
    }

    fn push_message(&self, actions: &mut Vec<OutboundAction<C>>, to: PeerId, msg: &Message) {
        match wire::encode(msg) {
            Ok(bytes) => actions.push(OutboundAction::SendMessage(to, bytes)),
            Err(e) => tracing::warn!(peer = %to, kind = %msg.kind(), error = %e, "cannot encode message"),
        }
    }
}
