//! Multi-node scenarios over an in-memory network.
//!
//! Each node is a `NodeCore<usize>` whose connection handle is a link index;
//! the harness plays host for all of them and delivers actions until quiet.

use std::collections::VecDeque;

use p2pjs_core::ledger::EmittedState;
use p2pjs_core::{
    encode, ConnectIntent, Cookie, JobStatus, Message, NodeConfig, NodeCore, OutboundAction,
    PeerAddress, PeerId,
};

type End = (usize, PeerId);

struct Net {
    nodes: Vec<NodeCore<usize>>,
    addrs: Vec<PeerAddress>,
    links: Vec<Option<[End; 2]>>,
    queue: VecDeque<(usize, OutboundAction<usize>)>,
    finished: Vec<(usize, Cookie, JobStatus, f64)>,
    executed: Vec<(usize, Cookie)>,
    /// When false, received jobs stay queued.
    execute: bool,
}

impl Net {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            addrs: Vec::new(),
            links: Vec::new(),
            queue: VecDeque::new(),
            finished: Vec::new(),
            executed: Vec::new(),
            execute: true,
        }
    }

    fn add_node(&mut self, address: &str, port: u16, max_running_jobs: usize) -> usize {
        let advertised = PeerAddress::new(address, port);
        let mut config = NodeConfig::new(advertised.clone());
        config.max_running_jobs = max_running_jobs;
        self.nodes.push(NodeCore::new(config));
        self.addrs.push(advertised);
        self.nodes.len() - 1
    }

    fn connect(&mut self, from: usize, to: usize, intent: ConnectIntent) -> usize {
        let seen_as = self.addrs[from].address.clone();
        self.connect_as(from, to, intent, &seen_as)
    }

    /// Open a link; `seen_as` is the caller's address as the accepting side observes it.
    fn connect_as(&mut self, from: usize, to: usize, intent: ConnectIntent, seen_as: &str) -> usize {
        let link = self.links.len();
        self.links.push(None);
        let accepted = self.nodes[to].on_accepted(link, seen_as);
        let target = self.addrs[to].clone();
        let (dialer, actions) = self.nodes[from].on_connected(link, &target, intent);
        self.links[link] = Some([(from, dialer), (to, accepted)]);
        self.enqueue(from, actions);
        link
    }

    fn enqueue(&mut self, node: usize, actions: Vec<OutboundAction<usize>>) {
        for a in actions {
            self.queue.push_back((node, a));
        }
    }

    fn far_end(&self, node: usize, peer: PeerId) -> Option<End> {
        let link = *self.nodes[node].connection(peer)?;
        let ends = self.links[link]?;
        ends.into_iter().find(|&(n, p)| (n, p) != (node, peer))
    }

    fn close(&mut self, link: usize) {
        if let Some(ends) = self.links[link].take() {
            for (n, p) in ends {
                self.nodes[n].on_closed(&[p]);
            }
        }
    }

    fn deliver(&mut self) {
        while let Some((node, action)) = self.queue.pop_front() {
            match action {
                OutboundAction::SendMessage(peer, bytes) => {
                    let Some((to, at)) = self.far_end(node, peer) else {
                        continue;
                    };
                    let actions = self.nodes[to].on_data(at, &bytes);
                    self.enqueue(to, actions);
                }
                OutboundAction::Connect { target, intent } => {
                    match self.addrs.iter().position(|a| *a == target) {
                        Some(to) => {
                            self.connect(node, to, intent);
                        }
                        None => self.nodes[node].on_connect_failed(&target, intent),
                    }
                }
                OutboundAction::Disconnect(link) => self.close(link),
                OutboundAction::JobFinished {
                    cookie,
                    status,
                    result,
                } => self.finished.push((node, cookie, status, result)),
            }
        }
    }

    /// Fake engine: "double" returns twice the argument, anything else fails.
    fn run_jobs(&mut self) -> bool {
        let mut ran = false;
        for node in 0..self.nodes.len() {
            while let Some(req) = self.nodes[node].next_execution() {
                ran = true;
                self.executed.push((node, req.cookie));
                let (status, result) = match req.source.trim() {
                    "double" => (JobStatus::Success, req.arg * 2.0),
                    _ => (JobStatus::RuntimeError, 0.0),
                };
                let actions = self.nodes[node].on_execution_finished(req.cookie, status, result);
                self.enqueue(node, actions);
            }
        }
        ran
    }

    fn run(&mut self) {
        loop {
            self.deliver();
            if !self.execute || !self.run_jobs() {
                break;
            }
        }
    }

    fn submit(&mut self, node: usize, source: &str, arg: f64) -> Cookie {
        let (cookie, actions) = self.nodes[node].submit_job(source.into(), arg);
        self.enqueue(node, actions);
        cookie
    }

    fn peer_on(&self, node: usize, address: &PeerAddress) -> Option<PeerId> {
        self.nodes[node]
            .registry()
            .find(&address.address, address.port)
    }
}

fn quiet() -> ConnectIntent {
    ConnectIntent::default()
}

#[test]
fn job_runs_on_neighbour_and_result_returns() {
    let mut net = Net::new();
    let x = net.add_node("10.0.0.1", 2001, 4);
    let y = net.add_node("10.0.0.2", 2002, 4);
    net.connect(y, x, quiet());
    net.run();

    let cookie = net.submit(x, "double", 21.0);
    net.run();

    assert_eq!(net.executed, vec![(y, cookie)]);
    assert_eq!(net.finished, vec![(x, cookie, JobStatus::Success, 42.0)]);
    let job = net.nodes[x].ledger().emitted(&cookie).unwrap();
    assert_eq!(
        job.state,
        EmittedState::Finished {
            status: JobStatus::Success,
            result: 42.0
        }
    );
    assert_eq!(job.executor, net.peer_on(x, &net.addrs[y]));
    assert_eq!(net.nodes[y].ledger().running_count(), 0);
}

#[test]
fn runtime_failure_is_reported_back() {
    let mut net = Net::new();
    let x = net.add_node("10.0.0.1", 2001, 4);
    let y = net.add_node("10.0.0.2", 2002, 4);
    net.connect(y, x, quiet());
    net.run();

    let cookie = net.submit(x, "explode", 1.0);
    net.run();

    assert_eq!(net.finished, vec![(x, cookie, JobStatus::RuntimeError, 0.0)]);
}

#[test]
fn busy_relay_floods_and_far_node_connects_back() {
    let mut net = Net::new();
    let x = net.add_node("10.0.0.1", 2001, 4);
    let y = net.add_node("10.0.0.2", 2002, 0);
    let z = net.add_node("10.0.0.3", 2003, 4);
    net.connect(y, x, quiet());
    net.connect(z, y, quiet());
    net.run();
    assert!(net.peer_on(x, &net.addrs[z]).is_none());

    let cookie = net.submit(x, "double", 5.0);
    net.run();

    // Z opened a direct link to X and ran the job; Y never saw it.
    let z_on_x = net.peer_on(x, &net.addrs[z]).expect("z connected to x");
    assert_eq!(net.executed, vec![(z, cookie)]);
    assert!(net.nodes[y].ledger().received(&cookie).is_none());
    let job = net.nodes[x].ledger().emitted(&cookie).unwrap();
    assert_eq!(job.executor, Some(z_on_x));
    assert_eq!(net.finished, vec![(x, cookie, JobStatus::Success, 10.0)]);
}

#[test]
fn mapped_address_is_not_rediscovered() {
    let mut net = Net::new();
    let x = net.add_node("127.0.0.1", 2001, 4);
    let y = net.add_node("127.0.0.1", 2002, 4);
    let z = net.add_node("127.0.0.1", 2003, 4);
    net.connect_as(y, x, quiet(), "::ffff:127.0.0.1");
    net.connect(z, y, quiet());
    net.connect(z, x, quiet());
    net.run();
    let links = net.links.len();
    assert_eq!(net.nodes[x].registry().len(), 2);

    // Z lists Y as 127.0.0.1:2002; X already holds it as ::ffff:127.0.0.1:2002.
    let z_on_x = net.peer_on(x, &net.addrs[z]).unwrap();
    net.queue.push_back((
        x,
        OutboundAction::SendMessage(z_on_x, encode(&Message::GetPeers).unwrap()),
    ));
    net.run();

    assert_eq!(net.links.len(), links);
    assert_eq!(net.nodes[x].registry().len(), 2);
}

#[test]
fn only_first_offer_gets_the_job() {
    let mut net = Net::new();
    let x = net.add_node("10.0.0.1", 2001, 4);
    let y = net.add_node("10.0.0.2", 2002, 4);
    let z = net.add_node("10.0.0.3", 2003, 4);
    net.connect(y, x, quiet());
    net.connect(z, x, quiet());
    net.run();

    let cookie = net.submit(x, "double", 1.0);
    net.run();

    assert_eq!(net.executed, vec![(y, cookie)]);
    assert_eq!(net.finished.len(), 1);
    assert!(net.nodes[z].ledger().received(&cookie).is_none());
}

#[test]
fn result_for_departed_originator_is_dropped() {
    let mut net = Net::new();
    let x = net.add_node("10.0.0.1", 2001, 4);
    let y = net.add_node("10.0.0.2", 2002, 4);
    let link = net.connect(y, x, quiet());
    net.run();

    net.execute = false;
    let cookie = net.submit(x, "double", 3.0);
    net.run();
    assert_eq!(net.nodes[y].ledger().running_count(), 1);

    net.close(link);
    // Another peer takes the freed slot on Y before the job completes.
    let w = net.add_node("10.0.0.4", 2004, 4);
    net.connect(w, y, quiet());
    net.execute = true;
    net.run();

    assert_eq!(net.executed, vec![(y, cookie)]);
    assert!(net.finished.is_empty());
    assert_eq!(net.nodes[y].ledger().running_count(), 0);
    assert_eq!(
        net.nodes[x].ledger().emitted(&cookie).unwrap().state,
        EmittedState::Running
    );
}
