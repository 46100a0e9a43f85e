//! Event loop: owns the node core and turns its actions into I/O.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use p2pjs_core::{ConnectIntent, Cookie, JobStatus, NodeConfig, NodeCore, OutboundAction, PeerAddress};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::commands::Command;
use crate::engine::{ExecutionOutcome, ScriptEngine};
use crate::transport::{self, Connection, EventSender, TransportEvent};

/// A job this node originated, as reported back to the operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobReport {
    pub cookie: Cookie,
    pub status: JobStatus,
    pub result: f64,
}

impl std::fmt::Display for JobReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.status.is_success() {
            write!(f, "job {} finished: {}", self.cookie.short(), self.result)
        } else {
            write!(f, "job {} failed: {}", self.cookie.short(), self.status)
        }
    }
}

pub struct Dispatcher {
    core: NodeCore<Connection>,
    engine: Arc<dyn ScriptEngine>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    done_tx: mpsc::UnboundedSender<(Cookie, ExecutionOutcome)>,
    done_rx: mpsc::UnboundedReceiver<(Cookie, ExecutionOutcome)>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
    executing: bool,
    tick_interval: Duration,
}

impl Dispatcher {
    pub fn new(config: NodeConfig, engine: Arc<dyn ScriptEngine>, tick_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            core: NodeCore::new(config),
            engine,
            events_tx,
            events_rx,
            commands: None,
            done_tx,
            done_rx,
            reports: None,
            executing: false,
            tick_interval,
        }
    }

    /// Take operator commands from `rx`.
    pub fn with_commands(mut self, rx: mpsc::UnboundedReceiver<Command>) -> Self {
        self.commands = Some(rx);
        self
    }

    /// Also send finished jobs to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<JobReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Dial a peer and ask it for its peers.
    pub fn connect_seed(&self, seed: PeerAddress) {
        tracing::info!(addr = %seed, "contacting first peer");
        transport::spawn_connect(
            seed,
            ConnectIntent {
                request_peers: true,
                offer: None,
            },
            self.events_tx.clone(),
        );
    }

    /// Serve until `shutdown` resolves or the operator quits.
    pub async fn run(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let accept = transport::spawn_listener(listener, self.events_tx.clone());
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    break;
                }
                Some(ev) = self.events_rx.recv() => self.on_transport(ev),
                cmd = next_command(&mut self.commands) => match cmd {
                    Some(Command::Quit) => {
                        tracing::info!("quit requested");
                        break;
                    }
                    Some(Command::SubmitJob { path, arg }) => self.submit(&path, arg).await,
                    None => self.commands = None,
                },
                Some((cookie, outcome)) = self.done_rx.recv() => {
                    self.executing = false;
                    let actions = self.core.on_execution_finished(cookie, outcome.status, outcome.result);
                    self.perform(actions);
                }
                _ = ticker.tick() => self.core.tick(),
            }
            self.start_execution();
        }
        accept.abort();
    }

    fn on_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Accepted { stream, addr } => {
                let (conn, ready) = transport::start(stream, self.events_tx.clone());
                let id = self.core.on_accepted(conn, &addr.ip().to_string());
                let _ = ready.send(id);
            }
            TransportEvent::Connected {
                stream,
                target,
                intent,
            } => {
                let (conn, ready) = transport::start(stream, self.events_tx.clone());
                let (id, actions) = self.core.on_connected(conn, &target, intent);
                let _ = ready.send(id);
                self.perform(actions);
            }
            TransportEvent::ConnectFailed { target, intent } => {
                self.core.on_connect_failed(&target, intent);
            }
            TransportEvent::Data { peer, bytes } => {
                let actions = self.core.on_data(peer, &bytes);
                self.perform(actions);
            }
            TransportEvent::Closed { peer } => {
                self.core.on_closed(&[peer]);
            }
        }
    }

    fn perform(&mut self, actions: Vec<OutboundAction<Connection>>) {
        for action in actions {
            match action {
                OutboundAction::SendMessage(peer, bytes) => match self.core.connection(peer) {
                    Some(conn) => {
                        if !conn.send(bytes) {
                            tracing::warn!(peer = %peer, "connection writer gone, message dropped");
                        }
                    }
                    None => tracing::warn!(peer = %peer, "peer gone, message dropped"),
                },
                OutboundAction::Connect { target, intent } => {
                    transport::spawn_connect(target, intent, self.events_tx.clone());
                }
                OutboundAction::Disconnect(conn) => drop(conn),
                OutboundAction::JobFinished {
                    cookie,
                    status,
                    result,
                } => {
                    let report = JobReport {
                        cookie,
                        status,
                        result,
                    };
                    println!("{}", report);
                    if let Some(tx) = &self.reports {
                        let _ = tx.send(report);
                    }
                }
            }
        }
    }

    async fn submit(&mut self, path: &std::path::Path, arg: f64) {
        let source = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) => {
                println!("cannot read {}: {}", path.display(), e);
                tracing::warn!(path = %path.display(), error = %e, "cannot read job script");
                return;
            }
        };
        let (cookie, actions) = self.core.submit_job(source, arg);
        println!("job {} submitted", cookie.short());
        self.perform(actions);
    }

    /// One execution at a time; its completion comes back on `done_rx`.
    fn start_execution(&mut self) {
        if self.executing {
            return;
        }
        let Some(req) = self.core.next_execution() else {
            return;
        };
        self.executing = true;
        let cookie = req.cookie;
        let run = self.engine.execute(req);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = run.await;
            let _ = done.send((cookie, outcome));
        });
    }
}

async fn next_command(rx: &mut Option<mpsc::UnboundedReceiver<Command>>) -> Option<Command> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionFuture;
    use p2pjs_core::ExecutionRequest;
    use std::io::Write;
    use std::net::Ipv4Addr;

    /// Returns the argument plus the source length.
    struct CountingEngine;

    impl ScriptEngine for CountingEngine {
        fn execute(&self, req: ExecutionRequest) -> ExecutionFuture {
            Box::pin(async move {
                ExecutionOutcome {
                    status: JobStatus::Success,
                    result: req.arg + req.source.len() as f64,
                }
            })
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }

    fn dispatcher(port: u16) -> Dispatcher {
        Dispatcher::new(
            NodeConfig::new(PeerAddress::new("127.0.0.1", port)),
            Arc::new(CountingEngine),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn job_travels_to_peer_and_back() {
        let (la, pa) = listener().await;
        let (lb, pb) = listener().await;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let a = dispatcher(pa).with_commands(cmd_rx).with_reports(report_tx);
        let b = dispatcher(pb);
        b.connect_seed(PeerAddress::new("127.0.0.1", pa));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let a_task = tokio::spawn(a.run(la, async {
            let _ = stop_rx.await;
        }));
        let b_task = tokio::spawn(b.run(lb, std::future::pending()));

        let mut script = tempfile::NamedTempFile::new().unwrap();
        write!(script, "12345").unwrap();

        // Resubmit until b has connected and the job comes back.
        let report = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                cmd_tx
                    .send(Command::SubmitJob {
                        path: script.path().to_path_buf(),
                        arg: 1.5,
                    })
                    .unwrap();
                if let Ok(Some(r)) =
                    tokio::time::timeout(Duration::from_millis(300), reports.recv()).await
                {
                    return r;
                }
            }
        })
        .await
        .expect("job result");
        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.result, 6.5);

        stop_tx.send(()).unwrap();
        a_task.await.unwrap();
        b_task.abort();
    }

    #[test]
    fn report_line_shows_result_or_failure() {
        let cookie = Cookie::from_nonce(1);
        let ok = JobReport {
            cookie,
            status: JobStatus::Success,
            result: 42.0,
        };
        assert_eq!(ok.to_string(), format!("job {} finished: 42", cookie.short()));
        let failed = JobReport {
            cookie,
            status: JobStatus::CompileError,
            result: 0.0,
        };
        assert_eq!(
            failed.to_string(),
            format!("job {} failed: compile error", cookie.short())
        );
    }

    #[tokio::test]
    async fn quit_command_stops_the_loop() {
        let (l, port) = listener().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let d = dispatcher(port).with_commands(cmd_rx);
        cmd_tx.send(Command::Quit).unwrap();
        tokio::time::timeout(Duration::from_secs(5), d.run(l, std::future::pending()))
            .await
            .expect("dispatcher stopped");
    }
}
