use crate::config::ServerConfig;
use crate::logging;
use crate::monitor::LotteryMonitor;
use crate::net::transport::FramedStream;
use crate::session::Session;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SESSION_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const SESSION_JOIN_POLL: Duration = Duration::from_millis(50);

/// Accepts agency connections and spawns one session worker per connection.
pub struct Server {
    listener: TcpListener,
    wake_addr: SocketAddr,
    monitor: Arc<LotteryMonitor>,
    expected_agencies: usize,
    shutdown: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<TcpStream>>>,
    log: logging::Logger,
}

/// Cloneable handle that triggers a graceful stop from another thread, such as
/// the signal watcher.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake_addr: SocketAddr,
    conns: Arc<Mutex<Vec<TcpStream>>>,
    log: logging::Logger,
}

impl Server {
    pub fn bind(
        config: &ServerConfig,
        monitor: Arc<LotteryMonitor>,
        log: &logging::Logger,
    ) -> io::Result<Server> {
        let listener = Self::listen(config.port, config.listen_backlog)?;

        let mut wake_addr = listener.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }

        logging::info!(log, "server listening";
                       "context" => "bind",
                       "address" => %wake_addr,
                       "backlog" => config.listen_backlog,
                       "agencies" => config.number_of_agencies);

        Ok(Server {
            listener,
            wake_addr,
            monitor,
            expected_agencies: config.number_of_agencies as usize,
            shutdown: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(Mutex::new(Vec::new())),
            log: log.new(logging::o!()),
        })
    }

    /// Bind with an explicit backlog; the std listener hardwires its own.
    fn listen(port: u16, backlog: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;

        let address: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&address.into())?;
        socket.listen(i32::from(backlog))?;

        Ok(socket.into())
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            wake_addr: self.wake_addr,
            conns: self.conns.clone(),
            log: self.log.new(logging::o!()),
        }
    }

    /// Accept until shut down, then drain the session workers.
    pub fn run(self) {
        let mut workers = Vec::new();

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    logging::warn!(self.log, "accept failed"; "context" => "accept", "error" => ?err);
                    continue;
                }
            };

            if self.shutdown.load(Ordering::SeqCst) {
                drop(stream);
                break;
            }

            logging::info!(self.log, "connection accepted"; "context" => "accept", "peer" => %peer);

            match self.spawn_session(stream, peer) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    logging::warn!(self.log, "session setup failed";
                                   "context" => "accept", "peer" => %peer, "error" => ?err)
                }
            }
        }

        logging::info!(self.log, "acceptor stopped"; "context" => "accept");
        self.drain(workers);
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<thread::JoinHandle<()>> {
        let transport = FramedStream::new(stream)?;

        self.conns
            .lock()
            .expect("connection registry lock poisoned")
            .push(transport.shutdown_clone()?);

        let session = Session::new(
            transport,
            self.monitor.clone(),
            self.expected_agencies,
            self.shutdown.clone(),
            &self.log,
        );

        thread::Builder::new()
            .name(format!("session-{}", peer))
            .spawn(move || session.run())
    }

    /// Join the workers within a bounded window; stragglers are left detached
    /// and reported.
    fn drain(&self, workers: Vec<thread::JoinHandle<()>>) {
        let deadline = Instant::now() + SESSION_JOIN_TIMEOUT;

        for worker in workers {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(SESSION_JOIN_POLL);
            }

            if worker.is_finished() {
                drop(worker.join());
            } else {
                logging::warn!(self.log, "session did not stop in time, detaching";
                               "context" => "shutdown",
                               "thread" => worker.thread().name().unwrap_or("session"));
            }
        }

        logging::info!(self.log, "sessions drained"; "context" => "shutdown");
    }
}

impl ShutdownHandle {
    /// Idempotent graceful stop: flips the flag, force-closes every session
    /// socket and wakes the acceptor out of its blocking accept.
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::info!(self.log, "shutdown requested"; "context" => "shutdown");

        for conn in self
            .conns
            .lock()
            .expect("connection registry lock poisoned")
            .iter()
        {
            drop(conn.shutdown(Shutdown::Both));
        }

        drop(TcpStream::connect(self.wake_addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bets::BetStore;
    use crate::net::message::{
        Message, WireBet, FAILURE_COULD_NOT_PROCESS_BET, FAILURE_UNKNOWN_MESSAGE,
    };
    use crate::net::shared::{NetworkError, NetworkResult};
    use crate::net::transport::Transport;
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    struct Harness {
        addr: SocketAddr,
        handle: ShutdownHandle,
        worker: thread::JoinHandle<()>,
        store_path: PathBuf,
    }

    impl Harness {
        fn start(agencies: u16) -> Harness {
            Self::start_with_store(agencies, temp_path("store"))
        }

        fn start_with_store(agencies: u16, store_path: PathBuf) -> Harness {
            let log = logging::discard();
            let monitor = Arc::new(LotteryMonitor::new(BetStore::new(&store_path), &log));

            let config = ServerConfig {
                port: 0,
                listen_backlog: 8,
                number_of_agencies: agencies,
                logging_level: "error".to_string(),
                storage_file: store_path.clone(),
            };

            let server = Server::bind(&config, monitor, &log).unwrap();
            let port = server.local_addr().unwrap().port();
            let handle = server.shutdown_handle();
            let worker = thread::spawn(move || server.run());

            Harness {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                handle,
                worker,
                store_path,
            }
        }

        fn stop(self) {
            self.handle.shutdown();
            self.worker.join().unwrap();
            drop(fs::remove_file(&self.store_path));
        }
    }

    struct Agency {
        transport: FramedStream,
    }

    impl Agency {
        fn connect(addr: SocketAddr) -> Agency {
            let stream = TcpStream::connect(addr).unwrap();
            Agency {
                transport: FramedStream::new(stream).unwrap(),
            }
        }

        fn send(&mut self, message: &Message) {
            let mut data = Vec::new();
            message.write(&mut data).unwrap();
            self.transport.send(&data).unwrap();
        }

        fn send_raw(&mut self, raw: &[u8]) {
            self.transport.send(raw).unwrap();
        }

        fn recv(&mut self) -> Message {
            Message::read(&mut self.transport).unwrap()
        }

        fn try_recv(&mut self) -> NetworkResult<Message> {
            Message::read(&mut self.transport)
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        env::temp_dir().join(format!(
            "tombola-server-{}-{}-{}.jsonl",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    fn make_wire_bet(agency: u32, dni: u32, number: u32) -> WireBet {
        WireBet {
            agency,
            name: "A".to_string(),
            surname: "B".to_string(),
            dni,
            birthdate: 0,
            number,
        }
    }

    #[test]
    fn test_two_agencies_happy_path() {
        let harness = Harness::start(2);

        let mut first = Agency::connect(harness.addr);
        first.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7777)]));
        assert_eq!(first.recv(), Message::RegisterBetsOk);
        first.send(&Message::AllBetsSent);
        // Blocks on the barrier until the other agency finishes.
        first.send(&Message::RequestWinners);

        let mut second = Agency::connect(harness.addr);
        second.send(&Message::RegisterBets(vec![make_wire_bet(2, 222, 7574)]));
        assert_eq!(second.recv(), Message::RegisterBetsOk);
        second.send(&Message::AllBetsSent);
        second.send(&Message::RequestWinners);

        assert_eq!(first.recv(), Message::InformWinners(Vec::new()));
        assert_eq!(second.recv(), Message::InformWinners(vec![222]));

        // Winners delivered, both sessions wind down.
        assert_eq!(first.try_recv().unwrap_err(), NetworkError::Disconnected);
        assert_eq!(second.try_recv().unwrap_err(), NetworkError::Disconnected);

        harness.stop();
    }

    #[test]
    fn test_winners_available_after_completion() {
        let harness = Harness::start(2);

        let mut first = Agency::connect(harness.addr);
        first.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7574)]));
        assert_eq!(first.recv(), Message::RegisterBetsOk);
        first.send(&Message::AllBetsSent);

        let mut second = Agency::connect(harness.addr);
        second.send(&Message::RegisterBets(vec![make_wire_bet(2, 222, 7777)]));
        assert_eq!(second.recv(), Message::RegisterBetsOk);
        second.send(&Message::AllBetsSent);

        // Both agencies are done, so the requests resolve without waiting.
        second.send(&Message::RequestWinners);
        assert_eq!(second.recv(), Message::InformWinners(Vec::new()));

        first.send(&Message::RequestWinners);
        assert_eq!(first.recv(), Message::InformWinners(vec![111]));

        harness.stop();
    }

    #[test]
    fn test_unknown_message_fails_session_and_spares_others() {
        let harness = Harness::start(2);

        let mut broken = Agency::connect(harness.addr);
        broken.send_raw(&[0, 99]);

        assert_eq!(
            broken.recv(),
            Message::RegisterBetsFailed(FAILURE_UNKNOWN_MESSAGE)
        );
        assert_eq!(broken.try_recv().unwrap_err(), NetworkError::Disconnected);

        // An unrelated session keeps working.
        let mut healthy = Agency::connect(harness.addr);
        healthy.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7777)]));
        assert_eq!(healthy.recv(), Message::RegisterBetsOk);

        harness.stop();
    }

    #[test]
    fn test_storage_failure_surfaces_and_retry_succeeds() {
        // Parent directory is created only after the first batch, so the
        // first store attempt fails and the retry lands.
        let store_dir = env::temp_dir().join(format!(
            "tombola-server-retry-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let store_path = store_dir.join("bets.jsonl");

        let harness = Harness::start_with_store(1, store_path.clone());

        let mut agency = Agency::connect(harness.addr);
        agency.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7574)]));
        assert_eq!(
            agency.recv(),
            Message::RegisterBetsFailed(FAILURE_COULD_NOT_PROCESS_BET)
        );

        fs::create_dir_all(&store_dir).unwrap();

        agency.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7574)]));
        assert_eq!(agency.recv(), Message::RegisterBetsOk);

        agency.send(&Message::AllBetsSent);
        agency.send(&Message::RequestWinners);

        // Only the retried batch made it into the draw.
        assert_eq!(agency.recv(), Message::InformWinners(vec![111]));

        harness.handle.shutdown();
        harness.worker.join().unwrap();
        drop(fs::remove_dir_all(&store_dir));
    }

    #[test]
    fn test_shutdown_wakes_session_blocked_on_barrier() {
        let harness = Harness::start(2);

        let mut agency = Agency::connect(harness.addr);
        agency.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7777)]));
        assert_eq!(agency.recv(), Message::RegisterBetsOk);
        agency.send(&Message::AllBetsSent);
        agency.send(&Message::RequestWinners);

        // Give the session time to park on the barrier, then stop the server.
        thread::sleep(Duration::from_millis(100));
        harness.handle.shutdown();

        // The session exits without delivering winners.
        assert_eq!(agency.try_recv().unwrap_err(), NetworkError::Disconnected);

        harness.worker.join().unwrap();
        drop(fs::remove_file(&harness.store_path));
    }

    #[test]
    fn test_ack_probe() {
        let harness = Harness::start(1);

        let mut agency = Agency::connect(harness.addr);
        agency.send(&Message::RegisterBets(vec![make_wire_bet(1, 111, 7777)]));
        assert_eq!(agency.recv(), Message::RegisterBetsOk);

        // Before the lottery an ack is ignored and the session keeps serving.
        agency.send(&Message::Ack);
        agency.send(&Message::RegisterBets(vec![make_wire_bet(1, 112, 7574)]));
        assert_eq!(agency.recv(), Message::RegisterBetsOk);

        agency.send(&Message::AllBetsSent);
        agency.send(&Message::RequestWinners);
        assert_eq!(agency.recv(), Message::InformWinners(vec![112]));

        harness.stop();
    }
}
