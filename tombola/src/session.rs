use crate::bets::Bet;
use crate::logging;
use crate::monitor::{LotteryMonitor, Readiness};
use crate::net::message::{Message, WireBet, FAILURE_COULD_NOT_PROCESS_BET, FAILURE_UNKNOWN_MESSAGE};
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::{FramedStream, Transport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What the session loop should do after one message has been handled.
#[derive(Debug, Eq, PartialEq)]
enum Disposition {
    Continue,
    SafeToEnd,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    Completed,
    Disconnected,
    Shutdown,
    ProtocolError(ErrorType),
    TransportError(NetworkError),
    InternalError(&'static str),
}

/// Server side worker bound to one accepted connection. Owns the connection
/// and drives the agency through its lifecycle; all shared state goes through
/// the monitor.
pub struct Session {
    transport: FramedStream,
    peer: SocketAddr,
    monitor: Arc<LotteryMonitor>,
    expected_agencies: usize,
    shutdown: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Session {
    pub fn new(
        transport: FramedStream,
        monitor: Arc<LotteryMonitor>,
        expected_agencies: usize,
        shutdown: Arc<AtomicBool>,
        log: &logging::Logger,
    ) -> Session {
        let peer = transport.peer_endpoint();

        Session {
            transport,
            peer,
            monitor,
            expected_agencies,
            shutdown,
            log: log.new(logging::o!()),
        }
    }

    /// Drive the connection until the client is done, fails or the server
    /// shuts down. Always closes the connection on the way out.
    pub fn run(mut self) {
        logging::debug!(self.log, "session started"; "context" => "session", "peer" => %self.peer);

        match self.serve() {
            SessionEnd::Completed => {
                logging::debug!(self.log, "session completed"; "context" => "session", "peer" => %self.peer)
            }
            SessionEnd::Disconnected => {
                logging::debug!(self.log, "peer disconnected"; "context" => "session", "peer" => %self.peer)
            }
            SessionEnd::Shutdown => {
                logging::debug!(self.log, "session stopped by shutdown"; "context" => "session", "peer" => %self.peer)
            }
            SessionEnd::ProtocolError(err) => {
                logging::warn!(self.log, "protocol error";
                               "context" => "session", "peer" => %self.peer, "error" => ?err)
            }
            SessionEnd::TransportError(err) => {
                logging::warn!(self.log, "transport error";
                               "context" => "session", "peer" => %self.peer, "error" => ?err)
            }
            SessionEnd::InternalError(what) => {
                logging::error!(self.log, "internal error";
                                "context" => "session", "peer" => %self.peer, "error" => what)
            }
        }

        self.transport.close();
    }

    fn serve(&mut self) -> SessionEnd {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return SessionEnd::Shutdown;
            }

            let message = match Message::read(&mut self.transport) {
                Ok(message) => message,
                Err(NetworkError::Disconnected) => return SessionEnd::Disconnected,
                Err(NetworkError::Fatal(ErrorType::UnknownMessage(id))) => {
                    // Best effort notice, the session stops either way.
                    drop(self.send(&Message::RegisterBetsFailed(FAILURE_UNKNOWN_MESSAGE)));
                    return SessionEnd::ProtocolError(ErrorType::UnknownMessage(id));
                }
                Err(NetworkError::Fatal(err)) => return SessionEnd::ProtocolError(err),
            };

            match self.handle(message) {
                Ok(Disposition::Continue) => (),
                Ok(Disposition::SafeToEnd) => return SessionEnd::Completed,
                Err(end) => return end,
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<Disposition, SessionEnd> {
        match message {
            Message::RegisterBets(bets) => self.handle_register_bets(bets),
            Message::AllBetsSent => self.handle_all_bets_sent(),
            Message::RequestWinners => self.handle_request_winners(),
            Message::Ack => self.handle_ack(),
            message => {
                // Server to client kinds have no business arriving here.
                let kind = message.kind();
                logging::warn!(self.log, "message not valid in this direction";
                               "context" => "dispatch", "peer" => %self.peer, "msg_type" => kind);
                drop(self.send(&Message::RegisterBetsFailed(FAILURE_UNKNOWN_MESSAGE)));
                Err(SessionEnd::ProtocolError(ErrorType::UnknownMessage(kind)))
            }
        }
    }

    fn handle_register_bets(&mut self, bets: Vec<WireBet>) -> Result<Disposition, SessionEnd> {
        self.advance_readiness(Readiness::SendingBets);

        if let Some(first) = bets.first() {
            self.monitor.bind_agency(self.peer, first.agency);
        }

        let count = bets.len();
        let converted: Option<Vec<Bet>> = bets.into_iter().map(WireBet::into_bet).collect();

        let stored = match converted {
            Some(batch) => match self.monitor.store_bets(&batch) {
                Ok(()) => true,
                Err(err) => {
                    logging::warn!(self.log, "storing batch failed";
                                   "context" => "register_bets",
                                   "peer" => %self.peer,
                                   "count" => count,
                                   "error" => ?err);
                    false
                }
            },
            None => {
                logging::warn!(self.log, "batch carried an unrepresentable birthdate";
                               "context" => "register_bets", "peer" => %self.peer, "count" => count);
                false
            }
        };

        if stored {
            logging::debug!(self.log, "batch stored";
                            "context" => "register_bets", "peer" => %self.peer, "count" => count);
            self.send(&Message::RegisterBetsOk)
                .map_err(SessionEnd::TransportError)?;
        } else {
            self.send(&Message::RegisterBetsFailed(FAILURE_COULD_NOT_PROCESS_BET))
                .map_err(SessionEnd::TransportError)?;
        }

        Ok(Disposition::Continue)
    }

    fn handle_all_bets_sent(&mut self) -> Result<Disposition, SessionEnd> {
        self.advance_readiness(Readiness::ReadyForLottery);
        logging::debug!(self.log, "agency finished sending"; "context" => "all_bets_sent", "peer" => %self.peer);

        if self.monitor.all_agencies_ready(self.expected_agencies) && self.monitor.execute_lottery()
        {
            // The executor also delivers to itself, for the case where its own
            // winners request arrived ahead of this message.
            self.send_winners_to_self()?;
        }

        // Safe to end only once this endpoint's winners went out; otherwise the
        // client still gets to ask for them on this connection.
        match self.monitor.get_readiness(self.peer) {
            Some(Readiness::GotWinners) => Ok(Disposition::SafeToEnd),
            _ => Ok(Disposition::Continue),
        }
    }

    fn handle_request_winners(&mut self) -> Result<Disposition, SessionEnd> {
        self.advance_readiness(Readiness::WaitingForLottery);

        if !self.monitor.lottery_done() {
            self.wait_for_lottery()?;
        }

        self.send_winners_to_self()?;

        Ok(Disposition::SafeToEnd)
    }

    /// Liveness probe: once the lottery has run there is nothing left to serve.
    /// Never answered, per the protocol.
    fn handle_ack(&mut self) -> Result<Disposition, SessionEnd> {
        match self.monitor.lottery_done() {
            true => Ok(Disposition::SafeToEnd),
            false => Ok(Disposition::Continue),
        }
    }

    /// Block until the lottery completes, interleaving the shutdown check
    /// between bounded waits.
    fn wait_for_lottery(&mut self) -> Result<(), SessionEnd> {
        logging::debug!(self.log, "waiting for lottery completion";
                        "context" => "request_winners", "peer" => %self.peer);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(SessionEnd::Shutdown);
            }
            if self.monitor.wait_for_lottery_timeout(BARRIER_POLL_INTERVAL) {
                break;
            }
        }

        if !self.monitor.lottery_done() {
            return Err(SessionEnd::InternalError(
                "completion event signaled before the lottery ran",
            ));
        }

        Ok(())
    }

    /// Deliver this endpoint's winners. Gated on the WaitingForLottery to
    /// GotWinners transition so concurrent delivery paths cannot double-send.
    fn send_winners_to_self(&mut self) -> Result<(), SessionEnd> {
        if self.monitor.get_readiness(self.peer) != Some(Readiness::WaitingForLottery) {
            return Ok(());
        }

        let winners = match self.monitor.agency_of(self.peer) {
            Some(agency) => self.monitor.winners_for(agency),
            None => {
                logging::warn!(self.log, "winners requested by an unbound endpoint";
                               "context" => "inform_winners", "peer" => %self.peer);
                Vec::new()
            }
        };

        logging::info!(self.log, "informing winners";
                       "context" => "inform_winners", "peer" => %self.peer, "count" => winners.len());

        self.send(&Message::InformWinners(winners))
            .map_err(SessionEnd::TransportError)?;
        self.advance_readiness(Readiness::GotWinners);

        Ok(())
    }

    /// Forward-only readiness write; the state for an endpoint never regresses.
    fn advance_readiness(&self, state: Readiness) {
        match self.monitor.get_readiness(self.peer) {
            Some(current) if current >= state => (),
            _ => self.monitor.set_readiness(self.peer, state),
        }
    }

    fn send(&mut self, message: &Message) -> NetworkResult<()> {
        let mut data = Vec::new();
        message.write(&mut data)?;
        self.transport.send(&data)
    }
}
