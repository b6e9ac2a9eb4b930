use crate::bets::{has_won, Bet, BetStore};
use crate::logging;
use crate::AgencyId;
use hashbrown::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Per-session lifecycle state advertised through the monitor. Only the owning
/// session writes its own entry; the variant order follows the lifecycle and a
/// state never moves backwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Readiness {
    SendingBets,
    ReadyForLottery,
    WaitingForLottery,
    GotWinners,
}

/// One-shot event. Starts unsignaled, latches exactly once and never resets.
pub struct OneShotEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl OneShotEvent {
    fn new() -> OneShotEvent {
        OneShotEvent {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signaled = self.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.lock();
        while !*signaled {
            signaled = self.cond.wait(signaled).expect("event lock poisoned");
        }
    }

    /// Bounded wait; returns whether the event is signaled.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.lock();
        if !*signaled {
            let (guard, _) = self
                .cond
                .wait_timeout(signaled, timeout)
                .expect("event lock poisoned");
            signaled = guard;
        }
        *signaled
    }

    fn lock(&self) -> MutexGuard<bool> {
        self.signaled.lock().expect("event lock poisoned")
    }
}

struct Shared {
    readiness: HashMap<SocketAddr, Readiness>,
    agencies: HashMap<SocketAddr, AgencyId>,
    winners: HashMap<AgencyId, Vec<u32>>,
    executed: bool,
}

/// The single point of synchronization between sessions. All cross-session
/// state lives behind one lock; the completion event is the only primitive
/// sessions may block on, and it is signaled outside the lock so woken
/// sessions can immediately reacquire it.
pub struct LotteryMonitor {
    shared: Mutex<Shared>,
    complete: OneShotEvent,
    store: BetStore,
    log: logging::Logger,
}

impl LotteryMonitor {
    pub fn new(store: BetStore, log: &logging::Logger) -> LotteryMonitor {
        LotteryMonitor {
            shared: Mutex::new(Shared {
                readiness: HashMap::new(),
                agencies: HashMap::new(),
                winners: HashMap::new(),
                executed: false,
            }),
            complete: OneShotEvent::new(),
            store,
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn set_readiness(&self, endpoint: SocketAddr, state: Readiness) {
        self.lock().readiness.insert(endpoint, state);
    }

    #[inline]
    pub fn get_readiness(&self, endpoint: SocketAddr) -> Option<Readiness> {
        self.lock().readiness.get(&endpoint).copied()
    }

    /// Associate the endpoint with an agency. The first binding wins, later
    /// calls for the same endpoint are ignored.
    #[inline]
    pub fn bind_agency(&self, endpoint: SocketAddr, agency: AgencyId) {
        self.lock().agencies.entry(endpoint).or_insert(agency);
    }

    #[inline]
    pub fn agency_of(&self, endpoint: SocketAddr) -> Option<AgencyId> {
        self.lock().agencies.get(&endpoint).copied()
    }

    /// True once the expected number of endpoints has checked in and none of
    /// them is still sending bets.
    pub fn all_agencies_ready(&self, expected: usize) -> bool {
        let shared = self.lock();

        if shared.readiness.len() < expected {
            return false;
        }

        shared
            .readiness
            .values()
            .all(|&state| state != Readiness::SendingBets)
    }

    /// Persist a batch on behalf of a session.
    pub fn store_bets(&self, bets: &[Bet]) -> io::Result<()> {
        let _shared = self.lock();
        self.store.store(bets)
    }

    /// One-shot lottery execution. The first caller latches the flag, scans the
    /// store and groups the winners per agency in scan order; every other
    /// caller gets `false` without touching anything. Exactly one caller ever
    /// returns `true` per process lifetime.
    pub fn execute_lottery(&self) -> bool {
        {
            let mut shared = self.lock();

            if shared.executed {
                return false;
            }
            shared.executed = true;

            match self.store.load_all() {
                Ok(bets) => {
                    let total = bets.len();
                    for bet in bets.into_iter().filter(|bet| has_won(bet)) {
                        shared
                            .winners
                            .entry(bet.agency)
                            .or_insert_with(Vec::new)
                            .push(bet.document);
                    }
                    let winner_count: usize = shared.winners.values().map(Vec::len).sum();
                    logging::info!(self.log, "lottery executed";
                                   "context" => "lottery",
                                   "bets" => total,
                                   "winners" => winner_count);
                }
                Err(err) => {
                    // The latch stays set so the index, the flag and the event
                    // remain consistent; the round simply has no winners.
                    logging::error!(self.log, "bet scan failed, winners index left empty";
                                    "context" => "lottery",
                                    "error" => ?err);
                }
            }
        }

        self.complete.signal();
        true
    }

    /// Block until the lottery has completed. On return the winners index is
    /// fully readable.
    #[inline]
    pub fn wait_for_lottery(&self) {
        self.complete.wait();
    }

    /// Bounded variant used by sessions to interleave shutdown checks.
    #[inline]
    pub fn wait_for_lottery_timeout(&self, timeout: Duration) -> bool {
        self.complete.wait_timeout(timeout)
    }

    #[inline]
    pub fn lottery_done(&self) -> bool {
        self.lock().executed
    }

    /// Copy of the agency's winning documents, in scan order. Empty when the
    /// agency has no winners or the lottery has not run.
    pub fn winners_for(&self, agency: AgencyId) -> Vec<u32> {
        self.lock().winners.get(&agency).cloned().unwrap_or_default()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<Shared> {
        self.shared.lock().expect("monitor lock poisoned")
    }
}
