use chrono::NaiveDate;
use serde_derive::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// The number drawn for the current lottery round.
pub const WINNING_NUMBER: u32 = 7574;

/// A single wager. Immutable once constructed from a wire bet.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: u32,
    pub birthdate: NaiveDate,
    pub number: u32,
}

/// Returns true when the bet matches the drawn number.
#[inline]
pub fn has_won(bet: &Bet) -> bool {
    bet.number == WINNING_NUMBER
}

/// Append-only persistent store, one JSON record per line. `store` and
/// `load_all` are serialized by an internal lock so every session can share
/// one instance.
pub struct BetStore {
    path: Mutex<PathBuf>,
}

impl BetStore {
    #[inline]
    pub fn new<P: AsRef<Path>>(path: P) -> BetStore {
        BetStore {
            path: Mutex::new(path.as_ref().to_path_buf()),
        }
    }

    /// Append the batch. The records are encoded upfront and written in a
    /// single call, so a failure never leaves a partial batch behind.
    pub fn store(&self, bets: &[Bet]) -> io::Result<()> {
        let path = self.lock();

        let mut records = Vec::new();
        for bet in bets {
            serde_json::to_writer(&mut records, bet)?;
            records.push(b'\n');
        }

        let mut file = OpenOptions::new().append(true).create(true).open(&*path)?;
        file.write_all(&records)?;
        file.flush()
    }

    /// Every bet ever stored, in insertion order. A store that was never
    /// written to is empty.
    pub fn load_all(&self) -> io::Result<Vec<Bet>> {
        let path = self.lock();

        let file = match File::open(&*path) {
            Ok(file) => file,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };

        let mut bets = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            bets.push(serde_json::from_str(&line)?);
        }

        Ok(bets)
    }

    #[inline]
    fn lock(&self) -> MutexGuard<PathBuf> {
        self.path.lock().expect("bet store lock poisoned")
    }
}
