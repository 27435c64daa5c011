use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::repository::{Repository, StoreError};
use crate::store::Tables;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay via length-prefix + CRC.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as `events`: write a temp file, fsync, rename over, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk, returning all valid events.
    /// Replay stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                break;
            }
            let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            if !read_frame_part(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, fsync once,
/// answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Durable repository: every write is group-committed to the WAL before it becomes
/// visible; opening replays the log.
pub struct WalRepository {
    tables: Tables,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Appends hold it shared; compaction holds it exclusively so no write slips
    /// between the snapshot and the rewrite.
    compaction_gate: RwLock<()>,
}

impl WalRepository {
    /// Replay `path` and start the writer task. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let tables = Tables::new();
        for event in &events {
            tables.apply_event(event);
        }
        info!(
            "replayed {} WAL events from {} ({} reservations)",
            events.len(),
            path.display(),
            tables.reservation_count()
        );

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            tables,
            wal_tx,
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    async fn append(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Closed("WAL writer shut down"))?;
        rx.await
            .map_err(|_| StoreError::Closed("WAL writer dropped response"))??;
        self.tables.apply_event(&event);
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.tables.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Closed("WAL writer shut down"))?;
        rx.await
            .map_err(|_| StoreError::Closed("WAL writer dropped response"))??;
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Repository for WalRepository {
    async fn put_court(&self, court: Court) -> Result<(), StoreError> {
        self.append(Event::CourtPut { court }).await
    }

    async fn put_extra(&self, extra: Extra) -> Result<(), StoreError> {
        self.append(Event::ExtraPut { extra }).await
    }

    async fn load_court(&self, id: Ulid) -> Result<Option<Court>, StoreError> {
        Ok(self.tables.court(&id))
    }

    async fn load_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, StoreError> {
        Ok(self.tables.extras(ids))
    }

    async fn persist_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.append(Event::ReservationPut {
            reservation: reservation.clone(),
        })
        .await
    }

    async fn load_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.tables.reservation(&id))
    }

    async fn active_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.tables.active_reservations())
    }

    async fn user_reservations(&self, user_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.tables.user_reservations(&user_id))
    }

    async fn persist_loyalty(&self, record: &LoyaltyRecord) -> Result<(), StoreError> {
        self.append(Event::LoyaltyPut { record: record.clone() }).await
    }

    async fn loyalty_accounts(&self) -> Result<Vec<LoyaltyRecord>, StoreError> {
        Ok(self.tables.loyalty_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn court_event(number: u32) -> Event {
        Event::CourtPut {
            court: Court {
                id: Ulid::new(),
                number,
                surface: Surface::Hard,
                has_lighting: true,
                rate_per_hour: Money::from_cents(2_500),
            },
        }
    }

    fn loyalty_event(user_id: Ulid, balance: u64) -> Event {
        Event::LoyaltyPut {
            record: LoyaltyRecord {
                user_id,
                balance,
                entries: Vec::new(),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![court_event(1), loyalty_event(Ulid::new(), 10)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = court_event(7);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // torn second entry
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = court_event(1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&court_event(2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let user = Ulid::new();
        let kept = loyalty_event(user, 30);
        let after = court_event(2);
        {
            let mut wal = Wal::open(&path).unwrap();
            for balance in 0..10 {
                wal.append(&loyalty_event(user, balance)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn repository_survives_reopen() {
        let path = tmp_path("repo_reopen.wal");
        let user = Ulid::new();
        {
            let repo = WalRepository::open(&path).unwrap();
            repo.persist_loyalty(&LoyaltyRecord {
                user_id: user,
                balance: 120,
                entries: Vec::new(),
            })
            .await
            .unwrap();
            assert_eq!(repo.appends_since_compact().await, 1);
        }
        let repo = WalRepository::open(&path).unwrap();
        let records = repo.loyalty_accounts().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].balance, 120);
    }

    #[tokio::test]
    async fn repository_compaction_keeps_latest_state() {
        let path = tmp_path("repo_compact.wal");
        let user = Ulid::new();
        {
            let repo = WalRepository::open(&path).unwrap();
            for balance in [10, 20, 30] {
                repo.persist_loyalty(&LoyaltyRecord {
                    user_id: user,
                    balance,
                    entries: Vec::new(),
                })
                .await
                .unwrap();
            }
            repo.compact().await.unwrap();
            assert_eq!(repo.appends_since_compact().await, 0);
        }
        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        let repo = WalRepository::open(&path).unwrap();
        assert_eq!(repo.loyalty_accounts().await.unwrap()[0].balance, 30);
    }
}
