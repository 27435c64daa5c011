use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use courtside::clock::ManualClock;
use courtside::config::{EngineConfig, PaymentMode};
use courtside::engine::{BookingRequest, EngineError, ModifyRequest, ReservationEngine};
use courtside::model::*;
use courtside::notify::{Notification, NotifyHub};
use courtside::repository::Repository;
use courtside::wal::WalRepository;

const H: Ms = 3_600_000;
/// 2026-03-02T08:00:00Z
const NOW: Ms = 1_772_438_400_000;

fn wal_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

async fn open_engine(
    path: &std::path::Path,
    clock: Arc<ManualClock>,
    config: EngineConfig,
) -> (Arc<ReservationEngine>, Arc<WalRepository>, Arc<NotifyHub>) {
    let repo = Arc::new(WalRepository::open(path).unwrap());
    let notify = Arc::new(NotifyHub::new());
    let engine = ReservationEngine::start(repo.clone(), notify.clone(), clock, config)
        .await
        .unwrap();
    (engine, repo, notify)
}

fn court() -> Court {
    Court {
        id: Ulid::new(),
        number: 7,
        surface: Surface::Hard,
        has_lighting: true,
        rate_per_hour: Money::from_cents(3_000),
    }
}

#[tokio::test]
async fn booking_lifecycle_survives_restart() {
    let path = wal_path("lifecycle.wal");
    let clock = Arc::new(ManualClock::new(NOW));
    let court = court();
    let user = Ulid::new();

    let reservation = {
        let (engine, repo, notify) = open_engine(&path, clock.clone(), EngineConfig::default()).await;
        repo.put_court(court.clone()).await.unwrap();
        let mut all = notify.subscribe_all();

        let r = engine
            .create(BookingRequest {
                user_id: user,
                court_id: court.id,
                coach_id: None,
                range: TimeRange::new(NOW + 2 * H, NOW + 3 * H).unwrap(),
                extras: Vec::new(),
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(r.price.total, Money::from_units(30));

        let moved = engine
            .modify(
                r.id,
                ModifyRequest {
                    range: Some(TimeRange::new(NOW + 4 * H, NOW + 6 * H).unwrap()),
                    ..ModifyRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.price.total, Money::from_units(60));

        let n = all.recv().await.unwrap();
        assert!(matches!(n, Notification::ReservationConfirmed { .. }));
        let json: serde_json::Value = serde_json::from_str(&n.to_json()).unwrap();
        assert_eq!(json["kind"], "reservation_confirmed");
        assert_eq!(json["user_id"], user.to_string());

        repo.compact().await.unwrap();
        moved
    };

    // Reopen from the compacted log.
    clock.set(reservation.range.end());
    let (engine, _repo, _notify) = open_engine(&path, clock.clone(), EngineConfig::default()).await;
    assert_eq!(engine.get_reservation(reservation.id).await.unwrap(), reservation);

    let taken = engine
        .create(BookingRequest {
            user_id: Ulid::new(),
            court_id: court.id,
            coach_id: None,
            range: TimeRange::new(NOW + 5 * H, NOW + 7 * H).unwrap(),
            extras: Vec::new(),
            notes: None,
        })
        .await;
    // Start is now in the past for the moved clock.
    assert!(matches!(taken, Err(EngineError::StartInPast { .. })));

    assert_eq!(engine.complete_due().await.unwrap(), 1);
    let account = engine.loyalty_account(user).await;
    assert_eq!(account.balance, 60);
    assert_eq!(account.tier, Tier::Beginner);
}

#[tokio::test]
async fn unpaid_booking_expires() {
    let path = wal_path("expiry.wal");
    let clock = Arc::new(ManualClock::new(NOW));
    let config = EngineConfig {
        payment: PaymentMode::Deferred { hold_ms: 30 },
        ..EngineConfig::default()
    };
    let (engine, repo, notify) = open_engine(&path, clock, config).await;
    let court = court();
    repo.put_court(court.clone()).await.unwrap();
    let user = Ulid::new();
    let mut rx = notify.subscribe(user);

    let range = TimeRange::new(NOW + H, NOW + 2 * H).unwrap();
    let r = engine
        .create(BookingRequest {
            user_id: user,
            court_id: court.id,
            coach_id: None,
            range,
            extras: Vec::new(),
            notes: Some("pay at the desk".into()),
        })
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);

    let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        n,
        Notification::ReservationCancelled {
            reservation_id: r.id,
            user_id: user,
            court_id: court.id,
        }
    );
    let slots = engine.get_availability(court.id, range).await.unwrap();
    assert_eq!(slots, vec![AvailabilitySlot { range, state: SlotState::Free }]);
}
