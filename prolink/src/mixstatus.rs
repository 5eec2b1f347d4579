//! Derives track and on-air transitions from a stream of device statuses.
//!
//! A device with a loaded track that is playing and on air is a candidate.
//! Candidates have to hold that state for the confirmation window before
//! they can become master, and when several qualify the one that became a
//! candidate first wins. A master that drops out keeps its role for the
//! grace window; a confirmed candidate appearing in that time takes over
//! directly, otherwise the master is reported as stopped.
//!
//! The engine never looks at the wall clock. Statuses carry their own
//! arrival time and timer expirations are applied through [`poll`] using
//! [`next_deadline`], which keeps the engine fully deterministic.
//!
//! [`poll`]: MixstatusEngine::poll
//! [`next_deadline`]: MixstatusEngine::next_deadline

use std::{collections::HashMap, time::Duration};

use log::{debug, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::status::DeviceStatus;

#[derive(Clone, Debug)]
pub struct MixstatusConfig {
    pub confirmation_window: Duration,
    pub grace_window: Duration,
    /// When false every device is treated as on air.
    pub use_on_air: bool,
}

impl Default for MixstatusConfig {
    fn default() -> Self {
        MixstatusConfig {
            confirmation_window: Duration::from_millis(400),
            grace_window: Duration::from_secs(2),
            use_on_air: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MixEvent {
    TrackLoaded { device_id: u8, track_id: u32 },
    NowPlaying { device_id: u8, track_id: u32 },
    Stopped { device_id: u8 },
}

struct DeviceState {
    status: DeviceStatus,
    candidate_since: Option<Instant>,
}

#[derive(Clone, Copy, Debug)]
struct Master {
    device_id: u8,
    track_id: u32,
    lost_at: Option<Instant>,
}

pub struct MixstatusEngine {
    config: MixstatusConfig,
    devices: HashMap<u8, DeviceState>,
    last_tracks: HashMap<u8, u32>,
    master: Option<Master>,
    // Instant of the latest arbitration. Never moves backwards.
    clock: Option<Instant>,
}

impl MixstatusEngine {
    pub fn new(config: MixstatusConfig) -> MixstatusEngine {
        MixstatusEngine {
            config,
            devices: HashMap::new(),
            last_tracks: HashMap::new(),
            master: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &MixstatusConfig {
        &self.config
    }

    /// Device currently considered on air.
    pub fn master(&self) -> Option<u8> {
        self.master.map(|m| m.device_id)
    }

    /// Feeds one status into the engine.
    ///
    /// Timers that expired before the status arrived are applied first so
    /// their events precede the ones caused by the status.
    pub fn handle_status(&mut self, status: DeviceStatus) -> Vec<MixEvent> {
        let mut events = Vec::new();

        if let Some(prev) = self.devices.get(&status.device_id) {
            if status.timestamp <= prev.status.timestamp {
                warn!(
                    target: "prolink",
                    "dropping out of order status from device {}", status.device_id
                );
                return events;
            }
        }

        let now = self.now(status.timestamp);
        self.run_timers(now, &mut events);
        self.update_loaded_track(&status, &mut events);

        let same_track = self
            .devices
            .get(&status.device_id)
            .filter(|prev| prev.status.track_id == status.track_id);
        let candidate_since = if self.is_candidate(&status) {
            Some(same_track.and_then(|prev| prev.candidate_since).unwrap_or(now))
        } else {
            None
        };

        self.devices.insert(
            status.device_id,
            DeviceState {
                status,
                candidate_since,
            },
        );
        self.arbitrate(now, &mut events);

        events
    }

    /// Applies every confirmation or grace expiry up to `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<MixEvent> {
        let mut events = Vec::new();
        self.run_timers(now, &mut events);
        events
    }

    /// Forgets a device that left the network.
    pub fn remove_device(&mut self, device_id: u8, now: Instant) -> Vec<MixEvent> {
        let mut events = Vec::new();
        let now = self.now(now);
        self.run_timers(now, &mut events);

        if self.devices.remove(&device_id).is_some() {
            debug!(target: "prolink", "device {} removed from mixstatus", device_id);
        }
        self.last_tracks.remove(&device_id);
        self.arbitrate(now, &mut events);

        events
    }

    /// Earliest instant at which a pending timer changes the outcome of
    /// arbitration.
    pub fn next_deadline(&self) -> Option<Instant> {
        let confirmations = self
            .devices
            .values()
            .filter_map(|d| d.candidate_since)
            .map(|since| since + self.config.confirmation_window);
        let grace = self
            .master
            .and_then(|m| m.lost_at)
            .map(|lost_at| lost_at + self.config.grace_window);

        confirmations
            .chain(grace)
            .filter(|deadline| self.clock.map_or(true, |clock| *deadline > clock))
            .min()
    }

    fn now(&self, at: Instant) -> Instant {
        self.clock.map_or(at, |clock| clock.max(at))
    }

    fn run_timers(&mut self, now: Instant, events: &mut Vec<MixEvent>) {
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            self.arbitrate(deadline, events);
        }
    }

    fn is_candidate(&self, status: &DeviceStatus) -> bool {
        status.track_id != 0
            && status.is_playing
            && (status.is_on_air || !self.config.use_on_air)
    }

    fn update_loaded_track(&mut self, status: &DeviceStatus, events: &mut Vec<MixEvent>) {
        if status.track_id == 0 {
            self.last_tracks.remove(&status.device_id);
            return;
        }

        let prev = self.last_tracks.insert(status.device_id, status.track_id);
        if prev != Some(status.track_id) {
            events.push(MixEvent::TrackLoaded {
                device_id: status.device_id,
                track_id: status.track_id,
            });
        }
    }

    fn holds(&self, master: &Master) -> bool {
        self.devices.get(&master.device_id).map_or(false, |d| {
            d.candidate_since.is_some() && d.status.track_id == master.track_id
        })
    }

    // Candidate with the oldest start among those past the confirmation
    // window. Ties go to the lower device number.
    fn earliest_eligible(&self, at: Instant) -> Option<(u8, u32)> {
        let window = self.config.confirmation_window;
        self.devices
            .values()
            .filter_map(|d| {
                d.candidate_since
                    .filter(|since| *since + window <= at)
                    .map(|since| (since, d.status.device_id, d.status.track_id))
            })
            .min_by_key(|(since, device_id, _)| (*since, *device_id))
            .map(|(_, device_id, track_id)| (device_id, track_id))
    }

    fn arbitrate(&mut self, at: Instant, events: &mut Vec<MixEvent>) {
        self.clock = Some(self.now(at));

        let mut master = match self.master {
            Some(master) => master,
            None => {
                if let Some((device_id, track_id)) = self.earliest_eligible(at) {
                    self.promote(device_id, track_id, events);
                }
                return;
            }
        };

        if self.holds(&master) {
            if master.lost_at.take().is_some() {
                debug!(target: "prolink", "device {} back on air", master.device_id);
                self.master = Some(master);
            }
            return;
        }

        let lost_at = *master.lost_at.get_or_insert(at);
        self.master = Some(master);

        if let Some((device_id, track_id)) = self.earliest_eligible(at) {
            self.promote(device_id, track_id, events);
        } else if at >= lost_at + self.config.grace_window {
            self.master = None;
            events.push(MixEvent::Stopped {
                device_id: master.device_id,
            });
        }
    }

    fn promote(&mut self, device_id: u8, track_id: u32, events: &mut Vec<MixEvent>) {
        self.master = Some(Master {
            device_id,
            track_id,
            lost_at: None,
        });
        events.push(MixEvent::NowPlaying {
            device_id,
            track_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIRM: Duration = Duration::from_millis(400);
    const GRACE: Duration = Duration::from_secs(2);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn status(
        device_id: u8,
        track_id: u32,
        playing: bool,
        on_air: bool,
        timestamp: Instant,
    ) -> DeviceStatus {
        DeviceStatus {
            name: format!("CDJ-{}", device_id),
            device_id,
            track_id,
            track_device_id: device_id,
            track_slot: 3,
            track_type: 1,
            is_playing: playing,
            is_on_air: on_air,
            is_master: false,
            is_sync: false,
            play_state: None,
            bpm: Some(128.0),
            pitch: 0.0,
            beat: None,
            beat_in_bar: 0,
            packet_num: 0,
            timestamp,
        }
    }

    fn engine() -> MixstatusEngine {
        MixstatusEngine::new(MixstatusConfig {
            confirmation_window: CONFIRM,
            grace_window: GRACE,
            use_on_air: true,
        })
    }

    // Feeds statuses every 200ms from `from` until `until` (inclusive).
    fn feed(
        engine: &mut MixstatusEngine,
        events: &mut Vec<MixEvent>,
        t0: Instant,
        from: u64,
        until: u64,
        f: impl Fn(Instant) -> DeviceStatus,
    ) {
        let mut t = from;
        while t <= until {
            events.extend(engine.handle_status(f(t0 + ms(t))));
            t += 200;
        }
    }

    #[test]
    fn test_track_start_and_stop() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        feed(&mut e, &mut events, t0, 0, 400, |t| status(1, 100, true, true, t));
        events.extend(e.handle_status(status(1, 100, true, false, t0 + ms(600))));
        events.extend(e.poll(t0 + ms(600) + GRACE));

        assert_eq!(
            events,
            vec![
                MixEvent::TrackLoaded {
                    device_id: 1,
                    track_id: 100
                },
                MixEvent::NowPlaying {
                    device_id: 1,
                    track_id: 100
                },
                MixEvent::Stopped { device_id: 1 },
            ]
        );
        assert_eq!(e.master(), None);
    }

    #[test]
    fn test_track_loaded_once() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        for n in 0..20 {
            events.extend(e.handle_status(status(2, 77, false, false, t0 + ms(n * 200))));
        }

        assert_eq!(
            events,
            vec![MixEvent::TrackLoaded {
                device_id: 2,
                track_id: 77
            }]
        );
    }

    #[test]
    fn test_track_reloaded_after_eject() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        events.extend(e.handle_status(status(2, 77, false, false, t0)));
        events.extend(e.handle_status(status(2, 0, false, false, t0 + ms(200))));
        events.extend(e.handle_status(status(2, 77, false, false, t0 + ms(400))));
        events.extend(e.handle_status(status(2, 78, false, false, t0 + ms(600))));

        assert_eq!(
            events,
            vec![
                MixEvent::TrackLoaded {
                    device_id: 2,
                    track_id: 77
                },
                MixEvent::TrackLoaded {
                    device_id: 2,
                    track_id: 77
                },
                MixEvent::TrackLoaded {
                    device_id: 2,
                    track_id: 78
                },
            ]
        );
    }

    #[test]
    fn test_flicker_never_promotes() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        events.extend(e.handle_status(status(1, 10, true, true, t0)));
        events.extend(e.handle_status(status(2, 20, true, true, t0 + ms(50))));
        events.extend(e.handle_status(status(1, 10, true, false, t0 + ms(300))));
        events.extend(e.handle_status(status(2, 20, false, true, t0 + ms(350))));
        events.extend(e.poll(t0 + ms(10_000)));

        assert!(
            events
                .iter()
                .all(|ev| !matches!(ev, MixEvent::NowPlaying { .. })),
            "{:?}",
            events
        );
        assert_eq!(e.next_deadline(), None);
    }

    #[test]
    fn test_first_eligible_wins() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(2, 20, true, true, t0));
        e.handle_status(status(1, 10, true, true, t0 + ms(10)));
        let events = e.poll(t0 + ms(1000));

        assert_eq!(
            events,
            vec![MixEvent::NowPlaying {
                device_id: 2,
                track_id: 20
            }]
        );
        assert_eq!(e.master(), Some(2));
    }

    #[test]
    fn test_simultaneous_candidates_tie_break() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(3, 30, true, true, t0));
        e.handle_status(status(2, 20, true, true, t0));
        let events = e.poll(t0 + CONFIRM);

        assert_eq!(
            events,
            vec![MixEvent::NowPlaying {
                device_id: 2,
                track_id: 20
            }]
        );
    }

    #[test]
    fn test_hand_off_without_stop() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        events.extend(e.handle_status(status(1, 10, true, true, t0)));
        events.extend(e.poll(t0 + CONFIRM));
        events.extend(e.handle_status(status(2, 20, true, true, t0 + CONFIRM + ms(1))));
        events.extend(e.poll(t0 + CONFIRM * 2 + ms(1)));
        assert_eq!(e.master(), Some(1));

        events.extend(e.handle_status(status(1, 10, true, false, t0 + ms(1000))));

        assert_eq!(
            events,
            vec![
                MixEvent::TrackLoaded {
                    device_id: 1,
                    track_id: 10
                },
                MixEvent::NowPlaying {
                    device_id: 1,
                    track_id: 10
                },
                MixEvent::TrackLoaded {
                    device_id: 2,
                    track_id: 20
                },
                MixEvent::NowPlaying {
                    device_id: 2,
                    track_id: 20
                },
            ]
        );
        assert_eq!(e.master(), Some(2));
        assert_eq!(e.next_deadline(), None);
    }

    #[test]
    fn test_hand_off_during_grace() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, true, true, t0));
        e.poll(t0 + CONFIRM);
        e.handle_status(status(1, 10, false, true, t0 + ms(1000)));
        e.handle_status(status(2, 20, true, true, t0 + ms(1500)));

        // Polled late; device 2 confirmed before the grace window ran out.
        let events = e.poll(t0 + ms(60_000));
        assert_eq!(
            events,
            vec![MixEvent::NowPlaying {
                device_id: 2,
                track_id: 20
            }]
        );
    }

    #[test]
    fn test_late_poll_keeps_causal_order() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, true, true, t0));
        e.poll(t0 + CONFIRM);
        e.handle_status(status(1, 10, false, true, t0 + ms(1000)));
        // Becomes a candidate too late to be confirmed inside the grace window.
        e.handle_status(status(2, 20, true, true, t0 + ms(2900)));

        let events = e.poll(t0 + ms(60_000));
        assert_eq!(
            events,
            vec![
                MixEvent::Stopped { device_id: 1 },
                MixEvent::NowPlaying {
                    device_id: 2,
                    track_id: 20
                },
            ]
        );
    }

    #[test]
    fn test_single_stop_after_grace() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, true, true, t0));
        e.poll(t0 + CONFIRM);
        e.handle_status(status(1, 10, true, false, t0 + ms(1000)));

        assert_eq!(e.next_deadline(), Some(t0 + ms(1000) + GRACE));
        assert!(e.poll(t0 + ms(1000) + GRACE - ms(1)).is_empty());
        assert_eq!(
            e.poll(t0 + ms(1000) + GRACE),
            vec![MixEvent::Stopped { device_id: 1 }]
        );
        assert!(e.poll(t0 + ms(120_000)).is_empty());
        assert_eq!(e.next_deadline(), None);
    }

    #[test]
    fn test_master_flicker_within_grace() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut events = Vec::new();

        events.extend(e.handle_status(status(1, 10, true, true, t0)));
        events.extend(e.poll(t0 + CONFIRM));
        events.extend(e.handle_status(status(1, 10, true, false, t0 + ms(1000))));
        events.extend(e.handle_status(status(1, 10, true, true, t0 + ms(1200))));
        events.extend(e.poll(t0 + ms(30_000)));

        assert_eq!(events.len(), 2, "{:?}", events);
        assert_eq!(e.master(), Some(1));
    }

    #[test]
    fn test_master_changes_track() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, true, true, t0));
        e.poll(t0 + CONFIRM);

        let events = e.handle_status(status(1, 11, true, true, t0 + ms(1000)));
        assert_eq!(
            events,
            vec![MixEvent::TrackLoaded {
                device_id: 1,
                track_id: 11
            }]
        );

        let events = e.poll(t0 + ms(1000) + CONFIRM);
        assert_eq!(
            events,
            vec![MixEvent::NowPlaying {
                device_id: 1,
                track_id: 11
            }]
        );
    }

    #[test]
    fn test_out_of_order_status_dropped() {
        let _ = env_logger::builder().is_test(true).try_init();
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, false, false, t0 + ms(500)));
        assert!(e
            .handle_status(status(1, 99, true, true, t0 + ms(100)))
            .is_empty());
        assert!(e
            .handle_status(status(1, 99, true, true, t0 + ms(500)))
            .is_empty());
        assert_eq!(e.next_deadline(), None);
    }

    #[test]
    fn test_ignore_on_air() {
        let t0 = Instant::now();
        let mut e = MixstatusEngine::new(MixstatusConfig {
            use_on_air: false,
            ..MixstatusConfig::default()
        });

        let window = e.config().confirmation_window;
        e.handle_status(status(4, 40, true, false, t0));
        let events = e.poll(t0 + window);
        assert_eq!(
            events,
            vec![MixEvent::NowPlaying {
                device_id: 4,
                track_id: 40
            }]
        );
    }

    #[test]
    fn test_unloaded_deck_is_not_candidate() {
        let t0 = Instant::now();
        let mut e = engine();

        assert!(e.handle_status(status(1, 0, true, true, t0)).is_empty());
        assert_eq!(e.next_deadline(), None);
    }

    #[test]
    fn test_master_leaves_network() {
        let t0 = Instant::now();
        let mut e = engine();

        e.handle_status(status(1, 10, true, true, t0));
        e.poll(t0 + CONFIRM);

        assert!(e.remove_device(1, t0 + ms(1000)).is_empty());
        assert_eq!(
            e.poll(t0 + ms(1000) + GRACE),
            vec![MixEvent::Stopped { device_id: 1 }]
        );

        // Coming back announces the track again.
        let events = e.handle_status(status(1, 10, false, false, t0 + ms(5000)));
        assert_eq!(
            events,
            vec![MixEvent::TrackLoaded {
                device_id: 1,
                track_id: 10
            }]
        );
    }
}
