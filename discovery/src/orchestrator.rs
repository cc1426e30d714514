//! Discovery state machine.
//!
//! One [`Orchestrator::step`] performs one phase of the cycle
//!
//! ```text
//! Init -> TechDetect -> CollisionAvoidance -> Activation
//!      -> [DataExchangeStart <-> DataExchangeCheck] -> Deactivation -> Init
//! ```
//!
//! and never sleeps; [`Orchestrator::run`] drives it from a tokio interval.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::activator::activate;
use crate::config::DiscoveryConfig;
use crate::deactivator::deactivate;
use crate::detector::detect_technologies;
use crate::device::{DeviceRegistry, RfInterface, TechData, hex};
use crate::error::DiscoveryError;
use crate::event::{DeviceSummary, DiscoveryEvent};
use crate::exchange::{DataExchanger, ExchangeStatus, block_data};
use crate::resolver::resolve_collisions;
use crate::rf::RfLayer;
use crate::tech::TechSet;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    Init,
    TechDetect,
    CollisionAvoidance,
    Activation,
    DataExchangeStart,
    DataExchangeCheck,
    Deactivation,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryState::Init => "initialize discovery",
            DiscoveryState::TechDetect => "technology detection",
            DiscoveryState::CollisionAvoidance => "collision resolution",
            DiscoveryState::Activation => "device activation",
            DiscoveryState::DataExchangeStart => "start data exchange",
            DiscoveryState::DataExchangeCheck => "check data exchange",
            DiscoveryState::Deactivation => "deactivation",
        })
    }
}

/// Everything one discovery cycle learns about the field.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    state: DiscoveryState,
    techs_found: TechSet,
    devices: DeviceRegistry,
    cycles: u64,
}

impl DiscoverySession {
    fn new(device_limit: usize) -> Self {
        Self {
            state: DiscoveryState::Init,
            techs_found: TechSet::empty(),
            devices: DeviceRegistry::new(device_limit),
            cycles: 0,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn techs_found(&self) -> TechSet {
        self.techs_found
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Completed cycles, counted at each deactivation.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

/// Outcome of one [`Orchestrator::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: DiscoveryState,
    pub to: DiscoveryState,
    /// Time to wait before the next step.
    pub delay: Duration,
}

pub struct Orchestrator<R> {
    rf: R,
    config: DiscoveryConfig,
    session: DiscoverySession,
    exchanger: DataExchanger,
    /// NFC-V block still to be read from the active device.
    pending_block: Option<u8>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl<R: RfLayer> Orchestrator<R> {
    pub fn new(rf: R, config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            rf,
            session: DiscoverySession::new(config.device_limit),
            config,
            exchanger: DataExchanger::new(),
            pending_block: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &DiscoverySession {
        &self.session
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn rf(&self) -> &R {
        &self.rf
    }

    pub fn rf_mut(&mut self) -> &mut R {
        &mut self.rf
    }

    pub fn into_rf(self) -> R {
        self.rf
    }

    /// Performs exactly one phase of the discovery cycle.
    pub fn step(&mut self) -> Step {
        let from = self.session.state;
        let (to, delay) = match from {
            DiscoveryState::Init => self.init(),
            DiscoveryState::TechDetect => self.tech_detect(),
            DiscoveryState::CollisionAvoidance => self.collision_avoidance(),
            DiscoveryState::Activation => self.activation(),
            DiscoveryState::DataExchangeStart => self.exchange_start(),
            DiscoveryState::DataExchangeCheck => self.exchange_check(),
            DiscoveryState::Deactivation => self.deactivation(),
        };

        self.session.state = to;
        if from != to {
            debug!(%from, %to, "state change");
            self.emit(DiscoveryEvent::StateChanged { from, to });
        }
        Step { from, to, delay }
    }

    /// Steps once per tick until `shutdown` resolves, then releases the
    /// field. Shutdown is only observed between steps.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(techs = %self.config.techs, device_limit = self.config.device_limit, "discovery started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let step = self.step();
            if !step.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(step.delay) => {}
                }
            }
        }

        if self.session.state != DiscoveryState::Init {
            deactivate(&mut self.rf, &mut self.session.devices);
            self.exchanger.reset();
            self.pending_block = None;
            self.session.state = DiscoveryState::Init;
        }
        info!(cycles = self.session.cycles, "discovery stopped");
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn init(&mut self) -> (DiscoveryState, Duration) {
        self.session.devices.clear();
        self.session.techs_found.clear();
        (DiscoveryState::TechDetect, Duration::ZERO)
    }

    fn tech_detect(&mut self) -> (DiscoveryState, Duration) {
        let found = detect_technologies(&mut self.rf, self.config.techs);
        self.session.techs_found = found;

        if found.is_empty() {
            (DiscoveryState::Deactivation, Duration::ZERO)
        } else {
            debug!(techs = %found, "technologies found");
            (DiscoveryState::CollisionAvoidance, Duration::ZERO)
        }
    }

    fn collision_avoidance(&mut self) -> (DiscoveryState, Duration) {
        let techs = self.session.techs_found;
        if !resolve_collisions(&mut self.rf, techs, &mut self.session.devices) {
            return (DiscoveryState::Deactivation, Duration::ZERO);
        }

        let count = self.session.devices.len();
        info!(techs = %techs, count, "devices resolved");
        self.emit(DiscoveryEvent::DevicesResolved { techs, count });
        (DiscoveryState::Activation, Duration::ZERO)
    }

    fn activation(&mut self) -> (DiscoveryState, Duration) {
        let devices = &mut self.session.devices;
        match activate(&mut self.rf, devices, 0, &self.config) {
            Ok(()) => {
                let reads_block = devices
                    .active_device()
                    .is_some_and(|d| matches!((d.tech(), d.interface()), (TechData::V(_), RfInterface::RawFrame)));
                self.pending_block = self.config.nfcv_read_block.filter(|_| reads_block);

                if let Some(summary) = devices.active_device().map(DeviceSummary::from) {
                    self.emit(DiscoveryEvent::Activated(summary));
                }
                if self.config.data_exchange {
                    (DiscoveryState::DataExchangeStart, Duration::ZERO)
                } else {
                    (DiscoveryState::Deactivation, Duration::ZERO)
                }
            }
            Err(e) => {
                warn!(error = %e, "activation failed");
                let technology = devices.get(0).map(|d| d.technology());
                self.emit(DiscoveryEvent::ActivationFailed {
                    technology,
                    error: e.to_string(),
                });
                (DiscoveryState::Deactivation, Duration::ZERO)
            }
        }
    }

    fn exchange_start(&mut self) -> (DiscoveryState, Duration) {
        let started = match (self.session.devices.active_device(), self.pending_block) {
            (Some(device), Some(block)) => self.exchanger.start_read_block(&mut self.rf, device, block, &self.config),
            (Some(device), None) => self.exchanger.start(&mut self.rf, device, &self.config),
            (None, _) => Err(DiscoveryError::NoActiveDevice),
        };

        match started {
            Ok(ExchangeStatus::Pending) => (DiscoveryState::DataExchangeCheck, Duration::ZERO),
            Ok(ExchangeStatus::Complete(response)) => self.exchange_complete(response),
            Err(e) => self.exchange_failed(e),
        }
    }

    fn exchange_check(&mut self) -> (DiscoveryState, Duration) {
        match self.exchanger.check(&mut self.rf) {
            Ok(ExchangeStatus::Pending) => (DiscoveryState::DataExchangeCheck, Duration::ZERO),
            Ok(ExchangeStatus::Complete(response)) => self.exchange_complete(response),
            Err(e) => self.exchange_failed(e),
        }
    }

    fn exchange_complete(&mut self, response: Vec<u8>) -> (DiscoveryState, Duration) {
        if let Some(block) = self.pending_block.take() {
            return self.block_read(block, &response);
        }
        debug!(len = response.len(), "device still present");
        self.emit(DiscoveryEvent::ExchangeCompleted { response });
        (DiscoveryState::DataExchangeStart, self.config.exchange_interval())
    }

    /// The tag answered, so presence checks follow even when it reported
    /// an error for the block.
    fn block_read(&mut self, block: u8, response: &[u8]) -> (DiscoveryState, Duration) {
        match block_data(block, response) {
            Ok(data) => {
                info!(block, data = %hex(&data), "block read");
                self.emit(DiscoveryEvent::BlockRead { block, data });
            }
            Err(e) => {
                warn!(block, error = %e, "block read failed");
                self.emit(DiscoveryEvent::BlockReadFailed {
                    block,
                    error: e.to_string(),
                });
            }
        }
        (DiscoveryState::DataExchangeStart, self.config.exchange_interval())
    }

    fn exchange_failed(&mut self, error: DiscoveryError) -> (DiscoveryState, Duration) {
        if let Some(block) = self.pending_block.take() {
            self.emit(DiscoveryEvent::BlockReadFailed {
                block,
                error: error.to_string(),
            });
        }
        info!(error = %error, "data exchange ended");
        self.emit(DiscoveryEvent::ExchangeFailed {
            error: error.to_string(),
        });
        (DiscoveryState::Deactivation, Duration::ZERO)
    }

    fn deactivation(&mut self) -> (DiscoveryState, Duration) {
        deactivate(&mut self.rf, &mut self.session.devices);
        self.exchanger.reset();
        self.pending_block = None;
        self.session.cycles += 1;
        self.emit(DiscoveryEvent::Deactivated {
            cycle: self.session.cycles,
        });
        (DiscoveryState::Init, self.config.guard_period())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{InterfaceKind, NfcaListenDevice, NfcaType, NfcvListenDevice, TechData};
    use crate::sim::{RfCall, SimTag, SimulatedField};
    use crate::tech::Technology;

    fn v_tag() -> SimTag {
        SimTag::new(TechData::V(NfcvListenDevice::new([1, 2, 3, 4, 5, 6, 7, 0xE0])))
    }

    fn states(orchestrator: &mut Orchestrator<SimulatedField>, steps: usize) -> Vec<DiscoveryState> {
        (0..steps).map(|_| orchestrator.step().to).collect()
    }

    fn run_until_init(orchestrator: &mut Orchestrator<SimulatedField>) {
        for _ in 0..50 {
            if orchestrator.step().to == DiscoveryState::Init {
                return;
            }
        }
        panic!("cycle did not finish");
    }

    #[test]
    fn empty_field_goes_straight_to_deactivation() {
        let mut orchestrator = Orchestrator::new(SimulatedField::new(Vec::new()), DiscoveryConfig::default());

        assert_eq!(
            states(&mut orchestrator, 3),
            vec![DiscoveryState::TechDetect, DiscoveryState::Deactivation, DiscoveryState::Init]
        );
        assert_eq!(orchestrator.session().cycles(), 1);
        assert!(!orchestrator.rf().field_is_on());
    }

    #[test]
    fn deactivation_waits_the_guard_period() {
        let mut orchestrator = Orchestrator::new(SimulatedField::new(Vec::new()), DiscoveryConfig::default());
        orchestrator.step();
        orchestrator.step();

        let step = orchestrator.step();
        assert_eq!(step.from, DiscoveryState::Deactivation);
        assert_eq!(step.delay, Duration::from_millis(500));
    }

    #[test]
    fn exchange_loops_until_the_device_leaves() {
        let rf = SimulatedField::new(vec![v_tag().exchange_polls(1).removed_after_exchanges(2)]);
        let mut orchestrator = Orchestrator::new(rf, DiscoveryConfig::default());

        use DiscoveryState::*;
        let expected = vec![
            TechDetect,
            CollisionAvoidance,
            Activation,
            DataExchangeStart,
            DataExchangeCheck,
            DataExchangeCheck,
            DataExchangeStart,
            DataExchangeCheck,
            DataExchangeCheck,
            DataExchangeStart,
            DataExchangeCheck,
            Deactivation,
            Init,
        ];
        let mut seen = Vec::new();
        for _ in 0..expected.len() {
            let step = orchestrator.step();
            if step.from == DataExchangeCheck && step.to == DataExchangeStart {
                assert_eq!(step.delay, Duration::from_millis(100));
            }
            seen.push(step.to);
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn data_exchange_can_be_disabled() {
        let config = DiscoveryConfig {
            data_exchange: false,
            ..DiscoveryConfig::default()
        };
        let mut orchestrator = Orchestrator::new(SimulatedField::new(vec![v_tag()]), config);

        let seen = states(&mut orchestrator, 5);
        assert_eq!(seen[2], DiscoveryState::Activation);
        assert_eq!(seen[3], DiscoveryState::Deactivation);
        assert!(!orchestrator.rf().calls().iter().any(|c| matches!(c, RfCall::TransceiveStart(_))));
    }

    #[test]
    fn first_resolved_device_is_activated() {
        let rf = SimulatedField::new(vec![
            SimTag::new(TechData::A(NfcaListenDevice::new(NfcaType::T2T, &[0xAA, 1, 2, 3]))),
            v_tag(),
        ]);
        let mut orchestrator = Orchestrator::new(rf, DiscoveryConfig::default());
        states(&mut orchestrator, 4);

        let session = orchestrator.session();
        assert_eq!(session.devices().len(), 2);
        assert_eq!(session.devices().active_index(), Some(0));
        let active = session.devices().active_device().unwrap();
        assert_eq!(active.technology(), Technology::A);
        assert_eq!(active.interface().kind(), InterfaceKind::RawFrame);
    }

    #[test]
    fn events_follow_the_cycle() {
        let config = DiscoveryConfig {
            data_exchange: false,
            ..DiscoveryConfig::default()
        };
        let mut orchestrator = Orchestrator::new(SimulatedField::new(vec![v_tag()]), config);
        let mut events = orchestrator.subscribe();
        states(&mut orchestrator, 6);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            if !matches!(event, DiscoveryEvent::StateChanged { .. }) {
                received.push(event);
            }
        }
        assert!(matches!(received[0], DiscoveryEvent::DevicesResolved { count: 1, .. }));
        match &received[1] {
            DiscoveryEvent::Activated(summary) => {
                assert_eq!(summary.id, "E007060504030201");
                assert_eq!(summary.description, "ISO15693/NFC-V card");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(received[2], DiscoveryEvent::Deactivated { cycle: 1 });
    }

    #[test]
    fn nfcv_block_is_read_before_presence_checks() {
        let tag = v_tag().blocks(vec![vec![0; 4], vec![0x11, 0x22, 0x33, 0x99]]).removed_after_exchanges(2);
        let config = DiscoveryConfig {
            nfcv_read_block: Some(1),
            ..DiscoveryConfig::default()
        };
        let mut orchestrator = Orchestrator::new(SimulatedField::new(vec![tag]), config);
        let mut events = orchestrator.subscribe();
        run_until_init(&mut orchestrator);

        let sent: Vec<Vec<u8>> = orchestrator
            .rf()
            .calls()
            .iter()
            .filter_map(|c| match c {
                RfCall::TransceiveStart(frame) => Some(frame.payload().to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(sent[0], vec![0x22, 0x20, 1, 2, 3, 4, 5, 6, 7, 0xE0, 0x01]);
        assert!(sent[1..].iter().all(|frame| frame == &[0x02, 0x2B]));

        let read =
            std::iter::from_fn(|| events.try_recv().ok()).find(|e| matches!(e, DiscoveryEvent::BlockRead { .. }));
        assert_eq!(
            read,
            Some(DiscoveryEvent::BlockRead {
                block: 1,
                data: vec![0x11, 0x22, 0x33, 0x99]
            })
        );
    }

    #[test]
    fn unreadable_block_still_checks_presence() {
        let tag = v_tag().removed_after_exchanges(2);
        let config = DiscoveryConfig {
            nfcv_read_block: Some(4),
            ..DiscoveryConfig::default()
        };
        let mut orchestrator = Orchestrator::new(SimulatedField::new(vec![tag]), config);
        let mut events = orchestrator.subscribe();
        run_until_init(&mut orchestrator);

        let received: Vec<DiscoveryEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| {
                matches!(
                    e,
                    DiscoveryEvent::BlockReadFailed { .. } | DiscoveryEvent::ExchangeCompleted { .. }
                )
            })
            .collect();
        assert!(matches!(&received[0], DiscoveryEvent::BlockReadFailed { block: 4, .. }));
        assert!(matches!(&received[1], DiscoveryEvent::ExchangeCompleted { .. }));
        assert_eq!(received.len(), 2);
    }

    #[test]
    fn block_read_is_skipped_for_other_technologies() {
        let t2t = TechData::A(NfcaListenDevice::new(NfcaType::T2T, &[0xAA, 1, 2, 3]));
        let tag = SimTag::new(t2t).removed_after_exchanges(1);
        let config = DiscoveryConfig {
            nfcv_read_block: Some(1),
            ..DiscoveryConfig::default()
        };
        let mut orchestrator = Orchestrator::new(SimulatedField::new(vec![tag]), config);
        run_until_init(&mut orchestrator);

        assert!(orchestrator.rf().calls().contains(&RfCall::TransceiveStart(crate::rf::TxFrame::Raw {
            data: vec![0x30, 0x00],
            fwt_ms: 20,
        })));
    }

    #[test]
    fn state_descriptions() {
        assert_eq!(DiscoveryState::TechDetect.to_string(), "technology detection");
        assert_eq!(serde_json::to_value(DiscoveryState::DataExchangeCheck).unwrap(), "data_exchange_check");
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_with_the_field_off() {
        let rf = SimulatedField::new(vec![v_tag()]);
        let mut orchestrator = Orchestrator::new(rf, DiscoveryConfig::default());

        orchestrator.run(tokio::time::sleep(Duration::from_secs(2))).await;

        assert_eq!(orchestrator.session().cycles(), 0);
        assert!(!orchestrator.rf().field_is_on());
        assert_eq!(orchestrator.session().state(), DiscoveryState::Init);
        assert!(orchestrator.session().devices().active_index().is_none());
        let exchanges = orchestrator.rf().tags()[0].exchanges();
        assert!(exchanges >= 10, "only {exchanges} presence checks");
    }
}
