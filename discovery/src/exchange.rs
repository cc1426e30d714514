//! Data exchange with the activated device: presence checks, and the
//! NFC-V Read Single Block done once after activation.

use std::time::Duration;

use tracing::{debug, trace};

use crate::config::DiscoveryConfig;
use crate::device::{Device, InterfaceKind, NfcaType, RfInterface, TechData};
use crate::error::{DiscoveryError, Result};
use crate::rf::{RfLayer, TransceiveStatus, TxFrame};

const T1T_READ: [u8; 3] = [0x01, 0x00, 0x00];
const T2T_READ_BLOCK0: [u8; 2] = [0x30, 0x00];
const NFCB_PROBE: [u8; 1] = [0x00];
/// CHECK, one service (0x0009), one block (block 0). NFCID2 goes at [1..9].
const T3T_CHECK: [u8; 15] = [0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x09, 0x00, 0x01, 0x80, 0x00];
const NFCV_GET_SYSTEM_INFO: [u8; 2] = [0x02, 0x2B];
const ISO_DEP_SELECT: [u8; 5] = [0x00, 0xA4, 0x00, 0x00, 0x00];
const LLCP_SYMM: [u8; 2] = [0x00, 0x00];
/// Flags (high data rate, addressed) and READ SINGLE BLOCK. UID and block
/// number follow.
const NFCV_READ_SINGLE_BLOCK: [u8; 2] = [0x22, 0x20];
const NFCV_ERROR_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    Pending,
    Complete(Vec<u8>),
}

/// Builds the probe matching the device's technology and interface.
pub fn probe_frame(device: &Device, config: &DiscoveryConfig) -> Result<TxFrame> {
    let raw = |data: Vec<u8>| TxFrame::Raw {
        data,
        fwt_ms: config.raw_fwt_ms,
    };

    match (device.interface(), device.tech()) {
        (RfInterface::IsoDep(_), _) => Ok(TxFrame::IsoDep {
            apdu: ISO_DEP_SELECT.to_vec(),
        }),
        (RfInterface::NfcDep(_), _) => Ok(TxFrame::NfcDep {
            pdu: LLCP_SYMM.to_vec(),
        }),
        (RfInterface::RawFrame, TechData::A(a)) => match a.kind {
            NfcaType::T1T => {
                let mut data = T1T_READ.to_vec();
                data.extend(a.nfcid1.iter().take(4));
                Ok(raw(data))
            }
            NfcaType::T2T => Ok(raw(T2T_READ_BLOCK0.to_vec())),
            NfcaType::T4T | NfcaType::NfcDep | NfcaType::T4tNfcDep => Err(DiscoveryError::UnsupportedProbe {
                technology: device.technology(),
                interface: InterfaceKind::RawFrame,
            }),
        },
        (RfInterface::RawFrame, TechData::B(_)) => Ok(raw(NFCB_PROBE.to_vec())),
        (RfInterface::RawFrame, TechData::F(f)) => {
            let mut data = T3T_CHECK.to_vec();
            data[1..9].copy_from_slice(&f.nfcid2);
            Ok(raw(data))
        }
        (RfInterface::RawFrame, TechData::V(_)) => Ok(raw(NFCV_GET_SYSTEM_INFO.to_vec())),
    }
}

/// Addressed Read Single Block of `block` on an NFC-V tag.
pub fn read_block_frame(device: &Device, block: u8, config: &DiscoveryConfig) -> Result<TxFrame> {
    match (device.interface(), device.tech()) {
        (RfInterface::RawFrame, TechData::V(v)) => {
            let mut data = NFCV_READ_SINGLE_BLOCK.to_vec();
            data.extend_from_slice(&v.uid);
            data.push(block);
            Ok(TxFrame::Raw {
                data,
                fwt_ms: config.raw_fwt_ms,
            })
        }
        (interface, _) => Err(DiscoveryError::UnsupportedBlockRead {
            technology: device.technology(),
            interface: interface.kind(),
        }),
    }
}

/// Block data of a Read Single Block answer, without the flags byte.
pub fn block_data(block: u8, response: &[u8]) -> Result<Vec<u8>> {
    match response.split_first() {
        Some((flags, data)) if flags & NFCV_ERROR_FLAG == 0 => Ok(data.to_vec()),
        Some((_, rest)) => Err(DiscoveryError::BlockRead {
            block,
            code: rest.first().copied(),
        }),
        None => Err(DiscoveryError::BlockRead { block, code: None }),
    }
}

/// Tracks the one transceive that may be outstanding at a time.
#[derive(Debug, Default)]
pub struct DataExchanger {
    in_flight: Option<InterfaceKind>,
}

impl DataExchanger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<InterfaceKind> {
        self.in_flight
    }

    /// Starts the presence probe for `device`.
    pub fn start<R: RfLayer>(&mut self, rf: &mut R, device: &Device, config: &DiscoveryConfig) -> Result<ExchangeStatus> {
        if self.in_flight.is_some() {
            return Err(DiscoveryError::ExchangeInFlight);
        }
        let frame = probe_frame(device, config)?;
        debug!(technology = %device.technology(), interface = ?frame.kind(), len = frame.payload().len(), "starting exchange");
        self.send(rf, frame)
    }

    /// Starts a Read Single Block of `block`; the answer still carries the
    /// flags byte, see [`block_data`].
    pub fn start_read_block<R: RfLayer>(
        &mut self,
        rf: &mut R,
        device: &Device,
        block: u8,
        config: &DiscoveryConfig,
    ) -> Result<ExchangeStatus> {
        if self.in_flight.is_some() {
            return Err(DiscoveryError::ExchangeInFlight);
        }
        let frame = read_block_frame(device, block, config)?;
        debug!(technology = %device.technology(), block, "starting block read");
        self.send(rf, frame)
    }

    fn send<R: RfLayer>(&mut self, rf: &mut R, frame: TxFrame) -> Result<ExchangeStatus> {
        let kind = frame.kind();
        rf.transceive_start(frame)?;
        self.in_flight = Some(kind);
        Ok(ExchangeStatus::Pending)
    }

    pub fn check<R: RfLayer>(&mut self, rf: &mut R) -> Result<ExchangeStatus> {
        let kind = self.in_flight.ok_or(DiscoveryError::NoExchangeInFlight)?;

        match rf.transceive_status(kind) {
            Ok(TransceiveStatus::Pending) => Ok(ExchangeStatus::Pending),
            Ok(TransceiveStatus::Complete(response)) => {
                self.in_flight = None;
                trace!(len = response.len(), "exchange complete");
                Ok(ExchangeStatus::Complete(response))
            }
            Err(e) => {
                self.in_flight = None;
                Err(e.into())
            }
        }
    }

    /// Starts a probe and waits for its answer, checking every `poll`.
    ///
    /// For callers that own the RF layer outside the [`Orchestrator`] state
    /// machine, which only uses the non-blocking `start`/`check` pair.
    ///
    /// [`Orchestrator`]: crate::orchestrator::Orchestrator
    pub async fn exchange<R: RfLayer>(
        &mut self,
        rf: &mut R,
        device: &Device,
        config: &DiscoveryConfig,
        poll: Duration,
    ) -> Result<Vec<u8>> {
        self.start(rf, device, config)?;
        self.completion(rf, poll).await
    }

    /// Reads `block` and waits for the data, checking every `poll`.
    pub async fn read_block<R: RfLayer>(
        &mut self,
        rf: &mut R,
        device: &Device,
        block: u8,
        config: &DiscoveryConfig,
        poll: Duration,
    ) -> Result<Vec<u8>> {
        self.start_read_block(rf, device, block, config)?;
        let response = self.completion(rf, poll).await?;
        block_data(block, &response)
    }

    async fn completion<R: RfLayer>(&mut self, rf: &mut R, poll: Duration) -> Result<Vec<u8>> {
        loop {
            match self.check(rf)? {
                ExchangeStatus::Complete(response) => return Ok(response),
                ExchangeStatus::Pending => tokio::time::sleep(poll).await,
            }
        }
    }

    pub fn reset(&mut self) {
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{NfcaListenDevice, NfcbListenDevice, NfcfListenDevice, NfcvListenDevice};
    use crate::error::RfError;
    use crate::rf::{IsoDepInfo, NfcDepInfo};
    use crate::sim::{RfCall, SimTag, SimulatedField};
    use crate::tech::Technology;

    fn v_tech() -> TechData {
        TechData::V(NfcvListenDevice::new([1, 2, 3, 4, 5, 6, 7, 0xE0]))
    }

    fn raw_payload(device: &Device) -> Vec<u8> {
        match probe_frame(device, &DiscoveryConfig::default()).unwrap() {
            TxFrame::Raw { data, fwt_ms } => {
                assert_eq!(fwt_ms, 20);
                data
            }
            other => panic!("expected raw frame, got {other:?}"),
        }
    }

    #[test]
    fn raw_probes_per_technology() {
        let t1t = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::T1T, &[0xA1, 0xA2, 0xA3, 0xA4])));
        assert_eq!(raw_payload(&t1t), vec![0x01, 0x00, 0x00, 0xA1, 0xA2, 0xA3, 0xA4]);

        let t2t = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::T2T, &[1, 2, 3, 4])));
        assert_eq!(raw_payload(&t2t), vec![0x30, 0x00]);

        let b = Device::new(TechData::B(NfcbListenDevice::new([1, 2, 3, 4])));
        assert_eq!(raw_payload(&b), vec![0x00]);

        let v = Device::new(v_tech());
        assert_eq!(raw_payload(&v), vec![0x02, 0x2B]);
    }

    #[test]
    fn t3t_check_carries_nfcid2() {
        let nfcid2 = [0x02, 0xFE, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let f = Device::new(TechData::F(NfcfListenDevice::new(nfcid2)));
        let data = raw_payload(&f);

        assert_eq!(data.len(), 15);
        assert_eq!(data[0], 0x06);
        assert_eq!(&data[1..9], &nfcid2);
        assert_eq!(&data[9..], &[0x01, 0x09, 0x00, 0x01, 0x80, 0x00]);
    }

    #[test]
    fn protocol_interfaces_use_their_own_probe() {
        let mut iso = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::T4T, &[1, 2, 3, 4])));
        iso.set_interface(RfInterface::IsoDep(IsoDepInfo::default()));
        assert_eq!(
            probe_frame(&iso, &DiscoveryConfig::default()).unwrap(),
            TxFrame::IsoDep { apdu: vec![0x00, 0xA4, 0x00, 0x00, 0x00] }
        );

        let mut p2p = Device::new(TechData::F(NfcfListenDevice::new([0x01, 0xFE, 0, 0, 0, 0, 0, 0])));
        p2p.set_interface(RfInterface::NfcDep(NfcDepInfo::default()));
        assert_eq!(
            probe_frame(&p2p, &DiscoveryConfig::default()).unwrap(),
            TxFrame::NfcDep { pdu: vec![0x00, 0x00] }
        );
    }

    #[test]
    fn raw_frame_on_handshake_subtype_is_rejected() {
        let t4t = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::T4T, &[1, 2, 3, 4])));
        assert_eq!(
            probe_frame(&t4t, &DiscoveryConfig::default()),
            Err(DiscoveryError::UnsupportedProbe {
                technology: Technology::A,
                interface: InterfaceKind::RawFrame,
            })
        );
    }

    #[test]
    fn start_then_check_until_complete() {
        let mut rf = SimulatedField::new(vec![SimTag::new(v_tech()).exchange_polls(1).response(vec![0x00, 0x0F])]);
        let device = Device::new(v_tech());
        let config = DiscoveryConfig::default();
        let mut exchanger = DataExchanger::new();

        assert_eq!(exchanger.start(&mut rf, &device, &config), Ok(ExchangeStatus::Pending));
        assert_eq!(exchanger.start(&mut rf, &device, &config), Err(DiscoveryError::ExchangeInFlight));
        assert_eq!(exchanger.check(&mut rf), Ok(ExchangeStatus::Pending));
        assert_eq!(exchanger.check(&mut rf), Ok(ExchangeStatus::Complete(vec![0x00, 0x0F])));
        assert_eq!(exchanger.check(&mut rf), Err(DiscoveryError::NoExchangeInFlight));

        assert!(rf.calls().contains(&RfCall::TransceiveStart(TxFrame::Raw {
            data: vec![0x02, 0x2B],
            fwt_ms: 20,
        })));
    }

    #[test]
    fn failed_transceive_clears_in_flight() {
        let mut rf = SimulatedField::new(vec![SimTag::new(v_tech()).removed_after_exchanges(0)]);
        let device = Device::new(v_tech());
        let mut exchanger = DataExchanger::new();

        exchanger.start(&mut rf, &device, &DiscoveryConfig::default()).unwrap();
        assert_eq!(exchanger.check(&mut rf), Err(DiscoveryError::Rf(RfError::Timeout)));
        assert!(exchanger.in_flight().is_none());
    }

    #[test]
    fn start_error_leaves_nothing_in_flight() {
        let mut rf = SimulatedField::new(vec![SimTag::new(v_tech())]);
        rf.fail_next_transceive(RfError::Transmission);
        let mut exchanger = DataExchanger::new();

        let err = exchanger.start(&mut rf, &Device::new(v_tech()), &DiscoveryConfig::default());
        assert_eq!(err, Err(DiscoveryError::Rf(RfError::Transmission)));
        assert!(exchanger.in_flight().is_none());
    }

    #[test]
    fn reset_forgets_in_flight() {
        let mut rf = SimulatedField::new(vec![SimTag::new(v_tech()).exchange_polls(5)]);
        let mut exchanger = DataExchanger::new();
        exchanger.start(&mut rf, &Device::new(v_tech()), &DiscoveryConfig::default()).unwrap();

        exchanger.reset();
        assert_eq!(exchanger.check(&mut rf), Err(DiscoveryError::NoExchangeInFlight));
    }

    #[test]
    fn read_block_frame_addresses_the_tag() {
        let device = Device::new(v_tech());
        let frame = read_block_frame(&device, 1, &DiscoveryConfig::default()).unwrap();
        assert_eq!(
            frame,
            TxFrame::Raw {
                data: vec![0x22, 0x20, 1, 2, 3, 4, 5, 6, 7, 0xE0, 0x01],
                fwt_ms: 20,
            }
        );

        let t2t = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::T2T, &[1, 2, 3, 4])));
        assert_eq!(
            read_block_frame(&t2t, 1, &DiscoveryConfig::default()),
            Err(DiscoveryError::UnsupportedBlockRead {
                technology: Technology::A,
                interface: InterfaceKind::RawFrame,
            })
        );
    }

    #[test]
    fn block_data_strips_flags_and_reports_errors() {
        assert_eq!(block_data(1, &[0x00, 0x11, 0x22, 0x33, 0x99]), Ok(vec![0x11, 0x22, 0x33, 0x99]));
        assert_eq!(
            block_data(7, &[0x01, 0x10]),
            Err(DiscoveryError::BlockRead { block: 7, code: Some(0x10) })
        );
        assert_eq!(block_data(7, &[]), Err(DiscoveryError::BlockRead { block: 7, code: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn read_block_returns_block_data() {
        let tag = SimTag::new(v_tech())
            .exchange_polls(1)
            .blocks(vec![vec![0; 4], vec![0x11, 0x22, 0x33, 0x99]]);
        let mut rf = SimulatedField::new(vec![tag]);
        let device = Device::new(v_tech());
        let config = DiscoveryConfig::default();
        let mut exchanger = DataExchanger::new();

        let data = exchanger
            .read_block(&mut rf, &device, 1, &config, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(data, vec![0x11, 0x22, 0x33, 0x99]);

        let err = exchanger
            .read_block(&mut rf, &device, 9, &config, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err, DiscoveryError::BlockRead { block: 9, code: Some(0x10) });
        assert!(exchanger.in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_waits_for_completion() {
        let mut rf = SimulatedField::new(vec![SimTag::new(v_tech()).exchange_polls(3)]);
        let device = Device::new(v_tech());
        let mut exchanger = DataExchanger::new();

        let started = tokio::time::Instant::now();
        let response = exchanger
            .exchange(&mut rf, &device, &DiscoveryConfig::default(), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(response, vec![0x00, 1, 2, 3, 4, 5, 6, 7, 0xE0]);
        assert!(started.elapsed() >= Duration::from_millis(30));
        let polls = rf.calls().iter().filter(|c| matches!(c, RfCall::TransceiveStatus(_))).count();
        assert_eq!(polls, 4);
    }
}
