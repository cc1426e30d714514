//! In-memory RF field used by the simulator binary and the tests.
//!
//! Tags come and go by discovery cycle: a cycle ends every time the field
//! goes from on to off. Every primitive call is recorded so callers can
//! assert on the exact sequence sent to the front-end.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::trace;

use crate::device::{InterfaceKind, NfcaType, TechData};
use crate::error::{RfError, RfResult};
use crate::rf::{
    BitRate, IsoDepInfo, IsoDepRequest, IsoDepTarget, NfcDepInfo, NfcDepRequest, Nfcid3, RfLayer, TransceiveStatus,
    TxFrame, fsxi_to_frame_size,
};
use crate::tech::Technology;

/// READ SINGLE BLOCK command code.
const NFCV_READ_SINGLE_BLOCK: u8 = 0x20;
/// Error flag plus "block not available".
const NFCV_BLOCK_UNAVAILABLE: [u8; 2] = [0x01, 0x10];

/// A listener placed in the simulated field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimTag {
    #[serde(flatten)]
    pub tech: TechData,
    /// ISO-DEP activation times out.
    #[serde(default)]
    pub iso_dep_fails: bool,
    /// ATR_REQ times out.
    #[serde(default)]
    pub nfc_dep_fails: bool,
    /// Status polls answered with `Pending` before a transceive completes.
    #[serde(default)]
    pub exchange_polls: u32,
    /// Fixed answer to every presence probe. Defaults depend on the
    /// interface.
    #[serde(default)]
    pub response: Option<Vec<u8>>,
    /// NFC-V memory, one entry per block.
    #[serde(default)]
    pub blocks: Vec<Vec<u8>>,
    /// Leaves the field after answering this many frames.
    #[serde(default)]
    pub removed_after_exchanges: Option<u32>,
    /// First cycle the tag is in range.
    #[serde(default)]
    pub arrives_at_cycle: u64,
    /// First cycle the tag is out of range again.
    #[serde(default)]
    pub leaves_at_cycle: Option<u64>,
    #[serde(skip)]
    exchanges: u32,
}

impl SimTag {
    pub fn new(tech: TechData) -> Self {
        Self {
            tech,
            iso_dep_fails: false,
            nfc_dep_fails: false,
            exchange_polls: 0,
            response: None,
            blocks: Vec::new(),
            removed_after_exchanges: None,
            arrives_at_cycle: 0,
            leaves_at_cycle: None,
            exchanges: 0,
        }
    }

    pub fn failing_iso_dep(mut self) -> Self {
        self.iso_dep_fails = true;
        self
    }

    pub fn failing_nfc_dep(mut self) -> Self {
        self.nfc_dep_fails = true;
        self
    }

    pub fn exchange_polls(mut self, polls: u32) -> Self {
        self.exchange_polls = polls;
        self
    }

    pub fn response(mut self, response: Vec<u8>) -> Self {
        self.response = Some(response);
        self
    }

    pub fn blocks(mut self, blocks: Vec<Vec<u8>>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn removed_after_exchanges(mut self, exchanges: u32) -> Self {
        self.removed_after_exchanges = Some(exchanges);
        self
    }

    pub fn arrives_at_cycle(mut self, cycle: u64) -> Self {
        self.arrives_at_cycle = cycle;
        self
    }

    pub fn leaves_at_cycle(mut self, cycle: u64) -> Self {
        self.leaves_at_cycle = Some(cycle);
        self
    }

    /// Frames answered so far.
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    fn in_range(&self, cycle: u64) -> bool {
        cycle >= self.arrives_at_cycle
            && self.leaves_at_cycle.is_none_or(|leave| cycle < leave)
            && self.removed_after_exchanges.is_none_or(|n| self.exchanges < n)
    }

    fn technology(&self) -> Technology {
        self.tech.technology()
    }

    fn supports_iso_dep(&self) -> bool {
        match &self.tech {
            TechData::A(a) => matches!(a.kind, NfcaType::T4T | NfcaType::T4tNfcDep),
            TechData::B(_) => true,
            TechData::F(_) | TechData::V(_) => false,
        }
    }

    fn supports_nfc_dep(&self) -> bool {
        match &self.tech {
            TechData::A(a) => matches!(a.kind, NfcaType::NfcDep | NfcaType::T4tNfcDep),
            TechData::F(f) => f.supports_nfc_dep(),
            TechData::B(_) | TechData::V(_) => false,
        }
    }

    fn answer(&self, kind: InterfaceKind, request: &[u8]) -> Vec<u8> {
        if let (TechData::V(_), [_, NFCV_READ_SINGLE_BLOCK, .., block]) = (&self.tech, request) {
            return match self.blocks.get(usize::from(*block)) {
                Some(data) => {
                    let mut answer = vec![0x00];
                    answer.extend_from_slice(data);
                    answer
                }
                None => NFCV_BLOCK_UNAVAILABLE.to_vec(),
            };
        }
        if let Some(response) = &self.response {
            return response.clone();
        }
        match kind {
            InterfaceKind::IsoDep => vec![0x90, 0x00],
            InterfaceKind::NfcDep => vec![0x00, 0x00],
            InterfaceKind::RawFrame => match &self.tech {
                TechData::A(a) => a.nfcid1.to_vec(),
                TechData::B(b) => b.nfcid0.to_vec(),
                TechData::F(f) => f.nfcid2.to_vec(),
                TechData::V(v) => {
                    let mut answer = vec![0x00];
                    answer.extend_from_slice(&v.uid);
                    answer
                }
            },
        }
    }
}

/// Primitive call as seen by the simulated front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfCall {
    Initialize(Technology),
    FieldOn,
    FieldOff,
    TechnologyDetect(Technology),
    CollisionResolve(Technology, usize),
    NfcaWakeAll,
    NfcaSelect(Vec<u8>),
    NfcbWakeAll,
    IsoDepActivate(IsoDepRequest),
    NfcDepActivate(NfcDepRequest),
    TransceiveStart(TxFrame),
    TransceiveStatus(InterfaceKind),
    IsoDepDeselect,
    NfcDepRelease,
}

#[derive(Debug)]
enum InFlight {
    Answering {
        tag: usize,
        kind: InterfaceKind,
        polls_left: u32,
        request: Vec<u8>,
    },
    Failing {
        kind: InterfaceKind,
        error: RfError,
    },
}

#[derive(Debug, Default)]
pub struct SimulatedField {
    tags: Vec<SimTag>,
    calls: Vec<RfCall>,
    field_on: bool,
    cycle: u64,
    /// Tags resolved in the current cycle, in resolution order.
    resolved: Vec<usize>,
    selected: Option<usize>,
    in_flight: Option<InFlight>,
    detect_failures: HashMap<Technology, RfError>,
    resolve_failures: HashMap<Technology, RfError>,
    nfcb_wake_failure: Option<RfError>,
    transceive_failure: Option<RfError>,
    deselect_failure: Option<RfError>,
    release_failure: Option<RfError>,
    field_off_failure: Option<RfError>,
}

impl SimulatedField {
    pub fn new(tags: Vec<SimTag>) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> &[RfCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn tags(&self) -> &[SimTag] {
        &self.tags
    }

    pub fn add_tag(&mut self, tag: SimTag) {
        self.tags.push(tag);
    }

    pub fn field_is_on(&self) -> bool {
        self.field_on
    }

    /// Number of on-to-off field transitions so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Number of `FieldOff` requests, including ones with the field
    /// already off.
    pub fn field_off_requests(&self) -> usize {
        self.calls.iter().filter(|c| **c == RfCall::FieldOff).count()
    }

    pub fn fail_detect(&mut self, tech: Technology, error: RfError) {
        self.detect_failures.insert(tech, error);
    }

    pub fn fail_collision_resolution(&mut self, tech: Technology, error: RfError) {
        self.resolve_failures.insert(tech, error);
    }

    pub fn fail_nfcb_wake(&mut self, error: RfError) {
        self.nfcb_wake_failure = Some(error);
    }

    /// The next `transceive_start` returns `error`.
    pub fn fail_next_transceive(&mut self, error: RfError) {
        self.transceive_failure = Some(error);
    }

    /// Every `iso_dep_deselect` returns `error`.
    pub fn fail_deselect(&mut self, error: RfError) {
        self.deselect_failure = Some(error);
    }

    /// Every `nfc_dep_release` returns `error`.
    pub fn fail_release(&mut self, error: RfError) {
        self.release_failure = Some(error);
    }

    /// Every `field_off` returns `error` and leaves the field as it is.
    pub fn fail_field_off(&mut self, error: RfError) {
        self.field_off_failure = Some(error);
    }

    fn present(&self, tech: Technology) -> impl Iterator<Item = usize> + '_ {
        self.tags
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.technology() == tech && t.in_range(self.cycle))
            .map(|(i, _)| i)
    }

    fn in_range(&self, index: usize) -> bool {
        self.tags.get(index).is_some_and(|t| t.in_range(self.cycle))
    }

    /// Tag an activation for `tech` is addressed to: the selected one,
    /// else the first resolved, else the first in range.
    fn candidate(&self, tech: Technology) -> Option<usize> {
        let matches = |i: &usize| self.tags[*i].technology() == tech && self.in_range(*i);
        self.selected
            .filter(matches)
            .or_else(|| self.resolved.iter().copied().find(matches))
            .or_else(|| self.present(tech).next())
    }

    fn exchange_target(&self) -> Option<usize> {
        self.selected
            .or_else(|| self.resolved.first().copied())
            .or_else(|| (0..self.tags.len()).find(|i| self.in_range(*i)))
    }

    fn require_field(&self) -> RfResult<()> {
        if self.field_on { Ok(()) } else { Err(RfError::Param) }
    }
}

impl RfLayer for SimulatedField {
    fn initialize(&mut self, tech: Technology) -> RfResult<()> {
        self.calls.push(RfCall::Initialize(tech));
        Ok(())
    }

    fn field_on(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::FieldOn);
        self.field_on = true;
        Ok(())
    }

    fn field_off(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::FieldOff);
        if let Some(e) = &self.field_off_failure {
            return Err(e.clone());
        }
        if self.field_on {
            self.field_on = false;
            self.cycle += 1;
            self.resolved.clear();
            self.selected = None;
            self.in_flight = None;
            trace!(cycle = self.cycle, "field off");
        }
        Ok(())
    }

    fn technology_detect(&mut self, tech: Technology) -> RfResult<bool> {
        self.calls.push(RfCall::TechnologyDetect(tech));
        self.require_field()?;
        if let Some(e) = self.detect_failures.get(&tech) {
            return Err(e.clone());
        }
        Ok(self.present(tech).next().is_some())
    }

    fn collision_resolve(&mut self, tech: Technology, max_devices: usize) -> RfResult<Vec<TechData>> {
        self.calls.push(RfCall::CollisionResolve(tech, max_devices));
        self.require_field()?;
        if let Some(e) = self.resolve_failures.get(&tech) {
            return Err(e.clone());
        }

        let found: Vec<usize> = self.present(tech).take(max_devices).collect();
        let last = found.len().saturating_sub(1);
        let mut descriptors = Vec::with_capacity(found.len());
        for (n, &i) in found.iter().enumerate() {
            // Every listener but the last one resolved is left asleep.
            let mut descriptor = self.tags[i].tech.clone();
            match &mut descriptor {
                TechData::A(a) => a.is_sleep = n != last,
                TechData::B(b) => b.is_sleep = n != last,
                TechData::F(_) | TechData::V(_) => {}
            }
            descriptors.push(descriptor);
        }
        self.resolved.extend(found);
        trace!(technology = %tech, count = descriptors.len(), "resolved");
        Ok(descriptors)
    }

    fn nfca_wake_all(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::NfcaWakeAll);
        Ok(())
    }

    fn nfca_select(&mut self, nfcid1: &[u8]) -> RfResult<()> {
        self.calls.push(RfCall::NfcaSelect(nfcid1.to_vec()));
        let found = self
            .present(Technology::A)
            .find(|i| matches!(&self.tags[*i].tech, TechData::A(a) if a.nfcid1.as_slice() == nfcid1));
        match found {
            Some(i) => {
                self.selected = Some(i);
                Ok(())
            }
            None => Err(RfError::Timeout),
        }
    }

    fn nfcb_wake_all(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::NfcbWakeAll);
        match &self.nfcb_wake_failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn iso_dep_activate(&mut self, request: &IsoDepRequest) -> RfResult<IsoDepInfo> {
        self.calls.push(RfCall::IsoDepActivate(request.clone()));

        let target = match &request.target {
            IsoDepTarget::A => self.candidate(Technology::A),
            IsoDepTarget::B(b) => self
                .present(Technology::B)
                .find(|i| matches!(&self.tags[*i].tech, TechData::B(t) if t.nfcid0 == b.nfcid0)),
        };
        let index = target.ok_or(RfError::Timeout)?;
        let tag = &self.tags[index];
        if tag.iso_dep_fails {
            return Err(RfError::Timeout);
        }
        if !tag.supports_iso_dep() {
            return Err(RfError::Protocol);
        }

        self.selected = Some(index);
        Ok(IsoDepInfo {
            fsc: fsxi_to_frame_size(request.fsdi),
            fwt_ms: 5,
            did: request.did,
            nad_supported: false,
            bit_rate: BitRate::Kbps106,
            activation_response: match &request.target {
                IsoDepTarget::A => vec![0x05, 0x78, 0x80, 0x70, 0x02],
                IsoDepTarget::B(_) => vec![0x00],
            },
        })
    }

    fn nfc_dep_activate(&mut self, request: &NfcDepRequest) -> RfResult<NfcDepInfo> {
        self.calls.push(RfCall::NfcDepActivate(request.clone()));

        let target = match request.technology {
            Technology::F => self
                .present(Technology::F)
                .find(|i| matches!(&self.tags[*i].tech, TechData::F(f) if f.nfcid2[..] == request.nfcid3[..])),
            tech => self.candidate(tech),
        };
        let index = target.ok_or(RfError::Timeout)?;
        let tag = &self.tags[index];
        if tag.nfc_dep_fails {
            return Err(RfError::Timeout);
        }
        if !tag.supports_nfc_dep() {
            return Err(RfError::Protocol);
        }

        self.selected = Some(index);
        Ok(NfcDepInfo {
            nfcid3: Nfcid3::from_slice(&[0x01, 0xFE, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x00, 0x00])
                .unwrap_or_default(),
            general_bytes: request.general_bytes.clone(),
            lr: request.lr,
            wt: 8,
            did: request.did,
        })
    }

    fn transceive_start(&mut self, frame: TxFrame) -> RfResult<()> {
        let kind = frame.kind();
        let request = frame.payload().to_vec();
        trace!(?kind, len = request.len(), "transceive start");
        self.calls.push(RfCall::TransceiveStart(frame));

        if self.in_flight.is_some() {
            return Err(RfError::Busy);
        }
        if let Some(e) = self.transceive_failure.take() {
            return Err(e);
        }

        self.in_flight = Some(match self.exchange_target().filter(|i| self.in_range(*i)) {
            Some(tag) => InFlight::Answering {
                tag,
                kind,
                polls_left: self.tags[tag].exchange_polls,
                request,
            },
            None => InFlight::Failing {
                kind,
                error: RfError::Timeout,
            },
        });
        Ok(())
    }

    fn transceive_status(&mut self, kind: InterfaceKind) -> RfResult<TransceiveStatus> {
        self.calls.push(RfCall::TransceiveStatus(kind));

        match self.in_flight.take() {
            None => Err(RfError::Param),
            Some(InFlight::Failing { kind: started, error }) => {
                if started != kind {
                    self.in_flight = Some(InFlight::Failing { kind: started, error });
                    return Err(RfError::Param);
                }
                Err(error)
            }
            Some(InFlight::Answering {
                tag,
                kind: started,
                polls_left,
                request,
            }) => {
                if started != kind {
                    self.in_flight = Some(InFlight::Answering {
                        tag,
                        kind: started,
                        polls_left,
                        request,
                    });
                    return Err(RfError::Param);
                }
                if polls_left > 0 {
                    self.in_flight = Some(InFlight::Answering {
                        tag,
                        kind,
                        polls_left: polls_left - 1,
                        request,
                    });
                    return Ok(TransceiveStatus::Pending);
                }
                let sim_tag = &mut self.tags[tag];
                sim_tag.exchanges += 1;
                Ok(TransceiveStatus::Complete(sim_tag.answer(kind, &request)))
            }
        }
    }

    fn iso_dep_deselect(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::IsoDepDeselect);
        if let Some(e) = &self.deselect_failure {
            return Err(e.clone());
        }
        self.selected = None;
        Ok(())
    }

    fn nfc_dep_release(&mut self) -> RfResult<()> {
        self.calls.push(RfCall::NfcDepRelease);
        if let Some(e) = &self.release_failure {
            return Err(e.clone());
        }
        self.selected = None;
        Ok(())
    }
}
