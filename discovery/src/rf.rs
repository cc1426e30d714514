//! Seam to the RF primitive layer.
//!
//! The primitive layer owns everything bit-level: framing, CRC,
//! anticollision arithmetic and the chip's own timers. Every call returns
//! promptly (bounded by the primitive's internal timeout); transceive is
//! split into [`RfLayer::transceive_start`] and
//! [`RfLayer::transceive_status`] so callers never block on a frame.

use serde::{Deserialize, Serialize};

use crate::device::{InterfaceKind, NfcbListenDevice, TechData};
use crate::error::RfResult;
use crate::tech::Technology;

/// NFCID3 is up to 10 bytes (an NFCID2 is used as-is for NFC-F peers).
pub type Nfcid3 = heapless::Vec<u8, 10>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitRate {
    #[default]
    Kbps106,
    Kbps212,
    Kbps424,
    Kbps848,
}

/// ISO-DEP frame size for an FSDI/FSCI index (ISO14443-4 table, extended
/// up to 4096 bytes).
pub fn fsxi_to_frame_size(fsxi: u8) -> u16 {
    const TABLE: [u16; 13] = [16, 24, 32, 40, 48, 64, 96, 128, 256, 512, 1024, 2048, 4096];
    TABLE[usize::from(fsxi).min(TABLE.len() - 1)]
}

/// Who the ISO-DEP handshake talks to. NFC-A uses RATS; NFC-B uses ATTRIB
/// addressed by NFCID0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoDepTarget {
    A,
    B(NfcbListenDevice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoDepRequest {
    pub target: IsoDepTarget,
    /// Frame size index the reader can receive.
    pub fsdi: u8,
    pub did: Option<u8>,
    pub max_bit_rate: BitRate,
}

/// Parameters negotiated by a successful ISO-DEP activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoDepInfo {
    /// Largest frame the card accepts.
    pub fsc: u16,
    /// Frame waiting time.
    pub fwt_ms: u32,
    pub did: Option<u8>,
    pub nad_supported: bool,
    pub bit_rate: BitRate,
    /// ATS (NFC-A) or ATTRIB response (NFC-B).
    pub activation_response: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LengthReduction {
    Lr64,
    Lr128,
    Lr192,
    #[default]
    Lr254,
}

impl LengthReduction {
    pub fn frame_len(self) -> u16 {
        match self {
            LengthReduction::Lr64 => 64,
            LengthReduction::Lr128 => 128,
            LengthReduction::Lr192 => 192,
            LengthReduction::Lr254 => 254,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommMode {
    #[default]
    Passive,
    Active,
}

/// NFC-DEP protocol operation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NfcDepFlags {
    pub full_chaining: bool,
    pub empty_dep_frames: bool,
    pub attention: bool,
    pub rtox_requests: bool,
}

/// ATR_REQ parameters for an NFC-DEP initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfcDepRequest {
    pub technology: Technology,
    pub nfcid3: Nfcid3,
    /// Send bit rate; `Kbps106` means no high bit rate negotiation.
    pub bs: BitRate,
    /// Receive bit rate.
    pub br: BitRate,
    pub lr: LengthReduction,
    pub comm_mode: CommMode,
    pub did: Option<u8>,
    pub nad: Option<u8>,
    pub general_bytes: Vec<u8>,
    pub flags: NfcDepFlags,
}

/// Parameters from the target's ATR_RES.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfcDepInfo {
    pub nfcid3: Nfcid3,
    pub general_bytes: Vec<u8>,
    pub lr: LengthReduction,
    /// Waiting time exponent (WT).
    pub wt: u8,
    pub did: Option<u8>,
}

/// A frame handed to the primitive layer. The layout differs per interface;
/// the frame is owned by the call that sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxFrame {
    /// Raw frame, CRC appended by the primitive.
    Raw { data: Vec<u8>, fwt_ms: u32 },
    /// ISO-DEP APDU, chaining and WTX handled by the primitive.
    IsoDep { apdu: Vec<u8> },
    /// NFC-DEP PDU payload.
    NfcDep { pdu: Vec<u8> },
}

impl TxFrame {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            TxFrame::Raw { .. } => InterfaceKind::RawFrame,
            TxFrame::IsoDep { .. } => InterfaceKind::IsoDep,
            TxFrame::NfcDep { .. } => InterfaceKind::NfcDep,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            TxFrame::Raw { data, .. } => data.as_slice(),
            TxFrame::IsoDep { apdu } => apdu.as_slice(),
            TxFrame::NfcDep { pdu } => pdu.as_slice(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransceiveStatus {
    Pending,
    Complete(Vec<u8>),
}

/// RF primitive layer of an NFC front-end.
///
/// Implementations serialize access to the physical bus themselves; callers
/// hold `&mut self` for the duration of one primitive only.
pub trait RfLayer {
    /// Loads the analog configuration and protocol timings for `tech`.
    fn initialize(&mut self, tech: Technology) -> RfResult<()>;

    /// Switches the field on. Calling it with the field already on only
    /// re-arms the guard time.
    fn field_on(&mut self) -> RfResult<()>;

    /// Switches the field off. Idempotent.
    fn field_off(&mut self) -> RfResult<()>;

    /// Sends the technology's detection request once.
    fn technology_detect(&mut self, tech: Technology) -> RfResult<bool>;

    /// Runs collision resolution, returning at most `max_devices`
    /// listen descriptors in resolution order.
    fn collision_resolve(&mut self, tech: Technology, max_devices: usize) -> RfResult<Vec<TechData>>;

    /// WUPA: wakes every NFC-A listener, including sleeping ones.
    fn nfca_wake_all(&mut self) -> RfResult<()>;

    /// Selects one NFC-A listener by NFCID1 (full cascade).
    fn nfca_select(&mut self, nfcid1: &[u8]) -> RfResult<()>;

    /// ALLB_REQ: wakes every NFC-B listener.
    fn nfcb_wake_all(&mut self) -> RfResult<()>;

    fn iso_dep_activate(&mut self, request: &IsoDepRequest) -> RfResult<IsoDepInfo>;

    fn nfc_dep_activate(&mut self, request: &NfcDepRequest) -> RfResult<NfcDepInfo>;

    /// Starts a non-blocking transceive.
    fn transceive_start(&mut self, frame: TxFrame) -> RfResult<()>;

    /// Polls the transceive started for `kind`.
    fn transceive_status(&mut self, kind: InterfaceKind) -> RfResult<TransceiveStatus>;

    /// S(DESELECT).
    fn iso_dep_deselect(&mut self) -> RfResult<()>;

    /// RLS_REQ.
    fn nfc_dep_release(&mut self) -> RfResult<()>;
}
