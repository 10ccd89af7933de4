//! Vendor-independent view of a single BLE notification.
//!
//! [`decode_opcode`] is total: it never fails and never panics. Anything it
//! cannot classify comes back as [`DecodedFrame::Unknown`] with the raw
//! bytes, and the session decides whether to log and drop it.

use uuid::Uuid;

use crate::blucon::{self, BluconOpcode, PatchInfo};
use crate::bubble::BubbleResponse;
use crate::dexcom::{
    self, AuthChallengeRx, AuthRequestRx, BackfillRecord, BatteryStatusRx, DexcomAlgorithmState,
    DexcomGlucose, DexcomOpcode, GlucoseBackfillRx, TransmitterTimeRx,
};
use crate::error::ProtocolError;
use crate::miaomiao::MiaoMiaoResponse;
use crate::types::{SensorState, TransmitterKind};
use crate::uuid::DEXCOM_BACKFILL;

/// Battery information carried by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatteryStatus {
    /// Level in percent, possibly inferred from a low-battery message.
    Percent(u8),
    /// Dexcom voltage report.
    Dexcom(BatteryStatusRx),
}

/// Sensor lifecycle information carried by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorStatus {
    /// The bridge detected a different sensor.
    NewSensorDetected,
    /// Libre lifecycle state.
    Libre(SensorState),
    /// Dexcom algorithm state.
    Dexcom(DexcomAlgorithmState),
    /// Dexcom transmitter clock and session start.
    TransmitterTime(TransmitterTimeRx),
}

/// Device-reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    /// No sensor within NFC range of the bridge.
    SensorNotDetected,
    /// The bridge gave up waiting for the next command.
    CommandTimeout,
    /// A recognised opcode carried an unusable payload.
    Malformed(ProtocolError),
}

/// One parsed notification payload.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DecodedFrame {
    GlucoseReading(DexcomGlucose),
    BackfillEntry(BackfillRecord),
    AuthChallenge(AuthChallengeRx),
    /// G5/G6 challenge the host must answer.
    AuthRequest(AuthRequestRx),
    /// G5/G6 confirmation that a requested backfill range was sent.
    BackfillComplete(GlucoseBackfillRx),
    PatchInfo(PatchInfo),
    BatteryStatus(BatteryStatus),
    SensorState(SensorStatus),
    Error(DeviceFault),
    /// A Blucon protocol step; `payload` is the full notification.
    Blucon {
        opcode: BluconOpcode,
        payload: Vec<u8>,
    },
    /// A MiaoMiao response without further structure (data packet start,
    /// frequency change acknowledgement).
    MiaoMiao(MiaoMiaoResponse),
    /// A Bubble or Atom response; `payload` is the full notification.
    Bubble {
        response: BubbleResponse,
        payload: Vec<u8>,
    },
    /// A recognised Dexcom opcode without a payload of interest.
    Dexcom(DexcomOpcode),
    /// A well-formed frame with nothing usable, e.g. an unreliable backfill record.
    Ignored(Vec<u8>),
    Unknown(Vec<u8>),
}

impl DecodedFrame {
    /// Whether the frame was not recognised at all.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, DecodedFrame::Unknown(_))
    }
}

/// Decode one notification by its opcode prefix.
#[must_use]
pub fn decode_opcode(vendor: TransmitterKind, bytes: &[u8]) -> DecodedFrame {
    match vendor {
        TransmitterKind::Blucon => decode_blucon(bytes),
        TransmitterKind::MiaoMiao => decode_miaomiao(bytes),
        TransmitterKind::Bubble | TransmitterKind::Atom => decode_bubble(bytes),
        TransmitterKind::DexcomG5 | TransmitterKind::DexcomG6 | TransmitterKind::DexcomG7 => {
            decode_dexcom(bytes)
        }
    }
}

/// Decode one notification, taking the characteristic it arrived on into account.
///
/// G7 backfill records carry no opcode and are recognised by their
/// characteristic. The G5/G6 backfill characteristic carries a sequenced
/// byte stream that only makes sense reassembled, see
/// [`dexcom::BackfillStream`].
#[must_use]
pub fn decode_on(vendor: TransmitterKind, characteristic: Uuid, bytes: &[u8]) -> DecodedFrame {
    if vendor == TransmitterKind::DexcomG7 && characteristic == DEXCOM_BACKFILL {
        return match dexcom::decode_backfill_record(bytes) {
            Ok(Some(record)) => DecodedFrame::BackfillEntry(record),
            Ok(None) => DecodedFrame::Ignored(bytes.to_vec()),
            Err(e) => DecodedFrame::Error(DeviceFault::Malformed(e)),
        };
    }
    decode_opcode(vendor, bytes)
}

fn decode_blucon(bytes: &[u8]) -> DecodedFrame {
    let Some(opcode) = BluconOpcode::decode(bytes) else {
        return DecodedFrame::Unknown(bytes.to_vec());
    };
    match opcode {
        BluconOpcode::GetPatchInfoResponse => match PatchInfo::parse(bytes) {
            Ok(info) => DecodedFrame::PatchInfo(info),
            Err(e) => DecodedFrame::Error(DeviceFault::Malformed(e)),
        },
        BluconOpcode::BatteryLow1 | BluconOpcode::BatteryLow2 => match blucon::battery_indication(bytes) {
            Some(percent) => DecodedFrame::BatteryStatus(BatteryStatus::Percent(percent)),
            None => DecodedFrame::Unknown(bytes.to_vec()),
        },
        BluconOpcode::Error14 => DecodedFrame::Error(DeviceFault::CommandTimeout),
        BluconOpcode::SensorNotDetected => DecodedFrame::Error(DeviceFault::SensorNotDetected),
        opcode => DecodedFrame::Blucon {
            opcode,
            payload: bytes.to_vec(),
        },
    }
}

fn decode_miaomiao(bytes: &[u8]) -> DecodedFrame {
    let Some(&first) = bytes.first() else {
        return DecodedFrame::Unknown(Vec::new());
    };
    match MiaoMiaoResponse::decode(first) {
        MiaoMiaoResponse::NewSensor => DecodedFrame::SensorState(SensorStatus::NewSensorDetected),
        MiaoMiaoResponse::NoSensor => DecodedFrame::Error(DeviceFault::SensorNotDetected),
        MiaoMiaoResponse::Unknown(_) => DecodedFrame::Unknown(bytes.to_vec()),
        response => DecodedFrame::MiaoMiao(response),
    }
}

fn decode_bubble(bytes: &[u8]) -> DecodedFrame {
    let Some(&first) = bytes.first() else {
        return DecodedFrame::Unknown(Vec::new());
    };
    match BubbleResponse::decode(first) {
        BubbleResponse::NoSensor => DecodedFrame::Error(DeviceFault::SensorNotDetected),
        BubbleResponse::Unknown(_) => DecodedFrame::Unknown(bytes.to_vec()),
        response => DecodedFrame::Bubble {
            response,
            payload: bytes.to_vec(),
        },
    }
}

fn decode_dexcom(bytes: &[u8]) -> DecodedFrame {
    let Some(&first) = bytes.first() else {
        return DecodedFrame::Unknown(Vec::new());
    };
    let malformed = |e| DecodedFrame::Error(DeviceFault::Malformed(e));
    match DexcomOpcode::from(first) {
        DexcomOpcode::GlucoseRx | DexcomOpcode::GlucoseG6Rx | DexcomOpcode::GlucoseG6Tx => {
            match dexcom::decode_glucose_message(bytes) {
                Ok(g) => DecodedFrame::GlucoseReading(g),
                Err(e) => malformed(e),
            }
        }
        DexcomOpcode::AuthChallengeRx => match AuthChallengeRx::parse(bytes) {
            Ok(a) => DecodedFrame::AuthChallenge(a),
            Err(e) => malformed(e),
        },
        DexcomOpcode::AuthRequestRx => match AuthRequestRx::parse(bytes) {
            Ok(a) => DecodedFrame::AuthRequest(a),
            Err(e) => malformed(e),
        },
        DexcomOpcode::GlucoseBackfillRx => match GlucoseBackfillRx::parse(bytes) {
            Ok(b) => DecodedFrame::BackfillComplete(b),
            Err(e) => malformed(e),
        },
        DexcomOpcode::BatteryStatusRx => match BatteryStatusRx::parse(bytes) {
            Ok(b) => DecodedFrame::BatteryStatus(BatteryStatus::Dexcom(b)),
            Err(e) => malformed(e),
        },
        DexcomOpcode::TransmitterTimeRx => match TransmitterTimeRx::parse(bytes) {
            Ok(t) => DecodedFrame::SensorState(SensorStatus::TransmitterTime(t)),
            Err(e) => malformed(e),
        },
        DexcomOpcode::Unknown(_) => DecodedFrame::Unknown(bytes.to_vec()),
        opcode => DecodedFrame::Dexcom(opcode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dexcom::fixtures::{g7_backfill, g7_glucose};

    #[test]
    fn test_blucon_frames() {
        assert!(matches!(
            decode_opcode(TransmitterKind::Blucon, &[0xcb, 0x01, 0x00, 0x00]),
            DecodedFrame::Blucon { opcode: BluconOpcode::WakeUpRequest, .. }
        ));
        assert_eq!(
            decode_opcode(TransmitterKind::Blucon, &[0xcb, 0xdb, 0x00, 0x00]),
            DecodedFrame::BatteryStatus(BatteryStatus::Percent(2))
        );
        assert_eq!(
            decode_opcode(TransmitterKind::Blucon, &[0x8b, 0x1a, 0x02, 0x00, 0x0f]),
            DecodedFrame::Error(DeviceFault::SensorNotDetected)
        );
        assert!(matches!(
            decode_opcode(TransmitterKind::Blucon, &[0x8b, 0xd9, 0x00]),
            DecodedFrame::Error(DeviceFault::Malformed(_))
        ));
        assert!(decode_opcode(TransmitterKind::Blucon, &[0x42]).is_unknown());
    }

    #[test]
    fn test_miaomiao_frames() {
        assert_eq!(
            decode_opcode(TransmitterKind::MiaoMiao, &[0x32]),
            DecodedFrame::SensorState(SensorStatus::NewSensorDetected)
        );
        assert_eq!(
            decode_opcode(TransmitterKind::MiaoMiao, &[0x28, 0x01]),
            DecodedFrame::MiaoMiao(MiaoMiaoResponse::DataPacket)
        );
        assert!(decode_opcode(TransmitterKind::MiaoMiao, &[]).is_unknown());
    }

    #[test]
    fn test_dexcom_frames() {
        let frame = decode_opcode(TransmitterKind::DexcomG7, &g7_glucose(10, 1, 0, 100, 6));
        assert!(matches!(frame, DecodedFrame::GlucoseReading(g) if g.glucose == Some(100)));
        assert!(matches!(
            decode_opcode(TransmitterKind::DexcomG7, &[0x05, 0x01, 0x01]),
            DecodedFrame::AuthChallenge(AuthChallengeRx { authenticated: true, paired: true })
        ));
        assert_eq!(
            decode_opcode(TransmitterKind::DexcomG7, &[0x59]),
            DecodedFrame::Dexcom(DexcomOpcode::BackfillFinished)
        );
        assert!(decode_opcode(TransmitterKind::DexcomG7, &[0x02, 0x00]).is_unknown());
    }

    #[test]
    fn test_bubble_frames() {
        for kind in [TransmitterKind::Bubble, TransmitterKind::Atom] {
            assert!(matches!(
                decode_opcode(kind, &[0x82, 0x00, 0x00, 0x00, 0x11]),
                DecodedFrame::Bubble { response: BubbleResponse::DataPacket, .. }
            ));
            assert_eq!(
                decode_opcode(kind, &[0xBF]),
                DecodedFrame::Error(DeviceFault::SensorNotDetected)
            );
            assert!(decode_opcode(kind, &[0x28]).is_unknown());
        }
    }

    #[test]
    fn test_g5_frames() {
        let mut challenge = vec![0x03];
        challenge.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_opcode(TransmitterKind::DexcomG5, &challenge),
            DecodedFrame::AuthRequest(_)
        ));
        let mut confirm = vec![0x51, 0x00, 0x01, 0x00];
        confirm.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_opcode(TransmitterKind::DexcomG6, &confirm),
            DecodedFrame::BackfillComplete(_)
        ));
        assert!(matches!(
            decode_opcode(TransmitterKind::DexcomG6, &[0x51, 0x00]),
            DecodedFrame::Error(DeviceFault::Malformed(_))
        ));
    }

    #[test]
    fn test_backfill_routing() {
        let frame = decode_on(
            TransmitterKind::DexcomG7,
            DEXCOM_BACKFILL,
            &g7_backfill(600, 140, 0x06),
        );
        assert!(matches!(frame, DecodedFrame::BackfillEntry(r) if r.glucose == 140));
        let frame = decode_on(
            TransmitterKind::DexcomG7,
            DEXCOM_BACKFILL,
            &g7_backfill(600, 140, 0x02),
        );
        assert!(matches!(frame, DecodedFrame::Ignored(_)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_is_total(
                data in proptest::collection::vec(any::<u8>(), 0..400),
                kind in prop::sample::select(TransmitterKind::ALL.to_vec()),
            ) {
                let _ = decode_opcode(kind, &data);
                let _ = decode_on(kind, DEXCOM_BACKFILL, &data);
            }
        }
    }
}
