//! UDS service and data-identifier tables.
//!
//! The ECU dispatcher and the tester client both build their payloads
//! from these definitions, so the wire encoding of every data
//! identifier lives here exactly once.

/// UDS service IDs handled by the simulator.
pub mod service_id {
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
}

/// Routine identifiers for RoutineControl (0x31).
pub mod routine_id {
    /// Enter the programming session; gates the 0x34/0x36/0x37 flow.
    pub const ENTER_PROGRAMMING_SESSION: u16 = 0xFF00;
}

/// RequestDownload positive-response parameters: lengthFormatIdentifier
/// 0x20 and a maximum block length of 4096 bytes.
pub const LENGTH_FORMAT_IDENTIFIER: u8 = 0x20;
pub const MAX_BLOCK_LENGTH: u16 = 0x1000;

/// Positive response SID for a request SID (ISO 14229: request + 0x40).
pub const fn positive_sid(sid: u8) -> u8 {
    sid + 0x40
}

/// How a data identifier's one-byte wire value maps to its NVRAM text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// The wire byte is the value itself.
    Integer,
    /// The wire byte is the value scaled by ten, giving a 0.0–25.5
    /// range with 0.1 resolution.
    TenthsScaled,
}

/// A data identifier known to the simulator: its 16-bit DID, the NVRAM
/// key it maps to, its wire encoding, and whether WriteDataByIdentifier
/// may touch it.
#[derive(Debug, Clone, Copy)]
pub struct DataId {
    pub did: u16,
    pub key: &'static str,
    pub encoding: Encoding,
    pub writable: bool,
}

impl DataId {
    /// Encode an NVRAM value (parsed as float) into the wire byte.
    pub fn encode(&self, value: f64) -> u8 {
        match self.encoding {
            Encoding::Integer => value as u8,
            Encoding::TenthsScaled => (value * 10.0).round() as u8,
        }
    }

    /// Decode a wire byte into the numeric value it represents.
    pub fn decode(&self, raw: u8) -> f64 {
        match self.encoding {
            Encoding::Integer => raw as f64,
            Encoding::TenthsScaled => raw as f64 / 10.0,
        }
    }

    /// Render a wire byte as the NVRAM text a write stores.
    pub fn raw_to_text(&self, raw: u8) -> String {
        match self.encoding {
            Encoding::Integer => raw.to_string(),
            Encoding::TenthsScaled => (raw as f64 / 10.0).to_string(),
        }
    }
}

/// The fixed data-identifier table.
pub const DATA_IDS: &[DataId] = &[
    DataId {
        did: 0xF101,
        key: "LEAD_VEHICLE_SPEED",
        encoding: Encoding::Integer,
        writable: true,
    },
    DataId {
        did: 0xF102,
        key: "ACC_GAP_SETTING",
        encoding: Encoding::Integer,
        writable: true,
    },
    DataId {
        did: 0xF103,
        key: "OWN_VEHICLE_SPEED",
        encoding: Encoding::Integer,
        writable: false,
    },
    DataId {
        did: 0xD101,
        key: "ACC_KP",
        encoding: Encoding::TenthsScaled,
        writable: true,
    },
    DataId {
        did: 0xD102,
        key: "ACC_KI",
        encoding: Encoding::TenthsScaled,
        writable: true,
    },
    DataId {
        did: 0xD103,
        key: "ACC_MAX_ACCEL",
        encoding: Encoding::TenthsScaled,
        writable: true,
    },
    DataId {
        did: 0xD104,
        key: "ACC_MAX_DECEL",
        encoding: Encoding::TenthsScaled,
        writable: true,
    },
];

/// Look up a DID in the table.
pub fn lookup(did: u16) -> Option<&'static DataId> {
    DATA_IDS.iter().find(|d| d.did == did)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_known_dids() {
        assert_eq!(lookup(0xF101).unwrap().key, "LEAD_VEHICLE_SPEED");
        assert_eq!(lookup(0xD104).unwrap().key, "ACC_MAX_DECEL");
        assert!(lookup(0xBEEF).is_none());
    }

    #[test]
    fn own_speed_is_read_only() {
        assert!(!lookup(0xF103).unwrap().writable);
    }

    #[test]
    fn integer_encoding_truncates() {
        let did = lookup(0xF101).unwrap();
        assert_eq!(did.encode(65.0), 0x41);
        assert_eq!(did.encode(65.9), 65);
    }

    #[test]
    fn scaled_encoding_rounds_tenths() {
        let kp = lookup(0xD101).unwrap();
        assert_eq!(kp.encode(0.4), 4);
        assert_eq!(kp.encode(0.45), 5);
        assert_eq!(kp.encode(25.5), 255);
    }

    #[test]
    fn scaled_round_trip_over_full_byte_range() {
        let kp = lookup(0xD101).unwrap();
        for raw in 0..=u8::MAX {
            let text = kp.raw_to_text(raw);
            let value: f64 = text.parse().unwrap();
            assert_eq!(kp.encode(value), raw, "byte {raw} via text {text:?}");
        }
    }

    #[test]
    fn raw_to_text_matches_nvram_format() {
        assert_eq!(lookup(0xF102).unwrap().raw_to_text(3), "3");
        assert_eq!(lookup(0xD101).unwrap().raw_to_text(5), "0.5");
        assert_eq!(lookup(0xD103).unwrap().raw_to_text(20), "2");
    }

    #[test]
    fn positive_sids() {
        assert_eq!(positive_sid(service_id::READ_DATA_BY_ID), 0x62);
        assert_eq!(positive_sid(service_id::WRITE_DATA_BY_ID), 0x6E);
        assert_eq!(positive_sid(service_id::ROUTINE_CONTROL), 0x71);
        assert_eq!(positive_sid(service_id::REQUEST_TRANSFER_EXIT), 0x77);
    }
}
