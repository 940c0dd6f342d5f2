//! Routing identifiers of uplink PHYPayloads.
//!
//! Only the MAC header and the identifier fields are decoded; MIC and frame
//! payload are left untouched.

use crate::types::{DevAddr, Eui64};

const MTYPE_JOIN_REQUEST: u8 = 0b000;
const MTYPE_UNCONFIRMED_UP: u8 = 0b010;
const MTYPE_UNCONFIRMED_DOWN: u8 = 0b011;
const MTYPE_CONFIRMED_UP: u8 = 0b100;
const MTYPE_CONFIRMED_DOWN: u8 = 0b101;
const MTYPE_REJOIN_REQUEST: u8 = 0b110;

const JOIN_REQUEST_LENGTH: usize = 23;
const REJOIN_REQUEST_0_2_LENGTH: usize = 19;
const REJOIN_REQUEST_1_LENGTH: usize = 24;
/// MHDR + FHDR without FOpts + MIC.
const MIN_DATA_LENGTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifiersError {
    #[error("empty PHYPayload")]
    Empty,

    #[error("PHYPayload of MType {mtype:#05b} has invalid length {length}")]
    Length { mtype: u8, length: usize },

    #[error("MType {0:#05b} carries no uplink identifiers")]
    MType(u8),

    #[error("unknown rejoin type {0}")]
    RejoinType(u8),
}

/// Identifiers used to route an uplink to a Network Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UplinkIdentifiers {
    pub join_eui: Option<Eui64>,
    pub dev_eui: Option<Eui64>,
    pub dev_addr: Option<DevAddr>,
}

fn eui(bytes: &[u8]) -> Eui64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    Eui64(u64::from_le_bytes(b))
}

fn check_length(mtype: u8, phy: &[u8], expected: usize) -> Result<(), IdentifiersError> {
    if phy.len() != expected {
        return Err(IdentifiersError::Length {
            mtype,
            length: phy.len(),
        });
    }
    Ok(())
}

/// Extract routing identifiers from a plain uplink PHYPayload.
///
/// Multi-byte fields are little endian on the air.
pub fn uplink_identifiers(phy: &[u8]) -> Result<UplinkIdentifiers, IdentifiersError> {
    let mhdr = *phy.first().ok_or(IdentifiersError::Empty)?;
    let mtype = mhdr >> 5;
    match mtype {
        MTYPE_JOIN_REQUEST => {
            check_length(mtype, phy, JOIN_REQUEST_LENGTH)?;
            Ok(UplinkIdentifiers {
                join_eui: Some(eui(&phy[1..9])),
                dev_eui: Some(eui(&phy[9..17])),
                dev_addr: None,
            })
        }
        MTYPE_REJOIN_REQUEST => {
            let rejoin_type = *phy.get(1).ok_or(IdentifiersError::Length {
                mtype,
                length: phy.len(),
            })?;
            match rejoin_type {
                0 | 2 => {
                    check_length(mtype, phy, REJOIN_REQUEST_0_2_LENGTH)?;
                    Ok(UplinkIdentifiers {
                        dev_eui: Some(eui(&phy[5..13])),
                        ..Default::default()
                    })
                }
                1 => {
                    check_length(mtype, phy, REJOIN_REQUEST_1_LENGTH)?;
                    Ok(UplinkIdentifiers {
                        join_eui: Some(eui(&phy[2..10])),
                        dev_eui: Some(eui(&phy[10..18])),
                        dev_addr: None,
                    })
                }
                other => Err(IdentifiersError::RejoinType(other)),
            }
        }
        MTYPE_UNCONFIRMED_UP | MTYPE_CONFIRMED_UP | MTYPE_UNCONFIRMED_DOWN
        | MTYPE_CONFIRMED_DOWN => {
            if phy.len() < MIN_DATA_LENGTH {
                return Err(IdentifiersError::Length {
                    mtype,
                    length: phy.len(),
                });
            }
            let mut addr = [0u8; 4];
            addr.copy_from_slice(&phy[1..5]);
            Ok(UplinkIdentifiers {
                dev_addr: Some(DevAddr(u32::from_le_bytes(addr))),
                ..Default::default()
            })
        }
        other => Err(IdentifiersError::MType(other)),
    }
}
