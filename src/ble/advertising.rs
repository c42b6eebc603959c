//! Advertising payloads and the advertiser.
//!
//! An advertisement is a sequence of AD structures `[len][type][data...]`
//! that must fit a single 31-byte advertising PDU.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::ble::event::{GapEvent, GattStatus};
use crate::ble::stack::{AdvertisingParams, GattStack};
use crate::ble::uuid::BleUuid;
use crate::error::{Error, Result};

/// Maximum length of an advertisement or scan response payload.
pub const MAX_ADVERTISEMENT_LEN: usize = 31;

/// Flag: LE general discoverable mode.
pub const FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0x02;
/// Flag: BR/EDR not supported.
pub const FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0x04;

/// AD structure types used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdType {
    /// Discoverability flags.
    Flags = 0x01,
    /// Incomplete list of 16-bit service UUIDs.
    IncompleteServices16 = 0x02,
    /// Complete list of 16-bit service UUIDs.
    CompleteServices16 = 0x03,
    /// Incomplete list of 128-bit service UUIDs.
    IncompleteServices128 = 0x06,
    /// Complete list of 128-bit service UUIDs.
    CompleteServices128 = 0x07,
    /// Shortened local name.
    ShortenedName = 0x08,
    /// Complete local name.
    CompleteName = 0x09,
    /// Transmit power level.
    TxPowerLevel = 0x0A,
    /// Appearance.
    Appearance = 0x19,
    /// Manufacturer specific data.
    ManufacturerData = 0xFF,
}

impl AdType {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Flags),
            0x02 => Some(Self::IncompleteServices16),
            0x03 => Some(Self::CompleteServices16),
            0x06 => Some(Self::IncompleteServices128),
            0x07 => Some(Self::CompleteServices128),
            0x08 => Some(Self::ShortenedName),
            0x09 => Some(Self::CompleteName),
            0x0A => Some(Self::TxPowerLevel),
            0x19 => Some(Self::Appearance),
            0xFF => Some(Self::ManufacturerData),
            _ => None,
        }
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }
}

/// One AD structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdField {
    /// Raw AD type.
    pub ad_type: u8,
    /// Field data without the length and type bytes.
    pub data: Bytes,
}

/// Builder for an advertisement or scan response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    fields: Vec<AdField>,
}

impl AdvertisementData {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, ad_type: AdType, data: impl Into<Bytes>) -> Self {
        self.fields.push(AdField {
            ad_type: ad_type.to_raw(),
            data: data.into(),
        });
        self
    }

    /// Add the discoverability flags.
    pub fn with_flags(self, flags: u8) -> Self {
        self.push(AdType::Flags, vec![flags])
    }

    /// Add the complete local name.
    pub fn with_name(self, name: &str) -> Self {
        self.push(AdType::CompleteName, name.as_bytes().to_vec())
    }

    /// Add a shortened local name.
    pub fn with_short_name(self, name: &str) -> Self {
        self.push(AdType::ShortenedName, name.as_bytes().to_vec())
    }

    /// Add service UUID lists. 16-bit-representable UUIDs go into one list,
    /// the rest into a 128-bit list.
    pub fn with_service_uuids(mut self, uuids: &[BleUuid], complete: bool) -> Self {
        let mut short = BytesMut::new();
        let mut long = BytesMut::new();
        for uuid in uuids {
            match uuid.as_u16() {
                Some(value) => short.put_u16_le(value),
                None => long.put_u128_le(uuid.as_u128()),
            }
        }

        if !short.is_empty() {
            let ad_type = if complete {
                AdType::CompleteServices16
            } else {
                AdType::IncompleteServices16
            };
            self = self.push(ad_type, short.freeze());
        }
        if !long.is_empty() {
            let ad_type = if complete {
                AdType::CompleteServices128
            } else {
                AdType::IncompleteServices128
            };
            self = self.push(ad_type, long.freeze());
        }
        self
    }

    /// Add manufacturer specific data.
    pub fn with_manufacturer_data(self, company_id: u16, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(2 + data.len());
        buf.put_u16_le(company_id);
        buf.put_slice(data);
        self.push(AdType::ManufacturerData, buf.freeze())
    }

    /// Add the appearance value.
    pub fn with_appearance(self, appearance: u16) -> Self {
        self.push(AdType::Appearance, appearance.to_le_bytes().to_vec())
    }

    /// Add the transmit power level in dBm.
    pub fn with_tx_power(self, dbm: i8) -> Self {
        self.push(AdType::TxPowerLevel, vec![dbm as u8])
    }

    /// The fields added so far.
    pub fn fields(&self) -> &[AdField] {
        &self.fields
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.fields.iter().map(|f| 2 + f.data.len()).sum()
    }

    /// Check if no field was added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode to AD structures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdvertisingPayloadTooLong`] if the payload exceeds
    /// 31 bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let len = self.len();
        if len > MAX_ADVERTISEMENT_LEN {
            return Err(Error::AdvertisingPayloadTooLong {
                len,
                max: MAX_ADVERTISEMENT_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(len);
        for field in &self.fields {
            buf.put_u8((field.data.len() + 1) as u8);
            buf.put_u8(field.ad_type);
            buf.put_slice(&field.data);
        }
        Ok(buf.freeze())
    }

    /// Split a raw payload into AD structures. Zero-length padding is skipped
    /// and a truncated trailing structure ends the scan.
    pub fn parse(raw: &[u8]) -> Self {
        let mut fields = Vec::new();
        let mut i = 0usize;
        while i < raw.len() {
            let len = raw[i] as usize;
            i += 1;
            if len == 0 {
                continue;
            }
            if i + len > raw.len() {
                break;
            }
            fields.push(AdField {
                ad_type: raw[i],
                data: Bytes::copy_from_slice(&raw[i + 1..i + len]),
            });
            i += len;
        }
        Self { fields }
    }

    /// First field of the given type.
    pub fn field(&self, ad_type: AdType) -> Option<&AdField> {
        self.fields.iter().find(|f| f.ad_type == ad_type.to_raw())
    }
}

#[derive(Debug)]
struct AdvertisingState {
    params: AdvertisingParams,
    service_uuids: Vec<BleUuid>,
    custom_data: Option<AdvertisementData>,
    scan_response: Option<AdvertisementData>,
    data_pending: bool,
    advertising: bool,
}

/// Advertiser of a server.
pub struct Advertising {
    stack: Arc<dyn GattStack>,
    state: RwLock<AdvertisingState>,
}

impl Advertising {
    /// Create an advertiser with default parameters.
    pub fn new(stack: Arc<dyn GattStack>) -> Self {
        Self {
            stack,
            state: RwLock::new(AdvertisingState {
                params: AdvertisingParams::default(),
                service_uuids: Vec::new(),
                custom_data: None,
                scan_response: None,
                data_pending: true,
                advertising: false,
            }),
        }
    }

    /// Advertise a service UUID in the default payload.
    pub fn add_service_uuid(&self, uuid: impl Into<BleUuid>) {
        let uuid = uuid.into();
        let mut state = self.state.write();
        if !state.service_uuids.contains(&uuid) {
            state.service_uuids.push(uuid);
            state.data_pending = true;
        }
    }

    /// Replace the default payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdvertisingPayloadTooLong`] if `data` does not fit.
    pub fn set_advertisement_data(&self, data: AdvertisementData) -> Result<()> {
        data.to_bytes()?;
        let mut state = self.state.write();
        state.custom_data = Some(data);
        state.data_pending = true;
        Ok(())
    }

    /// Set the scan response payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdvertisingPayloadTooLong`] if `data` does not fit.
    pub fn set_scan_response_data(&self, data: AdvertisementData) -> Result<()> {
        data.to_bytes()?;
        let mut state = self.state.write();
        state.scan_response = Some(data);
        state.data_pending = true;
        Ok(())
    }

    /// Replace the advertising parameters.
    pub fn set_params(&self, params: AdvertisingParams) {
        self.state.write().params = params;
    }

    /// Whether advertising was started and not stopped since.
    pub fn is_advertising(&self) -> bool {
        self.state.read().advertising
    }

    /// The payload that `start` configures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdvertisingPayloadTooLong`] if the default payload
    /// grew past the limit.
    pub fn advertisement_payload(&self) -> Result<Bytes> {
        let state = self.state.read();
        match &state.custom_data {
            Some(data) => data.to_bytes(),
            None => AdvertisementData::new()
                .with_flags(FLAG_LE_GENERAL_DISCOVERABLE | FLAG_BR_EDR_NOT_SUPPORTED)
                .with_service_uuids(&state.service_uuids, true)
                .to_bytes(),
        }
    }

    /// Configure the payload if it changed, then start advertising.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stack`] if a request fails.
    pub fn start(&self) -> Result<()> {
        if self.state.read().data_pending {
            let payload = self.advertisement_payload()?;
            self.stack
                .set_advertising_data(&payload, false)
                .map_err(|code| Error::stack("set_advertising_data", code))?;

            let scan_response = self.state.read().scan_response.clone();
            if let Some(data) = scan_response {
                self.stack
                    .set_advertising_data(&data.to_bytes()?, true)
                    .map_err(|code| Error::stack("set_scan_response_data", code))?;
            }
            self.state.write().data_pending = false;
        }

        let params = self.state.read().params;
        self.stack.start_advertising(&params).map_err(|code| {
            error!("start_advertising failed: {}", code);
            Error::stack("start_advertising", code)
        })?;
        self.state.write().advertising = true;
        info!("Advertising started");
        Ok(())
    }

    /// Stop advertising.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stack`] if the request fails.
    pub fn stop(&self) -> Result<()> {
        self.stack.stop_advertising().map_err(|code| {
            error!("stop_advertising failed: {}", code);
            Error::stack("stop_advertising", code)
        })?;
        self.state.write().advertising = false;
        debug!("Advertising stopped");
        Ok(())
    }

    /// Track advertising completions reported by GAP.
    pub(crate) fn handle_gap_event(&self, event: &GapEvent) {
        match event {
            GapEvent::AdvDataSetComplete { status } => {
                debug!(%status, "Advertising data set");
            }
            GapEvent::AdvStartComplete { status } if *status != GattStatus::OK => {
                warn!(%status, "Advertising failed to start");
                self.state.write().advertising = false;
            }
            GapEvent::AdvStopComplete { status } if *status != GattStatus::OK => {
                warn!(%status, "Advertising failed to stop");
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for Advertising {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertising")
            .field("state", &*self.state.read())
            .finish()
    }
}
