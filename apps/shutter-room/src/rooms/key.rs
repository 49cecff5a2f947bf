use std::fmt;

use serde::Serialize;
use thiserror::Error;

const ROOM_PREFIX: &str = "acc:";
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Canonical room identifier of the form `acc:<digits>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomKey(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("room is missing")]
    MissingRoom,
    #[error("room {0:?} does not look like acc:<id>")]
    MalformedRoom(String),
    #[error("device_id is missing")]
    MissingDevice,
    #[error("device_id exceeds {MAX_DEVICE_ID_LEN} characters")]
    DeviceTooLong,
}

impl RoomKey {
    /// Trims the raw value, matches the `acc:` prefix case-insensitively and
    /// requires a non-empty numeric account id after it.
    pub fn parse(raw: &str) -> Result<Self, ParamError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParamError::MissingRoom);
        }

        let account = trimmed
            .get(..ROOM_PREFIX.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(ROOM_PREFIX))
            .and_then(|_| trimmed.get(ROOM_PREFIX.len()..))
            .ok_or_else(|| ParamError::MalformedRoom(trimmed.to_string()))?;

        if account.is_empty() || !account.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParamError::MalformedRoom(trimmed.to_string()));
        }

        Ok(Self(format!("{ROOM_PREFIX}{account}")))
    }

    pub fn for_account(account_id: &str) -> Result<Self, ParamError> {
        Self::parse(&format!("{ROOM_PREFIX}{account_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_device_id(raw: &str) -> Result<String, ParamError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParamError::MissingDevice);
    }
    if trimmed.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(ParamError::DeviceTooLong);
    }
    Ok(trimmed.to_string())
}
