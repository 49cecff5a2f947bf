//! Maps an upgrade request to the account it was authenticated for.
//!
//! Authentication itself happens upstream; this crate only consumes the
//! result. The resolver decides whether a requested room may be entered.

use axum::http::HeaderMap;
use thiserror::Error;

use crate::rooms::RoomKey;

pub const ACCOUNT_HEADER: &str = "x-account-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrincipalError {
    #[error("no authenticated account on the request")]
    Unauthorized,
    #[error("room {room} does not belong to account {account_id}")]
    RoomMismatch { room: RoomKey, account_id: String },
}

impl PrincipalError {
    pub fn reason(&self) -> &'static str {
        match self {
            PrincipalError::Unauthorized => "unauthorized",
            PrincipalError::RoomMismatch { .. } => "room_mismatch",
        }
    }
}

pub trait PrincipalResolver: Send + Sync {
    /// Resolves the caller's principal. `Ok(None)` means the deployment does
    /// not bind rooms to accounts.
    fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>, PrincipalError>;

    /// Checks that `room` may be entered by the request's principal.
    fn authorize(&self, headers: &HeaderMap, room: &RoomKey) -> Result<(), PrincipalError> {
        let Some(principal) = self.resolve(headers)? else {
            return Ok(());
        };
        match RoomKey::for_account(&principal.account_id) {
            Ok(expected) if &expected == room => Ok(()),
            _ => Err(PrincipalError::RoomMismatch {
                room: room.clone(),
                account_id: principal.account_id,
            }),
        }
    }
}

/// Trusts the room key as supplied by the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenResolver;

impl PrincipalResolver for OpenResolver {
    fn resolve(&self, _headers: &HeaderMap) -> Result<Option<Principal>, PrincipalError> {
        Ok(None)
    }
}

/// Reads the account id an authenticating proxy put in `x-account-id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccountHeaderResolver;

impl PrincipalResolver for AccountHeaderResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>, PrincipalError> {
        let account_id = headers
            .get(ACCOUNT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(PrincipalError::Unauthorized)?;
        Ok(Some(Principal {
            account_id: account_id.to_string(),
        }))
    }
}
