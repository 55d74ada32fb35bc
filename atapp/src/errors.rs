// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Framework error types
//!
//! Every error kind maps to a stable negative `i32` code. The codes travel
//! on the wire (`ret` header field) and in synthesized forward responses,
//! while the library surfaces the typed [AppError] through its `Result`s.

use std::fmt::Display;

/// Errors which can result from atapp operations. `0` is reserved for
/// success and is never represented here; a fallible operation that
/// succeeds returns `Ok(_)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppError {
    /// The app has not completed `init()` yet
    NotInited,
    /// `init()` was called on an already-initialized app
    AlreadyInited,
    /// The app already went through a full shutdown
    AlreadyClosed,
    /// No configuration file was supplied
    MissingConfigureFile,
    /// The configuration file could not be read or parsed
    LoadConfigureFile,
    /// The tick timer could not be installed
    SetupTimer,
    /// The default bus connector failed to start listening
    SetupBus,
    /// The pid file could not be written
    WritePidFile,
    /// The transport rejected a send operation
    SendFailed,
    /// A per-endpoint buffer limit (count or bytes) was exceeded
    BufferLimit,
    /// No node with the requested id/name/key is known
    NodeNotFound,
    /// The target endpoint is closing and accepts no new messages
    Closing,
    /// A buffered message expired before any connection became ready
    Timeout,
    /// An empty command was submitted to a running instance
    CommandIsNull,
    /// The running instance advertises no usable listen address
    NoAvailableAddress,
    /// Connecting to the peer instance failed
    ConnectPeerFailed,
    /// The operation requires a discovery catalog and none is populated
    DiscoveryDisabled,
    /// Malformed data was received or supplied
    BadData,
    /// No registered connector supports the requested address scheme
    ChannelNotSupported,
    /// Invalid parameters
    Params,
}

impl AppError {
    /// The stable numeric code for this error kind. All codes are negative;
    /// `0` means success and positive values are never produced.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotInited => -1001,
            Self::AlreadyInited => -1002,
            Self::WritePidFile => -1003,
            Self::SetupTimer => -1004,
            Self::AlreadyClosed => -1005,
            Self::MissingConfigureFile => -1006,
            Self::LoadConfigureFile => -1007,
            Self::SetupBus => -1101,
            Self::SendFailed => -1102,
            Self::CommandIsNull => -1801,
            Self::NoAvailableAddress => -1802,
            Self::ConnectPeerFailed => -1803,
            Self::DiscoveryDisabled => -1804,
            Self::BufferLimit => -2001,
            Self::NodeNotFound => -2002,
            Self::Closing => -2003,
            Self::Timeout => -2004,
            Self::BadData => -2005,
            Self::ChannelNotSupported => -2006,
            Self::Params => -2007,
        }
    }

    /// Map a numeric code back to its error kind.
    ///
    /// Returns [None] for `0` (success) and for codes outside the taxonomy,
    /// which peers running other versions may legally produce.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1001 => Some(Self::NotInited),
            -1002 => Some(Self::AlreadyInited),
            -1003 => Some(Self::WritePidFile),
            -1004 => Some(Self::SetupTimer),
            -1005 => Some(Self::AlreadyClosed),
            -1006 => Some(Self::MissingConfigureFile),
            -1007 => Some(Self::LoadConfigureFile),
            -1101 => Some(Self::SetupBus),
            -1102 => Some(Self::SendFailed),
            -1801 => Some(Self::CommandIsNull),
            -1802 => Some(Self::NoAvailableAddress),
            -1803 => Some(Self::ConnectPeerFailed),
            -1804 => Some(Self::DiscoveryDisabled),
            -2001 => Some(Self::BufferLimit),
            -2002 => Some(Self::NodeNotFound),
            -2003 => Some(Self::Closing),
            -2004 => Some(Self::Timeout),
            -2005 => Some(Self::BadData),
            -2006 => Some(Self::ChannelNotSupported),
            -2007 => Some(Self::Params),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInited => write!(f, "App is not initialized"),
            Self::AlreadyInited => write!(f, "App cannot be initialized more than once"),
            Self::AlreadyClosed => write!(f, "App is already closed"),
            Self::MissingConfigureFile => write!(f, "Missing configure file"),
            Self::LoadConfigureFile => write!(f, "Failed to load configure file"),
            Self::SetupTimer => write!(f, "Failed to setup tick timer"),
            Self::SetupBus => write!(f, "Failed to setup bus connector"),
            Self::WritePidFile => write!(f, "Failed to write pid file"),
            Self::SendFailed => write!(f, "Transport rejected the send operation"),
            Self::BufferLimit => write!(f, "Endpoint send buffer limit exceeded"),
            Self::NodeNotFound => write!(f, "Target node not found"),
            Self::Closing => write!(f, "Target endpoint is closing"),
            Self::Timeout => write!(f, "Message expired before delivery"),
            Self::CommandIsNull => write!(f, "Command is empty"),
            Self::NoAvailableAddress => write!(f, "No available listen address"),
            Self::ConnectPeerFailed => write!(f, "Failed to connect to peer instance"),
            Self::DiscoveryDisabled => write!(f, "Discovery catalog is empty or disabled"),
            Self::BadData => write!(f, "Malformed data"),
            Self::ChannelNotSupported => write!(f, "Address scheme not supported by any connector"),
            Self::Params => write!(f, "Invalid parameters"),
        }
    }
}

impl std::error::Error for AppError {}

/// Convert a raw status code returned by a connector into a `Result`.
///
/// Unknown negative codes collapse to [AppError::SendFailed] so callers
/// always get a typed error out of the transport boundary.
pub fn result_from_code(code: i32) -> Result<(), AppError> {
    if code == 0 {
        return Ok(());
    }
    Err(AppError::from_code(code).unwrap_or(AppError::SendFailed))
}

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn codes_round_trip() {
        let all = [
            AppError::NotInited,
            AppError::AlreadyInited,
            AppError::AlreadyClosed,
            AppError::MissingConfigureFile,
            AppError::LoadConfigureFile,
            AppError::SetupTimer,
            AppError::SetupBus,
            AppError::WritePidFile,
            AppError::SendFailed,
            AppError::BufferLimit,
            AppError::NodeNotFound,
            AppError::Closing,
            AppError::Timeout,
            AppError::CommandIsNull,
            AppError::NoAvailableAddress,
            AppError::ConnectPeerFailed,
            AppError::DiscoveryDisabled,
            AppError::BadData,
            AppError::ChannelNotSupported,
            AppError::Params,
        ];
        for kind in all {
            assert!(kind.code() < 0);
            assert_eq!(Some(kind), AppError::from_code(kind.code()));
        }
    }

    #[test]
    fn unknown_codes_are_none() {
        assert_eq!(None, AppError::from_code(0));
        assert_eq!(None, AppError::from_code(-42));
        assert_eq!(None, AppError::from_code(7));
    }
}
