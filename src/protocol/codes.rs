//! PTP operation, response and event codes.
//!
//! Only the subset needed for connect, capture, live view and cleanup is
//! listed. Vendor codes (`0x9xxx`, `0xAxxx`, `0xCxxx`) are supplied at runtime
//! through [`AuthProfile`](crate::handshake::AuthProfile).

/// Operation codes (`0x1xxx`).
pub mod operation {
    /// GetDeviceInfo.
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    /// OpenSession.
    pub const OPEN_SESSION: u16 = 0x1002;
    /// CloseSession.
    pub const CLOSE_SESSION: u16 = 0x1003;
    /// GetStorageIDs.
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    /// GetStorageInfo.
    pub const GET_STORAGE_INFO: u16 = 0x1005;
    /// GetObjectInfo.
    pub const GET_OBJECT_INFO: u16 = 0x1008;
    /// InitiateCapture.
    pub const INITIATE_CAPTURE: u16 = 0x100E;
}

/// Response codes (`0x2xxx`).
pub mod response {
    /// OK.
    pub const OK: u16 = 0x2001;
    /// General_Error.
    pub const GENERAL_ERROR: u16 = 0x2002;
    /// Session_Not_Open.
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    /// Invalid_TransactionID.
    pub const INVALID_TRANSACTION_ID: u16 = 0x2004;
    /// Operation_Not_Supported.
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    /// Parameter_Not_Supported.
    pub const PARAMETER_NOT_SUPPORTED: u16 = 0x2006;
    /// Incomplete_Transfer.
    pub const INCOMPLETE_TRANSFER: u16 = 0x2007;
    /// Store_Full.
    pub const STORE_FULL: u16 = 0x200C;
    /// Access_Denied.
    pub const ACCESS_DENIED: u16 = 0x200F;
    /// Device_Busy.
    pub const DEVICE_BUSY: u16 = 0x2019;
    /// Session_Already_Open.
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;

    /// Returns a short name for logging.
    #[must_use]
    pub fn name(code: u16) -> &'static str {
        match code {
            OK => "OK",
            GENERAL_ERROR => "GeneralError",
            SESSION_NOT_OPEN => "SessionNotOpen",
            INVALID_TRANSACTION_ID => "InvalidTransactionId",
            OPERATION_NOT_SUPPORTED => "OperationNotSupported",
            PARAMETER_NOT_SUPPORTED => "ParameterNotSupported",
            INCOMPLETE_TRANSFER => "IncompleteTransfer",
            STORE_FULL => "StoreFull",
            ACCESS_DENIED => "AccessDenied",
            DEVICE_BUSY => "DeviceBusy",
            SESSION_ALREADY_OPEN => "SessionAlreadyOpen",
            0x2000..=0x2FFF => "Standard",
            _ => "Vendor",
        }
    }
}

/// Event codes (`0x4xxx`).
pub mod event {
    /// CancelTransaction.
    pub const CANCEL_TRANSACTION: u16 = 0x4001;
    /// ObjectAdded.
    pub const OBJECT_ADDED: u16 = 0x4002;
    /// ObjectRemoved.
    pub const OBJECT_REMOVED: u16 = 0x4003;
    /// StoreAdded.
    pub const STORE_ADDED: u16 = 0x4004;
    /// StoreRemoved.
    pub const STORE_REMOVED: u16 = 0x4005;
    /// DevicePropChanged.
    pub const DEVICE_PROP_CHANGED: u16 = 0x4006;
    /// ObjectInfoChanged.
    pub const OBJECT_INFO_CHANGED: u16 = 0x4007;
    /// DeviceInfoChanged.
    pub const DEVICE_INFO_CHANGED: u16 = 0x4008;
    /// StoreFull.
    pub const STORE_FULL: u16 = 0x400A;
    /// DeviceReset.
    pub const DEVICE_RESET: u16 = 0x400B;
    /// StorageInfoChanged.
    pub const STORAGE_INFO_CHANGED: u16 = 0x400C;
    /// CaptureComplete.
    pub const CAPTURE_COMPLETE: u16 = 0x400D;
    /// UnreportedStatus.
    pub const UNREPORTED_STATUS: u16 = 0x400E;
}
