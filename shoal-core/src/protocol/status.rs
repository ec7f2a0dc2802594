/// Response status word. Unlisted values are preserved in
/// [`Status::Unknown`] so the server error map can still describe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    DeltaBadValue,
    NotMyVbucket,
    NoBucket,
    Locked,
    AuthStale,
    AuthenticationError,
    AuthenticationContinue,
    RangeError,
    AccessError,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    NoCollectionsManifest,
    UnknownScope,
    DurabilityInvalidLevel,
    DurabilityImpossible,
    SyncWriteInProgress,
    SyncWriteAmbiguous,
    SyncWriteReCommitInProgress,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathInvalid,
    SubdocPathTooBig,
    SubdocDocTooDeep,
    SubdocCannotInsert,
    SubdocDocNotJson,
    SubdocNumRange,
    SubdocDeltaRange,
    SubdocPathExists,
    SubdocValueTooDeep,
    SubdocInvalidCombo,
    SubdocMultiPathFailure,
    SubdocSuccessDeleted,
    SubdocMultiPathFailureDeleted,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(val: u16) -> Self {
        match val {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArguments,
            0x05 => Status::ItemNotStored,
            0x06 => Status::DeltaBadValue,
            0x07 => Status::NotMyVbucket,
            0x08 => Status::NoBucket,
            0x09 => Status::Locked,
            0x1f => Status::AuthStale,
            0x20 => Status::AuthenticationError,
            0x21 => Status::AuthenticationContinue,
            0x22 => Status::RangeError,
            0x24 => Status::AccessError,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            0x88 => Status::UnknownCollection,
            0x89 => Status::NoCollectionsManifest,
            0x8c => Status::UnknownScope,
            0xa0 => Status::DurabilityInvalidLevel,
            0xa1 => Status::DurabilityImpossible,
            0xa2 => Status::SyncWriteInProgress,
            0xa3 => Status::SyncWriteAmbiguous,
            0xa4 => Status::SyncWriteReCommitInProgress,
            0xc0 => Status::SubdocPathNotFound,
            0xc1 => Status::SubdocPathMismatch,
            0xc2 => Status::SubdocPathInvalid,
            0xc3 => Status::SubdocPathTooBig,
            0xc4 => Status::SubdocDocTooDeep,
            0xc5 => Status::SubdocCannotInsert,
            0xc6 => Status::SubdocDocNotJson,
            0xc7 => Status::SubdocNumRange,
            0xc8 => Status::SubdocDeltaRange,
            0xc9 => Status::SubdocPathExists,
            0xca => Status::SubdocValueTooDeep,
            0xcb => Status::SubdocInvalidCombo,
            0xcc => Status::SubdocMultiPathFailure,
            0xcd => Status::SubdocSuccessDeleted,
            0xd3 => Status::SubdocMultiPathFailureDeleted,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        match status {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::ValueTooLarge => 0x03,
            Status::InvalidArguments => 0x04,
            Status::ItemNotStored => 0x05,
            Status::DeltaBadValue => 0x06,
            Status::NotMyVbucket => 0x07,
            Status::NoBucket => 0x08,
            Status::Locked => 0x09,
            Status::AuthStale => 0x1f,
            Status::AuthenticationError => 0x20,
            Status::AuthenticationContinue => 0x21,
            Status::RangeError => 0x22,
            Status::AccessError => 0x24,
            Status::UnknownCommand => 0x81,
            Status::OutOfMemory => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x84,
            Status::Busy => 0x85,
            Status::TemporaryFailure => 0x86,
            Status::UnknownCollection => 0x88,
            Status::NoCollectionsManifest => 0x89,
            Status::UnknownScope => 0x8c,
            Status::DurabilityInvalidLevel => 0xa0,
            Status::DurabilityImpossible => 0xa1,
            Status::SyncWriteInProgress => 0xa2,
            Status::SyncWriteAmbiguous => 0xa3,
            Status::SyncWriteReCommitInProgress => 0xa4,
            Status::SubdocPathNotFound => 0xc0,
            Status::SubdocPathMismatch => 0xc1,
            Status::SubdocPathInvalid => 0xc2,
            Status::SubdocPathTooBig => 0xc3,
            Status::SubdocDocTooDeep => 0xc4,
            Status::SubdocCannotInsert => 0xc5,
            Status::SubdocDocNotJson => 0xc6,
            Status::SubdocNumRange => 0xc7,
            Status::SubdocDeltaRange => 0xc8,
            Status::SubdocPathExists => 0xc9,
            Status::SubdocValueTooDeep => 0xca,
            Status::SubdocInvalidCombo => 0xcb,
            Status::SubdocMultiPathFailure => 0xcc,
            Status::SubdocSuccessDeleted => 0xcd,
            Status::SubdocMultiPathFailureDeleted => 0xd3,
            Status::Unknown(other) => other,
        }
    }
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::SubdocSuccessDeleted)
    }

    pub fn is_subdoc_path_status(self) -> bool {
        matches!(
            self,
            Status::SubdocPathNotFound
                | Status::SubdocPathMismatch
                | Status::SubdocPathInvalid
                | Status::SubdocPathTooBig
                | Status::SubdocDocTooDeep
                | Status::SubdocCannotInsert
                | Status::SubdocDocNotJson
                | Status::SubdocNumRange
                | Status::SubdocDeltaRange
                | Status::SubdocPathExists
                | Status::SubdocValueTooDeep
                | Status::SubdocInvalidCombo
        )
    }

    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            Status::AuthenticationError
                | Status::AuthenticationContinue
                | Status::AuthStale
                | Status::AccessError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn test_status_round_trip() {
        for raw in 0_u16..=0xff {
            let status = Status::from(raw);
            assert_eq!(raw, u16::from(status));
        }
    }

    #[test]
    fn test_success_variants() {
        assert!(Status::Success.is_success());
        assert!(Status::SubdocSuccessDeleted.is_success());
        assert!(!Status::KeyNotFound.is_success());
    }
}
