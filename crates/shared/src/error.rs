use std::fmt;

/// Reason attached to a [`ChatError::Group`] when a group state-machine guard fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupErrorCode {
    NotOwner,
    NotMember,
    AtCapacity,
    NotConnected,
    AlreadyMember,
    MissingPublicKey,
    KeyDistributionFailed,
    InvalidState,
    OwnerMustTransfer,
}

impl GroupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupErrorCode::NotOwner => "NOT_OWNER",
            GroupErrorCode::NotMember => "NOT_MEMBER",
            GroupErrorCode::AtCapacity => "AT_CAPACITY",
            GroupErrorCode::NotConnected => "NOT_CONNECTED",
            GroupErrorCode::AlreadyMember => "ALREADY_MEMBER",
            GroupErrorCode::MissingPublicKey => "MISSING_PUBLIC_KEY",
            GroupErrorCode::KeyDistributionFailed => "KEY_DISTRIBUTION_FAILED",
            GroupErrorCode::InvalidState => "INVALID_STATE",
            GroupErrorCode::OwnerMustTransfer => "OWNER_MUST_TRANSFER",
        }
    }
}

impl fmt::Display for GroupErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared by every Ciphertalk service.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("authentication required")]
    Authentication,

    #[error("validation error on {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("encryption locked: no key pair in this session")]
    EncryptionLocked,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("derived public key does not match the stored key")]
    KeyMismatch,

    #[error("group error {code}: {message}")]
    Group {
        code: GroupErrorCode,
        message: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("local storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ChatError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn group(code: GroupErrorCode, message: impl Into<String>) -> Self {
        ChatError::Group {
            code,
            message: message.into(),
        }
    }

    /// The group reason code, if this is a group guard violation.
    pub fn group_code(&self) -> Option<GroupErrorCode> {
        match self {
            ChatError::Group { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_display() {
        assert_eq!(ChatError::Authentication.to_string(), "authentication required");
    }

    #[test]
    fn validation_names_the_field() {
        let err = ChatError::validation("content", "must not be empty");
        assert_eq!(
            err.to_string(),
            "validation error on content: must not be empty"
        );
    }

    #[test]
    fn group_error_displays_reason_code() {
        let err = ChatError::group(GroupErrorCode::AtCapacity, "group is full");
        assert_eq!(err.to_string(), "group error AT_CAPACITY: group is full");
        assert_eq!(err.group_code(), Some(GroupErrorCode::AtCapacity));
    }

    #[test]
    fn group_code_is_none_for_other_variants() {
        assert_eq!(ChatError::KeyMismatch.group_code(), None);
    }

    #[test]
    fn all_variants_impl_error() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(ChatError::Authentication),
            Box::new(ChatError::validation("f", "m")),
            Box::new(ChatError::EncryptionLocked),
            Box::new(ChatError::KeyDerivation("k".into())),
            Box::new(ChatError::KeyMismatch),
            Box::new(ChatError::group(GroupErrorCode::NotOwner, "n")),
            Box::new(ChatError::Connection("c".into())),
            Box::new(ChatError::NotFound("message")),
            Box::new(ChatError::Crypto("x".into())),
            Box::new(ChatError::Storage("s".into())),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty());
        }
    }

    #[test]
    fn not_found_names_the_entity() {
        assert_eq!(
            ChatError::NotFound("conversation").to_string(),
            "conversation not found"
        );
    }
}
